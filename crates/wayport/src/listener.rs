//! Inbound CONNECT listener
//!
//! Accepts HTTP/1 `CONNECT host:port` requests from clients, opens a tunnel
//! through the gateway and splices the upgraded client connection with it.
//! The tunnel is established before the client gets its answer, so a failed
//! upstream shows up as `502 Bad Gateway` rather than a dropped connection.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ALLOW};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};

use crate::gateway::Gateway;
use crate::handshake::BoxedStream;

/// Client-facing HTTP proxy front end
pub struct ConnectListener {
    gateway: Gateway,
    /// Request header carrying the session key
    sticky_header: String,
}

impl ConnectListener {
    pub fn new(gateway: Gateway, sticky_header: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            sticky_header: sticky_header.into(),
        })
    }

    /// Bind `addr` and serve until the accept loop fails
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("Proxy listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            tracing::debug!("Client connection from {}", peer_addr);
            let this = self.clone();

            tokio::spawn(async move {
                this.serve_connection(stream, peer_addr).await;
            });
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let this = self.clone();
            async move { this.handle_request(req, peer_addr).await }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            tracing::debug!("Client connection error from {}: {}", peer_addr, e);
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        if req.method() != Method::CONNECT {
            tracing::debug!("Rejecting {} {} from {}", req.method(), req.uri(), peer_addr);
            let mut response = text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "Only CONNECT is supported".to_string(),
            );
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("CONNECT"));
            return Ok(response);
        }

        let target = match req.uri().authority() {
            Some(authority) => authority.to_string(),
            None => {
                tracing::warn!("CONNECT without target from {}", peer_addr);
                return Ok(text_response(
                    StatusCode::BAD_REQUEST,
                    "CONNECT target must be host:port".to_string(),
                ));
            }
        };

        let session_key = req
            .headers()
            .get(self.sticky_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default()
            .to_string();

        tracing::debug!(
            "CONNECT {} from {} (session: {:?})",
            target,
            peer_addr,
            session_key
        );

        let upstream = match self.gateway.establish_tunnel(&session_key, &target).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Tunnel to {} failed: {}", target, e);
                return Ok(text_response(StatusCode::BAD_GATEWAY, e.to_string()));
            }
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => splice(upgraded, upstream, &target).await,
                Err(e) => tracing::warn!("Upgrade failed for {}: {}", target, e),
            }
        });

        Ok(Response::new(Full::new(Bytes::new())))
    }
}

/// Copy bytes both ways until either side closes
async fn splice(upgraded: hyper::upgrade::Upgraded, mut upstream: BoxedStream, target: &str) {
    let mut client = TokioIo::new(upgraded);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            tracing::debug!(
                "Tunnel to {} closed ({} bytes sent, {} bytes received)",
                target,
                sent,
                received
            );
        }
        Err(e) => {
            tracing::debug!("Tunnel to {} ended with error: {}", target, e);
        }
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}
