//! Mock upstream proxies for E2E tests
//!
//! [`MockHttpProxy`] answers `CONNECT` requests and [`MockSocksProxy`] speaks
//! the server side of SOCKS5. Both dial the requested target for real and
//! splice bytes, and both record what they were asked for.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// How the mock HTTP proxy answers CONNECT
#[derive(Clone, Debug)]
pub enum ProxyMode {
    /// Dial the target and answer `200`
    Tunnel,
    /// Answer with a fixed status and body, then close
    Refuse { status: u16, body: String },
    /// Require this exact `Proxy-Authorization` value, `407` otherwise
    RequireAuth { authorization: String },
}

/// One CONNECT request seen by a mock upstream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedConnect {
    pub target: String,
    /// `Proxy-Authorization` for HTTP, `user` for SOCKS5
    pub auth: Option<String>,
}

type Recorded = Arc<RwLock<Vec<RecordedConnect>>>;

/// Accept loop shared by both mocks
fn spawn_accept_loop<F, Fut>(listener: TcpListener, handler: F) -> mpsc::Sender<()>
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::debug!("Mock upstream shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            tokio::spawn(handler(stream));
                        }
                        Err(e) => {
                            tracing::error!("Mock upstream accept error: {}", e);
                            break;
                        }
                    }
                }
            }
        }
    });
    shutdown_tx
}

/// A mock HTTP CONNECT proxy
pub struct MockHttpProxy {
    addr: SocketAddr,
    recorded: Recorded,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl MockHttpProxy {
    pub async fn start() -> Self {
        Self::start_with_mode(ProxyMode::Tunnel).await
    }

    pub async fn start_with_mode(mode: ProxyMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock HTTP proxy");
        let addr = listener.local_addr().unwrap();
        let recorded: Recorded = Arc::new(RwLock::new(Vec::new()));

        let recorded_clone = recorded.clone();
        let shutdown_tx = spawn_accept_loop(listener, move |stream| {
            handle_http_connect(stream, mode.clone(), recorded_clone.clone())
        });

        Self {
            addr,
            recorded,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// CONNECT requests received so far
    pub fn requests(&self) -> Vec<RecordedConnect> {
        self.recorded.read().clone()
    }

    pub fn request_count(&self) -> usize {
        self.recorded.read().len()
    }
}

impl Drop for MockHttpProxy {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

async fn handle_http_connect(stream: TcpStream, mode: ProxyMode, recorded: Recorded) {
    let mut reader = BufReader::new(stream);

    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        match reader.read_until(b'\n', &mut head).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    if !matches!(request.parse(&head), Ok(httparse::Status::Complete(_))) {
        let _ = reader
            .get_mut()
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
            .await;
        return;
    }

    let target = request.path.unwrap_or_default().to_string();
    let auth = request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("proxy-authorization"))
        .map(|h| String::from_utf8_lossy(h.value).into_owned());

    recorded.write().push(RecordedConnect {
        target: target.clone(),
        auth: auth.clone(),
    });

    let refusal = match &mode {
        ProxyMode::Tunnel => None,
        ProxyMode::Refuse { status, body } => Some((*status, body.clone())),
        ProxyMode::RequireAuth { authorization } => {
            if auth.as_deref() == Some(authorization.as_str()) {
                None
            } else {
                Some((407, "proxy authentication required".to_string()))
            }
        }
    };

    if let Some((status, body)) = refusal {
        let response = format!(
            "HTTP/1.1 {} Refused\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let _ = reader.get_mut().write_all(response.as_bytes()).await;
        let _ = reader.get_mut().shutdown().await;
        return;
    }

    let mut upstream = match TcpStream::connect(&target).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!("Mock proxy could not reach {}: {}", target, e);
            let _ = reader
                .get_mut()
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                .await;
            return;
        }
    };

    if reader
        .get_mut()
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .is_err()
    {
        return;
    }

    let _ = tokio::io::copy_bidirectional(&mut reader, &mut upstream).await;
}

/// A mock SOCKS5 proxy, optionally requiring username/password
pub struct MockSocksProxy {
    addr: SocketAddr,
    recorded: Recorded,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl MockSocksProxy {
    /// Proxy accepting no-auth clients
    pub async fn start() -> Self {
        Self::start_with_auth(None).await
    }

    /// Proxy requiring the given username and password
    pub async fn start_with_auth(auth: Option<(String, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock SOCKS5 proxy");
        let addr = listener.local_addr().unwrap();
        let recorded: Recorded = Arc::new(RwLock::new(Vec::new()));

        let recorded_clone = recorded.clone();
        let shutdown_tx = spawn_accept_loop(listener, move |stream| {
            let recorded = recorded_clone.clone();
            let auth = auth.clone();
            async move {
                if let Err(e) = handle_socks(stream, auth, recorded).await {
                    tracing::debug!("Mock SOCKS5 session ended: {}", e);
                }
            }
        });

        Self {
            addr,
            recorded,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn requests(&self) -> Vec<RecordedConnect> {
        self.recorded.read().clone()
    }
}

impl Drop for MockSocksProxy {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

async fn handle_socks(
    mut stream: TcpStream,
    auth: Option<(String, String)>,
    recorded: Recorded,
) -> anyhow::Result<()> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    anyhow::ensure!(header[0] == 0x05, "not a SOCKS5 client");
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    let user = match &auth {
        Some((username, password)) => {
            if !methods.contains(&0x02) {
                stream.write_all(&[0x05, 0xff]).await?;
                anyhow::bail!("client did not offer username/password");
            }
            stream.write_all(&[0x05, 0x02]).await?;

            let mut ver_ulen = [0u8; 2];
            stream.read_exact(&mut ver_ulen).await?;
            let mut uname = vec![0u8; ver_ulen[1] as usize];
            stream.read_exact(&mut uname).await?;
            let mut plen = [0u8; 1];
            stream.read_exact(&mut plen).await?;
            let mut passwd = vec![0u8; plen[0] as usize];
            stream.read_exact(&mut passwd).await?;

            if uname != username.as_bytes() || passwd != password.as_bytes() {
                stream.write_all(&[0x01, 0x01]).await?;
                anyhow::bail!("bad credentials");
            }
            stream.write_all(&[0x01, 0x00]).await?;
            Some(username.clone())
        }
        None => {
            stream.write_all(&[0x05, 0x00]).await?;
            None
        }
    };

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    anyhow::ensure!(request[1] == 0x01, "only CONNECT is supported");

    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8_lossy(&domain).into_owned()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            format!("[{}]", std::net::Ipv6Addr::from(ip))
        }
        other => anyhow::bail!("unknown address type {}", other),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let target = format!("{}:{}", host, u16::from_be_bytes(port));

    recorded.write().push(RecordedConnect {
        target: target.clone(),
        auth: user,
    });

    let mut upstream = match TcpStream::connect(&target).await {
        Ok(s) => s,
        Err(e) => {
            // connection refused
            stream
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Err(e.into());
        }
    };

    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
    Ok(())
}
