//! CONNECT test client for E2E tests
//!
//! Speaks to the gateway the way a browser or curl would: one `CONNECT`
//! request, one response head, then raw bytes.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::harness::STICKY_HEADER;

/// Gateway answer to a CONNECT request
pub struct ConnectResponse {
    pub status: u16,
    /// Body of a non-200 answer
    pub body: String,
    /// The tunnel, positioned after the response head
    pub stream: BufReader<TcpStream>,
}

impl ConnectResponse {
    pub fn is_established(&self) -> bool {
        self.status == 200
    }
}

pub struct ConnectClient;

impl ConnectClient {
    /// Send `CONNECT target` to the gateway, with an optional session key
    pub async fn open(
        gateway: SocketAddr,
        target: &str,
        session_key: Option<&str>,
    ) -> Result<ConnectResponse> {
        let stream = TcpStream::connect(gateway).await?;
        let mut reader = BufReader::new(stream);

        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
        if let Some(key) = session_key {
            request.push_str(&format!("{}: {}\r\n", STICKY_HEADER, key));
        }
        request.push_str("\r\n");
        reader.get_mut().write_all(request.as_bytes()).await?;

        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            if reader.read_until(b'\n', &mut head).await? == 0 {
                anyhow::bail!("Gateway closed connection before responding");
            }
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&head)? {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => anyhow::bail!("Incomplete response head"),
        }
        let status = response
            .code
            .ok_or_else(|| anyhow::anyhow!("Response without status code"))?;
        let content_length = response
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("content-length"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let mut body = String::new();
        if status != 200 && content_length > 0 {
            let mut buf = vec![0u8; content_length];
            reader.read_exact(&mut buf).await?;
            body = String::from_utf8_lossy(&buf).into_owned();
        }

        tracing::debug!("CONNECT {} answered with {}", target, status);

        Ok(ConnectResponse {
            status,
            body,
            stream: reader,
        })
    }
}
