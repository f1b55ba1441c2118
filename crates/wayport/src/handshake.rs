//! Tunnel handshakes against a single upstream
//!
//! HTTP and HTTPS upstreams are asked for a tunnel with `CONNECT`; SOCKS5
//! upstreams get a standard client handshake. Either way the result is a raw
//! byte stream to the target. Nothing here retries: a failed handshake is
//! reported to the caller, which decides whether to try another upstream.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use crate::endpoint::{Credentials, Endpoint, Protocol};
use crate::error::HandshakeError;

/// Upper bound on the diagnostic body kept from a refused CONNECT
pub const ERROR_BODY_LIMIT: u64 = 500;

const MAX_RESPONSE_HEAD: usize = 16 * 1024;
const MAX_RESPONSE_HEADERS: usize = 64;
const MAX_CHUNK_LINE: u64 = 1024;

/// Any bidirectional byte stream usable as a tunnel
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn TunnelIo>;

/// Opens raw transport connections to upstreams
///
/// The default is a direct TCP connect; tests substitute scripted streams.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &str) -> io::Result<BoxedStream>;
}

/// Direct TCP connections
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Performs the protocol-specific handshake for an endpoint
#[derive(Clone)]
pub struct Handshaker {
    connector: Arc<dyn Connector>,
}

impl Handshaker {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Handshaker that dials upstreams over plain TCP
    pub fn direct() -> Self {
        Self::new(Arc::new(TcpConnector))
    }

    /// Open a tunnel to `target` (`host:port`) through `endpoint`
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        target: &str,
    ) -> Result<BoxedStream, HandshakeError> {
        match endpoint.protocol() {
            Protocol::Http | Protocol::Https => self.connect_http(endpoint, target).await,
            Protocol::Socks5 => self.connect_socks5(endpoint, target).await,
        }
    }

    async fn connect_http(
        &self,
        endpoint: &Endpoint,
        target: &str,
    ) -> Result<BoxedStream, HandshakeError> {
        let addr = endpoint.dial_address();
        tracing::debug!("Dialing {} for CONNECT {}", addr, target);

        let stream = self.connector.connect(&addr).await?;
        let mut reader = BufReader::new(stream);

        match negotiate_connect(&mut reader, endpoint.credentials(), target).await {
            // Anything the upstream sent past the response head stays buffered
            Ok(()) => Ok(Box::new(reader)),
            Err(e) => {
                if let Err(close_err) = reader.shutdown().await {
                    tracing::debug!("Closing {} after failed CONNECT: {}", addr, close_err);
                }
                Err(e)
            }
        }
    }

    async fn connect_socks5(
        &self,
        endpoint: &Endpoint,
        target: &str,
    ) -> Result<BoxedStream, HandshakeError> {
        let addr = endpoint.dial_address();
        tracing::debug!("Dialing {} for SOCKS5 CONNECT {}", addr, target);

        let stream = self.connector.connect(&addr).await?;

        let negotiated = match endpoint.credentials() {
            Some(creds) => {
                Socks5Stream::connect_with_password_and_socket(
                    stream,
                    target,
                    &creds.username,
                    &creds.password,
                )
                .await
            }
            None => Socks5Stream::connect_with_socket(stream, target).await,
        };

        match negotiated {
            Ok(socks) => Ok(Box::new(socks)),
            Err(tokio_socks::Error::Io(e)) => Err(HandshakeError::Dial(e)),
            Err(e) => Err(HandshakeError::Socks(e.to_string())),
        }
    }
}

/// Status line and the headers we care about
struct ResponseHead {
    status: u16,
    content_length: Option<u64>,
    chunked: bool,
}

impl ResponseHead {
    /// Responses that never carry a body, whatever their headers say
    fn is_bodiless(&self) -> bool {
        (100..200).contains(&self.status) || self.status == 204 || self.status == 304
    }
}

async fn negotiate_connect(
    reader: &mut BufReader<BoxedStream>,
    credentials: Option<&Credentials>,
    target: &str,
) -> Result<(), HandshakeError> {
    let request = connect_request(target, credentials);
    let upstream = reader.get_mut();
    upstream.write_all(request.as_bytes()).await?;
    upstream.flush().await?;

    let head = read_response_head(reader).await?;
    if head.status == 200 {
        return Ok(());
    }

    let body = read_error_body(reader, &head).await?;

    Err(HandshakeError::ProxyRefused {
        status: head.status,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn connect_request(target: &str, credentials: Option<&Credentials>) -> String {
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some(header) = credentials.and_then(Credentials::basic_header) {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", header));
    }
    request.push_str("\r\n");
    request
}

/// Read up to and including the blank line ending the response head
async fn read_response_head(
    reader: &mut BufReader<BoxedStream>,
) -> Result<ResponseHead, HandshakeError> {
    let mut raw = Vec::with_capacity(512);
    loop {
        // One past the cap so an oversized head is detected, not truncated
        let remaining = (MAX_RESPONSE_HEAD + 1 - raw.len()) as u64;
        let n = (&mut *reader)
            .take(remaining)
            .read_until(b'\n', &mut raw)
            .await?;
        if n == 0 {
            return Err(HandshakeError::Dial(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed connection during CONNECT",
            )));
        }
        if raw.ends_with(b"\r\n\r\n") || raw.ends_with(b"\n\n") {
            break;
        }
        if raw.len() > MAX_RESPONSE_HEAD {
            return Err(HandshakeError::MalformedResponse(
                "response head too large".to_string(),
            ));
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(HandshakeError::MalformedResponse(
                "incomplete response head".to_string(),
            ))
        }
        Err(e) => return Err(HandshakeError::MalformedResponse(e.to_string())),
    }

    let status = response
        .code
        .ok_or_else(|| HandshakeError::MalformedResponse("missing status code".to_string()))?;

    let content_length = header_value(response.headers, "content-length")
        .and_then(|v| v.trim().parse::<u64>().ok());

    // The final transfer coding decides the framing
    let chunked = header_value(response.headers, "transfer-encoding")
        .and_then(|v| v.rsplit(',').next())
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));

    Ok(ResponseHead {
        status,
        content_length,
        chunked,
    })
}

fn header_value<'a>(headers: &[httparse::Header<'a>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
}

/// Read at most [`ERROR_BODY_LIMIT`] bytes of a refusal body, honoring its
/// framing so a kept-alive connection is never read to EOF
async fn read_error_body(
    reader: &mut BufReader<BoxedStream>,
    head: &ResponseHead,
) -> Result<Vec<u8>, HandshakeError> {
    let mut body = Vec::new();
    if head.is_bodiless() {
        return Ok(body);
    }

    if head.chunked {
        read_chunked(reader, &mut body).await?;
        return Ok(body);
    }

    let limit = head
        .content_length
        .map_or(ERROR_BODY_LIMIT, |len| len.min(ERROR_BODY_LIMIT));
    (&mut *reader).take(limit).read_to_end(&mut body).await?;
    Ok(body)
}

/// Decode chunks until the terminating zero-size chunk or the body cap
async fn read_chunked(
    reader: &mut BufReader<BoxedStream>,
    body: &mut Vec<u8>,
) -> Result<(), HandshakeError> {
    loop {
        let mut line = Vec::new();
        (&mut *reader)
            .take(MAX_CHUNK_LINE)
            .read_until(b'\n', &mut line)
            .await?;
        if !line.ends_with(b"\n") {
            return Err(HandshakeError::MalformedResponse(
                "truncated chunk size line".to_string(),
            ));
        }

        let size = std::str::from_utf8(&line)
            .ok()
            .and_then(|l| l.split(';').next())
            .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
            .ok_or_else(|| HandshakeError::MalformedResponse("invalid chunk size".to_string()))?;
        if size == 0 {
            return Ok(());
        }

        let room = ERROR_BODY_LIMIT - body.len() as u64;
        let wanted = size.min(room);
        let before = body.len();
        (&mut *reader).take(wanted).read_to_end(body).await?;
        if ((body.len() - before) as u64) < wanted {
            return Err(HandshakeError::Dial(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed connection inside a chunk",
            )));
        }
        if body.len() as u64 >= ERROR_BODY_LIMIT {
            return Ok(());
        }

        let mut crlf = Vec::with_capacity(2);
        (&mut *reader)
            .take(MAX_CHUNK_LINE)
            .read_until(b'\n', &mut crlf)
            .await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    use parking_lot::Mutex;
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    /// Hands out one pre-made stream and records dialed addresses
    struct OneShotConnector {
        stream: Mutex<Option<BoxedStream>>,
        dialed: Mutex<Vec<String>>,
    }

    impl OneShotConnector {
        fn new(stream: BoxedStream) -> Arc<Self> {
            Arc::new(Self {
                stream: Mutex::new(Some(stream)),
                dialed: Mutex::new(Vec::new()),
            })
        }

        fn refusing() -> Arc<Self> {
            Arc::new(Self {
                stream: Mutex::new(None),
                dialed: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Connector for OneShotConnector {
        async fn connect(&self, addr: &str) -> io::Result<BoxedStream> {
            self.dialed.lock().push(addr.to_string());
            self.stream
                .lock()
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    /// Stream wrapper counting shutdown calls
    struct CountingStream {
        inner: DuplexStream,
        shutdowns: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for CountingStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<io::Result<()>> {
            let res = Pin::new(&mut self.inner).poll_shutdown(cx);
            if res.is_ready() {
                self.shutdowns.fetch_add(1, Ordering::SeqCst);
            }
            res
        }
    }

    /// Read a request head from the fake upstream side
    async fn read_request(server: &mut DuplexStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            let n = server.read(&mut byte).await.unwrap();
            assert!(n > 0, "client closed before finishing request");
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    fn http_endpoint(addr: &str, creds: Option<Credentials>) -> Endpoint {
        Endpoint::new(Protocol::Http, addr, creds)
    }

    #[tokio::test]
    async fn test_connect_success_with_auth() {
        let (client, mut server) = duplex(4096);
        let connector = OneShotConnector::new(Box::new(client));
        let handshaker = Handshaker::new(connector.clone());

        let upstream = tokio::spawn(async move {
            let request = read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();

            let mut buf = [0u8; 4];
            server.read_exact(&mut buf).await.unwrap();
            server.write_all(b"pong").await.unwrap();
            (request, buf)
        });

        let endpoint = http_endpoint("10.0.0.1:3128", Some(Credentials::new("alice", "secret")));
        let mut tunnel = handshaker
            .connect(&endpoint, "example.com:443")
            .await
            .expect("handshake should succeed");

        tunnel.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        tunnel.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        let (request, received) = upstream.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com:443\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n"));
        assert_eq!(&received, b"ping");
        assert_eq!(connector.dialed.lock().as_slice(), ["10.0.0.1:3128"]);
    }

    #[tokio::test]
    async fn test_connect_without_credentials_omits_header() {
        let (client, mut server) = duplex(4096);
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(client)));

        let upstream = tokio::spawn(async move {
            let request = read_request(&mut server).await;
            server.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            request
        });

        let endpoint = http_endpoint("10.0.0.1:3128", Some(Credentials::new("", "x")));
        handshaker.connect(&endpoint, "example.com:443").await.unwrap();

        let request = upstream.await.unwrap();
        assert!(!request.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn test_bytes_after_response_head_are_kept() {
        let (client, mut server) = duplex(4096);
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(client)));

        tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 200 OK\r\n\r\nhello from target")
                .await
                .unwrap();
            // keep the stream open until the client is done
            let mut sink = Vec::new();
            let _ = server.read_to_end(&mut sink).await;
        });

        let endpoint = http_endpoint("10.0.0.1:3128", None);
        let mut tunnel = handshaker.connect(&endpoint, "t:1").await.unwrap();

        let mut buf = vec![0u8; "hello from target".len()];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello from target");
    }

    #[tokio::test]
    async fn test_refused_connect_reports_body_and_closes_once() {
        let (client, mut server) = duplex(4096);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let counting = CountingStream {
            inner: client,
            shutdowns: shutdowns.clone(),
        };
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(counting)));

        let upstream = tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 11\r\n\r\nbad gateway")
                .await
                .unwrap();
            // EOF once the gateway closes its side
            let mut rest = Vec::new();
            server.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let endpoint = http_endpoint("10.0.0.1:3128", None);
        let err = match handshaker.connect(&endpoint, "example.com:443").await {
            Err(e) => e,
            Ok(_) => panic!("expected refusal"),
        };

        match &err {
            HandshakeError::ProxyRefused { status, body } => {
                assert_eq!(*status, 502);
                assert_eq!(body, "bad gateway");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("bad gateway"));
        assert!(err.is_protocol());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(upstream.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refused_body_is_truncated() {
        let (client, mut server) = duplex(8192);
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(client)));

        tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
            server.write_all(&[b'x'; 2000]).await.unwrap();
        });

        let endpoint = http_endpoint("10.0.0.1:3128", None);
        match handshaker.connect(&endpoint, "example.com:443").await {
            Err(HandshakeError::ProxyRefused { status, body }) => {
                assert_eq!(status, 407);
                assert_eq!(body.len(), ERROR_BODY_LIMIT as usize);
            }
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("expected refusal"),
        }
    }

    /// Upstream that sends `response` and then holds the connection open
    fn keep_alive_upstream(mut server: DuplexStream, response: &'static [u8]) {
        tokio::spawn(async move {
            read_request(&mut server).await;
            server.write_all(response).await.unwrap();
            let mut rest = Vec::new();
            let _ = server.read_to_end(&mut rest).await;
        });
    }

    async fn refusal(handshaker: &Handshaker) -> (u16, String) {
        let endpoint = http_endpoint("10.0.0.1:3128", None);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            handshaker.connect(&endpoint, "example.com:443"),
        )
        .await
        .expect("handshake did not finish on a kept-alive connection");

        match result {
            Err(HandshakeError::ProxyRefused { status, body }) => (status, body),
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("expected refusal"),
        }
    }

    #[tokio::test]
    async fn test_chunked_refusal_on_kept_alive_connection() {
        let (client, server) = duplex(4096);
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(client)));
        keep_alive_upstream(
            server,
            b"HTTP/1.1 407 Proxy Authentication Required\r\nTransfer-Encoding: chunked\r\nConnection: keep-alive\r\n\r\nb\r\nbad gateway\r\n0\r\n\r\n",
        );

        let (status, body) = refusal(&handshaker).await;
        assert_eq!(status, 407);
        assert_eq!(body, "bad gateway");
    }

    #[tokio::test]
    async fn test_chunked_refusal_joins_chunks() {
        let (client, server) = duplex(4096);
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(client)));
        keep_alive_upstream(
            server,
            b"HTTP/1.1 502 Bad Gateway\r\nTransfer-Encoding: gzip, Chunked\r\n\r\n4;ext=1\r\nbad \r\n7\r\ngateway\r\n0\r\n\r\n",
        );

        let (status, body) = refusal(&handshaker).await;
        assert_eq!(status, 502);
        assert_eq!(body, "bad gateway");
    }

    #[tokio::test]
    async fn test_chunked_refusal_is_capped() {
        let (client, mut server) = duplex(8192);
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(client)));
        tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nTransfer-Encoding: chunked\r\n\r\n")
                .await
                .unwrap();
            // Chunks keep coming; the reader has to stop at the cap
            for _ in 0..10 {
                server.write_all(b"100\r\n").await.unwrap();
                server.write_all(&[b'y'; 0x100]).await.unwrap();
                server.write_all(b"\r\n").await.unwrap();
            }
            let mut rest = Vec::new();
            let _ = server.read_to_end(&mut rest).await;
        });

        let (_, body) = refusal(&handshaker).await;
        assert_eq!(body.len(), ERROR_BODY_LIMIT as usize);
    }

    #[tokio::test]
    async fn test_bodiless_refusal_on_kept_alive_connection() {
        let (client, server) = duplex(4096);
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(client)));
        keep_alive_upstream(server, b"HTTP/1.1 204 No Content\r\n\r\n");

        let (status, body) = refusal(&handshaker).await;
        assert_eq!(status, 204);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_chunk_size_is_malformed() {
        let (client, server) = duplex(4096);
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(client)));
        keep_alive_upstream(
            server,
            b"HTTP/1.1 502 Bad Gateway\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
        );

        let endpoint = http_endpoint("10.0.0.1:3128", None);
        assert!(matches!(
            handshaker.connect(&endpoint, "example.com:443").await,
            Err(HandshakeError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_head_line_is_rejected() {
        let (client, mut server) = duplex(4096);
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(client)));
        tokio::spawn(async move {
            read_request(&mut server).await;
            // No newline ever arrives
            let junk = vec![b'a'; 1024];
            loop {
                if server.write_all(&junk).await.is_err() {
                    break;
                }
            }
        });

        let endpoint = http_endpoint("10.0.0.1:3128", None);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            handshaker.connect(&endpoint, "example.com:443"),
        )
        .await
        .expect("head read was not bounded");
        match result {
            Err(HandshakeError::MalformedResponse(msg)) => assert!(msg.contains("too large")),
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let handshaker = Handshaker::new(OneShotConnector::refusing());
        let endpoint = http_endpoint("10.0.0.1:3128", None);

        match handshaker.connect(&endpoint, "example.com:443").await {
            Err(HandshakeError::Dial(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused),
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("expected dial failure"),
        }
    }

    #[tokio::test]
    async fn test_https_endpoint_defaults_to_443() {
        let connector = OneShotConnector::refusing();
        let handshaker = Handshaker::new(connector.clone());

        let endpoint = Endpoint::new(Protocol::Https, "proxy.example.com", None);
        let _ = handshaker.connect(&endpoint, "example.com:443").await;

        let http = Endpoint::new(Protocol::Http, "proxy.example.com", None);
        let _ = handshaker.connect(&http, "example.com:443").await;

        assert_eq!(
            connector.dialed.lock().as_slice(),
            ["proxy.example.com:443", "proxy.example.com:80"]
        );
    }

    #[tokio::test]
    async fn test_eof_before_response_is_dial_error() {
        let (client, mut server) = duplex(4096);
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(client)));

        tokio::spawn(async move {
            read_request(&mut server).await;
            drop(server);
        });

        let endpoint = http_endpoint("10.0.0.1:3128", None);
        match handshaker.connect(&endpoint, "example.com:443").await {
            Err(HandshakeError::Dial(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_garbage_response_is_malformed() {
        let (client, mut server) = duplex(4096);
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(client)));

        tokio::spawn(async move {
            read_request(&mut server).await;
            server.write_all(b"SSH-2.0-OpenSSH\r\n\r\n").await.unwrap();
        });

        let endpoint = http_endpoint("10.0.0.1:3128", None);
        assert!(matches!(
            handshaker.connect(&endpoint, "example.com:443").await,
            Err(HandshakeError::MalformedResponse(_))
        ));
    }

    /// Minimal SOCKS5 server side: optional user/pass, fixed reply code
    async fn socks_upstream(
        mut server: DuplexStream,
        expect_auth: Option<(&'static str, &'static str)>,
        reply: u8,
    ) -> (Vec<u8>, String) {
        let mut header = [0u8; 2];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x05);
        let mut methods = vec![0u8; header[1] as usize];
        server.read_exact(&mut methods).await.unwrap();

        match expect_auth {
            Some((user, pass)) => {
                assert!(methods.contains(&0x02));
                server.write_all(&[0x05, 0x02]).await.unwrap();

                let mut ver_ulen = [0u8; 2];
                server.read_exact(&mut ver_ulen).await.unwrap();
                let mut uname = vec![0u8; ver_ulen[1] as usize];
                server.read_exact(&mut uname).await.unwrap();
                let mut plen = [0u8; 1];
                server.read_exact(&mut plen).await.unwrap();
                let mut passwd = vec![0u8; plen[0] as usize];
                server.read_exact(&mut passwd).await.unwrap();
                assert_eq!(uname, user.as_bytes());
                assert_eq!(passwd, pass.as_bytes());
                server.write_all(&[0x01, 0x00]).await.unwrap();
            }
            None => {
                assert!(methods.contains(&0x00));
                server.write_all(&[0x05, 0x00]).await.unwrap();
            }
        }

        let mut request = [0u8; 4];
        server.read_exact(&mut request).await.unwrap();
        assert_eq!(request[3], 0x03, "expected a domain target");
        let mut len = [0u8; 1];
        server.read_exact(&mut len).await.unwrap();
        let mut domain = vec![0u8; len[0] as usize];
        server.read_exact(&mut domain).await.unwrap();
        let mut port = [0u8; 2];
        server.read_exact(&mut port).await.unwrap();

        server
            .write_all(&[0x05, reply, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let mut payload = Vec::new();
        if reply == 0x00 {
            let mut buf = [0u8; 4];
            server.read_exact(&mut buf).await.unwrap();
            payload.extend_from_slice(&buf);
        }
        let target = format!(
            "{}:{}",
            String::from_utf8(domain).unwrap(),
            u16::from_be_bytes(port)
        );
        (payload, target)
    }

    #[tokio::test]
    async fn test_socks5_no_auth() {
        let (client, server) = duplex(4096);
        let connector = OneShotConnector::new(Box::new(client));
        let handshaker = Handshaker::new(connector.clone());
        let upstream = tokio::spawn(socks_upstream(server, None, 0x00));

        let endpoint = Endpoint::new(Protocol::Socks5, "10.0.0.5:1080", None);
        let mut tunnel = handshaker.connect(&endpoint, "example.com:443").await.unwrap();
        tunnel.write_all(b"data").await.unwrap();

        let (payload, target) = upstream.await.unwrap();
        assert_eq!(payload, b"data");
        assert_eq!(target, "example.com:443");
        assert_eq!(connector.dialed.lock().as_slice(), ["10.0.0.5:1080"]);
    }

    #[tokio::test]
    async fn test_socks5_with_password() {
        let (client, server) = duplex(4096);
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(client)));
        let upstream = tokio::spawn(socks_upstream(server, Some(("bob", "hunter2")), 0x00));

        let endpoint = Endpoint::new(
            Protocol::Socks5,
            "10.0.0.5:1080",
            Some(Credentials::new("bob", "hunter2")),
        );
        let mut tunnel = handshaker.connect(&endpoint, "example.com:443").await.unwrap();
        tunnel.write_all(b"data").await.unwrap();

        let (payload, _) = upstream.await.unwrap();
        assert_eq!(payload, b"data");
    }

    #[tokio::test]
    async fn test_socks5_rejected_reply() {
        let (client, server) = duplex(4096);
        let handshaker = Handshaker::new(OneShotConnector::new(Box::new(client)));
        tokio::spawn(socks_upstream(server, None, 0x05));

        let endpoint = Endpoint::new(Protocol::Socks5, "10.0.0.5:1080", None);
        match handshaker.connect(&endpoint, "example.com:443").await {
            Err(HandshakeError::Socks(_)) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("expected rejection"),
        }
    }
}
