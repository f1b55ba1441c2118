//! Mock tunnel target for E2E tests
//!
//! The final destination behind an upstream proxy. It records each
//! connection's payload and either echoes it or greets first.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Behavior of the mock target
#[derive(Clone, Debug)]
pub enum TargetMode {
    /// Echo back all received data
    Echo,
    /// Send a banner as soon as the connection opens, then echo
    Banner(Vec<u8>),
}

/// A mock target service
pub struct MockTarget {
    addr: SocketAddr,
    /// Payload received on each finished connection
    received: Arc<RwLock<Vec<Vec<u8>>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl MockTarget {
    /// Start an echo target on an ephemeral port
    pub async fn start() -> Self {
        Self::start_with_mode(TargetMode::Echo).await
    }

    pub async fn start_with_mode(mode: TargetMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock target");
        let addr = listener.local_addr().unwrap();

        let received: Arc<RwLock<Vec<Vec<u8>>>> = Arc::new(RwLock::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let received_clone = received.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Mock target shutting down");
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let received = received_clone.clone();
                                let mode = mode.clone();
                                tokio::spawn(async move {
                                    handle_connection(stream, mode, received).await;
                                });
                            }
                            Err(e) => {
                                tracing::error!("Mock target accept error: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            addr,
            received,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` suitable as a CONNECT target
    pub fn target(&self) -> String {
        self.addr.to_string()
    }

    /// Number of connections that have finished
    pub fn connection_count(&self) -> usize {
        self.received.read().len()
    }

    /// Payloads of finished connections, in completion order
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.read().clone()
    }
}

impl Drop for MockTarget {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    mode: TargetMode,
    received: Arc<RwLock<Vec<Vec<u8>>>>,
) {
    if let TargetMode::Banner(banner) = &mode {
        if let Err(e) = stream.write_all(banner).await {
            tracing::error!("Banner write error: {}", e);
            return;
        }
    }

    let mut payload = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                payload.extend_from_slice(&buf[..n]);
                if let Err(e) = stream.write_all(&buf[..n]).await {
                    tracing::error!("Echo write error: {}", e);
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Mock target read error: {}", e);
                break;
            }
        }
    }

    received.write().push(payload);
}
