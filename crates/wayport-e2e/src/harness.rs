//! Gateway harness for E2E tests
//!
//! Starts a complete gateway (pool, direct TCP handshaker, CONNECT listener)
//! on an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use wayport::{ConnectListener, Endpoint, Gateway, Handshaker, Pool, Registry};

/// Session header used by the harness
pub const STICKY_HEADER: &str = "X-Proxy-Session";

/// A running gateway instance
pub struct TestGateway {
    /// Client-facing listener address
    pub addr: SocketAddr,
    /// Shared pool, for binding assertions
    pub pool: Arc<Pool>,
    /// Shutdown signal sender
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestGateway {
    /// Start a gateway over the given upstreams
    pub async fn start(endpoints: Vec<Endpoint>) -> Self {
        let registry = Registry::new(endpoints).expect("Test gateway needs upstreams");
        Self::start_with_pool(Pool::new(registry)).await
    }

    /// Start a gateway with a deterministic selection seed
    pub async fn start_with_seed(endpoints: Vec<Endpoint>, seed: u64) -> Self {
        let registry = Registry::new(endpoints).expect("Test gateway needs upstreams");
        Self::start_with_pool(Pool::with_seed(registry, seed)).await
    }

    async fn start_with_pool(pool: Arc<Pool>) -> Self {
        let gateway = Gateway::new(pool.clone(), Handshaker::direct());
        let listener = ConnectListener::new(gateway, STICKY_HEADER);

        let tcp = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind gateway listener");
        let addr = tcp.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::select! {
                result = listener.run_with_listener(tcp) => {
                    if let Err(e) = result {
                        tracing::error!("Gateway listener error: {}", e);
                    }
                }
                _ = shutdown_rx => {
                    tracing::debug!("Gateway listener shutting down");
                }
            }
        });

        Self {
            addr,
            pool,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Current binding for a session key
    pub fn binding(&self, session_key: &str) -> Option<Endpoint> {
        self.pool.binding(session_key)
    }

    /// Shutdown the gateway
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// An address nothing listens on
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind placeholder listener");
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
