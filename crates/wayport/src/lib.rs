//! Wayport forward-proxy gateway library
//!
//! Routes client tunnels through a pool of upstream HTTP/HTTPS/SOCKS5 proxies
//! with sticky session affinity and bounded failover. The binary wires these
//! pieces to a CONNECT listener; tests and embedders can use them directly.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod gateway;
pub mod handshake;
pub mod listener;
pub mod loader;
pub mod pool;

// Re-export public types
pub use config::{CliOverrides, GatewayConfig, ResolvedGatewayConfig};
pub use endpoint::{Credentials, Endpoint, Protocol, UnsupportedScheme};
pub use error::{HandshakeError, LoadError, PoolError, TunnelError};
pub use gateway::{Gateway, MAX_ATTEMPTS};
pub use handshake::{BoxedStream, Connector, Handshaker, TcpConnector, TunnelIo};
pub use listener::ConnectListener;
pub use loader::{load_file, parse_line, parse_lines};
pub use pool::{Pool, Registry};
