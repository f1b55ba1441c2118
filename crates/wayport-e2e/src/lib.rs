//! End-to-end test utilities for the wayport gateway
//!
//! This crate provides real-socket harnesses for exercising the gateway
//! against mock upstream proxies and mock targets, without any external
//! network access.

pub mod harness;
pub mod mock_target;
pub mod mock_upstream;
pub mod test_client;

pub use harness::{dead_addr, TestGateway};
pub use mock_target::{MockTarget, TargetMode};
pub use mock_upstream::{MockHttpProxy, MockSocksProxy, ProxyMode, RecordedConnect};
pub use test_client::{ConnectClient, ConnectResponse};
