//! Failover coordinator
//!
//! Drives selection and handshakes for one tunnel request. A failed attempt
//! evicts the upstream's bindings, draws a replacement ignoring affinity, and
//! rebinds the session so later requests on the same key avoid the failure.

use std::sync::Arc;

use crate::error::TunnelError;
use crate::handshake::{BoxedStream, Handshaker};
use crate::pool::Pool;

/// Handshake attempts per tunnel request
pub const MAX_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct Gateway {
    pool: Arc<Pool>,
    handshaker: Handshaker,
}

impl Gateway {
    pub fn new(pool: Arc<Pool>, handshaker: Handshaker) -> Self {
        Self { pool, handshaker }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Open a tunnel to `target`, pinned to `session_key` when non-empty
    pub async fn establish_tunnel(
        &self,
        session_key: &str,
        target: &str,
    ) -> Result<BoxedStream, TunnelError> {
        let mut endpoint = self.pool.select(session_key)?;
        tracing::debug!(
            "Selected {} for {} (session: {:?})",
            endpoint,
            target,
            session_key
        );

        let mut attempt = 1;
        loop {
            tracing::debug!(
                "Connecting to {} via {} (attempt {}/{})",
                target,
                endpoint,
                attempt,
                MAX_ATTEMPTS
            );

            let err = match self.handshaker.connect(&endpoint, target).await {
                Ok(stream) => {
                    tracing::info!("Tunnel to {} established via {}", target, endpoint);
                    return Ok(stream);
                }
                Err(e) => e,
            };

            tracing::warn!(
                "Attempt {}/{} via {} failed: {}",
                attempt,
                MAX_ATTEMPTS,
                endpoint,
                err
            );

            self.pool.mark_failed(&endpoint);
            let next = self.pool.select("")?;
            self.pool.bind(session_key, next.clone());
            endpoint = next;

            if attempt == MAX_ATTEMPTS {
                return Err(TunnelError::MaxRetriesExceeded {
                    attempts: MAX_ATTEMPTS,
                    source: err,
                });
            }
            attempt += 1;
        }
    }
}
