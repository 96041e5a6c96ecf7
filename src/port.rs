use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::debug;

pub const DEFAULT_START_PORT: u16 = 3001;
pub const DEFAULT_MAX_ATTEMPTS: u16 = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("No available backend port found in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },

    #[error("Port scan needs at least one attempt")]
    NoAttempts,
}

/// Binds and immediately releases a listener on the wildcard address.
pub async fn is_port_available(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) => {
            debug!(port, error = %e, "port is taken");
            false
        }
    }
}

pub async fn find_available_port(start: u16, max_attempts: u16) -> Result<u16, PortError> {
    find_available_port_with(start, max_attempts, is_port_available).await
}

/// Checks `start..start + max_attempts` in ascending order, one port at a time.
pub async fn find_available_port_with<F, Fut>(
    start: u16,
    max_attempts: u16,
    mut is_free: F,
) -> Result<u16, PortError>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = bool>,
{
    if max_attempts == 0 {
        return Err(PortError::NoAttempts);
    }

    let end = start.saturating_add(max_attempts - 1);
    for port in start..=end {
        if is_free(port).await {
            return Ok(port);
        }
    }

    Err(PortError::Exhausted { start, end })
}
