use crate::error::{ProbeError, Result};
use crate::models::PortPair;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use tracing::debug;

pub const MAX_ALLOCATION_ATTEMPTS: u32 = 10;

/// Picks two distinct loopback ports that were free at the moment of the
/// call. Both listeners stay bound until the pair is compared, then are
/// released together so the proxy can take them over.
pub fn allocate_pair() -> Result<PortPair> {
    for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
        let (first, second) = match (bind_ephemeral(), bind_ephemeral()) {
            (Ok(first), Ok(second)) => (first, second),
            (first, second) => {
                debug!(
                    attempt,
                    first_ok = first.is_ok(),
                    second_ok = second.is_ok(),
                    "loopback bind failed"
                );
                continue;
            }
        };

        let pair = match (local_port(&first), local_port(&second)) {
            (Some(socks), Some(http)) if socks != http => PortPair { socks, http },
            _ => continue,
        };

        drop(first);
        drop(second);
        return Ok(pair);
    }

    Err(ProbeError::PortExhaustion {
        attempts: MAX_ALLOCATION_ATTEMPTS,
    })
}

fn bind_ephemeral() -> std::io::Result<TcpListener> {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
}

fn local_port(listener: &TcpListener) -> Option<u16> {
    listener
        .local_addr()
        .ok()
        .map(|addr| addr.port())
        .filter(|port| *port != 0)
}
