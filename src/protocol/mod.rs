//! The two measurement protocols.
//!
//! * [`connect`] -- connection-cost: connect and close, no payload.
//! * [`xact`] -- transaction latency: fixed-size echo over one connection.
//!
//! Servers are async and run until a client performs the protocol's shutdown
//! handshake or the caller cancels them. Clients are blocking and implement
//! [`crate::harness::Benchmark`].

pub mod connect;
pub mod xact;

use std::fmt;

use crate::advertise::Advertisement;

/// Why a server stopped accepting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A client performed the shutdown handshake.
    Requested,
    /// The caller cancelled the server (Ctrl-C in the binary).
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => f.write_str("shutdown requested by client"),
            StopReason::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Withdraw `ad` from the naming service without blocking the runtime.
pub(crate) async fn withdraw(ad: &Advertisement) {
    let ad = ad.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || ad.withdraw()).await {
        tracing::warn!(error = %e, "withdraw task failed");
    }
}
