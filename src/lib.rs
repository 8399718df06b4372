//! netlat -- TCP connection-cost and transaction-latency microbenchmarks.
//!
//! Services are reached over IPv4 or vsock and identified either by a fixed
//! port or by a program number resolved through the portmapper. The library
//! provides the connection layer (socket factory, advertiser, locator,
//! acceptor), the two measurement protocols and a small timing harness; the
//! `netlat` binary wires them to a command line.

pub mod acceptor;
pub mod advertise;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod harness;
pub mod locator;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod socket;

pub use error::NetError;
pub use service::ServiceId;
