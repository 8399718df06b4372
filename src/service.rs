//! Service identifiers.
//!
//! A negative identifier names a fixed TCP port (its absolute value). A
//! positive identifier is a program number whose port is resolved at runtime
//! through the naming service. Zero is never valid.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::NetError;

/// Default identifier of the transaction-latency service (fixed port 3962).
pub const TCP_XACT: i32 = -3962;

/// Default identifier of the connection-cost service (fixed port 3965).
pub const TCP_CONNECT: i32 = -3965;

/// How the port behind a [`ServiceId`] is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    /// Literal, well-known TCP port.
    Fixed(u16),
    /// Program number registered with the naming service.
    Program(u32),
}

/// Validated service identifier; see the module docs for the sign convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct ServiceId(i32);

impl ServiceId {
    /// Default transaction-latency service.
    pub const XACT: ServiceId = ServiceId(TCP_XACT);
    /// Default connection-cost service.
    pub const CONNECT: ServiceId = ServiceId(TCP_CONNECT);

    pub fn new(raw: i32) -> Result<Self, NetError> {
        if raw == 0 {
            return Err(NetError::InvalidService {
                value: 0,
                reason: "zero is not a service identifier",
            });
        }
        if raw < 0 && raw.unsigned_abs() > u32::from(u16::MAX) {
            return Err(NetError::InvalidService {
                value: i64::from(raw),
                reason: "fixed port out of range",
            });
        }
        Ok(ServiceId(raw))
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn source(self) -> PortSource {
        if self.0 < 0 {
            // new() guarantees the magnitude fits in a u16
            PortSource::Fixed(self.0.unsigned_abs() as u16)
        } else {
            PortSource::Program(self.0 as u32)
        }
    }

    /// Program number, if this identifier needs the naming service.
    pub fn program(self) -> Option<u32> {
        match self.source() {
            PortSource::Program(p) => Some(p),
            PortSource::Fixed(_) => None,
        }
    }
}

impl TryFrom<i32> for ServiceId {
    type Error = NetError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        ServiceId::new(raw)
    }
}

impl From<ServiceId> for i32 {
    fn from(id: ServiceId) -> i32 {
        id.0
    }
}

impl FromStr for ServiceId {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: i32 = s.trim().parse().map_err(|_| NetError::InvalidService {
            value: 0,
            reason: "not an integer",
        })?;
        ServiceId::new(raw)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source() {
            PortSource::Fixed(port) => write!(f, "port {}", port),
            PortSource::Program(prog) => write!(f, "program {}", prog),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_is_fixed_port() {
        let id = ServiceId::new(-7070).unwrap();
        assert_eq!(id.source(), PortSource::Fixed(7070));
        assert_eq!(id.program(), None);
    }

    #[test]
    fn test_positive_is_program() {
        let id = ServiceId::new(44).unwrap();
        assert_eq!(id.source(), PortSource::Program(44));
        assert_eq!(id.program(), Some(44));
    }

    #[test]
    fn test_zero_and_oversized_ports_rejected() {
        assert!(ServiceId::new(0).is_err());
        assert!(ServiceId::new(-70_000).is_err());
        assert!(ServiceId::new(-65_535).is_ok());
    }

    #[test]
    fn test_parse_and_serde() {
        let id: ServiceId = "-3962".parse().unwrap();
        assert_eq!(id.raw(), TCP_XACT);
        assert!("abc".parse::<ServiceId>().is_err());

        #[derive(Deserialize)]
        struct Wrapper {
            id: ServiceId,
        }
        let w: Wrapper = toml::from_str("id = 44").unwrap();
        assert_eq!(w.id.program(), Some(44));
        assert!(toml::from_str::<Wrapper>("id = 0").is_err());
    }
}
