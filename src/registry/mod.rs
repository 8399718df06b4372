//! Naming service: maps program numbers to the ports servers bound.
//!
//! Servers that advertise a program number register their ephemeral port
//! here; clients look the port up before connecting. [`Portmapper`] talks to
//! the system portmapper, [`InMemoryRegistry`] keeps mappings in-process.

pub mod portmap;

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;

pub use portmap::Portmapper;

/// Errors from a naming-service operation.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("naming service I/O: {0}")]
    Io(#[from] io::Error),

    #[error("no reply from naming service at {addr} after {attempts} attempts")]
    Timeout { addr: String, attempts: u32 },

    #[error("naming service rejected the call: {0}")]
    Rejected(String),

    #[error("malformed naming service reply: {0}")]
    Malformed(&'static str),

    #[error("naming service refused the registration")]
    Refused,
}

/// Program-number to port registry.
///
/// Implementations are called from blocking contexts only.
pub trait PortRegistry: Send + Sync {
    /// Register `port` for `program` on the local naming service.
    fn register(&self, program: u32, port: u32) -> Result<(), RegistryError>;

    /// Remove any registration of `program` on the local naming service.
    fn unregister(&self, program: u32) -> Result<(), RegistryError>;

    /// Ask the naming service on `host` for the port of `program`.
    /// `Ok(None)` means the program is not registered there.
    fn lookup(&self, host: Ipv4Addr, program: u32) -> Result<Option<u32>, RegistryError>;
}

/// Process-local registry. Ignores the host on lookup.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    ports: Mutex<HashMap<u32, u32>>,
    registrations: AtomicU64,
    unregistrations: AtomicU64,
    lookups: AtomicU64,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `register` calls served.
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    /// Number of `lookup` calls served.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Every call of any kind.
    pub fn calls(&self) -> u64 {
        self.registrations() + self.unregistrations.load(Ordering::Relaxed) + self.lookups()
    }

    /// Current port of `program`, without counting as a lookup.
    pub fn port_of(&self, program: u32) -> Option<u32> {
        self.ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&program)
            .copied()
    }
}

impl PortRegistry for InMemoryRegistry {
    fn register(&self, program: u32, port: u32) -> Result<(), RegistryError> {
        self.registrations.fetch_add(1, Ordering::Relaxed);
        self.ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(program, port);
        Ok(())
    }

    fn unregister(&self, program: u32) -> Result<(), RegistryError> {
        self.unregistrations.fetch_add(1, Ordering::Relaxed);
        self.ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&program);
        Ok(())
    }

    fn lookup(&self, _host: Ipv4Addr, program: u32) -> Result<Option<u32>, RegistryError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.port_of(program))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_register_lookup_unregister() {
        let reg = InMemoryRegistry::new();
        assert_eq!(reg.lookup(Ipv4Addr::LOCALHOST, 44).unwrap(), None);

        reg.register(44, 40_123).unwrap();
        assert_eq!(reg.lookup(Ipv4Addr::LOCALHOST, 44).unwrap(), Some(40_123));
        assert_eq!(reg.registrations(), 1);
        assert_eq!(reg.lookups(), 2);

        reg.unregister(44).unwrap();
        assert_eq!(reg.port_of(44), None);
        assert_eq!(reg.lookups(), 2);
        assert_eq!(reg.calls(), 4);
    }

    #[test]
    fn test_reregister_replaces_port() {
        let reg = InMemoryRegistry::new();
        reg.register(7, 1000).unwrap();
        reg.register(7, 2000).unwrap();
        assert_eq!(reg.port_of(7), Some(2000));
    }
}
