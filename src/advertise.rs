//! Service advertiser: bind, listen, and publish the port when the service
//! is identified by a program number.

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

use socket2::{SockAddr, Socket};
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, Family};
use crate::error::NetError;
use crate::registry::PortRegistry;
use crate::service::{PortSource, ServiceId};
use crate::socket::{create_socket, tune_socket, SockOpts};

/// What to listen on.
#[derive(Debug, Clone, Copy)]
pub struct ListenOptions {
    pub family: Family,
    /// IPv4 bind address; ignored for vsock, which binds the local context id.
    pub address: Ipv4Addr,
    pub backlog: i32,
    pub service: ServiceId,
    pub opts: SockOpts,
}

/// A live advertisement. Program-number services stay registered with the
/// naming service until [`Advertisement::withdraw`] runs; a killed process
/// leaves the registration behind.
#[derive(Clone)]
pub struct Advertisement {
    endpoint: Endpoint,
    service: ServiceId,
    registry: Arc<dyn PortRegistry>,
}

impl Advertisement {
    /// Address the listener is bound to, with the kernel-assigned port.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }

    /// Remove the naming-service registration, if any. Blocking; failures
    /// are logged.
    pub fn withdraw(&self) {
        if let Some(program) = self.service.program() {
            match self.registry.unregister(program) {
                Ok(()) => info!(program, "service withdrawn from naming service"),
                Err(e) => warn!(program, error = %e, "failed to withdraw service"),
            }
        }
    }
}

/// Create, tune, bind and listen; register the bound port for program-number
/// services. Returns the listening socket (blocking mode) and the
/// advertisement needed to withdraw it later.
pub fn advertise(
    options: &ListenOptions,
    registry: Arc<dyn PortRegistry>,
) -> Result<(Socket, Advertisement), NetError> {
    let socket = create_socket(options.family)?;
    tune_socket(&socket, options.opts);

    let fixed_port = match options.service.source() {
        PortSource::Fixed(port) => Some(port),
        PortSource::Program(_) => None,
    };
    let requested = options
        .family
        .listen_endpoint(options.address, fixed_port)
        .map_err(NetError::LocalCid)?;

    socket
        .bind(&requested.to_sock_addr())
        .map_err(|source| NetError::Bind {
            endpoint: requested.to_string(),
            source,
        })?;
    socket.listen(options.backlog).map_err(NetError::Listen)?;

    let endpoint = bound_endpoint(socket.local_addr(), requested)?;

    if let Some(program) = options.service.program() {
        // clear a registration left behind by an instance that died uncleanly
        if let Err(e) = registry.unregister(program) {
            debug!(program, error = %e, "stale registration not removed");
        }
        registry
            .register(program, endpoint.port())
            .map_err(|source| NetError::Register {
                program,
                port: endpoint.port(),
                source,
            })?;
        info!(program, port = endpoint.port(), "registered with naming service");
    }

    info!(
        %endpoint,
        service = %options.service,
        backlog = options.backlog,
        opts = %options.opts,
        "service advertised"
    );

    Ok((
        socket,
        Advertisement {
            endpoint,
            service: options.service,
            registry,
        },
    ))
}

/// The address actually bound. Registering `requested` instead would
/// publish port 0 for program-number services.
fn bound_endpoint(local: io::Result<SockAddr>, requested: Endpoint) -> Result<Endpoint, NetError> {
    let bind_error = |source| NetError::Bind {
        endpoint: requested.to_string(),
        source,
    };
    let addr = local.map_err(bind_error)?;
    Endpoint::from_sock_addr(&addr).ok_or_else(|| {
        bind_error(io::Error::new(
            io::ErrorKind::InvalidData,
            "bound address has an unexpected family",
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InMemoryRegistry, RegistryError};

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn options(service: i32) -> ListenOptions {
        ListenOptions {
            family: Family::Inet,
            address: Ipv4Addr::LOCALHOST,
            backlog: 8,
            service: ServiceId::new(service).unwrap(),
            opts: SockOpts::REUSE,
        }
    }

    struct RefusingRegistry;

    impl PortRegistry for RefusingRegistry {
        fn register(&self, _: u32, _: u32) -> Result<(), RegistryError> {
            Err(RegistryError::Refused)
        }
        fn unregister(&self, _: u32) -> Result<(), RegistryError> {
            Ok(())
        }
        fn lookup(&self, _: Ipv4Addr, _: u32) -> Result<Option<u32>, RegistryError> {
            Ok(None)
        }
    }

    #[test]
    fn test_fixed_port_skips_naming_service() {
        let port = free_port();
        let registry = Arc::new(InMemoryRegistry::new());
        let (_socket, ad) = advertise(&options(-i32::from(port)), registry.clone()).unwrap();

        assert_eq!(ad.endpoint().port(), u32::from(port));
        ad.withdraw();
        assert_eq!(registry.calls(), 0);
    }

    #[test]
    fn test_program_registers_bound_port() {
        let registry = Arc::new(InMemoryRegistry::new());
        let (_socket, ad) = advertise(&options(44), registry.clone()).unwrap();

        let port = ad.endpoint().port();
        assert_ne!(port, 0);
        assert_eq!(registry.port_of(44), Some(port));
        assert_eq!(registry.registrations(), 1);

        ad.withdraw();
        assert_eq!(registry.port_of(44), None);
    }

    #[test]
    fn test_registration_failure_is_fatal() {
        let err = advertise(&options(44), Arc::new(RefusingRegistry))
            .err()
            .expect("registration must fail");
        assert!(matches!(err, NetError::Register { program: 44, .. }));
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_unreadable_local_address_is_bind_failure() {
        let requested = Family::Inet.listen_endpoint(Ipv4Addr::LOCALHOST, None).unwrap();

        let err = bound_endpoint(Err(io::Error::from_raw_os_error(libc::EBADF)), requested)
            .unwrap_err();
        assert!(matches!(err, NetError::Bind { .. }));
        assert_eq!(err.exit_code(), 2);

        let unix = SockAddr::unix("/tmp/netlat.sock").unwrap();
        let err = bound_endpoint(Ok(unix), requested).unwrap_err();
        assert!(matches!(err, NetError::Bind { .. }));
    }

    #[test]
    fn test_port_in_use_is_bind_failure() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let mut opts = options(-i32::from(port));
        opts.opts = SockOpts::NONE;

        let err = advertise(&opts, Arc::new(InMemoryRegistry::new()))
            .err()
            .expect("bind must fail");
        assert!(matches!(err, NetError::Bind { .. }));
        assert_eq!(err.exit_code(), 2);
    }
}
