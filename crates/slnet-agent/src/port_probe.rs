use std::{io::ErrorKind, net::TcpListener};

/// Binds and immediately releases `0.0.0.0:port`.
///
/// Only `AddrInUse` counts as occupied. Any other bind error (permissions,
/// exhausted descriptors, ...) reports the port as available with a warning.
pub fn is_port_available(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        Err(e) => {
            tracing::warn!(port, error = %e, "port probe failed; treating port as available");
            true
        }
    }
}
