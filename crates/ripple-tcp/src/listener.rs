//! Non-blocking listening-socket construction, kept separate from
//! [`crate::server`] so the bind policy (backlog, `SO_REUSEPORT`, address
//! family) can be unit-tested without a reactor.

use std::net::{SocketAddr, ToSocketAddrs};

use ripple_core::{AddressFamily, RippleError};
use socket2::{Domain, Protocol, Socket, Type};

/// Policy knobs for [`bind`], normally sourced from [`ripple_core::RuntimeConfig`].
#[derive(Debug, Clone, Copy)]
pub struct BindOptions {
    pub backlog: i32,
    pub reuse_port: bool,
    pub family: AddressFamily,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            backlog: 128,
            reuse_port: false,
            family: AddressFamily::Any,
        }
    }
}

/// Resolves `host:port`, binds a non-blocking listening socket and starts
/// listening. Does not register the socket with any reactor; hand the
/// result to [`crate::server::TcpServer::serve`] for that.
pub fn bind(host: &str, port: u16, opts: &BindOptions) -> Result<mio::net::TcpListener, RippleError> {
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(RippleError::Io)?
        .collect();
    let addr = select_addr(&candidates, opts.family).ok_or_else(|| {
        RippleError::ReactorSetupFailure(format!(
            "no address for {host}:{port} matching the requested address family"
        ))
    })?;

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    if opts.reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(opts.backlog)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(mio::net::TcpListener::from_std(std_listener))
}

fn select_addr(addrs: &[SocketAddr], family: AddressFamily) -> Option<SocketAddr> {
    match family {
        AddressFamily::Any => addrs.first().copied(),
        AddressFamily::V4 => addrs.iter().find(|a| a.is_ipv4()).copied(),
        AddressFamily::V6 => addrs.iter().find(|a| a.is_ipv6()).copied(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_an_ephemeral_loopback_port() {
        let listener = bind("127.0.0.1", 0, &BindOptions::default()).unwrap();
        let local = listener.local_addr().unwrap();
        assert!(local.port() > 0);
    }

    #[test]
    fn rejects_a_family_with_no_matching_address() {
        let opts = BindOptions {
            family: AddressFamily::V6,
            ..BindOptions::default()
        };
        let err = bind("127.0.0.1", 0, &opts).unwrap_err();
        assert!(matches!(err, RippleError::ReactorSetupFailure(_)));
    }
}
