//! Port-sharing TCP sockets
//!
//! The relay connection, every hole-punch dial and the inbound listener all
//! bind the same local port. Each socket opts into address and port reuse
//! before `bind`, otherwise the second bind fails with `EADDRINUSE`.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::trace;

use crate::error::{NetworkError, NetworkResult};

/// Listen backlog for the inbound peer listener
const LISTEN_BACKLOG: i32 = 128;

/// Wildcard local address of the same family as `remote`
pub fn wildcard_for(remote: &SocketAddr, port: u16) -> SocketAddr {
    let ip = if remote.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    };
    SocketAddr::new(ip, port)
}

fn reusable_socket(local: SocketAddr) -> NetworkResult<Socket> {
    let socket = Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;

    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;

    bind(&socket, local)?;
    Ok(socket)
}

fn bind(socket: &Socket, local: SocketAddr) -> NetworkResult<()> {
    socket.bind(&local.into()).map_err(|e| {
        if e.kind() == io::ErrorKind::AddrInUse {
            NetworkError::AddressInUse(local)
        } else {
            NetworkError::Io(e)
        }
    })
}

/// Connect to `remote` from `local_port`, sharing the port with any other
/// socket already bound to it.
pub async fn connect_reusable(
    local_port: u16,
    remote: SocketAddr,
    connect_timeout: Duration,
) -> NetworkResult<TcpStream> {
    let local = wildcard_for(&remote, local_port);
    let socket = reusable_socket(local)?;
    let socket = TcpSocket::from_std_stream(socket.into());

    trace!("Dialing {} from {}", remote, local);

    match timeout(connect_timeout, socket.connect(remote)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(NetworkError::ConnectionFailed(format!("{}: {}", remote, e))),
        Err(_) => Err(NetworkError::Timeout(format!(
            "connect to {} after {:?}",
            remote, connect_timeout
        ))),
    }
}

/// Listen on `local` with address and port reuse enabled
pub fn listen_reusable(local: SocketAddr) -> NetworkResult<TcpListener> {
    let socket = reusable_socket(local)?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)?;

    trace!("Listening on {}", local);
    Ok(listener)
}

/// Listen on `local` for relay clients. An IPv6 address also accepts IPv4
/// clients, which show up as IPv4-mapped peers.
pub fn listen_dual_stack(local: SocketAddr) -> NetworkResult<TcpListener> {
    let socket = Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))?;

    if local.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    bind(&socket, local)?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}
