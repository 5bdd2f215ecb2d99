//! Small TCP helpers for the event loop: listeners with `SO_REUSEADDR` and
//! nonblocking outbound connects.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{FromRawFd, RawFd};

use anyhow::{bail, format_err, Error};
use nix::sys::socket::{
    bind, connect, listen, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType,
    SockaddrIn,
};

/// Resolve `host:port`; `*` listens on every interface.
pub fn resolve(host: &str, port: &str) -> Result<SocketAddrV4, Error> {
    let port: u16 = port
        .parse()
        .map_err(|_| format_err!("invalid port '{}'", port))?;
    if host == "*" {
        return Ok(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    }
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|err| format_err!("unable to resolve '{}' - {}", host, err))?;
    for addr in addrs {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(v4);
        }
    }
    bail!("no IPv4 address for '{}'", host);
}

pub fn ipv4_to_u32(addr: &Ipv4Addr) -> u32 {
    u32::from_be_bytes(addr.octets())
}

/// Nonblocking listener with `SO_REUSEADDR`, so a restarted daemon can
/// rebind its port immediately.
pub fn tcp_listen(addr: SocketAddrV4, backlog: usize) -> Result<TcpListener, Error> {
    let fd: RawFd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(|err| format_err!("unable to create socket - {}", err))?;
    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    setsockopt(fd, sockopt::ReuseAddr, &true)
        .map_err(|err| format_err!("setsockopt failed - {}", err))?;
    bind(fd, &SockaddrIn::from(addr))
        .map_err(|err| format_err!("unable to bind {} - {}", addr, err))?;
    listen(fd, backlog).map_err(|err| format_err!("listen on {} failed - {}", addr, err))?;
    Ok(listener)
}

/// Start a nonblocking connect to `ip:port`. Returns the stream and whether
/// the connection is already established; when it is not, the caller waits
/// for writability and then checks [connect_finished].
pub fn connect_nonblocking(ip: u32, port: u16) -> Result<(TcpStream, bool), Error> {
    let fd: RawFd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(|err| format_err!("unable to create socket - {}", err))?;
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    let addr = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::from(ip), port));
    match connect(fd, &addr) {
        Ok(()) => {
            let _ = stream.set_nodelay(true);
            Ok((stream, true))
        }
        Err(nix::errno::Errno::EINPROGRESS) => Ok((stream, false)),
        Err(err) => Err(format_err!(
            "connect to {}:{} failed - {}",
            Ipv4Addr::from(ip),
            port,
            err
        )),
    }
}

/// After writability on an in-progress connect: did it succeed?
pub fn connect_finished(stream: &TcpStream) -> Result<(), Error> {
    match stream.take_error() {
        Ok(None) => {
            let _ = stream.set_nodelay(true);
            Ok(())
        }
        Ok(Some(err)) => Err(format_err!("connection failed - {}", err)),
        Err(err) => Err(format_err!("connection failed - {}", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_wildcard_and_port() {
        let addr = resolve("*", "9422").unwrap();
        assert_eq!(addr, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 9422));
        assert!(resolve("*", "no").is_err());
    }

    #[test]
    fn listener_binds_and_accepts_nonblocking() {
        let listener =
            tcp_listen(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 5).unwrap();
        let local = listener.local_addr().unwrap();
        // nonblocking: accept with no pending connection must not hang
        assert!(listener.accept().is_err());

        let ip = ipv4_to_u32(&Ipv4Addr::LOCALHOST);
        let port = local.port();
        let (stream, done) = connect_nonblocking(ip, port).unwrap();
        if !done {
            // localhost connects settle quickly
            std::thread::sleep(std::time::Duration::from_millis(20));
            connect_finished(&stream).unwrap();
        }
        let (peer, _) = loop {
            match listener.accept() {
                Ok(got) => break got,
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(err) => panic!("accept failed: {}", err),
            }
        };
        assert_eq!(peer.local_addr().unwrap().port(), port);
    }
}
