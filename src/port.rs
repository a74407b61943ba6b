use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpSocket;

/// Ask the OS for a free loopback port.
///
/// The socket is bound with address reuse and closed before returning, so
/// the port is only known to be free at that instant. Another process can
/// take it before ssh binds it; the window is a few milliseconds and we
/// accept it.
pub fn allocate_free_local_port() -> io::Result<u16> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
    let port = socket.local_addr()?.port();
    drop(socket);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_port_available(port: u16) -> bool {
        std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }

    #[test]
    fn allocates_unprivileged_port() {
        let port = allocate_free_local_port().unwrap();
        assert!(port >= 1024);
    }

    #[test]
    fn allocated_port_is_released() {
        let port = allocate_free_local_port().unwrap();
        assert!(is_port_available(port));
        assert!(std::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).is_err());
    }

    #[test]
    fn bound_port_is_not_available() {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available(port));
    }
}
