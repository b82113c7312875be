//! Non-blocking datagram sockets
//!
//! The tick never waits on I/O: every read is a `try_recv_from` that
//! reports `WouldBlock` once the socket is drained.

use log::error;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

pub const RECV_BUFFER_SIZE: usize = 4096;

/// Which socket a datagram arrived on, and so which one answers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketId {
    /// Index into the server's own sockets; 0 is the main socket.
    Server(usize),
    /// One of the two sockets of a NAT traversal entry.
    Nat { entry: u64, path: NatPath },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatPath {
    Traverse,
    ConnectHere,
}

pub trait DatagramSocket {
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for tokio::net::UdpSocket {
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::try_recv_from(self, buf)
    }

    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.try_send_to(data, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self)
    }
}

/// Drains every datagram currently queued on the socket.
pub fn drain(socket: &dyn DatagramSocket) -> Vec<(Vec<u8>, SocketAddr)> {
    let mut buffer = [0u8; RECV_BUFFER_SIZE];
    let mut datagrams = Vec::new();

    loop {
        match socket.try_recv_from(&mut buffer) {
            Ok((len, addr)) => datagrams.push((buffer[..len].to_vec(), addr)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            // ICMP port unreachable surfaces here on some platforms
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                error!("Error receiving packet: {}", e);
                break;
            }
        }
    }

    datagrams
}

type Mailboxes = HashMap<SocketAddr, VecDeque<(Vec<u8>, SocketAddr)>>;

/// An in-process datagram network.
///
/// Sockets bound on the same network deliver to each other by address;
/// datagrams to unbound addresses vanish, as they would over UDP.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    mailboxes: Arc<Mutex<Mailboxes>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, addr: SocketAddr) -> LoopbackSocket {
        self.lock().entry(addr).or_default();
        LoopbackSocket {
            addr,
            network: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Mailboxes> {
        self.mailboxes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackSocket {
    addr: SocketAddr,
    network: LoopbackNetwork,
}

impl DatagramSocket for LoopbackSocket {
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut mailboxes = self.network.lock();
        let queued = mailboxes
            .get_mut(&self.addr)
            .and_then(|queue| queue.pop_front());
        match queued {
            Some((data, from)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok((len, from))
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        if let Some(queue) = self.network.lock().get_mut(&target) {
            queue.push_back((data.to_vec(), self.addr));
        }
        Ok(data.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_loopback_delivery() {
        let net = LoopbackNetwork::new();
        let a = net.bind(addr(1000));
        let b = net.bind(addr(2000));

        a.send_to(b"hi", addr(2000)).unwrap();
        a.send_to(b"there", addr(2000)).unwrap();

        let received = drain(&b);
        assert_eq!(received.len(), 2);
        assert_eq!(received[0], (b"hi".to_vec(), addr(1000)));
        assert_eq!(received[1].0, b"there".to_vec());
        assert!(drain(&b).is_empty());
    }

    #[test]
    fn test_unbound_target_drops() {
        let net = LoopbackNetwork::new();
        let a = net.bind(addr(1000));
        assert_eq!(a.send_to(b"lost", addr(9999)).unwrap(), 4);
        assert!(drain(&a).is_empty());
    }

    #[test]
    fn test_empty_socket_would_block() {
        let net = LoopbackNetwork::new();
        let a = net.bind(addr(1000));
        let mut buf = [0u8; 16];
        let err = a.try_recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
