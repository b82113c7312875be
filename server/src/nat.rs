//! NAT traversal sockets
//!
//! A client behind a NAT cannot reach the main socket directly, so a pair
//! of auxiliary sockets is opened for it: one punched towards the client's
//! public address and one the client is told to connect to. Whichever
//! receives first wins. Entries nobody uses for a while are closed.

use crate::socket::{drain, DatagramSocket, NatPath, SocketId};
use log::{debug, info};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const NAT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct NatEntry {
    pub id: u64,
    traverse: Box<dyn DatagramSocket>,
    connect_here: Box<dyn DatagramSocket>,
    pub last_used_at: Instant,
    pub client_connected: bool,
}

impl NatEntry {
    fn socket(&self, path: NatPath) -> &dyn DatagramSocket {
        match path {
            NatPath::Traverse => self.traverse.as_ref(),
            NatPath::ConnectHere => self.connect_here.as_ref(),
        }
    }

    fn describe(&self) -> String {
        self.traverse
            .local_addr()
            .map_or_else(|_| format!("entry {}", self.id), |addr| addr.to_string())
    }
}

/// A datagram received on a NAT socket, still to be demultiplexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatDatagram {
    pub data: Vec<u8>,
    pub from: SocketAddr,
    pub socket: SocketId,
}

#[derive(Default)]
pub struct NatTracker {
    entries: Vec<NatEntry>,
    next_id: u64,
}

impl NatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        traverse: Box<dyn DatagramSocket>,
        connect_here: Box<dyn DatagramSocket>,
        now: Instant,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(NatEntry {
            id,
            traverse,
            connect_here,
            last_used_at: now,
            client_connected: false,
        });
        debug!("Tracking NAT traversal entry {}", id);
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&NatEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn socket(&self, id: u64, path: NatPath) -> Option<&dyn DatagramSocket> {
        self.get(id).map(|entry| entry.socket(path))
    }

    /// Drains both sockets of every entry.
    pub fn read_incoming(&mut self, now: Instant) -> Vec<NatDatagram> {
        let mut received = Vec::new();
        for entry in self.entries.iter_mut() {
            for path in [NatPath::Traverse, NatPath::ConnectHere] {
                let datagrams = drain(entry.socket(path));
                if datagrams.is_empty() {
                    continue;
                }
                if !entry.client_connected {
                    let how = match path {
                        NatPath::Traverse => "NAT traversal",
                        NatPath::ConnectHere => "connect_here traversal",
                    };
                    info!(
                        "A client {} successfully connected using {}",
                        datagrams[0].1, how
                    );
                    entry.client_connected = true;
                }
                entry.last_used_at = now;
                received.extend(datagrams.into_iter().map(|(data, from)| NatDatagram {
                    data,
                    from,
                    socket: SocketId::Nat {
                        entry: entry.id,
                        path,
                    },
                }));
            }
        }
        received
    }

    /// Closes entries idle for `NAT_IDLE_TIMEOUT` or longer, connected or not.
    pub fn check_timeouts(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| {
            let idle = now.saturating_duration_since(entry.last_used_at) >= NAT_IDLE_TIMEOUT;
            if idle {
                info!("A NAT traverse connection timed out: {}", entry.describe());
            }
            !idle
        });
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::LoopbackNetwork;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn entry(net: &LoopbackNetwork, tracker: &mut NatTracker, base: u16, now: Instant) -> u64 {
        tracker.add(
            Box::new(net.bind(addr(base))),
            Box::new(net.bind(addr(base + 1))),
            now,
        )
    }

    #[test]
    fn test_idle_entry_removed() {
        let net = LoopbackNetwork::new();
        let mut tracker = NatTracker::new();
        let start = Instant::now();
        entry(&net, &mut tracker, 7000, start);

        assert_eq!(tracker.check_timeouts(start + Duration::from_secs(9)), 0);
        assert_eq!(tracker.check_timeouts(start + Duration::from_secs(11)), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_receipt_marks_connected_and_refreshes() {
        let net = LoopbackNetwork::new();
        let client = net.bind(addr(9000));
        let mut tracker = NatTracker::new();
        let start = Instant::now();
        let id = entry(&net, &mut tracker, 7000, start);

        client.send_to(b"hello", addr(7001)).unwrap();
        let received = tracker.read_incoming(start + Duration::from_secs(5));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].from, addr(9000));
        assert_eq!(
            received[0].socket,
            SocketId::Nat {
                entry: id,
                path: NatPath::ConnectHere
            }
        );

        // Idle for 9 seconds since the receipt at 5
        assert_eq!(tracker.check_timeouts(start + Duration::from_secs(14)), 0);
        assert!(tracker.get(id).unwrap().client_connected);
    }

    #[test]
    fn test_removal_keeps_neighbours() {
        let net = LoopbackNetwork::new();
        let client = net.bind(addr(9000));
        let mut tracker = NatTracker::new();
        let start = Instant::now();
        let a = entry(&net, &mut tracker, 7000, start);
        let b = entry(&net, &mut tracker, 7010, start);
        let c = entry(&net, &mut tracker, 7020, start);

        client.send_to(b"x", addr(7010)).unwrap();
        tracker.read_incoming(start + Duration::from_secs(8));

        assert_eq!(tracker.check_timeouts(start + Duration::from_secs(12)), 2);
        assert!(tracker.get(a).is_none());
        assert!(tracker.get(b).is_some());
        assert!(tracker.get(c).is_none());
    }
}
