//! Client connection slots
//!
//! This module holds the per-client network state of the match host:
//! - Connection status (connected, zombie, disconnected)
//! - The reliable channel to the client
//! - Timeout bookkeeping and the zombie grace window
//! - The set of players each connection brings into the match
//!
//! Slots live in a fixed-size pool so that a slot index stays a stable
//! handle for the lifetime of a connection.

use crate::channel::Channel;
use crate::socket::SocketId;
use log::{error, info};
use shared::{ClientPacket, PlayerId, ServerPacket, Version, MAX_CLIENTS};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How long a dropped connection keeps flushing reliable data.
pub const ZOMBIE_GRACE: Duration = Duration::from_secs(3);

pub type ServerChannel = Channel<ServerPacket, ClientPacket>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Zombie,
}

/// Where a connection's datagrams come from and go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// A remote client reached through one of the server sockets.
    Remote { addr: SocketAddr, socket: SocketId },
    /// The client running in the same process, reached through memory.
    Local,
}

#[derive(Debug)]
pub struct Connection {
    pub slot: usize,
    pub status: ConnectionStatus,
    pub channel: Option<ServerChannel>,
    pub endpoint: Option<Endpoint>,
    pub last_received_at: Instant,
    pub zombie_until: Instant,
    pub connected_at: Instant,
    pub client_version: Version,
    pub muted: bool,
    /// Weapons chosen and `ImReady` received for this match.
    pub game_ready: bool,
    pub lobby_ready: bool,
    pub owned_players: BTreeSet<PlayerId>,
}

impl Connection {
    fn new(slot: usize, now: Instant) -> Self {
        Self {
            slot,
            status: ConnectionStatus::Disconnected,
            channel: None,
            endpoint: None,
            last_received_at: now,
            zombie_until: now,
            connected_at: now,
            client_version: Version::current(),
            muted: false,
            game_ready: false,
            lobby_ready: false,
            owned_players: BTreeSet::new(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.endpoint == Some(Endpoint::Local)
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self.endpoint {
            Some(Endpoint::Remote { addr, .. }) => Some(addr),
            _ => None,
        }
    }

    /// Connected and silent for longer than `timeout`.
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.status == ConnectionStatus::Connected
            && now.saturating_duration_since(self.last_received_at) > timeout
    }

    pub fn zombie_expired(&self, now: Instant) -> bool {
        self.status == ConnectionStatus::Zombie && now > self.zombie_until
    }

    pub fn open(&mut self, endpoint: Endpoint, version: Version, now: Instant) {
        self.status = ConnectionStatus::Connected;
        self.channel = Some(Channel::new());
        self.endpoint = Some(endpoint);
        self.last_received_at = now;
        self.connected_at = now;
        self.client_version = version;
        self.muted = false;
        self.game_ready = false;
        self.lobby_ready = false;
        self.owned_players.clear();
    }

    pub fn enter_zombie(&mut self, now: Instant) {
        self.status = ConnectionStatus::Zombie;
        self.zombie_until = now + ZOMBIE_GRACE;
    }

    /// Releases the channel. Players must already be removed.
    pub fn close(&mut self) {
        if !self.owned_players.is_empty() {
            error!(
                "Connection {} closed while still owning players {:?}",
                self.slot, self.owned_players
            );
            self.owned_players.clear();
        }
        self.status = ConnectionStatus::Disconnected;
        self.channel = None;
        self.endpoint = None;
        info!("Connection {} is now free", self.slot);
    }

    pub fn send_reliable(&mut self, packet: ServerPacket) {
        if let Some(channel) = self.channel.as_mut() {
            channel.add_reliable(packet);
        }
    }

    pub fn debug_name(&self) -> String {
        match self.endpoint {
            Some(Endpoint::Local) => format!("local client {}", self.slot),
            Some(Endpoint::Remote { addr, .. }) => format!("client {} ({})", self.slot, addr),
            None => format!("client {} (disconnected)", self.slot),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionPool {
    connections: Vec<Connection>,
}

impl ConnectionPool {
    pub fn new(now: Instant) -> Self {
        Self {
            connections: (0..MAX_CLIENTS).map(|slot| Connection::new(slot, now)).collect(),
        }
    }

    /// Opens the first free slot. Returns `None` when all slots are busy.
    pub fn allocate(&mut self, endpoint: Endpoint, version: Version, now: Instant) -> Option<usize> {
        let connection = self
            .connections
            .iter_mut()
            .find(|c| c.status == ConnectionStatus::Disconnected)?;
        connection.open(endpoint, version, now);
        info!("{} connected", connection.debug_name());
        Some(connection.slot)
    }

    pub fn get(&self, slot: usize) -> Option<&Connection> {
        self.connections.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Connection> {
        self.connections.get_mut(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.iter_mut()
    }

    /// Matches a sender on both address and port.
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<usize> {
        self.connections
            .iter()
            .find(|c| c.status != ConnectionStatus::Disconnected && c.remote_addr() == Some(addr))
            .map(|c| c.slot)
    }

    pub fn local_slot(&self) -> Option<usize> {
        self.connections
            .iter()
            .find(|c| c.status != ConnectionStatus::Disconnected && c.is_local())
            .map(|c| c.slot)
    }

    pub fn count_connected(&self) -> usize {
        self.connections.iter().filter(|c| c.is_connected()).count()
    }

    /// Queues a reliable packet for every connected client except `except`.
    pub fn broadcast(&mut self, packet: &ServerPacket, except: Option<usize>) {
        for connection in self.connections.iter_mut() {
            if connection.is_connected() && Some(connection.slot) != except {
                connection.send_reliable(packet.clone());
            }
        }
    }
}
