//! The match host
//!
//! [`GameServer`] owns every piece of session state and is driven by
//! [`GameServer::frame`], once per game-loop iteration. Nothing here waits
//! on I/O: sockets are drained without blocking and directory requests
//! are polled.

use crate::assets::{AssetCache, AssetSource, FileAssets, LoadedGame};
use crate::ban_list::BanList;
use crate::config::{load_directory_list, ServerConfig};
use crate::connection::{ConnectionPool, ConnectionStatus, Endpoint};
use crate::directory::{HttpClient, HttpRegistration, ReqwestClient, UdpRegistration};
use crate::error::ServerError;
use crate::game_mode::{self, GameMode};
use crate::local::{LocalClient, LocalLink};
use crate::nat::NatTracker;
use crate::player::PlayerPool;
use crate::session::{IdleSimulation, Session, Simulation};
use crate::socket::{drain, DatagramSocket, SocketId};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::directory::Registration;
use shared::{
    decode_connectionless, encode_connectionless, is_out_of_band, ClientPacket,
    ConnectionlessPacket, DisconnectReason, JoinInfo, Lives, Phase, PlayerId, ServerPacket,
    TextKind, Version, MAX_SERVER_SOCKETS,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// Lobby changes are batched and sent at most this often.
const LOBBY_UPDATE_DELAY: Duration = Duration::from_millis(200);

/// Outstanding challenges; the oldest is replaced when full.
const MAX_CHALLENGES: usize = 1024;
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(30);

/// A challenge handed out to an address that has not connected yet.
#[derive(Debug, Clone, Copy)]
struct Challenge {
    id: u32,
    issued_at: Instant,
}

pub struct GameServer {
    pub(crate) config: ServerConfig,
    pub(crate) session: Session,
    pub(crate) connections: ConnectionPool,
    pub(crate) players: PlayerPool,
    pub(crate) game_mode: Box<dyn GameMode>,
    pub(crate) simulation: Box<dyn Simulation>,
    pub(crate) assets: AssetCache,
    pub(crate) loaded: Option<LoadedGame>,
    pub(crate) ban_list: BanList,
    pub(crate) sockets: Vec<Box<dyn DatagramSocket>>,
    pub(crate) port: u16,
    pub(crate) nat: NatTracker,
    pub(crate) http: HttpRegistration,
    pub(crate) udp: UdpRegistration,
    pub(crate) local: Option<LocalClient>,
    pub(crate) link: LocalLink,
    pub(crate) rng: StdRng,
    challenges: HashMap<SocketAddr, Challenge>,
    lobby_update_at: Option<Instant>,
    last_frame_at: Option<Instant>,
}

impl GameServer {
    /// Binds the main socket and the auxiliary directory sockets.
    ///
    /// When the configured port is taken the main socket falls back to a
    /// port picked by the system.
    pub async fn start(config: ServerConfig, now: Instant) -> Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port);
        let main = match UdpSocket::bind(&addr).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Could not open socket on {}: {}, trying a random port", addr, e);
                UdpSocket::bind(format!("{}:0", config.host))
                    .await
                    .map_err(ServerError::Bind)?
            }
        };

        let mut sockets: Vec<Box<dyn DatagramSocket>> = vec![Box::new(main)];
        for _ in 1..MAX_SERVER_SOCKETS {
            let socket = UdpSocket::bind(format!("{}:0", config.host))
                .await
                .map_err(ServerError::Bind)?;
            sockets.push(Box::new(socket));
        }
        Self::new(config, sockets, now)
    }

    /// Builds a server on already bound sockets. The first one is the
    /// main socket clients connect to.
    pub fn new(
        config: ServerConfig,
        sockets: Vec<Box<dyn DatagramSocket>>,
        now: Instant,
    ) -> Result<Self, ServerError> {
        let main = sockets.first().ok_or(ServerError::NotRunning)?;
        let port = main.local_addr()?.port();
        info!("Server listening on port {} with {} sockets", port, sockets.len());

        let http_client = ReqwestClient::new(config.http_proxy.as_deref())?;
        let http = HttpRegistration::new(
            load_directory_list(&config.master_servers_file, true),
            Box::new(http_client),
            now,
        );
        let udp = UdpRegistration::new(
            load_directory_list(&config.udp_master_servers_file, false),
            now,
        );

        let mut server = GameServer {
            session: Session::new(),
            connections: ConnectionPool::new(now),
            players: PlayerPool::new(),
            game_mode: game_mode::for_kind(config.game.game_mode),
            simulation: Box::new(IdleSimulation),
            assets: AssetCache::new(Box::new(FileAssets::new(
                &config.levels_dir,
                &config.mods_dir,
            ))),
            loaded: None,
            ban_list: BanList::load(&config.ban_list_file),
            sockets,
            port,
            nat: NatTracker::new(),
            http,
            udp,
            local: None,
            link: LocalLink::default(),
            rng: StdRng::from_entropy(),
            challenges: HashMap::new(),
            lobby_update_at: None,
            last_frame_at: None,
            config,
        };

        if !server.config.is_dedicated() {
            server.connect_local(now);
        }
        if server.config.register {
            server.register_server();
        }
        Ok(server)
    }

    pub fn with_assets(mut self, source: Box<dyn AssetSource>) -> Self {
        self.assets = AssetCache::new(source);
        self
    }

    pub fn with_simulation(mut self, simulation: Box<dyn Simulation>) -> Self {
        self.simulation = simulation;
        self
    }

    pub fn with_ban_list(mut self, ban_list: BanList) -> Self {
        self.ban_list = ban_list;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Replaces the HTTP client and restarts the registration pass.
    pub fn with_http_client(mut self, client: Box<dyn HttpClient>, now: Instant) -> Self {
        let directories = self.http.directories().to_vec();
        self.http = HttpRegistration::new(directories, client, now);
        if self.config.register {
            self.register_server();
        }
        self
    }

    pub fn with_directories(mut self, http: Vec<String>, udp: Vec<String>, now: Instant) -> Self {
        let client: Box<dyn HttpClient> = match ReqwestClient::new(self.config.http_proxy.as_deref()) {
            Ok(client) => Box::new(client),
            Err(e) => {
                error!("Could not build HTTP client: {}", e);
                return self;
            }
        };
        self.http = HttpRegistration::new(http, client, now);
        self.udp = UdpRegistration::new(udp, now);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn connections(&self) -> &ConnectionPool {
        &self.connections
    }

    pub fn players(&self) -> &PlayerPool {
        &self.players
    }

    pub fn players_mut(&mut self) -> &mut PlayerPool {
        &mut self.players
    }

    pub fn game_mode(&self) -> &dyn GameMode {
        self.game_mode.as_ref()
    }

    pub fn local_client(&self) -> Option<&LocalClient> {
        self.local.as_ref()
    }

    pub fn ban_list(&self) -> &BanList {
        &self.ban_list
    }

    pub fn nat(&self) -> &NatTracker {
        &self.nat
    }

    pub fn nat_mut(&mut self) -> &mut NatTracker {
        &mut self.nat
    }

    pub fn http_registration(&self) -> &HttpRegistration {
        &self.http
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Opens the local connection and brings in the host's players.
    fn connect_local(&mut self, now: Instant) {
        let Some(slot) = self
            .connections
            .allocate(Endpoint::Local, Version::current(), now)
        else {
            error!("No free slot for the local client");
            return;
        };
        let joins = self.config.host_players.clone();
        let ids: Vec<PlayerId> = joins
            .iter()
            .filter_map(|join| self.add_player(slot, join))
            .collect();
        // The host's players start on the first team
        for id in &ids {
            if let Some(player) = self.players.get_mut(*id) {
                player.team = 0;
            }
        }
        self.local = Some(LocalClient::new(ids));
    }

    /// Brings a new player into the pool for the connection in `slot`.
    pub fn add_player(&mut self, slot: usize, join: &JoinInfo) -> Option<PlayerId> {
        let settings = &self.config.game;
        let lives = if settings.lives == Lives::Unlimited
            || self.session.phase != Phase::Playing
            || self.players.all_have_full_lives(settings.lives)
        {
            settings.lives
        } else {
            Lives::Out
        };

        let team_count = self.game_mode.team_count();
        let random_team = settings.random_team_for_new_player;
        let team = if random_team > 0 && team_count > 1 {
            match self.players.first_empty_team(team_count) {
                Some(team) if team <= random_team => Some(team),
                _ => Some(self.rng.gen_range(0..=random_team.min(team_count - 1))),
            }
        } else {
            None
        };

        let Some(player) = self.players.allocate(slot, join) else {
            warn!("No free player slot for '{}'", join.name);
            return None;
        };
        player.lives = lives;
        if let Some(team) = team {
            player.team = team;
        }
        let id = player.id;
        info!("Player '{}' joined as {} on team {}", player.name, id, player.team);

        if let Some(connection) = self.connections.get_mut(slot) {
            connection.owned_players.insert(id);
        }
        Some(id)
    }

    /// One iteration of the game loop.
    pub fn frame(&mut self, now: Instant) {
        let dt = self
            .last_frame_at
            .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
        self.last_frame_at = Some(now);

        self.session.advance(dt);

        if self.config.register && !self.http.is_registered() {
            self.process_register(now);
        }
        self.send_lobby_updates(now);
        self.read_incoming(now);
        self.simulate_game(dt, now);
        self.check_timeouts(now);
        self.check_register(now);
        self.send_packets(now);

        // The local client runs its own frame right behind ours
        self.local_client_read(now);
        self.local_client_send(now);
    }

    pub(crate) fn schedule_lobby_update(&mut self, now: Instant) {
        if self.lobby_update_at.is_none() {
            self.lobby_update_at = Some(now);
        }
    }

    fn send_lobby_updates(&mut self, now: Instant) {
        let Some(at) = self.lobby_update_at else {
            return;
        };
        if now.saturating_duration_since(at) < LOBBY_UPDATE_DELAY {
            return;
        }
        self.lobby_update_at = None;
        let packet = ServerPacket::UpdateLobby {
            name: self.config.name.clone(),
            max_players: self.config.game.max_players,
            players: self.players.iter_used().map(|p| p.lobby_info()).collect(),
        };
        self.connections.broadcast(&packet, None);
    }

    /// Drains every socket and the local link, handing each packet on.
    pub fn read_incoming(&mut self, now: Instant) {
        let mut datagrams = Vec::new();
        for (index, socket) in self.sockets.iter().enumerate() {
            datagrams.extend(
                drain(socket.as_ref())
                    .into_iter()
                    .map(|(data, from)| (data, from, SocketId::Server(index))),
            );
        }
        datagrams.extend(
            self.nat
                .read_incoming(now)
                .into_iter()
                .map(|d| (d.data, d.from, d.socket)),
        );

        for (data, from, socket) in datagrams {
            self.handle_datagram(&data, from, socket, now);
        }
        self.read_local(now);
    }

    pub(crate) fn read_local(&mut self, now: Instant) {
        let Some(slot) = self.connections.local_slot() else {
            self.link.to_server.clear();
            return;
        };
        while let Some(data) = self.link.to_server.pop_front() {
            self.process_channel_datagram(slot, &data, now);
        }
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, socket: SocketId, now: Instant) {
        if is_out_of_band(data) {
            match decode_connectionless(data) {
                Ok(packets) => {
                    for packet in packets {
                        self.handle_connectionless(packet, from, socket, now);
                    }
                }
                Err(e) => debug!("Bad connectionless datagram from {}: {}", from, e),
            }
            return;
        }

        match self.connections.find_by_addr(from) {
            Some(slot) => self.process_channel_datagram(slot, data, now),
            None => debug!("Ignoring datagram from unknown sender {}", from),
        }
    }

    fn process_channel_datagram(&mut self, slot: usize, data: &[u8], now: Instant) {
        let Some(connection) = self.connections.get_mut(slot) else {
            return;
        };
        let Some(channel) = connection.channel.as_mut() else {
            return;
        };
        let packets = match channel.process(data, now) {
            Ok(packets) => packets,
            Err(e) => {
                warn!("Bad datagram from {}: {}", connection.debug_name(), e);
                return;
            }
        };
        connection.last_received_at = now;

        for packet in packets {
            // A packet may have dropped the connection already
            let connected = self
                .connections
                .get(slot)
                .is_some_and(|c| c.status == ConnectionStatus::Connected);
            if !connected {
                debug!("Ignoring packet from zombie connection {}", slot);
                continue;
            }
            self.dispatch(slot, packet, now);
        }
    }

    fn dispatch(&mut self, slot: usize, packet: ClientPacket, now: Instant) {
        match packet {
            ClientPacket::ImReady { weapons } => self.handle_im_ready(slot, weapons, now),
            ClientPacket::UpdateLobby { ready } => {
                if self.session.phase != Phase::Lobby {
                    debug!("Lobby update from {} outside the lobby", slot);
                    return;
                }
                if let Some(connection) = self.connections.get_mut(slot) {
                    connection.lobby_ready = ready;
                }
                self.schedule_lobby_update(now);
            }
            ClientPacket::Chat { text } => self.handle_chat(slot, text),
            ClientPacket::KeepAlive => {}
            ClientPacket::Disconnect => {
                self.drop_client(slot, DisconnectReason::Quit, None, now);
            }
        }
    }

    fn handle_chat(&mut self, slot: usize, text: String) {
        let Some(connection) = self.connections.get(slot) else {
            return;
        };
        if connection.muted {
            debug!("Dropping chat from muted {}", connection.debug_name());
            return;
        }
        let sender = connection
            .owned_players
            .iter()
            .next()
            .and_then(|id| self.players.get(*id))
            .map_or_else(|| connection.debug_name(), |p| p.name.clone());
        let text = format!("{}: {}", sender, text);
        info!("{}", text);
        self.connections.broadcast(
            &ServerPacket::Text {
                text,
                kind: TextKind::Chat,
            },
            None,
        );
    }

    fn handle_im_ready(&mut self, slot: usize, weapons: Vec<(PlayerId, Vec<u8>)>, now: Instant) {
        if self.session.phase == Phase::Lobby {
            warn!("ImReady from {} while in the lobby", slot);
            return;
        }
        let Some(connection) = self.connections.get(slot) else {
            return;
        };
        if connection.game_ready {
            debug!("{} is already ready", connection.debug_name());
            return;
        }
        let is_local = connection.is_local();
        let owned = connection.owned_players.clone();

        for (id, mut chosen) in weapons {
            if !owned.contains(&id) {
                warn!("Connection {} sent weapons for foreign player {}", slot, id);
                continue;
            }
            chosen.truncate(shared::WEAPON_SLOTS);
            if let Some(player) = self.players.get_mut(id) {
                player.weapons = chosen.clone();
                player.weapons_ready = true;
            }
            self.connections.broadcast(
                &ServerPacket::PlayerWeapons { id, weapons: chosen },
                Some(slot),
            );
        }
        if let Some(connection) = self.connections.get_mut(slot) {
            connection.game_ready = true;
        }

        if is_local && self.config.game.same_weapons_as_host {
            self.clone_host_weapons();
        }

        if self.session.phase == Phase::Playing {
            self.begin_match(Some(slot), now);
        } else {
            self.check_ready_clients(now);
        }
    }

    fn add_challenge(&mut self, from: SocketAddr, id: u32, now: Instant) {
        if self.challenges.len() >= MAX_CHALLENGES && !self.challenges.contains_key(&from) {
            let oldest = self
                .challenges
                .iter()
                .min_by_key(|(_, c)| c.issued_at)
                .map(|(addr, _)| *addr);
            if let Some(addr) = oldest {
                debug!("Challenge table full, forgetting {}", addr);
                self.challenges.remove(&addr);
            }
        }
        self.challenges.insert(from, Challenge { id, issued_at: now });
    }

    /// Forgets challenges nobody answered in time.
    pub(crate) fn expire_challenges(&mut self, now: Instant) {
        self.challenges
            .retain(|_, c| now.saturating_duration_since(c.issued_at) < CHALLENGE_TIMEOUT);
    }

    fn refuse(&self, to: SocketAddr, socket: SocketId, reason: &str) {
        info!("Refusing connection from {}: {}", to, reason);
        self.send_connectionless(
            &ConnectionlessPacket::ConnectionRefused {
                reason: reason.to_string(),
            },
            to,
            socket,
        );
    }

    fn handle_connectionless(
        &mut self,
        packet: ConnectionlessPacket,
        from: SocketAddr,
        socket: SocketId,
        now: Instant,
    ) {
        match packet {
            ConnectionlessPacket::GetChallenge { version } => {
                let id: u32 = self.rng.gen();
                debug!("Challenge {} for {} ({})", id, from, version);
                self.add_challenge(from, id, now);
                self.send_connectionless(&ConnectionlessPacket::Challenge { id }, from, socket);
            }
            ConnectionlessPacket::Connect {
                version,
                challenge,
                players,
            } => self.handle_connect(version, challenge, players, from, socket, now),
            ConnectionlessPacket::Ping => {
                self.send_connectionless(&ConnectionlessPacket::Pong, from, socket);
            }
            ConnectionlessPacket::Query => {
                let info = ConnectionlessPacket::QueryInfo {
                    name: self.config.name.clone(),
                    players: self.players.count_used() as u8,
                    max_players: self.config.game.max_players,
                    phase: self.session.phase,
                };
                self.send_connectionless(&info, from, socket);
            }
            ConnectionlessPacket::DummyPacket => {}
            other => debug!("Unexpected connectionless packet from {}: {:?}", from, other),
        }
    }

    fn handle_connect(
        &mut self,
        version: Version,
        challenge: u32,
        joins: Vec<JoinInfo>,
        from: SocketAddr,
        socket: SocketId,
        now: Instant,
    ) {
        // A retransmitted connect from a client we already accepted
        if let Some(slot) = self.connections.find_by_addr(from) {
            if let Some(connection) = self.connections.get(slot) {
                if connection.is_connected() {
                    let accepted = ConnectionlessPacket::ConnectionAccepted {
                        slot: slot as u8,
                        player_ids: connection.owned_players.iter().copied().collect(),
                    };
                    self.send_connectionless(&accepted, from, socket);
                }
            }
            return;
        }

        if self.ban_list.is_banned(from.ip()) {
            self.refuse(from, socket, "You are banned on this server");
            return;
        }
        if self.challenges.get(&from).map(|c| c.id) != Some(challenge) {
            self.refuse(from, socket, "Bad connection verification of client");
            return;
        }
        if joins.is_empty() {
            self.refuse(from, socket, "No players");
            return;
        }
        if self.session.phase != Phase::Lobby && !self.config.game.allow_connect_during_game {
            self.refuse(from, socket, "Game has already started");
            return;
        }
        if self.players.count_used() + joins.len() > self.config.game.max_players as usize {
            self.refuse(from, socket, "Server is full");
            return;
        }
        let Some(slot) = self.connections.allocate(
            Endpoint::Remote {
                addr: from,
                socket,
            },
            version,
            now,
        ) else {
            self.refuse(from, socket, "Server is full");
            return;
        };
        self.challenges.remove(&from);

        let ids: Vec<PlayerId> = joins
            .iter()
            .filter_map(|join| self.add_player(slot, join))
            .collect();
        self.send_connectionless(
            &ConnectionlessPacket::ConnectionAccepted {
                slot: slot as u8,
                player_ids: ids.clone(),
            },
            from,
            socket,
        );

        if self.session.phase != Phase::Lobby {
            self.join_running_match(slot, &ids);
        }

        self.check_version_compatibility(slot, true, true, now);
        self.schedule_lobby_update(now);
    }

    /// Gets a connection that joined after `start_game` up to speed.
    fn join_running_match(&mut self, slot: usize, ids: &[PlayerId]) {
        for id in ids {
            if let Some(player) = self.players.get(*id) {
                let info = ServerPacket::PlayerInfo(player.lobby_info());
                self.connections.broadcast(&info, Some(slot));
            }
        }
        if let Some(prepare) = self.prepare_packet() {
            if let Some(connection) = self.connections.get_mut(slot) {
                connection.send_reliable(prepare);
            }
        }
        for id in ids {
            self.prepare_player(*id);
        }
    }

    fn send_connectionless(&self, packet: &ConnectionlessPacket, to: SocketAddr, socket: SocketId) {
        let data = match encode_connectionless(packet) {
            Ok(data) => data,
            Err(e) => {
                error!("Could not encode {:?}: {}", packet, e);
                return;
            }
        };
        match resolve_socket(&self.sockets, &self.nat, socket) {
            Some(socket) => {
                if let Err(e) = socket.send_to(&data, to) {
                    warn!("Could not send to {}: {}", to, e);
                }
            }
            None => warn!("No socket to answer {} on", to),
        }
    }

    /// Transmits this tick's datagram on every open channel.
    pub fn send_packets(&mut self, now: Instant) {
        for connection in self.connections.iter_mut() {
            if connection.status == ConnectionStatus::Disconnected {
                continue;
            }
            let (Some(channel), Some(endpoint)) = (connection.channel.as_mut(), connection.endpoint)
            else {
                continue;
            };
            let data = match channel.transmit(&[], now) {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    error!("Could not encode frame for connection {}: {}", connection.slot, e);
                    continue;
                }
            };
            match endpoint {
                Endpoint::Local => self.link.to_client.push_back(data),
                Endpoint::Remote { addr, socket } => {
                    match resolve_socket(&self.sockets, &self.nat, socket) {
                        Some(socket) => {
                            if let Err(e) = socket.send_to(&data, addr) {
                                warn!("Could not send to {}: {}", addr, e);
                            }
                        }
                        None => warn!("Socket for {} is gone", addr),
                    }
                }
            }
        }
    }

    fn registration_ip(&self) -> IpAddr {
        self.sockets
            .first()
            .and_then(|s| s.local_addr().ok())
            .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |addr| addr.ip())
    }

    fn registration(&self) -> Registration {
        Registration {
            name: self.config.name.clone(),
            players: self.players.count_used() as u8,
            max_players: self.config.game.max_players,
            phase: self.session.phase,
            version: Version::current(),
            allows_join_during_game: self.config.game.allow_connect_during_game,
        }
    }

    /// Starts a fresh HTTP registration pass.
    pub fn register_server(&mut self) {
        let ip = self.registration_ip();
        self.http.register(self.port, ip);
    }

    pub fn process_register(&mut self, now: Instant) {
        if let Some(message) = self.http.process(now) {
            if let Some(local) = self.local.as_mut() {
                local.notify(message);
            }
        }
    }

    pub fn register_server_udp(&mut self, now: Instant) {
        if !self.config.register {
            return;
        }
        let registration = self.registration();
        self.udp.register(&self.sockets, &registration, now);
    }

    pub fn check_register(&mut self, now: Instant) {
        if !self.config.register {
            return;
        }
        let ip = self.registration_ip();
        self.http.check(now, self.port, ip);
        let registration = self.registration();
        self.udp.check(&self.sockets, &registration, now);
    }

    /// Withdraws the match from all directories. Returns true if HTTP
    /// deregistration was started and needs [`Self::process_deregister`].
    pub fn deregister_server(&mut self, now: Instant) -> bool {
        if !self.config.register {
            return false;
        }
        self.udp.deregister(&self.sockets, now);
        let ip = self.registration_ip();
        self.http.deregister(self.port, ip)
    }

    pub fn process_deregister(&mut self) -> bool {
        self.http.process_deregister()
    }

    /// Tells every remote client the server is going away and starts
    /// deregistration.
    pub fn shutdown(&mut self, now: Instant) -> bool {
        info!("Shutting down server");
        let message = ServerPacket::Dropped {
            message: "The server has shut down".to_string(),
        };
        for connection in self.connections.iter_mut() {
            if connection.is_connected() && !connection.is_local() {
                connection.send_reliable(message.clone());
            }
        }
        self.send_packets(now);
        self.deregister_server(now)
    }
}

/// Finds the socket a datagram to `id` goes out on. NAT entries that
/// have been closed fall back to the main socket.
fn resolve_socket<'a>(
    sockets: &'a [Box<dyn DatagramSocket>],
    nat: &'a NatTracker,
    id: SocketId,
) -> Option<&'a dyn DatagramSocket> {
    match id {
        SocketId::Server(index) => sockets.get(index).map(|s| s.as_ref()),
        SocketId::Nat { entry, path } => nat
            .socket(entry, path)
            .or_else(|| sockets.first().map(|s| s.as_ref())),
    }
}
