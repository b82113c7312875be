//! Dropping, kicking, banning and muting, plus the per-tick timeout sweep

use crate::connection::ConnectionStatus;
use crate::server::GameServer;
use crate::texts::{replace_max, third_person, with_player, NONE_TEXT};
use log::{debug, info, warn};
use shared::{DisconnectReason, Phase, PlayerId, ServerPacket, TextKind};
use std::time::{Duration, Instant};

const WEAPONS_TOO_LONG: &str = "selected weapons too long";

impl GameServer {
    fn broadcast_text(&mut self, text: String, kind: TextKind, except: Option<usize>) {
        if text == NONE_TEXT {
            return;
        }
        self.connections
            .broadcast(&ServerPacket::Text { text, kind }, except);
    }

    /// What everybody else reads when `name` leaves for `reason`.
    fn drop_announcement(&self, name: &str, reason: DisconnectReason, text: Option<&str>) -> String {
        let texts = &self.config.texts;
        let (template, with_reason) = match (reason, text) {
            (DisconnectReason::Quit, _) => (&texts.has_left, None),
            (DisconnectReason::Timeout, _) => (&texts.has_timed_out, None),
            (DisconnectReason::Kick, None) => (&texts.has_been_kicked, None),
            (DisconnectReason::Kick, Some(r)) => (&texts.has_been_kicked_reason, Some(r)),
            (DisconnectReason::Ban, None) => (&texts.has_been_banned, None),
            (DisconnectReason::Ban, Some(r)) => (&texts.has_been_banned_reason, Some(r)),
        };
        let text = with_player(template, name);
        match with_reason {
            Some(r) => third_person(&replace_max(&text, "<reason>", r, 5)),
            None => text,
        }
    }

    /// What the dropped client itself is told.
    fn drop_message(&self, reason: DisconnectReason, text: Option<&str>) -> String {
        let texts = &self.config.texts;
        match (reason, text) {
            (DisconnectReason::Kick, Some(r)) => replace_max(&texts.kicked_you_reason, "<reason>", r, 1),
            (DisconnectReason::Ban, Some(r)) => replace_max(&texts.banned_you_reason, "<reason>", r, 1),
            (_, Some(r)) => r.to_string(),
            (DisconnectReason::Quit, None) => texts.you_quit.clone(),
            (DisconnectReason::Timeout, None) => texts.you_timed_out.clone(),
            (DisconnectReason::Kick, None) => texts.kicked_you.clone(),
            (DisconnectReason::Ban, None) => texts.banned_you.clone(),
        }
    }

    /// Removes a remote client from the match.
    ///
    /// The connection lingers as a zombie for a few seconds so that the
    /// reliable `Dropped` packet still gets through.
    pub fn drop_client(
        &mut self,
        slot: usize,
        reason: DisconnectReason,
        text: Option<&str>,
        now: Instant,
    ) {
        let Some(connection) = self.connections.get(slot) else {
            warn!("drop_client: no connection in slot {}", slot);
            return;
        };
        if connection.is_local() {
            warn!(
                "drop_client: an attempt to drop the local client ({:?}: {:?}) was ignored",
                reason, text
            );
            return;
        }
        if connection.status != ConnectionStatus::Connected {
            warn!(
                "drop_client: {} is already {:?}",
                connection.debug_name(),
                connection.status
            );
            return;
        }
        info!("Dropping {} ({:?}: {:?})", connection.debug_name(), reason, text);

        let names: Vec<String> = connection
            .owned_players
            .iter()
            .filter_map(|id| self.players.get(*id))
            .map(|p| p.name.clone())
            .collect();
        for name in names {
            let announcement = self.drop_announcement(&name, reason, text);
            self.broadcast_text(announcement, TextKind::Network, Some(slot));
        }
        let message = self.drop_message(reason, text);

        self.remove_client_players(slot, now);

        if let Some(connection) = self.connections.get_mut(slot) {
            connection.enter_zombie(now);
            connection.send_reliable(ServerPacket::Dropped { message });
        }
        self.schedule_lobby_update(now);
        self.check_ready_clients(now);
    }

    /// Takes every player of a connection out of the match.
    pub(crate) fn remove_client_players(&mut self, slot: usize, now: Instant) {
        let Some(connection) = self.connections.get_mut(slot) else {
            return;
        };
        connection.muted = false;
        let ids: Vec<PlayerId> = connection.owned_players.iter().copied().collect();
        self.remove_players(slot, &ids, now);
    }

    pub(crate) fn remove_players(&mut self, slot: usize, ids: &[PlayerId], now: Instant) {
        let mut removed = Vec::new();
        for &id in ids {
            if let Some(connection) = self.connections.get_mut(slot) {
                connection.owned_players.remove(&id);
            }
            let Some(player) = self.players.get(id) else {
                warn!("Player {} of connection {} is not in use", id, slot);
                continue;
            };
            info!("Player left: {} (id {})", player.name, id);
            self.game_mode.on_drop(player);
            self.players.release(id);
            removed.push(id);
        }
        if removed.is_empty() {
            return;
        }

        let out = ServerPacket::PlayersOut { ids: removed };
        self.connections.broadcast(&out, Some(slot));
        self.recheck_game(now);
    }

    /// The first player of the co-located client, if we host one.
    fn host_player(&self) -> Option<PlayerId> {
        if self.config.is_dedicated() {
            return None;
        }
        self.local.as_ref()?.player_ids().first().copied()
    }

    /// Removes one player of the local client, leaving its connection up.
    fn remove_local_player(&mut self, id: PlayerId, template: &str, reason: Option<&str>, now: Instant) {
        self.sync_server_and_client(now);

        // The sync may already have taken the player out
        if !self.local.as_ref().is_some_and(|l| l.owns(id)) {
            debug!("Local player {} is already gone", id);
            return;
        }
        let Some(name) = self.players.get(id).map(|p| p.name.clone()) else {
            return;
        };
        let mut text = with_player(template, &name);
        if let Some(reason) = reason {
            text = replace_max(&text, "<reason>", reason, 1);
        }
        self.broadcast_text(text, TextKind::Network, None);
        info!("Local player {} ('{}') removed ({:?})", id, name, reason);

        if let Some(local) = self.local.as_mut() {
            local.remove_player(id);
        }
        if let Some(slot) = self.connections.local_slot() {
            self.remove_players(slot, &[id], now);
        }
        self.recheck_game(now);
    }

    fn kick_or_ban(&mut self, id: PlayerId, reason: Option<&str>, ban: bool, now: Instant) {
        let verb = if ban { "ban" } else { "kick" };
        if self.host_player() == Some(id) {
            warn!("You can't {} yourself!", verb);
            return;
        }
        let Some(player) = self.players.get(id) else {
            info!("{}: could not find player with id {}", verb, id);
            return;
        };
        let name = player.name.clone();
        let Some(slot) = player.owner else {
            warn!("{}: player {} has no connection", verb, id);
            return;
        };
        let Some(connection) = self.connections.get(slot) else {
            return;
        };

        if connection.is_local() {
            if !self.local.as_ref().is_some_and(|l| l.owns(id)) {
                warn!("Player {} of the local client cannot be removed, it does not own it", id);
                return;
            }
            let texts = &self.config.texts;
            let template = match (ban, reason.is_some()) {
                (false, false) => texts.has_been_kicked.clone(),
                (false, true) => texts.has_been_kicked_reason.clone(),
                (true, false) => texts.has_been_banned.clone(),
                (true, true) => texts.has_been_banned_reason.clone(),
            };
            self.remove_local_player(id, &template, reason, now);
            return;
        }

        if ban {
            match connection.remote_addr() {
                Some(addr) => self.ban_list.add(addr.ip(), &name),
                None => warn!("{} has no address to ban", connection.debug_name()),
            }
            self.drop_client(slot, DisconnectReason::Ban, reason, now);
        } else {
            self.drop_client(slot, DisconnectReason::Kick, reason, now);
        }
    }

    /// Kicks the connection owning player `id`.
    pub fn kick_player(&mut self, id: PlayerId, reason: Option<&str>, now: Instant) {
        self.kick_or_ban(id, reason, false, now);
    }

    pub fn kick_player_by_name(&mut self, name: &str, reason: Option<&str>, now: Instant) {
        match self.players.find_by_name(name) {
            Some(id) => self.kick_player(id, reason, now),
            None => info!("kick: could not find player '{}'", name),
        }
    }

    /// Bans the address of the connection owning player `id` and drops it.
    pub fn ban_player(&mut self, id: PlayerId, reason: Option<&str>, now: Instant) {
        self.kick_or_ban(id, reason, true, now);
    }

    pub fn ban_player_by_name(&mut self, name: &str, reason: Option<&str>, now: Instant) {
        match self.players.find_by_name(name) {
            Some(id) => self.ban_player(id, reason, now),
            None => info!("ban: could not find player '{}'", name),
        }
    }

    fn set_muted(&mut self, id: PlayerId, muted: bool) {
        let Some(player) = self.players.get(id) else {
            info!("Could not find player with id {}", id);
            return;
        };
        let name = player.name.clone();
        let owner = player.owner;
        let template = if muted {
            &self.config.texts.has_been_muted
        } else {
            &self.config.texts.has_been_unmuted
        };
        let text = with_player(template, &name);

        // Local players are only told about it
        let local_owned = self.local.as_ref().is_some_and(|l| l.owns(id));
        if !local_owned {
            if let Some(connection) = owner.and_then(|slot| self.connections.get_mut(slot)) {
                connection.muted = muted;
            }
        }
        self.broadcast_text(text, TextKind::Network, None);
    }

    pub fn mute_player(&mut self, id: PlayerId) {
        self.set_muted(id, true);
    }

    pub fn unmute_player(&mut self, id: PlayerId) {
        self.set_muted(id, false);
    }

    pub fn mute_player_by_name(&mut self, name: &str) {
        match self.players.find_by_name(name) {
            Some(id) => self.mute_player(id),
            None => info!("mute: could not find player '{}'", name),
        }
    }

    pub fn unmute_player_by_name(&mut self, name: &str) {
        match self.players.find_by_name(name) {
            Some(id) => self.unmute_player(id),
            None => info!("unmute: could not find player '{}'", name),
        }
    }

    /// Drops silent clients and frees zombies whose grace period ran out.
    pub fn check_timeouts(&mut self, now: Instant) {
        self.nat.check_timeouts(now);
        self.expire_challenges(now);

        let timeout = self.config.connection_timeout();
        let mut timed_out = Vec::new();
        let mut expired = Vec::new();
        for connection in self.connections.iter() {
            if connection.status == ConnectionStatus::Disconnected || connection.is_local() {
                continue;
            }
            if connection.is_timed_out(now, timeout) {
                timed_out.push(connection.slot);
            } else if connection.zombie_expired(now) {
                expired.push(connection.slot);
            }
        }

        for slot in timed_out {
            info!("Client {} timed out", slot);
            self.drop_client(slot, DisconnectReason::Timeout, None, now);
        }
        for slot in expired {
            if let Some(connection) = self.connections.get_mut(slot) {
                connection.close();
            }
        }

        self.check_weapon_selection_time(now);
    }

    /// Warns about and enforces the weapon selection deadline.
    pub fn check_weapon_selection_time(&mut self, now: Instant) {
        if self.session.phase != Phase::WeaponSelection
            || self.server_chooses_weapons()
            || self.config.game.features.immediate_start
        {
            return;
        }
        let Some(started) = self.session.weapon_selection_started_at else {
            return;
        };
        let max_time = Duration::from_secs(self.config.game.weapon_selection_max_time as u64);

        let time_left =
            max_time.as_secs_f32() - now.saturating_duration_since(started).as_secs_f32();
        if let Some(seconds) = self.session.weapon_selection_warning(time_left) {
            let tail = if seconds <= 5 {
                ", hurry or you'll be kicked."
            } else {
                "."
            };
            let text = format!("You have {} seconds to select your weapons{}", seconds, tail);
            self.broadcast_text(text, TextKind::Notice, None);
        }

        let late: Vec<usize> = self
            .connections
            .iter()
            .filter(|c| c.is_connected() && !c.game_ready)
            .filter(|c| now > started.max(c.connected_at) + max_time)
            .map(|c| c.slot)
            .collect();

        let weapon_count = self
            .loaded
            .as_ref()
            .map_or(1, |loaded| loaded.ruleset.weapon_count());
        for slot in late {
            let Some(connection) = self.connections.get(slot) else {
                continue;
            };
            if !connection.is_local() {
                info!("{} selected weapons too long", connection.debug_name());
                self.drop_client(slot, DisconnectReason::Kick, Some(WEAPONS_TOO_LONG), now);
                continue;
            }

            // The host cannot be kicked, so it gets random weapons instead
            let ids: Vec<PlayerId> = connection.owned_players.iter().copied().collect();
            for id in ids {
                let Some(player) = self.players.get_mut(id) else {
                    continue;
                };
                if player.weapons_ready {
                    continue;
                }
                player.randomize_weapons(&mut self.rng, weapon_count);
                player.weapons_ready = true;
                if let Some(local) = self.local.as_mut() {
                    local.force_weapons(id, player.weapons.clone());
                }
            }
        }
        self.check_ready_clients(now);
    }
}

#[cfg(test)]
mod tests {
    use crate::assets::MemoryAssets;
    use crate::channel::Channel;
    use crate::config::ServerConfig;
    use crate::connection::{ConnectionStatus, Endpoint, ZOMBIE_GRACE};
    use crate::local::ClientChannel;
    use crate::server::GameServer;
    use crate::socket::{DatagramSocket, LoopbackNetwork, SocketId};
    use shared::{DisconnectReason, JoinInfo, Phase, ServerPacket, TextKind, Version};
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    fn server(host: &[&str], now: Instant) -> GameServer {
        let mut config = ServerConfig::default();
        config.host_players = host
            .iter()
            .map(|name| JoinInfo {
                name: name.to_string(),
                team: 0,
                is_bot: false,
            })
            .collect();
        config.game.weapon_selection_max_time = 100;
        let net = LoopbackNetwork::new();
        let sockets: Vec<Box<dyn DatagramSocket>> =
            vec![Box::new(net.bind(SocketAddr::from(([127, 0, 0, 1], 23400))))];
        GameServer::new(config, sockets, now)
            .unwrap()
            .with_assets(Box::new(
                MemoryAssets::new()
                    .with_map("CastleStrike.lxl", 10)
                    .with_ruleset("Classic", &["Bazooka"]),
            ))
    }

    fn join(server: &mut GameServer, port: u16, name: &str, now: Instant) -> usize {
        let endpoint = Endpoint::Remote {
            addr: SocketAddr::from(([10, 0, 0, 1], port)),
            socket: SocketId::Server(0),
        };
        let slot = server
            .connections
            .allocate(endpoint, Version::current(), now)
            .unwrap();
        let info = JoinInfo {
            name: name.into(),
            team: 0,
            is_bot: false,
        };
        server.add_player(slot, &info).unwrap();
        slot
    }

    fn delivered(server: &mut GameServer, slot: usize, now: Instant) -> Vec<ServerPacket> {
        let mut client: ClientChannel = Channel::new();
        let channel = server.connections.get_mut(slot).unwrap().channel.as_mut().unwrap();
        match channel.transmit(&[], now).unwrap() {
            Some(data) => client.process(&data, now).unwrap(),
            None => Vec::new(),
        }
    }

    fn network_texts(packets: &[ServerPacket]) -> Vec<String> {
        packets
            .iter()
            .filter_map(|p| match p {
                ServerPacket::Text { text, kind: TextKind::Network } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_kick_with_reason_rewrites_pronouns() {
        let now = Instant::now();
        let mut server = server(&[], now);
        let target = join(&mut server, 5000, "Bob", now);
        let witness = join(&mut server, 5001, "Eve", now);

        server.kick_player(0, Some("you spammed your chat"), now);

        let texts = network_texts(&delivered(&mut server, witness, now));
        assert_eq!(texts, ["Bob has been kicked out because they spammed their chat"]);

        let to_target = delivered(&mut server, target, now);
        assert!(to_target.contains(&ServerPacket::Dropped {
            message: "You have been kicked: you spammed your chat".into()
        }));
        assert!(network_texts(&to_target).is_empty());

        let connection = server.connections().get(target).unwrap();
        assert_eq!(connection.status, ConnectionStatus::Zombie);
        assert!(connection.owned_players.is_empty());
        assert!(server.players().get(0).is_none());
    }

    #[test]
    fn test_drop_twice_is_harmless() {
        let now = Instant::now();
        let mut server = server(&[], now);
        let slot = join(&mut server, 5000, "Bob", now);

        server.drop_client(slot, DisconnectReason::Quit, None, now);
        server.drop_client(slot, DisconnectReason::Quit, None, now);
        assert_eq!(
            server.connections().get(slot).unwrap().status,
            ConnectionStatus::Zombie
        );
    }

    #[test]
    fn test_none_template_is_not_sent() {
        let now = Instant::now();
        let mut server = server(&[], now);
        server.config_mut().texts.has_left = "<none>".into();
        let target = join(&mut server, 5000, "Bob", now);
        let witness = join(&mut server, 5001, "Eve", now);

        server.drop_client(target, shared::DisconnectReason::Quit, None, now);
        let packets = delivered(&mut server, witness, now);
        assert!(network_texts(&packets).is_empty());
        assert!(packets.contains(&ServerPacket::PlayersOut { ids: vec![0] }));
    }

    #[test]
    fn test_local_client_cannot_kick_itself() {
        let now = Instant::now();
        let mut server = server(&["Host"], now);
        let local = server.connections().local_slot().unwrap();

        server.kick_player(0, None, now);
        server.ban_player_by_name("host", None, now);

        let connection = server.connections().get(local).unwrap();
        assert_eq!(connection.status, ConnectionStatus::Connected);
        assert!(connection.owned_players.contains(&0));
        assert!(server.ban_list().is_empty());

        server.drop_client(local, shared::DisconnectReason::Kick, None, now);
        assert!(server.connections().get(local).unwrap().is_connected());
    }

    #[test]
    fn test_kick_second_local_player() {
        let now = Instant::now();
        let mut server = server(&["Host", "Sidekick"], now);
        let local = server.connections().local_slot().unwrap();

        server.kick_player(1, None, now);
        assert!(server.players().get(1).is_none());
        assert!(!server.local_client().unwrap().owns(1));
        assert!(server.connections().get(local).unwrap().is_connected());

        server.sync_server_and_client(now);
        assert!(server
            .local_client()
            .unwrap()
            .chat_box()
            .contains(&"Sidekick has been kicked out".to_string()));
    }

    #[test]
    fn test_ban_records_address() {
        let now = Instant::now();
        let mut server = server(&[], now);
        join(&mut server, 5000, "Bob", now);
        server.ban_player_by_name("BOB", Some("cheating"), now);
        assert!(server.ban_list().is_banned("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_mute_and_unmute() {
        let now = Instant::now();
        let mut server = server(&[], now);
        let slot = join(&mut server, 5000, "Bob", now);

        server.mute_player(0);
        assert!(server.connections().get(slot).unwrap().muted);
        server.unmute_player_by_name("bob");
        assert!(!server.connections().get(slot).unwrap().muted);
        server.mute_player_by_name("Bob");
        assert!(server.connections().get(slot).unwrap().muted);
        server.mute_player(17);
    }

    #[test]
    fn test_timeout_then_zombie_then_free() {
        let now = Instant::now();
        let mut server = server(&[], now);
        let slot = join(&mut server, 5000, "Bob", now);
        let timeout = server.config().connection_timeout();

        server.check_timeouts(now + timeout);
        assert!(server.connections().get(slot).unwrap().is_connected());

        let dropped_at = now + timeout + Duration::from_secs(1);
        server.check_timeouts(dropped_at);
        assert_eq!(
            server.connections().get(slot).unwrap().status,
            ConnectionStatus::Zombie
        );

        server.check_timeouts(dropped_at + ZOMBIE_GRACE + Duration::from_millis(1));
        let connection = server.connections().get(slot).unwrap();
        assert_eq!(connection.status, ConnectionStatus::Disconnected);
        assert!(connection.owned_players.is_empty());
        assert!(connection.channel.is_none());
    }

    #[test]
    fn test_weapon_selection_warnings_descend() {
        let now = Instant::now();
        let mut server = server(&[], now);
        let slot = join(&mut server, 5000, "Bob", now);
        server.start_game(now).unwrap();
        delivered(&mut server, slot, now);

        let mut warnings = Vec::new();
        for elapsed in [39.0, 41.0, 71.0, 91.0, 96.0, 97.0] {
            let at = now + Duration::from_secs_f32(elapsed);
            server.connections.get_mut(slot).unwrap().last_received_at = at;
            server.check_weapon_selection_time(at);
            for packet in delivered(&mut server, slot, at) {
                if let ServerPacket::Text { text, kind: TextKind::Notice } = packet {
                    if !warnings.contains(&text) {
                        warnings.push(text);
                    }
                }
            }
        }
        assert_eq!(
            warnings,
            [
                "You have 60 seconds to select your weapons.",
                "You have 30 seconds to select your weapons.",
                "You have 10 seconds to select your weapons.",
                "You have 5 seconds to select your weapons, hurry or you'll be kicked.",
            ]
        );
    }

    #[test]
    fn test_late_remote_client_is_kicked() {
        let now = Instant::now();
        let mut server = server(&[], now);
        let slot = join(&mut server, 5000, "Bob", now);
        server.start_game(now).unwrap();

        server.check_weapon_selection_time(now + Duration::from_secs(101));
        let packets = delivered(&mut server, slot, now + Duration::from_secs(101));
        assert!(packets.contains(&ServerPacket::Dropped {
            message: "You have been kicked: selected weapons too long".into()
        }));
    }

    fn make_ready(server: &mut GameServer, slot: usize) {
        let connection = server.connections.get_mut(slot).unwrap();
        connection.game_ready = true;
        let ids: Vec<_> = connection.owned_players.iter().copied().collect();
        for id in ids {
            server.players_mut().get_mut(id).unwrap().weapons_ready = true;
        }
    }

    #[test]
    fn test_match_begins_after_slow_client_is_kicked() {
        let now = Instant::now();
        let mut server = server(&[], now);
        let ready = join(&mut server, 5000, "Ready", now);
        let slow = join(&mut server, 5001, "Slow", now);
        server.start_game(now).unwrap();
        make_ready(&mut server, ready);

        server.check_weapon_selection_time(now + Duration::from_secs(50));
        assert_eq!(server.session().phase, Phase::WeaponSelection);

        server.check_weapon_selection_time(now + Duration::from_secs(101));
        assert_eq!(server.connections().get(slow).unwrap().status, ConnectionStatus::Zombie);
        assert_eq!(server.session().phase, Phase::Playing);
    }

    #[test]
    fn test_match_begins_after_slow_client_quits() {
        let now = Instant::now();
        let mut server = server(&[], now);
        let ready = join(&mut server, 5000, "Ready", now);
        let slow = join(&mut server, 5001, "Slow", now);
        server.start_game(now).unwrap();
        make_ready(&mut server, ready);

        server.drop_client(slow, DisconnectReason::Quit, None, now);
        assert_eq!(server.session().phase, Phase::Playing);
    }

    #[test]
    fn test_last_client_leaving_does_not_begin_match() {
        let now = Instant::now();
        let mut server = server(&[], now);
        let slot = join(&mut server, 5000, "Alone", now);
        server.start_game(now).unwrap();

        server.drop_client(slot, DisconnectReason::Timeout, None, now);
        assert_eq!(server.session().phase, Phase::WeaponSelection);
    }

    #[test]
    fn test_late_local_client_gets_random_weapons() {
        let now = Instant::now();
        let mut server = server(&["Host"], now);
        server.start_game(now).unwrap();
        let late = now + Duration::from_secs(101);

        server.check_weapon_selection_time(late);
        assert!(server.players().get(0).unwrap().weapons_ready);
        assert!(server.local_client().unwrap().is_ready());
        assert_eq!(server.session().phase, Phase::WeaponSelection);
    }
}
