//! Lobby → weapon selection → playing, and back

use crate::connection::ConnectionStatus;
use crate::error::ServerError;
use crate::game_mode::{self, GameContext};
use crate::server::GameServer;
use crate::texts::{replace_max, with_player, NONE_TEXT};
use log::{debug, error, info, warn};
use shared::{Phase, PlayerId, ServerPacket, TextKind};
use std::time::{Duration, Instant};

impl GameServer {
    /// Weapons are picked by the server instead of the players.
    pub fn server_chooses_weapons(&self) -> bool {
        let settings = &self.config.game;
        settings.force_random_weapons
            || (settings.same_weapons_as_host
                && self.local.as_ref().is_some_and(|l| l.has_players()))
    }

    fn weapon_count(&self) -> u8 {
        self.loaded
            .as_ref()
            .map_or(1, |loaded| loaded.ruleset.weapon_count())
    }

    pub(crate) fn prepare_packet(&self) -> Option<ServerPacket> {
        let loaded = self.loaded.as_ref()?;
        Some(ServerPacket::PrepareGame {
            map: loaded.map.name.clone(),
            ruleset: loaded.ruleset.name.clone(),
            weapon_count: loaded.ruleset.weapon_count(),
        })
    }

    /// Loads the match and opens weapon selection.
    pub fn start_game(&mut self, now: Instant) -> Result<(), ServerError> {
        if self.session.phase != Phase::Lobby && !self.session.game_over {
            return Err(ServerError::InvalidPhase(self.session.phase));
        }

        let features = &mut self.config.game.features;
        if features.game_speed.abs() <= 0.05 {
            warn!(
                "WARNING: gamespeed was set to {}; resetting it to 1",
                features.game_speed
            );
            features.game_speed = 1.0;
        }

        self.game_mode = game_mode::for_kind(self.config.game.game_mode);
        self.check_version_compatibilities(true, now);

        let (map, ruleset) = (self.config.game.map.clone(), self.config.game.ruleset.clone());
        info!("Starting game on map '{}' with mod '{}'", map, ruleset);
        let loaded = self.assets.load_game(&map, &ruleset).map_err(|e| {
            error!("Could not load the game: {}", e);
            ServerError::Load(e)
        })?;
        self.loaded = Some(loaded);

        let lives = self.config.game.lives;
        for player in self.players.iter_used_mut() {
            player.reset_for_match(lives);
        }
        for connection in self.connections.iter_mut() {
            connection.game_ready = false;
        }

        if self.game_mode.is_team_game() {
            let infos: Vec<ServerPacket> = self
                .players
                .iter_used()
                .map(|p| ServerPacket::PlayerInfo(p.lobby_info()))
                .collect();
            for info in &infos {
                self.connections.broadcast(info, None);
            }
        }

        self.session.enter_weapon_selection(now);

        if let Some(prepare) = self.prepare_packet() {
            self.connections.broadcast(&prepare, None);
        }
        self.ready_spectators();

        self.register_server_udp(now);

        let ids: Vec<PlayerId> = self.players.iter_used().map(|p| p.id).collect();
        for id in ids {
            self.prepare_player(id);
        }
        Ok(())
    }

    /// Spectating clients do not pick weapons.
    fn ready_spectators(&mut self) {
        let weapon_count = self.weapon_count();
        let slots: Vec<usize> = self
            .connections
            .iter()
            .filter(|c| c.is_connected())
            .filter(|c| {
                c.owned_players
                    .iter()
                    .next()
                    .and_then(|id| self.players.get(*id))
                    .is_some_and(|p| p.spectating)
            })
            .map(|c| c.slot)
            .collect();

        for slot in slots {
            let ids: Vec<PlayerId> = self
                .connections
                .get(slot)
                .map(|c| c.owned_players.iter().copied().collect())
                .unwrap_or_default();
            for id in ids {
                if let Some(player) = self.players.get_mut(id) {
                    player.randomize_weapons(&mut self.rng, weapon_count);
                    player.weapons_ready = true;
                    let packet = ServerPacket::PlayerWeapons {
                        id,
                        weapons: player.weapons.clone(),
                    };
                    self.connections.broadcast(&packet, None);
                }
            }
        }
    }

    /// The host's weapons, once the host has chosen them.
    fn host_weapons(&self) -> Option<Vec<u8>> {
        let slot = self.connections.local_slot()?;
        let connection = self.connections.get(slot)?;
        if !connection.game_ready {
            return None;
        }
        let host = self.players.get(*connection.owned_players.iter().next()?)?;
        host.weapons_ready.then(|| host.weapons.clone())
    }

    /// Server-side weapon handling for one player of a new match.
    pub(crate) fn prepare_player(&mut self, id: PlayerId) {
        let settings = &self.config.game;
        let same_as_host =
            settings.same_weapons_as_host && self.local.as_ref().is_some_and(|l| l.has_players());
        let force_random = settings.force_random_weapons;
        let host_weapons = if same_as_host { self.host_weapons() } else { None };
        let weapon_count = self.weapon_count();

        let Some(player) = self.players.get_mut(id) else {
            return;
        };
        if same_as_host {
            // Without host weapons yet, they are cloned once the host is ready
            if let Some(weapons) = host_weapons {
                player.weapons = weapons;
                player.weapons_ready = true;
            }
        } else if force_random {
            player.randomize_weapons(&mut self.rng, weapon_count);
            player.weapons_ready = true;
        }

        if player.weapons_ready {
            let packet = ServerPacket::PlayerWeapons {
                id,
                weapons: player.weapons.clone(),
            };
            self.connections.broadcast(&packet, None);
        }
    }

    /// Hands the host's weapons to every player still choosing.
    pub(crate) fn clone_host_weapons(&mut self) {
        let Some(weapons) = self.host_weapons() else {
            return;
        };
        let ids: Vec<PlayerId> = self
            .players
            .iter_used()
            .filter(|p| !p.weapons_ready)
            .map(|p| p.id)
            .collect();
        for id in ids {
            if let Some(player) = self.players.get_mut(id) {
                player.weapons = weapons.clone();
                player.weapons_ready = true;
            }
            self.connections.broadcast(
                &ServerPacket::PlayerWeapons {
                    id,
                    weapons: weapons.clone(),
                },
                None,
            );
        }
    }

    fn spawn_player(&mut self, id: PlayerId) {
        let Some(player) = self.players.get_mut(id) else {
            return;
        };
        player.alive = true;
        player.spawned_once = true;
        self.connections
            .broadcast(&ServerPacket::SpawnPlayer { id }, None);
    }

    /// Begins the match once every connected client has its weapons.
    ///
    /// Also called after a client leaves weapon selection, since the one
    /// everybody was waiting for may be gone.
    pub fn check_ready_clients(&mut self, now: Instant) {
        if self.session.phase != Phase::WeaponSelection {
            return;
        }
        let all_ready = {
            let mut connected = self.connections.iter().filter(|c| c.is_connected()).peekable();
            connected.peek().is_some() && connected.all(|c| c.game_ready)
        };
        if !all_ready {
            return;
        }
        debug!("Every client is ready");
        self.begin_match(None, now);
    }

    /// Starts the match, for everyone or for one late connection.
    pub fn begin_match(&mut self, receiver: Option<usize>, now: Instant) {
        match receiver {
            Some(slot) => info!("Beginning match for connection {}", slot),
            None => info!("Beginning match"),
        }
        let first_start = self.session.enter_playing();

        match receiver {
            Some(slot) => {
                if let Some(connection) = self.connections.get_mut(slot) {
                    connection.send_reliable(ServerPacket::StartGame);
                }
            }
            None => self.connections.broadcast(&ServerPacket::StartGame, None),
        }

        if let Some(slot) = receiver {
            self.introduce_ready_players(slot);
        }

        if first_start {
            for player in self.players.iter_used_mut() {
                player.alive = false;
            }
            let ids: Vec<PlayerId> = self
                .players
                .iter_used()
                .filter(|p| p.weapons_ready && !p.is_out())
                .map(|p| p.id)
                .collect();
            for id in ids {
                self.spawn_player(id);
            }

            self.dump_game_state(now);
            info!("Preparing game mode {}", self.game_mode.name());
            self.game_mode.prepare_game(&self.players);
        }

        // Spectators sit the match out
        let spectators: Vec<PlayerId> = self
            .players
            .iter_used()
            .filter(|p| p.spectating && !p.is_out())
            .map(|p| p.id)
            .collect();
        for id in spectators {
            let Some(player) = self.players.get_mut(id) else {
                continue;
            };
            player.lives = shared::Lives::Out;
            player.kills = 0;
            player.damage = 0;
            let score = ServerPacket::PlayerScore(player.score());
            match receiver {
                Some(slot) => {
                    if let Some(connection) = self.connections.get_mut(slot) {
                        connection.send_reliable(score);
                    }
                }
                None => self.connections.broadcast(&score, None),
            }
        }

        self.recheck_game(now);

        if first_start {
            self.register_server_udp(now);
        }
    }

    /// Tells a late connection about everyone already playing and spawns
    /// its own players.
    fn introduce_ready_players(&mut self, receiver: usize) {
        let others: Vec<PlayerId> = self
            .connections
            .iter()
            .filter(|c| c.slot != receiver && c.status == ConnectionStatus::Connected)
            .filter(|c| c.game_ready)
            .flat_map(|c| c.owned_players.iter().copied())
            .collect();
        let mut packets = Vec::new();
        for id in others {
            if let Some(player) = self.players.get(id) {
                packets.push(ServerPacket::PlayerScore(player.score()));
                if player.alive {
                    packets.push(ServerPacket::SpawnPlayer { id });
                }
            }
        }
        if let Some(connection) = self.connections.get_mut(receiver) {
            for packet in packets {
                connection.send_reliable(packet);
            }
        }

        let own: Vec<PlayerId> = self
            .connections
            .get(receiver)
            .map(|c| c.owned_players.iter().copied().collect())
            .unwrap_or_default();
        for id in own {
            let Some(player) = self.players.get(id) else {
                continue;
            };
            let spawn = player.alive && !player.spawned_once;
            self.connections
                .broadcast(&ServerPacket::PlayerScore(player.score()), None);
            if spawn {
                self.spawn_player(id);
            }
        }
    }

    /// Asks the game mode whether the match is decided.
    pub fn recheck_game(&mut self, now: Instant) {
        if !self.session.is_playing() || self.session.game_over {
            return;
        }
        let ctx = GameContext {
            players: &self.players,
            settings: &self.config.game,
            server_time: self.session.server_time,
        };
        if self.game_mode.check_game_over(&ctx) {
            self.game_over(now);
        }
    }

    /// Ends the match. Only the first call has any effect.
    pub fn game_over(&mut self, now: Instant) {
        if !self.session.finish(now) {
            return;
        }

        let ctx = GameContext {
            players: &self.players,
            settings: &self.config.game,
            server_time: self.session.server_time,
        };
        let winner = self.game_mode.winner(&ctx);
        let winning_team = self.game_mode.winning_team(&ctx);
        let team_game = self.game_mode.is_team_game();
        let team_scores: Vec<i32> = if team_game {
            (0..self.game_mode.team_count())
                .map(|team| self.game_mode.team_score(&ctx, team))
                .collect()
        } else {
            Vec::new()
        };

        let texts = &self.config.texts;
        let mut announcements = Vec::new();
        if let Some(id) = winner {
            let name = self.players.get(id).map_or("", |p| p.name.as_str());
            if texts.player_has_won != NONE_TEXT {
                announcements.push(with_player(&texts.player_has_won, name));
            }
            info!("Game over, player {} ('{}') has won the match", id, name);
        }
        if let Some(team) = winning_team {
            if texts.team_has_won != NONE_TEXT {
                let name = self.game_mode.team_name(team);
                announcements.push(replace_max(&texts.team_has_won, "<team>", &name, 1));
            }
            info!("Game over, team {} has won the match", team);
        }
        for text in announcements {
            self.connections.broadcast(
                &ServerPacket::Text {
                    text,
                    kind: TextKind::Normal,
                },
                None,
            );
        }

        let packet = ServerPacket::GameOver {
            winner,
            winning_team,
            team_scores,
        };
        for connection in self.connections.iter_mut() {
            if connection.channel.is_some() {
                connection.send_reliable(packet.clone());
            }
        }

        for player in self.players.iter_used_mut() {
            player.input_frozen = true;
            let won = if team_game {
                Some(player.team) == winning_team
            } else {
                Some(player.id) == winner
            };
            if won {
                player.total_wins += 1;
            } else {
                player.total_losses += 1;
            }
        }

        self.dump_game_state(now);
    }

    /// Closes the match and sends everybody back to the lobby.
    pub fn goto_lobby(&mut self, now: Instant) {
        self.session.enter_lobby();
        for player in self.players.iter_used_mut() {
            player.weapons_ready = false;
            player.alive = false;
            player.input_frozen = false;
        }
        for connection in self.connections.iter_mut() {
            connection.game_ready = false;
            connection.lobby_ready = false;
        }
        self.connections.broadcast(&ServerPacket::GotoLobby, None);
        self.schedule_lobby_update(now);
        self.register_server_udp(now);
    }

    pub fn simulate_game(&mut self, dt: Duration, now: Instant) {
        if !self.session.is_playing() || self.session.game_over {
            return;
        }
        self.simulation.simulate(&mut self.players, dt);
        self.recheck_game(now);
    }

    pub fn dump_game_state(&mut self, now: Instant) {
        info!(
            "Server state: {:?}{}, mode {}, time {:.1}s, frame {}",
            self.session.phase,
            if self.session.game_over { " (game over)" } else { "" },
            self.game_mode.name(),
            self.session.server_time.as_secs_f32(),
            self.session.frame_counter,
        );
        for connection in self.connections.iter_mut() {
            if connection.status == ConnectionStatus::Disconnected {
                continue;
            }
            let (up, down) = connection
                .channel
                .as_mut()
                .map_or((0.0, 0.0), |c| (c.outgoing_rate(now), c.incoming_rate(now)));
            info!(
                " + {}: {:?}, version {}, ready {}, up {:.0} B/s, down {:.0} B/s",
                connection.debug_name(),
                connection.status,
                connection.client_version,
                connection.game_ready,
                up,
                down
            );
            for id in &connection.owned_players {
                match self.players.get(*id) {
                    Some(p) => info!(
                        "   + {} '{}': team {}, lives {:?}, kills {}, alive {}",
                        p.id, p.name, p.team, p.lives, p.kills, p.alive
                    ),
                    None => debug!("   + {} is not in use", id),
                }
            }
        }
    }
}
