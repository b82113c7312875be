//! Minimum client versions implied by the current match settings
//!
//! Older clients cannot play with some settings. The rules below are
//! checked in order and the first one a client's version violates decides
//! what the client is told.

use crate::config::{Features, GameModeKind, GameSettings};
use crate::connection::ConnectionStatus;
use crate::server::GameServer;
use log::{info, warn};
use shared::{DisconnectReason, ServerPacket, TextKind, Version};
use std::time::Instant;

/// A setting that needs at least `min` on the client side.
struct VersionRule {
    min: Version,
    /// Returns why the rule applies, or `None` if it does not.
    applies: fn(&GameSettings) -> Option<String>,
}

/// A gameplay feature that older clients cannot support when enabled.
pub struct FeatureMinimum {
    pub name: &'static str,
    pub human_name: &'static str,
    pub min: Version,
    /// The feature's value when it is set to something old clients lack.
    pub unsupported_value: fn(&Features) -> Option<String>,
}

fn chooses_weapons(settings: &GameSettings) -> Option<String> {
    (settings.force_random_weapons || settings.same_weapons_as_host)
        .then(|| "server chooses the weapons".to_string())
}

fn connect_during_game(settings: &GameSettings) -> Option<String> {
    settings
        .allow_connect_during_game
        .then(|| "connecting during game is allowed".to_string())
}

fn capture_the_flag(settings: &GameSettings) -> Option<String> {
    (settings.game_mode == GameModeKind::CaptureTheFlag)
        .then(|| "CaptureTheFlag gamemode".to_string())
}

fn worm_speed(settings: &GameSettings) -> Option<String> {
    let factor = settings.features.worm_speed_factor;
    (factor != 1.0).then(|| format!("WormSpeedFactor = {}", factor))
}

fn worm_damage(settings: &GameSettings) -> Option<String> {
    let factor = settings.features.worm_damage_factor;
    (factor != 1.0).then(|| format!("WormDamageFactor = {}", factor))
}

fn instant_air_jump(settings: &GameSettings) -> Option<String> {
    settings
        .features
        .instant_air_jump
        .then(|| "InstantAirJump activated".to_string())
}

fn relative_air_jump(settings: &GameSettings) -> Option<String> {
    settings
        .features
        .relative_air_jump
        .then(|| "RelativeAirJump activated".to_string())
}

const RULES: [VersionRule; 7] = [
    VersionRule { min: Version::beta(7), applies: chooses_weapons },
    VersionRule { min: Version::beta(8), applies: connect_during_game },
    VersionRule { min: Version::beta(9), applies: capture_the_flag },
    VersionRule { min: Version::beta(9), applies: worm_speed },
    VersionRule { min: Version::beta(9), applies: worm_damage },
    VersionRule { min: Version::beta(9), applies: instant_air_jump },
    VersionRule { min: Version::beta(9), applies: relative_air_jump },
];

fn forced_screen_shaking(features: &Features) -> Option<String> {
    features.force_screen_shaking.then(|| "true".to_string())
}

/// Per-feature minimum versions, checked after the fixed rules.
pub const FEATURE_MINIMUMS: [FeatureMinimum; 1] = [FeatureMinimum {
    name: "ForceScreenShaking",
    human_name: "force screen shaking",
    min: Version::beta(9),
    unsupported_value: forced_screen_shaking,
}];

/// The first requirement `version` does not meet, as `(minimum, reason)`.
pub fn first_violation(settings: &GameSettings, version: Version) -> Option<(Version, String)> {
    let fixed = RULES
        .iter()
        .filter(|rule| version < rule.min)
        .find_map(|rule| (rule.applies)(settings).map(|reason| (rule.min, reason)));
    if fixed.is_some() {
        return fixed;
    }
    FEATURE_MINIMUMS
        .iter()
        .filter(|feature| version < feature.min)
        .find_map(|feature| {
            (feature.unsupported_value)(&settings.features).map(|value| {
                (feature.min, format!("{} is set to {}", feature.human_name, value))
            })
        })
}

impl GameServer {
    /// Checks whether the client in `slot` can play with the current
    /// settings.
    ///
    /// With neither `drop_out` nor `make_msg` this is a dry run that only
    /// reports the problem.
    pub fn check_version_compatibility(
        &mut self,
        slot: usize,
        drop_out: bool,
        make_msg: bool,
        now: Instant,
    ) -> (bool, Option<String>) {
        let Some(connection) = self.connections.get(slot) else {
            warn!("check_version_compatibility: no connection in slot {}", slot);
            return (false, None);
        };
        let version = connection.client_version;
        let Some((min, reason)) = first_violation(&self.config.game, version) else {
            return (true, None);
        };

        let name = connection
            .owned_players
            .iter()
            .next()
            .and_then(|id| self.players.get(*id))
            .map(|p| p.name.clone())
            .unwrap_or_else(|| connection.debug_name());
        let message = format!("Your version is too old, please update.\n{}", reason);
        info!("{} runs {} but {} is needed: {}", name, version, min, reason);

        if drop_out {
            self.drop_client(slot, DisconnectReason::Kick, Some(&message), now);
        }
        if make_msg {
            let text = format!("{} is too old: {}", name, reason);
            self.connections.broadcast(
                &ServerPacket::Text {
                    text,
                    kind: TextKind::Notice,
                },
                None,
            );
        }
        (false, Some(message))
    }

    /// Runs the check for every live connection, usually before a match.
    pub fn check_version_compatibilities(&mut self, drop_out: bool, now: Instant) {
        let slots: Vec<usize> = self
            .connections
            .iter()
            .filter(|c| {
                c.status != ConnectionStatus::Disconnected && c.status != ConnectionStatus::Zombie
            })
            .map(|c| c.slot)
            .collect();
        for slot in slots {
            self.check_version_compatibility(slot, drop_out, true, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MemoryAssets;
    use crate::channel::Channel;
    use crate::config::ServerConfig;
    use crate::connection::Endpoint;
    use crate::local::ClientChannel;
    use crate::socket::{DatagramSocket, LoopbackNetwork, SocketId};
    use shared::JoinInfo;
    use std::net::SocketAddr;

    fn server(config: ServerConfig, now: Instant) -> GameServer {
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

    fn join(server: &mut GameServer, port: u16, name: &str, version: Version, now: Instant) -> usize {
        let endpoint = Endpoint::Remote {
            addr: SocketAddr::from(([10, 0, 0, 2], port)),
            socket: SocketId::Server(0),
        };
        let slot = server.connections.allocate(endpoint, version, now).unwrap();
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

    #[test]
    fn test_first_violation_wins() {
        let mut settings = GameSettings::default();
        assert_eq!(first_violation(&settings, Version::beta(3)), None);

        settings.features.worm_speed_factor = 1.5;
        settings.allow_connect_during_game = true;
        assert_eq!(
            first_violation(&settings, Version::beta(7)),
            Some((Version::beta(8), "connecting during game is allowed".into()))
        );
        assert_eq!(
            first_violation(&settings, Version::beta(8)),
            Some((Version::beta(9), "WormSpeedFactor = 1.5".into()))
        );
        assert_eq!(first_violation(&settings, Version::beta(9)), None);
    }

    #[test]
    fn test_feature_minimum() {
        let mut settings = GameSettings::default();
        settings.features.force_screen_shaking = true;
        assert_eq!(
            first_violation(&settings, Version::beta(8)),
            Some((Version::beta(9), "force screen shaking is set to true".into()))
        );
    }

    #[test]
    fn test_dry_run_has_no_side_effects() {
        let now = Instant::now();
        let mut config = ServerConfig::default();
        config.game.game_mode = GameModeKind::CaptureTheFlag;
        let mut server = server(config, now);
        let slot = join(&mut server, 6000, "Oldie", Version::beta(8), now);

        let (ok, message) = server.check_version_compatibility(slot, false, false, now);
        assert!(!ok);
        assert_eq!(
            message.as_deref(),
            Some("Your version is too old, please update.\nCaptureTheFlag gamemode")
        );
        assert!(server.connections().get(slot).unwrap().is_connected());
        assert!(delivered(&mut server, slot, now).is_empty());
    }

    #[test]
    fn test_old_client_is_kicked_and_announced() {
        let now = Instant::now();
        let mut config = ServerConfig::default();
        config.game.force_random_weapons = true;
        let mut server = server(config, now);
        let old = join(&mut server, 6000, "Oldie", Version::beta(6), now);
        let fine = join(&mut server, 6001, "Newbie", Version::current(), now);

        server.check_version_compatibilities(true, now);

        assert!(!server.connections().get(old).unwrap().is_connected());
        assert!(server.connections().get(fine).unwrap().is_connected());

        let packets = delivered(&mut server, fine, now);
        assert!(packets.contains(&ServerPacket::Text {
            text: "Oldie is too old: server chooses the weapons".into(),
            kind: TextKind::Notice,
        }));
        let packets = delivered(&mut server, old, now);
        assert!(packets.contains(&ServerPacket::Dropped {
            message: "You have been kicked: Your version is too old, please update.\nserver chooses the weapons"
                .into()
        }));
    }

    #[test]
    fn test_current_clients_pass() {
        let now = Instant::now();
        let mut config = ServerConfig::default();
        config.game.features.instant_air_jump = true;
        let mut server = server(config, now);
        let slot = join(&mut server, 6000, "Newbie", Version::current(), now);
        assert_eq!(
            server.check_version_compatibility(slot, true, true, now),
            (true, None)
        );
    }
}
