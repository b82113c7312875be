//! Server and match configuration
//!
//! Configuration comes from three places: built-in defaults, an optional
//! JSON file, and command line overrides applied by the binary.

use crate::error::ServerError;
use crate::texts::NetworkTexts;
use log::warn;
use serde::{Deserialize, Serialize};
use shared::{JoinInfo, Lives, DEFAULT_PORT};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameModeKind {
    Deathmatch,
    TeamDeathmatch,
    CaptureTheFlag,
}

/// Feature switches that change gameplay and may require newer clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub game_speed: f32,
    pub worm_speed_factor: f32,
    pub worm_damage_factor: f32,
    pub instant_air_jump: bool,
    pub relative_air_jump: bool,
    pub force_screen_shaking: bool,
    pub immediate_start: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            game_speed: 1.0,
            worm_speed_factor: 1.0,
            worm_damage_factor: 1.0,
            instant_air_jump: false,
            relative_air_jump: false,
            force_screen_shaking: false,
            immediate_start: false,
        }
    }
}

/// Rules of the next match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSettings {
    pub map: String,
    pub ruleset: String,
    pub game_mode: GameModeKind,
    pub lives: Lives,
    pub kill_limit: Option<u32>,
    pub time_limit_minutes: Option<f32>,
    pub max_players: u8,
    pub weapon_selection_max_time: u32,
    pub force_random_weapons: bool,
    pub same_weapons_as_host: bool,
    pub allow_connect_during_game: bool,
    /// New players are put on a random team among the first `n + 1`.
    pub random_team_for_new_player: u8,
    pub features: Features,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            map: "CastleStrike.lxl".to_string(),
            ruleset: "Classic".to_string(),
            game_mode: GameModeKind::Deathmatch,
            lives: Lives::Count(10),
            kill_limit: Some(15),
            time_limit_minutes: None,
            max_players: 8,
            weapon_selection_max_time: 120,
            force_random_weapons: false,
            same_weapons_as_host: false,
            allow_connect_during_game: false,
            random_team_for_new_player: 0,
            features: Features::default(),
        }
    }
}

impl GameSettings {
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_minutes
            .filter(|m| *m > 0.0)
            .map(|m| Duration::from_secs_f32(m * 60.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tick_rate: u32,
    /// Advertise the session on directory servers.
    pub register: bool,
    pub http_proxy: Option<String>,
    pub master_servers_file: PathBuf,
    pub udp_master_servers_file: PathBuf,
    pub ban_list_file: PathBuf,
    pub levels_dir: PathBuf,
    pub mods_dir: PathBuf,
    pub connection_timeout_secs: u64,
    /// Players of the co-located client; empty for a dedicated server.
    pub host_players: Vec<JoinInfo>,
    pub texts: NetworkTexts,
    pub game: GameSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Open match".to_string(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            tick_rate: 100,
            register: false,
            http_proxy: None,
            master_servers_file: PathBuf::from("cfg/masterservers.txt"),
            udp_master_servers_file: PathBuf::from("cfg/udpmasterservers.txt"),
            ban_list_file: PathBuf::from("cfg/ban.lst"),
            levels_dir: PathBuf::from("levels"),
            mods_dir: PathBuf::from("mods"),
            connection_timeout_secs: 9,
            host_players: Vec::new(),
            texts: NetworkTexts::default(),
            game: GameSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn is_dedicated(&self) -> bool {
        self.host_players.is_empty()
    }
}

/// Reads a directory list, one entry per line.
///
/// A missing file only disables that kind of registration.
pub fn load_directory_list(path: &Path, skip_comments: bool) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(text) => parse_directory_list(&text, skip_comments),
        Err(e) => {
            warn!("{} not found: {}", path.display(), e);
            Vec::new()
        }
    }
}

fn parse_directory_list(text: &str, skip_comments: bool) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !(skip_comments && line.starts_with('#')))
        .map(str::to_string)
        .collect()
}
