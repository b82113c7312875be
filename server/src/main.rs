use clap::Parser;
use log::{error, info, warn};
use server::config::ServerConfig;
use server::GameServer;
use shared::Phase;
use std::path::PathBuf;
use std::time::Instant;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

/// How long shutdown waits for directories to acknowledge deregistration.
const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(3);

/// Command line arguments. Values given here override the config file.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long)]
    host: Option<String>,
    /// Server port to listen on
    #[clap(short, long)]
    port: Option<u16>,
    /// Tick rate (updates per second)
    #[clap(short, long)]
    tick_rate: Option<u32>,
    /// Maximum number of players in a match
    #[clap(long)]
    max_players: Option<u8>,
    /// Name shown in the lobby and on directories
    #[clap(short, long)]
    name: Option<String>,
    /// JSON configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Advertise the session on directory servers
    #[clap(long)]
    register: bool,
    /// HTTP directory list
    #[clap(long)]
    master_servers: Option<PathBuf>,
    /// UDP directory list
    #[clap(long)]
    udp_master_servers: Option<PathBuf>,
    #[clap(long)]
    levels_dir: Option<PathBuf>,
    #[clap(long)]
    mods_dir: Option<PathBuf>,
    /// Map of the next match
    #[clap(short, long)]
    map: Option<String>,
    /// Ruleset of the next match
    #[clap(long = "mod")]
    ruleset: Option<String>,
    /// Start a match as soon as every connected client is ready in the lobby
    #[clap(long)]
    auto_start: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(tick_rate) = self.tick_rate {
            config.tick_rate = tick_rate;
        }
        if let Some(max_players) = self.max_players {
            config.game.max_players = max_players;
        }
        if let Some(name) = self.name {
            config.name = name;
        }
        if self.register {
            config.register = true;
        }
        if let Some(path) = self.master_servers {
            config.master_servers_file = path;
        }
        if let Some(path) = self.udp_master_servers {
            config.udp_master_servers_file = path;
        }
        if let Some(dir) = self.levels_dir {
            config.levels_dir = dir;
        }
        if let Some(dir) = self.mods_dir {
            config.mods_dir = dir;
        }
        if let Some(map) = self.map {
            config.game.map = map;
        }
        if let Some(ruleset) = self.ruleset {
            config.game.ruleset = ruleset;
        }
        Ok(config)
    }
}

/// Everybody connected has said they are ready in the lobby.
fn lobby_ready(server: &GameServer) -> bool {
    let mut connected = server.connections().iter().filter(|c| c.is_connected()).peekable();
    server.session().phase == Phase::Lobby
        && connected.peek().is_some()
        && connected.all(|c| c.lobby_ready)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set RUST_LOG=info to see connection and match events
    env_logger::init();

    let args = Args::parse();
    let auto_start = args.auto_start;
    let config = args.into_config()?;
    let tick_rate = config.tick_rate.max(1);

    let mut server = GameServer::start(config, Instant::now()).await?;
    info!("'{}' is up on port {}", server.config().name, server.port());

    let mut ticker = interval(Duration::from_secs_f32(1.0 / tick_rate as f32));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Set after a failed start until somebody changes their lobby state
    let mut start_failed = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                server.frame(now);
                if !auto_start {
                    continue;
                }
                if !lobby_ready(&server) {
                    start_failed = false;
                } else if !start_failed {
                    if let Err(e) = server.start_game(now) {
                        error!("Could not start the match: {}", e);
                        start_failed = true;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    if server.shutdown(Instant::now()) {
        let deadline = Instant::now() + DEREGISTER_TIMEOUT;
        while !server.process_deregister() {
            if Instant::now() > deadline {
                warn!("Directories did not answer the deregistration in time");
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    Ok(())
}
