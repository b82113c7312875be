//! # Session Coordinator Library
//!
//! This library implements the authoritative host of a multiplayer match.
//! It owns the connection slots and the player pool, runs the match
//! through its phases, and keeps the session visible on directory servers.
//!
//! ## Core Responsibilities
//!
//! ### Connection Lifecycle
//! Clients go through a challenge/response handshake, get a slot and bring
//! one or more players. Dropped clients linger as zombies for a few
//! seconds so that their last reliable message still arrives, then the
//! slot is freed.
//!
//! ### Match Flow
//! A match moves from the lobby through weapon selection into play and
//! back. Game modes decide when the match is over and who won.
//!
//! ### Compatibility
//! Settings that older clients cannot handle raise the minimum client
//! version. Clients below it are kicked before the match starts.
//!
//! ### Directory Registration
//! The session is advertised through HTTP directories (one at a time,
//! moving on after every answer) and UDP directories. Clients behind NAT
//! can be reached through per-client hole punching sockets.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Frame Loop
//! Everything happens inside [`GameServer::frame`], called by the binary
//! at a fixed tick rate. Every operation that needs the time takes it as
//! an explicit `Instant`, which keeps tests deterministic.
//!
//! ### Local Client
//! A hosting player runs in the same process. Its connection is a regular
//! slot whose datagrams travel through in-memory queues instead of a
//! socket (see [`local`]).
//!
//! ## Module Organization
//!
//! - `server`: the [`GameServer`] state, handshake, packet routing and
//!   registration glue
//! - `match_flow`: starting, beginning and ending matches
//! - `lifecycle`: dropping, kicking, banning, muting and timeouts
//! - `compat`: minimum client versions implied by the settings
//! - `connection`, `player`, `session`: slots, players and match clock
//! - `channel`: reliable/unreliable framing over datagrams
//! - `directory`, `nat`, `socket`: directories, NAT traversal and sockets
//! - `config`, `texts`, `ban_list`, `assets`, `game_mode`: the rest
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{config::ServerConfig, GameServer};
//! use std::time::{Duration, Instant};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = GameServer::start(ServerConfig::default(), Instant::now()).await?;
//!     server.start_game(Instant::now())?;
//!
//!     let mut ticker = tokio::time::interval(Duration::from_millis(10));
//!     loop {
//!         ticker.tick().await;
//!         server.frame(Instant::now());
//!     }
//! }
//! ```

pub mod assets;
pub mod ban_list;
pub mod channel;
pub mod compat;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod game_mode;
pub mod lifecycle;
pub mod local;
pub mod match_flow;
pub mod nat;
pub mod player;
pub mod server;
pub mod session;
pub mod socket;
pub mod texts;

pub use error::ServerError;
pub use server::GameServer;
