//! Wire types shared by the match host and its clients.
//!
//! Everything that crosses a socket lives here: the packet enums exchanged
//! over a connection's channel, the connectionless handshake packets that
//! are prefixed with the out-of-band marker, and the directory datagram
//! codec in [`directory`].

pub mod directory;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use thiserror::Error;

pub const MAX_CLIENTS: usize = 32;
pub const MAX_PLAYERS: usize = 32;
/// Main socket plus one auxiliary socket per UDP directory.
pub const MAX_SERVER_SOCKETS: usize = 4;
pub const WEAPON_SLOTS: usize = 5;
pub const DEFAULT_PORT: u16 = 23400;

/// Four leading 0xFF bytes mark a datagram that is not bound to a channel.
pub const OUT_OF_BAND_MARKER: [u8; 4] = [0xFF; 4];

pub type PlayerId = u8;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("datagram does not start with the out-of-band marker")]
    MissingMarker,
    #[error("datagram truncated")]
    Truncated,
    #[error("string is not valid UTF-8")]
    InvalidString,
    #[error("unknown directory command '{0}'")]
    UnknownCommand(String),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Game version as announced by clients and directories.
///
/// A release sorts after every beta of the same major/minor pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub beta: Option<u8>,
}

impl Version {
    pub const fn beta(n: u8) -> Self {
        Self {
            major: 0,
            minor: 58,
            beta: Some(n),
        }
    }

    pub const fn release(major: u16, minor: u16) -> Self {
        Self {
            major,
            minor,
            beta: None,
        }
    }

    /// The version this build speaks.
    pub const fn current() -> Self {
        Self::beta(10)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor)
            .cmp(&(other.major, other.minor))
            .then_with(|| match (self.beta, other.beta) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(&b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.major, self.minor)?;
        if let Some(beta) = self.beta {
            write!(f, "_beta{}", beta)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (numbers, beta) = match s.split_once("_beta") {
            Some((numbers, beta)) => (
                numbers,
                Some(beta.parse::<u8>().map_err(|_| WireError::InvalidString)?),
            ),
            None => (s, None),
        };
        let (major, minor) = numbers.split_once('.').ok_or(WireError::InvalidString)?;
        Ok(Version {
            major: major.parse().map_err(|_| WireError::InvalidString)?,
            minor: minor.parse().map_err(|_| WireError::InvalidString)?,
            beta,
        })
    }
}

/// Match phase as seen by clients and directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Lobby,
    WeaponSelection,
    Playing,
}

impl Phase {
    pub fn as_byte(self) -> u8 {
        match self {
            Phase::Lobby => 0,
            Phase::WeaponSelection => 1,
            Phase::Playing => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Phase::Lobby),
            1 => Some(Phase::WeaponSelection),
            2 => Some(Phase::Playing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    Quit,
    Timeout,
    Kick,
    Ban,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextKind {
    Normal,
    Notice,
    Network,
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lives {
    Unlimited,
    Count(u16),
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerScore {
    pub id: PlayerId,
    pub lives: Lives,
    pub kills: u32,
    pub damage: u32,
}

/// What a client announces for each player it wants to bring into the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinInfo {
    pub name: String,
    pub team: u8,
    pub is_bot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyPlayer {
    pub id: PlayerId,
    pub name: String,
    pub team: u8,
}

/// Packets a client sends over its channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum ClientPacket {
    ImReady {
        weapons: Vec<(PlayerId, Vec<u8>)>,
    },
    UpdateLobby {
        ready: bool,
    },
    Chat {
        text: String,
    },
    KeepAlive,
    Disconnect,
}

/// Packets the server sends over a client's channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum ServerPacket {
    PrepareGame {
        map: String,
        ruleset: String,
        weapon_count: u8,
    },
    StartGame,
    GotoLobby,
    UpdateLobby {
        name: String,
        max_players: u8,
        players: Vec<LobbyPlayer>,
    },
    PlayerInfo(LobbyPlayer),
    PlayerWeapons {
        id: PlayerId,
        weapons: Vec<u8>,
    },
    PlayerScore(PlayerScore),
    SpawnPlayer {
        id: PlayerId,
    },
    PlayersOut {
        ids: Vec<PlayerId>,
    },
    GameOver {
        winner: Option<PlayerId>,
        winning_team: Option<u8>,
        team_scores: Vec<i32>,
    },
    Text {
        text: String,
        kind: TextKind,
    },
    Dropped {
        message: String,
    },
}

/// Packets exchanged before a channel exists, always behind the marker.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum ConnectionlessPacket {
    GetChallenge {
        version: Version,
    },
    Challenge {
        id: u32,
    },
    Connect {
        version: Version,
        challenge: u32,
        players: Vec<JoinInfo>,
    },
    ConnectionAccepted {
        slot: u8,
        player_ids: Vec<PlayerId>,
    },
    ConnectionRefused {
        reason: String,
    },
    Ping,
    Pong,
    Query,
    QueryInfo {
        name: String,
        players: u8,
        max_players: u8,
        phase: Phase,
    },
    DummyPacket,
}

pub fn is_out_of_band(data: &[u8]) -> bool {
    data.len() >= OUT_OF_BAND_MARKER.len() && data[..OUT_OF_BAND_MARKER.len()] == OUT_OF_BAND_MARKER
}

pub fn encode_connectionless(packet: &ConnectionlessPacket) -> Result<Vec<u8>, WireError> {
    let mut data = OUT_OF_BAND_MARKER.to_vec();
    bincode::serialize_into(&mut data, packet)?;
    Ok(data)
}

/// Decodes every marker-prefixed packet in a datagram.
///
/// Several connectionless packets may be packed into one datagram, each
/// carrying its own marker. Decoding stops at the first malformed packet.
pub fn decode_connectionless(data: &[u8]) -> Result<Vec<ConnectionlessPacket>, WireError> {
    if !is_out_of_band(data) {
        return Err(WireError::MissingMarker);
    }

    let mut packets = Vec::new();
    let mut cursor = Cursor::new(data);
    while (cursor.position() as usize) < data.len() {
        let pos = cursor.position() as usize;
        if !is_out_of_band(&data[pos..]) {
            break;
        }
        cursor.set_position((pos + OUT_OF_BAND_MARKER.len()) as u64);
        packets.push(bincode::deserialize_from(&mut cursor)?);
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        assert!(Version::beta(7) < Version::beta(8));
        assert!(Version::beta(9) < Version::release(0, 58));
        assert!(Version::release(0, 57) < Version::beta(1));
        assert_eq!(Version::beta(9).cmp(&Version::beta(9)), Ordering::Equal);
    }

    #[test]
    fn test_version_display_and_parse() {
        assert_eq!(Version::beta(9).to_string(), "0.58_beta9");
        assert_eq!(Version::release(0, 57).to_string(), "0.57");
        assert_eq!("0.58_beta9".parse::<Version>().unwrap(), Version::beta(9));
        assert_eq!("0.57".parse::<Version>().unwrap(), Version::release(0, 57));
        assert!("garbage".parse::<Version>().is_err());
    }

    #[test]
    fn test_phase_bytes() {
        for phase in [Phase::Lobby, Phase::WeaponSelection, Phase::Playing] {
            assert_eq!(Phase::from_byte(phase.as_byte()), Some(phase));
        }
        assert_eq!(Phase::from_byte(7), None);
    }

    #[test]
    fn test_out_of_band_detection() {
        assert!(is_out_of_band(&[0xFF, 0xFF, 0xFF, 0xFF, 1]));
        assert!(!is_out_of_band(&[0xFF, 0xFF, 0xFF]));
        assert!(!is_out_of_band(&[0xFF, 0xFF, 0x00, 0xFF, 1]));
    }

    #[test]
    fn test_connectionless_packets_share_a_datagram() {
        let mut data = encode_connectionless(&ConnectionlessPacket::Ping).unwrap();
        data.extend(encode_connectionless(&ConnectionlessPacket::Challenge { id: 77 }).unwrap());

        let packets = decode_connectionless(&data).unwrap();
        assert_eq!(
            packets,
            vec![
                ConnectionlessPacket::Ping,
                ConnectionlessPacket::Challenge { id: 77 }
            ]
        );
    }

    #[test]
    fn test_decode_rejects_channel_datagram() {
        let data = bincode::serialize(&ClientPacket::KeepAlive).unwrap();
        assert!(matches!(
            decode_connectionless(&data),
            Err(WireError::MissingMarker)
        ));
    }
}
