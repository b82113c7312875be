//! Datagram format spoken with UDP directory servers.
//!
//! Directories predate the bincode channel format, so these messages use
//! the legacy layout: the out-of-band marker, a NUL-terminated command
//! string and, for registrations, NUL-terminated strings and single bytes.

use crate::{Phase, Version, WireError, OUT_OF_BAND_MARKER};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const DUMMY_COMMAND: &str = "lx::dummypacket";
pub const REGISTER_COMMAND: &str = "lx::register";
pub const DEREGISTER_COMMAND: &str = "lx::deregister";

/// Number of dummy datagrams sent ahead of a directory message so that
/// NATs and firewalls on the way open a mapping for the reply path.
pub const NAT_PUNCH_PACKETS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub players: u8,
    pub max_players: u8,
    pub phase: Phase,
    pub version: Version,
    pub allows_join_during_game: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryMessage {
    DummyPacket,
    Register(Registration),
    Deregister,
}

impl DirectoryMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(&OUT_OF_BAND_MARKER);
        match self {
            DirectoryMessage::DummyPacket => put_cstring(&mut buf, DUMMY_COMMAND),
            DirectoryMessage::Deregister => put_cstring(&mut buf, DEREGISTER_COMMAND),
            DirectoryMessage::Register(reg) => {
                put_cstring(&mut buf, REGISTER_COMMAND);
                put_cstring(&mut buf, &legacy_string(&reg.name));
                buf.put_u8(reg.players);
                buf.put_u8(reg.max_players);
                buf.put_u8(reg.phase.as_byte());
                put_cstring(&mut buf, &reg.version.to_string());
                buf.put_u8(reg.allows_join_during_game as u8);
            }
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if !crate::is_out_of_band(data) {
            return Err(WireError::MissingMarker);
        }
        let mut buf = &data[OUT_OF_BAND_MARKER.len()..];
        let command = get_cstring(&mut buf)?;
        match command.as_str() {
            DUMMY_COMMAND => Ok(DirectoryMessage::DummyPacket),
            DEREGISTER_COMMAND => Ok(DirectoryMessage::Deregister),
            REGISTER_COMMAND => {
                let name = get_cstring(&mut buf)?;
                let players = get_u8(&mut buf)?;
                let max_players = get_u8(&mut buf)?;
                let phase = Phase::from_byte(get_u8(&mut buf)?).ok_or(WireError::Truncated)?;
                let version = get_cstring(&mut buf)?.parse()?;
                let allows_join_during_game = get_u8(&mut buf)? != 0;
                Ok(DirectoryMessage::Register(Registration {
                    name,
                    players,
                    max_players,
                    phase,
                    version,
                    allows_join_during_game,
                }))
            }
            _ => Err(WireError::UnknownCommand(command)),
        }
    }
}

/// Directories only understand single-byte text; anything else is
/// replaced so that old listing clients can still display the name.
fn legacy_string(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii() && c != '\0' { c } else { '?' })
        .collect()
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn get_cstring(buf: &mut &[u8]) -> Result<String, WireError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::Truncated)?;
    let s = std::str::from_utf8(&buf[..end])
        .map_err(|_| WireError::InvalidString)?
        .to_string();
    buf.advance(end + 1);
    Ok(s)
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> Registration {
        Registration {
            name: "Friday Night Frag".to_string(),
            players: 3,
            max_players: 8,
            phase: Phase::WeaponSelection,
            version: Version::beta(10),
            allows_join_during_game: true,
        }
    }

    #[test]
    fn test_register_layout() {
        let data = DirectoryMessage::Register(registration()).encode();

        assert_eq!(&data[..4], &OUT_OF_BAND_MARKER);
        let body = &data[4..];
        assert!(body.starts_with(b"lx::register\0Friday Night Frag\0"));

        let tail = &body[b"lx::register\0Friday Night Frag\0".len()..];
        assert_eq!(&tail[..3], &[3, 8, 1]);
        assert_eq!(&tail[3..], b"0.58_beta10\0\x01");
    }

    #[test]
    fn test_register_decodes() {
        let data = DirectoryMessage::Register(registration()).encode();
        assert_eq!(
            DirectoryMessage::decode(&data).unwrap(),
            DirectoryMessage::Register(registration())
        );
    }

    #[test]
    fn test_non_ascii_name_is_flattened() {
        let mut reg = registration();
        reg.name = "Über Ärger".to_string();
        let data = DirectoryMessage::Register(reg).encode();

        match DirectoryMessage::decode(&data).unwrap() {
            DirectoryMessage::Register(decoded) => assert_eq!(decoded.name, "?ber ?rger"),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_deregister_and_dummy() {
        assert_eq!(
            &DirectoryMessage::Deregister.encode()[4..],
            b"lx::deregister\0"
        );
        assert_eq!(
            DirectoryMessage::decode(&DirectoryMessage::DummyPacket.encode()).unwrap(),
            DirectoryMessage::DummyPacket
        );
    }

    #[test]
    fn test_truncated_registration() {
        let data = DirectoryMessage::Register(registration()).encode();
        let cut = &data[..data.len() - 3];
        assert!(DirectoryMessage::decode(cut).is_err());
    }

    #[test]
    fn test_unknown_command() {
        let mut data = OUT_OF_BAND_MARKER.to_vec();
        data.extend_from_slice(b"lx::whatever\0");
        assert!(matches!(
            DirectoryMessage::decode(&data),
            Err(WireError::UnknownCommand(cmd)) if cmd == "lx::whatever"
        ));
    }
}
