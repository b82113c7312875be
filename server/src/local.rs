//! The client running in the same process as the server
//!
//! A hosting player does not go through a socket. Its connection is an
//! ordinary slot with `Endpoint::Local`, and the datagrams of both
//! directions sit in a [`LocalLink`] until the other side reads them.

use crate::channel::Channel;
use crate::server::GameServer;
use log::{debug, info, warn};
use shared::{ClientPacket, Phase, PlayerId, ServerPacket};
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

pub type ClientChannel = Channel<ClientPacket, ServerPacket>;

/// In-memory datagram queues between the server and the local client.
#[derive(Debug, Default)]
pub struct LocalLink {
    pub to_server: VecDeque<Vec<u8>>,
    pub to_client: VecDeque<Vec<u8>>,
}

/// Client-side view of the hosting player's match.
#[derive(Debug)]
pub struct LocalClient {
    channel: ClientChannel,
    phase: Phase,
    /// Weapons picked for each owned player, `None` while still choosing.
    selections: BTreeMap<PlayerId, Option<Vec<u8>>>,
    ready_sent: bool,
    chat: Vec<String>,
}

impl LocalClient {
    pub fn new(player_ids: impl IntoIterator<Item = PlayerId>) -> Self {
        Self {
            channel: Channel::new(),
            phase: Phase::Lobby,
            selections: player_ids.into_iter().map(|id| (id, None)).collect(),
            ready_sent: false,
            chat: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn owns(&self, id: PlayerId) -> bool {
        self.selections.contains_key(&id)
    }

    pub fn has_players(&self) -> bool {
        !self.selections.is_empty()
    }

    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.selections.keys().copied().collect()
    }

    pub fn remove_player(&mut self, id: PlayerId) -> bool {
        self.selections.remove(&id).is_some()
    }

    /// Picks weapons for one owned player. Returns false if it is not ours.
    pub fn select_weapons(&mut self, id: PlayerId, weapons: Vec<u8>) -> bool {
        match self.selections.get_mut(&id) {
            Some(selection) => {
                *selection = Some(weapons);
                true
            }
            None => false,
        }
    }

    /// Weapons were chosen for us; `ImReady` goes out with the next send.
    pub fn force_weapons(&mut self, id: PlayerId, weapons: Vec<u8>) {
        if self.select_weapons(id, weapons) {
            self.ready_sent = false;
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.selections.is_empty() && self.selections.values().all(Option::is_some)
    }

    /// Adds a line to the host's chat box.
    pub fn notify(&mut self, text: impl Into<String>) {
        self.chat.push(text.into());
    }

    pub fn chat_box(&self) -> &[String] {
        &self.chat
    }

    pub fn send_chat(&mut self, text: impl Into<String>) {
        self.channel.add_reliable(ClientPacket::Chat { text: text.into() });
    }

    fn handle(&mut self, packet: ServerPacket) {
        match packet {
            ServerPacket::PrepareGame { map, .. } => {
                debug!("Local client preparing for {}", map);
                self.phase = Phase::WeaponSelection;
                self.ready_sent = false;
                for selection in self.selections.values_mut() {
                    *selection = None;
                }
            }
            ServerPacket::StartGame => self.phase = Phase::Playing,
            ServerPacket::GotoLobby => {
                self.phase = Phase::Lobby;
                self.ready_sent = false;
            }
            ServerPacket::PlayerWeapons { id, weapons } => {
                if let Some(selection) = self.selections.get_mut(&id) {
                    *selection = Some(weapons);
                }
            }
            ServerPacket::PlayersOut { ids } => {
                for id in ids {
                    self.selections.remove(&id);
                }
            }
            ServerPacket::Text { text, .. } => self.chat.push(text),
            ServerPacket::Dropped { message } => {
                warn!("Local client was dropped: {}", message);
                self.chat.push(message);
            }
            ServerPacket::GameOver { winner, winning_team, .. } => {
                debug!("Game over, winner {:?}, team {:?}", winner, winning_team);
            }
            ServerPacket::UpdateLobby { .. }
            | ServerPacket::PlayerInfo(_)
            | ServerPacket::PlayerScore(_)
            | ServerPacket::SpawnPlayer { .. } => {}
        }
    }

    /// Reads everything the server queued for us.
    pub fn read_packets(&mut self, link: &mut LocalLink, now: Instant) {
        while let Some(data) = link.to_client.pop_front() {
            match self.channel.process(&data, now) {
                Ok(packets) => packets.into_iter().for_each(|p| self.handle(p)),
                Err(e) => warn!("Local client got a bad frame: {}", e),
            }
        }
    }

    pub fn send_packets(&mut self, link: &mut LocalLink, now: Instant) {
        if self.phase == Phase::WeaponSelection && !self.ready_sent && self.is_ready() {
            let weapons = self
                .selections
                .iter()
                .filter_map(|(id, w)| w.clone().map(|w| (*id, w)))
                .collect();
            self.channel.add_reliable(ClientPacket::ImReady { weapons });
            self.ready_sent = true;
        }
        match self.channel.transmit(&[], now) {
            Ok(Some(data)) => link.to_server.push_back(data),
            Ok(None) => {}
            Err(e) => warn!("Local client could not send: {}", e),
        }
    }
}

impl GameServer {
    pub(crate) fn local_client_send(&mut self, now: Instant) {
        if let Some(local) = self.local.as_mut() {
            local.send_packets(&mut self.link, now);
        }
    }

    pub(crate) fn local_client_read(&mut self, now: Instant) {
        if let Some(local) = self.local.as_mut() {
            local.read_packets(&mut self.link, now);
        }
    }

    /// Flushes both directions between the server and the local client,
    /// so that both agree on who owns which player.
    pub fn sync_server_and_client(&mut self, now: Instant) {
        if self.local.is_none() || self.connections.local_slot().is_none() {
            warn!("sync_server_and_client: not hosting a local client");
            return;
        }
        self.read_local(now);
        self.local_client_send(now);
        self.send_packets(now);
        self.local_client_read(now);
        self.read_incoming(now);
        info!("Server and local client synchronised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ServerChannel;

    fn deliver(server: &mut ServerChannel, client: &mut LocalClient, link: &mut LocalLink, now: Instant) {
        if let Some(data) = server.transmit(&[], now).unwrap() {
            link.to_client.push_back(data);
        }
        client.read_packets(link, now);
    }

    #[test]
    fn test_ready_after_all_players_chose() {
        let now = Instant::now();
        let mut link = LocalLink::default();
        let mut server: ServerChannel = Channel::new();
        let mut client = LocalClient::new([0, 1]);

        server.add_reliable(ServerPacket::PrepareGame {
            map: "dirt".into(),
            ruleset: "Classic".into(),
            weapon_count: 4,
        });
        deliver(&mut server, &mut client, &mut link, now);
        assert_eq!(client.phase(), Phase::WeaponSelection);

        client.select_weapons(0, vec![1, 2, 3, 0, 1]);
        client.send_packets(&mut link, now);
        let packets = server.process(&link.to_server.pop_front().unwrap(), now).unwrap();
        assert!(packets.is_empty());

        client.select_weapons(1, vec![0, 0, 0, 0, 0]);
        client.send_packets(&mut link, now);
        let packets = server.process(&link.to_server.pop_front().unwrap(), now).unwrap();
        assert!(matches!(&packets[..], [ClientPacket::ImReady { weapons }] if weapons.len() == 2));
    }

    #[test]
    fn test_server_chosen_weapons_count_as_selection() {
        let now = Instant::now();
        let mut link = LocalLink::default();
        let mut server: ServerChannel = Channel::new();
        let mut client = LocalClient::new([3]);

        server.add_reliable(ServerPacket::PrepareGame {
            map: "dirt".into(),
            ruleset: "Classic".into(),
            weapon_count: 4,
        });
        server.add_reliable(ServerPacket::PlayerWeapons {
            id: 3,
            weapons: vec![2; 5],
        });
        deliver(&mut server, &mut client, &mut link, now);
        assert!(client.is_ready());
    }

    #[test]
    fn test_players_out_and_texts() {
        let now = Instant::now();
        let mut link = LocalLink::default();
        let mut server: ServerChannel = Channel::new();
        let mut client = LocalClient::new([0, 1]);

        server.add_reliable(ServerPacket::PlayersOut { ids: vec![1] });
        server.add_reliable(ServerPacket::Text {
            text: "Bob has been kicked out".into(),
            kind: shared::TextKind::Network,
        });
        deliver(&mut server, &mut client, &mut link, now);

        assert_eq!(client.player_ids(), vec![0]);
        assert_eq!(client.chat_box(), ["Bob has been kicked out".to_string()]);
    }
}
