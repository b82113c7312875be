//! Player entities ("worms") and their fixed-size pool
//!
//! Players are owned by connections, but live in their own pool: a
//! connection may bring several players and the pool index doubles as the
//! player id on the wire.

use rand::Rng;
use shared::{JoinInfo, Lives, LobbyPlayer, PlayerId, PlayerScore, MAX_PLAYERS, WEAPON_SLOTS};

#[derive(Debug, Clone)]
pub struct Player {
    pub used: bool,
    pub id: PlayerId,
    pub name: String,
    /// Slot of the owning connection. A back-reference, not ownership.
    pub owner: Option<usize>,
    pub team: u8,
    pub is_bot: bool,
    pub lives: Lives,
    pub kills: u32,
    pub damage: u32,
    pub alive: bool,
    pub spawned_once: bool,
    pub weapons_ready: bool,
    pub weapons: Vec<u8>,
    pub spectating: bool,
    /// Set at game over so the player stops acting on stale input.
    pub input_frozen: bool,
    pub total_wins: u32,
    pub total_losses: u32,
}

impl Player {
    pub fn new(id: PlayerId) -> Self {
        Self {
            used: false,
            id,
            name: String::new(),
            owner: None,
            team: 0,
            is_bot: false,
            lives: Lives::Unlimited,
            kills: 0,
            damage: 0,
            alive: false,
            spawned_once: false,
            weapons_ready: false,
            weapons: Vec::new(),
            spectating: false,
            input_frozen: false,
            total_wins: 0,
            total_losses: 0,
        }
    }

    pub fn is_out(&self) -> bool {
        self.lives == Lives::Out
    }

    pub fn score(&self) -> PlayerScore {
        PlayerScore {
            id: self.id,
            lives: self.lives,
            kills: self.kills,
            damage: self.damage,
        }
    }

    pub fn lobby_info(&self) -> LobbyPlayer {
        LobbyPlayer {
            id: self.id,
            name: self.name.clone(),
            team: self.team,
        }
    }

    pub fn randomize_weapons<R: Rng>(&mut self, rng: &mut R, weapon_count: u8) {
        let count = weapon_count.max(1);
        self.weapons = (0..WEAPON_SLOTS).map(|_| rng.gen_range(0..count)).collect();
    }

    /// Resets everything that belongs to a single match.
    pub fn reset_for_match(&mut self, lives: Lives) {
        self.lives = lives;
        self.kills = 0;
        self.damage = 0;
        self.alive = false;
        self.spawned_once = false;
        self.weapons_ready = false;
        self.input_frozen = false;
    }
}

#[derive(Debug, Clone)]
pub struct PlayerPool {
    players: Vec<Player>,
}

impl PlayerPool {
    pub fn new() -> Self {
        Self {
            players: (0..MAX_PLAYERS).map(|i| Player::new(i as PlayerId)).collect(),
        }
    }

    /// Takes the first free slot for a joining player.
    pub fn allocate(&mut self, owner: usize, join: &JoinInfo) -> Option<&mut Player> {
        let slot = self.players.iter().position(|p| !p.used)?;
        let player = &mut self.players[slot];
        *player = Player::new(slot as PlayerId);
        player.used = true;
        player.owner = Some(owner);
        player.name = join.name.clone();
        player.team = join.team;
        player.is_bot = join.is_bot;
        Some(player)
    }

    /// Frees a player slot. Returns false if it was not in use.
    pub fn release(&mut self, id: PlayerId) -> bool {
        match self.players.get_mut(id as usize) {
            Some(player) if player.used => {
                player.used = false;
                player.alive = false;
                player.spectating = false;
                player.owner = None;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: PlayerId) -> Option<&Player> {
        self.players.get(id as usize).filter(|p| p.used)
    }

    pub fn get_mut(&mut self, id: PlayerId) -> Option<&mut Player> {
        self.players.get_mut(id as usize).filter(|p| p.used)
    }

    pub fn iter_used(&self) -> impl Iterator<Item = &Player> {
        self.players.iter().filter(|p| p.used)
    }

    pub fn iter_used_mut(&mut self) -> impl Iterator<Item = &mut Player> {
        self.players.iter_mut().filter(|p| p.used)
    }

    pub fn count_used(&self) -> usize {
        self.iter_used().count()
    }

    pub fn find_by_name(&self, name: &str) -> Option<PlayerId> {
        self.iter_used()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.id)
    }

    pub fn all_have_full_lives(&self, lives: Lives) -> bool {
        match lives {
            Lives::Count(full) => self.iter_used().all(|p| match p.lives {
                Lives::Count(n) => n >= full,
                Lives::Unlimited => true,
                Lives::Out => false,
            }),
            Lives::Unlimited | Lives::Out => true,
        }
    }

    pub fn is_team_empty(&self, team: u8) -> bool {
        !self.iter_used().any(|p| p.team == team)
    }

    pub fn first_empty_team(&self, team_count: u8) -> Option<u8> {
        (0..team_count).find(|t| self.is_team_empty(*t))
    }
}

impl Default for PlayerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn join(name: &str) -> JoinInfo {
        JoinInfo {
            name: name.to_string(),
            team: 1,
            is_bot: false,
        }
    }

    #[test]
    fn test_allocate_uses_first_free_slot() {
        let mut pool = PlayerPool::new();
        let a = pool.allocate(0, &join("a")).unwrap().id;
        let b = pool.allocate(0, &join("b")).unwrap().id;
        assert_eq!((a, b), (0, 1));

        assert!(pool.release(a));
        let c = pool.allocate(3, &join("c")).unwrap();
        assert_eq!(c.id, 0);
        assert_eq!(c.owner, Some(3));
        assert_eq!(c.team, 1);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = PlayerPool::new();
        for _ in 0..MAX_PLAYERS {
            assert!(pool.allocate(0, &join("x")).is_some());
        }
        assert!(pool.allocate(0, &join("y")).is_none());
        assert_eq!(pool.count_used(), MAX_PLAYERS);
    }

    #[test]
    fn test_release_twice() {
        let mut pool = PlayerPool::new();
        let id = pool.allocate(0, &join("a")).unwrap().id;
        assert!(pool.release(id));
        assert!(!pool.release(id));
        assert!(pool.get(id).is_none());
        assert!(!pool.release(200));
    }

    #[test]
    fn test_find_by_name_ignores_case() {
        let mut pool = PlayerPool::new();
        pool.allocate(0, &join("Lemming"));
        assert_eq!(pool.find_by_name("lemming"), Some(0));
        assert_eq!(pool.find_by_name("nobody"), None);
    }

    #[test]
    fn test_full_lives() {
        let mut pool = PlayerPool::new();
        let id = pool.allocate(0, &join("a")).unwrap().id;
        pool.get_mut(id).unwrap().lives = Lives::Count(10);
        assert!(pool.all_have_full_lives(Lives::Count(10)));

        pool.get_mut(id).unwrap().lives = Lives::Count(9);
        assert!(!pool.all_have_full_lives(Lives::Count(10)));
        assert!(pool.all_have_full_lives(Lives::Unlimited));
    }

    #[test]
    fn test_random_weapons_fill_every_slot() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut player = Player::new(0);
        player.randomize_weapons(&mut rng, 40);
        assert_eq!(player.weapons.len(), WEAPON_SLOTS);
        assert!(player.weapons.iter().all(|w| *w < 40));
    }

    #[test]
    fn test_first_empty_team() {
        let mut pool = PlayerPool::new();
        pool.allocate(0, &JoinInfo { name: "a".into(), team: 0, is_bot: false });
        assert_eq!(pool.first_empty_team(4), Some(1));
        assert_eq!(pool.first_empty_team(1), None);
    }
}
