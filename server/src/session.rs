//! Match phase and match clock

use crate::player::PlayerPool;
use log::info;
use shared::Phase;
use std::time::{Duration, Instant};

/// Seconds before the weapon selection deadline at which players are
/// warned, most urgent first.
pub const WEAPON_WARNING_SECONDS: [u32; 4] = [5, 10, 30, 60];
const WARNING_SLACK: f32 = 0.2;

/// Physics and gameplay stepping, driven once per frame while playing.
pub trait Simulation: Send {
    fn simulate(&mut self, players: &mut PlayerPool, dt: Duration);
}

/// A simulation that leaves the world untouched.
#[derive(Debug, Default)]
pub struct IdleSimulation;

impl Simulation for IdleSimulation {
    fn simulate(&mut self, _players: &mut PlayerPool, _dt: Duration) {}
}

#[derive(Debug, Clone)]
pub struct Session {
    pub phase: Phase,
    pub game_over: bool,
    /// Time played in the current match. Frozen outside `Playing`.
    pub server_time: Duration,
    pub frame_counter: u64,
    pub weapon_selection_started_at: Option<Instant>,
    /// Smallest warning threshold already announced.
    pub last_weapon_warning: Option<u32>,
    pub game_over_at: Option<Instant>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Phase::Lobby,
            game_over: false,
            server_time: Duration::ZERO,
            frame_counter: 0,
            weapon_selection_started_at: None,
            last_weapon_warning: None,
            game_over_at: None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.phase == Phase::Playing
    }

    /// Advances the match clock. Returns false outside `Playing`.
    pub fn advance(&mut self, dt: Duration) -> bool {
        if self.phase != Phase::Playing {
            return false;
        }
        self.server_time += dt;
        self.frame_counter += 1;
        true
    }

    pub fn enter_weapon_selection(&mut self, now: Instant) {
        self.phase = Phase::WeaponSelection;
        self.game_over = false;
        self.game_over_at = None;
        self.frame_counter = 0;
        self.weapon_selection_started_at = Some(now);
        self.last_weapon_warning = None;
        info!("Weapon selection started");
    }

    /// Switches to `Playing`. Returns false if the match already runs.
    pub fn enter_playing(&mut self) -> bool {
        if self.phase == Phase::Playing {
            return false;
        }
        self.phase = Phase::Playing;
        self.server_time = Duration::ZERO;
        self.frame_counter = 0;
        self.game_over = false;
        self.game_over_at = None;
        info!("Match started");
        true
    }

    pub fn enter_lobby(&mut self) {
        self.phase = Phase::Lobby;
        self.game_over = false;
        self.game_over_at = None;
        self.weapon_selection_started_at = None;
        info!("Back in the lobby");
    }

    /// Marks the match as over. Returns false if it already was.
    pub fn finish(&mut self, now: Instant) -> bool {
        if self.game_over {
            return false;
        }
        self.game_over = true;
        self.game_over_at = Some(now);
        true
    }

    /// Returns the threshold to announce now, if any.
    ///
    /// At most one warning fires per call, and a threshold is never
    /// announced after a more urgent one.
    pub fn weapon_selection_warning(&mut self, time_left: f32) -> Option<u32> {
        for threshold in WEAPON_WARNING_SECONDS {
            if self.last_weapon_warning.is_some_and(|last| threshold >= last) {
                return None;
            }
            if time_left < threshold as f32 + WARNING_SLACK {
                self.last_weapon_warning = Some(threshold);
                return Some(threshold);
            }
        }
        None
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_frozen_outside_playing() {
        let mut session = Session::new();
        assert!(!session.advance(Duration::from_millis(10)));
        assert_eq!(session.server_time, Duration::ZERO);

        session.enter_weapon_selection(Instant::now());
        assert!(!session.advance(Duration::from_millis(10)));
        assert_eq!(session.frame_counter, 0);

        assert!(session.enter_playing());
        assert!(session.advance(Duration::from_millis(10)));
        assert!(session.advance(Duration::from_millis(10)));
        assert_eq!(session.server_time, Duration::from_millis(20));
        assert_eq!(session.frame_counter, 2);
    }

    #[test]
    fn test_enter_playing_once() {
        let mut session = Session::new();
        assert!(session.enter_playing());
        session.advance(Duration::from_secs(1));
        assert!(!session.enter_playing());
        assert_eq!(session.server_time, Duration::from_secs(1));
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut session = Session::new();
        session.enter_playing();
        let now = Instant::now();
        assert!(session.finish(now));
        assert!(!session.finish(now + Duration::from_secs(1)));
        assert_eq!(session.game_over_at, Some(now));
    }

    #[test]
    fn test_weapon_warnings_descend() {
        let mut session = Session::new();
        session.enter_weapon_selection(Instant::now());

        let mut fired = Vec::new();
        let mut time_left = 120.0;
        while time_left > 0.0 {
            if let Some(t) = session.weapon_selection_warning(time_left) {
                fired.push(t);
            }
            time_left -= 0.1;
        }
        assert_eq!(fired, vec![60, 30, 10, 5]);
    }

    #[test]
    fn test_weapon_warning_skips_to_most_urgent() {
        let mut session = Session::new();
        session.enter_weapon_selection(Instant::now());

        assert_eq!(session.weapon_selection_warning(4.0), Some(5));
        assert_eq!(session.weapon_selection_warning(3.0), None);
        assert_eq!(session.weapon_selection_warning(50.0), None);
    }
}
