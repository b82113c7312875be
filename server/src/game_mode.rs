//! Win conditions
//!
//! The session only asks a [`GameMode`] questions at fixed points: when a
//! match starts, when a player leaves and once per frame to see whether
//! the match is decided. Modes never touch connections or send packets.

use crate::config::{GameModeKind, GameSettings};
use crate::player::{Player, PlayerPool};
use shared::{Lives, PlayerId};
use std::time::Duration;

pub const MAX_TEAMS: u8 = 4;
const TEAM_NAMES: [&str; MAX_TEAMS as usize] = ["blue", "red", "green", "yellow"];

/// Read-only view of the match handed to a game mode.
pub struct GameContext<'a> {
    pub players: &'a PlayerPool,
    pub settings: &'a GameSettings,
    pub server_time: Duration,
}

impl GameContext<'_> {
    fn time_is_up(&self) -> bool {
        self.settings
            .time_limit()
            .is_some_and(|limit| self.server_time >= limit)
    }

    fn lives_limited(&self) -> bool {
        matches!(self.settings.lives, Lives::Count(_))
    }

    /// Players still taking part, in id order.
    fn standing(&self) -> impl Iterator<Item = &Player> {
        self.players.iter_used().filter(|p| !p.is_out())
    }

    fn team_kills(&self, team: u8) -> i32 {
        self.players
            .iter_used()
            .filter(|p| p.team == team)
            .map(|p| p.kills as i32)
            .sum()
    }

    fn teams_standing(&self, team_count: u8) -> Vec<u8> {
        (0..team_count)
            .filter(|t| self.standing().any(|p| p.team == *t))
            .collect()
    }

    fn teams_populated(&self, team_count: u8) -> usize {
        (0..team_count)
            .filter(|t| self.players.iter_used().any(|p| p.team == *t))
            .count()
    }
}

pub trait GameMode: Send {
    fn name(&self) -> &'static str;

    fn team_count(&self) -> u8 {
        1
    }

    fn is_team_game(&self) -> bool {
        self.team_count() > 1
    }

    fn team_name(&self, team: u8) -> String {
        TEAM_NAMES
            .get(team as usize)
            .map_or_else(|| format!("team {}", team), |name| name.to_string())
    }

    /// Called once when the match goes live.
    fn prepare_game(&mut self, _players: &PlayerPool) {}

    /// Called for every player that leaves the match.
    fn on_drop(&mut self, _player: &Player) {}

    fn check_game_over(&mut self, ctx: &GameContext) -> bool;

    fn winner(&self, ctx: &GameContext) -> Option<PlayerId>;

    fn winning_team(&self, _ctx: &GameContext) -> Option<u8> {
        None
    }

    fn team_score(&self, _ctx: &GameContext, _team: u8) -> i32 {
        0
    }
}

pub fn for_kind(kind: GameModeKind) -> Box<dyn GameMode> {
    match kind {
        GameModeKind::Deathmatch => Box::new(Deathmatch),
        GameModeKind::TeamDeathmatch => Box::new(TeamDeathmatch),
        GameModeKind::CaptureTheFlag => Box::new(CaptureTheFlag::default()),
    }
}

/// Every player for themselves.
#[derive(Debug, Default)]
pub struct Deathmatch;

impl GameMode for Deathmatch {
    fn name(&self) -> &'static str {
        "Death Match"
    }

    fn check_game_over(&mut self, ctx: &GameContext) -> bool {
        if ctx.time_is_up() {
            return true;
        }
        if let Some(limit) = ctx.settings.kill_limit {
            if ctx.standing().any(|p| p.kills >= limit) {
                return true;
            }
        }
        ctx.lives_limited() && ctx.players.count_used() > 1 && ctx.standing().count() <= 1
    }

    fn winner(&self, ctx: &GameContext) -> Option<PlayerId> {
        // Highest kills wins; ties go to the lower id
        ctx.standing()
            .fold(None::<&Player>, |best, p| match best {
                Some(b) if b.kills >= p.kills => Some(b),
                _ => Some(p),
            })
            .map(|p| p.id)
    }
}

#[derive(Debug, Default)]
pub struct TeamDeathmatch;

impl GameMode for TeamDeathmatch {
    fn name(&self) -> &'static str {
        "Team Death Match"
    }

    fn team_count(&self) -> u8 {
        MAX_TEAMS
    }

    fn check_game_over(&mut self, ctx: &GameContext) -> bool {
        if ctx.time_is_up() {
            return true;
        }
        if let Some(limit) = ctx.settings.kill_limit {
            if (0..self.team_count()).any(|t| ctx.team_kills(t) >= limit as i32) {
                return true;
            }
        }
        ctx.lives_limited()
            && ctx.teams_populated(self.team_count()) > 1
            && ctx.teams_standing(self.team_count()).len() <= 1
    }

    fn winner(&self, _ctx: &GameContext) -> Option<PlayerId> {
        None
    }

    fn winning_team(&self, ctx: &GameContext) -> Option<u8> {
        let standing = ctx.teams_standing(self.team_count());
        if ctx.lives_limited() && standing.len() == 1 {
            return standing.first().copied();
        }
        best_team(self.team_count(), |t| self.team_score(ctx, t))
    }

    fn team_score(&self, ctx: &GameContext, team: u8) -> i32 {
        ctx.team_kills(team)
    }
}

/// Teams score by bringing the enemy flag home.
///
/// Flag handling happens in the simulation, which reports captures through
/// [`CaptureTheFlag::capture`].
#[derive(Debug, Default)]
pub struct CaptureTheFlag {
    scores: [i32; MAX_TEAMS as usize],
}

impl CaptureTheFlag {
    pub fn capture(&mut self, team: u8) {
        if let Some(score) = self.scores.get_mut(team as usize) {
            *score += 1;
        }
    }
}

impl GameMode for CaptureTheFlag {
    fn name(&self) -> &'static str {
        "Capture The Flag"
    }

    fn team_count(&self) -> u8 {
        MAX_TEAMS
    }

    fn prepare_game(&mut self, _players: &PlayerPool) {
        self.scores = [0; MAX_TEAMS as usize];
    }

    fn check_game_over(&mut self, ctx: &GameContext) -> bool {
        if ctx.time_is_up() {
            return true;
        }
        // The kill limit doubles as the capture limit
        if let Some(limit) = ctx.settings.kill_limit {
            if self.scores.iter().any(|s| *s >= limit as i32) {
                return true;
            }
        }
        if ctx.players.count_used() > 0 && ctx.standing().next().is_none() {
            return true;
        }
        ctx.teams_populated(self.team_count()) > 1 && ctx.teams_standing(self.team_count()).len() <= 1
    }

    fn winner(&self, _ctx: &GameContext) -> Option<PlayerId> {
        None
    }

    fn winning_team(&self, ctx: &GameContext) -> Option<u8> {
        best_team(self.team_count(), |t| self.team_score(ctx, t))
    }

    fn team_score(&self, _ctx: &GameContext, team: u8) -> i32 {
        self.scores.get(team as usize).copied().unwrap_or(-1)
    }
}

/// Team with the strictly highest score.
fn best_team(team_count: u8, score: impl Fn(u8) -> i32) -> Option<u8> {
    let mut best: Option<(u8, i32)> = None;
    let mut tied = false;
    for team in 0..team_count {
        let s = score(team);
        match best {
            Some((_, b)) if s == b => tied = true,
            Some((_, b)) if s < b => {}
            _ => {
                best = Some((team, s));
                tied = false;
            }
        }
    }
    if tied {
        None
    } else {
        best.map(|(team, _)| team)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::JoinInfo;

    fn pool(teams: &[u8]) -> PlayerPool {
        let mut pool = PlayerPool::new();
        for (i, team) in teams.iter().enumerate() {
            let player = pool
                .allocate(
                    0,
                    &JoinInfo {
                        name: format!("p{}", i),
                        team: *team,
                        is_bot: false,
                    },
                )
                .unwrap();
            player.lives = Lives::Count(3);
        }
        pool
    }

    fn ctx<'a>(players: &'a PlayerPool, settings: &'a GameSettings) -> GameContext<'a> {
        GameContext {
            players,
            settings,
            server_time: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_deathmatch_kill_limit() {
        let settings = GameSettings {
            kill_limit: Some(5),
            ..GameSettings::default()
        };
        let mut players = pool(&[0, 0]);
        let mut mode = Deathmatch;

        assert!(!mode.check_game_over(&ctx(&players, &settings)));
        players.get_mut(1).unwrap().kills = 5;
        assert!(mode.check_game_over(&ctx(&players, &settings)));
        assert_eq!(mode.winner(&ctx(&players, &settings)), Some(1));
    }

    #[test]
    fn test_deathmatch_last_one_standing() {
        let settings = GameSettings {
            kill_limit: None,
            lives: Lives::Count(3),
            ..GameSettings::default()
        };
        let mut players = pool(&[0, 0, 0]);
        let mut mode = Deathmatch;

        players.get_mut(0).unwrap().lives = Lives::Out;
        assert!(!mode.check_game_over(&ctx(&players, &settings)));
        players.get_mut(2).unwrap().lives = Lives::Out;
        assert!(mode.check_game_over(&ctx(&players, &settings)));
        assert_eq!(mode.winner(&ctx(&players, &settings)), Some(1));
    }

    #[test]
    fn test_time_limit() {
        let settings = GameSettings {
            kill_limit: None,
            time_limit_minutes: Some(0.1),
            ..GameSettings::default()
        };
        let players = pool(&[0, 0]);
        let mut mode = Deathmatch;
        let mut context = ctx(&players, &settings);

        context.server_time = Duration::from_secs(5);
        assert!(!mode.check_game_over(&context));
        context.server_time = Duration::from_secs(6);
        assert!(mode.check_game_over(&context));
    }

    #[test]
    fn test_team_deathmatch_scores() {
        let settings = GameSettings {
            kill_limit: Some(4),
            ..GameSettings::default()
        };
        let mut players = pool(&[0, 1, 1]);
        players.get_mut(1).unwrap().kills = 2;
        players.get_mut(2).unwrap().kills = 2;
        let mut mode = TeamDeathmatch;

        let context = ctx(&players, &settings);
        assert_eq!(mode.team_score(&context, 1), 4);
        assert!(mode.check_game_over(&context));
        assert_eq!(mode.winning_team(&context), Some(1));
        assert_eq!(mode.winner(&context), None);
        assert!(mode.is_team_game());
    }

    #[test]
    fn test_capture_the_flag() {
        let settings = GameSettings {
            kill_limit: Some(2),
            lives: Lives::Unlimited,
            ..GameSettings::default()
        };
        let players = pool(&[0, 1]);
        let mut mode = CaptureTheFlag::default();

        mode.capture(1);
        assert!(!mode.check_game_over(&ctx(&players, &settings)));
        mode.capture(1);
        assert!(mode.check_game_over(&ctx(&players, &settings)));
        assert_eq!(mode.winning_team(&ctx(&players, &settings)), Some(1));

        mode.prepare_game(&players);
        assert_eq!(mode.team_score(&ctx(&players, &settings), 1), 0);
    }

    #[test]
    fn test_best_team_tie() {
        assert_eq!(best_team(2, |_| 3), None);
        assert_eq!(best_team(3, |t| t as i32), Some(2));
    }

    #[test]
    fn test_team_names() {
        assert_eq!(Deathmatch.team_name(1), "red");
        assert_eq!(Deathmatch.team_name(9), "team 9");
    }
}
