//! Localizable network texts and placeholder substitution

use serde::{Deserialize, Serialize};

/// A template set to this value is never sent.
pub const NONE_TEXT: &str = "<none>";

/// Replaces at most `max` occurrences of `from` in `text`.
pub fn replace_max(text: &str, from: &str, to: &str, max: usize) -> String {
    text.replacen(from, to, max)
}

/// Fills the `<player>` placeholder of a template.
pub fn with_player(template: &str, player: &str) -> String {
    replace_max(template, "<player>", player, 1)
}

/// Texts broadcast to players when something happens to somebody else,
/// and the messages shown to the affected client itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkTexts {
    pub has_left: String,
    pub has_timed_out: String,
    pub has_been_kicked: String,
    pub has_been_kicked_reason: String,
    pub has_been_banned: String,
    pub has_been_banned_reason: String,
    pub has_been_muted: String,
    pub has_been_unmuted: String,
    pub you_quit: String,
    pub you_timed_out: String,
    pub kicked_you: String,
    pub kicked_you_reason: String,
    pub banned_you: String,
    pub banned_you_reason: String,
    pub player_has_won: String,
    pub team_has_won: String,
}

impl Default for NetworkTexts {
    fn default() -> Self {
        Self {
            has_left: "<player> has left".into(),
            has_timed_out: "<player> has timed out".into(),
            has_been_kicked: "<player> has been kicked out".into(),
            has_been_kicked_reason: "<player> has been kicked out because <reason>".into(),
            has_been_banned: "<player> has been banned".into(),
            has_been_banned_reason: "<player> has been banned because <reason>".into(),
            has_been_muted: "<player> has been muted".into(),
            has_been_unmuted: "<player> has been unmuted".into(),
            you_quit: "You have quit".into(),
            you_timed_out: "You timed out".into(),
            kicked_you: "You have been kicked".into(),
            kicked_you_reason: "You have been kicked: <reason>".into(),
            banned_you: "You have been banned".into(),
            banned_you_reason: "You have been banned: <reason>".into(),
            player_has_won: "<player> has won the match".into(),
            team_has_won: "<team> team has won the match".into(),
        }
    }
}

/// Rewrites a reason written to the kicked player ("you ...") so it reads
/// naturally for everybody else.
pub fn third_person(text: &str) -> String {
    let text = replace_max(text, "your", "their", 5);
    replace_max(&text, "you", "they", 5)
}
