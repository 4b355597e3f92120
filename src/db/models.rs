use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct GuildId(pub i64);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Base `guild_users` table model
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct GuildUser {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub exp: i64,
    pub level: i32,
    pub exp_gained: i64,
    pub streak: i32,
    pub currency: i64,
    pub messages_sent: i64,
    pub reactions_sent: i64,
    pub last_active: Option<DateTime<Utc>>,
}

/// Base `users` table model
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct GlobalUser {
    pub user_id: UserId,
    pub global_exp: i64,
    pub global_level: i32,
    pub total_currency: i64,
    pub total_messages: i64,
    pub total_reactions: i64,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Guild-scoped level and last activity written by a session flush. Experience itself is only
/// ever added, through [`crate::db::StatsStore::add_experience`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuildProgress {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub level: i32,
    pub last_active: DateTime<Utc>,
}

/// Global level and last seen written by a session flush.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalProgress {
    pub user_id: UserId,
    pub global_level: i32,
    pub last_seen: DateTime<Utc>,
}

/// Counts added to both `guild_users` and `users` in one atomic upsert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityIncrement {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub messages: i64,
    pub reactions: i64,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrencyChange {
    pub before: i64,
    pub after: i64,
}

/// Experience totals after an atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExperienceTotals {
    pub guild_exp: i64,
    pub global_exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameResult {
    Win,
    Loss,
    Draw,
}

impl GameResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameResult::Win => "win",
            GameResult::Loss => "loss",
            GameResult::Draw => "draw",
        }
    }
}

/// A finished game waiting to be written to `game_outcomes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameOutcome {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub game_type: String,
    pub wager: i64,
    pub amount_won: i64,
    pub amount_lost: i64,
    pub result: GameResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Filled in with the current time when queued, if unset.
    #[serde(default)]
    pub played_at: Option<DateTime<Utc>>,
}
