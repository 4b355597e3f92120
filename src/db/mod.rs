use core::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod models;
pub mod pg;
pub mod redis;
pub mod schema;

#[cfg(test)]
pub mod testing;

pub mod prelude {
    pub use crate::db::models::{
        ActivityIncrement, CurrencyChange, ExperienceTotals, GameOutcome, GameResult, GlobalProgress,
        GlobalUser, GuildId, GuildProgress, GuildUser, UserId,
    };
    pub use crate::db::{StatsStore, StoreErr, StoreResult};
}

use crate::leveling::LevelCurve;
use models::{
    ActivityIncrement, CurrencyChange, ExperienceTotals, GameOutcome, GlobalProgress, GlobalUser,
    GuildId, GuildProgress, GuildUser, UserId,
};

/// Persistent guild/global statistics.
///
/// Every additive method is a single atomic statement (or transaction) on the store side, so
/// concurrent callers never lose increments.
#[async_trait]
pub trait StatsStore: Send + Sync + fmt::Debug {
    async fn get_guild_user(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> StoreResult<Option<GuildUser>>;

    async fn get_user(&self, user_id: UserId) -> StoreResult<Option<GlobalUser>>;

    /// Sets level and last active for one guild member.
    async fn update_guild_progress(&self, progress: &GuildProgress) -> StoreResult<()>;

    /// Sets global level and stamps last seen.
    async fn update_global_progress(&self, progress: &GlobalProgress) -> StoreResult<()>;

    /// Adds `amount` to guild and global experience. `None` if either record is missing.
    async fn add_experience(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        amount: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<ExperienceTotals>>;

    /// Raises stored levels to at least the given values; never lowers them.
    async fn raise_levels(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        guild_level: i32,
        global_level: i32,
    ) -> StoreResult<()>;

    /// Adds message/reaction counts to both the guild member row and the global user row,
    /// creating either if absent.
    async fn increment_activity(&self, increments: &[ActivityIncrement]) -> StoreResult<()>;

    /// Applies a signed currency delta to the member's wallet and the user's global total.
    async fn apply_currency_delta(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        delta: i64,
    ) -> StoreResult<CurrencyChange>;

    /// Inserts all outcomes in one statement, returning the number of rows written.
    async fn insert_game_outcomes(&self, outcomes: &[GameOutcome]) -> StoreResult<u64>;

    async fn add_vault_currency(&self, guild_id: GuildId, amount: i64) -> StoreResult<()>;

    /// Rebuilds each user's message, reaction and experience totals from their guild rows and
    /// re-derives the global level with `curve`. Returns how many users were corrected.
    async fn reconcile_global_stats(&self, curve: LevelCurve) -> StoreResult<u64>;
}

/// Runs a store call under `limit`, mapping an elapsed deadline to [`StoreErr::Timeout`].
pub async fn bounded<T, F>(limit: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreErr::Timeout(limit))?
}

pub type StoreResult<T> = core::result::Result<T, StoreErr>;

#[derive(Debug, Error)]
pub enum StoreErr {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("no stats record for user {user_id} in guild {guild_id}")]
    MissingRecord { guild_id: GuildId, user_id: UserId },

    #[error("store call did not complete within {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
