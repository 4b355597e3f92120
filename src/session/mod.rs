//! Cache-resident per-member sessions that absorb activity and are flushed to the store in
//! batches.

use core::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::prelude::*;
use crate::leveling::{LevelCurve, granted_exp};
use crate::session::cache::CacheErr;

pub mod cache;
pub mod cached;
pub mod direct;
pub mod locks;
pub mod manager;

#[cfg(test)]
mod tests;

pub use manager::SessionManager;

/// Live state of one member of one guild. Absolute values here are the current truth; the
/// `*_to_flush` fields and `pending_games` are what the store has not seen yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub guild_id: GuildId,
    pub user_id: UserId,

    pub guild_exp: i64,
    pub guild_level: i32,
    pub guild_exp_gained: i64,
    pub streak: i32,
    pub currency: i64,
    /// Experience granted since the last flush, added to both scopes on the next one.
    #[serde(default)]
    pub exp_to_flush: i64,
    pub currency_to_flush: i64,
    pub messages_to_flush: i64,
    pub reactions_to_flush: i64,
    pub messages_this_session: i64,
    pub reactions_this_session: i64,

    pub global_exp: i64,
    pub global_level: i32,

    #[serde(default)]
    pub pending_games: Vec<GameOutcome>,

    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub last_xp_gain: Option<DateTime<Utc>>,
    pub session_start: DateTime<Utc>,
    pub dirty: bool,
    /// Bumped by every mutation that marks the session dirty.
    #[serde(default)]
    pub revision: u64,
}

/// What a flush actually got into the store; settled against the live session afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushedDeltas {
    pub exp: i64,
    /// Stored experience right after `exp` was added.
    pub totals: Option<ExperienceTotals>,
    pub currency: i64,
    pub messages: i64,
    pub reactions: i64,
    pub games: usize,
    /// Every step of the flush succeeded.
    pub complete: bool,
}

impl Session {
    pub fn from_records(
        member: &GuildUser,
        user: &GlobalUser,
        curve: LevelCurve,
        now: DateTime<Utc>,
    ) -> Self {
        let guild_exp = member.exp.max(0);
        let global_exp = user.global_exp.max(0);
        let guild_level = curve.level_for(guild_exp);
        let global_level = curve.level_for(global_exp);

        // a stored level that disagrees with stored exp gets corrected on the next flush
        let drifted = guild_level != member.level || global_level != user.global_level;

        Self {
            session_id: Uuid::new_v4(),
            guild_id: member.guild_id,
            user_id: member.user_id,
            guild_exp,
            guild_level,
            guild_exp_gained: member.exp_gained,
            streak: member.streak,
            currency: member.currency,
            exp_to_flush: 0,
            currency_to_flush: 0,
            messages_to_flush: 0,
            reactions_to_flush: 0,
            messages_this_session: 0,
            reactions_this_session: 0,
            global_exp,
            global_level,
            pending_games: Vec::new(),
            last_active: now,
            last_xp_gain: None,
            session_start: now,
            dirty: drifted,
            revision: u64::from(drifted),
        }
    }

    /// Parses and checks a cached document for `(guild_id, user_id)`.
    pub fn decode(
        raw: &str,
        guild_id: GuildId,
        user_id: UserId,
        curve: LevelCurve,
    ) -> SessionResult<Self> {
        let key = || cache::CacheKey::Session(guild_id, user_id).to_string();
        let mut session: Session =
            serde_json::from_str(raw).map_err(|source| SessionErr::Corrupt {
                key: key(),
                source,
            })?;

        let invalid = |reason: &str| SessionErr::Invalid {
            key: key(),
            reason: reason.to_owned(),
        };

        if session.guild_id != guild_id || session.user_id != user_id {
            return Err(invalid("identity does not match key"));
        }
        if session.guild_exp < 0 || session.global_exp < 0 {
            return Err(invalid("negative experience"));
        }
        if session.exp_to_flush < 0
            || session.messages_to_flush < 0
            || session.reactions_to_flush < 0
        {
            return Err(invalid("negative pending activity"));
        }

        let guild_level = curve.level_for(session.guild_exp);
        let global_level = curve.level_for(session.global_exp);
        if guild_level != session.guild_level || global_level != session.global_level {
            tracing::warn!(
                guild = %guild_id,
                user = %user_id,
                stored = session.guild_level,
                derived = guild_level,
                "repairing session level drift"
            );
            session.guild_level = guild_level;
            session.global_level = global_level;
            session.mark_dirty();
        }

        Ok(session)
    }

    pub fn encode(&self) -> SessionResult<String> {
        serde_json::to_string(self).map_err(SessionErr::Encode)
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.revision = self.revision.wrapping_add(1);
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_active = self.last_active.max(now);
    }

    /// Whether the last grant happened less than `cooldown` ago. A grant timestamp in the future
    /// also counts as cooling down.
    pub fn on_cooldown(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.last_xp_gain {
            None => false,
            Some(last) => match (now - last).to_std() {
                Ok(elapsed) => elapsed < cooldown,
                Err(_) => true,
            },
        }
    }

    /// Grants `ceil(base × multiplier)` unless the cooldown is still running.
    pub fn grant_experience(
        &mut self,
        base: u32,
        cooldown: Duration,
        multiplier: f64,
        curve: LevelCurve,
        now: DateTime<Utc>,
    ) -> XpGrant {
        if self.on_cooldown(now, cooldown) {
            self.touch(now);
            return XpGrant::none(self.guild_level);
        }

        let granted = granted_exp(base, multiplier);
        let previous = self.guild_level;

        self.guild_exp = self.guild_exp.saturating_add(granted);
        self.guild_exp_gained = self.guild_exp_gained.saturating_add(granted);
        self.exp_to_flush = self.exp_to_flush.saturating_add(granted);
        self.global_exp = self.global_exp.saturating_add(granted);
        self.guild_level = curve.level_for(self.guild_exp);
        self.global_level = curve.level_for(self.global_exp);
        self.last_xp_gain = Some(now);
        self.touch(now);
        self.mark_dirty();

        XpGrant {
            level_up: self.guild_level > previous,
            new_level: self.guild_level,
            granted,
        }
    }

    pub fn record_message(&mut self, now: DateTime<Utc>) {
        self.messages_to_flush += 1;
        self.messages_this_session += 1;
        self.touch(now);
        self.mark_dirty();
    }

    pub fn record_reaction(&mut self, now: DateTime<Utc>) {
        self.reactions_to_flush += 1;
        self.reactions_this_session += 1;
        self.touch(now);
        self.mark_dirty();
    }

    /// Returns the new balance.
    pub fn apply_currency(&mut self, delta: i64, now: DateTime<Utc>) -> i64 {
        self.currency = self.currency.saturating_add(delta);
        self.currency_to_flush = self.currency_to_flush.saturating_add(delta);
        self.touch(now);
        self.mark_dirty();
        self.currency
    }

    pub fn queue_game(&mut self, mut outcome: GameOutcome, now: DateTime<Utc>) {
        outcome.played_at.get_or_insert(now);
        self.pending_games.push(outcome);
        self.touch(now);
        self.mark_dirty();
    }

    /// Removes what `flushed` confirmed from the pending fields. Mutations made after
    /// `snapshot` was taken stay pending, and so does the dirty flag.
    ///
    /// When the flush reports stored experience totals, the absolute experience is rebased on
    /// them, so writes that reached the store some other way show up in the session.
    pub fn settle(&mut self, snapshot: &Session, flushed: &FlushedDeltas, curve: LevelCurve) {
        self.exp_to_flush = (self.exp_to_flush - flushed.exp).max(0);
        if let Some(totals) = flushed.totals {
            self.guild_exp = totals.guild_exp.saturating_add(self.exp_to_flush);
            self.global_exp = totals.global_exp.saturating_add(self.exp_to_flush);
            self.guild_level = curve.level_for(self.guild_exp);
            self.global_level = curve.level_for(self.global_exp);
        }

        self.currency_to_flush -= flushed.currency;
        self.messages_to_flush = (self.messages_to_flush - flushed.messages).max(0);
        self.reactions_to_flush = (self.reactions_to_flush - flushed.reactions).max(0);

        let games = flushed.games.min(self.pending_games.len());
        self.pending_games.drain(..games);

        if flushed.complete && self.revision == snapshot.revision {
            self.dirty = false;
        }
    }

    /// Levels follow `totals` when the flush added experience, otherwise the session's own.
    pub fn guild_progress(
        &self,
        totals: Option<ExperienceTotals>,
        curve: LevelCurve,
    ) -> GuildProgress {
        GuildProgress {
            guild_id: self.guild_id,
            user_id: self.user_id,
            level: totals.map_or(self.guild_level, |t| curve.level_for(t.guild_exp)),
            last_active: self.last_active,
        }
    }

    pub fn global_progress(
        &self,
        totals: Option<ExperienceTotals>,
        curve: LevelCurve,
    ) -> GlobalProgress {
        GlobalProgress {
            user_id: self.user_id,
            global_level: totals.map_or(self.global_level, |t| curve.level_for(t.global_exp)),
            last_seen: self.last_active,
        }
    }

    pub fn activity_increment(&self) -> Option<ActivityIncrement> {
        if self.messages_to_flush == 0 && self.reactions_to_flush == 0 {
            return None;
        }

        Some(ActivityIncrement {
            guild_id: self.guild_id,
            user_id: self.user_id,
            messages: self.messages_to_flush,
            reactions: self.reactions_to_flush,
            last_active: self.last_active,
        })
    }
}

/// Currency returned to a guild's pool, pending a flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vault {
    pub vault_id: Uuid,
    pub guild_id: GuildId,
    pub vault_currency_to_flush: i64,
    pub last_updated: DateTime<Utc>,
    pub dirty: bool,
    #[serde(default)]
    pub revision: u64,
}

impl Vault {
    pub fn new(guild_id: GuildId, now: DateTime<Utc>) -> Self {
        Self {
            vault_id: Uuid::new_v4(),
            guild_id,
            vault_currency_to_flush: 0,
            last_updated: now,
            dirty: false,
            revision: 0,
        }
    }

    pub fn decode(raw: &str, guild_id: GuildId) -> SessionResult<Self> {
        let key = || cache::CacheKey::Vault(guild_id).to_string();
        let vault: Vault = serde_json::from_str(raw).map_err(|source| SessionErr::Corrupt {
            key: key(),
            source,
        })?;

        if vault.guild_id != guild_id {
            return Err(SessionErr::Invalid {
                key: key(),
                reason: "identity does not match key".into(),
            });
        }
        Ok(vault)
    }

    pub fn encode(&self) -> SessionResult<String> {
        serde_json::to_string(self).map_err(SessionErr::Encode)
    }

    pub fn add(&mut self, amount: i64, now: DateTime<Utc>) {
        self.vault_currency_to_flush = self.vault_currency_to_flush.saturating_add(amount);
        self.last_updated = now;
        self.dirty = true;
        self.revision = self.revision.wrapping_add(1);
    }

    pub fn settle(&mut self, snapshot: &Vault) {
        self.vault_currency_to_flush -= snapshot.vault_currency_to_flush;
        if self.revision == snapshot.revision {
            self.dirty = false;
        }
    }
}

/// Result of an experience grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct XpGrant {
    pub level_up: bool,
    pub new_level: i32,
    /// Zero when the cooldown suppressed the grant.
    pub granted: i64,
}

impl XpGrant {
    pub fn none(level: i32) -> Self {
        Self {
            level_up: false,
            new_level: level,
            granted: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub sessions_flushed: usize,
    pub sessions_failed: usize,
    pub vaults_flushed: usize,
    pub vaults_failed: usize,
}

impl FlushReport {
    pub fn failures(&self) -> usize {
        self.sessions_failed + self.vaults_failed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub cache_available: bool,
    pub active_sessions: usize,
    pub dirty_sessions: usize,
    pub cached_vaults: usize,
    pub dirty_vaults: usize,
    pub flush_interval_secs: u64,
}

/// One way of applying activity to member state: through cached sessions, or straight to
/// the store.
#[async_trait]
pub trait SessionBackend: Send + Sync + fmt::Debug {
    /// `None` if the member has no stored records, or this backend does not hold sessions.
    async fn get_or_create_session(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> SessionResult<Option<Session>>;

    async fn grant_experience(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        base_amount: u32,
        cooldown: Duration,
        multiplier: f64,
    ) -> SessionResult<XpGrant>;

    async fn track_message_activity(&self, guild_id: GuildId, user_id: UserId)
    -> SessionResult<()>;

    async fn track_reaction_activity(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> SessionResult<()>;

    /// `None` if this backend has nothing for the member.
    async fn get_currency(&self, guild_id: GuildId, user_id: UserId) -> SessionResult<Option<i64>>;

    /// Returns the new balance.
    async fn update_currency(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        delta: i64,
    ) -> SessionResult<i64>;

    async fn queue_game_outcome(&self, outcome: GameOutcome) -> SessionResult<()>;

    async fn add_vault_currency(&self, guild_id: GuildId, amount: i64) -> SessionResult<()>;

    async fn get_vault_currency_delta(&self, guild_id: GuildId) -> SessionResult<i64>;

    async fn flush_dirty_sessions(&self) -> SessionResult<FlushReport>;

    /// `true` if anything was written.
    async fn flush_session(&self, guild_id: GuildId, user_id: UserId) -> SessionResult<bool>;

    /// Writes every session and vault whether dirty or not.
    async fn flush_all_sessions(&self) -> SessionResult<FlushReport>;

    /// Flushes the member's session and drops it, so the next call rebuilds it from the store.
    /// The session is kept if its flush fails.
    async fn evict_session(&self, guild_id: GuildId, user_id: UserId) -> SessionResult<()>;

    async fn stats(&self) -> SessionResult<SessionStats>;
}

pub type SessionResult<T> = core::result::Result<T, SessionErr>;

#[derive(Debug, Error)]
pub enum SessionErr {
    #[error("no session available for user {user_id} in guild {guild_id}")]
    NoSession { guild_id: GuildId, user_id: UserId },

    #[error("no stats record for user {user_id} in guild {guild_id}")]
    UserNotFound { guild_id: GuildId, user_id: UserId },

    #[error("experience multiplier must be finite and non-negative, got {0}")]
    InvalidMultiplier(f64),

    #[error(transparent)]
    Cache(#[from] CacheErr),

    #[error(transparent)]
    Store(#[from] StoreErr),

    #[error("session document {key} could not be decoded: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("session document {key} is invalid: {reason}")]
    Invalid { key: String, reason: String },

    #[error("session document could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

impl SessionErr {
    /// The cached path cannot serve this call, but a direct store write can.
    pub fn is_cache_failure(&self) -> bool {
        matches!(
            self,
            SessionErr::Cache(_) | SessionErr::Corrupt { .. } | SessionErr::Invalid { .. }
        )
    }
}

pub(crate) fn check_multiplier(multiplier: f64) -> SessionResult<()> {
    if multiplier.is_finite() && multiplier >= 0.0 {
        Ok(())
    } else {
        Err(SessionErr::InvalidMultiplier(multiplier))
    }
}
