use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::instrument;

use crate::config::SessionConfig;
use crate::db::prelude::*;
use crate::leveling::LevelCurve;
use crate::session::cache::SessionCache;
use crate::session::cached::CachedSessions;
use crate::session::direct::DirectWrite;
use crate::session::{
    FlushReport, Session, SessionBackend, SessionErr, SessionResult, SessionStats, XpGrant,
};
use crate::util::Clock;

/// What to do when the cached path reports there is no session for the member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnMissing {
    /// Create the session from the store and retry; unknown users are an error.
    Create,
    /// As `Create`, but unknown users get a direct incrementing write instead.
    CreateOrWriteThrough,
}

/// Entry point for every session operation.
///
/// Holds the backend chosen at startup and a [`DirectWrite`] fallback. Any call the cached
/// backend cannot serve (cache down, timed out, unreadable document) is retried once against the
/// fallback, so activity is never dropped. Entering and leaving degraded mode is logged once
/// each.
///
/// Members written directly while the cache was failing are remembered. Their cached session
/// is flushed and dropped before it serves another call, so it is rebuilt from the store with
/// the direct writes included.
#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    primary: Arc<dyn SessionBackend>,
    fallback: Arc<dyn SessionBackend>,
    cached: bool,
    degraded: AtomicBool,
    written_directly: Mutex<HashSet<(GuildId, UserId)>>,
}

impl SessionManager {
    /// `cache` is `None` when the cache could not be reached at startup; every operation then
    /// goes straight to the store.
    pub fn new(
        cache: Option<Arc<dyn SessionCache>>,
        store: Arc<dyn StatsStore>,
        clock: Arc<dyn Clock>,
        curve: LevelCurve,
        config: SessionConfig,
    ) -> Self {
        let fallback: Arc<dyn SessionBackend> = Arc::new(DirectWrite::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            curve,
            config.store_timeout,
            config.ttl,
        ));

        let (primary, cached) = match cache {
            Some(cache) => {
                let sessions: Arc<dyn SessionBackend> =
                    Arc::new(CachedSessions::new(cache, store, clock, curve, config));
                (sessions, true)
            }
            None => {
                tracing::warn!("session cache unavailable, writing all activity directly");
                (Arc::clone(&fallback), false)
            }
        };

        Self {
            inner: Arc::new(Inner {
                primary,
                fallback,
                cached,
                degraded: AtomicBool::new(!cached),
                written_directly: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Connects `connect`'s cache within `timeout` and builds the manager around it, or around
    /// direct writes if the cache does not answer.
    pub async fn init<F>(
        connect: F,
        timeout: Duration,
        store: Arc<dyn StatsStore>,
        clock: Arc<dyn Clock>,
        curve: LevelCurve,
        config: SessionConfig,
    ) -> Self
    where
        F: Future<Output = SessionResult<Arc<dyn SessionCache>>>,
    {
        let cache = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(cache)) => match cache.ping().await {
                Ok(()) => Some(cache),
                Err(e) => {
                    tracing::warn!(error = %e, "session cache did not answer ping");
                    None
                }
            },
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "could not connect to session cache");
                None
            }
            Err(_) => {
                tracing::warn!(?timeout, "timed out connecting to session cache");
                None
            }
        };

        Self::new(cache, store, clock, curve, config)
    }

    pub fn is_cached(&self) -> bool {
        self.inner.cached
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Relaxed)
    }

    fn note_degraded(&self, op: &'static str, err: &SessionErr) {
        if !self.inner.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                op,
                error = %err,
                "session cache failing, falling back to direct writes"
            );
        } else {
            tracing::debug!(op, error = %err, "direct write fallback");
        }
    }

    fn note_healthy(&self) {
        if self.inner.cached && self.inner.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!("session cache recovered");
        }
    }

    fn written_directly(&self) -> std::sync::MutexGuard<'_, HashSet<(GuildId, UserId)>> {
        self.inner
            .written_directly
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a fallback call standing in for a failed cached one, remembering the member if it
    /// wrote anything.
    async fn write_directly<T>(
        &self,
        member: (GuildId, UserId),
        call: BoxFuture<'_, SessionResult<T>>,
    ) -> SessionResult<T> {
        let result = call.await;
        if result.is_ok() && self.inner.cached {
            self.written_directly().insert(member);
        }
        result
    }

    /// Drops the member's cached session if direct writes happened since it was loaded.
    async fn refresh_after_direct_writes(&self, member: (GuildId, UserId)) {
        let recorded = self.written_directly().remove(&member);
        if !recorded {
            return;
        }

        let (guild_id, user_id) = member;
        match self.inner.primary.evict_session(guild_id, user_id).await {
            Ok(()) => tracing::debug!(
                guild = %guild_id,
                user = %user_id,
                "session reloaded after direct writes"
            ),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    guild = %guild_id,
                    user = %user_id,
                    "could not drop session after direct writes, retrying on next call"
                );
                self.written_directly().insert(member);
            }
        }
    }

    /// Runs `call` against the primary backend, creating the session on demand and falling back
    /// to direct writes for this one call if the cache cannot serve it.
    async fn dispatch<'a, T, F>(
        &'a self,
        op: &'static str,
        member: (GuildId, UserId),
        on_missing: OnMissing,
        call: F,
    ) -> SessionResult<T>
    where
        F: Fn(&'a dyn SessionBackend) -> BoxFuture<'a, SessionResult<T>>,
        T: Send + 'a,
    {
        let primary = self.inner.primary.as_ref();
        let fallback = self.inner.fallback.as_ref();
        let (guild_id, user_id) = member;

        self.refresh_after_direct_writes(member).await;

        let first = match call(primary).await {
            Err(SessionErr::NoSession { .. }) => None,
            Err(e) if e.is_cache_failure() => {
                self.note_degraded(op, &e);
                return self.write_directly(member, call(fallback)).await;
            }
            other => Some(other),
        };

        self.note_healthy();
        if let Some(result) = first {
            return result;
        }

        match primary.get_or_create_session(guild_id, user_id).await {
            Ok(Some(_)) => match call(primary).await {
                Err(e) if e.is_cache_failure() => {
                    self.note_degraded(op, &e);
                    self.write_directly(member, call(fallback)).await
                }
                other => other,
            },
            Ok(None) if on_missing == OnMissing::CreateOrWriteThrough => {
                tracing::debug!(
                    op,
                    guild = %guild_id,
                    user = %user_id,
                    "no stored user, writing activity through"
                );
                call(fallback).await
            }
            Ok(None) => Err(SessionErr::UserNotFound { guild_id, user_id }),
            Err(e) if e.is_cache_failure() => {
                self.note_degraded(op, &e);
                self.write_directly(member, call(fallback)).await
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_or_create_session(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> SessionResult<Option<Session>> {
        self.refresh_after_direct_writes((guild_id, user_id)).await;
        match self.inner.primary.get_or_create_session(guild_id, user_id).await {
            Err(e) if e.is_cache_failure() => {
                self.note_degraded("get_or_create_session", &e);
                Ok(None)
            }
            other => other,
        }
    }

    pub async fn grant_experience(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        base_amount: u32,
        cooldown: Duration,
        multiplier: f64,
    ) -> SessionResult<XpGrant> {
        self.dispatch(
            "grant_experience",
            (guild_id, user_id),
            OnMissing::Create,
            |backend| {
                backend.grant_experience(guild_id, user_id, base_amount, cooldown, multiplier)
            },
        )
        .await
    }

    pub async fn track_message_activity(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> SessionResult<()> {
        self.dispatch(
            "track_message_activity",
            (guild_id, user_id),
            OnMissing::CreateOrWriteThrough,
            |backend| backend.track_message_activity(guild_id, user_id),
        )
        .await
    }

    pub async fn track_reaction_activity(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> SessionResult<()> {
        self.dispatch(
            "track_reaction_activity",
            (guild_id, user_id),
            OnMissing::CreateOrWriteThrough,
            |backend| backend.track_reaction_activity(guild_id, user_id),
        )
        .await
    }

    /// The live session balance if a session exists, otherwise the stored one.
    pub async fn get_currency(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> SessionResult<Option<i64>> {
        self.refresh_after_direct_writes((guild_id, user_id)).await;
        match self.inner.primary.get_currency(guild_id, user_id).await {
            Ok(Some(currency)) => Ok(Some(currency)),
            Ok(None) => self.inner.fallback.get_currency(guild_id, user_id).await,
            Err(e) if e.is_cache_failure() => {
                self.note_degraded("get_currency", &e);
                self.inner.fallback.get_currency(guild_id, user_id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the new balance.
    pub async fn update_currency(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        delta: i64,
    ) -> SessionResult<i64> {
        self.dispatch(
            "update_currency",
            (guild_id, user_id),
            OnMissing::Create,
            |backend| backend.update_currency(guild_id, user_id, delta),
        )
        .await
    }

    pub async fn queue_game_outcome(&self, outcome: GameOutcome) -> SessionResult<()> {
        let member = (outcome.guild_id, outcome.user_id);
        self.dispatch(
            "queue_game_outcome",
            member,
            OnMissing::Create,
            |backend| backend.queue_game_outcome(outcome.clone()),
        )
        .await
    }

    pub async fn add_vault_currency(&self, guild_id: GuildId, amount: i64) -> SessionResult<()> {
        match self.inner.primary.add_vault_currency(guild_id, amount).await {
            Err(e) if e.is_cache_failure() => {
                self.note_degraded("add_vault_currency", &e);
                self.inner.fallback.add_vault_currency(guild_id, amount).await
            }
            other => other,
        }
    }

    pub async fn get_vault_currency_delta(&self, guild_id: GuildId) -> SessionResult<i64> {
        match self.inner.primary.get_vault_currency_delta(guild_id).await {
            Err(e) if e.is_cache_failure() => Ok(0),
            other => other,
        }
    }

    pub async fn flush_dirty_sessions(&self) -> SessionResult<FlushReport> {
        // the fallback keeps in-process cooldowns that need pruning too
        if self.inner.cached {
            self.inner.fallback.flush_dirty_sessions().await?;
        }
        self.inner.primary.flush_dirty_sessions().await
    }

    pub async fn flush_session(&self, guild_id: GuildId, user_id: UserId) -> SessionResult<bool> {
        self.inner.primary.flush_session(guild_id, user_id).await
    }

    pub async fn flush_all_sessions(&self) -> SessionResult<FlushReport> {
        self.inner.primary.flush_all_sessions().await
    }

    pub async fn stats(&self) -> SessionResult<SessionStats> {
        match self.inner.primary.stats().await {
            Err(e) if e.is_cache_failure() => self.inner.fallback.stats().await,
            other => other,
        }
    }
}
