use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::db::bounded;
use crate::db::prelude::*;
use crate::leveling::LevelCurve;
use crate::session::cache::{CacheKey, SessionCache};
use crate::session::locks::KeyedLocks;
use crate::session::{
    FlushReport, FlushedDeltas, Session, SessionBackend, SessionErr, SessionResult, SessionStats,
    Vault, XpGrant, check_multiplier,
};
use crate::util::Clock;

/// Sessions held in a [`SessionCache`] and written to the store by periodic flushes.
///
/// Every read-modify-write of a document runs under that document's key lock. A flush takes a
/// snapshot under the lock, writes it to the store without holding the lock, then re-locks and
/// subtracts what was written from whatever the document holds by then.
#[derive(Debug)]
pub struct CachedSessions {
    cache: Arc<dyn SessionCache>,
    store: Arc<dyn StatsStore>,
    clock: Arc<dyn Clock>,
    curve: LevelCurve,
    config: SessionConfig,
    locks: KeyedLocks,
    flush_locks: KeyedLocks,
}

impl CachedSessions {
    pub fn new(
        cache: Arc<dyn SessionCache>,
        store: Arc<dyn StatsStore>,
        clock: Arc<dyn Clock>,
        curve: LevelCurve,
        config: SessionConfig,
    ) -> Self {
        Self {
            cache,
            store,
            clock,
            curve,
            config,
            locks: KeyedLocks::new(),
            flush_locks: KeyedLocks::new(),
        }
    }

    async fn load_session(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> SessionResult<Option<Session>> {
        let key = CacheKey::Session(guild_id, user_id).to_string();
        match self.cache.get(&key).await? {
            Some(raw) => Ok(Some(Session::decode(&raw, guild_id, user_id, self.curve)?)),
            None => Ok(None),
        }
    }

    async fn save_session(&self, session: &Session, ttl: Duration) -> SessionResult<()> {
        let key = CacheKey::Session(session.guild_id, session.user_id).to_string();
        self.cache.set_ex(&key, &session.encode()?, ttl).await?;
        Ok(())
    }

    async fn load_vault(&self, guild_id: GuildId) -> SessionResult<Option<Vault>> {
        let key = CacheKey::Vault(guild_id).to_string();
        match self.cache.get(&key).await? {
            Some(raw) => Ok(Some(Vault::decode(&raw, guild_id)?)),
            None => Ok(None),
        }
    }

    async fn save_vault(&self, vault: &Vault, ttl: Duration) -> SessionResult<()> {
        let key = CacheKey::Vault(vault.guild_id).to_string();
        self.cache.set_ex(&key, &vault.encode()?, ttl).await?;
        Ok(())
    }

    /// Applies `apply` to the live session under its key lock and re-arms the TTL.
    /// `None` if there is no session.
    async fn mutate<T, F>(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        apply: F,
    ) -> SessionResult<Option<T>>
    where
        F: FnOnce(&mut Session, DateTime<Utc>) -> T + Send,
        T: Send,
    {
        let key = CacheKey::Session(guild_id, user_id).to_string();
        let _guard = self.locks.lock(&key).await;

        let Some(mut session) = self.load_session(guild_id, user_id).await? else {
            return Ok(None);
        };

        let out = apply(&mut session, self.clock.now());
        self.save_session(&session, self.config.ttl).await?;
        Ok(Some(out))
    }

    async fn mutate_existing<T, F>(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        apply: F,
    ) -> SessionResult<T>
    where
        F: FnOnce(&mut Session, DateTime<Utc>) -> T + Send,
        T: Send,
    {
        self.mutate(guild_id, user_id, apply)
            .await?
            .ok_or(SessionErr::NoSession { guild_id, user_id })
    }

    /// Writes one snapshot to the store step by step, recording each additive step that landed.
    async fn persist(&self, snapshot: &Session, flushed: &mut FlushedDeltas) -> SessionResult<()> {
        let limit = self.config.store_timeout;
        let (guild_id, user_id) = (snapshot.guild_id, snapshot.user_id);

        let totals = if snapshot.exp_to_flush > 0 {
            let totals = bounded(
                limit,
                self.store.add_experience(
                    guild_id,
                    user_id,
                    snapshot.exp_to_flush,
                    snapshot.last_active,
                ),
            )
            .await?
            .ok_or(StoreErr::MissingRecord { guild_id, user_id })?;
            flushed.exp = snapshot.exp_to_flush;
            flushed.totals = Some(totals);
            Some(totals)
        } else {
            None
        };

        let progress = snapshot.guild_progress(totals, self.curve);
        bounded(limit, self.store.update_guild_progress(&progress)).await?;

        if snapshot.currency_to_flush != 0 {
            bounded(
                limit,
                self.store
                    .apply_currency_delta(guild_id, user_id, snapshot.currency_to_flush),
            )
            .await?;
            flushed.currency = snapshot.currency_to_flush;
        }

        if let Some(increment) = snapshot.activity_increment() {
            bounded(limit, self.store.increment_activity(&[increment])).await?;
            flushed.messages = increment.messages;
            flushed.reactions = increment.reactions;
        }

        if !snapshot.pending_games.is_empty() {
            bounded(limit, self.store.insert_game_outcomes(&snapshot.pending_games)).await?;
            flushed.games = snapshot.pending_games.len();
        }

        let progress = snapshot.global_progress(totals, self.curve);
        bounded(limit, self.store.update_global_progress(&progress)).await?;
        Ok(())
    }

    /// Subtracts `flushed` from the live document. An incomplete flush re-arms the full TTL, and
    /// re-creates the document from the snapshot if it expired in the meantime.
    async fn settle(
        &self,
        key: &str,
        snapshot: &Session,
        flushed: &FlushedDeltas,
    ) -> SessionResult<()> {
        let _guard = self.locks.lock(key).await;

        let mut current = match self.load_session(snapshot.guild_id, snapshot.user_id).await? {
            Some(current) => current,
            None if flushed.complete => return Ok(()),
            None => snapshot.clone(),
        };

        if current.session_id != snapshot.session_id {
            tracing::warn!(key, "session was replaced during flush, leaving new session as is");
            return Ok(());
        }

        current.settle(snapshot, flushed, self.curve);

        let ttl = if flushed.complete {
            self.cache.ttl(key).await?.remaining_or(self.config.ttl)
        } else {
            Some(self.config.ttl)
        };

        match ttl {
            Some(ttl) => self.save_session(&current, ttl).await,
            None => Ok(()),
        }
    }

    async fn flush_member(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        force: bool,
    ) -> SessionResult<bool> {
        let key = CacheKey::Session(guild_id, user_id).to_string();
        let _flushing = self.flush_locks.lock(&key).await;
        self.flush_locked(&key, guild_id, user_id, force).await
    }

    /// Flushes one session; the caller holds its flush lock.
    #[instrument(skip(self, key), fields(guild = %guild_id, user = %user_id))]
    async fn flush_locked(
        &self,
        key: &str,
        guild_id: GuildId,
        user_id: UserId,
        force: bool,
    ) -> SessionResult<bool> {
        let snapshot = {
            let _guard = self.locks.lock(key).await;
            self.load_session(guild_id, user_id).await?
        };

        let Some(snapshot) = snapshot else {
            return Ok(false);
        };
        if !snapshot.dirty && !force {
            return Ok(false);
        }

        let mut flushed = FlushedDeltas::default();
        let outcome = self.persist(&snapshot, &mut flushed).await;
        flushed.complete = outcome.is_ok();

        let settled = self.settle(key, &snapshot, &flushed).await;

        match outcome {
            Ok(()) => {
                settled?;
                tracing::debug!(
                    exp = flushed.exp,
                    currency = flushed.currency,
                    messages = flushed.messages,
                    reactions = flushed.reactions,
                    games = flushed.games,
                    "session flushed"
                );
                Ok(true)
            }
            Err(e) => {
                tracing::error!(
                    error = ?e,
                    exp = snapshot.exp_to_flush,
                    currency = snapshot.currency_to_flush,
                    messages = snapshot.messages_to_flush,
                    reactions = snapshot.reactions_to_flush,
                    games = snapshot.pending_games.len(),
                    landed = ?flushed,
                    "session flush failed, unwritten deltas kept for retry"
                );
                if let Err(settle_err) = settled {
                    tracing::warn!(
                        error = ?settle_err,
                        "could not settle partially flushed session"
                    );
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(guild = %guild_id))]
    async fn flush_vault(&self, guild_id: GuildId, force: bool) -> SessionResult<bool> {
        let key = CacheKey::Vault(guild_id).to_string();
        let _flushing = self.flush_locks.lock(&key).await;

        let snapshot = {
            let _guard = self.locks.lock(&key).await;
            self.load_vault(guild_id).await?
        };

        let Some(snapshot) = snapshot else {
            return Ok(false);
        };
        if !snapshot.dirty && !force {
            return Ok(false);
        }

        if snapshot.vault_currency_to_flush != 0 {
            let written = bounded(
                self.config.store_timeout,
                self.store
                    .add_vault_currency(guild_id, snapshot.vault_currency_to_flush),
            )
            .await;

            if let Err(e) = written {
                tracing::error!(
                    error = ?e,
                    amount = snapshot.vault_currency_to_flush,
                    "vault flush failed, amount kept for retry"
                );
                if let Err(e) = self.cache.expire(&key, self.config.vault_ttl).await {
                    tracing::warn!(error = ?e, "could not re-arm vault ttl");
                }
                return Err(e.into());
            }
        }

        let _guard = self.locks.lock(&key).await;
        if let Some(mut current) = self.load_vault(guild_id).await? {
            if current.vault_id == snapshot.vault_id {
                current.settle(&snapshot);
                if let Some(ttl) = self
                    .cache
                    .ttl(&key)
                    .await?
                    .remaining_or(self.config.vault_ttl)
                {
                    self.save_vault(&current, ttl).await?;
                }
            }
        }

        Ok(true)
    }

    #[instrument(skip(self), fields(flush_id = %Uuid::new_v4()))]
    async fn flush_scan(&self, force: bool) -> SessionResult<FlushReport> {
        let mut report = FlushReport::default();

        for key in self.cache.scan_prefix(CacheKey::SESSION_PREFIX).await? {
            let Some(CacheKey::Session(guild_id, user_id)) = CacheKey::parse(&key) else {
                tracing::warn!(key = %key, "skipping unrecognised session key");
                continue;
            };

            match self.flush_member(guild_id, user_id, force).await {
                Ok(true) => report.sessions_flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, key = %key, "session not flushed");
                    report.sessions_failed += 1;
                }
            }
        }

        for key in self.cache.scan_prefix(CacheKey::VAULT_PREFIX).await? {
            let Some(CacheKey::Vault(guild_id)) = CacheKey::parse(&key) else {
                tracing::warn!(key = %key, "skipping unrecognised vault key");
                continue;
            };

            match self.flush_vault(guild_id, force).await {
                Ok(true) => report.vaults_flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, key = %key, "vault not flushed");
                    report.vaults_failed += 1;
                }
            }
        }

        if report != FlushReport::default() {
            tracing::info!(
                sessions = report.sessions_flushed,
                sessions_failed = report.sessions_failed,
                vaults = report.vaults_flushed,
                vaults_failed = report.vaults_failed,
                force,
                "flush pass finished"
            );
        }

        Ok(report)
    }
}

#[async_trait]
impl SessionBackend for CachedSessions {
    #[instrument(skip(self))]
    async fn get_or_create_session(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> SessionResult<Option<Session>> {
        let key = CacheKey::Session(guild_id, user_id).to_string();
        let _guard = self.locks.lock(&key).await;

        if let Some(session) = self.load_session(guild_id, user_id).await? {
            self.cache.expire(&key, self.config.ttl).await?;
            return Ok(Some(session));
        }

        let limit = self.config.store_timeout;
        let (member, user) = tokio::try_join!(
            bounded(limit, self.store.get_guild_user(guild_id, user_id)),
            bounded(limit, self.store.get_user(user_id)),
        )?;

        let (Some(member), Some(user)) = (member, user) else {
            tracing::debug!("no stored records, not creating a session");
            return Ok(None);
        };

        let session = Session::from_records(&member, &user, self.curve, self.clock.now());
        self.save_session(&session, self.config.ttl).await?;

        tracing::debug!(session_id = %session.session_id, "session created");
        Ok(Some(session))
    }

    #[instrument(skip(self))]
    async fn grant_experience(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        base_amount: u32,
        cooldown: Duration,
        multiplier: f64,
    ) -> SessionResult<XpGrant> {
        check_multiplier(multiplier)?;
        let curve = self.curve;

        self.mutate_existing(guild_id, user_id, move |session, now| {
            session.grant_experience(base_amount, cooldown, multiplier, curve, now)
        })
        .await
    }

    async fn track_message_activity(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> SessionResult<()> {
        self.mutate_existing(guild_id, user_id, |session, now| session.record_message(now))
            .await
    }

    async fn track_reaction_activity(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> SessionResult<()> {
        self.mutate_existing(guild_id, user_id, |session, now| session.record_reaction(now))
            .await
    }

    async fn get_currency(&self, guild_id: GuildId, user_id: UserId) -> SessionResult<Option<i64>> {
        Ok(self
            .load_session(guild_id, user_id)
            .await?
            .map(|session| session.currency))
    }

    #[instrument(skip(self))]
    async fn update_currency(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        delta: i64,
    ) -> SessionResult<i64> {
        self.mutate_existing(guild_id, user_id, move |session, now| {
            session.apply_currency(delta, now)
        })
        .await
    }

    #[instrument(skip(self, outcome), fields(guild = %outcome.guild_id, user = %outcome.user_id))]
    async fn queue_game_outcome(&self, outcome: GameOutcome) -> SessionResult<()> {
        let (guild_id, user_id) = (outcome.guild_id, outcome.user_id);
        self.mutate_existing(guild_id, user_id, move |session, now| {
            session.queue_game(outcome, now)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn add_vault_currency(&self, guild_id: GuildId, amount: i64) -> SessionResult<()> {
        let key = CacheKey::Vault(guild_id).to_string();
        let _guard = self.locks.lock(&key).await;
        let now = self.clock.now();

        let mut vault = self
            .load_vault(guild_id)
            .await?
            .unwrap_or_else(|| Vault::new(guild_id, now));
        vault.add(amount, now);

        self.save_vault(&vault, self.config.vault_ttl).await
    }

    async fn get_vault_currency_delta(&self, guild_id: GuildId) -> SessionResult<i64> {
        Ok(self
            .load_vault(guild_id)
            .await?
            .map_or(0, |vault| vault.vault_currency_to_flush))
    }

    async fn flush_dirty_sessions(&self) -> SessionResult<FlushReport> {
        self.flush_scan(false).await
    }

    async fn flush_session(&self, guild_id: GuildId, user_id: UserId) -> SessionResult<bool> {
        self.flush_member(guild_id, user_id, false).await
    }

    async fn flush_all_sessions(&self) -> SessionResult<FlushReport> {
        self.flush_scan(true).await
    }

    #[instrument(skip(self))]
    async fn evict_session(&self, guild_id: GuildId, user_id: UserId) -> SessionResult<()> {
        let key = CacheKey::Session(guild_id, user_id).to_string();
        let _flushing = self.flush_locks.lock(&key).await;

        loop {
            self.flush_locked(&key, guild_id, user_id, false).await?;

            let _guard = self.locks.lock(&key).await;
            match self.load_session(guild_id, user_id).await? {
                // mutated between the flush and the lock
                Some(session) if session.dirty => continue,
                Some(_) => {
                    self.cache.delete(&key).await?;
                    tracing::debug!("session evicted");
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    async fn stats(&self) -> SessionResult<SessionStats> {
        let mut stats = SessionStats {
            cache_available: true,
            flush_interval_secs: self.config.flush_interval.as_secs(),
            ..SessionStats::default()
        };

        for key in self.cache.scan_prefix(CacheKey::SESSION_PREFIX).await? {
            if let Some(CacheKey::Session(guild_id, user_id)) = CacheKey::parse(&key) {
                if let Ok(Some(session)) = self.load_session(guild_id, user_id).await {
                    stats.active_sessions += 1;
                    stats.dirty_sessions += usize::from(session.dirty);
                }
            }
        }

        for key in self.cache.scan_prefix(CacheKey::VAULT_PREFIX).await? {
            if let Some(CacheKey::Vault(guild_id)) = CacheKey::parse(&key) {
                if let Ok(Some(vault)) = self.load_vault(guild_id).await {
                    stats.cached_vaults += 1;
                    stats.dirty_vaults += usize::from(vault.dirty);
                }
            }
        }

        Ok(stats)
    }
}
