use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::db::bounded;
use crate::db::prelude::*;
use crate::leveling::{LevelCurve, granted_exp};
use crate::session::{
    FlushReport, Session, SessionBackend, SessionErr, SessionResult, SessionStats, XpGrant,
    check_multiplier,
};
use crate::util::Clock;

#[derive(Debug, Clone, Copy)]
struct LastGrant {
    at: DateTime<Utc>,
    level: i32,
}

/// Applies every operation straight to the store.
///
/// Used when no session cache is reachable. XP cooldowns are tracked in-process, so they do not
/// survive a restart and are not shared between instances.
#[derive(Debug)]
pub struct DirectWrite {
    store: Arc<dyn StatsStore>,
    clock: Arc<dyn Clock>,
    curve: LevelCurve,
    store_timeout: Duration,
    cooldown_retention: Duration,
    last_grants: Mutex<HashMap<(GuildId, UserId), LastGrant>>,
}

impl DirectWrite {
    pub fn new(
        store: Arc<dyn StatsStore>,
        clock: Arc<dyn Clock>,
        curve: LevelCurve,
        store_timeout: Duration,
        cooldown_retention: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            curve,
            store_timeout,
            cooldown_retention,
            last_grants: Mutex::new(HashMap::new()),
        }
    }

    async fn increment(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        messages: i64,
        reactions: i64,
    ) -> SessionResult<()> {
        let increment = ActivityIncrement {
            guild_id,
            user_id,
            messages,
            reactions,
            last_active: self.clock.now(),
        };
        bounded(self.store_timeout, self.store.increment_activity(&[increment])).await?;
        Ok(())
    }

    fn missing_to_not_found(err: StoreErr) -> SessionErr {
        match err {
            StoreErr::MissingRecord { guild_id, user_id } => {
                SessionErr::UserNotFound { guild_id, user_id }
            }
            other => SessionErr::Store(other),
        }
    }
}

#[async_trait]
impl SessionBackend for DirectWrite {
    async fn get_or_create_session(&self, _: GuildId, _: UserId) -> SessionResult<Option<Session>> {
        Ok(None)
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
        let now = self.clock.now();
        let key = (guild_id, user_id);

        // reserve the grant before writing so concurrent grants inside the cooldown lose
        let previous = {
            let mut last_grants = self.last_grants.lock().await;
            let previous = last_grants.get(&key).copied();

            if let Some(last) = previous {
                let cooling = match (now - last.at).to_std() {
                    Ok(elapsed) => elapsed < cooldown,
                    Err(_) => true,
                };
                if cooling {
                    return Ok(XpGrant::none(last.level));
                }
            }

            last_grants.insert(
                key,
                LastGrant {
                    at: now,
                    level: previous.map_or(0, |last| last.level),
                },
            );
            previous
        };

        let granted = granted_exp(base_amount, multiplier);
        let written = bounded(
            self.store_timeout,
            self.store.add_experience(guild_id, user_id, granted, now),
        )
        .await;

        let totals = match written {
            Ok(Some(totals)) => totals,
            failed => {
                let mut last_grants = self.last_grants.lock().await;
                match previous {
                    Some(last) => last_grants.insert(key, last),
                    None => last_grants.remove(&key),
                };
                return Err(match failed {
                    Err(e) => e.into(),
                    Ok(_) => SessionErr::UserNotFound { guild_id, user_id },
                });
            }
        };

        let guild_level = self.curve.level_for(totals.guild_exp);
        let global_level = self.curve.level_for(totals.global_exp);
        bounded(
            self.store_timeout,
            self.store
                .raise_levels(guild_id, user_id, guild_level, global_level),
        )
        .await?;

        if let Some(last) = self.last_grants.lock().await.get_mut(&key) {
            last.level = guild_level;
        }

        let before = self.curve.level_for(totals.guild_exp - granted);
        Ok(XpGrant {
            level_up: guild_level > before,
            new_level: guild_level,
            granted,
        })
    }

    async fn track_message_activity(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> SessionResult<()> {
        self.increment(guild_id, user_id, 1, 0).await
    }

    async fn track_reaction_activity(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> SessionResult<()> {
        self.increment(guild_id, user_id, 0, 1).await
    }

    async fn get_currency(&self, guild_id: GuildId, user_id: UserId) -> SessionResult<Option<i64>> {
        let member = bounded(
            self.store_timeout,
            self.store.get_guild_user(guild_id, user_id),
        )
        .await?;
        Ok(member.map(|member| member.currency))
    }

    #[instrument(skip(self))]
    async fn update_currency(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        delta: i64,
    ) -> SessionResult<i64> {
        let change = bounded(
            self.store_timeout,
            self.store.apply_currency_delta(guild_id, user_id, delta),
        )
        .await
        .map_err(Self::missing_to_not_found)?;

        Ok(change.after)
    }

    async fn queue_game_outcome(&self, mut outcome: GameOutcome) -> SessionResult<()> {
        outcome.played_at.get_or_insert(self.clock.now());
        bounded(
            self.store_timeout,
            self.store.insert_game_outcomes(std::slice::from_ref(&outcome)),
        )
        .await?;
        Ok(())
    }

    async fn add_vault_currency(&self, guild_id: GuildId, amount: i64) -> SessionResult<()> {
        bounded(self.store_timeout, self.store.add_vault_currency(guild_id, amount)).await?;
        Ok(())
    }

    async fn get_vault_currency_delta(&self, _: GuildId) -> SessionResult<i64> {
        Ok(0)
    }

    /// Nothing is pending here; the periodic call just forgets stale cooldowns.
    async fn flush_dirty_sessions(&self) -> SessionResult<FlushReport> {
        let now = self.clock.now();
        let retention = self.cooldown_retention;

        self.last_grants.lock().await.retain(|_, last| {
            (now - last.at)
                .to_std()
                .map_or(true, |elapsed| elapsed < retention)
        });

        Ok(FlushReport::default())
    }

    async fn flush_session(&self, _: GuildId, _: UserId) -> SessionResult<bool> {
        Ok(false)
    }

    async fn flush_all_sessions(&self) -> SessionResult<FlushReport> {
        Ok(FlushReport::default())
    }

    async fn evict_session(&self, _: GuildId, _: UserId) -> SessionResult<()> {
        Ok(())
    }

    async fn stats(&self) -> SessionResult<SessionStats> {
        Ok(SessionStats {
            cache_available: false,
            ..SessionStats::default()
        })
    }
}
