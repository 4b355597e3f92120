use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::instrument;

use crate::config::DatabaseConfig;
use crate::db::prelude::*;
use crate::db::schema;
use crate::leveling::LevelCurve;

/// Rows per reconciliation `UPDATE`, well under the bind parameter limit.
const RECONCILE_CHUNK: usize = 5_000;

/// A user's stored global totals next to the sums of their guild rows.
#[derive(Debug, sqlx::FromRow)]
struct UserTotals {
    user_id: UserId,
    total_messages: i64,
    total_reactions: i64,
    global_exp: i64,
    global_level: i32,
    messages: i64,
    reactions: i64,
    exp: i64,
}

/// Postgres-backed [`StatsStore`].
#[derive(Debug, Clone)]
pub struct PgStatsStore {
    pool: PgPool,
}

impl PgStatsStore {
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig, acquire_timeout: Duration) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Creates missing tables; existing tables are left untouched.
    #[instrument(skip(self))]
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in schema::STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StatsStore for PgStatsStore {
    #[instrument(skip(self))]
    async fn get_guild_user(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> StoreResult<Option<GuildUser>> {
        let row = sqlx::query_as::<_, GuildUser>(
            r#"
            SELECT guild_id, user_id, exp, level, exp_gained, streak, currency,
                   messages_sent, reactions_sent, last_active
            FROM guild_users
            WHERE guild_id = $1 AND user_id = $2
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    #[instrument(skip(self))]
    async fn get_user(&self, user_id: UserId) -> StoreResult<Option<GlobalUser>> {
        let row = sqlx::query_as::<_, GlobalUser>(
            r#"
            SELECT user_id, global_exp, global_level, total_currency,
                   total_messages, total_reactions, last_seen
            FROM users
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    #[instrument(skip(self, progress), fields(guild = %progress.guild_id, user = %progress.user_id))]
    async fn update_guild_progress(&self, progress: &GuildProgress) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE guild_users
            SET level = $3, last_active = GREATEST(last_active, $4)
            WHERE guild_id = $1 AND user_id = $2
            "#,
        )
        .bind(progress.guild_id)
        .bind(progress.user_id)
        .bind(progress.level)
        .bind(progress.last_active)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(StoreErr::MissingRecord {
                guild_id: progress.guild_id,
                user_id: progress.user_id,
            }),
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(error = ?e, "guild progress update failure");
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self, progress), fields(user = %progress.user_id))]
    async fn update_global_progress(&self, progress: &GlobalProgress) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET global_level = $2, last_seen = GREATEST(last_seen, $3)
            WHERE user_id = $1
            "#,
        )
        .bind(progress.user_id)
        .bind(progress.global_level)
        .bind(progress.last_seen)
        .execute(&self.pool)
        .await
        .inspect_err(|e| tracing::error!(error = ?e, "global progress update failure"))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn add_experience(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        amount: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<ExperienceTotals>> {
        let mut tx = self.pool.begin().await?;

        let guild_exp: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE guild_users
            SET exp = exp + $3, exp_gained = exp_gained + $3, last_active = $4
            WHERE guild_id = $1 AND user_id = $2
            RETURNING exp
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .bind(amount)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        let global_exp: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE users
            SET global_exp = global_exp + $2, last_seen = $3
            WHERE user_id = $1
            RETURNING global_exp
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        match (guild_exp, global_exp) {
            (Some(guild_exp), Some(global_exp)) => {
                tx.commit().await?;
                Ok(Some(ExperienceTotals {
                    guild_exp,
                    global_exp,
                }))
            }
            _ => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    async fn raise_levels(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        guild_level: i32,
        global_level: i32,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE guild_users SET level = GREATEST(level, $3) WHERE guild_id = $1 AND user_id = $2",
        )
        .bind(guild_id)
        .bind(user_id)
        .bind(guild_level)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE users SET global_level = GREATEST(global_level, $2) WHERE user_id = $1")
            .bind(user_id)
            .bind(global_level)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, increments), fields(rows = increments.len()))]
    async fn increment_activity(&self, increments: &[ActivityIncrement]) -> StoreResult<()> {
        if increments.is_empty() {
            return Ok(());
        }

        // one row per conflict target per statement, so merge duplicates first
        let mut per_member: BTreeMap<(GuildId, UserId), ActivityIncrement> = BTreeMap::new();
        let mut per_user: BTreeMap<UserId, ActivityIncrement> = BTreeMap::new();
        for inc in increments {
            merge_into(per_member.entry((inc.guild_id, inc.user_id)), inc);
            merge_into(per_user.entry(inc.user_id), inc);
        }

        let mut tx = self.pool.begin().await?;

        let mut guild_rows: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO guild_users (guild_id, user_id, messages_sent, reactions_sent, last_active) ",
        );
        guild_rows.push_values(per_member.values(), |mut row, inc| {
            row.push_bind(inc.guild_id)
                .push_bind(inc.user_id)
                .push_bind(inc.messages)
                .push_bind(inc.reactions)
                .push_bind(inc.last_active);
        });
        guild_rows.push(
            r#"
            ON CONFLICT (guild_id, user_id) DO UPDATE SET
                messages_sent = guild_users.messages_sent + EXCLUDED.messages_sent,
                reactions_sent = guild_users.reactions_sent + EXCLUDED.reactions_sent,
                last_active = GREATEST(guild_users.last_active, EXCLUDED.last_active)
            "#,
        );
        guild_rows.build().execute(&mut *tx).await?;

        let mut user_rows: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO users (user_id, total_messages, total_reactions, last_seen) ",
        );
        user_rows.push_values(per_user.values(), |mut row, inc| {
            row.push_bind(inc.user_id)
                .push_bind(inc.messages)
                .push_bind(inc.reactions)
                .push_bind(inc.last_active);
        });
        user_rows.push(
            r#"
            ON CONFLICT (user_id) DO UPDATE SET
                total_messages = users.total_messages + EXCLUDED.total_messages,
                total_reactions = users.total_reactions + EXCLUDED.total_reactions,
                last_seen = GREATEST(users.last_seen, EXCLUDED.last_seen)
            "#,
        );
        user_rows.build().execute(&mut *tx).await?;

        tx.commit()
            .await
            .inspect_err(|e| tracing::error!(error = ?e, "activity increment commit failure"))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn apply_currency_delta(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        delta: i64,
    ) -> StoreResult<CurrencyChange> {
        let mut tx = self.pool.begin().await?;

        let after: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE guild_users
            SET currency = currency + $3
            WHERE guild_id = $1 AND user_id = $2
            RETURNING currency
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .bind(delta)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(after) = after else {
            tx.rollback().await?;
            return Err(StoreErr::MissingRecord { guild_id, user_id });
        };

        sqlx::query(
            r#"
            UPDATE users
            SET total_currency = total_currency + $2, last_seen = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(delta)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CurrencyChange {
            before: after - delta,
            after,
        })
    }

    #[instrument(skip(self, outcomes), fields(rows = outcomes.len()))]
    async fn insert_game_outcomes(&self, outcomes: &[GameOutcome]) -> StoreResult<u64> {
        if outcomes.is_empty() {
            return Ok(0);
        }

        let mut insert: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO game_outcomes (guild_id, user_id, game_type, wager, amount_won, amount_lost, result, payload, played_at) ",
        );
        insert.push_values(outcomes, |mut row, outcome| {
            row.push_bind(outcome.guild_id)
                .push_bind(outcome.user_id)
                .push_bind(&outcome.game_type)
                .push_bind(outcome.wager)
                .push_bind(outcome.amount_won)
                .push_bind(outcome.amount_lost)
                .push_bind(outcome.result.as_str())
                .push_bind(outcome.payload.as_ref().map(|p| p.to_string()))
                .push_unseparated("::jsonb")
                .push_bind(outcome.played_at.unwrap_or_else(Utc::now));
        });

        let done = insert
            .build()
            .execute(&self.pool)
            .await
            .inspect_err(|e| tracing::error!(error = ?e, "game outcome batch insert failure"))?;

        Ok(done.rows_affected())
    }

    #[instrument(skip(self))]
    async fn add_vault_currency(&self, guild_id: GuildId, amount: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO guilds (guild_id, vault_currency, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (guild_id) DO UPDATE SET
                vault_currency = guilds.vault_currency + EXCLUDED.vault_currency,
                updated_at = NOW()
            "#,
        )
        .bind(guild_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn reconcile_global_stats(&self, curve: LevelCurve) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        // row locks on users hold concurrent increments back until the corrected totals land
        let totals = sqlx::query_as::<_, UserTotals>(
            r#"
            SELECT u.user_id, u.total_messages, u.total_reactions, u.global_exp, u.global_level,
                   s.messages, s.reactions, s.exp
            FROM users u
            JOIN (
                SELECT user_id,
                       SUM(messages_sent)::BIGINT AS messages,
                       SUM(reactions_sent)::BIGINT AS reactions,
                       SUM(exp)::BIGINT AS exp
                FROM guild_users
                GROUP BY user_id
            ) s ON s.user_id = u.user_id
            FOR UPDATE OF u
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let corrections: Vec<(UserTotals, i32)> = totals
            .into_iter()
            .filter_map(|row| {
                let level = curve.level_for(row.exp);
                let drifted = row.total_messages != row.messages
                    || row.total_reactions != row.reactions
                    || row.global_exp != row.exp
                    || row.global_level != level;
                drifted.then_some((row, level))
            })
            .collect();

        for chunk in corrections.chunks(RECONCILE_CHUNK) {
            let mut update: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"
                UPDATE users AS u SET
                    total_messages = v.messages,
                    total_reactions = v.reactions,
                    global_exp = v.exp,
                    global_level = v.level
                FROM (
                "#,
            );
            update.push_values(chunk, |mut row, (totals, level)| {
                row.push_bind(totals.user_id)
                    .push_bind(totals.messages)
                    .push_bind(totals.reactions)
                    .push_bind(totals.exp)
                    .push_bind(*level);
            });
            update.push(
                ") AS v (user_id, messages, reactions, exp, level) WHERE u.user_id = v.user_id",
            );
            update.build().execute(&mut *tx).await?;
        }

        tx.commit()
            .await
            .inspect_err(|e| tracing::error!(error = ?e, "stats reconciliation commit failure"))?;

        Ok(corrections.len() as u64)
    }
}

fn merge_into<K: Ord>(
    entry: std::collections::btree_map::Entry<'_, K, ActivityIncrement>,
    inc: &ActivityIncrement,
) {
    entry
        .and_modify(|acc| {
            acc.messages += inc.messages;
            acc.reactions += inc.reactions;
            acc.last_active = acc.last_active.max(inc.last_active);
        })
        .or_insert(*inc);
}
