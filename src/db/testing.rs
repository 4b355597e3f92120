//! In-memory [`StatsStore`] with per-operation failure switches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::db::prelude::*;
use crate::leveling::LevelCurve;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Read,
    GuildProgress,
    GlobalProgress,
    AddExperience,
    RaiseLevels,
    Activity,
    Currency,
    Games,
    Vault,
    Reconcile,
}

/// Holds the next call of one operation until released.
#[derive(Debug, Clone, Default)]
pub struct Pause {
    /// Notified once the held call has started.
    pub reached: Arc<Notify>,
    /// Notify to let the held call continue.
    pub resume: Arc<Notify>,
}

#[derive(Debug, Default)]
struct Tables {
    members: HashMap<(GuildId, UserId), GuildUser>,
    users: HashMap<UserId, GlobalUser>,
    games: Vec<GameOutcome>,
    vaults: HashMap<GuildId, i64>,
    failing: HashSet<StoreOp>,
    writes: HashMap<StoreOp, usize>,
    pauses: HashMap<StoreOp, Pause>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

fn blank_member(guild_id: GuildId, user_id: UserId) -> GuildUser {
    GuildUser {
        guild_id,
        user_id,
        exp: 0,
        level: 0,
        exp_gained: 0,
        streak: 0,
        currency: 0,
        messages_sent: 0,
        reactions_sent: 0,
        last_active: None,
    }
}

fn blank_user(user_id: UserId) -> GlobalUser {
    GlobalUser {
        user_id,
        global_exp: 0,
        global_level: 0,
        total_currency: 0,
        total_messages: 0,
        total_reactions: 0,
        last_seen: None,
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a member row (and a blank global row if the user is new).
    pub async fn seed_member(&self, guild_id: GuildId, user_id: UserId, exp: i64, currency: i64) {
        let mut tables = self.tables.lock().await;
        let mut member = blank_member(guild_id, user_id);
        member.exp = exp;
        member.level = LevelCurve::default().level_for(exp);
        member.currency = currency;
        tables.members.insert((guild_id, user_id), member);
        tables
            .users
            .entry(user_id)
            .or_insert_with(|| blank_user(user_id));
    }

    pub async fn edit_user(&self, user_id: UserId, edit: impl FnOnce(&mut GlobalUser)) {
        if let Some(user) = self.tables.lock().await.users.get_mut(&user_id) {
            edit(user);
        }
    }

    pub async fn set_streak(&self, guild_id: GuildId, user_id: UserId, streak: i32) {
        if let Some(member) = self.tables.lock().await.members.get_mut(&(guild_id, user_id)) {
            member.streak = streak;
        }
    }

    pub async fn member(&self, guild_id: GuildId, user_id: UserId) -> Option<GuildUser> {
        self.tables
            .lock()
            .await
            .members
            .get(&(guild_id, user_id))
            .cloned()
    }

    pub async fn user(&self, user_id: UserId) -> Option<GlobalUser> {
        self.tables.lock().await.users.get(&user_id).cloned()
    }

    pub async fn games(&self) -> Vec<GameOutcome> {
        self.tables.lock().await.games.clone()
    }

    pub async fn vault(&self, guild_id: GuildId) -> i64 {
        self.tables
            .lock()
            .await
            .vaults
            .get(&guild_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn fail(&self, op: StoreOp) {
        self.tables.lock().await.failing.insert(op);
    }

    pub async fn recover(&self, op: StoreOp) {
        self.tables.lock().await.failing.remove(&op);
    }

    /// Holds the next call of `op` before it touches any table.
    pub async fn pause(&self, op: StoreOp) -> Pause {
        let pause = Pause::default();
        self.tables.lock().await.pauses.insert(op, pause.clone());
        pause
    }

    async fn hold_if_paused(&self, op: StoreOp) {
        let pause = self.tables.lock().await.pauses.remove(&op);
        if let Some(pause) = pause {
            pause.reached.notify_one();
            pause.resume.notified().await;
        }
    }

    /// Successful calls of `op` so far.
    pub async fn writes(&self, op: StoreOp) -> usize {
        self.tables
            .lock()
            .await
            .writes
            .get(&op)
            .copied()
            .unwrap_or(0)
    }
}

impl Tables {
    fn begin(&mut self, op: StoreOp) -> StoreResult<()> {
        if self.failing.contains(&op) {
            return Err(StoreErr::Unavailable(format!("{op:?} switched off")));
        }
        *self.writes.entry(op).or_default() += 1;
        Ok(())
    }
}

#[async_trait]
impl StatsStore for MemoryStore {
    async fn get_guild_user(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> StoreResult<Option<GuildUser>> {
        let mut tables = self.tables.lock().await;
        tables.begin(StoreOp::Read)?;
        Ok(tables.members.get(&(guild_id, user_id)).cloned())
    }

    async fn get_user(&self, user_id: UserId) -> StoreResult<Option<GlobalUser>> {
        let mut tables = self.tables.lock().await;
        tables.begin(StoreOp::Read)?;
        Ok(tables.users.get(&user_id).cloned())
    }

    async fn update_guild_progress(&self, progress: &GuildProgress) -> StoreResult<()> {
        self.hold_if_paused(StoreOp::GuildProgress).await;
        let mut tables = self.tables.lock().await;
        tables.begin(StoreOp::GuildProgress)?;
        let member = tables
            .members
            .get_mut(&(progress.guild_id, progress.user_id))
            .ok_or(StoreErr::MissingRecord {
                guild_id: progress.guild_id,
                user_id: progress.user_id,
            })?;
        member.level = progress.level;
        member.last_active = member.last_active.max(Some(progress.last_active));
        Ok(())
    }

    async fn update_global_progress(&self, progress: &GlobalProgress) -> StoreResult<()> {
        self.hold_if_paused(StoreOp::GlobalProgress).await;
        let mut tables = self.tables.lock().await;
        tables.begin(StoreOp::GlobalProgress)?;
        if let Some(user) = tables.users.get_mut(&progress.user_id) {
            user.global_level = progress.global_level;
            user.last_seen = user.last_seen.max(Some(progress.last_seen));
        }
        Ok(())
    }

    async fn add_experience(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        amount: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<ExperienceTotals>> {
        self.hold_if_paused(StoreOp::AddExperience).await;
        let mut tables = self.tables.lock().await;
        tables.begin(StoreOp::AddExperience)?;
        let known = tables.members.contains_key(&(guild_id, user_id))
            && tables.users.contains_key(&user_id);
        if !known {
            return Ok(None);
        }

        let member = tables
            .members
            .get_mut(&(guild_id, user_id))
            .ok_or(StoreErr::MissingRecord { guild_id, user_id })?;
        member.exp += amount;
        member.exp_gained += amount;
        member.last_active = Some(at);
        let guild_exp = member.exp;

        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or(StoreErr::MissingRecord { guild_id, user_id })?;
        user.global_exp += amount;
        user.last_seen = Some(at);

        Ok(Some(ExperienceTotals {
            guild_exp,
            global_exp: user.global_exp,
        }))
    }

    async fn raise_levels(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        guild_level: i32,
        global_level: i32,
    ) -> StoreResult<()> {
        self.hold_if_paused(StoreOp::RaiseLevels).await;
        let mut tables = self.tables.lock().await;
        tables.begin(StoreOp::RaiseLevels)?;
        if let Some(member) = tables.members.get_mut(&(guild_id, user_id)) {
            member.level = member.level.max(guild_level);
        }
        if let Some(user) = tables.users.get_mut(&user_id) {
            user.global_level = user.global_level.max(global_level);
        }
        Ok(())
    }

    async fn increment_activity(&self, increments: &[ActivityIncrement]) -> StoreResult<()> {
        self.hold_if_paused(StoreOp::Activity).await;
        let mut tables = self.tables.lock().await;
        tables.begin(StoreOp::Activity)?;
        for inc in increments {
            let member = tables
                .members
                .entry((inc.guild_id, inc.user_id))
                .or_insert_with(|| blank_member(inc.guild_id, inc.user_id));
            member.messages_sent += inc.messages;
            member.reactions_sent += inc.reactions;
            member.last_active = member.last_active.max(Some(inc.last_active));

            let user = tables
                .users
                .entry(inc.user_id)
                .or_insert_with(|| blank_user(inc.user_id));
            user.total_messages += inc.messages;
            user.total_reactions += inc.reactions;
            user.last_seen = user.last_seen.max(Some(inc.last_active));
        }
        Ok(())
    }

    async fn apply_currency_delta(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        delta: i64,
    ) -> StoreResult<CurrencyChange> {
        self.hold_if_paused(StoreOp::Currency).await;
        let mut tables = self.tables.lock().await;
        tables.begin(StoreOp::Currency)?;
        let member = tables
            .members
            .get_mut(&(guild_id, user_id))
            .ok_or(StoreErr::MissingRecord { guild_id, user_id })?;
        let before = member.currency;
        member.currency += delta;
        let after = member.currency;

        if let Some(user) = tables.users.get_mut(&user_id) {
            user.total_currency += delta;
        }
        Ok(CurrencyChange { before, after })
    }

    async fn insert_game_outcomes(&self, outcomes: &[GameOutcome]) -> StoreResult<u64> {
        self.hold_if_paused(StoreOp::Games).await;
        let mut tables = self.tables.lock().await;
        tables.begin(StoreOp::Games)?;
        tables.games.extend_from_slice(outcomes);
        Ok(outcomes.len() as u64)
    }

    async fn add_vault_currency(&self, guild_id: GuildId, amount: i64) -> StoreResult<()> {
        self.hold_if_paused(StoreOp::Vault).await;
        let mut tables = self.tables.lock().await;
        tables.begin(StoreOp::Vault)?;
        *tables.vaults.entry(guild_id).or_default() += amount;
        Ok(())
    }

    async fn reconcile_global_stats(&self, curve: LevelCurve) -> StoreResult<u64> {
        self.hold_if_paused(StoreOp::Reconcile).await;
        let mut tables = self.tables.lock().await;
        tables.begin(StoreOp::Reconcile)?;

        let mut sums: HashMap<UserId, (i64, i64, i64)> = HashMap::new();
        for member in tables.members.values() {
            let sum = sums.entry(member.user_id).or_default();
            sum.0 += member.messages_sent;
            sum.1 += member.reactions_sent;
            sum.2 += member.exp;
        }

        let mut corrected = 0;
        for (user_id, (messages, reactions, exp)) in sums {
            let Some(user) = tables.users.get_mut(&user_id) else {
                continue;
            };
            let level = curve.level_for(exp);
            let before = (
                user.total_messages,
                user.total_reactions,
                user.global_exp,
                user.global_level,
            );
            if before != (messages, reactions, exp, level) {
                user.total_messages = messages;
                user.total_reactions = reactions;
                user.global_exp = exp;
                user.global_level = level;
                corrected += 1;
            }
        }
        Ok(corrected)
    }
}
