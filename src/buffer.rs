//! Message and reaction counters for members whose guild has leveling switched off.
//!
//! Counts accumulate in memory and are written in one batch per flush.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::db::bounded;
use crate::db::prelude::*;
use crate::util::Clock;

pub type BufferResult<T> = core::result::Result<T, BufferErr>;

#[derive(Debug, Error)]
pub enum BufferErr {
    #[error("buffered activity for {users} users not written: {source}")]
    Store {
        users: usize,
        #[source]
        source: StoreErr,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    messages: i64,
    reactions: i64,
    last_active: DateTime<Utc>,
}

impl Pending {
    fn absorb(&mut self, other: Pending) {
        self.messages += other.messages;
        self.reactions += other.reactions;
        self.last_active = self.last_active.max(other.last_active);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub buffered_users: usize,
    pub buffered_messages: i64,
    pub buffered_reactions: i64,
}

#[derive(Debug)]
pub struct MessageCountBuffer {
    store: Arc<dyn StatsStore>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    pending: Mutex<HashMap<(GuildId, UserId), Pending>>,
}

impl MessageCountBuffer {
    pub fn new(store: Arc<dyn StatsStore>, clock: Arc<dyn Clock>, store_timeout: Duration) -> Self {
        Self {
            store,
            clock,
            store_timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one message. No I/O.
    pub async fn increment_activity(&self, guild_id: GuildId, user_id: UserId) {
        self.count(guild_id, user_id, 1, 0).await;
    }

    /// Counts one reaction. No I/O.
    pub async fn increment_reaction(&self, guild_id: GuildId, user_id: UserId) {
        self.count(guild_id, user_id, 0, 1).await;
    }

    async fn count(&self, guild_id: GuildId, user_id: UserId, messages: i64, reactions: i64) {
        let seen = Pending {
            messages,
            reactions,
            last_active: self.clock.now(),
        };

        self.pending
            .lock()
            .await
            .entry((guild_id, user_id))
            .and_modify(|pending| pending.absorb(seen))
            .or_insert(seen);
    }

    /// Writes everything buffered so far as one batch and returns how many members it covered.
    /// On failure the counts go back into the buffer, on top of anything counted meanwhile.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> BufferResult<usize> {
        let taken = std::mem::take(&mut *self.pending.lock().await);
        if taken.is_empty() {
            return Ok(0);
        }

        let increments: Vec<ActivityIncrement> = taken
            .iter()
            .map(|(&(guild_id, user_id), pending)| ActivityIncrement {
                guild_id,
                user_id,
                messages: pending.messages,
                reactions: pending.reactions,
                last_active: pending.last_active,
            })
            .collect();

        match bounded(self.store_timeout, self.store.increment_activity(&increments)).await {
            Ok(()) => {
                tracing::debug!(users = increments.len(), "message buffer flushed");
                Ok(increments.len())
            }
            Err(source) => {
                let users = taken.len();
                let mut pending = self.pending.lock().await;
                for (member, counted) in taken {
                    pending
                        .entry(member)
                        .and_modify(|live| live.absorb(counted))
                        .or_insert(counted);
                }
                tracing::error!(error = ?source, users, "message buffer flush failed, counts kept");
                Err(BufferErr::Store { users, source })
            }
        }
    }

    pub async fn stats(&self) -> BufferStats {
        let pending = self.pending.lock().await;
        BufferStats {
            buffered_users: pending.len(),
            buffered_messages: pending.values().map(|pending| pending.messages).sum(),
            buffered_reactions: pending.values().map(|pending| pending.reactions).sum(),
        }
    }
}
