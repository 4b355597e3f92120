//! Turns raw chat activity into session, buffer and daily-check updates.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::buffer::MessageCountBuffer;
use crate::daily::DailyCheckCache;
use crate::db::models::{GuildId, UserId};
use crate::leveling::LevelingConfig;
use crate::session::{SessionErr, SessionManager, XpGrant};

pub type ActivityResult<T> = core::result::Result<T, ActivityErr>;

#[derive(Debug, Error)]
pub enum ActivityErr {
    #[error(transparent)]
    Session(#[from] SessionErr),

    #[error("malformed activity event: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One line of the event feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityEvent {
    Message { guild_id: GuildId, user_id: UserId },
    Reaction { guild_id: GuildId, user_id: UserId },
}

impl ActivityEvent {
    pub fn parse(line: &str) -> ActivityResult<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }

    pub fn member(&self) -> (GuildId, UserId) {
        match *self {
            ActivityEvent::Message { guild_id, user_id }
            | ActivityEvent::Reaction { guild_id, user_id } => (guild_id, user_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActivityOutcome {
    Message {
        daily_check_due: bool,
        /// `None` when leveling is off for the guild.
        grant: Option<XpGrant>,
        /// Currency paid for a level-up.
        reward: Option<i64>,
    },
    Reaction,
}

#[derive(Debug, Clone)]
pub struct ActivityHandler {
    sessions: SessionManager,
    buffer: Arc<MessageCountBuffer>,
    daily: Arc<DailyCheckCache>,
    leveling: Arc<LevelingConfig>,
}

impl ActivityHandler {
    pub fn new(
        sessions: SessionManager,
        buffer: Arc<MessageCountBuffer>,
        daily: Arc<DailyCheckCache>,
        leveling: Arc<LevelingConfig>,
    ) -> Self {
        Self {
            sessions,
            buffer,
            daily,
            leveling,
        }
    }

    #[instrument(skip(self))]
    pub async fn handle(&self, event: ActivityEvent) -> ActivityResult<ActivityOutcome> {
        match event {
            ActivityEvent::Message { guild_id, user_id } => {
                self.on_message(guild_id, user_id).await
            }
            ActivityEvent::Reaction { guild_id, user_id } => {
                if self.leveling.enabled_for(guild_id) {
                    self.sessions
                        .track_reaction_activity(guild_id, user_id)
                        .await?;
                } else {
                    self.buffer.increment_reaction(guild_id, user_id).await;
                }
                Ok(ActivityOutcome::Reaction)
            }
        }
    }

    async fn on_message(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> ActivityResult<ActivityOutcome> {
        let daily_check_due = self.daily.should_check(guild_id, user_id).await;

        if !self.leveling.enabled_for(guild_id) {
            self.buffer.increment_activity(guild_id, user_id).await;
            return Ok(ActivityOutcome::Message {
                daily_check_due,
                grant: None,
                reward: None,
            });
        }

        // unknown members get their rows written here, so the grant below finds them
        self.sessions
            .track_message_activity(guild_id, user_id)
            .await?;

        let streak = self
            .sessions
            .get_or_create_session(guild_id, user_id)
            .await?
            .map_or(0, |session| session.streak);

        let grant = self
            .sessions
            .grant_experience(
                guild_id,
                user_id,
                self.leveling.exp_per_message,
                self.leveling.exp_cooldown,
                self.leveling.multiplier_for_streak(streak),
            )
            .await?;

        let reward = if grant.level_up {
            self.reward_level_up(guild_id, user_id, grant.new_level, streak)
                .await?
        } else {
            None
        };

        Ok(ActivityOutcome::Message {
            daily_check_due,
            grant: Some(grant),
            reward,
        })
    }

    async fn reward_level_up(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        level: i32,
        streak: i32,
    ) -> ActivityResult<Option<i64>> {
        let reward = self.leveling.level_up_reward(streak);
        if reward <= 0 {
            tracing::info!(guild = %guild_id, user = %user_id, level, "level up");
            return Ok(None);
        }

        let balance = self
            .sessions
            .update_currency(guild_id, user_id, reward)
            .await?;
        tracing::info!(
            guild = %guild_id,
            user = %user_id,
            level,
            reward,
            balance,
            "level up"
        );
        Ok(Some(reward))
    }
}
