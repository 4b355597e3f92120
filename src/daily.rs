//! Once-per-day eligibility checks for the daily reward.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::db::models::{GuildId, UserId};
use crate::util::Clock;

#[derive(Debug)]
struct Checked {
    date: NaiveDate,
    members: HashSet<(GuildId, UserId)>,
}

impl Checked {
    /// Drops yesterday's entries if the UTC date moved on.
    fn roll_to(&mut self, today: NaiveDate) {
        if self.date != today {
            tracing::debug!(
                previous = %self.date,
                today = %today,
                cleared = self.members.len(),
                "daily check rollover"
            );
            self.date = today;
            self.members.clear();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub checked_today: usize,
}

/// Remembers which members were already checked for the daily reward on the current UTC day.
#[derive(Debug)]
pub struct DailyCheckCache {
    clock: Arc<dyn Clock>,
    checked: Mutex<Checked>,
}

impl DailyCheckCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let date = clock.now().date_naive();
        Self {
            clock,
            checked: Mutex::new(Checked {
                date,
                members: HashSet::new(),
            }),
        }
    }

    /// `true` the first time it is called for a member on a given UTC day.
    pub async fn should_check(&self, guild_id: GuildId, user_id: UserId) -> bool {
        let today = self.clock.now().date_naive();
        let mut checked = self.checked.lock().await;
        checked.roll_to(today);
        checked.members.insert((guild_id, user_id))
    }

    /// Records a claim made some other way so today's check is skipped.
    pub async fn mark_claimed(&self, guild_id: GuildId, user_id: UserId) {
        let today = self.clock.now().date_naive();
        let mut checked = self.checked.lock().await;
        checked.roll_to(today);
        checked.members.insert((guild_id, user_id));
    }

    pub async fn stats(&self) -> DailyStats {
        let today = self.clock.now().date_naive();
        let mut checked = self.checked.lock().await;
        checked.roll_to(today);
        DailyStats {
            date: checked.date,
            checked_today: checked.members.len(),
        }
    }

    pub async fn force_reset(&self) {
        let today = self.clock.now().date_naive();
        let mut checked = self.checked.lock().await;
        tracing::info!(cleared = checked.members.len(), "daily check cache reset");
        checked.date = today;
        checked.members.clear();
    }
}
