//! Experience → level mapping and the XP grant policy.

use std::collections::HashSet;
use std::time::Duration;

use crate::db::models::GuildId;

/// `level = floor(sqrt(exp / exp_per_unit))`, computed in integers so every caller agrees
/// on the level for a given amount of experience.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelCurve {
    exp_per_unit: u32,
}

impl Default for LevelCurve {
    fn default() -> Self {
        Self { exp_per_unit: 100 }
    }
}

impl LevelCurve {
    /// `exp_per_unit` of zero is clamped to one.
    pub const fn new(exp_per_unit: u32) -> Self {
        Self {
            exp_per_unit: if exp_per_unit == 0 { 1 } else { exp_per_unit },
        }
    }

    pub fn level_for(&self, exp: i64) -> i32 {
        if exp <= 0 {
            return 0;
        }

        let units = exp as u64 / u64::from(self.exp_per_unit);
        i32::try_from(units.isqrt()).unwrap_or(i32::MAX)
    }

    /// Minimum experience at which `level` is reached.
    pub fn exp_for_level(&self, level: i32) -> i64 {
        if level <= 0 {
            return 0;
        }

        let level = i64::from(level);
        level
            .saturating_mul(level)
            .saturating_mul(i64::from(self.exp_per_unit))
    }
}

/// XP awarded for a base amount at a multiplier, rounded up.
pub fn granted_exp(base: u32, multiplier: f64) -> i64 {
    (f64::from(base) * multiplier).ceil() as i64
}

/// Message XP policy.
#[derive(Debug, Clone)]
pub struct LevelingConfig {
    pub enabled: bool,
    pub exp_per_message: u32,
    pub exp_cooldown: Duration,
    pub streak_multiplier: f64,
    pub max_streak_bonus: u32,
    /// Base currency paid on a guild level-up.
    pub daily_bonus: i64,
    pub curve: LevelCurve,
    pub disabled_guilds: HashSet<GuildId>,
}

impl Default for LevelingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exp_per_message: 10,
            exp_cooldown: Duration::from_secs(3),
            streak_multiplier: 0.05,
            max_streak_bonus: 20,
            daily_bonus: 1_000,
            curve: LevelCurve::default(),
            disabled_guilds: HashSet::new(),
        }
    }
}

impl LevelingConfig {
    pub fn enabled_for(&self, guild_id: GuildId) -> bool {
        self.enabled && !self.disabled_guilds.contains(&guild_id)
    }

    /// Streak days that count towards bonuses.
    fn bonus_days(&self, streak: i32) -> i32 {
        streak.clamp(0, self.max_streak_bonus.min(i32::MAX as u32) as i32)
    }

    pub fn multiplier_for_streak(&self, streak: i32) -> f64 {
        1.0 + f64::from(self.bonus_days(streak)) * self.streak_multiplier
    }

    /// `daily_bonus + floor(daily_bonus × capped streak × streak_multiplier)`.
    pub fn level_up_reward(&self, streak: i32) -> i64 {
        let days = f64::from(self.bonus_days(streak));
        let bonus = (self.daily_bonus as f64 * days * self.streak_multiplier).floor() as i64;
        self.daily_bonus.saturating_add(bonus)
    }
}
