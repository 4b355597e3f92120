use std::time::Duration;

use crate::db::models::GuildId;
use crate::leveling::{LevelCurve, LevelingConfig};
use crate::util::env::{CacheBackend, Env, EnvErr, EnvResult};

/// Validated runtime configuration, built once at startup and handed to each component.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub session: SessionConfig,
    pub buffer: BufferConfig,
    pub reconcile: ReconcileConfig,
    pub leveling: LevelingConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub redis_url: String,
    /// Upper bound on a single cache round trip, including the initial connect.
    pub op_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ttl: Duration,
    pub flush_interval: Duration,
    pub vault_ttl: Duration,
    /// Upper bound on a single store call issued by the session layer.
    pub store_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3_600),
            flush_interval: Duration::from_secs(300),
            vault_ttl: Duration::from_secs(86_400),
            store_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub flush_interval: Duration,
    pub store_timeout: Duration,
}

/// Periodic rebuild of global totals from guild rows.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_filter: String,
    pub collector_url: Option<String>,
}

impl Config {
    pub fn from_env() -> EnvResult<Self> {
        Self::try_from(Env::new()?)
    }
}

impl TryFrom<Env> for Config {
    type Error = EnvErr;

    fn try_from(env: Env) -> EnvResult<Self> {
        let session = SessionConfig {
            ttl: Duration::from_secs(env.session_ttl_secs),
            flush_interval: Duration::from_secs(env.session_flush_interval_secs),
            vault_ttl: Duration::from_secs(env.vault_ttl_secs),
            store_timeout: Duration::from_millis(env.store_timeout_ms),
        };
        let buffer = BufferConfig {
            flush_interval: Duration::from_secs(env.message_buffer_flush_secs),
            store_timeout: Duration::from_millis(env.store_timeout_ms),
        };

        check_interval("SESSION_FLUSH_INTERVAL_SECS", session.flush_interval, session.ttl)?;
        check_interval("MESSAGE_BUFFER_FLUSH_SECS", buffer.flush_interval, session.ttl)?;

        if session.vault_ttl < session.ttl {
            return Err(EnvErr::Invalid(format!(
                "VAULT_TTL_SECS ({}) must not be shorter than SESSION_TTL_SECS ({})",
                env.vault_ttl_secs, env.session_ttl_secs
            )));
        }

        if env.exp_per_level_unit == 0 {
            return Err(EnvErr::Invalid(
                "EXP_PER_LEVEL_UNIT must be greater than zero".into(),
            ));
        }

        if !env.streak_multiplier.is_finite() || env.streak_multiplier < 0.0 {
            return Err(EnvErr::Invalid(format!(
                "STREAK_MULTIPLIER must be a non-negative number, got {}",
                env.streak_multiplier
            )));
        }

        if env.stats_reconcile_interval_secs == 0 {
            return Err(EnvErr::Invalid(
                "STATS_RECONCILE_INTERVAL_SECS must be greater than zero".into(),
            ));
        }

        if env.daily_bonus < 0 {
            return Err(EnvErr::Invalid(format!(
                "DAILY_BONUS must not be negative, got {}",
                env.daily_bonus
            )));
        }

        if env.cache_timeout_ms == 0 || env.store_timeout_ms == 0 {
            return Err(EnvErr::Invalid("timeouts must be greater than zero".into()));
        }

        let leveling = LevelingConfig {
            enabled: env.leveling_enabled,
            exp_per_message: env.exp_per_message,
            exp_cooldown: Duration::from_secs(env.exp_cooldown_secs),
            streak_multiplier: env.streak_multiplier,
            max_streak_bonus: env.max_streak_bonus,
            daily_bonus: env.daily_bonus,
            curve: LevelCurve::new(env.exp_per_level_unit),
            disabled_guilds: env
                .leveling_disabled_guilds
                .into_iter()
                .map(GuildId)
                .collect(),
        };

        Ok(Self {
            database: DatabaseConfig {
                url: env.database_url,
                max_connections: env.database_max_connections.max(1),
            },
            cache: CacheConfig {
                backend: env.session_cache,
                redis_url: env.redis_url,
                op_timeout: Duration::from_millis(env.cache_timeout_ms),
            },
            session,
            buffer,
            reconcile: ReconcileConfig {
                interval: Duration::from_secs(env.stats_reconcile_interval_secs),
            },
            leveling,
            telemetry: TelemetryConfig {
                service_name: env.service_name,
                log_filter: env.log_filter,
                collector_url: env.otel_exporter_otlp_endpoint,
            },
        })
    }
}

/// A flush interval must be non-zero and strictly shorter than the session TTL, otherwise a
/// session can expire before it has ever been flushed.
fn check_interval(name: &str, interval: Duration, ttl: Duration) -> EnvResult<()> {
    if interval.is_zero() || interval >= ttl {
        return Err(EnvErr::Invalid(format!(
            "{name} ({}s) must be non-zero and shorter than SESSION_TTL_SECS ({}s)",
            interval.as_secs(),
            ttl.as_secs()
        )));
    }
    Ok(())
}
