//! Serde deserializer over process environment variables.
//!
//! Variables map onto struct fields by name (fields use `SCREAMING_SNAKE_CASE`), scalars are parsed
//! from their string form and sequences are comma-separated. `.env` files are picked up through
//! [`dotenvy`].

use std::iter::empty;

use serde::Deserialize;
use serde::de::value::{MapDeserializer, SeqDeserializer};
use serde::de::{self, IntoDeserializer};
use thiserror::Error;

/// Which implementation holds live sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Redis,
    Memory,
}

/// Raw process configuration, validated into [`crate::config::Config`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Env {
    pub database_url: String,
    #[serde(default = "defaults::database_max_connections")]
    pub database_max_connections: u32,

    #[serde(default = "defaults::session_cache")]
    pub session_cache: CacheBackend,
    #[serde(default = "defaults::redis_url")]
    pub redis_url: String,
    #[serde(default = "defaults::cache_timeout_ms")]
    pub cache_timeout_ms: u64,
    #[serde(default = "defaults::store_timeout_ms")]
    pub store_timeout_ms: u64,

    #[serde(default = "defaults::session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "defaults::session_flush_interval_secs")]
    pub session_flush_interval_secs: u64,
    #[serde(default = "defaults::vault_ttl_secs")]
    pub vault_ttl_secs: u64,
    #[serde(default = "defaults::message_buffer_flush_secs")]
    pub message_buffer_flush_secs: u64,
    #[serde(default = "defaults::stats_reconcile_interval_secs")]
    pub stats_reconcile_interval_secs: u64,

    #[serde(default = "defaults::leveling_enabled")]
    pub leveling_enabled: bool,
    #[serde(default = "defaults::exp_per_message")]
    pub exp_per_message: u32,
    #[serde(default = "defaults::exp_cooldown_secs")]
    pub exp_cooldown_secs: u64,
    #[serde(default = "defaults::streak_multiplier")]
    pub streak_multiplier: f64,
    #[serde(default = "defaults::max_streak_bonus")]
    pub max_streak_bonus: u32,
    #[serde(default = "defaults::exp_per_level_unit")]
    pub exp_per_level_unit: u32,
    #[serde(default = "defaults::daily_bonus")]
    pub daily_bonus: i64,
    #[serde(default)]
    pub leveling_disabled_guilds: Vec<i64>,

    #[serde(default = "defaults::log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default = "defaults::service_name")]
    pub service_name: String,
}

impl Env {
    pub fn new() -> EnvResult<Self> {
        Ok(from_env::<Env>()?)
    }
}

mod defaults {
    use super::CacheBackend;

    pub const fn database_max_connections() -> u32 {
        10
    }

    pub const fn session_cache() -> CacheBackend {
        CacheBackend::Redis
    }

    pub fn redis_url() -> String {
        String::from("redis://127.0.0.1:6379")
    }

    pub const fn cache_timeout_ms() -> u64 {
        2_000
    }

    pub const fn store_timeout_ms() -> u64 {
        5_000
    }

    pub const fn session_ttl_secs() -> u64 {
        3_600
    }

    pub const fn session_flush_interval_secs() -> u64 {
        300
    }

    pub const fn vault_ttl_secs() -> u64 {
        86_400
    }

    pub const fn message_buffer_flush_secs() -> u64 {
        30
    }

    pub const fn stats_reconcile_interval_secs() -> u64 {
        21_600
    }

    pub const fn leveling_enabled() -> bool {
        true
    }

    pub const fn exp_per_message() -> u32 {
        10
    }

    pub const fn exp_cooldown_secs() -> u64 {
        3
    }

    pub const fn streak_multiplier() -> f64 {
        0.05
    }

    pub const fn max_streak_bonus() -> u32 {
        20
    }

    pub const fn exp_per_level_unit() -> u32 {
        100
    }

    pub const fn daily_bonus() -> i64 {
        1_000
    }

    pub fn log_filter() -> String {
        String::from("guild_sessions=debug,sqlx=warn,info")
    }

    pub fn service_name() -> String {
        String::from(env!("CARGO_PKG_NAME"))
    }
}

// ---
//  Deserializer implementation
// ---

/// The value half of a `(name, value)` pair; keeps the name around for error messages.
struct EnvValue {
    name: String,
    raw: String,
}

struct EnvName(String);

struct EnvPairs<I> {
    inner: I,
}

impl<I: Iterator<Item = (String, String)>> Iterator for EnvPairs<I> {
    type Item = (EnvName, EnvValue);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(name, raw)| (EnvName(name.clone()), EnvValue { name, raw }))
    }
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for EnvValue {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for EnvName {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

macro_rules! parse_scalars {
    ($($ty:ident => $method:ident,)*) => {
        $(
            fn $method<V>(self, visitor: V) -> Result<V::Value, EnvDeserializeError>
            where
                V: de::Visitor<'de>
            {
                match self.raw.trim().parse::<$ty>() {
                    Ok(val) => val.into_deserializer().$method(visitor),
                    Err(e) => Err(de::Error::custom(format_args!(
                        "{}: invalid value '{}' for {}",
                        e, self.raw, self.name
                    ))),
                }
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for EnvValue {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.raw.into_deserializer().deserialize_any(visitor)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if self.raw.trim().is_empty() {
            return SeqDeserializer::new(empty::<EnvValue>()).deserialize_seq(visitor);
        }

        let name = self.name;
        let items = self
            .raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| EnvValue {
                name: name.clone(),
                raw: item.to_owned(),
            })
            .collect::<Vec<_>>();

        SeqDeserializer::new(items.into_iter()).deserialize_seq(visitor)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if self.raw.is_empty() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_newtype_struct<V>(
        self,
        _: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_enum(self.raw.trim().to_lowercase().into_deserializer())
    }

    parse_scalars! {
        bool => deserialize_bool,
        u8 => deserialize_u8,
        u16 => deserialize_u16,
        u32 => deserialize_u32,
        u64 => deserialize_u64,
        i8 => deserialize_i8,
        i16 => deserialize_i16,
        i32 => deserialize_i32,
        i64 => deserialize_i64,
        f32 => deserialize_f32,
        f64 => deserialize_f64,
    }

    serde::forward_to_deserialize_any! {
        char str string unit bytes byte_buf map
        unit_struct tuple_struct identifier tuple
        ignored_any struct
    }
}

impl<'de> de::Deserializer<'de> for EnvName {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.0.into_deserializer().deserialize_any(visitor)
    }

    serde::forward_to_deserialize_any! {
        char str string unit seq option bytes byte_buf map
        unit_struct newtype_struct tuple_struct identifier tuple ignored_any
        bool u8 u16 u32 u64 i8 i16 i32 i64 f32 f64 enum struct
    }
}

struct EnvDeserializer<'de, I: Iterator<Item = (String, String)>> {
    pairs: MapDeserializer<'de, EnvPairs<I>, EnvDeserializeError>,
}

impl<'de, I: Iterator<Item = (String, String)>> de::Deserializer<'de> for EnvDeserializer<'de, I> {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_map(self.pairs)
    }

    serde::forward_to_deserialize_any! {
        char str string unit seq option bytes byte_buf map
        newtype_struct unit_struct tuple_struct identifier
        tuple ignored_any bool u8 u16 u32 u64 i8 i16 i32 i64
        f32 f64 enum struct
    }
}

/// Deserializes `T` from the current environment, loading `.env` first if one is present.
pub fn from_env<T>() -> Result<T, EnvDeserializeError>
where
    T: de::DeserializeOwned,
{
    from_iter(dotenvy::vars())
}

pub fn from_iter<I, T>(vars: I) -> Result<T, EnvDeserializeError>
where
    T: de::DeserializeOwned,
    I: IntoIterator<Item = (String, String)>,
{
    T::deserialize(EnvDeserializer {
        pairs: MapDeserializer::new(EnvPairs {
            inner: vars.into_iter(),
        }),
    })
}

impl de::Error for EnvDeserializeError {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        EnvDeserializeError::Custom(msg.to_string())
    }

    fn missing_field(field: &'static str) -> Self {
        EnvDeserializeError::MissingValue(field.to_uppercase())
    }
}

pub type EnvResult<T> = core::result::Result<T, EnvErr>;

#[derive(Debug, Error)]
pub enum EnvErr {
    #[error(transparent)]
    Deserialize(#[from] EnvDeserializeError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum EnvDeserializeError {
    #[error("env deserialization error: {0}")]
    Custom(String),

    #[error("missing required variable {0}")]
    MissingValue(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_fill_unset_vars() {
        let env: Env = from_iter(vars(&[
            ("DATABASE_URL", "postgres://localhost/guilds"),
            ("PATH", "/usr/bin"),
        ]))
        .unwrap();

        assert_eq!(env.database_url, "postgres://localhost/guilds");
        assert_eq!(env.session_cache, CacheBackend::Redis);
        assert_eq!(env.session_ttl_secs, 3_600);
        assert_eq!(env.session_flush_interval_secs, 300);
        assert_eq!(env.exp_per_message, 10);
        assert_eq!(env.daily_bonus, 1_000);
        assert_eq!(env.stats_reconcile_interval_secs, 21_600);
        assert!(env.leveling_disabled_guilds.is_empty());
        assert!(env.otel_exporter_otlp_endpoint.is_none());
    }

    #[test]
    fn test_parses_lists_enums_and_floats() {
        let env: Env = from_iter(vars(&[
            ("DATABASE_URL", "postgres://localhost/guilds"),
            ("SESSION_CACHE", "Memory"),
            ("LEVELING_DISABLED_GUILDS", "12, 34,56"),
            ("STREAK_MULTIPLIER", "0.25"),
            ("LEVELING_ENABLED", "false"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4317"),
        ]))
        .unwrap();

        assert_eq!(env.session_cache, CacheBackend::Memory);
        assert_eq!(env.leveling_disabled_guilds, vec![12, 34, 56]);
        assert_eq!(env.streak_multiplier, 0.25);
        assert!(!env.leveling_enabled);
        assert_eq!(
            env.otel_exporter_otlp_endpoint.as_deref(),
            Some("http://collector:4317")
        );
    }

    #[test]
    fn test_missing_required_var() {
        let err = from_iter::<_, Env>(vars(&[("REDIS_URL", "redis://cache")])).unwrap_err();
        assert!(matches!(err, EnvDeserializeError::MissingValue(ref v) if v == "DATABASE_URL"));
    }

    #[test]
    fn test_bad_number_names_the_variable() {
        let err = from_iter::<_, Env>(vars(&[
            ("DATABASE_URL", "postgres://localhost/guilds"),
            ("SESSION_TTL_SECS", "an hour"),
        ]))
        .unwrap_err();

        assert!(err.to_string().contains("SESSION_TTL_SECS"));
    }
}
