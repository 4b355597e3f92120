use core::fmt;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::db::models::{GuildId, UserId};

/// Key-value store holding live session documents with per-key expiry.
#[async_trait]
pub trait SessionCache: Send + Sync + fmt::Debug {
    async fn ping(&self) -> CacheResult<()>;

    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value and expiry.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl>;

    /// Resets the expiry of an existing key; `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Removes `key`; `false` if it did not exist.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// All live keys starting with `prefix`. Not a snapshot: keys may come and go during the
    /// scan.
    async fn scan_prefix(&self, prefix: &str) -> CacheResult<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

impl KeyTtl {
    /// The TTL to write a replacement value with, or `None` if the key is gone.
    pub fn remaining_or(self, fallback: Duration) -> Option<Duration> {
        match self {
            KeyTtl::Missing => None,
            KeyTtl::Persistent => Some(fallback),
            KeyTtl::Expires(left) if left.is_zero() => None,
            KeyTtl::Expires(left) => Some(left),
        }
    }
}

/// Cache keys for the two document kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Session(GuildId, UserId),
    Vault(GuildId),
}

impl CacheKey {
    pub const SESSION_PREFIX: &'static str = "session:";
    pub const VAULT_PREFIX: &'static str = "guild_vault:";

    pub fn parse(key: &str) -> Option<Self> {
        if let Some(rest) = key.strip_prefix(Self::SESSION_PREFIX) {
            let (guild, user) = rest.split_once(':')?;
            return Some(CacheKey::Session(
                GuildId(guild.parse().ok()?),
                UserId(user.parse().ok()?),
            ));
        }

        let guild = key.strip_prefix(Self::VAULT_PREFIX)?;
        Some(CacheKey::Vault(GuildId(guild.parse().ok()?)))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Session(guild_id, user_id) => {
                write!(f, "{}{guild_id}:{user_id}", Self::SESSION_PREFIX)
            }
            CacheKey::Vault(guild_id) => write!(f, "{}{guild_id}", Self::VAULT_PREFIX),
        }
    }
}

pub type CacheResult<T> = core::result::Result<T, CacheErr>;

/// Every variant means the cache could not be used for this call.
#[derive(Debug, Error)]
pub enum CacheErr {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error("cache call did not complete within {0:?}")]
    Timeout(Duration),

    #[error("cache offline: {0}")]
    Offline(String),
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local [`SessionCache`], for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    #[cfg(test)]
    offline: std::sync::atomic::AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.offline
            .store(offline, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_online(&self) -> CacheResult<()> {
        #[cfg(test)]
        if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CacheErr::Offline("memory cache switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn ping(&self) -> CacheResult<()> {
        self.check_online()
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check_online()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.check_online()?;
        self.entries.lock().await.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        self.check_online()?;
        let entries = self.entries.lock().await;
        let now = Instant::now();

        Ok(match entries.get(key) {
            Some(entry) if entry.expires_at > now => KeyTtl::Expires(entry.expires_at - now),
            _ => KeyTtl::Missing,
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.check_online()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.check_online()?;
        let removed = self.entries.lock().await.remove(key);
        Ok(removed.is_some_and(|entry| entry.expires_at > Instant::now()))
    }

    async fn scan_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        self.check_online()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        entries.retain(|_, entry| entry.expires_at > now);
        Ok(entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
