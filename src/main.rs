use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;

use guild_sessions::activity::{ActivityEvent, ActivityHandler};
use guild_sessions::buffer::MessageCountBuffer;
use guild_sessions::config::Config;
use guild_sessions::daily::DailyCheckCache;
use guild_sessions::db::pg::PgStatsStore;
use guild_sessions::db::redis::RedisCache;
use guild_sessions::db::{StatsStore, StoreErr};
use guild_sessions::flusher::{BackgroundFlusher, FlushIntervals, Reconciler};
use guild_sessions::session::cache::{MemoryCache, SessionCache};
use guild_sessions::session::{SessionErr, SessionManager};
use guild_sessions::util::env::{CacheBackend, EnvErr};
use guild_sessions::util::telemetry::Telemetry;
use guild_sessions::util::{Clock, SystemClock};

#[derive(Debug, Error)]
enum RunnerErr {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Env(#[from] EnvErr),

    #[error(transparent)]
    Store(#[from] StoreErr),

    #[error(transparent)]
    Std(#[from] Box<dyn std::error::Error + Send + Sync>),
}

type Result<T> = core::result::Result<T, RunnerErr>;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let telemetry = Telemetry::new(&config.telemetry)?.register();

    tracing::info!(cache = ?config.cache.backend, "starting guild session service");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pg = Arc::new(PgStatsStore::connect(&config.database, config.session.store_timeout).await?);
    pg.ensure_schema().await?;
    let store: Arc<dyn StatsStore> = pg.clone();

    let sessions = match config.cache.backend {
        CacheBackend::Redis => {
            let url = config.cache.redis_url.clone();
            let op_timeout = config.cache.op_timeout;
            let connect = async move {
                let cache = RedisCache::connect(&url, op_timeout).await?;
                Ok::<_, SessionErr>(Arc::new(cache) as Arc<dyn SessionCache>)
            };

            SessionManager::init(
                connect,
                op_timeout,
                Arc::clone(&store),
                Arc::clone(&clock),
                config.leveling.curve,
                config.session.clone(),
            )
            .await
        }
        CacheBackend::Memory => SessionManager::new(
            Some(Arc::new(MemoryCache::new()) as Arc<dyn SessionCache>),
            Arc::clone(&store),
            Arc::clone(&clock),
            config.leveling.curve,
            config.session.clone(),
        ),
    };

    let buffer = Arc::new(MessageCountBuffer::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        config.buffer.store_timeout,
    ));
    let daily = Arc::new(DailyCheckCache::new(Arc::clone(&clock)));

    let flusher = BackgroundFlusher::start(
        sessions.clone(),
        Arc::clone(&buffer),
        Reconciler {
            store: Arc::clone(&store),
            curve: config.leveling.curve,
        },
        FlushIntervals {
            sessions: config.session.flush_interval,
            buffer: config.buffer.flush_interval,
            reconcile: config.reconcile.interval,
        },
    );

    let handler = ActivityHandler::new(sessions, buffer, daily, Arc::new(config.leveling));
    read_events(handler).await?;

    if let Err(e) = flusher.shutdown().await {
        tracing::error!(error = ?e, "sessions left unflushed at exit");
    }

    pg.close().await;
    tracing::info!("shutdown complete");
    telemetry.shutdown();
    Ok(())
}

/// Applies newline-delimited JSON events from stdin until the feed closes or an interrupt
/// arrives, then waits for in-flight events.
async fn read_events(handler: ActivityHandler) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                tracing::info!("interrupt received, shutting down");
                break;
            }

            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match ActivityEvent::parse(&line) {
                    Ok(event) => {
                        let handler = handler.clone();
                        in_flight.spawn(async move {
                            if let Err(e) = handler.handle(event).await {
                                tracing::warn!(error = %e, ?event, "activity not applied");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "skipping malformed event line"),
                },
                None => {
                    tracing::info!("event feed closed");
                    break;
                }
            },

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = ?e, "activity task panicked");
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = ?e, "activity task panicked");
        }
    }

    Ok(())
}
