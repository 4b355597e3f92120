use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::buffer::MessageCountBuffer;
use crate::db::StatsStore;
use crate::leveling::LevelCurve;
use crate::session::{FlushReport, SessionManager, SessionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushIntervals {
    pub sessions: Duration,
    pub buffer: Duration,
    pub reconcile: Duration,
}

/// What the periodic global totals rebuild runs against.
#[derive(Debug, Clone)]
pub struct Reconciler {
    pub store: Arc<dyn StatsStore>,
    pub curve: LevelCurve,
}

/// Periodic flush tasks for sessions and the message buffer, plus the global totals rebuild.
///
/// A flush that is already running when shutdown is requested finishes before its task exits.
#[derive(Debug)]
pub struct BackgroundFlusher {
    sessions: SessionManager,
    buffer: Arc<MessageCountBuffer>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundFlusher {
    pub fn start(
        sessions: SessionManager,
        buffer: Arc<MessageCountBuffer>,
        reconciler: Reconciler,
        intervals: FlushIntervals,
    ) -> Self {
        let cancel = CancellationToken::new();

        let session_task = tokio::spawn(flush_sessions(
            sessions.clone(),
            intervals.sessions,
            cancel.child_token(),
        ));
        let buffer_task = tokio::spawn(flush_buffer(
            Arc::clone(&buffer),
            intervals.buffer,
            cancel.child_token(),
        ));
        let reconcile_task = tokio::spawn(reconcile_stats(
            reconciler,
            intervals.reconcile,
            cancel.child_token(),
        ));

        tracing::info!(
            sessions_every = ?intervals.sessions,
            buffer_every = ?intervals.buffer,
            reconcile_every = ?intervals.reconcile,
            "background flusher started"
        );

        Self {
            sessions,
            buffer,
            cancel,
            tasks: vec![session_task, buffer_task, reconcile_task],
        }
    }

    /// Stops the periodic tasks, then writes every cached session and whatever is buffered.
    pub async fn shutdown(self) -> SessionResult<FlushReport> {
        self.cancel.cancel();
        for joined in join_all(self.tasks).await {
            if let Err(e) = joined {
                tracing::error!(error = ?e, "flush task did not stop cleanly");
            }
        }

        let report = self.sessions.flush_all_sessions().await;
        match &report {
            Ok(report) if report.failures() > 0 => {
                tracing::error!(
                    failed = report.failures(),
                    "shutdown flush left unwritten sessions"
                )
            }
            Ok(report) => tracing::info!(
                sessions = report.sessions_flushed,
                vaults = report.vaults_flushed,
                "shutdown flush finished"
            ),
            Err(e) => tracing::error!(error = ?e, "shutdown flush failed"),
        }

        if let Err(e) = self.buffer.flush().await {
            tracing::error!(error = ?e, "shutdown buffer flush failed");
        }

        report
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn flush_sessions(sessions: SessionManager, period: Duration, cancel: CancellationToken) {
    let mut ticker = ticker(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = ticker.tick() => match sessions.flush_dirty_sessions().await {
                Ok(report) if report.failures() > 0 => {
                    tracing::warn!(failed = report.failures(), "some sessions kept for next flush");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "session flush pass failed"),
            },
        }
    }

    tracing::debug!("session flush task stopped");
}

async fn flush_buffer(
    buffer: Arc<MessageCountBuffer>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = ticker(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                // failures are logged by the buffer and its counts retried next tick
                _ = buffer.flush().await;
            }
        }
    }

    tracing::debug!("buffer flush task stopped");
}

async fn reconcile_stats(reconciler: Reconciler, period: Duration, cancel: CancellationToken) {
    let mut ticker = ticker(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                let corrected = reconciler.store.reconcile_global_stats(reconciler.curve).await;
                match corrected {
                    Ok(0) => tracing::debug!("global stats already consistent"),
                    Ok(corrected) => tracing::info!(corrected, "global stats reconciled"),
                    Err(e) => tracing::error!(error = ?e, "global stats reconciliation failed"),
                }
            }
        }
    }

    tracing::debug!("stats reconciliation task stopped");
}
