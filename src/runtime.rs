//! Periodic drivers for the control loops.
//!
//! Each loop ticks on its own interval. A tick that is still running when the
//! next one is due delays it; missed ticks are skipped, not replayed.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

use crate::error::SchedulerError;

/// Counts for one sweep over its candidate records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    /// Records read as candidates.
    pub candidates: usize,
    /// Records this tick claimed and moved on.
    pub completed: usize,
    /// Records another actor claimed first.
    pub contended: usize,
    /// Records whose processing failed.
    pub failed: usize,
}

/// Per-record result of a sweep, as far as the summary is concerned.
pub trait Outcome {
    fn contended(&self) -> bool;
}

impl TickSummary {
    pub fn tally<O: Outcome>(candidates: usize, results: &[Result<O, SchedulerError>]) -> Self {
        let mut summary = Self {
            candidates,
            ..Self::default()
        };
        for result in results {
            match result {
                Ok(outcome) if outcome.contended() => summary.contended += 1,
                Ok(_) => summary.completed += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            candidates: self.candidates + other.candidates,
            completed: self.completed + other.completed,
            contended: self.contended + other.contended,
            failed: self.failed + other.failed,
        }
    }
}

/// Fold the passes of one tick into a single summary. Failed passes are
/// logged; the tick fails only if every pass did.
pub fn combine(
    passes: impl IntoIterator<Item = Result<TickSummary, SchedulerError>>,
) -> Result<TickSummary, SchedulerError> {
    let mut summary = TickSummary::default();
    let mut last_error = None;
    let mut succeeded = 0;
    for pass in passes {
        match pass {
            Ok(s) => {
                summary = summary.merge(s);
                succeeded += 1;
            }
            Err(e) => {
                error!(error = %e, "pass failed");
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) if succeeded == 0 => Err(e),
        _ => Ok(summary),
    }
}

/// One control loop's body.
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    fn tick(&self) -> impl Future<Output = Result<TickSummary, SchedulerError>> + Send;
}

/// Run one tick inside a span carrying the loop name and a tick id.
pub async fn run_once(sweep: &impl Sweep) -> Result<TickSummary, SchedulerError> {
    let span = info_span!("tick", sweep = sweep.name(), tick = %Uuid::new_v4());
    async {
        let result = sweep.tick().await;
        match &result {
            Ok(summary) if summary.candidates > 0 => info!(?summary, "tick done"),
            Ok(_) => debug!("nothing to do"),
            Err(e) => error!(error = %e, "tick failed"),
        }
        result
    }
    .instrument(span)
    .await
}

/// Tick `sweep` every `period` until `shutdown` is cancelled. A failed tick
/// is logged and the loop carries on.
pub async fn run_periodic(sweep: &impl Sweep, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(sweep = sweep.name(), ?period, "loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let _ = run_once(sweep).await;
            }
        }
    }
    info!(sweep = sweep.name(), "loop stopped");
}

/// Cancel the returned token on SIGINT or SIGTERM.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        token_clone.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "failed to install signal handlers, falling back to Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl-C, initiating graceful shutdown");
    }
}
