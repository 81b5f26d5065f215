//! Background workers
//!
//! Each loop ticks on its own interval and stops when the shutdown signal
//! flips. A failed tick is logged and the loop carries on.

use crate::{engine::EscrowEngine, Result};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Running worker loops
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Number of loops running
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no loop was started
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal every loop and wait for the ticks in flight to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Workers stopped");
    }
}

/// Start the settlement, sweep, reconciliation and purge loops
pub fn spawn(engine: Arc<EscrowEngine>) -> WorkerHandle {
    let (shutdown, rx) = watch::channel(false);
    let workers = engine.config().workers.clone();
    let mut tasks = Vec::with_capacity(4);

    let e = engine.clone();
    tasks.push(spawn_loop(
        "settlement",
        Duration::from_secs(workers.settlement_interval_secs),
        rx.clone(),
        move || {
            let engine = e.clone();
            async move {
                let report = engine.run_settlement_cycle(Utc::now()).await?;
                if report != Default::default() {
                    tracing::info!(
                        assigned = report.assigned,
                        claimed = report.claimed,
                        settled = report.settled,
                        failed = report.failed,
                        "Settlement cycle"
                    );
                }
                Ok(())
            }
        },
    ));

    let e = engine.clone();
    tasks.push(spawn_loop(
        "sweeps",
        Duration::from_secs(workers.sweep_interval_secs),
        rx.clone(),
        move || {
            let engine = e.clone();
            async move {
                let now = Utc::now();
                let stuck = engine.sweep_stuck(now).await?;
                let dead = engine.sweep_dead_letters(now).await?;
                let retried = engine.retry_failed().await?;
                let released = engine.sweep_reservations().await?;
                if !stuck.is_empty() || !dead.is_empty() || retried > 0 || released > 0 {
                    tracing::info!(
                        stuck = stuck.len(),
                        dead_lettered = dead.len(),
                        retried,
                        released,
                        "Sweep cycle"
                    );
                }
                Ok(())
            }
        },
    ));

    let e = engine.clone();
    tasks.push(spawn_loop(
        "reconciliation",
        Duration::from_secs(workers.reconciliation_interval_secs),
        rx.clone(),
        move || {
            let engine = e.clone();
            async move {
                let diverged = engine.reconcile_all(Utc::now()).await?;
                if diverged > 0 {
                    tracing::warn!(diverged, "Reconciliation found diverging accounts");
                }
                Ok(())
            }
        },
    ));

    let e = engine;
    tasks.push(spawn_loop(
        "purge",
        Duration::from_secs(workers.purge_interval_secs),
        rx,
        move || {
            let engine = e.clone();
            async move {
                engine.purge(Utc::now())?;
                Ok(())
            }
        },
    ));

    tracing::info!(workers = tasks.len(), worker_id = %workers.worker_id, "Workers started");
    WorkerHandle { shutdown, tasks }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = tick().await {
                        tracing::warn!(worker = name, error = %e, "Worker tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!(worker = name, "Worker stopping");
                        break;
                    }
                }
            }
        }
    })
}
