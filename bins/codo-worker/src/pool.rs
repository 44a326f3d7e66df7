/// Worker Pool - bounded concurrent dispatch of leased submissions
///
/// **Responsibilities:**
/// - At most `workers` submissions are judged at once (semaphore permits)
/// - Each judging task is supervised: its lease is renewed on a heartbeat,
///   and a failure or panic hands the lease back for a bounded retry
/// - A run whose lease cannot be renewed is aborted before the lease expires,
///   so a submission never executes on two workers at once
/// - On startup, leases left behind by a previous process are settled
/// - A reaper settles leases whose holder stopped renewing
/// - Shutdown stops dispatching and waits for in-flight work to finish
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::executor::{self, JudgeContext, JudgeOutcome, Settlement};
use crate::metrics;
use codo_common::error::QueueError;
use codo_common::types::Lease;

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub workers: usize,
    /// How long one dequeue call blocks before re-checking shutdown
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    pub reaper_interval: Duration,
}

pub struct WorkerPool {
    ctx: Arc<JudgeContext>,
    settings: PoolSettings,
}

impl WorkerPool {
    pub fn new(ctx: Arc<JudgeContext>, settings: PoolSettings) -> Self {
        Self { ctx, settings }
    }

    /// Settle every lease that was in flight when the previous worker
    /// process stopped. Such attempts count as crashed.
    pub async fn recover(&self) -> Result<usize> {
        let orphaned = self.ctx.queue.recover().await?;
        for lease in &orphaned {
            settle(&self.ctx, lease, "worker process exited while judging").await;
        }
        if !orphaned.is_empty() {
            warn!(count = orphaned.len(), "Recovered orphaned leases");
        }
        Ok(orphaned.len())
    }

    /// Settle leases that expired without renewal
    pub async fn reap_expired(&self) -> Result<usize> {
        let now = chrono::Utc::now();
        let expired: Vec<Lease> = self
            .ctx
            .queue
            .in_flight()
            .await?
            .into_iter()
            .filter(|lease| lease.is_expired(now))
            .collect();
        for lease in &expired {
            settle(&self.ctx, lease, "lease expired without renewal").await;
        }
        Ok(expired.len())
    }

    /// Dispatch until `shutdown` flips to true, then drain
    #[tracing::instrument(skip_all, fields(workers = self.settings.workers))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.recover().await?;

        let permits = Arc::new(Semaphore::new(self.settings.workers));
        let mut reaper = tokio::time::interval(self.settings.reaper_interval);
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(workers = self.settings.workers, "Worker pool started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = reaper.tick() => {
                    match self.reap_expired().await {
                        Ok(0) => {}
                        Ok(count) => warn!(count, "Reaped expired leases"),
                        Err(e) => error!(error = %e, "Lease reaper failed"),
                    }
                }
                permit = permits.clone().acquire_owned() => {
                    let permit = permit?;
                    match self.ctx.queue.dequeue(self.settings.poll_interval).await {
                        Ok(Some(lease)) => {
                            let ctx = self.ctx.clone();
                            let heartbeat = (self.settings.lease_ttl / 3).max(Duration::from_millis(1));
                            tokio::spawn(async move {
                                supervise(ctx, lease, heartbeat).await;
                                drop(permit);
                            });
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(error = %e, "Queue error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        warn!("Shutdown requested - waiting for in-flight submissions");
        let _drained = permits.acquire_many(self.settings.workers as u32).await?;
        info!("Worker pool drained");
        Ok(())
    }
}

/// Run one judging task to completion while keeping its lease alive
async fn supervise(ctx: Arc<JudgeContext>, lease: Lease, heartbeat: Duration) {
    let _busy = BusyGuard::enter();
    let started = Instant::now();

    let mut job = {
        let ctx = ctx.clone();
        let lease = lease.clone();
        tokio::spawn(async move { executor::judge(&ctx, &lease).await })
    };

    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;
    let mut current = lease.clone();

    let result = loop {
        tokio::select! {
            result = &mut job => break result,
            _ = ticker.tick() => match renew(&ctx, &current, heartbeat / 2).await {
                Ok(renewed) => current = renewed,
                Err(reason) => {
                    // Stop before the lease expires and the reaper hands the
                    // submission to another worker.
                    warn!(
                        submission_id = %lease.submission_id,
                        attempt = lease.attempt,
                        error = %reason,
                        "Lease renewal failed - abandoning the run"
                    );
                    job.abort();
                    let _ = (&mut job).await;
                    metrics::ABANDONED_RUNS.inc();
                    return;
                }
            },
        }
    };

    match result {
        Ok(Ok(JudgeOutcome::Judged(record))) => {
            let language = record.language.to_string();
            metrics::VERDICTS
                .with_label_values(&[record.status.as_str(), language.as_str()])
                .inc();
            metrics::JUDGE_SECONDS
                .with_label_values(&[language.as_str()])
                .observe(started.elapsed().as_secs_f64());
            info!(
                submission_id = %record.id,
                status = %record.status,
                score = record.score,
                max_score = record.max_score,
                duration_ms = started.elapsed().as_millis() as u64,
                "Verdict written"
            );
        }
        Ok(Ok(outcome)) => {
            debug!(submission_id = %lease.submission_id, outcome = ?outcome, "Lease finished without a verdict");
        }
        Ok(Err(e)) => {
            error!(submission_id = %lease.submission_id, error = %format!("{:#}", e), "Judging failed");
            settle(&ctx, &current, &format!("{:#}", e)).await;
        }
        Err(join_error) => {
            error!(submission_id = %lease.submission_id, error = %join_error, "Judging task panicked");
            settle(&ctx, &current, "worker task panicked").await;
        }
    }
}

/// One heartbeat renewal with a single quick retry. Each try is bounded so a
/// hung backend cannot outlive the lease.
async fn renew(ctx: &JudgeContext, lease: &Lease, budget: Duration) -> Result<Lease, String> {
    let budget = budget.max(Duration::from_millis(1));
    let mut last = String::new();
    for _ in 0..2 {
        match tokio::time::timeout(budget, ctx.queue.renew(lease)).await {
            Ok(Ok(renewed)) => return Ok(renewed),
            Ok(Err(e @ QueueError::LeaseLost(_))) => return Err(e.to_string()),
            Ok(Err(e)) => last = e.to_string(),
            Err(_) => last = "lease renewal timed out".to_string(),
        }
    }
    Err(last)
}

async fn settle(ctx: &JudgeContext, lease: &Lease, reason: &str) {
    match executor::settle_failed_attempt(ctx, lease, reason).await {
        Ok(Settlement::Retrying) => metrics::RETRIES.inc(),
        Ok(Settlement::Failed) => metrics::INFRA_FAILURES.inc(),
        Ok(Settlement::Abandoned) => {}
        Err(e) => error!(
            submission_id = %lease.submission_id,
            error = %format!("{:#}", e),
            "Failed to settle lease; the reaper will retry once it expires"
        ),
    }
}

struct BusyGuard;

impl BusyGuard {
    fn enter() -> Self {
        metrics::BUSY_WORKERS.inc();
        BusyGuard
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        metrics::BUSY_WORKERS.dec();
    }
}
