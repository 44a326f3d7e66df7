/// Submission Executor - High-Level Orchestration of One Lease
///
/// **Responsibility:**
/// Take a leased submission from `pending` to a terminal verdict:
/// 1. Claim the record as `running` under the lease
/// 2. Load the problem and resolve limits
/// 3. Run the test cases through the sandbox (runner.rs)
/// 4. Write the verdict with a compare-and-swap on the lease
/// 5. Complete the lease
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (sandbox backends)
/// - How output is compared (evaluator.rs)
use anyhow::{Context, Result};
use codo_common::error::{Diagnostic, QueueError, StoreError};
use codo_common::problems::ProblemStore;
use codo_common::queue::{Release, SubmissionQueue};
use codo_common::store::SubmissionStore;
use codo_common::types::{Lease, Limits, Submission, Verdict};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::Sandbox;
use crate::runner::TestRunner;

/// Everything a worker needs to judge a lease
pub struct JudgeContext {
    pub store: Arc<dyn SubmissionStore>,
    pub queue: Arc<dyn SubmissionQueue>,
    pub problems: Arc<dyn ProblemStore>,
    pub sandbox: Arc<dyn Sandbox>,
    pub default_limits: Limits,
}

#[derive(Debug)]
pub enum JudgeOutcome {
    /// Verdict written by this worker
    Judged(Submission),
    /// Record was already terminal (cancelled, or finished by someone else)
    Skipped,
    /// A newer lease owns the record; this worker's result was discarded
    Superseded,
}

/// What happened to a lease whose attempt failed outside the submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Requeued for another attempt
    Retrying,
    /// Attempts exhausted; the record now carries an infrastructure error
    Failed,
    /// Nothing left to do (lease lost, record gone or already terminal)
    Abandoned,
}

#[tracing::instrument(
    skip(ctx, lease),
    fields(submission_id = %lease.submission_id, attempt = lease.attempt)
)]
pub async fn judge(ctx: &JudgeContext, lease: &Lease) -> Result<JudgeOutcome> {
    let id = lease.submission_id;

    let submission = match ctx.store.mark_running(id, lease).await {
        Ok(submission) => submission,
        Err(StoreError::AlreadyTerminal(_)) => {
            info!("Submission already terminal - skipping");
            complete_lease(ctx, lease).await?;
            return Ok(JudgeOutcome::Skipped);
        }
        Err(StoreError::NotFound(_)) => {
            warn!("Submission record missing - dropping lease");
            complete_lease(ctx, lease).await?;
            return Ok(JudgeOutcome::Skipped);
        }
        Err(e) => return Err(e).context("Failed to mark submission running"),
    };

    info!(
        problem_id = %submission.problem_id,
        language = %submission.language,
        source_size = submission.source_code.len(),
        "Judging submission"
    );

    let problem = ctx
        .problems
        .get(&submission.problem_id)
        .await
        .context("Failed to load problem")?;

    let verdict = match problem {
        None => Verdict::error(Diagnostic::ProblemNotFound(submission.problem_id.clone()).to_string()),
        Some(problem) => {
            let limits = problem.limits.unwrap_or(ctx.default_limits);
            TestRunner::new(ctx.sandbox.as_ref())
                .run(&submission, &problem, &limits)
                .await
                .context("Sandbox failed while judging")?
        }
    };

    match ctx.store.update_terminal(id, lease.token, &verdict).await {
        Ok(record) => {
            complete_lease(ctx, lease).await?;
            Ok(JudgeOutcome::Judged(record))
        }
        Err(StoreError::AlreadyTerminal(_)) => {
            warn!("Verdict discarded - submission became terminal while judging");
            complete_lease(ctx, lease).await?;
            Ok(JudgeOutcome::Skipped)
        }
        Err(StoreError::LeaseMismatch(_)) => {
            warn!("Verdict discarded - lease was superseded");
            Ok(JudgeOutcome::Superseded)
        }
        Err(e) => Err(e).context("Failed to write verdict"),
    }
}

/// Hand back a lease after a crash, panic, lease expiry or sandbox fault.
/// Requeues while attempts remain, otherwise records an execution
/// infrastructure failure on the submission.
pub async fn settle_failed_attempt(
    ctx: &JudgeContext,
    lease: &Lease,
    reason: &str,
) -> Result<Settlement> {
    let id = lease.submission_id;

    match ctx.queue.release(lease).await {
        Ok(Release::Requeued) => {
            warn!(submission_id = %id, attempt = lease.attempt, reason, "Attempt failed - requeued");
            return Ok(Settlement::Retrying);
        }
        Ok(Release::Exhausted) => {}
        Err(QueueError::LeaseLost(_)) => {
            debug!(submission_id = %id, "Lease already gone - nothing to settle");
            return Ok(Settlement::Abandoned);
        }
        Err(e) => return Err(e).context("Failed to release lease"),
    }

    match ctx.store.mark_running(id, lease).await {
        Ok(_) => {}
        Err(StoreError::AlreadyTerminal(_)) | Err(StoreError::NotFound(_)) => {
            complete_lease(ctx, lease).await?;
            return Ok(Settlement::Abandoned);
        }
        Err(e) => return Err(e).context("Failed to claim submission for failure verdict"),
    }

    let verdict =
        Verdict::error(Diagnostic::ExecutionInfrastructureFailure(reason.to_string()).to_string());
    match ctx.store.update_terminal(id, lease.token, &verdict).await {
        Ok(_) | Err(StoreError::AlreadyTerminal(_)) => {}
        Err(e) => return Err(e).context("Failed to write failure verdict"),
    }
    complete_lease(ctx, lease).await?;

    warn!(submission_id = %id, attempts = lease.attempt, reason, "Attempts exhausted - submission failed");
    Ok(Settlement::Failed)
}

async fn complete_lease(ctx: &JudgeContext, lease: &Lease) -> Result<()> {
    match ctx.queue.complete(lease).await {
        Ok(()) => Ok(()),
        Err(QueueError::LeaseLost(_)) => {
            debug!(submission_id = %lease.submission_id, "Lease already released");
            Ok(())
        }
        Err(e) => Err(e).context("Failed to complete lease"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{SandboxError, SandboxOutcome};
    use crate::runner::tests::{problem, stdout, ScriptedSandbox};
    use codo_common::problems::MemoryProblemStore;
    use codo_common::queue::{MemoryQueue, QueueSettings};
    use codo_common::store::MemoryStore;
    use codo_common::types::{Difficulty, Language, SubmissionStatus};
    use std::time::Duration;

    struct Harness {
        ctx: JudgeContext,
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
    }

    async fn harness(script: Vec<Result<SandboxOutcome, SandboxError>>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(QueueSettings::default()));
        let problems = Arc::new(MemoryProblemStore::new());
        problems
            .create(&problem(Difficulty::Easy, &["1", "2"]))
            .await
            .unwrap();
        Harness {
            ctx: JudgeContext {
                store: store.clone(),
                queue: queue.clone(),
                problems,
                sandbox: Arc::new(ScriptedSandbox::new(script)),
                default_limits: Limits::default(),
            },
            store,
            queue,
        }
    }

    async fn submit(h: &Harness, problem_id: &str) -> Lease {
        let submission = Submission::new("u1", problem_id, Language::Python, "print(1)");
        let id = h.store.create(&submission).await.unwrap();
        h.queue.enqueue(id).await.unwrap();
        h.queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_judge_writes_verdict_and_completes_lease() {
        let h = harness(vec![stdout("1"), stdout("2")]).await;
        let lease = submit(&h, "sum").await;

        let outcome = judge(&h.ctx, &lease).await.unwrap();
        let JudgeOutcome::Judged(record) = outcome else {
            panic!("expected a verdict, got {:?}", outcome);
        };
        assert_eq!(record.status, SubmissionStatus::Accepted);
        assert_eq!(record.score, 10);
        assert_eq!(record.max_score, 10);
        assert!(h.queue.in_flight().await.unwrap().is_empty());

        let stored = h.store.get(lease.submission_id).await.unwrap();
        assert_eq!(stored.status, SubmissionStatus::Accepted);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_submission_is_skipped() {
        let h = harness(vec![]).await;
        let lease = submit(&h, "sum").await;
        h.store.cancel(lease.submission_id).await.unwrap();

        let outcome = judge(&h.ctx, &lease).await.unwrap();
        assert!(matches!(outcome, JudgeOutcome::Skipped));
        assert!(h.queue.in_flight().await.unwrap().is_empty());
        let stored = h.store.get(lease.submission_id).await.unwrap();
        assert_eq!(stored.error.as_deref(), Some("cancelled before judging"));
    }

    #[tokio::test]
    async fn test_missing_problem_is_error_verdict() {
        let h = harness(vec![]).await;
        let lease = submit(&h, "nope").await;

        let outcome = judge(&h.ctx, &lease).await.unwrap();
        let JudgeOutcome::Judged(record) = outcome else {
            panic!("expected a verdict, got {:?}", outcome);
        };
        assert_eq!(record.status, SubmissionStatus::Error);
        assert_eq!(record.error.as_deref(), Some("problem nope not found"));
    }

    #[tokio::test]
    async fn test_sandbox_fault_is_an_error_not_a_verdict() {
        let h = harness(vec![Err(SandboxError::Infrastructure("daemon down".into()))]).await;
        let lease = submit(&h, "sum").await;

        assert!(judge(&h.ctx, &lease).await.is_err());
        let stored = h.store.get(lease.submission_id).await.unwrap();
        assert_eq!(stored.status, SubmissionStatus::Running);
    }

    #[tokio::test]
    async fn test_failed_attempt_retries_once_then_fails() {
        let h = harness(vec![]).await;
        let first = submit(&h, "sum").await;
        h.store.mark_running(first.submission_id, &first).await.unwrap();

        let settled = settle_failed_attempt(&h.ctx, &first, "worker crashed")
            .await
            .unwrap();
        assert_eq!(settled, Settlement::Retrying);

        let second = h
            .queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.submission_id, first.submission_id);
        assert_eq!(second.attempt, 2);

        let settled = settle_failed_attempt(&h.ctx, &second, "worker crashed")
            .await
            .unwrap();
        assert_eq!(settled, Settlement::Failed);

        let stored = h.store.get(first.submission_id).await.unwrap();
        assert_eq!(stored.status, SubmissionStatus::Error);
        assert_eq!(
            stored.error.as_deref(),
            Some("execution infrastructure failure: worker crashed")
        );
        assert!(h.queue.in_flight().await.unwrap().is_empty());
        assert_eq!(h.queue.pending_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_overwrite() {
        let h = harness(vec![stdout("1"), stdout("2")]).await;
        let stale = submit(&h, "sum").await;
        h.store.mark_running(stale.submission_id, &stale).await.unwrap();
        h.queue.release(&stale).await.unwrap();
        let fresh = h
            .queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        let outcome = judge(&h.ctx, &fresh).await.unwrap();
        assert!(matches!(outcome, JudgeOutcome::Judged(_)));

        let late = h
            .store
            .update_terminal(stale.submission_id, stale.token, &Verdict::error("late"))
            .await;
        assert!(matches!(late, Err(StoreError::AlreadyTerminal(_))));
    }
}
