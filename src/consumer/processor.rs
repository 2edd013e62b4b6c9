/// Processing of a single claimed job
///
/// acquire slot → load flow version → check out sandbox → run steps →
/// check sandbox in → release slot → ack / nack / defer / dead-letter.
/// Every path ends with exactly one queue decision for the job.

use crate::concurrency::ConcurrencyLimiter;
use crate::config::WorkerConfig;
use crate::consumer::stats::ConsumerStats;
use crate::error::{Result, WorkerError};
use crate::flow::{FlowRunOutcome, FlowRunner, FlowStore, RunRecord, RunStatus};
use crate::job::{Job, JobQueue};
use crate::sandbox::{SandboxPool, Verdict};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Attempt ceiling and backoff for retryable failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before redelivering after `attempt` failed: base · 2^(attempt-1)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl From<&WorkerConfig> for RetryPolicy {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }
}

/// Queue decision taken for one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded,
    /// RUNTIME_ERROR verdict; the job is acked
    Failed,
    Requeued { attempt: u32, delay: Duration },
    /// Capacity was exhausted; put back without consuming an attempt
    Deferred,
    DeadLettered { reason: String },
}

/// Stops a heartbeat task when dropped, including when the job task is aborted
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct JobProcessor {
    queue: Arc<dyn JobQueue>,
    limiter: Arc<ConcurrencyLimiter>,
    pool: Arc<SandboxPool>,
    flows: Arc<dyn FlowStore>,
    runner: FlowRunner,
    retry: RetryPolicy,
    stats: Arc<ConsumerStats>,
}

impl JobProcessor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        limiter: Arc<ConcurrencyLimiter>,
        pool: Arc<SandboxPool>,
        flows: Arc<dyn FlowStore>,
        runner: FlowRunner,
        retry: RetryPolicy,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        Self {
            queue,
            limiter,
            pool,
            flows,
            runner,
            retry,
            stats,
        }
    }

    /// Process one job end to end
    pub async fn process(&self, job: Job) -> JobOutcome {
        tracing::info!(
            "📦 Processing job {} (flow run {}, attempt {}/{})",
            job.id,
            job.flow_run_id,
            job.attempt,
            self.retry.max_attempts
        );
        let _claim = self.spawn_claim_heartbeat(&job).map(HeartbeatGuard);
        let result = self.execute(&job).await;
        self.settle(&job, result).await
    }

    /// Keep the queue claim fresh so no other worker picks the job up mid-run
    fn spawn_claim_heartbeat(&self, job: &Job) -> Option<JoinHandle<()>> {
        let visibility = self.queue.visibility_timeout()?;
        let period = (visibility / 3).max(Duration::from_millis(10));
        let queue = Arc::clone(&self.queue);
        let job = job.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match queue.extend_claim(&job).await {
                    Ok(true) => tracing::trace!("💓 Claim on job {} extended", job.id),
                    Ok(false) => {
                        tracing::warn!("⚠️ Lost the claim on job {}", job.id);
                        break;
                    }
                    Err(e) => tracing::warn!("⚠️ Claim heartbeat for job {} failed: {}", job.id, e),
                }
            }
        }))
    }

    /// Slot-guarded part of the pipeline
    async fn execute(&self, job: &Job) -> Result<FlowRunOutcome> {
        let slot = self.limiter.acquire(&job.project_id).await?;
        let heartbeat = HeartbeatGuard(self.limiter.spawn_heartbeat(slot.clone()));

        let result = self.run_in_sandbox(job).await;

        drop(heartbeat);
        if let Err(e) = self.limiter.release(&slot).await {
            tracing::warn!("⚠️ Failed to release slot {} (its lease will expire): {}", slot.id, e);
        }
        result
    }

    async fn run_in_sandbox(&self, job: &Job) -> Result<FlowRunOutcome> {
        let flow_version_id = &job.payload.flow_version_id;
        let flow = self
            .flows
            .get_flow_version(flow_version_id)
            .await?
            .ok_or_else(|| WorkerError::FlowVersionNotFound(flow_version_id.clone()))?;

        // Reject bad graphs before paying for a sandbox
        self.runner.plan(&flow)?;

        let mut sandbox = self.pool.checkout(&flow.piece_set).await?;
        let result = self
            .runner
            .run(&mut sandbox, &flow, &job.payload.trigger_payload)
            .await;

        if result.is_err() || sandbox.running_executions() > 0 {
            self.pool.discard(sandbox).await;
        } else {
            self.pool.checkin(sandbox).await;
        }
        result
    }

    async fn settle(&self, job: &Job, result: Result<FlowRunOutcome>) -> JobOutcome {
        match result {
            Ok(outcome) => {
                self.record(job, RunStatus::from(outcome.verdict), None, &outcome).await;
                match outcome.verdict {
                    Verdict::Ok => {
                        self.ack(job).await;
                        self.stats.record_succeeded();
                        tracing::info!("✅ Job {} succeeded in {:.3}s", job.id, outcome.duration_secs);
                        JobOutcome::Succeeded
                    }
                    Verdict::RuntimeError => {
                        self.ack(job).await;
                        self.stats.record_failed();
                        let step = outcome.failed_step().map(|r| r.step.as_str()).unwrap_or("?");
                        tracing::info!("❌ Job {} failed in step '{}' (RUNTIME_ERROR)", job.id, step);
                        JobOutcome::Failed
                    }
                    Verdict::Timeout => {
                        let step = outcome.failed_step().map(|r| r.step.as_str()).unwrap_or("?");
                        let reason = format!("step '{}' timed out", step);
                        self.retry_or_dead_letter(job, &reason).await
                    }
                }
            }
            Err(WorkerError::CapacityExceeded { project_id, waited }) => {
                tracing::info!(
                    "⏳ Deferring job {}: project '{}' still at capacity after {:?}",
                    job.id,
                    project_id,
                    waited
                );
                if let Err(e) = self.queue.defer(job, self.retry.base_delay).await {
                    tracing::error!("💥 Failed to defer job {}: {}", job.id, e);
                }
                self.stats.record_deferred();
                JobOutcome::Deferred
            }
            Err(e) if e.is_retryable() => {
                self.record_error(job, &e).await;
                self.retry_or_dead_letter(job, &e.to_string()).await
            }
            Err(e) => {
                if e.is_invariant_violation() {
                    tracing::error!("🚨 Invariant violation while processing job {}: {}", job.id, e);
                }
                self.record_error(job, &e).await;
                self.dead_letter(job, &e.to_string()).await
            }
        }
    }

    async fn retry_or_dead_letter(&self, job: &Job, reason: &str) -> JobOutcome {
        if job.is_final_attempt(self.retry.max_attempts) {
            let reason = format!("attempt {}/{} failed: {}", job.attempt, self.retry.max_attempts, reason);
            return self.dead_letter(job, &reason).await;
        }

        let delay = self.retry.delay_for(job.attempt);
        tracing::warn!(
            "🔁 Job {} attempt {}/{} failed, retrying in {:?}: {}",
            job.id,
            job.attempt,
            self.retry.max_attempts,
            delay,
            reason
        );
        if let Err(e) = self.queue.nack(job, reason, delay).await {
            tracing::error!("💥 Failed to requeue job {}: {}", job.id, e);
        }
        self.stats.record_requeued();
        JobOutcome::Requeued {
            attempt: job.attempt + 1,
            delay,
        }
    }

    async fn dead_letter(&self, job: &Job, reason: &str) -> JobOutcome {
        tracing::error!("☠️ Dead-lettering job {} (flow run {}): {}", job.id, job.flow_run_id, reason);
        if let Err(e) = self.queue.dead_letter(job, reason).await {
            tracing::error!("💥 Failed to dead-letter job {}: {}", job.id, e);
        }
        self.stats.record_dead_lettered();
        JobOutcome::DeadLettered {
            reason: reason.to_string(),
        }
    }

    async fn ack(&self, job: &Job) {
        if let Err(e) = self.queue.ack(job).await {
            tracing::error!("💥 Failed to ack job {}: {}", job.id, e);
        }
    }

    async fn record(&self, job: &Job, status: RunStatus, error: Option<String>, outcome: &FlowRunOutcome) {
        let record = RunRecord {
            job_id: job.id,
            flow_run_id: job.flow_run_id.clone(),
            flow_version_id: job.payload.flow_version_id.clone(),
            project_id: job.project_id.clone(),
            attempt: job.attempt,
            status,
            error,
            steps: outcome.steps.clone(),
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.flows.record_run(&record).await {
            tracing::warn!("⚠️ Could not record run of job {}: {}", job.id, e);
        }
    }

    async fn record_error(&self, job: &Job, error: &WorkerError) {
        let empty = FlowRunOutcome {
            flow_version_id: job.payload.flow_version_id.clone(),
            verdict: Verdict::RuntimeError,
            steps: Vec::new(),
            duration_secs: 0.0,
        };
        self.record(job, RunStatus::Errored, Some(error.to_string()), &empty).await;
    }
}
