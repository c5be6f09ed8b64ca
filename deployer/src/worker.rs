//! The worker pool: pops durable jobs off the queue and drives them to an
//! outcome. Every job runs under the job timeout and an abort watch;
//! whatever happens, terminal deployment transitions stay idempotent, so a
//! job redelivered after a crash cannot corrupt state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::cleanup;
use crate::deployment::{finalize, run};
use crate::error::{Error, Result};
use crate::task::{Job, JobKind};
use crate::Deployer;

const POP_TIMEOUT_SECS: u64 = 5;
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct Worker {
    deployer: Arc<Deployer>,
}

impl Worker {
    pub fn new(deployer: Arc<Deployer>) -> Self {
        Self { deployer }
    }

    /// Start `max_jobs` concurrent job loops plus the periodic scheduler.
    /// Resolves only if every loop ends, which they do not.
    pub async fn start(self) {
        info!(max_jobs = self.deployer.args.max_jobs, "worker started");

        let mut handles = Vec::new();
        for _ in 0..self.deployer.args.max_jobs {
            let deployer = self.deployer.clone();
            handles.push(tokio::spawn(work_loop(deployer)));
        }
        handles.push(tokio::spawn(schedule_sweeps(self.deployer.clone())));

        for handle in handles {
            if let Err(error) = handle.await {
                error!(error = %error, "worker loop panicked");
            }
        }
    }
}

async fn work_loop(deployer: Arc<Deployer>) {
    loop {
        match deployer.queue.pop(POP_TIMEOUT_SECS).await {
            Ok(Some(job)) => dispatch(&deployer, job).await,
            Ok(None) => {}
            Err(error) => {
                error!(error = %error, "could not pop from the job queue");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

enum Outcome {
    Done,
    Failed(Error),
    TimedOut,
    Aborted,
}

async fn dispatch(deployer: &Deployer, job: Job) {
    debug!(job_id = %job.id, kind = ?job.kind, "job picked up");

    // Aborted while still queued: the canceller already settled the row,
    // nothing to run.
    match deployer.queue.is_aborted(&job.id).await {
        Ok(true) => {
            debug!(job_id = %job.id, "job aborted before start");
            finish(deployer, &job).await;
            return;
        }
        Ok(false) => {}
        Err(error) => warn!(error = %error, "could not check abort state"),
    }

    let job_timeout = Duration::from_secs(deployer.args.job_timeout);
    let outcome = tokio::select! {
        result = timeout(job_timeout, run_job(deployer, &job.kind)) => match result {
            Ok(Ok(())) => Outcome::Done,
            Ok(Err(error)) => Outcome::Failed(error),
            Err(_) => Outcome::TimedOut,
        },
        _ = abort_requested(deployer, &job.id) => Outcome::Aborted,
    };

    match outcome {
        Outcome::Done => {}
        Outcome::Failed(error) => on_failure(deployer, &job, &error.to_string()).await,
        Outcome::TimedOut => {
            warn!(job_id = %job.id, "job hit the job timeout");
            on_failure(deployer, &job, "timeout").await;
        }
        Outcome::Aborted => {
            info!(job_id = %job.id, "job aborted");
            if let JobKind::DeployStart { deployment_id } = &job.kind {
                run::cancel_cleanup(deployer, deployment_id).await;
            }
        }
    }

    finish(deployer, &job).await;
}

/// The failure edge per job kind: a failed or timed-out start escalates to
/// a deploy-fail job; everything else only logs, a retry would not help.
async fn on_failure(deployer: &Deployer, job: &Job, reason: &str) {
    match &job.kind {
        JobKind::DeployStart { deployment_id } => {
            info!(job_id = %job.id, %reason, "deployment startup failed");
            if let Err(error) = deployer
                .queue
                .enqueue(JobKind::DeployFail {
                    deployment_id: deployment_id.clone(),
                    reason: reason.to_string(),
                })
                .await
            {
                error!(error = %error, deployment_id, "could not enqueue failure job");
            }
        }
        kind => {
            error!(job_id = %job.id, ?kind, %reason, "job failed");
        }
    }
}

async fn finish(deployer: &Deployer, job: &Job) {
    if let Err(error) = deployer.queue.finish(&job.id).await {
        warn!(error = %error, job_id = %job.id, "could not clear job bookkeeping");
    }
}

/// Resolves once an abort has been requested for the job. Polling keeps the
/// signal cross-process; the worker owning the job may not be the process
/// that received the cancel request.
async fn abort_requested(deployer: &Deployer, job_id: &str) {
    loop {
        sleep(ABORT_POLL_INTERVAL).await;
        if matches!(deployer.queue.is_aborted(job_id).await, Ok(true)) {
            return;
        }
    }
}

async fn run_job(deployer: &Deployer, kind: &JobKind) -> Result<()> {
    match kind {
        JobKind::DeployStart { deployment_id } => run::deploy_start(deployer, deployment_id).await,
        JobKind::DeployFinalize { deployment_id } => {
            finalize::deploy_finalize(deployer, deployment_id).await
        }
        JobKind::DeployFail {
            deployment_id,
            reason,
        } => finalize::deploy_fail(deployer, deployment_id, reason).await,
        JobKind::CleanupInactiveDeployments {
            project_id,
            remove_containers,
        } => cleanup::cleanup_inactive_deployments(deployer, project_id, *remove_containers).await,
        JobKind::CleanupProject { project_id } => {
            cleanup::cleanup_project(deployer, project_id, cleanup::CLEANUP_BATCH_SIZE).await
        }
        JobKind::ReaperSweep => cleanup::reaper_sweep(deployer).await,
    }
}

/// Enqueue the periodic reaper sweep on a fixed interval.
async fn schedule_sweeps(deployer: Arc<Deployer>) {
    let interval = Duration::from_secs(deployer.args.reaper_interval);
    loop {
        sleep(interval).await;
        match deployer.queue.enqueue(JobKind::ReaperSweep).await {
            Ok(job_id) => debug!(%job_id, "reaper sweep enqueued"),
            Err(error) => error!(error = %error, "could not enqueue reaper sweep"),
        }
    }
}
