//! Durable job queue backed by Redis.
//!
//! Jobs are serialized onto a list and popped by workers; two bookkeeping
//! sets track which job ids are pending and which are running so that an
//! abort request can tell whether there is anything left to cancel. The
//! queue survives worker crashes: a job payload stays on the list until a
//! worker pops it, and terminal state transitions are idempotent so
//! at-least-once redelivery after a crash is safe.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

const JOBS_KEY: &str = "deployer:jobs";
const PENDING_KEY: &str = "deployer:jobs:pending";
const RUNNING_KEY: &str = "deployer:jobs:running";
const ABORTED_KEY: &str = "deployer:jobs:aborted";

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    DeployStart {
        deployment_id: String,
    },
    DeployFinalize {
        deployment_id: String,
    },
    DeployFail {
        deployment_id: String,
        reason: String,
    },
    CleanupInactiveDeployments {
        project_id: String,
        remove_containers: bool,
    },
    CleanupProject {
        project_id: String,
    },
    ReaperSweep,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
}

impl Job {
    fn new(kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            kind,
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    redis: ConnectionManager,
}

impl JobQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Push a job and return its id. The id is persisted on the deployment
    /// so a later cancel request can find the job again.
    pub async fn enqueue(&self, kind: JobKind) -> Result<String> {
        let job = Job::new(kind);
        let payload = serde_json::to_string(&job)?;

        let mut redis = self.redis.clone();
        redis::pipe()
            .sadd(PENDING_KEY, &job.id)
            .lpush(JOBS_KEY, payload)
            .query_async::<_, ()>(&mut redis)
            .await?;

        Ok(job.id)
    }

    /// Request cancellation. Returns true iff the job still existed (pending
    /// or running) so the signal can actually reach it.
    pub async fn abort(&self, job_id: &str) -> Result<bool> {
        let mut redis = self.redis.clone();
        let (pending, running): (bool, bool) = redis::pipe()
            .sismember(PENDING_KEY, job_id)
            .sismember(RUNNING_KEY, job_id)
            .query_async(&mut redis)
            .await?;

        if !pending && !running {
            return Ok(false);
        }

        redis.sadd::<_, _, ()>(ABORTED_KEY, job_id).await?;
        Ok(true)
    }

    /// Blocking pop with a timeout; returns `None` when the queue stayed
    /// empty. The popped job is moved from pending to running.
    pub async fn pop(&self, timeout_secs: u64) -> Result<Option<Job>> {
        let mut redis = self.redis.clone();
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(JOBS_KEY)
            .arg(timeout_secs)
            .query_async(&mut redis)
            .await?;

        let Some((_, payload)) = popped else {
            return Ok(None);
        };
        let job: Job = serde_json::from_str(&payload)?;

        redis::pipe()
            .srem(PENDING_KEY, &job.id)
            .sadd(RUNNING_KEY, &job.id)
            .query_async::<_, ()>(&mut redis)
            .await?;

        Ok(Some(job))
    }

    pub async fn is_aborted(&self, job_id: &str) -> Result<bool> {
        let mut redis = self.redis.clone();
        Ok(redis.sismember(ABORTED_KEY, job_id).await?)
    }

    /// Drop all bookkeeping for a job once its handler (or its unwind path)
    /// has finished.
    pub async fn finish(&self, job_id: &str) -> Result<()> {
        let mut redis = self.redis.clone();
        redis::pipe()
            .srem(RUNNING_KEY, job_id)
            .srem(ABORTED_KEY, job_id)
            .query_async::<_, ()>(&mut redis)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_round_trip_through_their_wire_format() {
        let job = Job::new(JobKind::DeployFail {
            deployment_id: "d1".into(),
            reason: "Container exited with code 1".into(),
        });

        let payload = serde_json::to_string(&job).unwrap();
        assert!(payload.contains("\"kind\":\"deploy_fail\""));
        assert_eq!(serde_json::from_str::<Job>(&payload).unwrap(), job);
    }

    #[test]
    fn job_ids_are_random_hex() {
        let a = Job::new(JobKind::ReaperSweep);
        let b = Job::new(JobKind::ReaperSweep);
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 32);
        assert!(a.id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
