use std::collections::HashSet;

use chrono::{DateTime, Utc};
use runway_common::deployment::{Commit, Conclusion, ContainerStatus, DeployConfig, Status, Trigger};
use runway_common::project::EnvVar;
use runway_common::secret::Key;
use sqlx::types::Json;

use super::Persistence;
use crate::error::Result;

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Deployment {
    pub id: String,
    pub project_id: String,
    pub environment_id: String,
    pub branch: String,
    pub commit_meta: Json<Commit>,
    pub config: Json<DeployConfig>,
    env_vars: String,
    pub container_id: Option<String>,
    pub container_status: Option<ContainerStatus>,
    pub status: Status,
    pub conclusion: Option<Conclusion>,
    pub failure_reason: Option<String>,
    #[sqlx(rename = "triggered_by")]
    pub trigger: Trigger,
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub concluded_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn commit(&self) -> &Commit {
        &self.commit_meta.0
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config.0
    }

    /// Short id used in the container name and hostname label.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(7)]
    }

    /// Hostname label the edge router serves this specific deployment on.
    pub fn slug(&self, project_slug: &str) -> String {
        format!("{project_slug}-{}", self.short_id())
    }

    pub fn container_name(&self) -> String {
        format!("runner-{}", self.short_id())
    }

    pub fn is_settled(&self) -> bool {
        self.status == Status::Completed
    }

    pub fn env_vars(&self, key: &Key) -> Result<Vec<EnvVar>> {
        Ok(key.open_env_vars(&self.env_vars)?)
    }

    /// In-memory row for unit tests that never touch the database.
    #[cfg(test)]
    pub fn stub(id: &str, project_id: &str, config: DeployConfig, commit: Commit) -> Self {
        Self {
            id: id.to_string(),
            project_id: project_id.to_string(),
            environment_id: "prod".to_string(),
            branch: "main".to_string(),
            commit_meta: Json(commit),
            config: Json(config),
            env_vars: String::new(),
            container_id: None,
            container_status: None,
            status: Status::Queued,
            conclusion: None,
            failure_reason: None,
            trigger: Trigger::User,
            job_id: None,
            created_at: Utc::now(),
            concluded_at: None,
        }
    }
}

/// Fields needed to insert a new deployment row; everything else starts at
/// its queued defaults.
pub struct NewDeployment<'a> {
    pub id: String,
    pub project_id: &'a str,
    pub environment_id: &'a str,
    pub branch: &'a str,
    pub commit: Commit,
    pub config: DeployConfig,
    pub env_vars_ciphertext: &'a str,
    pub trigger: Trigger,
}

impl Persistence {
    pub async fn insert_deployment(&self, new: NewDeployment<'_>) -> Result<Deployment> {
        let created_at = Utc::now();

        sqlx::query(
            "INSERT INTO deployments (id, project_id, environment_id, branch, commit_meta, config, env_vars, status, triggered_by, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.id)
        .bind(new.project_id)
        .bind(new.environment_id)
        .bind(new.branch)
        .bind(Json(&new.commit))
        .bind(Json(&new.config))
        .bind(new.env_vars_ciphertext)
        .bind(Status::Queued)
        .bind(new.trigger)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(Deployment {
            id: new.id,
            project_id: new.project_id.to_string(),
            environment_id: new.environment_id.to_string(),
            branch: new.branch.to_string(),
            commit_meta: Json(new.commit),
            config: Json(new.config),
            env_vars: new.env_vars_ciphertext.to_string(),
            container_id: None,
            container_status: None,
            status: Status::Queued,
            conclusion: None,
            failure_reason: None,
            trigger: new.trigger,
            job_id: None,
            created_at,
            concluded_at: None,
        })
    }

    pub async fn deployment(&self, deployment_id: &str) -> Result<Option<Deployment>> {
        Ok(sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
            .bind(deployment_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn set_deployment_job_id(&self, deployment_id: &str, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE deployments SET job_id = ? WHERE id = ?")
            .bind(job_id)
            .bind(deployment_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn mark_deployment_in_progress(&self, deployment_id: &str) -> Result<()> {
        sqlx::query("UPDATE deployments SET status = 'in_progress' WHERE id = ? AND status = 'queued'")
            .bind(deployment_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_deployment_container(
        &self,
        deployment_id: &str,
        container_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE deployments SET container_id = ?, container_status = 'running' WHERE id = ?",
        )
        .bind(container_id)
        .bind(deployment_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Updated by the reaper and the failure path; `None` records that the
    /// container is gone from the daemon entirely.
    pub async fn set_container_status(
        &self,
        deployment_id: &str,
        container_status: Option<ContainerStatus>,
    ) -> Result<()> {
        sqlx::query("UPDATE deployments SET container_status = ? WHERE id = ?")
            .bind(container_status)
            .bind(deployment_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Drive a deployment to its terminal state. Returns false when the row
    /// was already completed, which makes every terminal transition
    /// idempotent: the first writer wins, later ones are no-ops.
    pub async fn conclude_deployment(
        &self,
        deployment_id: &str,
        conclusion: Conclusion,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deployments SET status = 'completed', conclusion = ?, failure_reason = ?, concluded_at = ? \
             WHERE id = ? AND status != 'completed'",
        )
        .bind(conclusion)
        .bind(failure_reason)
        .bind(Utc::now())
        .bind(deployment_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deployments the monitor needs to look at: still in progress, in any
    /// container state (a crash between insert and container start leaves
    /// the container column empty; those time out like everything else).
    pub async fn in_progress_deployments(&self) -> Result<Vec<Deployment>> {
        Ok(
            sqlx::query_as("SELECT * FROM deployments WHERE status = 'in_progress'")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Completed deployments whose containers still run although no alias
    /// references them anymore.
    pub async fn inactive_running_deployments(
        &self,
        project_id: &str,
        protected: &HashSet<String>,
    ) -> Result<Vec<Deployment>> {
        let rows: Vec<Deployment> = sqlx::query_as(
            "SELECT * FROM deployments \
             WHERE project_id = ? AND container_id IS NOT NULL AND container_status = 'running' AND status = 'completed'",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|deployment| !protected.contains(&deployment.id))
            .collect())
    }

    pub async fn deployments_batch(&self, project_id: &str, limit: i64) -> Result<Vec<Deployment>> {
        Ok(
            sqlx::query_as("SELECT * FROM deployments WHERE project_id = ? LIMIT ?")
                .bind(project_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn delete_deployments(&self, deployment_ids: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for id in deployment_ids {
            deleted += sqlx::query("DELETE FROM deployments WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }

        Ok(deleted)
    }
}
