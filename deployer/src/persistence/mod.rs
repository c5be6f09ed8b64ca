// Handle database interactions.

pub mod alias;
pub mod deployment;

use chrono::{DateTime, Utc};
use runway_common::project::{
    Environment, EnvVar, InstallationStatus, ProjectStatus, RepoStatus,
};
use runway_common::secret::Key;
use runway_common::{deployment::DeployConfig, domain::{DomainStatus, DomainType}};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::types::Json;
use tracing::info;

use crate::error::Result;

pub use alias::Alias;
pub use deployment::Deployment;

#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    pub async fn new(state_uri: &str) -> Result<Self> {
        let options = state_uri
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        Self::from_pool(pool).await
    }

    #[cfg(test)]
    pub async fn new_in_memory() -> Self {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Self::from_pool(pool).await.unwrap()
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                repo_id INTEGER NOT NULL,
                repo_full_name TEXT NOT NULL,
                repo_status TEXT NOT NULL DEFAULT 'active',
                installation_id INTEGER NOT NULL,
                environments TEXT NOT NULL DEFAULT '[]', -- JSON list of environment documents
                env_vars TEXT NOT NULL DEFAULT '',       -- encrypted JSON
                config TEXT NOT NULL DEFAULT '{}',       -- JSON deploy config
                status TEXT NOT NULL DEFAULT 'active',
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS installations (
                installation_id INTEGER PRIMARY KEY,
                token TEXT,                              -- encrypted
                token_expires_at DATETIME,
                status TEXT NOT NULL DEFAULT 'active'
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                environment_id TEXT NOT NULL,
                branch TEXT NOT NULL,
                commit_meta TEXT NOT NULL,               -- JSON {sha, message, author, date}
                config TEXT NOT NULL,                    -- JSON snapshot of the project config
                env_vars TEXT NOT NULL DEFAULT '',       -- encrypted snapshot
                container_id TEXT,
                container_status TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                conclusion TEXT,
                failure_reason TEXT,
                triggered_by TEXT NOT NULL,
                job_id TEXT,
                created_at DATETIME NOT NULL,
                concluded_at DATETIME
            );
            CREATE INDEX IF NOT EXISTS idx_deployments_project ON deployments (project_id);
            CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments (status, container_status);

            CREATE TABLE IF NOT EXISTS aliases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subdomain TEXT NOT NULL UNIQUE,
                deployment_id TEXT NOT NULL,
                previous_deployment_id TEXT,
                alias_type TEXT NOT NULL,
                value TEXT,
                environment_id TEXT,
                updated_at DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_aliases_deployment ON aliases (deployment_id);

            CREATE TABLE IF NOT EXISTS domains (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                hostname TEXT NOT NULL UNIQUE,
                domain_type TEXT NOT NULL,
                environment_id TEXT,
                redirect_to_domain_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
            );
            CREATE INDEX IF NOT EXISTS idx_domains_project ON domains (project_id);
            "#,
        )
        .execute(&pool)
        .await?;

        info!("persistence ready");

        Ok(Self { pool })
    }
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub repo_id: i64,
    pub repo_full_name: String,
    pub repo_status: RepoStatus,
    pub installation_id: i64,
    pub environments: Json<Vec<Environment>>,
    env_vars: String,
    pub config: Json<DeployConfig>,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn active_environments(&self) -> Vec<Environment> {
        self.environments
            .0
            .iter()
            .filter(|env| env.is_active())
            .cloned()
            .collect()
    }

    pub fn environment_by_id(&self, environment_id: &str) -> Option<&Environment> {
        self.environments
            .0
            .iter()
            .find(|env| env.id == environment_id)
    }

    /// Decrypt the environment variables. Only call at the point of use;
    /// the plaintext must not be persisted or logged.
    pub fn env_vars(&self, key: &Key) -> Result<Vec<EnvVar>> {
        Ok(key.open_env_vars(&self.env_vars)?)
    }

    pub fn env_vars_ciphertext(&self) -> &str {
        &self.env_vars
    }
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Installation {
    pub installation_id: i64,
    pub token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub status: InstallationStatus,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Domain {
    pub id: String,
    pub project_id: String,
    pub hostname: String,
    pub domain_type: DomainType,
    pub environment_id: Option<String>,
    pub redirect_to_domain_id: Option<String>,
    pub status: DomainStatus,
}

impl Persistence {
    pub async fn project(&self, project_id: &str) -> Result<Option<Project>> {
        let project = sqlx::query_as("SELECT * FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(project)
    }

    pub async fn projects(&self) -> Result<Vec<Project>> {
        Ok(sqlx::query_as("SELECT * FROM projects")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Active projects bound to a repository, used by push webhooks.
    pub async fn active_projects_for_repo(&self, repo_id: i64) -> Result<Vec<Project>> {
        Ok(
            sqlx::query_as("SELECT * FROM projects WHERE repo_id = ? AND status = 'active'")
                .bind(repo_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn insert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, name, slug, repo_id, repo_full_name, repo_status, installation_id, environments, env_vars, config, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.slug)
        .bind(project.repo_id)
        .bind(&project.repo_full_name)
        .bind(project.repo_status)
        .bind(project.installation_id)
        .bind(&project.environments)
        .bind(&project.env_vars)
        .bind(&project.config)
        .bind(project.status)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_project_status(&self, project_id: &str, status: ProjectStatus) -> Result<()> {
        sqlx::query("UPDATE projects SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(project_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn touch_project(&self, project_id: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(project_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_repo_status_for_repos(
        &self,
        repo_ids: &[i64],
        status: RepoStatus,
    ) -> Result<()> {
        for repo_id in repo_ids {
            sqlx::query("UPDATE projects SET repo_status = ? WHERE repo_id = ?")
                .bind(status)
                .bind(repo_id)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    pub async fn rename_repo(&self, repo_id: i64, repo_full_name: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET repo_full_name = ? WHERE repo_id = ?")
            .bind(repo_full_name)
            .bind(repo_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn installation(&self, installation_id: i64) -> Result<Option<Installation>> {
        Ok(
            sqlx::query_as("SELECT * FROM installations WHERE installation_id = ?")
                .bind(installation_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn upsert_installation(
        &self,
        installation_id: i64,
        status: InstallationStatus,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO installations (installation_id, status) VALUES (?, ?) \
             ON CONFLICT(installation_id) DO UPDATE SET status = excluded.status",
        )
        .bind(installation_id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn store_installation_token(
        &self,
        installation_id: i64,
        token_ciphertext: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO installations (installation_id, token, token_expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(installation_id) DO UPDATE SET token = excluded.token, token_expires_at = excluded.token_expires_at",
        )
        .bind(installation_id)
        .bind(token_ciphertext)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn active_domains(&self, project_id: &str) -> Result<Vec<Domain>> {
        Ok(
            sqlx::query_as("SELECT * FROM domains WHERE project_id = ? AND status = 'active'")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn insert_domain(&self, domain: &Domain) -> Result<()> {
        sqlx::query(
            "INSERT INTO domains (id, project_id, hostname, domain_type, environment_id, redirect_to_domain_id, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&domain.id)
        .bind(&domain.project_id)
        .bind(&domain.hostname)
        .bind(domain.domain_type)
        .bind(&domain.environment_id)
        .bind(&domain.redirect_to_domain_id)
        .bind(domain.status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// True when a project has no routable resource left, meaning its router
    /// config file should not exist.
    pub async fn has_routable_resources(&self, project_id: &str) -> Result<bool> {
        let (aliases,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM aliases a JOIN deployments d ON a.deployment_id = d.id WHERE d.project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;

        let (domains,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM domains WHERE project_id = ?")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(aliases > 0 || domains > 0)
    }
}

/// Builders shared by the persistence and state machine tests.
#[cfg(test)]
pub mod test_helpers {
    use runway_common::project::{EnvironmentStatus, PRODUCTION_ENV_ID, RESERVED_ENV_SLUG};

    use super::*;

    pub fn project(id: &str, slug: &str) -> Project {
        Project {
            id: id.to_string(),
            name: slug.to_string(),
            slug: slug.to_string(),
            repo_id: 4242,
            repo_full_name: format!("acme/{slug}"),
            repo_status: RepoStatus::Active,
            installation_id: 7,
            environments: Json(vec![Environment {
                id: PRODUCTION_ENV_ID.into(),
                slug: RESERVED_ENV_SLUG.into(),
                name: "Production".into(),
                color: "green".into(),
                branch: "main".into(),
                status: EnvironmentStatus::Active,
            }]),
            env_vars: String::new(),
            config: Json(DeployConfig {
                image: "node-20".into(),
                start_command: "npm start".into(),
                ..Default::default()
            }),
            status: ProjectStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
