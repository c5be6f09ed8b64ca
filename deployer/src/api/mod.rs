pub mod sse;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use runway_common::deployment::{Commit, Conclusion, Status, Trigger};
use runway_common::project::{InstallationStatus, RepoStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument};

use crate::deployment;
use crate::error::{Error, ErrorKind, Result};
use crate::github::{self, verify_webhook_signature};
use crate::persistence::{Deployment, Project};
use crate::Deployer;

pub fn make_router(deployer: Arc<Deployer>) -> Router {
    Router::new()
        .route("/projects/:project_id/deployments", post(create_deployment))
        .route(
            "/projects/:project_id/deployments/:deployment_id/cancel",
            post(cancel_deployment),
        )
        .route(
            "/projects/:project_id/environments/:environment_id/rollback",
            post(rollback_environment),
        )
        .route("/projects/:project_id", axum::routing::delete(delete_project))
        .route(
            "/projects/:project_id/deployments/:deployment_id/events",
            get(sse::deployment_events),
        )
        .route("/projects/:project_id/events", get(sse::project_events))
        .route("/hooks/github", post(github_webhook))
        .layer(Extension(deployer))
}

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub branch: String,
    pub sha: String,
}

#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    pub id: String,
    pub project_id: String,
    pub environment_id: String,
    pub branch: String,
    pub status: Status,
    pub conclusion: Option<Conclusion>,
    pub trigger: Trigger,
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub concluded_at: Option<DateTime<Utc>>,
}

impl From<&Deployment> for DeploymentResponse {
    fn from(deployment: &Deployment) -> Self {
        Self {
            id: deployment.id.clone(),
            project_id: deployment.project_id.clone(),
            environment_id: deployment.environment_id.clone(),
            branch: deployment.branch.clone(),
            status: deployment.status,
            conclusion: deployment.conclusion,
            trigger: deployment.trigger,
            job_id: deployment.job_id.clone(),
            created_at: deployment.created_at,
            concluded_at: deployment.concluded_at,
        }
    }
}

async fn load_project(deployer: &Deployer, project_id: &str) -> Result<Project> {
    deployer
        .persistence
        .project(project_id)
        .await?
        .ok_or_else(|| ErrorKind::ProjectNotFound.into())
}

async fn load_deployment(
    deployer: &Deployer,
    project_id: &str,
    deployment_id: &str,
) -> Result<Deployment> {
    deployer
        .persistence
        .deployment(deployment_id)
        .await?
        .filter(|deployment| deployment.project_id == project_id)
        .ok_or_else(|| ErrorKind::DeploymentNotFound.into())
}

#[instrument(skip_all, fields(%project_id))]
async fn create_deployment(
    Extension(deployer): Extension<Arc<Deployer>>,
    Path(project_id): Path<String>,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<Json<DeploymentResponse>> {
    let project = load_project(&deployer, &project_id).await?;

    let token = github::fresh_installation_token(
        &deployer.persistence,
        &deployer.github,
        &deployer.secrets,
        project.installation_id,
    )
    .await?;
    let commit = deployer
        .github
        .get_repository_commit(&token, project.repo_id, &request.sha)
        .await?;

    let deployment =
        deployment::create(&deployer, &project, &request.branch, commit, Trigger::Api).await?;

    Ok(Json(DeploymentResponse::from(&deployment)))
}

#[instrument(skip_all, fields(%project_id, %deployment_id))]
async fn cancel_deployment(
    Extension(deployer): Extension<Arc<Deployer>>,
    Path((project_id, deployment_id)): Path<(String, String)>,
) -> Result<Json<DeploymentResponse>> {
    let deployment = load_deployment(&deployer, &project_id, &deployment_id).await?;

    deployment::cancel(&deployer, &deployment).await?;

    let deployment = load_deployment(&deployer, &project_id, &deployment_id).await?;
    Ok(Json(DeploymentResponse::from(&deployment)))
}

#[derive(Debug, Serialize)]
pub struct RollbackResponse {
    pub subdomain: String,
    pub deployment_id: String,
    pub previous_deployment_id: Option<String>,
}

#[instrument(skip_all, fields(%project_id, %environment_id))]
async fn rollback_environment(
    Extension(deployer): Extension<Arc<Deployer>>,
    Path((project_id, environment_id)): Path<(String, String)>,
) -> Result<Json<RollbackResponse>> {
    let project = load_project(&deployer, &project_id).await?;
    let environment = project
        .environment_by_id(&environment_id)
        .ok_or(ErrorKind::EnvironmentNotFound)?
        .clone();

    let alias = deployment::rollback(&deployer, &project, &environment).await?;

    Ok(Json(RollbackResponse {
        subdomain: alias.subdomain,
        deployment_id: alias.deployment_id,
        previous_deployment_id: alias.previous_deployment_id,
    }))
}

/// Mark a project deleted and enqueue the asynchronous teardown chain:
/// containers, aliases, deployments in batches, routing file, project row.
#[instrument(skip_all, fields(%project_id))]
async fn delete_project(
    Extension(deployer): Extension<Arc<Deployer>>,
    Path(project_id): Path<String>,
) -> Result<StatusCode> {
    let project = load_project(&deployer, &project_id).await?;

    deployer
        .persistence
        .set_project_status(&project.id, runway_common::project::ProjectStatus::Deleted)
        .await?;
    deployer
        .queue
        .enqueue(crate::task::JobKind::CleanupProject {
            project_id: project.id.clone(),
        })
        .await?;

    info!(project_id = %project.id, "project marked deleted, cleanup enqueued");

    Ok(StatusCode::ACCEPTED)
}

/// Webhook receiver for the Git provider. Signature first, everything else
/// second; an unverified payload is rejected without reading it.
async fn github_webhook(
    Extension(deployer): Extension<Arc<Deployer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| Error::custom(ErrorKind::Integrity, "missing signature"))?;

    if !verify_webhook_signature(&deployer.webhook_secret, &body, signature) {
        return Err(Error::custom(ErrorKind::Integrity, "invalid signature"));
    }

    let event = headers
        .get("x-github-event")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let payload: Value = serde_json::from_slice(&body)?;

    info!(%event, "received provider webhook");

    match event.as_str() {
        "installation" => handle_installation(&deployer, &payload).await?,
        "installation_repositories" => handle_installation_repositories(&deployer, &payload).await?,
        "repository" => handle_repository(&deployer, &payload).await?,
        "push" => handle_push(&deployer, &payload).await?,
        _ => {}
    }

    Ok(StatusCode::OK)
}

async fn handle_installation(deployer: &Deployer, payload: &Value) -> Result<()> {
    let action = payload["action"].as_str().unwrap_or_default();
    let Some(installation_id) = payload["installation"]["id"].as_i64() else {
        return Ok(());
    };

    let status = match action {
        "created" | "unsuspended" => InstallationStatus::Active,
        "deleted" => InstallationStatus::Deleted,
        "suspended" => InstallationStatus::Suspended,
        _ => return Ok(()),
    };

    deployer
        .persistence
        .upsert_installation(installation_id, status)
        .await?;
    info!(installation_id, %status, "installation updated");

    Ok(())
}

async fn handle_installation_repositories(deployer: &Deployer, payload: &Value) -> Result<()> {
    let action = payload["action"].as_str().unwrap_or_default();
    let (repos_key, status) = match action {
        "added" => ("repositories_added", RepoStatus::Active),
        "removed" => ("repositories_removed", RepoStatus::Removed),
        _ => return Ok(()),
    };

    let repo_ids: Vec<i64> = payload[repos_key]
        .as_array()
        .map(|repos| {
            repos
                .iter()
                .filter_map(|repo| repo["id"].as_i64())
                .collect()
        })
        .unwrap_or_default();

    deployer
        .persistence
        .set_repo_status_for_repos(&repo_ids, status)
        .await?;
    info!(?repo_ids, %status, "installation repositories updated");

    Ok(())
}

async fn handle_repository(deployer: &Deployer, payload: &Value) -> Result<()> {
    let action = payload["action"].as_str().unwrap_or_default();
    let Some(repo_id) = payload["repository"]["id"].as_i64() else {
        return Ok(());
    };

    match action {
        "deleted" => {
            deployer
                .persistence
                .set_repo_status_for_repos(&[repo_id], RepoStatus::Deleted)
                .await?;
        }
        "transferred" => {
            deployer
                .persistence
                .set_repo_status_for_repos(&[repo_id], RepoStatus::Transferred)
                .await?;
        }
        "renamed" => {
            if let Some(full_name) = payload["repository"]["full_name"].as_str() {
                deployer.persistence.rename_repo(repo_id, full_name).await?;
            }
        }
        _ => {}
    }

    Ok(())
}

/// A push triggers one deployment per active project bound to the
/// repository. Per-project failures are logged and skipped so one broken
/// project cannot starve the rest.
async fn handle_push(deployer: &Deployer, payload: &Value) -> Result<()> {
    let Some(repo_id) = payload["repository"]["id"].as_i64() else {
        return Ok(());
    };

    let projects = deployer.persistence.active_projects_for_repo(repo_id).await?;
    if projects.is_empty() {
        info!(repo_id, "no projects for pushed repository");
        return Ok(());
    }

    // Only branch pushes deploy; tag pushes and branch deletions do not.
    let Some(branch) = payload["ref"]
        .as_str()
        .and_then(|r| r.strip_prefix("refs/heads/"))
    else {
        return Ok(());
    };
    let head_commit = &payload["head_commit"];
    if head_commit.is_null() {
        return Ok(());
    }

    let commit = Commit {
        sha: payload["after"].as_str().unwrap_or_default().to_string(),
        message: head_commit["message"].as_str().unwrap_or_default().to_string(),
        author: payload["pusher"]["name"].as_str().unwrap_or_default().to_string(),
        date: head_commit["timestamp"]
            .as_str()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
    };

    for project in projects {
        match deployment::create(deployer, &project, branch, commit.clone(), Trigger::Webhook).await
        {
            Ok(deployment) => {
                info!(
                    deployment_id = %deployment.id,
                    project_id = %project.id,
                    sha = %commit.sha,
                    "deployment created for push"
                );
            }
            Err(error) => {
                error!(
                    error = %error,
                    project_id = %project.id,
                    "could not create deployment for push, continuing"
                );
            }
        }
    }

    Ok(())
}
