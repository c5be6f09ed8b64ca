//! Deployment lifecycle: the caller-facing transitions live here, the
//! worker-side transitions in [`run`] and [`finalize`], and the readiness
//! probe loop in [`monitor`].

pub mod finalize;
pub mod monitor;
pub mod run;

use runway_common::deployment::{Commit, Conclusion, Trigger};
use runway_common::environment::environment_for_branch;
use runway_common::project::Environment;
use runway_common::subdomain::environment_subdomain;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::Event;
use crate::error::{Error, ErrorKind, Result};
use crate::persistence::deployment::NewDeployment;
use crate::persistence::{Alias, Deployment, Project};
use crate::task::JobKind;
use crate::Deployer;

/// Resolve the environment, snapshot the project settings, insert the
/// queued row, and hand the start job to the queue. The returned row
/// carries the job id a later cancel request needs.
pub async fn create(
    deployer: &Deployer,
    project: &Project,
    branch: &str,
    commit: Commit,
    trigger: Trigger,
) -> Result<Deployment> {
    let environments = project.active_environments();
    let environment = environment_for_branch(branch, &environments)
        .ok_or_else(|| Error::from_kind(ErrorKind::NoEnvironmentForBranch))?;

    let mut deployment = deployer
        .persistence
        .insert_deployment(NewDeployment {
            id: Uuid::new_v4().simple().to_string(),
            project_id: &project.id,
            environment_id: &environment.id,
            branch,
            commit,
            config: project.config.0.clone(),
            env_vars_ciphertext: project.env_vars_ciphertext(),
            trigger,
        })
        .await?;

    let job_id = deployer
        .queue
        .enqueue(JobKind::DeployStart {
            deployment_id: deployment.id.clone(),
        })
        .await?;
    deployer
        .persistence
        .set_deployment_job_id(&deployment.id, &job_id)
        .await?;
    deployment.job_id = Some(job_id);

    deployer
        .bus
        .publish_update(&Event::creation(&project.id, &deployment.id))
        .await?;

    info!(
        deployment_id = %deployment.id,
        project_id = %project.id,
        environment = %environment.slug,
        %branch,
        "deployment created and queued"
    );

    Ok(deployment)
}

/// Abort the deployment's job. Succeeds only when the signal could still be
/// delivered; a settled deployment is an invalid-state error and nothing
/// changes. The worker's unwind path takes care of a container that was
/// already started.
pub async fn cancel(deployer: &Deployer, deployment: &Deployment) -> Result<()> {
    if deployment.is_settled() {
        return Err(Error::custom(
            ErrorKind::InvalidState,
            "deployment already settled",
        ));
    }

    let job_id = deployment
        .job_id
        .as_deref()
        .ok_or_else(|| Error::custom(ErrorKind::InvalidState, "deployment has no job"))?;

    if !deployer.queue.abort(job_id).await? {
        return Err(Error::custom(
            ErrorKind::InvalidState,
            "job already finished",
        ));
    }

    deployer
        .persistence
        .conclude_deployment(&deployment.id, Conclusion::Canceled, None)
        .await?;

    deployer
        .bus
        .publish_status(&Event::status_update(
            &deployment.project_id,
            &deployment.id,
            Conclusion::Canceled,
        ))
        .await?;

    info!(deployment_id = %deployment.id, "deployment canceled");

    Ok(())
}

/// Swap an environment alias back to its previous deployment and publish
/// the new routing state.
pub async fn rollback(
    deployer: &Deployer,
    project: &Project,
    environment: &Environment,
) -> Result<Alias> {
    let subdomain = environment_subdomain(&project.slug, environment);
    let alias = deployer.persistence.swap_alias(&subdomain).await?;

    if let Err(error) = deployer
        .router
        .refresh(project, &deployer.persistence)
        .await
    {
        warn!(error = %error, project_id = %project.id, "router config refresh failed after rollback");
    }

    deployer
        .bus
        .publish_update(&Event::rollback(
            &project.id,
            &environment.id,
            &alias.deployment_id,
            alias.previous_deployment_id.as_deref(),
        ))
        .await?;

    info!(
        project_id = %project.id,
        environment_id = %environment.id,
        deployment_id = %alias.deployment_id,
        "environment rolled back"
    );

    Ok(alias)
}
