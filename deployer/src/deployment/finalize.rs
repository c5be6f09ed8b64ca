//! Terminal worker transitions: publish a ready deployment, or clean up a
//! failed one. Both are idempotent; the first writer of the terminal state
//! wins and later runs are no-ops.

use runway_common::deployment::{Conclusion, ContainerStatus};
use runway_common::domain::AliasType;
use runway_common::subdomain::{branch_subdomain, environment_id_subdomain, environment_subdomain};
use tracing::{debug, error, info, instrument, warn};

use crate::bus::Event;
use crate::docker;
use crate::error::{ErrorKind, Result};
use crate::task::JobKind;
use crate::Deployer;

#[instrument(skip(deployer))]
pub async fn deploy_finalize(deployer: &Deployer, deployment_id: &str) -> Result<()> {
    let deployment = deployer
        .persistence
        .deployment(deployment_id)
        .await?
        .ok_or(ErrorKind::DeploymentNotFound)?;
    let project = deployer
        .persistence
        .project(&deployment.project_id)
        .await?
        .ok_or(ErrorKind::ProjectNotFound)?;

    let first = deployer
        .persistence
        .conclude_deployment(deployment_id, Conclusion::Succeeded, None)
        .await?;
    if !first {
        debug!("deployment already settled, finalize is a no-op");
        return Ok(());
    }
    deployer.persistence.touch_project(&project.id).await?;

    // Drop a success line into the container's own output so it lands in
    // the aggregated deployment logs.
    if let Some(container_id) = &deployment.container_id {
        let url = format!(
            "{}://{}.{}",
            deployer.args.url_scheme,
            deployment.slug(&project.slug),
            deployer.args.deploy_domain
        );
        if let Err(error) = docker::log_to_container(
            &deployer.docker,
            container_id,
            &format!("Success: Deployment is available at {url}"),
            false,
        )
        .await
        {
            warn!(error = %error, "could not write success message to container");
        }
    }

    // Branch alias; collisions across branches sanitize to the same label,
    // last writer wins.
    let branch_alias = branch_subdomain(&project.slug, &deployment.branch);
    if let Err(error) = deployer
        .persistence
        .upsert_alias(
            &branch_alias,
            deployment_id,
            AliasType::Branch,
            &deployment.branch,
            None,
        )
        .await
    {
        warn!(error = %error, subdomain = %branch_alias, "could not set up branch alias");
    }

    // Environment aliases. Production owns the bare project slug and also
    // publishes the explicit `-env-<slug>` form; other environments only
    // have the latter.
    match project.environment_by_id(&deployment.environment_id) {
        Some(environment) => {
            let env_alias = environment_subdomain(&project.slug, environment);
            let explicit_alias = format!("{}-env-{}", project.slug, environment.slug);
            let mut subdomains = vec![env_alias];
            if subdomains[0] != explicit_alias {
                subdomains.push(explicit_alias);
            }

            for subdomain in subdomains {
                if let Err(error) = deployer
                    .persistence
                    .upsert_alias(
                        &subdomain,
                        deployment_id,
                        AliasType::Environment,
                        &deployment.environment_id,
                        Some(&deployment.environment_id),
                    )
                    .await
                {
                    error!(error = %error, %subdomain, "could not set up environment alias");
                }
            }
        }
        None => {
            warn!(
                environment_id = %deployment.environment_id,
                "environment no longer on project, skipping environment alias"
            );
        }
    }

    let env_id_alias = environment_id_subdomain(&project.slug, &deployment.environment_id);
    if let Err(error) = deployer
        .persistence
        .upsert_alias(
            &env_id_alias,
            deployment_id,
            AliasType::EnvironmentId,
            &deployment.environment_id,
            Some(&deployment.environment_id),
        )
        .await
    {
        error!(error = %error, subdomain = %env_id_alias, "could not set up environment id alias");
    }

    // Routing failures must not fail a succeeding deployment.
    if let Err(error) = deployer
        .router
        .refresh(&project, &deployer.persistence)
        .await
    {
        error!(error = %error, "could not update router config");
    }

    deployer
        .queue
        .enqueue(JobKind::CleanupInactiveDeployments {
            project_id: project.id.clone(),
            remove_containers: true,
        })
        .await?;

    deployer
        .bus
        .publish_status(&Event::status_update(
            &project.id,
            deployment_id,
            Conclusion::Succeeded,
        ))
        .await?;

    info!("deployment finalized");

    Ok(())
}

#[instrument(skip(deployer))]
pub async fn deploy_fail(deployer: &Deployer, deployment_id: &str, reason: &str) -> Result<()> {
    let deployment = deployer
        .persistence
        .deployment(deployment_id)
        .await?
        .ok_or(ErrorKind::DeploymentNotFound)?;

    if let Some(container_id) = &deployment.container_id {
        if !matches!(
            deployment.container_status,
            Some(ContainerStatus::Removed) | Some(ContainerStatus::Stopped)
        ) {
            let killed = docker::kill_container(&deployer.docker, container_id).await;
            let removed = docker::remove_container(&deployer.docker, container_id, true).await;
            match (killed, removed) {
                (_, Ok(_)) => {
                    deployer
                        .persistence
                        .set_container_status(deployment_id, Some(ContainerStatus::Removed))
                        .await?;
                    info!(%container_id, "cleaned up failed container");
                }
                (_, Err(error)) => {
                    warn!(error = %error, %container_id, "could not clean up container");
                }
            }
        }
    }

    let first = deployer
        .persistence
        .conclude_deployment(deployment_id, Conclusion::Failed, Some(reason))
        .await?;
    deployer
        .persistence
        .touch_project(&deployment.project_id)
        .await?;
    if !first {
        debug!("deployment already settled, fail is a no-op");
        return Ok(());
    }

    deployer
        .bus
        .publish_status(&Event::status_update(
            &deployment.project_id,
            deployment_id,
            Conclusion::Failed,
        ))
        .await?;

    error!(%reason, "deployment failed and cleaned up");

    Ok(())
}
