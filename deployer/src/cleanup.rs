//! Background sweeps: stop and remove containers no deployment alias
//! references anymore, and tear down everything a deleted project owned.
//!
//! Per-container failures are logged and skipped; a broken container must
//! never block the rest of the batch or later deployments.

use runway_common::deployment::ContainerStatus;
use runway_common::project::ProjectStatus;
use tracing::{debug, error, info, instrument, warn};

use crate::docker;
use crate::error::{Error, ErrorKind, Result};
use crate::Deployer;

pub const CLEANUP_BATCH_SIZE: i64 = 100;

/// Stop (and by default remove) containers of completed deployments that
/// fell out of the alias-protected set after a redeploy or rollback.
#[instrument(skip(deployer))]
pub async fn cleanup_inactive_deployments(
    deployer: &Deployer,
    project_id: &str,
    remove_containers: bool,
) -> Result<()> {
    let Some(project) = deployer.persistence.project(project_id).await? else {
        warn!("project not found, skipping inactive cleanup");
        return Ok(());
    };
    if project.status == ProjectStatus::Deleted {
        info!("project deleted, skipping inactive cleanup");
        return Ok(());
    }

    let protected = deployer.persistence.active_deployment_ids(project_id).await?;
    debug!(?protected, "active deployments");

    let inactive = deployer
        .persistence
        .inactive_running_deployments(project_id, &protected)
        .await?;

    let mut stopped = 0;
    let mut removed = 0;

    for deployment in inactive {
        let Some(container_id) = deployment.container_id.as_deref() else {
            continue;
        };

        match docker::stop_container(&deployer.docker, container_id).await {
            Ok(true) => {
                deployer
                    .persistence
                    .set_container_status(&deployment.id, Some(ContainerStatus::Stopped))
                    .await?;
                stopped += 1;

                if remove_containers {
                    match docker::remove_container(&deployer.docker, container_id, false).await {
                        Ok(true) => {
                            deployer
                                .persistence
                                .set_container_status(
                                    &deployment.id,
                                    Some(ContainerStatus::Removed),
                                )
                                .await?;
                            removed += 1;
                        }
                        Ok(false) => {
                            deployer
                                .persistence
                                .set_container_status(&deployment.id, None)
                                .await?;
                        }
                        Err(error) => {
                            error!(error = %error, %container_id, "could not remove container");
                        }
                    }
                }
            }
            Ok(false) => {
                warn!(%container_id, "container not found");
                deployer
                    .persistence
                    .set_container_status(&deployment.id, None)
                    .await?;
            }
            Err(error) => {
                error!(error = %error, %container_id, "could not stop container");
            }
        }
    }

    info!(stopped, removed, "inactive deployment sweep finished");

    Ok(())
}

/// Tear down a deleted project: containers, aliases, and deployments in
/// batches, then the routing file, then the project row itself.
#[instrument(skip(deployer))]
pub async fn cleanup_project(deployer: &Deployer, project_id: &str, batch_size: i64) -> Result<()> {
    let project = deployer
        .persistence
        .project(project_id)
        .await?
        .ok_or(ErrorKind::ProjectNotFound)?;
    if project.status != ProjectStatus::Deleted {
        return Err(Error::custom(
            ErrorKind::InvalidState,
            "project is not marked as deleted",
        ));
    }

    let mut total_deployments = 0;
    let mut total_aliases = 0;
    let mut total_containers = 0;

    loop {
        let batch = deployer
            .persistence
            .deployments_batch(project_id, batch_size)
            .await?;
        if batch.is_empty() {
            break;
        }

        for deployment in &batch {
            let Some(container_id) = deployment.container_id.as_deref() else {
                continue;
            };
            match docker::remove_container(&deployer.docker, container_id, true).await {
                Ok(true) => total_containers += 1,
                Ok(false) => warn!(%container_id, "container not found"),
                Err(error) => {
                    error!(error = %error, %container_id, "could not remove container");
                }
            }
        }

        let ids: Vec<String> = batch.iter().map(|deployment| deployment.id.clone()).collect();
        total_aliases += deployer
            .persistence
            .delete_aliases_for_deployments(&ids)
            .await?;
        total_deployments += deployer.persistence.delete_deployments(&ids).await?;

        info!(batch = ids.len(), "processed deployment batch");
    }

    deployer.router.remove(project_id).await?;
    deployer.persistence.delete_project(project_id).await?;

    info!(
        total_deployments,
        total_aliases, total_containers, "project cleanup finished"
    );

    Ok(())
}

/// The periodic sweep: run the inactive cleanup for every live project and
/// drop routing files of projects with nothing routable left.
pub async fn reaper_sweep(deployer: &Deployer) -> Result<()> {
    for project in deployer.persistence.projects().await? {
        if project.status == ProjectStatus::Deleted {
            continue;
        }

        if let Err(error) = cleanup_inactive_deployments(deployer, &project.id, true).await {
            error!(error = %error, project_id = %project.id, "inactive cleanup failed, continuing");
            continue;
        }

        match deployer.persistence.has_routable_resources(&project.id).await {
            Ok(false) => {
                if let Err(error) = deployer.router.remove(&project.id).await {
                    error!(error = %error, project_id = %project.id, "could not remove stale router config");
                }
            }
            Ok(true) => {}
            Err(error) => {
                error!(error = %error, project_id = %project.id, "could not check routable resources");
            }
        }
    }

    Ok(())
}
