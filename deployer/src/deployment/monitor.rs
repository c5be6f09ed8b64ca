//! Readiness probe loop.
//!
//! A single long-lived task sweeps all in-progress deployments every two
//! seconds, inspecting their containers in parallel. Each deployment has at
//! most one in-flight probe; a shared claim set blocks re-entry while a
//! probe is still running. The monitor only ever enqueues transitions, it
//! never writes deployment state itself, so a crashed monitor loses nothing
//! and re-inspects everything on startup.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::InspectContainerOptions;
use bollard::service::ContainerStateStatusEnum;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::docker;
use crate::error::Result;
use crate::persistence::Deployment;
use crate::task::JobKind;
use crate::Deployer;

const SWEEP_INTERVAL: Duration = Duration::from_secs(2);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(deployer: Arc<Deployer>) {
    info!("deployment monitor started");

    let probe_client = reqwest::Client::new();
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::default();

    loop {
        match deployer.persistence.in_progress_deployments().await {
            Ok(deployments) => {
                // Expire claims left behind by deployments that settled
                // while their probe task was cut short.
                {
                    let current: HashSet<String> =
                        deployments.iter().map(|d| d.id.clone()).collect();
                    in_flight.lock().await.retain(|id| current.contains(id));
                }

                let mut probes = JoinSet::new();
                for deployment in deployments {
                    if !in_flight.lock().await.insert(deployment.id.clone()) {
                        continue;
                    }

                    let deployer = deployer.clone();
                    let in_flight = in_flight.clone();
                    let probe_client = probe_client.clone();
                    probes.spawn(async move {
                        if let Err(error) =
                            check_deployment(&deployer, &probe_client, &deployment).await
                        {
                            error!(
                                error = %error,
                                deployment_id = %deployment.id,
                                "probe failed, enqueueing failure"
                            );
                            enqueue_fail(&deployer, &deployment.id, &error.to_string()).await;
                        }
                        in_flight.lock().await.remove(&deployment.id);
                    });
                }
                while probes.join_next().await.is_some() {}
            }
            Err(error) => {
                error!(error = %error, "monitor sweep query failed");
            }
        }

        sleep(SWEEP_INTERVAL).await;
    }
}

async fn check_deployment(
    deployer: &Deployer,
    probe_client: &reqwest::Client,
    deployment: &Deployment,
) -> Result<()> {
    let age = (Utc::now() - deployment.created_at)
        .to_std()
        .unwrap_or_default();
    if age > Duration::from_secs(deployer.args.deployment_timeout) {
        warn!(deployment_id = %deployment.id, "deployment timed out, failure job enqueued");
        enqueue_fail(deployer, &deployment.id, "Deployment timeout").await;
        return Ok(());
    }

    // A crash between the row insert and the container start leaves no
    // container behind; the timeout above eventually settles those rows.
    let Some(container_id) = &deployment.container_id else {
        return Ok(());
    };

    let inspection = match deployer
        .docker
        .inspect_container(container_id, None::<InspectContainerOptions>)
        .await
    {
        Ok(inspection) => inspection,
        Err(error) if docker::is_not_found(&error) => {
            enqueue_fail(deployer, &deployment.id, "Container not found").await;
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    };

    let state = inspection.state.as_ref();
    match state.and_then(|state| state.status) {
        Some(ContainerStateStatusEnum::EXITED) => {
            let exit_code = state.and_then(|state| state.exit_code).unwrap_or(-1);
            let reason = format!("Container exited with code {exit_code}");
            warn!(deployment_id = %deployment.id, %reason, "failure job enqueued");
            enqueue_fail(deployer, &deployment.id, &reason).await;
        }
        Some(ContainerStateStatusEnum::RUNNING) => {
            let ip = inspection
                .network_settings
                .as_ref()
                .and_then(|settings| settings.networks.as_ref())
                .and_then(|networks| networks.get(&deployer.args.network_name))
                .and_then(|endpoint| endpoint.ip_address.clone())
                .filter(|ip| !ip.is_empty());

            if let Some(ip) = ip {
                if http_probe(probe_client, &ip).await {
                    info!(deployment_id = %deployment.id, "deployment ready, finalize job enqueued");
                    if let Err(error) = deployer
                        .queue
                        .enqueue(JobKind::DeployFinalize {
                            deployment_id: deployment.id.clone(),
                        })
                        .await
                    {
                        error!(error = %error, "could not enqueue finalize job");
                    }
                }
            }
        }
        other => {
            debug!(deployment_id = %deployment.id, state = ?other, "container not probeable yet");
        }
    }

    Ok(())
}

/// Ready means the app answered at all on the runner port without a server
/// error.
async fn http_probe(client: &reqwest::Client, ip: &str) -> bool {
    let url = format!("http://{ip}:{}/", runway_common::RUNNER_PORT);
    match client.get(url).timeout(PROBE_TIMEOUT).send().await {
        Ok(response) => response.status().as_u16() < 500,
        Err(_) => false,
    }
}

async fn enqueue_fail(deployer: &Deployer, deployment_id: &str, reason: &str) {
    if let Err(error) = deployer
        .queue
        .enqueue(JobKind::DeployFail {
            deployment_id: deployment_id.to_string(),
            reason: reason.to_string(),
        })
        .await
    {
        error!(error = %error, deployment_id, "could not enqueue failure job");
    }
}
