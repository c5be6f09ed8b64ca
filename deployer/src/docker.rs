//! Thin helpers over the container daemon shared by the worker, the
//! monitor, and the reaper.

use std::future::Future;
use std::time::Duration;

use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use tokio::time::sleep;

use crate::error::{Error, ErrorKind, Result};

const DOCKER_TIMEOUT_SECS: u64 = 120;
const TRANSIENT_RETRIES: u32 = 3;

pub fn connect(docker_host: &str) -> Result<Docker> {
    let docker = if docker_host.starts_with("unix://") {
        Docker::connect_with_unix(docker_host, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
    } else {
        Docker::connect_with_http(docker_host, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
    };

    docker.map_err(|err| Error::source(ErrorKind::Internal, err))
}

pub fn is_not_found(error: &DockerError) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Retry an operation over a flaky backend a few times before letting the
/// error escalate to a runtime failure.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < TRANSIENT_RETRIES => {
                attempt += 1;
                sleep(Duration::from_millis(250 * u64::from(attempt))).await;
            }
            Err(err) if err.is_transient() => {
                return Err(Error::custom(
                    ErrorKind::RuntimeFailed,
                    format!("transient failure persisted after {TRANSIENT_RETRIES} retries: {err}"),
                ))
            }
            other => return other,
        }
    }
}

/// Create a container under `name`, replacing any stale container holding
/// that name from an earlier attempt.
pub async fn create_or_replace_container(
    docker: &Docker,
    name: &str,
    config: Config<String>,
) -> Result<String> {
    let options = CreateContainerOptions {
        name: name.to_string(),
        platform: None,
    };

    match docker
        .create_container(Some(options.clone()), config.clone())
        .await
    {
        Ok(response) => Ok(response.id),
        Err(DockerError::DockerResponseServerError {
            status_code: 409, ..
        }) => {
            remove_container(docker, name, true).await?;
            let response = docker.create_container(Some(options), config).await?;
            Ok(response.id)
        }
        Err(err) => Err(err.into()),
    }
}

/// Kill a running container, tolerating containers that already exited.
pub async fn kill_container(docker: &Docker, container_id: &str) -> Result<bool> {
    match docker
        .kill_container::<String>(container_id, None)
        .await
    {
        Ok(()) => Ok(true),
        Err(err) if is_not_found(&err) => Ok(false),
        // Killing a container that is not running returns a conflict.
        Err(DockerError::DockerResponseServerError {
            status_code: 409, ..
        }) => Ok(true),
        Err(err) => Err(err.into()),
    }
}

/// Remove a container. Returns false when the daemon no longer knows it.
pub async fn remove_container(docker: &Docker, container_id: &str, force: bool) -> Result<bool> {
    let options = RemoveContainerOptions {
        force,
        ..Default::default()
    };

    match docker.remove_container(container_id, Some(options)).await {
        Ok(()) => Ok(true),
        Err(err) if is_not_found(&err) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

pub async fn stop_container(docker: &Docker, container_id: &str) -> Result<bool> {
    match docker.stop_container(container_id, None).await {
        Ok(()) => Ok(true),
        Err(err) if is_not_found(&err) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Append a line to the container's own stdout/stderr so it shows up in the
/// aggregated deployment logs with the right labels.
pub async fn log_to_container(
    docker: &Docker,
    container_id: &str,
    message: &str,
    stderr: bool,
) -> Result<()> {
    let fd = if stderr { "2" } else { "1" };
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    format!("echo '{message}' >> /proc/1/fd/{fd}"),
                ]),
                user: Some("appuser".to_string()),
                attach_stdout: Some(false),
                attach_stderr: Some(false),
                ..Default::default()
            },
        )
        .await?;

    docker
        .start_exec(
            &exec.id,
            Some(StartExecOptions {
                detach: true,
                ..Default::default()
            }),
        )
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn transient_errors_are_retried_then_escalated() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::from_kind(ErrorKind::Transient)) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), TRANSIENT_RETRIES + 1);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::RuntimeFailed);
    }

    #[tokio::test]
    async fn non_transient_errors_pass_straight_through() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::from_kind(ErrorKind::InvalidState)) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn success_after_a_hiccup_is_returned() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::from_kind(ErrorKind::Transient))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
    }
}
