use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Coarse lifecycle phase of a deployment. A deployment is `Completed` once a
/// [`Conclusion`] has been recorded; the row is immutable after that apart
/// from the reaper updating [`ContainerStatus`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum Status {
    Queued,
    InProgress,
    Completed,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum Conclusion {
    Succeeded,
    Failed,
    Canceled,
    Skipped,
}

/// Last known state of the runner container backing a deployment.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum ContainerStatus {
    Running,
    Stopped,
    Removed,
}

/// What caused a deployment to be created.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum Trigger {
    Webhook,
    User,
    Api,
}

/// Build/runtime settings snapshotted from the project onto each deployment
/// at creation time. Later project edits never affect a deployment in flight.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DeployConfig {
    /// Runner image tag; the container uses `runner-<image>`.
    pub image: String,
    #[serde(default)]
    pub root_directory: String,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub pre_deploy_command: Option<String>,
    pub start_command: String,
    /// CPU allowance in cores. Zero means unlimited.
    #[serde(default)]
    pub cpus: f64,
    /// Memory limit in MiB. Zero means unlimited.
    #[serde(default)]
    pub memory_mb: i64,
}

/// Commit metadata recorded on a deployment.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub date: DateTime<Utc>,
}

impl Commit {
    /// Abbreviated sha used in user-facing log lines and hostname labels.
    pub fn short_sha(&self) -> &str {
        &self.sha[..self.sha.len().min(7)]
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn status_round_trips_as_snake_case() {
        assert_eq!(Status::InProgress, Status::from_str("in_progress").unwrap());
        assert_eq!(Status::InProgress.to_string(), "in_progress");
        assert_eq!(
            serde_json::to_string(&Conclusion::Canceled).unwrap(),
            "\"canceled\""
        );
    }

    #[test]
    fn completed_requires_conclusion_values_to_exist() {
        for raw in ["succeeded", "failed", "canceled", "skipped"] {
            assert!(Conclusion::from_str(raw).is_ok(), "missing {raw}");
        }
    }
}
