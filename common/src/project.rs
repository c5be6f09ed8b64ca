use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Environment id reserved for the first (production) entry of a project's
/// environment list.
pub const PRODUCTION_ENV_ID: &str = "prod";

/// Environment slug that only production may carry.
pub const RESERVED_ENV_SLUG: &str = "production";

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum ProjectStatus {
    Active,
    Paused,
    Deleted,
}

/// State of the bound repository on the hosting provider side, updated from
/// webhook events.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum RepoStatus {
    Active,
    Deleted,
    Removed,
    Transferred,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum InstallationStatus {
    Active,
    Deleted,
    Suspended,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum EnvironmentStatus {
    Active,
    Deleted,
}

/// One named deployment slot of a project, bound to a branch or a branch
/// glob. Stored as an embedded document on the project; ids are immutable
/// once any deployment references them.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Environment {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub color: String,
    /// Literal branch name or glob (`prefix*`, `*suffix`, `prefix*suffix`).
    pub branch: String,
    pub status: EnvironmentStatus,
}

impl Environment {
    pub fn is_active(&self) -> bool {
        self.status == EnvironmentStatus::Active
    }
}

/// Generate a short opaque environment id. Production always uses
/// [`PRODUCTION_ENV_ID`]; additional environments get a random handle.
pub fn new_environment_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

/// A single environment variable entry as edited by users and snapshotted
/// onto deployments. The list is encrypted at rest; see [`crate::secret`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_ids_are_short_and_lowercase() {
        let id = new_environment_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn environment_document_round_trips() {
        let env = Environment {
            id: PRODUCTION_ENV_ID.into(),
            slug: RESERVED_ENV_SLUG.into(),
            name: "Production".into(),
            color: "green".into(),
            branch: "main".into(),
            status: EnvironmentStatus::Active,
        };
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(serde_json::from_str::<Environment>(&json).unwrap(), env);
    }
}
