use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How a custom hostname is served: proxied to the environment's current
/// deployment, or redirected to the environment alias with a fixed status.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
pub enum DomainType {
    #[serde(rename = "proxy")]
    #[strum(serialize = "proxy")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "proxy"))]
    Proxy,
    #[serde(rename = "301")]
    #[strum(serialize = "301")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "301"))]
    MovedPermanently,
    #[serde(rename = "302")]
    #[strum(serialize = "302")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "302"))]
    Found,
    #[serde(rename = "307")]
    #[strum(serialize = "307")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "307"))]
    TemporaryRedirect,
    #[serde(rename = "308")]
    #[strum(serialize = "308")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "308"))]
    PermanentRedirect,
}

impl DomainType {
    pub fn is_redirect(&self) -> bool {
        !matches!(self, DomainType::Proxy)
    }

    /// Permanent redirects (301/308) are cacheable by clients.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DomainType::MovedPermanently | DomainType::PermanentRedirect)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum DomainStatus {
    Pending,
    Active,
    Failed,
    Disabled,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum AliasType {
    Branch,
    Environment,
    EnvironmentId,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn redirect_types_parse_from_status_codes() {
        assert_eq!(DomainType::from_str("301").unwrap(), DomainType::MovedPermanently);
        assert_eq!(DomainType::from_str("proxy").unwrap(), DomainType::Proxy);
        assert!(DomainType::MovedPermanently.is_permanent());
        assert!(!DomainType::Found.is_permanent());
        assert!(!DomainType::Proxy.is_redirect());
    }

    #[test]
    fn alias_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&AliasType::EnvironmentId).unwrap(),
            "\"environment_id\""
        );
    }
}
