//! Alias subdomain conventions.
//!
//! Every successful deployment publishes up to three hostname labels below
//! the deploy domain: the environment alias (the bare project slug for
//! production), a stable environment-id alias, and a branch alias.

use crate::project::{Environment, PRODUCTION_ENV_ID};
use crate::MAX_SUBDOMAIN_LEN;

/// A usable hostname label: non-empty, within the DNS length limit, and not
/// edge-cased on a dash.
pub fn is_valid_subdomain(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_SUBDOMAIN_LEN
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Replace everything outside `[a-zA-Z0-9-]` with `-` and lowercase, so a
/// branch name becomes a valid hostname label fragment.
pub fn sanitize_branch(branch: &str) -> String {
    branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// `slug` for production, `slug-env-<env-slug>` otherwise.
pub fn environment_subdomain(project_slug: &str, environment: &Environment) -> String {
    if environment.id == PRODUCTION_ENV_ID {
        project_slug.to_string()
    } else {
        format!("{project_slug}-env-{}", environment.slug)
    }
}

/// Stable alias keyed on the immutable environment id, so custom domains
/// survive environment renames.
pub fn environment_id_subdomain(project_slug: &str, environment_id: &str) -> String {
    format!("{project_slug}-env-id-{environment_id}")
}

pub fn branch_subdomain(project_slug: &str, branch: &str) -> String {
    format!("{project_slug}-branch-{}", sanitize_branch(branch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::EnvironmentStatus;

    fn environment(id: &str, slug: &str) -> Environment {
        Environment {
            id: id.into(),
            slug: slug.into(),
            name: slug.into(),
            color: String::new(),
            branch: "main".into(),
            status: EnvironmentStatus::Active,
        }
    }

    #[test]
    fn sanitize_lowercases_and_replaces() {
        assert_eq!(sanitize_branch("feature/JIRA-42_Foo"), "feature-jira-42-foo");
        assert_eq!(sanitize_branch("main"), "main");
    }

    #[test]
    fn validation_enforces_the_dns_label_shape() {
        assert!(is_valid_subdomain("blog-env-staging"));
        assert!(!is_valid_subdomain(""));
        assert!(!is_valid_subdomain(&"a".repeat(64)));
        assert!(!is_valid_subdomain("-leading"));
        assert!(!is_valid_subdomain("Upper"));
    }

    #[test]
    fn production_alias_is_bare_slug() {
        let env = environment(PRODUCTION_ENV_ID, "production");
        assert_eq!(environment_subdomain("blog", &env), "blog");
        assert_eq!(
            environment_id_subdomain("blog", PRODUCTION_ENV_ID),
            "blog-env-id-prod"
        );
    }

    #[test]
    fn non_production_aliases_carry_the_env_slug() {
        let env = environment("a1b2c3d4", "staging");
        assert_eq!(environment_subdomain("blog", &env), "blog-env-staging");
        assert_eq!(branch_subdomain("blog", "release/1.2"), "blog-branch-release-1-2");
    }
}
