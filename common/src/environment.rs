//! Branch-to-environment resolution.
//!
//! The first environment in a project's list is production and wins exact
//! matches unconditionally. The remaining environments are scanned in list
//! order; the first literal or glob match wins.

use std::collections::HashMap;

use crate::project::Environment;

/// Find the highest-priority environment matching `branch`, if any.
pub fn environment_for_branch<'e>(
    branch: &str,
    environments: &'e [Environment],
) -> Option<&'e Environment> {
    let production = environments.first()?;
    if production.branch == branch {
        return Some(production);
    }

    environments[1..]
        .iter()
        .find(|env| branch_matches(branch, &env.branch))
}

fn branch_matches(branch: &str, pattern: &str) -> bool {
    if pattern == branch {
        return true;
    }
    match pattern.split_once('*') {
        Some(("", suffix)) => branch.ends_with(suffix),
        Some((prefix, "")) => branch.starts_with(prefix),
        Some((prefix, suffix)) => branch.starts_with(prefix) && branch.ends_with(suffix),
        None => false,
    }
}

/// Group `branches` under the slug of their matching environment. Branches
/// that match nothing land under `"unmatched"`.
pub fn group_branches_by_environment(
    branches: &[String],
    environments: &[Environment],
) -> HashMap<String, Vec<String>> {
    let mut groups: HashMap<String, Vec<String>> = environments
        .iter()
        .map(|env| (env.slug.clone(), Vec::new()))
        .collect();
    groups.insert("unmatched".to_string(), Vec::new());

    for branch in branches {
        let slug = environment_for_branch(branch, environments)
            .map(|env| env.slug.as_str())
            .unwrap_or("unmatched");
        groups
            .entry(slug.to_string())
            .or_default()
            .push(branch.clone());
    }

    groups
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::project::{EnvironmentStatus, PRODUCTION_ENV_ID, RESERVED_ENV_SLUG};

    fn env(id: &str, slug: &str, branch: &str) -> Environment {
        Environment {
            id: id.into(),
            slug: slug.into(),
            name: slug.into(),
            color: String::new(),
            branch: branch.into(),
            status: EnvironmentStatus::Active,
        }
    }

    fn fixture() -> Vec<Environment> {
        vec![
            env(PRODUCTION_ENV_ID, RESERVED_ENV_SLUG, "main"),
            env("a1b2c3d4", "staging", "release/*"),
            env("e5f6a7b8", "preview", "feat-*"),
        ]
    }

    #[test]
    fn production_wins_exact_matches() {
        let envs = fixture();
        assert_eq!(
            environment_for_branch("main", &envs).map(|e| e.id.as_str()),
            Some(PRODUCTION_ENV_ID)
        );
    }

    #[test]
    fn globs_match_prefix_suffix_and_both() {
        let envs = vec![
            env(PRODUCTION_ENV_ID, RESERVED_ENV_SLUG, "main"),
            env("x", "suffix", "*-hotfix"),
            env("y", "both", "release/*-rc"),
        ];
        assert_eq!(
            environment_for_branch("v2-hotfix", &envs).map(|e| e.slug.as_str()),
            Some("suffix")
        );
        assert_eq!(
            environment_for_branch("release/1.9-rc", &envs).map(|e| e.slug.as_str()),
            Some("both")
        );
        assert_eq!(environment_for_branch("release/1.9", &envs), None);
    }

    #[test]
    fn earlier_environments_win_ties() {
        let envs = vec![
            env(PRODUCTION_ENV_ID, RESERVED_ENV_SLUG, "main"),
            env("x", "first", "feat-*"),
            env("y", "second", "feat-*"),
        ];
        assert_eq!(
            environment_for_branch("feat-login", &envs).map(|e| e.slug.as_str()),
            Some("first")
        );
    }

    #[test]
    fn matcher_is_pure() {
        let envs = fixture();
        assert_eq!(
            environment_for_branch("release/1.2", &envs),
            environment_for_branch("release/1.2", &envs)
        );
    }

    #[test]
    fn grouping_matches_per_branch_resolution() {
        let envs = fixture();
        let branches: Vec<String> = ["main", "release/1.2", "feat-x", "random"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let groups = group_branches_by_environment(&branches, &envs);

        assert_eq!(groups["production"], vec!["main"]);
        assert_eq!(groups["staging"], vec!["release/1.2"]);
        assert_eq!(groups["preview"], vec!["feat-x"]);
        assert_eq!(groups["unmatched"], vec!["random"]);
    }
}
