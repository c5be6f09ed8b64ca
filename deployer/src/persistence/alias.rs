use std::collections::HashSet;

use chrono::{DateTime, Utc};
use runway_common::domain::AliasType;
use runway_common::subdomain::is_valid_subdomain;

use super::Persistence;
use crate::error::{Error, ErrorKind, Result};

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Alias {
    pub id: i64,
    pub subdomain: String,
    pub deployment_id: String,
    pub previous_deployment_id: Option<String>,
    pub alias_type: AliasType,
    pub value: Option<String>,
    pub environment_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Persistence {
    /// Point `subdomain` at `deployment_id`, demoting the current holder to
    /// `previous_deployment_id`. Re-pointing an alias at its current target
    /// keeps the previous slot untouched so retries stay idempotent. Atomic
    /// per subdomain.
    pub async fn upsert_alias(
        &self,
        subdomain: &str,
        deployment_id: &str,
        alias_type: AliasType,
        value: &str,
        environment_id: Option<&str>,
    ) -> Result<Alias> {
        if !is_valid_subdomain(subdomain) {
            return Err(Error::custom(
                ErrorKind::ValidationFailed,
                format!("not a usable subdomain: {subdomain}"),
            ));
        }

        sqlx::query(
            "INSERT INTO aliases (subdomain, deployment_id, previous_deployment_id, alias_type, value, environment_id, updated_at) \
             VALUES (?, ?, NULL, ?, ?, ?, ?) \
             ON CONFLICT(subdomain) DO UPDATE SET \
               previous_deployment_id = CASE \
                 WHEN aliases.deployment_id = excluded.deployment_id THEN aliases.previous_deployment_id \
                 ELSE aliases.deployment_id END, \
               deployment_id = excluded.deployment_id, \
               alias_type = excluded.alias_type, \
               value = excluded.value, \
               environment_id = excluded.environment_id, \
               updated_at = excluded.updated_at",
        )
        .bind(subdomain)
        .bind(deployment_id)
        .bind(alias_type)
        .bind(value)
        .bind(environment_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.alias_by_subdomain(subdomain)
            .await?
            .ok_or_else(|| ErrorKind::AliasNotFound.into())
    }

    /// Swap current and previous deployment. An involution: swapping twice
    /// restores the original pair. Fails when there is nothing to roll back
    /// to.
    pub async fn swap_alias(&self, subdomain: &str) -> Result<Alias> {
        let result = sqlx::query(
            "UPDATE aliases SET \
               deployment_id = previous_deployment_id, \
               previous_deployment_id = deployment_id, \
               updated_at = ? \
             WHERE subdomain = ? AND previous_deployment_id IS NOT NULL",
        )
        .bind(Utc::now())
        .bind(subdomain)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.alias_by_subdomain(subdomain).await? {
                Some(_) => Err(ErrorKind::NoPreviousDeployment.into()),
                None => Err(ErrorKind::AliasNotFound.into()),
            };
        }

        self.alias_by_subdomain(subdomain)
            .await?
            .ok_or_else(|| ErrorKind::AliasNotFound.into())
    }

    pub async fn alias_by_subdomain(&self, subdomain: &str) -> Result<Option<Alias>> {
        Ok(sqlx::query_as("SELECT * FROM aliases WHERE subdomain = ?")
            .bind(subdomain)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Aliases of a project whose deployment actually succeeded; the set the
    /// router config is generated from.
    pub async fn project_aliases(&self, project_id: &str) -> Result<Vec<Alias>> {
        Ok(sqlx::query_as(
            "SELECT a.* FROM aliases a \
             JOIN deployments d ON a.deployment_id = d.id \
             WHERE d.project_id = ? AND d.conclusion = 'succeeded'",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Union of current and previous deployment ids across a project's
    /// aliases: the set of deployments the reaper must not touch.
    pub async fn active_deployment_ids(&self, project_id: &str) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT a.deployment_id FROM aliases a \
               JOIN deployments d ON a.deployment_id = d.id \
               WHERE d.project_id = ? \
             UNION \
             SELECT a.previous_deployment_id FROM aliases a \
               JOIN deployments d ON a.previous_deployment_id = d.id \
               WHERE d.project_id = ? AND a.previous_deployment_id IS NOT NULL",
        )
        .bind(project_id)
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn delete_aliases_for_deployments(&self, deployment_ids: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for id in deployment_ids {
            deleted += sqlx::query(
                "DELETE FROM aliases WHERE deployment_id = ? OR previous_deployment_id = ?",
            )
            .bind(id)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use runway_common::deployment::{Commit, Conclusion, DeployConfig, Trigger};

    use super::super::deployment::NewDeployment;
    use super::super::test_helpers;
    use super::*;

    async fn seeded() -> Persistence {
        let persistence = Persistence::new_in_memory().await;
        persistence
            .insert_project(&test_helpers::project("p1", "blog"))
            .await
            .unwrap();

        for id in ["d1", "d2", "d3"] {
            persistence
                .insert_deployment(NewDeployment {
                    id: id.to_string(),
                    project_id: "p1",
                    environment_id: "prod",
                    branch: "main",
                    commit: Commit {
                        sha: format!("{id:0<40}"),
                        message: "m".into(),
                        author: "a".into(),
                        date: Utc::now(),
                    },
                    config: DeployConfig::default(),
                    env_vars_ciphertext: "",
                    trigger: Trigger::User,
                })
                .await
                .unwrap();
            persistence
                .conclude_deployment(id, Conclusion::Succeeded, None)
                .await
                .unwrap();
        }

        persistence
    }

    #[tokio::test]
    async fn upsert_demotes_the_previous_holder() {
        let persistence = seeded().await;

        let alias = persistence
            .upsert_alias("blog", "d1", AliasType::Environment, "prod", Some("prod"))
            .await
            .unwrap();
        assert_eq!(alias.deployment_id, "d1");
        assert_eq!(alias.previous_deployment_id, None);

        let alias = persistence
            .upsert_alias("blog", "d2", AliasType::Environment, "prod", Some("prod"))
            .await
            .unwrap();
        assert_eq!(alias.deployment_id, "d2");
        assert_eq!(alias.previous_deployment_id, Some("d1".to_string()));
    }

    #[tokio::test]
    async fn upsert_with_the_same_target_is_a_no_op() {
        let persistence = seeded().await;

        persistence
            .upsert_alias("blog", "d1", AliasType::Environment, "prod", Some("prod"))
            .await
            .unwrap();
        persistence
            .upsert_alias("blog", "d2", AliasType::Environment, "prod", Some("prod"))
            .await
            .unwrap();
        let alias = persistence
            .upsert_alias("blog", "d2", AliasType::Environment, "prod", Some("prod"))
            .await
            .unwrap();

        assert_eq!(alias.deployment_id, "d2");
        assert_eq!(alias.previous_deployment_id, Some("d1".to_string()));
    }

    #[tokio::test]
    async fn swap_is_an_involution() {
        let persistence = seeded().await;
        persistence
            .upsert_alias("blog", "d1", AliasType::Environment, "prod", Some("prod"))
            .await
            .unwrap();
        persistence
            .upsert_alias("blog", "d2", AliasType::Environment, "prod", Some("prod"))
            .await
            .unwrap();

        let swapped = persistence.swap_alias("blog").await.unwrap();
        assert_eq!(swapped.deployment_id, "d1");
        assert_eq!(swapped.previous_deployment_id, Some("d2".to_string()));

        let restored = persistence.swap_alias("blog").await.unwrap();
        assert_eq!(restored.deployment_id, "d2");
        assert_eq!(restored.previous_deployment_id, Some("d1".to_string()));
    }

    #[tokio::test]
    async fn swap_without_previous_fails_without_changes() {
        let persistence = seeded().await;
        persistence
            .upsert_alias("blog", "d1", AliasType::Environment, "prod", Some("prod"))
            .await
            .unwrap();

        let err = persistence.swap_alias("blog").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPreviousDeployment);

        let alias = persistence.alias_by_subdomain("blog").await.unwrap().unwrap();
        assert_eq!(alias.deployment_id, "d1");

        let err = persistence.swap_alias("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AliasNotFound);
    }

    #[tokio::test]
    async fn active_set_is_the_union_of_current_and_previous() {
        let persistence = seeded().await;
        persistence
            .upsert_alias("blog", "d1", AliasType::Environment, "prod", Some("prod"))
            .await
            .unwrap();
        persistence
            .upsert_alias("blog", "d2", AliasType::Environment, "prod", Some("prod"))
            .await
            .unwrap();
        persistence
            .upsert_alias("blog-branch-main", "d2", AliasType::Branch, "main", None)
            .await
            .unwrap();

        let active = persistence.active_deployment_ids("p1").await.unwrap();
        assert_eq!(active, HashSet::from(["d1".to_string(), "d2".to_string()]));

        // A third successful deployment pushes d1 out of the set.
        persistence
            .upsert_alias("blog", "d3", AliasType::Environment, "prod", Some("prod"))
            .await
            .unwrap();
        persistence
            .upsert_alias("blog-branch-main", "d3", AliasType::Branch, "main", None)
            .await
            .unwrap();

        let active = persistence.active_deployment_ids("p1").await.unwrap();
        assert_eq!(active, HashSet::from(["d2".to_string(), "d3".to_string()]));
    }

    #[tokio::test]
    async fn project_aliases_skip_unsuccessful_deployments() {
        let persistence = seeded().await;
        persistence
            .insert_deployment(NewDeployment {
                id: "d4".to_string(),
                project_id: "p1",
                environment_id: "prod",
                branch: "main",
                commit: Commit {
                    sha: "d4".repeat(20),
                    message: "m".into(),
                    author: "a".into(),
                    date: Utc::now(),
                },
                config: DeployConfig::default(),
                env_vars_ciphertext: "",
                trigger: Trigger::User,
            })
            .await
            .unwrap();
        persistence
            .conclude_deployment("d4", Conclusion::Failed, Some("exited"))
            .await
            .unwrap();

        persistence
            .upsert_alias("blog", "d1", AliasType::Environment, "prod", Some("prod"))
            .await
            .unwrap();
        persistence
            .upsert_alias("blog-branch-x", "d4", AliasType::Branch, "x", None)
            .await
            .unwrap();

        let aliases = persistence.project_aliases("p1").await.unwrap();
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].subdomain, "blog");
    }
}
