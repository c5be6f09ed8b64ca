//! Per-project routing files for the edge router.
//!
//! Each project with routable resources owns exactly one declarative file
//! under the router's watch directory. Files are whole-file replacements
//! written through a temp sibling and renamed into place; concurrent
//! writers for the same project serialize through a per-project mutex.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use runway_common::domain::AliasType;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::args::Scheme;
use crate::error::Result;
use crate::persistence::{Alias, Domain, Persistence, Project};

#[derive(Debug, Serialize)]
struct DynamicConfig {
    http: HttpConfig,
}

#[derive(Debug, Serialize)]
struct HttpConfig {
    routers: BTreeMap<String, Router>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    middlewares: BTreeMap<String, Middleware>,
}

#[derive(Debug, Serialize)]
struct Router {
    rule: String,
    service: String,
    #[serde(rename = "entryPoints")]
    entry_points: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    middlewares: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<Tls>,
}

#[derive(Debug, Serialize)]
struct Tls {
    #[serde(rename = "certResolver")]
    cert_resolver: String,
}

#[derive(Debug, Serialize)]
struct Middleware {
    #[serde(rename = "redirectRegex")]
    redirect_regex: RedirectRegex,
}

#[derive(Debug, Serialize)]
struct RedirectRegex {
    regex: String,
    replacement: String,
    permanent: bool,
}

pub struct RouterConfigWriter {
    config_dir: PathBuf,
    deploy_domain: String,
    scheme: Scheme,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RouterConfigWriter {
    pub fn new(config_dir: PathBuf, deploy_domain: String, scheme: Scheme) -> Self {
        Self {
            config_dir,
            deploy_domain,
            scheme,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config_path(&self, project_id: &str) -> PathBuf {
        self.config_dir.join(format!("project_{project_id}.yml"))
    }

    async fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Regenerate the routing file for a project from its current aliases
    /// and active domains, or remove it when nothing is routable anymore.
    pub async fn refresh(&self, project: &Project, persistence: &Persistence) -> Result<()> {
        let lock = self.project_lock(&project.id).await;
        let _guard = lock.lock().await;

        let aliases = persistence.project_aliases(&project.id).await?;
        let domains = persistence.active_domains(&project.id).await?;

        self.write(&project.id, &aliases, &domains).await
    }

    /// Remove a project's routing file if present, without consulting the
    /// store. Used by project cleanup after the aliases are gone.
    pub async fn remove(&self, project_id: &str) -> Result<()> {
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;

        self.remove_file(&self.config_path(project_id)).await
    }

    async fn write(&self, project_id: &str, aliases: &[Alias], domains: &[Domain]) -> Result<()> {
        let path = self.config_path(project_id);

        if aliases.is_empty() && domains.is_empty() {
            return self.remove_file(&path).await;
        }

        let config = self.render(aliases, domains);
        let yaml = serde_yaml::to_string(&config)
            .map_err(|err| crate::error::Error::source(crate::error::ErrorKind::Internal, err))?;

        tokio::fs::create_dir_all(&self.config_dir).await?;
        let tmp = path.with_extension("yml.tmp");
        tokio::fs::write(&tmp, yaml).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(project_id, path = %path.display(), "router config written");

        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "router config removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn entry_points(&self) -> Vec<String> {
        match self.scheme {
            Scheme::Https => vec!["web".to_string(), "websecure".to_string()],
            Scheme::Http => vec!["web".to_string()],
        }
    }

    fn tls(&self) -> Option<Tls> {
        self.scheme.is_https().then(|| Tls {
            cert_resolver: "le".to_string(),
        })
    }

    fn render(&self, aliases: &[Alias], domains: &[Domain]) -> DynamicConfig {
        let mut routers = BTreeMap::new();
        let mut middlewares = BTreeMap::new();

        for alias in aliases {
            routers.insert(
                format!("router-alias-{}", alias.id),
                Router {
                    rule: format!("Host(`{}.{}`)", alias.subdomain, self.deploy_domain),
                    service: format!("deployment-{}@docker", alias.deployment_id),
                    entry_points: self.entry_points(),
                    middlewares: None,
                    tls: self.tls(),
                },
            );
        }

        for domain in domains {
            // Custom hostnames follow the environment's current deployment
            // through the stable environment-id alias.
            let Some(env_alias) = aliases.iter().find(|alias| {
                alias.alias_type == AliasType::EnvironmentId
                    && alias.value.as_deref() == domain.environment_id.as_deref()
                    && alias.value.is_some()
            }) else {
                continue;
            };

            if domain.domain_type.is_redirect() {
                let middleware_name = format!("redirect-{}", domain.id);
                routers.insert(
                    format!("router-redirect-{}", domain.id),
                    Router {
                        rule: format!("Host(`{}`)", domain.hostname),
                        service: "noop@internal".to_string(),
                        entry_points: self.entry_points(),
                        middlewares: Some(vec![middleware_name.clone()]),
                        tls: self.tls(),
                    },
                );
                middlewares.insert(
                    middleware_name,
                    Middleware {
                        redirect_regex: RedirectRegex {
                            regex: format!("^https?://{}/(.*)", domain.hostname),
                            replacement: format!(
                                "https://{}.{}/$1",
                                env_alias.subdomain, self.deploy_domain
                            ),
                            permanent: domain.domain_type.is_permanent(),
                        },
                    },
                );
            } else {
                routers.insert(
                    format!("router-domain-{}", domain.id),
                    Router {
                        rule: format!("Host(`{}`)", domain.hostname),
                        service: format!("deployment-{}@docker", env_alias.deployment_id),
                        entry_points: self.entry_points(),
                        middlewares: None,
                        tls: self.tls(),
                    },
                );
            }
        }

        DynamicConfig {
            http: HttpConfig {
                routers,
                middlewares,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use runway_common::domain::{DomainStatus, DomainType};

    use super::*;

    fn writer(dir: &Path, scheme: Scheme) -> RouterConfigWriter {
        RouterConfigWriter::new(dir.to_path_buf(), "deploy.example".to_string(), scheme)
    }

    fn alias(id: i64, subdomain: &str, deployment_id: &str, alias_type: AliasType) -> Alias {
        Alias {
            id,
            subdomain: subdomain.to_string(),
            deployment_id: deployment_id.to_string(),
            previous_deployment_id: None,
            alias_type,
            value: Some("prod".to_string()),
            environment_id: Some("prod".to_string()),
            updated_at: Utc::now(),
        }
    }

    fn domain(id: &str, hostname: &str, domain_type: DomainType) -> Domain {
        Domain {
            id: id.to_string(),
            project_id: "p1".to_string(),
            hostname: hostname.to_string(),
            domain_type,
            environment_id: Some("prod".to_string()),
            redirect_to_domain_id: None,
            status: DomainStatus::Active,
        }
    }

    #[tokio::test]
    async fn alias_routers_resolve_container_labelled_services() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path(), Scheme::Https);

        writer
            .write(
                "p1",
                &[alias(1, "blog", "d1", AliasType::Environment)],
                &[],
            )
            .await
            .unwrap();

        let yaml = std::fs::read_to_string(writer.config_path("p1")).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let router = &parsed["http"]["routers"]["router-alias-1"];

        assert_eq!(router["rule"], "Host(`blog.deploy.example`)");
        assert_eq!(router["service"], "deployment-d1@docker");
        assert_eq!(router["entryPoints"][1], "websecure");
        assert_eq!(router["tls"]["certResolver"], "le");
    }

    #[tokio::test]
    async fn http_scheme_keeps_a_single_entrypoint_and_no_tls() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path(), Scheme::Http);

        writer
            .write(
                "p1",
                &[alias(1, "blog", "d1", AliasType::Environment)],
                &[],
            )
            .await
            .unwrap();

        let yaml = std::fs::read_to_string(writer.config_path("p1")).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let router = &parsed["http"]["routers"]["router-alias-1"];

        assert_eq!(router["entryPoints"].as_sequence().unwrap().len(), 1);
        assert!(router.get("tls").is_none());
    }

    #[tokio::test]
    async fn proxy_domains_point_at_the_environment_alias_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path(), Scheme::Https);

        writer
            .write(
                "p1",
                &[alias(2, "blog-env-id-prod", "d2", AliasType::EnvironmentId)],
                &[domain("dom1", "www.acme.io", DomainType::Proxy)],
            )
            .await
            .unwrap();

        let yaml = std::fs::read_to_string(writer.config_path("p1")).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let router = &parsed["http"]["routers"]["router-domain-dom1"];

        assert_eq!(router["rule"], "Host(`www.acme.io`)");
        assert_eq!(router["service"], "deployment-d2@docker");
    }

    #[tokio::test]
    async fn redirect_domains_get_a_rewrite_middleware() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path(), Scheme::Https);

        writer
            .write(
                "p1",
                &[alias(2, "blog-env-id-prod", "d2", AliasType::EnvironmentId)],
                &[
                    domain("dom1", "old.acme.io", DomainType::MovedPermanently),
                    domain("dom2", "tmp.acme.io", DomainType::Found),
                ],
            )
            .await
            .unwrap();

        let yaml = std::fs::read_to_string(writer.config_path("p1")).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        let redirect = &parsed["http"]["middlewares"]["redirect-dom1"]["redirectRegex"];
        assert_eq!(redirect["regex"], "^https?://old.acme.io/(.*)");
        assert_eq!(
            redirect["replacement"],
            "https://blog-env-id-prod.deploy.example/$1"
        );
        assert_eq!(redirect["permanent"], true);
        assert_eq!(
            parsed["http"]["middlewares"]["redirect-dom2"]["redirectRegex"]["permanent"],
            false
        );

        let router = &parsed["http"]["routers"]["router-redirect-dom1"];
        assert_eq!(router["service"], "noop@internal");
        assert_eq!(router["middlewares"][0], "redirect-dom1");
    }

    #[tokio::test]
    async fn nothing_routable_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path(), Scheme::Https);

        writer
            .write(
                "p1",
                &[alias(1, "blog", "d1", AliasType::Environment)],
                &[],
            )
            .await
            .unwrap();
        assert!(writer.config_path("p1").exists());

        writer.write("p1", &[], &[]).await.unwrap();
        assert!(!writer.config_path("p1").exists());

        // Removing an absent file stays quiet.
        writer.write("p1", &[], &[]).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_renders_whatever_the_store_holds() {
        use chrono::Utc;
        use runway_common::deployment::{Commit, Conclusion, DeployConfig, Trigger};
        use runway_common::domain::DomainStatus;

        use crate::persistence::deployment::NewDeployment;
        use crate::persistence::{test_helpers, Persistence};

        let persistence = Persistence::new_in_memory().await;
        let project = test_helpers::project("p1", "blog");
        persistence.insert_project(&project).await.unwrap();
        persistence
            .insert_deployment(NewDeployment {
                id: "d1".to_string(),
                project_id: "p1",
                environment_id: "prod",
                branch: "main",
                commit: Commit {
                    sha: "0123456789abcdef0123456789abcdef01234567".into(),
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
            .conclude_deployment("d1", Conclusion::Succeeded, None)
            .await
            .unwrap();
        persistence
            .upsert_alias(
                "blog-env-id-prod",
                "d1",
                AliasType::EnvironmentId,
                "prod",
                Some("prod"),
            )
            .await
            .unwrap();
        persistence
            .insert_domain(&Domain {
                id: "dom1".to_string(),
                project_id: "p1".to_string(),
                hostname: "www.acme.io".to_string(),
                domain_type: runway_common::domain::DomainType::Proxy,
                environment_id: Some("prod".to_string()),
                redirect_to_domain_id: None,
                status: DomainStatus::Active,
            })
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path(), Scheme::Https);
        writer.refresh(&project, &persistence).await.unwrap();

        let yaml = std::fs::read_to_string(writer.config_path("p1")).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert!(parsed["http"]["routers"].get("router-alias-1").is_some());
        assert!(parsed["http"]["routers"].get("router-domain-dom1").is_some());
    }

    #[tokio::test]
    async fn domains_without_a_matching_alias_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path(), Scheme::Https);

        writer
            .write(
                "p1",
                &[alias(1, "blog", "d1", AliasType::Environment)],
                &[domain("dom1", "www.acme.io", DomainType::Proxy)],
            )
            .await
            .unwrap();

        let yaml = std::fs::read_to_string(writer.config_path("p1")).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert!(parsed["http"]["routers"].get("router-domain-dom1").is_none());
    }
}
