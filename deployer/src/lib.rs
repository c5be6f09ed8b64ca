use redis::aio::ConnectionManager;
use runway_common::secret::Key;
use tracing::info;

pub mod api;
pub mod args;
pub mod bus;
pub mod cleanup;
pub mod deployment;
pub mod docker;
pub mod error;
pub mod github;
pub mod logs;
pub mod persistence;
pub mod routing;
pub mod task;
pub mod worker;

use args::Args;
use bus::EventBus;
use error::Result;
use github::GithubClient;
use logs::LokiClient;
use persistence::Persistence;
use routing::RouterConfigWriter;
use task::JobQueue;

/// Shared context for the API, the worker pool, the monitor, and the
/// reaper: every collaborator the core coordinates, wired once at startup.
pub struct Deployer {
    pub persistence: Persistence,
    pub bus: EventBus,
    pub queue: JobQueue,
    pub docker: bollard::Docker,
    pub github: GithubClient,
    pub logs: LokiClient,
    pub router: RouterConfigWriter,
    pub secrets: Key,
    pub webhook_secret: String,
    pub args: Args,
}

impl Deployer {
    pub async fn new(args: Args, secrets: Key, webhook_secret: String) -> Result<Self> {
        let persistence = Persistence::new(&args.state).await?;

        let client = redis::Client::open(args.redis_url.as_str())?;
        let redis = ConnectionManager::new(client).await?;
        info!(redis_url = %args.redis_url, "connected to redis");

        let docker = docker::connect(&args.docker_host)?;

        let private_key = match &args.github_app_private_key {
            Some(path) => Some(tokio::fs::read(path).await?),
            None => None,
        };
        let github = GithubClient::new(
            args.github_api_url.clone(),
            args.github_app_id.clone(),
            private_key.as_deref(),
        )?;

        let logs = LokiClient::new(args.loki_url.clone());
        let router = RouterConfigWriter::new(
            args.router_config_dir.clone(),
            args.deploy_domain.clone(),
            args.url_scheme,
        );

        Ok(Self {
            persistence,
            bus: EventBus::new(redis.clone()),
            queue: JobQueue::new(redis),
            docker,
            github,
            logs,
            router,
            secrets,
            webhook_secret,
            args,
        })
    }
}
