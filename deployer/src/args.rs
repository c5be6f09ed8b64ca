use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use strum::Display;

#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Uri to the `.sqlite` file used to store state
    #[clap(long, default_value = "./deployer.sqlite")]
    pub state: String,

    /// Address to bind the API to
    #[clap(long, default_value = "127.0.0.1:8001")]
    pub api_address: SocketAddr,

    /// Redis instance backing the job queue and the event streams
    #[clap(long, default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Docker daemon endpoint; `unix://` and `tcp://`/`http://` are supported
    #[clap(long, default_value = "unix:///var/run/docker.sock")]
    pub docker_host: String,

    /// The Docker network user runners are attached to
    #[clap(long, default_value = "runway_runner")]
    pub network_name: String,

    /// Prefix of the runner images deployments are started from
    #[clap(long, default_value = "runner-")]
    pub image_prefix: String,

    /// Apex under which alias subdomains are published
    #[clap(long, default_value = "localhost")]
    pub deploy_domain: String,

    /// Scheme the edge router serves deployments on
    #[clap(long, value_enum, default_value_t = Scheme::Https)]
    pub url_scheme: Scheme,

    /// Directory the edge router watches for per-project routing files
    #[clap(long, default_value = "/data/traefik")]
    pub router_config_dir: PathBuf,

    /// Base url of the log aggregator
    #[clap(long, default_value = "http://loki:3100")]
    pub loki_url: String,

    /// Loki push endpoint handed to the container log driver
    #[clap(long, default_value = "http://127.0.0.1:3100/loki/api/v1/push")]
    pub loki_push_url: String,

    /// Base url of the Git provider API
    #[clap(long, default_value = "https://api.github.com")]
    pub github_api_url: String,

    /// App id of the GitHub App used for installation tokens
    #[clap(long, default_value = "")]
    pub github_app_id: String,

    /// Path to the GitHub App RSA private key (PEM)
    #[clap(long)]
    pub github_app_private_key: Option<PathBuf>,

    /// Number of jobs a single worker process runs concurrently
    #[clap(long, default_value_t = 8)]
    pub max_jobs: usize,

    /// Hard cap on a single job, in seconds. Must exceed the deployment
    /// timeout so a timed-out deployment can still fail gracefully.
    #[clap(long, default_value_t = 320)]
    pub job_timeout: u64,

    /// How long a deployment may take to become ready, in seconds
    #[clap(long, default_value_t = 300)]
    pub deployment_timeout: u64,

    /// Seconds between periodic reaper sweeps
    #[clap(long, default_value_t = 3600)]
    pub reaper_interval: u64,

    /// CPU allowance used when a project does not set one
    #[clap(long, default_value_t = 0.5)]
    pub default_cpus: f64,

    /// Memory limit in MiB used when a project does not set one
    #[clap(long, default_value_t = 2048)]
    pub default_memory_mb: i64,
}

#[derive(ValueEnum, Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn is_https(&self) -> bool {
        matches!(self, Scheme::Https)
    }
}
