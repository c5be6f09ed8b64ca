pub mod deployment;
pub mod domain;
pub mod environment;
pub mod log;
pub mod project;
pub mod secret;
pub mod subdomain;

/// Hostname label length limit imposed by DNS; alias subdomains must fit.
pub const MAX_SUBDOMAIN_LEN: usize = 63;

/// The port every runner container is expected to listen on.
pub const RUNNER_PORT: u16 = 8000;
