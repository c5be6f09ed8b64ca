use std::io;
use std::sync::Arc;

use clap::Parser;
use runway_common::secret::Key;
use runway_deployer::api::make_router;
use runway_deployer::args::Args;
use runway_deployer::deployment::monitor;
use runway_deployer::worker::Worker;
use runway_deployer::Deployer;
use tracing::{info, trace};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const ENCRYPTION_KEY: &str = "RUNWAY_ENCRYPTION_KEY";
const WEBHOOK_SECRET: &str = "RUNWAY_GITHUB_WEBHOOK_SECRET";

#[tokio::main]
async fn main() -> io::Result<()> {
    let args = Args::parse();

    let fmt_layer = fmt::layer();
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    trace!(args = ?args, "parsed args");

    let encryption_key = std::env::var(ENCRYPTION_KEY).unwrap_or_else(|_| {
        panic!("No encryption key specified with environment variable {ENCRYPTION_KEY}")
    });
    let secrets = Key::from_base64(&encryption_key)
        .unwrap_or_else(|err| panic!("Invalid {ENCRYPTION_KEY}: {err}"));
    let webhook_secret = std::env::var(WEBHOOK_SECRET).unwrap_or_default();

    let api_address = args.api_address;
    let deployer = Arc::new(
        Deployer::new(args, secrets, webhook_secret)
            .await
            .unwrap_or_else(|err| panic!("Failed to initialize the deployer: {err}")),
    );

    let worker = Worker::new(Arc::clone(&deployer));
    let worker_handle = tokio::spawn(worker.start());

    let monitor_handle = tokio::spawn(monitor::run(Arc::clone(&deployer)));

    let router = make_router(Arc::clone(&deployer));
    info!("Binding to and listening at address: {}", api_address);
    let api_handle = tokio::spawn(
        axum::Server::bind(&api_address).serve(router.into_make_service()),
    );

    let _ = tokio::join!(worker_handle, monitor_handle, api_handle);

    Ok(())
}
