//! tiny-fileserver: a line-oriented file server
//!
//! Three modes, one per process:
//! - `server <port> [ttlMillis]`: serve files from the working directory
//! - `client <host> <port> <filepath>`: request one file and print it
//! - `both <port> [ttlMillis]`: run a server and a randomized client load
//!   against it
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod config;
mod driver;
mod handler;
mod protocol;
mod resolver;
mod server;

use client::Client;
use config::{Config, Mode};
use driver::LoadDriver;
use rand::rngs::StdRng;
use rand::SeedableRng;
use server::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.mode.clone() {
        Mode::Server => run_server(config).await,
        Mode::Client { host, port, path } => run_client(&config, &host, port, &path).await,
        Mode::Both => run_both(config).await,
    }
}

/// Serve until the time to live elapses or Ctrl-C
async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.server.host,
        port = config.server.port,
        ttl_ms = config.server.time_to_live.map(|ttl| ttl.as_millis() as u64),
        "Starting server"
    );

    let server = Server::bind(config.server.clone()).await?;
    server.start().await;

    tokio::select! {
        _ = server.wait_closed() => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    server.shutdown(config.server.shutdown_timeout).await;
    Ok(())
}

/// Request a single file and print its content
async fn run_client(
    config: &Config,
    host: &str,
    port: u16,
    path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::connect(host, port, &config.client).await?;
    if let Some(reply) = client.request_file(path).await? {
        reply.print()?;
    }
    Ok(())
}

/// Run a server and drive randomized client sessions against it
async fn run_both(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        port = config.server.port,
        ttl_ms = config.server.time_to_live.map(|ttl| ttl.as_millis() as u64),
        seed = config.driver.seed,
        "Starting server with load driver"
    );

    let server = Server::bind(config.server.clone()).await?;
    server.start().await;

    let rng = match config.driver.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut driver = LoadDriver::new(&config.driver, config.client.clone(), rng);

    tokio::select! {
        report = driver.drive(&server) => {
            if report.failed > 0 {
                warn!(failed = report.failed, "Some client sessions failed");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    server.shutdown(config.server.shutdown_timeout).await;
    Ok(())
}
