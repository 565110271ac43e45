//! Configuration module for tiny-fileserver.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "tiny-fileserver")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented file server, client and load driver", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Run mode
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve files until the time to live elapses or Ctrl-C
    Server {
        /// Port to listen on
        port: u16,
        /// Stop automatically after this many milliseconds
        ttl_millis: Option<u64>,
    },
    /// Request one file and print its content
    Client {
        /// Server address
        host: String,
        /// Server port
        port: u16,
        /// Path of the file to request
        filepath: String,
    },
    /// Run a server and a stream of randomized clients against it
    Both {
        /// Port to listen on
        port: u16,
        /// Stop automatically after this many milliseconds
        ttl_millis: Option<u64>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub driver: DriverSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Directory relative request paths resolve against
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Delay between writing a response and closing the connection
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Accept deadline; expiry ends the accept loop
    pub accept_timeout_ms: Option<u64>,
    /// Upper bound on waiting for in-flight connections at shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            root: default_root(),
            grace_period_ms: default_grace_period_ms(),
            accept_timeout_ms: None,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    /// Per-read deadline
    #[serde(default = "default_client_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_client_timeout_ms(),
        }
    }
}

/// Load driver configuration
#[derive(Debug, Deserialize)]
pub struct DriverSection {
    /// Candidate paths clients request
    #[serde(default = "default_paths")]
    pub paths: Vec<String>,
    /// Inclusive [min, max] delay before a client sends its request
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: [u64; 2],
    /// Inclusive [min, max] delay between client spawns
    #[serde(default = "default_spawn_delay_ms")]
    pub spawn_delay_ms: [u64; 2],
    /// Interval for polling the server until it runs
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Fixed seed for the random schedule
    pub seed: Option<u64>,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            paths: default_paths(),
            startup_delay_ms: default_startup_delay_ms(),
            spawn_delay_ms: default_spawn_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            seed: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_grace_period_ms() -> u64 {
    100
}

fn default_shutdown_timeout_ms() -> u64 {
    1000
}

fn default_client_timeout_ms() -> u64 {
    1000
}

fn default_paths() -> Vec<String> {
    vec![
        "/bin/thisBADfilePath".to_string(),
        "C:\\Windows\\explorer.FAKEexe".to_string(),
        "./resources/someText.txt".to_string(),
        "./resources/someHTML.html".to_string(),
    ]
}

fn default_startup_delay_ms() -> [u64; 2] {
    [500, 2000]
}

fn default_spawn_delay_ms() -> [u64; 2] {
    [100, 2000]
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub root: PathBuf,
    pub grace_period: Duration,
    pub accept_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub time_to_live: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let section = ServerSection::default();
        Self {
            host: section.host,
            port: 0,
            root: section.root,
            grace_period: Duration::from_millis(section.grace_period_ms),
            accept_timeout: None,
            shutdown_timeout: Duration::from_millis(section.shutdown_timeout_ms),
            time_to_live: None,
        }
    }
}

/// Resolved client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(default_client_timeout_ms()),
        }
    }
}

/// Resolved load driver settings; delays are in milliseconds
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub paths: Vec<String>,
    pub startup_delay_ms: RangeInclusive<u64>,
    pub spawn_delay_ms: RangeInclusive<u64>,
    pub poll_interval: Duration,
    pub seed: Option<u64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        let [startup_min, startup_max] = default_startup_delay_ms();
        let [spawn_min, spawn_max] = default_spawn_delay_ms();
        Self {
            paths: default_paths(),
            startup_delay_ms: startup_min..=startup_max,
            spawn_delay_ms: spawn_min..=spawn_max,
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            seed: None,
        }
    }
}

/// Run mode with its mode-specific arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client { host: String, port: u16, path: String },
    Both,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub log_level: String,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub driver: DriverConfig,
}

impl Config {
    /// Load configuration from process arguments and optional TOML file.
    /// Exits with a usage message if the arguments are invalid.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            client,
            driver,
            logging,
        } = toml_config;

        let (mode, port, ttl_millis) = match cli.command {
            Command::Server { port, ttl_millis } => (Mode::Server, port, ttl_millis),
            Command::Both { port, ttl_millis } => (Mode::Both, port, ttl_millis),
            Command::Client {
                host,
                port,
                filepath,
            } => (
                Mode::Client {
                    host,
                    port,
                    path: filepath,
                },
                port,
                None,
            ),
        };

        if driver.paths.is_empty() {
            return Err(ConfigError::Invalid(
                "driver.paths must name at least one path".to_string(),
            ));
        }

        Ok(Config {
            mode,
            log_level: cli.log_level.unwrap_or(logging.level),
            server: ServerConfig {
                host: server.host,
                port,
                root: server.root,
                grace_period: Duration::from_millis(server.grace_period_ms),
                accept_timeout: server.accept_timeout_ms.map(Duration::from_millis),
                shutdown_timeout: Duration::from_millis(server.shutdown_timeout_ms),
                time_to_live: ttl_millis.map(Duration::from_millis),
            },
            client: ClientConfig {
                timeout: Duration::from_millis(client.timeout_ms),
            },
            driver: DriverConfig {
                paths: driver.paths,
                startup_delay_ms: delay_range("driver.startup_delay_ms", driver.startup_delay_ms)?,
                spawn_delay_ms: delay_range("driver.spawn_delay_ms", driver.spawn_delay_ms)?,
                poll_interval: Duration::from_millis(driver.poll_interval_ms),
                seed: driver.seed,
            },
        })
    }
}

fn delay_range(name: &str, [min, max]: [u64; 2]) -> Result<RangeInclusive<u64>, ConfigError> {
    if min > max {
        return Err(ConfigError::Invalid(format!(
            "{name} minimum {min} exceeds maximum {max}"
        )));
    }
    Ok(min..=max)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::FileRead(_, e) => Some(e),
            ConfigError::TomlParse(_, e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}
