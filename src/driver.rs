//! Load driver.
//!
//! Runs a stream of client sessions against one server while it is running.
//! Each session connects, waits a random startup delay, then requests a
//! random path from a fixed candidate set; sessions are spawned with a
//! random pause between them. Session failures are logged and counted,
//! never propagated.

use crate::client::{Client, ClientError, Reply};
use crate::config::{ClientConfig, DriverConfig};
use crate::server::Server;
use rand::seq::SliceRandom;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// One planned client session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub path: String,
    pub startup_delay: Duration,
}

/// Random timing and path selection, drawn from an injected source
#[derive(Debug)]
pub struct Schedule<R> {
    rng: R,
    paths: Vec<String>,
    startup_delay_ms: RangeInclusive<u64>,
    spawn_delay_ms: RangeInclusive<u64>,
}

impl<R: Rng> Schedule<R> {
    pub fn new(config: &DriverConfig, rng: R) -> Self {
        Self {
            rng,
            paths: config.paths.clone(),
            startup_delay_ms: config.startup_delay_ms.clone(),
            spawn_delay_ms: config.spawn_delay_ms.clone(),
        }
    }

    pub fn next_session(&mut self) -> Session {
        let path = self.paths.choose(&mut self.rng).cloned().unwrap_or_default();
        let startup_delay = Duration::from_millis(self.rng.gen_range(self.startup_delay_ms.clone()));
        Session {
            path,
            startup_delay,
        }
    }

    pub fn next_spawn_delay(&mut self) -> Duration {
        Duration::from_millis(self.rng.gen_range(self.spawn_delay_ms.clone()))
    }
}

/// Totals for one driver run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverReport {
    /// Sessions started
    pub spawned: usize,
    /// Sessions that received a response, whatever its code
    pub completed: usize,
    /// Sessions that failed to connect or read a response
    pub failed: usize,
}

/// Spawns client sessions against a server
#[derive(Debug)]
pub struct LoadDriver<R> {
    schedule: Schedule<R>,
    client: ClientConfig,
    poll_interval: Duration,
    print_replies: bool,
}

impl<R: Rng> LoadDriver<R> {
    pub fn new(config: &DriverConfig, client: ClientConfig, rng: R) -> Self {
        Self {
            schedule: Schedule::new(config, rng),
            client,
            poll_interval: config.poll_interval,
            print_replies: true,
        }
    }

    /// Do not echo received file content to stdout
    #[cfg(test)]
    pub fn quiet(mut self) -> Self {
        self.print_replies = false;
        self
    }

    /// Wait for `server` to run, then spawn sessions until it closes.
    /// Returns once every spawned session has finished.
    pub async fn drive(&mut self, server: &Server) -> DriverReport {
        let mut report = DriverReport::default();

        while !server.is_running() {
            if server.is_closed() {
                debug!("Server closed before it started; nothing to drive");
                return report;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let target = dial_addr(server.local_addr());
        info!(target = %target, "Load driver started");

        let mut sessions = JoinSet::new();
        while server.is_running() {
            let session = self.schedule.next_session();
            debug!(
                path = %session.path,
                startup_delay_ms = session.startup_delay.as_millis() as u64,
                "Spawning client"
            );
            sessions.spawn(run_session(
                target,
                session,
                self.client.clone(),
                self.print_replies,
            ));
            report.spawned += 1;

            let pause = self.schedule.next_spawn_delay();
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = server.wait_closed() => break,
            }
        }

        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok(true) => report.completed += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    debug!(error = %e, "Client task aborted");
                    report.failed += 1;
                }
            }
        }

        info!(
            spawned = report.spawned,
            completed = report.completed,
            failed = report.failed,
            "Load driver finished"
        );
        report
    }
}

/// Run one session; true if a response was received
async fn run_session(
    target: SocketAddr,
    session: Session,
    config: ClientConfig,
    print_reply: bool,
) -> bool {
    match request(target, &session, &config).await {
        Ok(Some(reply)) => {
            debug!(path = %session.path, code = reply.code(), "Client session finished");
            if print_reply {
                if let Err(e) = reply.print() {
                    debug!(error = %e, "Failed to print reply");
                }
            }
            true
        }
        Ok(None) => true,
        Err(e) => {
            debug!(path = %session.path, error = %e, "Client session failed");
            false
        }
    }
}

async fn request(
    target: SocketAddr,
    session: &Session,
    config: &ClientConfig,
) -> Result<Option<Reply>, ClientError> {
    let mut client = Client::connect(&target.ip().to_string(), target.port(), config).await?;
    tokio::time::sleep(session.startup_delay).await;
    client.request_file(&session.path).await
}

/// Loopback address for a listener bound to a wildcard address
fn dial_addr(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local.port())
        }
        _ => local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs;

    fn driver_config(paths: &[&str]) -> DriverConfig {
        DriverConfig {
            paths: paths.iter().map(|p| p.to_string()).collect(),
            startup_delay_ms: 0..=20,
            spawn_delay_ms: 5..=15,
            poll_interval: Duration::from_millis(5),
            seed: None,
        }
    }

    #[test]
    fn test_schedule_is_deterministic_for_seed() {
        let config = DriverConfig::default();
        let mut a = Schedule::new(&config, StdRng::seed_from_u64(42));
        let mut b = Schedule::new(&config, StdRng::seed_from_u64(42));

        for _ in 0..50 {
            assert_eq!(a.next_session(), b.next_session());
            assert_eq!(a.next_spawn_delay(), b.next_spawn_delay());
        }
    }

    #[test]
    fn test_schedule_stays_in_bounds() {
        let config = DriverConfig::default();
        let mut schedule = Schedule::new(&config, StdRng::seed_from_u64(1));

        for _ in 0..200 {
            let session = schedule.next_session();
            assert!(config.paths.contains(&session.path));
            let startup = session.startup_delay.as_millis() as u64;
            assert!((500..=2000).contains(&startup));
            let spawn = schedule.next_spawn_delay().as_millis() as u64;
            assert!((100..=2000).contains(&spawn));
        }
    }

    #[test]
    fn test_schedule_can_be_pinned() {
        let config = DriverConfig {
            paths: vec!["only.txt".to_string()],
            startup_delay_ms: 750..=750,
            spawn_delay_ms: 300..=300,
            ..DriverConfig::default()
        };
        let mut schedule = Schedule::new(&config, StdRng::seed_from_u64(9));

        assert_eq!(
            schedule.next_session(),
            Session {
                path: "only.txt".to_string(),
                startup_delay: Duration::from_millis(750),
            }
        );
        assert_eq!(schedule.next_spawn_delay(), Duration::from_millis(300));
    }

    #[test]
    fn test_dial_addr() {
        let wildcard: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        assert_eq!(dial_addr(wildcard), "127.0.0.1:8080".parse().unwrap());

        let wildcard6: SocketAddr = "[::]:8080".parse().unwrap();
        assert_eq!(dial_addr(wildcard6), "[::1]:8080".parse().unwrap());

        let bound: SocketAddr = "192.168.1.2:80".parse().unwrap();
        assert_eq!(dial_addr(bound), bound);
    }

    #[tokio::test]
    async fn test_drive_until_server_stops() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("someText.txt"), "some text").unwrap();

        let server = Server::bind(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            root: dir.path().to_path_buf(),
            grace_period: Duration::from_millis(5),
            time_to_live: Some(Duration::from_millis(300)),
            ..ServerConfig::default()
        })
        .await
        .unwrap();
        server.start().await;

        let config = driver_config(&["someText.txt", "/bin/thisBADfilePath"]);
        let client = ClientConfig {
            timeout: Duration::from_secs(2),
        };
        let mut driver = LoadDriver::new(&config, client, StdRng::seed_from_u64(3)).quiet();

        let report = tokio::time::timeout(Duration::from_secs(10), driver.drive(&server))
            .await
            .unwrap();

        assert!(server.is_closed());
        assert!(report.spawned > 0);
        assert!(report.completed > 0);
        assert_eq!(report.completed + report.failed, report.spawned);

        assert!(server.shutdown(Duration::from_secs(5)).await);
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_drive_closed_server_spawns_nothing() {
        let server = Server::bind(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        })
        .await
        .unwrap();
        server.stop().await;

        let config = driver_config(&["a.txt"]);
        let mut driver =
            LoadDriver::new(&config, ClientConfig::default(), StdRng::seed_from_u64(0)).quiet();

        assert_eq!(driver.drive(&server).await, DriverReport::default());
    }

    #[tokio::test]
    async fn test_failed_sessions_are_counted() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        drop(listener);

        let session = Session {
            path: "a.txt".to_string(),
            startup_delay: Duration::ZERO,
        };
        assert!(!run_session(target, session, ClientConfig::default(), false).await);
    }
}
