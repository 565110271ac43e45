//! TCP server for handling file requests.
//!
//! Owns the listening socket and the accept loop. Each accepted connection
//! is handed to its own handler task; the loop never waits on a handler.
//! Lifecycle: `Created -> Running -> Closed`, where `Closed` is terminal.

use crate::config::ServerConfig;
use crate::handler::ConnectionHandler;
use crate::resolver::FileResolver;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Bound, not yet accepting
    Created,
    /// Accept loop running
    Running,
    /// Listener closed; terminal
    Closed,
}

/// Counts in-flight connections
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl ConnectionTracker {
    /// Count a new connection until the returned guard is dropped
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Resolve once no connection is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the active count on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// Listener before start, accept task after
#[derive(Debug)]
struct Acceptor {
    listener: Option<TcpListener>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Inner {
    config: ServerConfig,
    local_addr: SocketAddr,
    handler: ConnectionHandler,
    connections: Arc<ConnectionTracker>,
    state: watch::Sender<State>,
    acceptor: Mutex<Acceptor>,
}

impl Inner {
    /// Move to `Closed`; returns false if already closed
    fn mark_closed(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == State::Closed {
                false
            } else {
                *state = State::Closed;
                true
            }
        })
    }
}

/// Server instance; clones share the same server
#[derive(Debug, Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Bind the listening socket. The server does not accept until `start`.
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let addr = tokio::net::lookup_host((config.host.as_str(), config.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address for {}:{}", config.host, config.port),
                )
            })?;

        let listener = TcpListener::from_std(create_listener(addr)?)?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, root = %config.root.display(), "Server listening");

        let handler = ConnectionHandler::new(FileResolver::new(&config.root), config.grace_period);
        let (state, _) = watch::channel(State::Created);

        Ok(Server {
            inner: Arc::new(Inner {
                config,
                local_addr,
                handler,
                connections: Arc::new(ConnectionTracker::default()),
                state,
                acceptor: Mutex::new(Acceptor {
                    listener: Some(listener),
                    task: None,
                }),
            }),
        })
    }

    /// Start the accept loop, and the time-to-live timer if configured.
    /// No-op unless the server is `Created`.
    pub async fn start(&self) {
        let mut acceptor = self.inner.acceptor.lock().await;

        let started = self.inner.state.send_if_modified(|state| {
            if *state == State::Created {
                *state = State::Running;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(state = ?self.state(), "Start ignored");
            return;
        }

        let Some(listener) = acceptor.listener.take() else {
            self.inner.mark_closed();
            return;
        };
        acceptor.task = Some(tokio::spawn(accept_loop(Arc::clone(&self.inner), listener)));

        if let Some(ttl) = self.inner.config.time_to_live {
            let server = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                info!(ttl_ms = ttl.as_millis() as u64, "Time to live elapsed");
                server.stop().await;
            });
        }
    }

    /// Close the listener and cancel the accept loop. In-flight handlers
    /// keep running. Idempotent.
    pub async fn stop(&self) {
        let mut acceptor = self.inner.acceptor.lock().await;
        let closed_now = self.inner.mark_closed();

        acceptor.listener.take();
        if let Some(task) = acceptor.task.take() {
            task.abort();
            let _ = task.await;
        }

        if closed_now {
            info!(
                address = %self.inner.local_addr,
                active = self.active_connections(),
                "Server stopped"
            );
        }
    }

    /// Stop, then wait up to `bound` for in-flight connections to finish.
    /// Returns true if every connection finished in time.
    pub async fn shutdown(&self, bound: Duration) -> bool {
        self.stop().await;
        let drained = tokio::time::timeout(bound, self.inner.connections.wait_idle())
            .await
            .is_ok();
        if !drained {
            info!(
                active = self.active_connections(),
                "Shutdown bound elapsed with connections in flight"
            );
        }
        drained
    }

    /// Resolve once the server is closed, by `stop` or by its accept loop ending
    pub async fn wait_closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|state| *state == State::Closed).await;
    }

    pub fn state(&self) -> State {
        *self.inner.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.inner.connections.active()
    }
}

/// Accept connections until the listener fails, the accept deadline
/// passes, or the task is cancelled.
async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        debug!(port = inner.local_addr.port(), "Waiting for connection");

        let accepted = match inner.config.accept_timeout {
            Some(limit) => match tokio::time::timeout(limit, listener.accept()).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(timeout_ms = limit.as_millis() as u64, "Accept timed out");
                    break;
                }
            },
            None => listener.accept().await,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "Accept failed");
                break;
            }
        };

        let guard = inner.connections.track();
        debug!(peer = %peer, active = inner.connections.active(), "New connection");

        let conn_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            match conn_inner.handler.handle(stream).await {
                Ok(code) => debug!(peer = %peer, code, "Connection closed"),
                Err(e) => debug!(peer = %peer, error = %e, "Connection dropped"),
            }
            drop(guard);
        });
    }

    drop(listener);
    inner.mark_closed();
    debug!("Exit accept loop");
}

/// Create a TCP listener with SO_REUSEADDR so a restarted server can rebind.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
