//! Control-surface connection managers
//!
//! One manager per target application, constructed once at startup and
//! held for the process lifetime. The compositor manager is plain
//! request/response; the avatar manager additionally runs a background
//! read loop for the post-authentication push channel. Neither owns a
//! retry loop; reconnection is always caller-triggered.

pub mod avatar;
pub mod compositor;

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::events::Surface;
use crate::types::{Result, StagehandError};

/// Connection lifecycle state. The single source of truth, per manager,
/// for whether command execution may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
}

impl ConnectionState {
    /// True once commands may be issued on this connection.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Authenticated)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
        };
        write!(f, "{name}")
    }
}

/// Per-target connection settings. Immutable once the manager is built.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Connect-time password, where the target enforces one (compositor).
    pub password: Option<String>,
    /// Location of the persisted credential (avatar tool).
    pub credential_file: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            credential_file: None,
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn with_credential_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credential_file = Some(path.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(StagehandError::Config("connection host is empty".into()));
        }
        if self.port == 0 {
            return Err(StagehandError::Config("connection port is zero".into()));
        }
        Ok(())
    }
}

/// Published connection state, readable without awaiting.
///
/// Transitions are only performed by code that is serialized on the
/// manager's I/O path (the command lock or the background read loop), so
/// this lock is never held across an await and never contended for long.
#[derive(Debug, Clone)]
pub struct StateCell {
    surface: Surface,
    state: Arc<RwLock<ConnectionState>>,
}

impl StateCell {
    pub fn new(surface: Surface) -> Self {
        Self {
            surface,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
        }
    }

    pub fn get(&self) -> ConnectionState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn set(&self, next: ConnectionState) {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let prev = *guard;
        if prev != next {
            debug!(surface = %self.surface, from = %prev, to = %next, "connection state");
            *guard = next;
        }
    }
}

/// Contract surface shared by both managers. Command execution stays on
/// the concrete types (each realization dispatches its own closed set of
/// command variants), but lifecycle and status probing are polymorphic so
/// the surrounding application can treat the managers uniformly.
#[async_trait]
pub trait ControlSurface: Send + Sync {
    /// Which control surface this manager drives.
    fn surface(&self) -> Surface;

    /// Begin or re-attempt a connection. Never blocks on the remote party
    /// beyond the configured connect timeout.
    async fn start(&self);

    /// Close the socket and settle into `Disconnected`.
    async fn shutdown(&self);

    /// Snapshot of the current connection state; never blocks.
    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }
}
