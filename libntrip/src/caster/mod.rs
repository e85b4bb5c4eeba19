//! NTRIP (v1) client for receiving correction data from a caster.

pub mod client;
pub use client::{Client, ClientHandle, Corrections, State, StateObserver, Submission};

pub mod handshake;

use std::time::Duration;


/// Default TCP port of NTRIP casters.
pub const DEFAULT_PORT: u16 = 2101;

/// Default maximum size of a single correction chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default pause between two correction reads.
pub const DEFAULT_CORRECTION_INTERVAL: Duration = Duration::from_secs(1);

/// Default user agent, casters expect it to start with `NTRIP`.
pub const DEFAULT_USER_AGENT: &str = concat!("NTRIP ntrip/", env!("CARGO_PKG_VERSION"));


/// Credentials for HTTP basic authentication against the caster.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}


/// Caster coordinates and session parameters.
#[derive(Debug, Clone)]
pub struct CasterConfig {
    pub host: String,
    pub port: u16,
    pub mountpoint: String,
    pub credentials: Credentials,
    pub user_agent: String,

    /// Upper bound for establishing the TCP connection.
    pub connect_timeout: Duration,

    /// Upper bound for the caster to acknowledge the request.
    pub handshake_timeout: Duration,

    /// Number of response lines scanned for the acknowledgement before the
    /// caster is considered to have rejected the request.
    pub max_handshake_lines: usize,

    /// Maximum size of a single correction chunk.
    pub chunk_size: usize,

    /// Pause after each correction chunk, limits the forwarding rate.
    pub correction_interval: Duration,

    /// Give up on a caster that stays silent for this long while streaming.
    pub read_timeout: Option<Duration>,
}

impl CasterConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        mountpoint: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            mountpoint: mountpoint.into(),
            credentials,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_handshake_lines: 32,
            chunk_size: DEFAULT_CHUNK_SIZE,
            correction_interval: DEFAULT_CORRECTION_INTERVAL,
            read_timeout: Some(Duration::from_secs(30)),
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Read,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Connect => write!(f, "connect"),
            Stage::Read => write!(f, "read"),
        }
    }
}


/// Reasons for the caster not accepting a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Connection closed before the acknowledgement was received.
    Closed,

    /// No acknowledgement within the configured number of lines.
    LineLimit(usize),

    /// No acknowledgement within the configured time.
    Timeout,

    /// The caster answered with an HTTP error status.
    Status(String),

    /// The caster answered with its source table, i.e., the mountpoint is
    /// unknown.
    SourceTable,
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::Closed => write!(f, "connection closed by caster"),
            HandshakeError::LineLimit(n) => write!(f, "no acknowledgement within {n} lines"),
            HandshakeError::Timeout => write!(f, "no acknowledgement in time"),
            HandshakeError::Status(line) => write!(f, "rejected by caster: {line}"),
            HandshakeError::SourceTable => write!(f, "mountpoint not found, caster sent source table"),
        }
    }
}


#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Timeout(Stage),
    Handshake(HandshakeError),
    AlreadyConnected,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "caster I/O error: {e}"),
            Error::Timeout(stage) => write!(f, "caster {stage} timed out"),
            Error::Handshake(e) => write!(f, "handshake failed: {e}"),
            Error::AlreadyConnected => write!(f, "session already active"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<HandshakeError> for Error {
    fn from(value: HandshakeError) -> Self {
        Self::Handshake(value)
    }
}
