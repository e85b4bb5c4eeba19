//! Two-way relay between a serial GNSS receiver and an NTRIP caster.

pub mod bridge;
pub use bridge::Bridge;

use std::time::Duration;

use bytes::Bytes;

use crate::caster::State;
use crate::nmea::Sentence;


/// Default delay between receiver connect and the first caster connection
/// attempt, gives the receiver time to acquire a fix.
pub const DEFAULT_HANDSHAKE_DELAY: Duration = Duration::from_secs(15);


/// Policy for re-establishing a failed caster session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Number of consecutive reconnect attempts before giving up. Zero
    /// disables reconnecting entirely.
    pub max_attempts: u32,

    /// Pause before each reconnect attempt.
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            delay: Duration::ZERO,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub handshake_delay: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handshake_delay: DEFAULT_HANDSHAKE_DELAY,
            reconnect: ReconnectPolicy::default(),
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}


/// Status updates emitted by the bridge for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Serial link to the receiver changed.
    Receiver(LinkState),

    /// Caster session changed.
    Caster(State),

    /// A sentence has been received from the receiver.
    Sentence(Sentence),

    /// A position fix has been sent to the caster.
    Submitted(Sentence),

    /// Correction data has been written to the receiver.
    Corrections(Bytes),

    /// A recoverable failure, the bridge keeps running.
    Error(String),
}


#[derive(Debug)]
pub enum Error {
    Serial(std::io::Error),
    Join(tokio::task::JoinError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Serial(e) => write!(f, "receiver I/O error: {e}"),
            Error::Join(e) => write!(f, "relay task failed: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Serial(e) => Some(e),
            Error::Join(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Serial(value)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Join(value)
    }
}
