//! Error types shared by every layer above the serial link.

use std::time::Duration;

use crate::gps::GpsSessionState;

/// Failures surfaced by the transport, the correlator, and the subsystems
/// built on top of it.
///
/// `Timeout` and `Protocol` are ordinary outcomes of an exchange and callers
/// are expected to match on them; `Transport` means the link itself is gone.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(String),

    #[error("timeout after {secs:.1}s waiting for reply to `{command}`", secs = .elapsed.as_secs_f64())]
    Timeout { command: String, elapsed: Duration },

    #[error("modem rejected `{command}`: {response}")]
    Protocol { command: String, response: String },

    #[error("GPS session expected {expected:?}, modem reports {actual:?}")]
    SessionState {
        expected: GpsSessionState,
        actual: GpsSessionState,
    },

    #[error("no GPS fix after {attempts} attempts")]
    FixUnavailable { attempts: u32 },

    #[error("poll queue: {0}")]
    Queue(String),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// True for failures a caller may retry on the same link.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Protocol { .. })
    }
}

/// A payload that could not be decoded. Never fatal for a listing; the
/// offending record is skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("expected at least {expected} header fields, got {got}")]
    FieldCount { expected: usize, got: usize },

    #[error("bad message index {0:?}")]
    Index(String),

    #[error("unknown message status {0:?}")]
    Status(String),

    #[error("bad timestamp {0:?}")]
    Timestamp(String),

    #[error("bad coordinate {0:?}")]
    Coordinate(String),

    #[error("missing {0} line")]
    MissingLine(&'static str),
}
