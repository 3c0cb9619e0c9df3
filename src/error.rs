//! ═══════════════════════════════════════════════════════════════════════════════
//! ERROR — Unified Error Type for Painlab
//! ═══════════════════════════════════════════════════════════════════════════════
//! Centralized error handling. No scattered .unwrap() or .expect() calls.
//! ═══════════════════════════════════════════════════════════════════════════════

use std::fmt;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, PainlabError>;

/// The unified error type for the Painlab crate
#[derive(Debug)]
pub enum PainlabError {
    /// Command parameters outside the device protocol range (rejected pre-I/O)
    Protocol(ProtocolError),
    /// Serial connection open/close/write failure
    Connection(ConnectionError),
    /// Yoke record resolution or persistence failure
    Yoke(YokeError),
    /// Configuration error
    Config(String),
    /// I/O error (file operations)
    Io(std::io::Error),
    /// JSON serialization/deserialization error
    Json(serde_json::Error),
    /// Internal error (should not happen)
    Internal(String),
}

impl std::error::Error for PainlabError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PainlabError::Io(e) => Some(e),
            PainlabError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for PainlabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PainlabError::Protocol(e) => write!(f, "Protocol error: {}", e),
            PainlabError::Connection(e) => write!(f, "Connection error: {}", e),
            PainlabError::Yoke(e) => write!(f, "Yoke error: {}", e),
            PainlabError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PainlabError::Io(e) => write!(f, "I/O error: {}", e),
            PainlabError::Json(e) => write!(f, "JSON error: {}", e),
            PainlabError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for PainlabError {
    fn from(err: std::io::Error) -> Self {
        PainlabError::Io(err)
    }
}

impl From<serde_json::Error> for PainlabError {
    fn from(err: serde_json::Error) -> Self {
        PainlabError::Json(err)
    }
}

impl From<ProtocolError> for PainlabError {
    fn from(err: ProtocolError) -> Self {
        PainlabError::Protocol(err)
    }
}

impl From<ConnectionError> for PainlabError {
    fn from(err: ConnectionError) -> Self {
        PainlabError::Connection(err)
    }
}

impl From<YokeError> for PainlabError {
    fn from(err: YokeError) -> Self {
        PainlabError::Yoke(err)
    }
}

/// Command validation errors. Values are never silently clamped; a command
/// whose parameters fall outside these ranges is rejected before any I/O.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Base temperature outside 20.0 – 45.0 °C
    BaseTemperatureRange(f32),
    /// Target temperature outside 0.0 – 60.0 °C
    TargetTemperatureRange(f32),
    /// Surface selector outside 0 (all) – 5
    SurfaceRange(u8),
    /// Stimulation duration outside 10 – 99,999 ms
    DurationRange(u32),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::BaseTemperatureRange(t) => {
                write!(f, "base temperature {:.1} °C outside 20.0 – 45.0 °C", t)
            }
            ProtocolError::TargetTemperatureRange(t) => {
                write!(f, "target temperature {:.1} °C outside 0.0 – 60.0 °C", t)
            }
            ProtocolError::SurfaceRange(s) => {
                write!(f, "surface index {} outside 0 (all) – 5", s)
            }
            ProtocolError::DurationRange(d) => {
                write!(f, "duration {} ms outside 10 – 99,999 ms", d)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Serial connection errors. A closed connection makes enqueue a reported
/// no-op ("command dropped"), never an automatic retry.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Connection is not open; command was dropped
    NotOpen,
    /// Opening the port failed
    OpenFailed(String),
    /// The worker thread did not stop within the close timeout
    WorkerUnresponsive,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::NotOpen => write!(f, "serial not open; command dropped"),
            ConnectionError::OpenFailed(msg) => write!(f, "failed to open port: {}", msg),
            ConnectionError::WorkerUnresponsive => {
                write!(f, "serial worker did not stop within the close timeout")
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Yoke store errors
#[derive(Debug)]
pub enum YokeError {
    /// Selector matched no records ("no yoke loaded")
    NoRecords(String),
    /// A matched record could not be parsed
    Malformed { path: String, reason: String },
    /// Persisting a control round's record failed. A lost record silently
    /// breaks a future no-control round's fidelity, so this one is fatal.
    Save(String),
}

impl fmt::Display for YokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            YokeError::NoRecords(sel) => write!(f, "no yoke records matched '{}'", sel),
            YokeError::Malformed { path, reason } => {
                write!(f, "malformed yoke record '{}': {}", path, reason)
            }
            YokeError::Save(msg) => write!(f, "failed to save yoke record: {}", msg),
        }
    }
}

impl std::error::Error for YokeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_values() {
        let err = PainlabError::Protocol(ProtocolError::TargetTemperatureRange(60.1));
        assert!(err.to_string().contains("60.1"));

        let err = PainlabError::Connection(ConnectionError::NotOpen);
        assert!(err.to_string().contains("dropped"));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PainlabError = io_err.into();
        assert!(matches!(err, PainlabError::Io(_)));
    }
}
