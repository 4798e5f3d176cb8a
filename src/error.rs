use std::fmt;

/// Main error type for the sgtsync daemon
#[derive(Debug)]
pub enum SgtSyncError {
    /// Configuration file or CLI argument errors
    Config(String),

    /// Console call budget exhausted; the offending event is dropped
    RateExceeded(f64),

    /// A tag name could not be resolved or created in the console
    TagResolution(String),

    /// A remote read failed; the affected cache entry must be invalidated
    RemoteFetch(String),

    /// A remote mutation failed; the cache is left ahead of the console
    RemoteWrite(String),

    /// Event transport errors; fatal to the subscribe loop
    Transport(String),

    /// HTTP client errors from the console or pxGrid sessions
    Http(reqwest::Error),

    /// JSON serialization/deserialization errors
    Json(serde_json::Error),

    /// System I/O errors (certificate files, etc.)
    Io(std::io::Error),

    /// TLS setup errors
    Tls(native_tls::Error),
}

impl fmt::Display for SgtSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SgtSyncError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SgtSyncError::RateExceeded(rate) => {
                write!(f, "Console call rate exceeded: {:.1}/s", rate)
            }
            SgtSyncError::TagResolution(msg) => write!(f, "Tag resolution error: {}", msg),
            SgtSyncError::RemoteFetch(msg) => write!(f, "Remote fetch error: {}", msg),
            SgtSyncError::RemoteWrite(msg) => write!(f, "Remote write error: {}", msg),
            SgtSyncError::Transport(msg) => write!(f, "Transport error: {}", msg),
            SgtSyncError::Http(err) => write!(f, "HTTP error: {}", err),
            SgtSyncError::Json(err) => write!(f, "JSON error: {}", err),
            SgtSyncError::Io(err) => write!(f, "I/O error: {}", err),
            SgtSyncError::Tls(err) => write!(f, "TLS error: {}", err),
        }
    }
}

impl std::error::Error for SgtSyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SgtSyncError::Http(err) => Some(err),
            SgtSyncError::Json(err) => Some(err),
            SgtSyncError::Io(err) => Some(err),
            SgtSyncError::Tls(err) => Some(err),
            _ => None,
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, SgtSyncError>;

impl SgtSyncError {
    /// Only transport failures terminate the subscribe loop; everything else
    /// is reported and recovered by convergence on a later event or sweep.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SgtSyncError::Transport(_))
    }
}

// Conversions from common error types
impl From<reqwest::Error> for SgtSyncError {
    fn from(err: reqwest::Error) -> Self {
        SgtSyncError::Http(err)
    }
}

impl From<serde_json::Error> for SgtSyncError {
    fn from(err: serde_json::Error) -> Self {
        SgtSyncError::Json(err)
    }
}

impl From<std::io::Error> for SgtSyncError {
    fn from(err: std::io::Error) -> Self {
        SgtSyncError::Io(err)
    }
}

impl From<native_tls::Error> for SgtSyncError {
    fn from(err: native_tls::Error) -> Self {
        SgtSyncError::Tls(err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SgtSyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SgtSyncError::Transport(err.to_string())
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::SgtSyncError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::SgtSyncError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::SgtSyncError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::SgtSyncError::Transport(format!($fmt, $($arg)*))
    };
}
