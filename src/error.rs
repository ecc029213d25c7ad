use thiserror::Error;

/// Categorizes errors for caller decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be matched on without holding the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol error
    WebSocket,
    /// Gateway discovery failed
    Discovery,
    /// Connection or handshake did not complete in time
    ConnectionTimeout,
    /// Connection failed (refused, DNS, TLS, ...)
    ConnectionFailed,
    /// The server closed the session with a non-recoverable code
    FatalClose,
    /// Requested compression scheme is not supported
    CompressionUnsupported,
    /// Payload decompression failed
    Decompression,
    /// Programmer error (double connect, unresolved plan, ...)
    Usage,
    /// Other error
    Other,
}

/// Errors that can occur in gateway-shard-manager
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// `connect()` was called while the manager was already connected
    #[error("already connected")]
    AlreadyConnected,

    /// Gateway discovery call failed; fatal to `connect()`
    #[error("failed to get gateway information: {0}")]
    Discovery(String),

    /// Auto-sharding or auto-concurrency was requested but discovery did not
    /// return the required fields
    #[error("auto-sharding failed: {0}")]
    AutoShardingFailed(&'static str),

    /// The socket-open to ready window exceeded the configured deadline
    #[error("connection handshake timed out")]
    ConnectionTimeout,

    /// Connection failed before the WebSocket handshake completed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The server closed the session with a code that forbids reconnection
    #[error("fatal close code {code}: {reason}")]
    FatalClose { code: u16, reason: String },

    /// The configured compression scheme has no decoder
    #[error("{0} compression is not supported")]
    CompressionUnsupported(&'static str),

    /// Inbound frame decompression failed
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Heartbeat was not acknowledged within one interval
    #[error("heartbeat not acknowledged, session stalled")]
    HeartbeatStalled,

    /// Reconnect/resume attempt budget exhausted
    #[error("gave up after {attempts} {kind} attempts")]
    AttemptsExhausted { kind: &'static str, attempts: u32 },

    /// Operation requires a resolved sharding plan
    #[error("sharding plan is not resolved; call connect() first")]
    PlanUnresolved,

    /// Outbound payload serialization failed
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::Discovery(_) | Error::AutoShardingFailed(_) => ErrorKind::Discovery,
            Error::ConnectionTimeout => ErrorKind::ConnectionTimeout,
            Error::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Error::FatalClose { .. } => ErrorKind::FatalClose,
            Error::CompressionUnsupported(_) => ErrorKind::CompressionUnsupported,
            Error::Decompression(_) => ErrorKind::Decompression,
            Error::AlreadyConnected | Error::PlanUnresolved => ErrorKind::Usage,
            Error::HeartbeatStalled
            | Error::AttemptsExhausted { .. }
            | Error::Serialize(_) => ErrorKind::Other,
        }
    }
}
