use thiserror::Error;

use crate::types::{PartitionId, ReplicaIndex};

/// Convenience alias for `Result<T, ReefError>`.
pub type ReefResult<T> = Result<T, ReefError>;

/// Failure classification for retry decisions.
///
/// - `Domain`    — the server answered; the answer is the outcome (key missing,
///   CAS mismatch). Never retried.
/// - `Retryable` — topology moved under the operation; retry immediately once
///   a fresher map is installed.
/// - `Transient` — resource pressure or a lost connection; retry under the
///   caller's deadline with back-off.
/// - `Fatal`     — credentials, protocol faults, caller bugs. Never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Domain,
    Retryable,
    Transient,
    Fatal,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum ReefError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("KV error: {0}")]
    Kv(#[from] KvError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl ReefError {
    /// Classify this error for the retry supervisor.
    pub fn kind(&self) -> FailureKind {
        match self {
            ReefError::Transport(e) => e.kind(),
            ReefError::Protocol(_) => FailureKind::Fatal,
            ReefError::Handshake(_) => FailureKind::Fatal,
            ReefError::Routing(e) => e.kind(),
            ReefError::Kv(e) => e.kind(),
            ReefError::Query(e) => e.kind(),
            ReefError::InvalidConfig(_) | ReefError::InvalidArgument(_) => FailureKind::Fatal,
        }
    }

    /// Shorthand used at every deadline expiry site.
    pub fn timeout() -> Self {
        ReefError::Transport(TransportError::Timeout)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ReefError::Transport(TransportError::Timeout))
    }
}

/// Socket- and framing-level failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Deadline exceeded")]
    Timeout,

    #[error("TLS failure: {0}")]
    TlsFailure(String),

    #[error("No connection available before the deadline")]
    NoCapacity,

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::Timeout => FailureKind::Fatal,
            TransportError::TlsFailure(_) => FailureKind::Fatal,
            TransportError::FrameTooLarge { .. } => FailureKind::Fatal,
            TransportError::ConnectionLost(_)
            | TransportError::NoCapacity
            | TransportError::Io(_) => FailureKind::Transient,
        }
    }
}

/// Wire-format violations observed on an established connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Protocol violation: {0}")]
    Violation(String),

    #[error("Response carried an opaque with no pending request: 0x{0:08x}")]
    UnexpectedOpaque(u32),

    #[error("Bad magic byte: 0x{0:02x}")]
    BadMagic(u8),
}

/// Failures during connection bring-up. Fatal for the connection; a handshake
/// is never retried with the same credentials.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Server does not support required feature: {0}")]
    FeatureUnsupported(String),
}

/// Failures locating the owner of a partition.
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("No cluster map available")]
    NoMap,

    #[error("No node for partition {partition} replica {replica}")]
    NoNode {
        partition: PartitionId,
        replica: ReplicaIndex,
    },

    /// The server no longer owns the partition. May carry a fresher config
    /// blob embedded in the response body.
    #[error("Partition ownership moved (embedded config: {})", .config.is_some())]
    NotMyPartition { config: Option<Vec<u8>> },
}

impl RoutingError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RoutingError::NoMap => FailureKind::Transient,
            RoutingError::NoNode { .. } => FailureKind::Retryable,
            RoutingError::NotMyPartition { .. } => FailureKind::Retryable,
        }
    }
}

/// Domain outcomes reported by the data service. Surfaced to the caller
/// unchanged except for the pressure statuses, which are retried.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("Key not found")]
    KeyNotFound,

    #[error("Key already exists")]
    KeyExists,

    #[error("CAS mismatch")]
    CasMismatch,

    #[error("Delta operation on a non-numeric value")]
    DeltaBadVal,

    #[error("Value too large")]
    TooBig,

    #[error("Document is locked")]
    Locked,

    #[error("Server temporarily out of resources")]
    TmpFail,

    #[error("Server busy")]
    ServerBusy,

    #[error("Server out of memory")]
    OutOfMemory,

    #[error("Access denied")]
    AccessDenied,

    #[error("Unknown status 0x{status:04x}{}", .context.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Unknown {
        status: u16,
        /// Extended error context, present when the feature was negotiated.
        context: Option<String>,
    },
}

impl KvError {
    pub fn kind(&self) -> FailureKind {
        match self {
            KvError::TmpFail | KvError::ServerBusy | KvError::OutOfMemory => {
                FailureKind::Transient
            }
            KvError::AccessDenied => FailureKind::Fatal,
            KvError::Unknown { .. } => FailureKind::Fatal,
            _ => FailureKind::Domain,
        }
    }
}

/// Failures in the HTTP query plane and the streaming row reader.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("HTTP status {code}: {body}")]
    HttpStatus { code: u16, body: String },

    #[error("Row stream was already consumed")]
    StreamAlreadyRead,

    #[error("Metadata requested before the row stream was drained")]
    StreamNotDrained,

    #[error("Malformed response body: {0}")]
    ParseError(String),

    #[error("HTTP transport error: {0}")]
    Http(String),
}

impl QueryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            QueryError::Http(_) => FailureKind::Transient,
            // Retryability of an HTTP status depends on the body; the query
            // executor consults the classification table before mapping here.
            _ => FailureKind::Fatal,
        }
    }
}
