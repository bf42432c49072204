use thiserror::Error;
use tidemark_types::{GcnEventError, XidError};

/// Primary error type for tidemark operations.
///
/// Only protocol misuse, liveness stalls and collaborator failures surface
/// here. Undo corruption is reported through lookup statuses, never as an
/// error.
#[derive(Error, Debug)]
pub enum TidemarkError {
    // === Protocol misuse (SQL/XA boundary) ===
    /// External GCN is null or below the initial GCN.
    #[error("invalid GCN {gcn}: must be in [{min}, {max}]")]
    InvalidGcn { gcn: u64, min: u64, max: u64 },

    /// Branch counts are zero or inconsistent.
    #[error("invalid XA branch counts: n_global={n_global}, n_local={n_local}")]
    InvalidBranch { n_global: u64, n_local: u64 },

    /// More participants than a branch count can represent.
    #[error("too many XA participants: {requested} exceeds max {max}")]
    TooManyParticipants { requested: u64, max: u64 },

    /// The XID supplied does not match the transaction's XID.
    #[error("XID mismatch: {detail}")]
    XidMismatch { detail: String },

    /// The XID is malformed.
    #[error("invalid XID: {detail}")]
    InvalidXid { detail: String },

    // === Liveness ===
    /// DML rejected because the coordinator heartbeat timed out.
    #[error("operation blocked: no coordinator heartbeat for {elapsed_secs}s")]
    HeartbeatFreeze { elapsed_secs: u64 },

    // === Lifecycle ===
    /// A TXN slot was asked to move through an illegal state transition.
    #[error("illegal TXN slot transition {from} -> {to}")]
    InvalidSlotTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Rollback segment id does not exist.
    #[error("rollback segment {rseg_id} not found")]
    RsegNotFound { rseg_id: u8 },

    /// Rollback segment has no room for another undo segment.
    #[error("rollback segment {rseg_id} has no free undo segment space")]
    SegmentSpaceExhausted { rseg_id: u8 },

    /// Operation requires an active (not yet committed) transaction.
    #[error("transaction {trx_id} is not active")]
    TxnNotActive { trx_id: u64 },

    // === Wire formats ===
    /// Replication event payload shorter than its flags promise.
    #[error("GCN event truncated: need {needed} bytes, have {available}")]
    EventTruncated { needed: usize, available: usize },

    // === Configuration ===
    /// Configuration failed to parse or validate.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    // === Engine state ===
    /// The transaction system is shutting down or not yet started.
    #[error("transaction system is shut down")]
    ShuttingDown,

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal logic error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Numeric error codes reported across the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Internal logic error.
    Internal = 2,
    /// Bad argument from the caller.
    InvalidArgument = 21,
    /// Operation blocked waiting for an external party.
    Blocked = 40,
    /// Requested object does not exist.
    NotFound = 44,
    /// Object is in the wrong state for the request.
    WrongState = 45,
    /// Storage space exhausted.
    Full = 13,
    /// Malformed input bytes.
    Format = 24,
    /// Disk I/O error.
    IoErr = 10,
    /// Engine not running.
    Shutdown = 50,
}

impl TidemarkError {
    /// Map this error to its numeric code.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidGcn { .. }
            | Self::InvalidBranch { .. }
            | Self::TooManyParticipants { .. }
            | Self::XidMismatch { .. }
            | Self::InvalidXid { .. }
            | Self::InvalidConfig { .. } => ErrorCode::InvalidArgument,
            Self::HeartbeatFreeze { .. } => ErrorCode::Blocked,
            Self::InvalidSlotTransition { .. } | Self::TxnNotActive { .. } => {
                ErrorCode::WrongState
            }
            Self::RsegNotFound { .. } => ErrorCode::NotFound,
            Self::SegmentSpaceExhausted { .. } => ErrorCode::Full,
            Self::EventTruncated { .. } => ErrorCode::Format,
            Self::ShuttingDown => ErrorCode::Shutdown,
            Self::Io(_) => ErrorCode::IoErr,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the caller can fix the request and retry.
    pub const fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidGcn { .. }
                | Self::InvalidBranch { .. }
                | Self::TooManyParticipants { .. }
                | Self::XidMismatch { .. }
                | Self::InvalidXid { .. }
                | Self::HeartbeatFreeze { .. }
                | Self::InvalidConfig { .. }
        )
    }

    /// Get a human-readable suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::InvalidGcn { .. } => Some("Supply a GCN at or above the initial GCN"),
            Self::InvalidBranch { .. } | Self::TooManyParticipants { .. } => {
                Some("Branch counts must satisfy 0 < n_local <= n_global <= 65535")
            }
            Self::HeartbeatFreeze { .. } => {
                Some("Send a coordinator heartbeat or disable the heartbeat freeze")
            }
            Self::InvalidXid { .. } => Some("Keep gtrid and bqual within 64 bytes each"),
            Self::InvalidConfig { .. } => Some("Fix the configuration value and reload"),
            Self::SegmentSpaceExhausted { .. } => {
                Some("Let purge and erase reclaim segments, or add rollback segments")
            }
            _ => None,
        }
    }

    /// Whether waiting (without changing the request) may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::HeartbeatFreeze { .. } | Self::SegmentSpaceExhausted { .. }
        )
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// Create an XID mismatch error.
    pub fn xid_mismatch(detail: impl Into<String>) -> Self {
        Self::XidMismatch {
            detail: detail.into(),
        }
    }
}

impl From<GcnEventError> for TidemarkError {
    fn from(err: GcnEventError) -> Self {
        match err {
            GcnEventError::Truncated { needed, available } => {
                Self::EventTruncated { needed, available }
            }
        }
    }
}

impl From<XidError> for TidemarkError {
    fn from(err: XidError) -> Self {
        Self::InvalidXid {
            detail: err.to_string(),
        }
    }
}

/// Result type alias using `TidemarkError`.
pub type Result<T> = std::result::Result<T, TidemarkError>;
