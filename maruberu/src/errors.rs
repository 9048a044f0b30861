//! Error types for maruberu.
//!
//! The error design separates the failures a caller is expected to handle
//! (a token rung too early, a busy bell, a missing key) from infrastructure
//! failures of a storage backend or the actuator process.
//!
//! # Error Categories
//!
//! - **ResourceError**: state machine and bell admission failures
//! - **StorageError**: persistence and per-key locking failures
//! - **ActuatorError**: the external ring command could not run or failed
//! - **BellError**: the worker could not write an outcome back (logged only)
//! - **ConfigError**: malformed configuration values
//!
//! # Example Usage
//!
//! ```rust,ignore
//! match resource.ring(&bell) {
//!     Ok(()) => render_ringing(&resource),
//!     Err(ResourceError::Busy) => render_retry_later(),
//!     Err(error) => render_rejected(&error.to_string()),
//! }
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::ResourceId;

/// Errors raised by the resource state machine and the bell queue.
///
/// Every variant except `InvalidPeriod` is an expected outcome of a ring
/// attempt and carries a fixed message suitable for showing to the token
/// holder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// The validity window has not started yet.
    #[error("this token is not valid yet")]
    BeforePeriod,

    /// The validity window has ended or the token was already used.
    #[error("this token has already been used")]
    Disabled,

    /// The token is currently ringing the bell.
    #[error("the same token cannot be used concurrently")]
    InUse,

    /// Another token occupies the bell right now.
    #[error("the bell is busy")]
    Busy,

    /// The bell refuses rings. Reserved: no code path raises it yet.
    #[error("the bell is not ready to ring")]
    Forbidden,

    /// The operation is not legal from the current status.
    #[error("invalid resource operation")]
    InvalidOperation,

    /// `not_before` is later than `not_after`.
    #[error("expected not_before <= not_after, but {not_before} > {not_after}")]
    InvalidPeriod {
        /// Start of the rejected window
        not_before: DateTime<Utc>,
        /// End of the rejected window
        not_after: DateTime<Utc>,
    },
}

/// Identifies the storage operation that failed.
///
/// Used by `StorageError::StoreFailure` to name which backend operation
/// encountered an infrastructure failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Acquiring the per-key lock or lease.
    AcquireLock,
    /// Releasing the per-key lock without writing.
    ReleaseLock,
    /// Loading a resource record.
    LoadResource,
    /// Writing a resource record back.
    SaveResource,
    /// Inserting a new resource record.
    CreateResource,
    /// Removing a resource record.
    DeleteResource,
    /// Reading the resource listing.
    ListResources,
    /// Beginning a database transaction.
    BeginTransaction,
    /// Committing a database transaction.
    CommitTransaction,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AcquireLock => write!(f, "acquire_lock"),
            Self::ReleaseLock => write!(f, "release_lock"),
            Self::LoadResource => write!(f, "load_resource"),
            Self::SaveResource => write!(f, "save_resource"),
            Self::CreateResource => write!(f, "create_resource"),
            Self::DeleteResource => write!(f, "delete_resource"),
            Self::ListResources => write!(f, "list_resources"),
            Self::BeginTransaction => write!(f, "begin_transaction"),
            Self::CommitTransaction => write!(f, "commit_transaction"),
        }
    }
}

/// Errors returned by storage backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// A resource with this key is already stored.
    #[error("resource {0} already exists")]
    AlreadyExists(ResourceId),

    /// No resource is stored under this key.
    #[error("resource {0} not found")]
    NotFound(ResourceId),

    /// The resource could not be encoded for the backend.
    #[error("failed to serialize resource {id}: {detail}")]
    Serialization {
        /// Key of the resource
        id: ResourceId,
        /// Encoder message
        detail: String,
    },

    /// A stored record could not be decoded into a resource.
    #[error("failed to deserialize resource {id}: {detail}")]
    Deserialization {
        /// Key of the resource
        id: ResourceId,
        /// Decoder message
        detail: String,
    },

    /// The per-key lease could not be obtained in time.
    #[error("timed out after {waited:?} waiting for the lock on resource {id}")]
    LeaseTimeout {
        /// Key of the resource
        id: ResourceId,
        /// How long the caller waited
        waited: Duration,
    },

    /// Infrastructure failure surfaced by the backing store.
    #[error("{operation} operation failed")]
    StoreFailure {
        /// The failing operation
        operation: Operation,
    },
}

/// Errors raised when the external actuator does not ring successfully.
#[derive(Debug, Error)]
pub enum ActuatorError {
    /// The ring command could not be started.
    #[error("failed to launch ring command: {0}")]
    Launch(#[from] std::io::Error),

    /// The ring command ran but exited unsuccessfully.
    #[error("ring command exited with status {}", display_code(.code))]
    ExitStatus {
        /// Exit code, `None` if terminated by a signal
        code: Option<i32>,
    },
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |code| code.to_string())
}

/// Failures of the bell worker while reporting an actuation outcome.
///
/// The worker never returns these to a caller; they are logged and the
/// queued item is dropped, leaving the resource in `Using`.
#[derive(Debug, Error)]
pub enum BellError {
    /// Storage refused the scoped load or the write back.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The reloaded resource could not take the outcome transition.
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    /// The resource was deleted while the bell was ringing for it.
    #[error("resource {0} vanished before its outcome was recorded")]
    Vanished(ResourceId),
}

/// Configuration values that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The database address is not `(user:pass@)host:port/dbname`.
    #[error("{0} is not in database address format (user:pass@)host:port/dbname")]
    InvalidDatabaseAddress(String),
}

/// Type alias for state machine results
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Type alias for storage results
pub type StorageResult<T> = Result<T, StorageError>;
