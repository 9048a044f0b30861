//! `maruberu` - one-time and reusable tokens that ring a physical bell
//!
//! A token holder asks for the bell; the token's [`BellResource`] checks its
//! lifecycle and validity window and hands itself to the single-slot
//! [`MaruBell`] queue. A dedicated worker runs the ring through an
//! [`Actuator`] and records success or failure back to storage.
//!
//! Storage backends live in sibling crates and implement
//! [`ResourceStorage`]; every read-modify-write of a resource goes through a
//! [`ResourceScope`] holding that key's exclusive lock.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod actuator;
pub mod bell;
pub mod config;
pub mod errors;
pub mod resource;
pub mod samples;
pub mod storage;
pub mod types;

pub use actuator::{Actuator, CommandActuator};
pub use bell::{Bell, BellWorker, MaruBell};
pub use config::{BellConfig, DatabaseAddress, StorageKind};
pub use errors::{
    ActuatorError, BellError, ConfigError, Operation, ResourceError, ResourceResult,
    StorageError, StorageResult,
};
pub use resource::{BellResource, ResourceStatus, FAILURE_ALERT_THRESHOLD};
pub use samples::{sample_resources, seed_sample_resources};
pub use storage::{page_newest_first, ResourceScope, ResourceStorage};
pub use types::{DurationMillis, ResourceId};
