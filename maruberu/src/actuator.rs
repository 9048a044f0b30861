//! The physical bell, driven by an external command.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::BellConfig;
use crate::errors::ActuatorError;
use crate::types::DurationMillis;

/// Something that can physically ring the bell.
///
/// `actuate` returns once the ring has finished. Any error is treated as a
/// failed ring by the bell worker.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Rings the bell for `duration`.
    async fn actuate(&self, duration: DurationMillis) -> Result<(), ActuatorError>;
}

/// Runs `<command> <duration_ms>` and waits for it to exit.
///
/// Exit status zero is a successful ring. Any other status, or a failure to
/// launch the process at all, is a failed ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandActuator {
    command: PathBuf,
}

impl CommandActuator {
    /// Creates an actuator for the given program.
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Creates an actuator for the configured ring command.
    pub fn from_config(config: &BellConfig) -> Self {
        Self::new(&config.ring_command)
    }

    /// The program that is run for each ring.
    pub fn command(&self) -> &Path {
        &self.command
    }
}

#[async_trait]
impl Actuator for CommandActuator {
    #[instrument(name = "actuator.command", skip(self), fields(command = %self.command.display()))]
    async fn actuate(&self, duration: DurationMillis) -> Result<(), ActuatorError> {
        let status = Command::new(&self.command)
            .arg(duration.to_string())
            .status()
            .await?;

        if status.success() {
            debug!("[actuator.command] ring command finished");
            Ok(())
        } else {
            Err(ActuatorError::ExitStatus {
                code: status.code(),
            })
        }
    }
}
