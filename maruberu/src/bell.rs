//! The bell queue and its worker.
//!
//! There is one physical bell, so at most one ring may be in flight. A ring
//! request occupies the single slot from the moment it is accepted until its
//! outcome has been written back to storage; any ring attempted meanwhile is
//! refused with [`ResourceError::Busy`] instead of being buffered.
//!
//! ```text
//!  request task                         worker task
//!  ────────────                         ───────────
//!  scope = storage.scoped_resource(id)
//!  resource.ring(&bell) ──► slot + queue ──► actuator.actuate(duration)
//!  scope.commit()   (Using)                 scope = storage.scoped_resource(id)
//!                                           resource.success() | resource.fail()
//!                                           scope.commit()
//!                                           slot released
//! ```
//!
//! The worker reloads the resource through its own scope instead of using the
//! queued snapshot, so the outcome is judged against the stored state and the
//! current clock.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::actuator::Actuator;
use crate::errors::{BellError, ResourceError, ResourceResult};
use crate::resource::BellResource;
use crate::storage::{ResourceScope, ResourceStorage};
use crate::types::ResourceId;

/// Accepts resources that want to ring.
///
/// `ring` must not block: it either accepts the hand-off or fails at once.
pub trait Bell: Send + Sync {
    /// Queues `resource` for actuation.
    fn ring(&self, resource: &BellResource) -> ResourceResult<()>;
}

enum BellMessage {
    Ring {
        resource: BellResource,
        slot: OwnedSemaphorePermit,
    },
    Shutdown,
}

/// Single-slot bell queue backed by a dedicated worker task.
///
/// Cloning shares the same queue and slot.
#[derive(Debug, Clone)]
pub struct MaruBell {
    sender: mpsc::Sender<BellMessage>,
    slot: Arc<Semaphore>,
}

impl MaruBell {
    /// Creates the queue and the worker that drains it.
    ///
    /// The worker does nothing until [`BellWorker::run`] is polled, usually
    /// on its own task.
    pub fn new<S, A>(storage: S, actuator: A) -> (Self, BellWorker<S>)
    where
        S: ResourceStorage,
        A: Actuator + 'static,
    {
        let (sender, receiver) = mpsc::channel(1);
        let bell = Self {
            sender,
            slot: Arc::new(Semaphore::new(1)),
        };
        let worker = BellWorker {
            receiver,
            striker: Striker {
                storage,
                actuator: Arc::new(actuator),
            },
        };
        (bell, worker)
    }

    /// Creates the queue and spawns its worker on the current tokio runtime.
    pub fn spawn<S, A>(storage: S, actuator: A) -> (Self, JoinHandle<()>)
    where
        S: ResourceStorage + 'static,
        A: Actuator + 'static,
    {
        let (bell, worker) = Self::new(storage, actuator);
        let handle = tokio::spawn(worker.run());
        (bell, handle)
    }

    /// True if no ring is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.slot.available_permits() == 1
    }

    /// Asks the worker to stop.
    ///
    /// Waits for room in the queue; a ring already in flight completes and
    /// has its outcome recorded before the worker exits.
    pub async fn shutdown(&self) {
        if self.sender.send(BellMessage::Shutdown).await.is_err() {
            debug!("[bell.shutdown] worker already stopped");
        }
    }
}

impl Bell for MaruBell {
    #[instrument(name = "bell.enqueue", skip(self, resource), fields(resource = %resource.id()))]
    fn ring(&self, resource: &BellResource) -> ResourceResult<()> {
        let slot = Arc::clone(&self.slot)
            .try_acquire_owned()
            .map_err(|_| ResourceError::Busy)?;

        self.sender
            .try_send(BellMessage::Ring {
                resource: resource.clone(),
                slot,
            })
            .map_err(|error| match error {
                TrySendError::Full(_) => ResourceError::Busy,
                TrySendError::Closed(_) => {
                    warn!("[bell.enqueue] worker has stopped, refusing ring");
                    ResourceError::Busy
                }
            })
    }
}

/// Long-lived task that performs queued rings one at a time.
pub struct BellWorker<S> {
    receiver: mpsc::Receiver<BellMessage>,
    striker: Striker<S>,
}

impl<S: ResourceStorage> BellWorker<S> {
    /// Drains the queue until a shutdown request arrives or every
    /// [`MaruBell`] handle has been dropped.
    pub async fn run(mut self) {
        info!("[bell.worker] started");

        while let Some(message) = self.receiver.recv().await {
            match message {
                BellMessage::Shutdown => break,
                BellMessage::Ring { resource, slot } => {
                    self.striker.strike(&resource).await;
                    drop(slot);
                }
            }
        }

        info!("[bell.worker] stopped");
    }
}

struct Striker<S> {
    storage: S,
    actuator: Arc<dyn Actuator>,
}

impl<S: ResourceStorage> Striker<S> {
    #[instrument(
        name = "bell.ring",
        skip(self, resource),
        fields(resource = %resource.id(), duration_ms = %resource.duration())
    )]
    async fn strike(&self, resource: &BellResource) {
        let succeeded = match self.actuator.actuate(resource.duration()).await {
            Ok(()) => true,
            Err(error) => {
                warn!(error = %error, "[bell.actuate] ring failed");
                false
            }
        };

        if let Err(error) = self.record_outcome(resource.id(), succeeded).await {
            error!(
                resource = %resource.id(),
                succeeded,
                error = %error,
                "[bell.write_back] could not record ring outcome, resource stays in use"
            );
        }
    }

    async fn record_outcome(&self, id: &ResourceId, succeeded: bool) -> Result<(), BellError> {
        let mut scope = self.storage.scoped_resource(id).await?;
        let resource = scope
            .resource_mut()
            .ok_or_else(|| BellError::Vanished(id.clone()))?;

        if succeeded {
            resource.success()?;
        } else {
            resource.fail()?;
        }
        debug!(
            status = ?resource.status(),
            failed_count = resource.failed_count(),
            "[bell.write_back] recording outcome"
        );

        scope.commit().await?;
        Ok(())
    }
}
