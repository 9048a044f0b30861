//! Test doubles for the bell and the actuator.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use maruberu::{Actuator, ActuatorError, Bell, BellResource, DurationMillis, ResourceResult};
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};

/// Bell that accepts every hand-off without doing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptingBell;

impl Bell for AcceptingBell {
    fn ring(&self, _resource: &BellResource) -> ResourceResult<()> {
        Ok(())
    }
}

/// Outcome a [`ScriptedActuator`] reports for one ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The ring command exits with status zero.
    Success,
    /// The ring command exits with status one.
    Failure,
}

#[derive(Debug)]
struct Script {
    outcomes: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    durations: Mutex<Vec<DurationMillis>>,
    calls: watch::Sender<usize>,
    gate: Option<Arc<Semaphore>>,
}

/// Actuator that replays a fixed list of outcomes.
///
/// Once the list is exhausted every further ring reports the fallback
/// outcome. Clones share the same script and call log.
#[derive(Debug, Clone)]
pub struct ScriptedActuator {
    script: Arc<Script>,
}

/// Holds a gated [`ScriptedActuator`] inside its ring until opened.
#[derive(Debug, Clone)]
pub struct ActuatorGate {
    permits: Arc<Semaphore>,
}

impl ActuatorGate {
    /// Lets `rings` pending or future rings finish.
    pub fn open(&self, rings: usize) {
        self.permits.add_permits(rings);
    }
}

impl ScriptedActuator {
    fn build(outcomes: VecDeque<Outcome>, fallback: Outcome, gate: Option<Arc<Semaphore>>) -> Self {
        let (calls, _) = watch::channel(0);
        Self {
            script: Arc::new(Script {
                outcomes: Mutex::new(outcomes),
                fallback,
                durations: Mutex::new(Vec::new()),
                calls,
                gate,
            }),
        }
    }

    /// Every ring succeeds.
    pub fn succeeding() -> Self {
        Self::build(VecDeque::new(), Outcome::Success, None)
    }

    /// Every ring fails.
    pub fn failing() -> Self {
        Self::build(VecDeque::new(), Outcome::Failure, None)
    }

    /// Rings report `outcomes` in order, then succeed.
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        Self::build(outcomes.into_iter().collect(), Outcome::Success, None)
    }

    /// Every ring succeeds, but only once the returned gate lets it finish.
    pub fn gated() -> (Self, ActuatorGate) {
        let permits = Arc::new(Semaphore::new(0));
        let actuator = Self::build(VecDeque::new(), Outcome::Success, Some(Arc::clone(&permits)));
        (actuator, ActuatorGate { permits })
    }

    /// Number of rings started so far.
    pub fn call_count(&self) -> usize {
        *self.script.calls.borrow()
    }

    /// Durations of every ring started so far, oldest first.
    pub fn durations(&self) -> Vec<DurationMillis> {
        self.script.durations.lock().clone()
    }

    /// Waits until at least `count` rings have started.
    pub async fn wait_for_calls(&self, count: usize) {
        let mut calls = self.script.calls.subscribe();
        let _ = calls.wait_for(|started| *started >= count).await;
    }
}

#[async_trait]
impl Actuator for ScriptedActuator {
    async fn actuate(&self, duration: DurationMillis) -> Result<(), ActuatorError> {
        self.script.durations.lock().push(duration);
        self.script.calls.send_modify(|started| *started += 1);

        if let Some(gate) = &self.script.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let outcome = self
            .script
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or(self.script.fallback);
        match outcome {
            Outcome::Success => Ok(()),
            Outcome::Failure => Err(ActuatorError::ExitStatus { code: Some(1) }),
        }
    }
}
