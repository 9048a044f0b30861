//! The bell resource and its lifecycle state machine.
//!
//! A [`BellResource`] is the permission record behind one token. It moves
//! through three states:
//!
//! ```text
//!   Unused ──ring()──► Using ──success()──► Unused   (sticky and still within period)
//!                        │                  Used     (otherwise)
//!                        └────fail()──────► Unused   (still within period)
//!                                           Used     (otherwise)
//! ```
//!
//! `Used` is terminal. Whether a token may ring also depends on its validity
//! window, which is judged against the wall clock and cached on the value
//! until [`BellResource::clear_validation_cache`] is called. Storage
//! backends clear the cache whenever a resource crosses a load or save
//! boundary, and `success()`/`fail()` always judge the window afresh.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::bell::Bell;
use crate::errors::{ResourceError, ResourceResult};
use crate::types::{DurationMillis, ResourceId};

/// Consecutive failures after which a diagnostic event is emitted.
pub const FAILURE_ALERT_THRESHOLD: u32 = 3;

/// Lifecycle status of a bell resource.
///
/// * `Undefined`: guard value, never stored or reachable through the API
/// * `Unused`: free and available
/// * `Using`: the bell is ringing for it (becomes free again if *sticky*)
/// * `Used`: free but no longer available
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    /// Guard value.
    #[default]
    #[serde(skip)]
    Undefined,
    /// Free and available.
    Unused,
    /// Actuation in flight.
    Using,
    /// Permanently retired.
    Used,
}

/// Result of judging a validity window against the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PeriodCheck {
    before: bool,
    after: bool,
}

impl PeriodCheck {
    fn evaluate(
        not_before: Option<DateTime<Utc>>,
        not_after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            before: not_before.is_some_and(|not_before| now < not_before),
            after: not_after.is_some_and(|not_after| not_after < now),
        }
    }
}

/// A token that may ring the bell for a fixed duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ResourceRecord", into = "ResourceRecord")]
pub struct BellResource {
    id: ResourceId,
    duration: DurationMillis,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
    sticky: bool,
    api: bool,
    status: ResourceStatus,
    failed_count: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    // never persisted
    period: OnceLock<PeriodCheck>,
}

impl BellResource {
    /// Creates an unused, non-sticky resource with a random id.
    ///
    /// Fails with [`ResourceError::InvalidPeriod`] if both bounds are given
    /// and `not_before` is later than `not_after`.
    pub fn new(
        duration: DurationMillis,
        not_before: Option<DateTime<Utc>>,
        not_after: Option<DateTime<Utc>>,
    ) -> ResourceResult<Self> {
        check_period(not_before, not_after)?;

        let now = Utc::now();
        Ok(Self {
            id: ResourceId::generate(),
            duration,
            not_before,
            not_after,
            sticky: false,
            api: false,
            status: ResourceStatus::Unused,
            failed_count: 0,
            created_at: now,
            updated_at: now,
            period: OnceLock::new(),
        })
    }

    /// Replaces the generated id.
    #[must_use]
    pub fn with_id(mut self, id: ResourceId) -> Self {
        self.id = id;
        self
    }

    /// Makes the resource reusable after a successful ring.
    #[must_use]
    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }

    /// Marks the resource as used by API clients rather than browsers.
    #[must_use]
    pub fn with_api(mut self, api: bool) -> Self {
        self.api = api;
        self
    }

    /// Overrides the initial status.
    ///
    /// `Undefined` is only a guard value and is refused with
    /// [`ResourceError::InvalidOperation`].
    pub fn with_status(mut self, status: ResourceStatus) -> ResourceResult<Self> {
        if status == ResourceStatus::Undefined {
            return Err(ResourceError::InvalidOperation);
        }
        self.status = status;
        Ok(self)
    }

    /// Overrides the failure counter.
    #[must_use]
    pub fn with_failed_count(mut self, failed_count: u32) -> Self {
        self.failed_count = failed_count;
        self
    }

    /// Overrides the creation time.
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// The token of this resource.
    pub const fn id(&self) -> &ResourceId {
        &self.id
    }

    /// How long the bell rings.
    pub const fn duration(&self) -> DurationMillis {
        self.duration
    }

    /// Start of the validity window, if bounded.
    pub const fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    /// End of the validity window, if bounded.
    pub const fn not_after(&self) -> Option<DateTime<Utc>> {
        self.not_after
    }

    /// Whether a successful ring leaves the resource reusable.
    pub const fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// Whether the resource is meant for API clients.
    pub const fn is_api(&self) -> bool {
        self.api
    }

    /// Current lifecycle status.
    pub const fn status(&self) -> ResourceStatus {
        self.status
    }

    /// Failures since the last successful ring.
    pub const fn failed_count(&self) -> u32 {
        self.failed_count
    }

    /// When the resource was created.
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the resource last changed state.
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn period(&self) -> PeriodCheck {
        *self
            .period
            .get_or_init(|| PeriodCheck::evaluate(self.not_before, self.not_after, Utc::now()))
    }

    /// Forgets the cached validity window check.
    ///
    /// The next period query judges the window against the clock again.
    pub fn clear_validation_cache(&mut self) {
        self.period = OnceLock::new();
    }

    /// True if the validity window has not started yet.
    pub fn is_before_period(&self) -> bool {
        self.period().before
    }

    /// True if the validity window has ended.
    pub fn is_after_period(&self) -> bool {
        self.period().after
    }

    /// True if the clock is inside the validity window.
    pub fn is_within_period(&self) -> bool {
        !self.is_before_period() && !self.is_after_period()
    }

    /// True if the resource is free and available.
    pub fn is_unused(&self) -> bool {
        self.status == ResourceStatus::Unused
    }

    /// True if the bell is ringing for this resource.
    pub fn is_using(&self) -> bool {
        self.status == ResourceStatus::Using
    }

    /// True if the resource is no longer available.
    pub fn is_used(&self) -> bool {
        self.status == ResourceStatus::Used
    }

    /// True if the resource may ring right now.
    pub fn is_valid(&self) -> bool {
        self.is_within_period() && self.is_unused()
    }

    /// Hands this resource to the bell and marks it as in use.
    ///
    /// Rejections are checked in a fixed order: not yet valid, then expired
    /// or used, then already ringing. If the bell refuses the hand-off (for
    /// example with [`ResourceError::Busy`]) the status is left untouched.
    pub fn ring<B: Bell + ?Sized>(&mut self, bell: &B) -> ResourceResult<()> {
        if self.is_before_period() {
            return Err(ResourceError::BeforePeriod);
        }
        if self.is_after_period() || self.is_used() {
            return Err(ResourceError::Disabled);
        }
        if self.is_using() {
            return Err(ResourceError::InUse);
        }
        if !self.is_valid() {
            return Err(ResourceError::InvalidOperation);
        }

        bell.ring(self)?;
        self.transition(ResourceStatus::Using);
        Ok(())
    }

    /// Records a successful ring.
    pub fn success(&mut self) -> ResourceResult<()> {
        if !self.is_using() {
            return Err(ResourceError::InvalidOperation);
        }

        self.clear_validation_cache();
        self.failed_count = 0;
        if self.sticky && self.is_within_period() {
            self.transition(ResourceStatus::Unused);
        } else {
            self.transition(ResourceStatus::Used);
        }
        Ok(())
    }

    /// Records a failed ring.
    ///
    /// A failed resource stays retryable while its window is open,
    /// regardless of stickiness.
    pub fn fail(&mut self) -> ResourceResult<()> {
        if !self.is_using() {
            return Err(ResourceError::InvalidOperation);
        }

        self.clear_validation_cache();
        self.failed_count = self.failed_count.saturating_add(1);
        if self.is_within_period() {
            self.transition(ResourceStatus::Unused);
        } else {
            self.transition(ResourceStatus::Used);
        }

        if self.failed_count >= FAILURE_ALERT_THRESHOLD {
            error!(
                resource = %self.id,
                failed_count = self.failed_count,
                "[resource.repeated_failure] resource {} failed {} times",
                self.id,
                self.failed_count
            );
        }
        Ok(())
    }

    fn transition(&mut self, status: ResourceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

fn check_period(
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
) -> ResourceResult<()> {
    match (not_before, not_after) {
        (Some(not_before), Some(not_after)) if not_before > not_after => {
            Err(ResourceError::InvalidPeriod {
                not_before,
                not_after,
            })
        }
        _ => Ok(()),
    }
}

impl PartialEq for BellResource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.duration == other.duration
            && self.not_before == other.not_before
            && self.not_after == other.not_after
            && self.sticky == other.sticky
            && self.api == other.api
            && self.status == other.status
            && self.failed_count == other.failed_count
            && self.created_at == other.created_at
            && self.updated_at == other.updated_at
    }
}

impl Eq for BellResource {}

/// Flat persisted form of a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResourceRecord {
    uuid: ResourceId,
    milliseconds: DurationMillis,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
    #[serde(default)]
    sticky: bool,
    #[serde(default)]
    api: bool,
    status: ResourceStatus,
    #[serde(default)]
    failed_count: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ResourceRecord> for BellResource {
    type Error = ResourceError;

    fn try_from(record: ResourceRecord) -> Result<Self, Self::Error> {
        check_period(record.not_before, record.not_after)?;

        Ok(Self {
            id: record.uuid,
            duration: record.milliseconds,
            not_before: record.not_before,
            not_after: record.not_after,
            sticky: record.sticky,
            api: record.api,
            status: record.status,
            failed_count: record.failed_count,
            created_at: record.created_at,
            updated_at: record.updated_at,
            period: OnceLock::new(),
        })
    }
}

impl From<BellResource> for ResourceRecord {
    fn from(resource: BellResource) -> Self {
        Self {
            uuid: resource.id,
            milliseconds: resource.duration,
            not_before: resource.not_before,
            not_after: resource.not_after,
            sticky: resource.sticky,
            api: resource.api,
            status: resource.status,
            failed_count: resource.failed_count,
            created_at: resource.created_at,
            updated_at: resource.updated_at,
        }
    }
}
