//! Well-known resources for local development.

use chrono::{TimeZone, Utc};
use tracing::{info, instrument};

use crate::errors::StorageResult;
use crate::resource::{BellResource, ResourceStatus};
use crate::storage::{ResourceScope, ResourceStorage};
use crate::types::{DurationMillis, ResourceId};

const SAMPLE_DURATION_MS: u64 = 1000;

fn sample(digit: char) -> BellResource {
    let block = |len: usize| std::iter::repeat(digit).take(len).collect::<String>();
    let token = format!(
        "{}-{}-{}-{}-{}",
        block(8),
        block(4),
        block(4),
        block(4),
        block(12)
    );
    let id = ResourceId::try_new(token).expect("repeated hex digit should be a valid resource id");
    let duration =
        DurationMillis::try_new(SAMPLE_DURATION_MS).expect("sample duration should be positive");
    let not_before = (digit == '5').then(|| {
        Utc.with_ymd_and_hms(9999, 12, 31, 0, 0, 0)
            .single()
            .expect("year 9999 should be representable")
    });

    BellResource::new(duration, not_before, None)
        .expect("open-ended window should be valid")
        .with_id(id)
}

/// The six sample resources, keyed `00000000-…` through `55555555-…`.
///
/// | key | kind |
/// |---|---|
/// | `0000…` | plain |
/// | `1111…` | sticky |
/// | `2222…` | api |
/// | `3333…` | sticky and api |
/// | `4444…` | already used |
/// | `5555…` | not valid before year 9999 |
pub fn sample_resources() -> Vec<BellResource> {
    vec![
        sample('0'),
        sample('1').with_sticky(true),
        sample('2').with_api(true),
        sample('3').with_sticky(true).with_api(true),
        sample('4')
            .with_status(ResourceStatus::Used)
            .expect("used is a settable status"),
        sample('5'),
    ]
}

/// Installs the sample resources, overwriting any that already exist.
#[instrument(name = "samples.seed", skip(storage))]
pub async fn seed_sample_resources<S: ResourceStorage>(storage: &S) -> StorageResult<()> {
    for resource in sample_resources() {
        let id = resource.id().clone();
        let mut scope = storage.scoped_resource(&id).await?;
        if scope.resource().is_some() {
            let _ = scope.replace(resource);
            scope.commit().await?;
        } else {
            drop(scope);
            storage.create_resource(resource).await?;
        }
    }

    info!("[samples.seed] sample resources installed");
    Ok(())
}
