// SPDX-License-Identifier: AGPL-3.0-or-later
//! Indexer cluster bundle push
//!
//! A push either moves the active bundle to the freshly validated one or
//! leaves the previously active bundle in place. The caller names the
//! generation it expects; a manager that has moved on refuses the push.

use backoff::backoff::Backoff;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::api::{BundleStatus, ManagementApi, Session};
use super::retry::{with_retry, RetryPolicy};
use crate::error::{FleetError, Result};
use crate::rolling::BatchPolicy;

/// Result of a bundle push
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum BundleOutcome {
    /// The validated bundle was already active
    Unchanged { checksum: String },
    Applied { previous: String, active: String },
}

impl BundleOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, BundleOutcome::Applied { .. })
    }
}

async fn status(
    api: &dyn ManagementApi,
    session: &Session,
    retry: &RetryPolicy,
) -> Result<BundleStatus> {
    with_retry(retry, "cluster info", || api.bundle_status(session)).await
}

async fn poll<F>(
    api: &dyn ManagementApi,
    session: &Session,
    policy: &BatchPolicy,
    retry: &RetryPolicy,
    done: F,
) -> Result<Option<BundleStatus>>
where
    F: Fn(&BundleStatus) -> bool,
{
    let attempts = policy.health_retries.max(1);
    for attempt in 1..=attempts {
        let status = status(api, session, retry).await?;
        if done(&status) {
            return Ok(Some(status));
        }
        if attempt < attempts {
            tokio::time::sleep(Duration::from_secs(policy.health_interval_secs)).await;
        }
    }
    Ok(None)
}

/// Send the apply request, retrying only while the manager shows it has not landed
async fn apply(
    api: &dyn ManagementApi,
    session: &Session,
    retry: &RetryPolicy,
    checksum: &str,
    expected: u64,
) -> Result<()> {
    let mut backoff = retry.backoff();
    loop {
        let error = match api.apply_bundle(session).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e),
        };

        let current = status(api, session, retry).await?;
        if current.active_checksum == checksum {
            info!(checksum, "Apply landed despite the failed reply");
            return Ok(());
        }
        if current.generation != expected {
            return Err(FleetError::StaleBundle {
                target: api.endpoint().to_string(),
                expected,
                actual: current.generation,
            });
        }

        let Some(delay) = backoff.next_backoff() else {
            return Err(error);
        };
        warn!(delay_ms = delay.as_millis() as u64, error = %error, "Retrying bundle apply");
        tokio::time::sleep(delay).await;
    }
}

/// Validate and apply the cluster manager's staged bundle
///
/// With `expected_generation` unset the generation read at the start of the
/// push is used, so the push still fails if the manager changes underneath.
/// Reads and validation are retried under `retry`; the apply itself is only
/// resent after the manager shows the previous request did not land.
#[instrument(skip_all, fields(endpoint = %api.endpoint(), expected = ?expected_generation))]
pub async fn push_bundle(
    api: &dyn ManagementApi,
    session: &Session,
    expected_generation: Option<u64>,
    policy: &BatchPolicy,
    retry: &RetryPolicy,
) -> Result<BundleOutcome> {
    let initial = status(api, session, retry).await?;
    let expected = expected_generation.unwrap_or(initial.generation);
    if initial.generation != expected {
        return Err(FleetError::StaleBundle {
            target: api.endpoint().to_string(),
            expected,
            actual: initial.generation,
        });
    }
    let previous = initial.active_checksum.clone();

    with_retry(retry, "validate bundle", || api.validate_bundle(session)).await?;
    let validated = poll(api, session, policy, retry, |status| {
        status.validated_ok.is_some()
            && status.validated_checksum.as_deref() == Some(status.latest_checksum.as_str())
    })
    .await?
    .ok_or_else(|| {
        FleetError::command(api.endpoint(), "validate bundle", "validation did not complete")
    })?;

    let checksum = validated.validated_checksum.clone().unwrap_or_default();
    if validated.validated_ok != Some(true) {
        return Err(FleetError::precondition(
            api.endpoint(),
            format!("bundle {} failed validation", checksum),
        ));
    }

    if checksum == previous {
        info!(checksum = %checksum, "Validated bundle already active");
        return Ok(BundleOutcome::Unchanged { checksum });
    }

    if validated.generation != expected {
        return Err(FleetError::StaleBundle {
            target: api.endpoint().to_string(),
            expected,
            actual: validated.generation,
        });
    }

    apply(api, session, retry, &checksum, expected).await?;
    let applied = poll(api, session, policy, retry, |status| {
        status.active_checksum == checksum
    })
    .await?;

    match applied {
        Some(_) => {
            info!(previous = %previous, active = %checksum, "Bundle applied");
            Ok(BundleOutcome::Applied {
                previous,
                active: checksum,
            })
        }
        None => {
            warn!(previous = %previous, wanted = %checksum, "Bundle apply did not take effect");
            Err(FleetError::command(
                api.endpoint(),
                "apply bundle",
                format!(
                    "active bundle is still {}; {} was not activated",
                    previous, checksum
                ),
            ))
        }
    }
}
