// SPDX-License-Identifier: AGPL-3.0-or-later
//! Day-2 operations over the Splunk management API
//!
//! Everything here runs after the enterprise unit has installed Splunk:
//! application users, cluster bundle pushes, search-head cluster restarts,
//! service control and `.conf` management with change analysis.

mod api;
mod bundle;
mod changes;
mod conf;
mod rest;
mod retry;
mod sequence;
mod service;
mod shc;
mod users;

#[cfg(test)]
pub(crate) mod fake;

pub use api::{
    Account, AccountSpec, BundleStatus, Credentials, ManagementApi, Presence, Session, ShcMember,
    ShcStatus,
};
pub use bundle::{push_bundle, BundleOutcome};
pub use changes::{analyze_changes, ChangeResult, PendingFlags, RequiredActions};
pub use conf::{apply_settings, flatten, ConfChange, ConfDocument, ConfGroup, ConfSetting};
pub use rest::RestApi;
pub use retry::{with_retry, RetryPolicy};
pub use sequence::{Operation, OperationResult, Sequence, SequenceReport};
pub use service::{control, ServiceAction};
pub use shc::{rolling_restart, MemberProbe};
pub use users::{ensure_user, UserChange};
