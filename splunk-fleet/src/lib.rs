// SPDX-License-Identifier: AGPL-3.0-or-later
//! splunk-fleet: host preparation, Splunk Enterprise lifecycle and day-2
//! operations for Splunk fleets
//!
//! Three units build on each other:
//!
//! * **linux** converges hosts to the Splunk baseline (service account,
//!   systemd units, firewall ports, THP, polkit)
//! * **enterprise** installs Splunk where absent and rolls upgrades across a
//!   group one host at a time
//! * **operations** drives the management REST API: users, cluster bundles,
//!   search-head cluster restarts, service control and `.conf` changes
//!
//! Playbooks tie the units to inventory groups and run them in dependency
//! order.

pub mod config;
pub mod enterprise;
pub mod error;
pub mod host;
pub mod inventory;
pub mod linux;
pub mod operations;
pub mod playbook;
pub mod rolling;

pub use config::Config;
pub use error::{FleetError, Result};
