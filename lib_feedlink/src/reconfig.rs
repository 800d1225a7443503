//! # Runtime Reconfigurator
//!
//! Applies live changes to the preferred-host policy. A new policy is
//! validated in full before anything is swapped; an invalid one leaves the
//! current policy in force. The swap replaces an `Arc`, so a failover decision
//! that already cloned the old `Arc` keeps reading one consistent policy.

use std::sync::Arc;

use crate::catalog::ChannelCatalog;
use crate::error::PolicyError;
use crate::policy::{ActivePolicy, PreferredHostOptions, ReconnectOptions};

/// Which fields differ between two option sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyDiff {
    pub enabled: bool,
    pub channel_name: bool,
    pub wsb_channel_name: bool,
    pub detection_time_interval: bool,
    pub detection_time_schedule: bool,
    pub fall_back_within_wsb_group: bool,
}

impl PolicyDiff {
    pub fn between(old: &PreferredHostOptions, new: &PreferredHostOptions) -> Self {
        Self {
            enabled: old.enabled != new.enabled,
            // Names compare the way they resolve
            channel_name: !old.channel_name.trim().eq_ignore_ascii_case(new.channel_name.trim()),
            wsb_channel_name: !old.wsb_channel_name.trim().eq_ignore_ascii_case(new.wsb_channel_name.trim()),
            detection_time_interval: old.detection_time_interval != new.detection_time_interval,
            detection_time_schedule: old.detection_time_schedule.trim() != new.detection_time_schedule.trim(),
            fall_back_within_wsb_group: old.fall_back_within_wsb_group != new.fall_back_within_wsb_group,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn changed_fields(&self) -> Vec<&'static str> {
        [
            (self.enabled, "enabled"),
            (self.channel_name, "channelName"),
            (self.wsb_channel_name, "wsbChannelName"),
            (self.detection_time_interval, "detectionTimeInterval"),
            (self.detection_time_schedule, "detectionTimeSchedule"),
            (self.fall_back_within_wsb_group, "fallBackWithinWSBGroup"),
        ]
        .into_iter()
        .filter_map(|(changed, name)| changed.then_some(name))
        .collect()
    }

    /// The interval timer has to be re-armed.
    pub fn affects_interval(&self) -> bool {
        self.enabled || self.detection_time_interval
    }

    /// The schedule guard has to be reset.
    pub fn affects_schedule(&self) -> bool {
        self.enabled || self.detection_time_schedule
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Changed {
    No,
    Yes(PolicyDiff),
}

#[derive(Debug)]
pub struct RuntimeReconfigurator {
    active: Arc<ActivePolicy>,
}

impl RuntimeReconfigurator {
    pub fn new(active: ActivePolicy) -> Self {
        Self { active: Arc::new(active) }
    }

    /// The policy in force. Callers hold the returned `Arc` for the whole of a decision.
    pub fn current(&self) -> Arc<ActivePolicy> {
        Arc::clone(&self.active)
    }

    pub fn apply(&mut self, options: PreferredHostOptions, catalog: &ChannelCatalog) -> Result<Changed, PolicyError> {
        let diff = PolicyDiff::between(self.active.options(), &options);
        if diff.is_empty() {
            log::debug!("Preferred host policy unchanged");
            return Ok(Changed::No);
        }

        let resolved = ActivePolicy::resolve(options, catalog).inspect_err(|e| {
            log::warn!("Preferred host policy rejected, keeping the current one: {}", e);
        })?;

        log::info!("Preferred host policy updated: {}", diff.changed_fields().join(", "));
        self.active = Arc::new(resolved);
        Ok(Changed::Yes(diff))
    }

    pub fn validate_reconnect(options: &ReconnectOptions) -> Result<(), PolicyError> {
        options.validate().inspect_err(|e| log::warn!("Reconnect options rejected: {}", e))
    }
}
