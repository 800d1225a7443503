//! # Preferred Host Policy
//!
//! The hot-reloadable settings that decide which endpoint a session *wants* to
//! be on, and the reconnect parameters that bound how hard it tries.
//!
//! - **`PreferredHostOptions`**: the raw options, exactly as they appear in the
//!   policy document.
//! - **`ActivePolicy`**: the options validated against a `ChannelCatalog`,
//!   with names resolved to indices and the cron schedule parsed. An
//!   `ActivePolicy` is never mutated; a change builds a new one and swaps the
//!   `Arc` that points at it.
//! - **`ReconnectOptions`**: InitializationTimeout, ReconnectMinDelay,
//!   ReconnectMaxDelay and ReconnectAttemptLimit.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::{ChannelCatalog, Target};
use crate::error::PolicyError;
use crate::schedule::DetectionSchedule;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PreferredHostOptions {
    pub enabled: bool,
    /// Empty means the first entry of the `ChannelSet`.
    pub channel_name: String,
    /// Empty means the first warm-standby group.
    pub wsb_channel_name: String,
    /// Zero disables the interval trigger.
    #[serde(with = "duration_secs")]
    pub detection_time_interval: Duration,
    /// Five-field cron expression; empty disables the schedule trigger.
    pub detection_time_schedule: String,
    #[serde(rename = "fallBackWithinWSBGroup")]
    pub fall_back_within_wsb_group: bool,
}

impl PreferredHostOptions {
    pub fn enabled() -> Self {
        Self { enabled: true, ..Self::default() }
    }

    pub fn with_channel(mut self, name: &str) -> Self {
        self.channel_name = name.to_string();
        self
    }

    pub fn with_wsb_channel(mut self, name: &str) -> Self {
        self.wsb_channel_name = name.to_string();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.detection_time_interval = interval;
        self
    }

    pub fn with_schedule(mut self, schedule: &str) -> Self {
        self.detection_time_schedule = schedule.to_string();
        self
    }

    pub fn with_fall_back_within_wsb_group(mut self, value: bool) -> Self {
        self.fall_back_within_wsb_group = value;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectOptions {
    /// Upper bound on one connect attempt, in seconds.
    #[serde(with = "duration_secs")]
    pub initialization_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub reconnect_min_delay: Duration,
    #[serde(with = "duration_millis")]
    pub reconnect_max_delay: Duration,
    /// Consecutive failures across the whole candidate list before giving up.
    /// -1 retries forever, 0 makes a single pass over the list.
    pub reconnect_attempt_limit: i64,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            initialization_timeout: Duration::from_secs(60),
            reconnect_min_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(5000),
            reconnect_attempt_limit: -1,
        }
    }
}

impl ReconnectOptions {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.reconnect_attempt_limit < -1 {
            return Err(PolicyError::InvalidReconnect(format!(
                "reconnectAttemptLimit must be -1 or greater, got {}",
                self.reconnect_attempt_limit
            )));
        }
        if self.reconnect_max_delay < self.reconnect_min_delay {
            return Err(PolicyError::InvalidReconnect(format!(
                "reconnectMaxDelay ({:?}) is below reconnectMinDelay ({:?})",
                self.reconnect_max_delay, self.reconnect_min_delay
            )));
        }
        if self.initialization_timeout.is_zero() {
            return Err(PolicyError::InvalidReconnect(
                "initializationTimeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of consecutive failures allowed for a list of `candidates`
    /// entries, or `None` for unlimited.
    pub fn attempt_budget(&self, candidates: usize) -> Option<u32> {
        match self.reconnect_attempt_limit {
            limit if limit < 0 => None,
            0 => Some(candidates.max(1) as u32),
            limit => Some(u32::try_from(limit).unwrap_or(u32::MAX)),
        }
    }
}

/// # Active Policy
///
/// `PreferredHostOptions` resolved against a catalog. Construction is the only
/// place validation happens, so holding one proves the options were accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivePolicy {
    options: PreferredHostOptions,
    channel_index: Option<usize>,
    group_index: Option<usize>,
    schedule: Option<DetectionSchedule>,
}

impl ActivePolicy {
    pub fn resolve(options: PreferredHostOptions, catalog: &ChannelCatalog) -> Result<Self, PolicyError> {
        // 1. Names are matched case-insensitively and must exist
        let channel_index = match options.channel_name.trim() {
            "" => None,
            name => Some(catalog.channel_index(name).ok_or_else(|| PolicyError::UnknownChannel {
                name: name.to_string(),
                available: catalog.channel_names(),
            })?),
        };
        let group_index = match options.wsb_channel_name.trim() {
            "" => None,
            name => Some(catalog.group_index(name).ok_or_else(|| {
                PolicyError::UnknownWarmStandbyGroup {
                    name: name.to_string(),
                    available: catalog.group_names(),
                }
            })?),
        };

        // 2. Schedule must parse
        let schedule = match options.detection_time_schedule.trim() {
            "" => None,
            expr => Some(DetectionSchedule::parse(expr)?),
        };

        // 3. Something to prefer
        if options.enabled && catalog.is_empty() {
            return Err(PolicyError::NoCandidates);
        }

        Ok(Self { options, channel_index, group_index, schedule })
    }

    pub fn options(&self) -> &PreferredHostOptions {
        &self.options
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn schedule(&self) -> Option<&DetectionSchedule> {
        self.schedule.as_ref()
    }

    /// The interval trigger, if enabled.
    pub fn detection_interval(&self) -> Option<Duration> {
        if self.options.enabled && !self.options.detection_time_interval.is_zero() {
            Some(self.options.detection_time_interval)
        } else {
            None
        }
    }

    /// The target the policy designates as desired, given the target the
    /// session is currently on. `None` when the policy is disabled.
    ///
    /// - A named warm-standby group wins over a named channel.
    /// - A named channel wins over the implicit "first group" default.
    /// - With `fallBackWithinWSBGroup`, a session already on some group
    ///   prefers that group's starting active server over moving elsewhere.
    pub fn preferred_target(&self, catalog: &ChannelCatalog, current: Option<Target>) -> Option<Target> {
        if !self.options.enabled {
            return None;
        }

        let group = match (self.group_index, self.channel_index) {
            (Some(group), _) => Some(group),
            (None, Some(index)) => return catalog.channel_set().get(index).map(|_| Target::Channel(index)),
            (None, None) if !catalog.warm_standby_groups().is_empty() => Some(0),
            (None, None) => None,
        };

        match group {
            Some(group) => {
                let group = match current.and_then(|t| t.group()) {
                    Some(current_group) if self.options.fall_back_within_wsb_group => current_group,
                    _ => group,
                };
                catalog
                    .warm_standby_groups()
                    .get(group)
                    .map(|_| Target::WarmStandby { group, server: 0 })
            }
            None if !catalog.channel_set().is_empty() => Some(Target::Channel(0)),
            None => None,
        }
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
