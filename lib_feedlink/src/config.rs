//! # Feed Configuration
//!
//! The persisted policy document. Loaded once at startup; afterwards the
//! preferred-host part changes only through the session's runtime API.
//!
//! ```json
//! {
//!   "channels": [
//!     { "name": "ChannelA", "host": "feed-a", "port": 14002 },
//!     { "name": "ChannelB", "host": "feed-b", "port": 14002, "flavor": "encrypted" }
//!   ],
//!   "channelSet": ["ChannelA", "ChannelB"],
//!   "warmStandbyChannelSet": [{
//!     "name": "WSB1",
//!     "startingActiveServer": { "channel": "ChannelA" },
//!     "standbyServers": [{ "channel": "ChannelB", "perServiceNameSet": ["DIRECT_FEED"] }],
//!     "mode": "LoginBased"
//!   }],
//!   "preferredHostOptions": { "enabled": true, "wsbChannelName": "WSB1", "detectionTimeInterval": 15 },
//!   "reconnect": { "reconnectMinDelay": 500, "reconnectAttemptLimit": -1 }
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::{ChannelCatalog, ChannelConfig, ServerInfo, WarmStandbyGroup, WarmStandbyMode};
use crate::error::ConfigError;
use crate::policy::{ActivePolicy, PreferredHostOptions, ReconnectOptions};
use crate::session::SessionConfig;
use crate::watchlist::RequestKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDefinition {
    pub channel: String,
    #[serde(default)]
    pub per_service_name_set: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmStandbyDefinition {
    pub name: String,
    pub starting_active_server: ServerDefinition,
    #[serde(default)]
    pub standby_servers: Vec<ServerDefinition>,
    #[serde(default)]
    pub mode: WarmStandbyMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedConfig {
    /// Every connectable endpoint, referenced by name below.
    pub channels: Vec<ChannelConfig>,
    /// Ordered channel names. Empty with no warm-standby groups means "all channels".
    #[serde(default)]
    pub channel_set: Vec<String>,
    #[serde(default)]
    pub warm_standby_channel_set: Vec<WarmStandbyDefinition>,
    #[serde(default)]
    pub preferred_host_options: PreferredHostOptions,
    #[serde(default)]
    pub reconnect: ReconnectOptions,
    /// Items the consumer subscribes on startup.
    #[serde(default)]
    pub items: Vec<RequestKey>,
}

impl FeedConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        log::info!("Loading feed configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    fn channel(&self, name: &str) -> Result<ChannelConfig, ConfigError> {
        self.channels
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| ConfigError::Invalid(format!("channel '{}' is not defined in channels", name)))
    }

    fn server(&self, definition: &ServerDefinition) -> Result<ServerInfo, ConfigError> {
        Ok(ServerInfo::new(self.channel(&definition.channel)?)
            .with_services(definition.per_service_name_set.iter().cloned()))
    }

    /// Resolves the document into an immutable catalog.
    pub fn catalog(&self) -> Result<ChannelCatalog, ConfigError> {
        // 1. Channel definitions must be uniquely named
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.name.to_ascii_lowercase()) {
                return Err(ConfigError::Invalid(format!("channel '{}' is defined twice", channel.name)));
            }
        }

        // 2. ChannelSet
        let channel_set = if self.channel_set.is_empty() && self.warm_standby_channel_set.is_empty() {
            self.channels.clone()
        } else {
            self.channel_set.iter().map(|name| self.channel(name)).collect::<Result<Vec<_>, _>>()?
        };

        // 3. Warm-standby groups
        let mut groups = Vec::with_capacity(self.warm_standby_channel_set.len());
        for definition in &self.warm_standby_channel_set {
            groups.push(WarmStandbyGroup {
                name: definition.name.clone(),
                starting_active: self.server(&definition.starting_active_server)?,
                standby: definition.standby_servers.iter().map(|s| self.server(s)).collect::<Result<Vec<_>, _>>()?,
                mode: definition.mode,
            });
        }

        let catalog = ChannelCatalog::new(channel_set, groups);
        if catalog.is_empty() {
            return Err(ConfigError::Invalid("no channels configured".to_string()));
        }
        Ok(catalog)
    }

    /// Catalog plus validated policy and reconnect options.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let catalog = self.catalog()?;
        ActivePolicy::resolve(self.preferred_host_options.clone(), &catalog)?;
        self.reconnect.validate()?;

        Ok(SessionConfig {
            catalog,
            preferred_host: self.preferred_host_options.clone(),
            reconnect: self.reconnect.clone(),
        })
    }
}
