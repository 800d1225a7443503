//! # Channel Catalog
//!
//! The immutable description of every endpoint a session may connect to: the
//! ordered `ChannelSet` and the optional warm-standby groups. A catalog is
//! built once and shared behind an `Arc`; replacing it means building a new
//! one, never mutating the one an in-flight failover is reading.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// How the physical connection is carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionFlavor {
    /// Plain TCP.
    #[default]
    Plain,
    /// TLS over TCP.
    Encrypted,
    /// HTTP `CONNECT` through a proxy.
    #[serde(rename_all = "camelCase")]
    Tunneled { proxy_host: String, proxy_port: u16 },
}

/// # Channel Config
///
/// One connectable endpoint. `position` is its ordinal inside the `ChannelSet`
/// (or inside the channel definitions list for warm-standby servers) and is
/// assigned by the catalog, not read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub flavor: ConnectionFlavor,
    #[serde(skip)]
    pub position: usize,
}

impl ChannelConfig {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            flavor: ConnectionFlavor::Plain,
            position: 0,
        }
    }

    /// `host:port` of the feed server itself (not of a tunnelling proxy).
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A server inside a warm-standby group and the services it is authoritative for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub channel: ChannelConfig,
    pub per_service_name_set: BTreeSet<String>,
}

impl ServerInfo {
    pub fn new(channel: ChannelConfig) -> Self {
        Self { channel, per_service_name_set: BTreeSet::new() }
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.per_service_name_set = services.into_iter().map(Into::into).collect();
        self
    }

    /// An empty service set means the server serves everything.
    pub fn serves(&self, service: &str) -> bool {
        self.per_service_name_set.is_empty() || self.per_service_name_set.contains(service)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WarmStandbyMode {
    /// Whichever server is active serves every service.
    #[default]
    LoginBased,
    /// Service ownership is partitioned by each server's `per_service_name_set`.
    ServiceBased,
}

/// # Warm Standby Group
///
/// A named `(startingActiveServer, standbyServerSet)` pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmStandbyGroup {
    pub name: String,
    pub starting_active: ServerInfo,
    pub standby: Vec<ServerInfo>,
    pub mode: WarmStandbyMode,
}

impl WarmStandbyGroup {
    /// Server at `index`, where 0 is the starting active server and 1.. the standbys.
    pub fn server(&self, index: usize) -> Option<&ServerInfo> {
        if index == 0 {
            Some(&self.starting_active)
        } else {
            self.standby.get(index - 1)
        }
    }

    pub fn server_count(&self) -> usize {
        1 + self.standby.len()
    }
}

/// Where a physical connection points, relative to the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Target {
    /// Entry `index` of the `ChannelSet`.
    Channel(usize),
    /// Server `server` (0 = starting active) of warm-standby group `group`.
    WarmStandby { group: usize, server: usize },
}

impl Target {
    pub fn is_warm_standby(&self) -> bool {
        matches!(self, Target::WarmStandby { .. })
    }

    pub fn group(&self) -> Option<usize> {
        match self {
            Target::WarmStandby { group, .. } => Some(*group),
            Target::Channel(_) => None,
        }
    }
}

/// A target together with the channel it resolves to, ready for the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub target: Target,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelCatalog {
    channel_set: Vec<ChannelConfig>,
    warm_standby: Vec<WarmStandbyGroup>,
}

impl ChannelCatalog {
    /// Builds a catalog, stamping each channel with its ordinal position.
    pub fn new(channel_set: Vec<ChannelConfig>, warm_standby: Vec<WarmStandbyGroup>) -> Self {
        let channel_set = channel_set
            .into_iter()
            .enumerate()
            .map(|(position, mut channel)| {
                channel.position = position;
                channel
            })
            .collect();
        Self { channel_set, warm_standby }
    }

    pub fn channel_set(&self) -> &[ChannelConfig] {
        &self.channel_set
    }

    pub fn warm_standby_groups(&self) -> &[WarmStandbyGroup] {
        &self.warm_standby
    }

    pub fn is_empty(&self) -> bool {
        self.channel_set.is_empty() && self.warm_standby.is_empty()
    }

    /// Case-insensitive lookup in the `ChannelSet`.
    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channel_set.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Case-insensitive lookup in the warm-standby groups.
    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.warm_standby.iter().position(|g| g.name.eq_ignore_ascii_case(name))
    }

    pub fn channel_names(&self) -> String {
        self.channel_set.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
    }

    pub fn group_names(&self) -> String {
        self.warm_standby.iter().map(|g| g.name.as_str()).collect::<Vec<_>>().join(", ")
    }

    pub fn resolve(&self, target: Target) -> Option<&ChannelConfig> {
        match target {
            Target::Channel(index) => self.channel_set.get(index),
            Target::WarmStandby { group, server } => {
                self.warm_standby.get(group)?.server(server).map(|s| &s.channel)
            }
        }
    }

    pub fn group(&self, target: Target) -> Option<&WarmStandbyGroup> {
        target.group().and_then(|g| self.warm_standby.get(g))
    }

    /// The ordinary, preference-free candidate order: every warm-standby group
    /// (starting active server first, then its standbys), followed by the
    /// `ChannelSet` in declaration order.
    pub fn general_candidates(&self) -> Vec<Target> {
        let mut targets = Vec::new();
        for (group, wsb) in self.warm_standby.iter().enumerate() {
            for server in 0..wsb.server_count() {
                targets.push(Target::WarmStandby { group, server });
            }
        }
        targets.extend((0..self.channel_set.len()).map(Target::Channel));
        targets
    }

    /// Within every service-based group, moves the servers that own all of
    /// `services` ahead of those that do not. Entries of other groups and plain
    /// channels keep their slots; ties keep their order.
    pub fn rank_for_services(&self, targets: &mut [Target], services: &BTreeSet<String>) {
        if services.is_empty() {
            return;
        }
        for (index, group) in self.warm_standby.iter().enumerate() {
            if group.mode != WarmStandbyMode::ServiceBased {
                continue;
            }
            let slots: Vec<usize> = targets
                .iter()
                .enumerate()
                .filter(|(_, t)| t.group() == Some(index))
                .map(|(slot, _)| slot)
                .collect();
            let mut members: Vec<Target> = slots.iter().map(|&slot| targets[slot]).collect();
            members.sort_by_key(|t| self.missing_services(*t, services));
            for (slot, target) in slots.into_iter().zip(members) {
                targets[slot] = target;
            }
        }
    }

    /// How many of `services` the server behind `target` is not authoritative for.
    fn missing_services(&self, target: Target, services: &BTreeSet<String>) -> usize {
        let Target::WarmStandby { group, server } = target else { return 0 };
        match self.warm_standby.get(group).and_then(|g| g.server(server)) {
            Some(info) => services.iter().filter(|s| !info.serves(s)).count(),
            None => 0,
        }
    }

    /// Resolves targets into supervisor candidates, skipping any that no longer exist.
    pub fn candidates(&self, targets: &[Target]) -> Vec<Candidate> {
        targets
            .iter()
            .filter_map(|t| self.resolve(*t).map(|c| Candidate { target: *t, channel: c.clone() }))
            .collect()
    }

    /// Human readable name, e.g. `WSB1/ServerA` or `ChannelB`.
    pub fn describe(&self, target: Target) -> String {
        match target {
            Target::Channel(index) => self
                .channel_set
                .get(index)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| format!("channel#{}", index)),
            Target::WarmStandby { group, server } => match self.warm_standby.get(group) {
                Some(wsb) => match wsb.server(server) {
                    Some(info) => format!("{}/{}", wsb.name, info.channel.name),
                    None => format!("{}/server#{}", wsb.name, server),
                },
                None => format!("wsb#{}/server#{}", group, server),
            },
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Channel(index) => write!(f, "channel[{}]", index),
            Target::WarmStandby { group, server } => write!(f, "wsb[{}].server[{}]", group, server),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ChannelCatalog {
        let a = ChannelConfig::new("ChannelA", "a.example", 14002);
        let b = ChannelConfig::new("ChannelB", "b.example", 14002);
        let c = ChannelConfig::new("ChannelC", "c.example", 14002);
        let group = WarmStandbyGroup {
            name: "WSB1".to_string(),
            starting_active: ServerInfo::new(a.clone()),
            standby: vec![ServerInfo::new(b.clone())],
            mode: WarmStandbyMode::LoginBased,
        };
        ChannelCatalog::new(vec![a, b, c], vec![group])
    }

    #[test]
    fn test_positions_are_stamped_in_order() {
        let catalog = catalog();
        let positions: Vec<usize> = catalog.channel_set().iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let catalog = catalog();
        assert_eq!(catalog.channel_index("channelb"), Some(1));
        assert_eq!(catalog.group_index("wsb1"), Some(0));
        assert_eq!(catalog.channel_index("ChannelZ"), None);
    }

    #[test]
    fn test_general_candidates_put_groups_first() {
        let catalog = catalog();
        assert_eq!(
            catalog.general_candidates(),
            vec![
                Target::WarmStandby { group: 0, server: 0 },
                Target::WarmStandby { group: 0, server: 1 },
                Target::Channel(0),
                Target::Channel(1),
                Target::Channel(2),
            ]
        );
    }

    #[test]
    fn test_describe_and_resolve() {
        let catalog = catalog();
        let standby = Target::WarmStandby { group: 0, server: 1 };
        assert_eq!(catalog.describe(standby), "WSB1/ChannelB");
        assert_eq!(catalog.resolve(standby).map(|c| c.host.as_str()), Some("b.example"));
        assert!(catalog.resolve(Target::Channel(7)).is_none());
    }

    #[test]
    fn test_rank_for_services_only_touches_service_based_groups() {
        let a = ChannelConfig::new("ChannelA", "a.example", 14002);
        let b = ChannelConfig::new("ChannelB", "b.example", 14002);
        let service_based = WarmStandbyGroup {
            name: "WSB1".to_string(),
            starting_active: ServerInfo::new(a.clone()).with_services(["ELEKTRON_DD"]),
            standby: vec![ServerInfo::new(b.clone()).with_services(["DIRECT_FEED"])],
            mode: WarmStandbyMode::ServiceBased,
        };
        let login_based = WarmStandbyGroup { name: "WSB2".to_string(), mode: WarmStandbyMode::LoginBased, ..service_based.clone() };
        let catalog = ChannelCatalog::new(vec![a, b], vec![service_based, login_based]);
        let services: BTreeSet<String> = ["DIRECT_FEED".to_string()].into();

        let mut targets = catalog.general_candidates();
        catalog.rank_for_services(&mut targets, &services);
        assert_eq!(
            targets,
            vec![
                Target::WarmStandby { group: 0, server: 1 },
                Target::WarmStandby { group: 0, server: 0 },
                Target::WarmStandby { group: 1, server: 0 },
                Target::WarmStandby { group: 1, server: 1 },
                Target::Channel(0),
                Target::Channel(1),
            ]
        );

        let mut untouched = catalog.general_candidates();
        catalog.rank_for_services(&mut untouched, &BTreeSet::new());
        assert_eq!(untouched, catalog.general_candidates());
    }

    #[test]
    fn test_empty_service_set_serves_everything() {
        let open = ServerInfo::new(ChannelConfig::new("A", "a", 1));
        let scoped = ServerInfo::new(ChannelConfig::new("B", "b", 1)).with_services(["ELEKTRON_DD"]);
        assert!(open.serves("ANY"));
        assert!(scoped.serves("ELEKTRON_DD"));
        assert!(!scoped.serves("OTHER"));
    }
}
