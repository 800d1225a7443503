//! # Failover State Machine
//!
//! Decides *when* the session should leave its current physical connection and
//! *where* it should go. It owns the authoritative `ConnectionState` and the
//! target the session is currently on; it performs no I/O.
//!
//! ## Transitions
//! - `Disconnected -> Connecting` on start.
//! - `Connecting -> Active | ActiveWarmStandby` on a successful connect.
//! - `Active* -> FailingOver` on a detection tick, schedule, explicit fallback,
//!   policy change or connection loss.
//! - `FailingOver -> Active*` once the new connection is up and streams moved,
//!   or when a fallback failed but the old connection is still healthy.
//! - `FailingOver -> Connecting` when the preferred target is unreachable and
//!   there is no live connection to stay on.
//! - `Connecting -> Disconnected` when every candidate is exhausted; the
//!   application may then retry (`Disconnected -> Connecting`) or shut down.
//! - any state `-> Closed` on shutdown.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::{ChannelCatalog, Target};
use crate::policy::ActivePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Active,
    ActiveWarmStandby,
    FailingOver,
    Closed,
}

impl ConnectionState {
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Active | ConnectionState::ActiveWarmStandby)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if self == next {
            return self != Closed;
        }
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Active | ActiveWarmStandby | Disconnected) => true,
            (Active | ActiveWarmStandby, FailingOver) => true,
            (FailingOver, Active | ActiveWarmStandby | Connecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailoverCause {
    ScheduledCheck,
    ExplicitFallback,
    ConnectionLost,
    PolicyChanged,
}

/// Emitted once per completed change of physical connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverEvent {
    pub cause: FailoverCause,
    pub from_target: Option<String>,
    pub to_target: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    NoOp,
    FailOver { target: Target, cause: FailoverCause },
}

#[derive(Debug)]
pub struct FailoverStateMachine {
    state: ConnectionState,
    current: Option<Target>,
}

impl Default for FailoverStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl FailoverStateMachine {
    pub fn new() -> Self {
        Self { state: ConnectionState::Disconnected, current: None }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Target of the live connection, if any.
    pub fn current(&self) -> Option<Target> {
        self.current
    }

    pub fn set_current(&mut self, target: Option<Target>) {
        self.current = target;
    }

    /// Applies `next` if the table allows it. Returns false (and logs) otherwise.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            log::error!("Rejected state transition {} -> {}", self.state, next);
            return false;
        }
        if self.state != next {
            log::info!("Connection state {} -> {}", self.state, next);
        }
        self.state = next;
        true
    }

    /// The state to enter once connected to `target`.
    pub fn active_state_for(target: Target) -> ConnectionState {
        if target.is_warm_standby() {
            ConnectionState::ActiveWarmStandby
        } else {
            ConnectionState::Active
        }
    }

    pub fn preferred_target(&self, policy: &ActivePolicy, catalog: &ChannelCatalog) -> Option<Target> {
        policy.preferred_target(catalog, self.current)
    }

    /// Whether the current connection already equals the computed preferred target.
    pub fn is_on_preferred(&self, policy: &ActivePolicy, catalog: &ChannelCatalog) -> bool {
        match self.preferred_target(policy, catalog) {
            Some(target) => self.current == Some(target),
            None => false,
        }
    }

    /// The detection check. Only an active session that is not already on the
    /// preferred target moves; everything else is a no-op.
    pub fn evaluate(&self, policy: &ActivePolicy, catalog: &ChannelCatalog, cause: FailoverCause) -> Decision {
        if !self.state.is_active() {
            log::debug!("Fallback check ({:?}) skipped in state {}", cause, self.state);
            return Decision::NoOp;
        }
        match self.preferred_target(policy, catalog) {
            None => Decision::NoOp,
            Some(target) if Some(target) == self.current => {
                log::debug!("Fallback check ({:?}): already on preferred {}", cause, catalog.describe(target));
                Decision::NoOp
            }
            Some(target) => {
                log::info!(
                    "Fallback check ({:?}): current {} differs from preferred {}",
                    cause,
                    self.current.map(|t| catalog.describe(t)).unwrap_or_else(|| "none".to_string()),
                    catalog.describe(target)
                );
                Decision::FailOver { target, cause }
            }
        }
    }

    pub fn failover_event(
        &self,
        catalog: &ChannelCatalog,
        cause: FailoverCause,
        from: Option<Target>,
        to: Target,
    ) -> FailoverEvent {
        FailoverEvent {
            cause,
            from_target: from.map(|t| catalog.describe(t)),
            to_target: catalog.describe(to),
            timestamp: Utc::now(),
        }
    }
}

/// Candidates for a move to `target`: the server itself and, for a
/// warm-standby target, the rest of its group.
pub fn preferred_candidates(catalog: &ChannelCatalog, target: Target) -> Vec<Target> {
    match target {
        Target::Channel(_) => vec![target],
        Target::WarmStandby { group, server } => {
            let count = catalog.warm_standby_groups().get(group).map(|g| g.server_count()).unwrap_or(0);
            (0..count)
                .map(|i| (server + i) % count)
                .map(|server| Target::WarmStandby { group, server })
                .collect()
        }
    }
}

/// Candidates for a fallback towards `target`, ranked for the open `services`,
/// keeping only those ranked ahead of `current`. A server at or behind the one
/// the session is already on is never an improvement.
pub fn fallback_candidates(
    catalog: &ChannelCatalog,
    target: Target,
    current: Option<Target>,
    services: &BTreeSet<String>,
) -> Vec<Target> {
    let mut candidates = preferred_candidates(catalog, target);
    catalog.rank_for_services(&mut candidates, services);
    if let Some(pos) = current.and_then(|c| candidates.iter().position(|t| *t == c)) {
        candidates.truncate(pos);
    }
    candidates
}

/// The full connect order: preferred candidates first (if any), then the
/// general list starting just after `after` (the target that was lost).
pub fn ordered_candidates(catalog: &ChannelCatalog, preferred: Option<Target>, after: Option<Target>) -> Vec<Target> {
    let mut general = catalog.general_candidates();
    if let Some(lost) = after {
        if let Some(pos) = general.iter().position(|t| *t == lost) {
            general.rotate_left(pos + 1);
        }
    }

    let mut ordered = preferred.map(|t| preferred_candidates(catalog, t)).unwrap_or_default();
    general.retain(|t| !ordered.contains(t));
    ordered.extend(general);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ChannelConfig, ServerInfo, WarmStandbyGroup, WarmStandbyMode};
    use crate::policy::PreferredHostOptions;

    fn catalog() -> ChannelCatalog {
        let a = ChannelConfig::new("A", "a", 1);
        let b = ChannelConfig::new("B", "b", 1);
        let c = ChannelConfig::new("C", "c", 1);
        let wsb = WarmStandbyGroup {
            name: "WSB1".to_string(),
            starting_active: ServerInfo::new(a.clone()),
            standby: vec![ServerInfo::new(b.clone())],
            mode: WarmStandbyMode::LoginBased,
        };
        ChannelCatalog::new(vec![a, b, c], vec![wsb])
    }

    fn active_on(target: Target) -> FailoverStateMachine {
        let mut machine = FailoverStateMachine::new();
        machine.transition(ConnectionState::Connecting);
        machine.transition(FailoverStateMachine::active_state_for(target));
        machine.set_current(Some(target));
        machine
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Active));
        assert!(Connecting.can_transition_to(ActiveWarmStandby));
        assert!(Active.can_transition_to(FailingOver));
        assert!(FailingOver.can_transition_to(Connecting));
        assert!(FailingOver.can_transition_to(Active));
        assert!(!Connecting.can_transition_to(FailingOver));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(!Active.can_transition_to(Disconnected));
        assert!(ActiveWarmStandby.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_rejected_transition_keeps_state() {
        let mut machine = FailoverStateMachine::new();
        assert!(!machine.transition(ConnectionState::FailingOver));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_evaluate_is_noop_on_preferred() {
        let catalog = catalog();
        let policy = ActivePolicy::resolve(PreferredHostOptions::enabled().with_wsb_channel("WSB1"), &catalog).unwrap();
        let machine = active_on(Target::WarmStandby { group: 0, server: 0 });

        for cause in [FailoverCause::ScheduledCheck, FailoverCause::ExplicitFallback, FailoverCause::PolicyChanged] {
            assert_eq!(machine.evaluate(&policy, &catalog, cause), Decision::NoOp);
        }
        assert!(machine.is_on_preferred(&policy, &catalog));
    }

    #[test]
    fn test_evaluate_moves_when_policy_points_elsewhere() {
        let catalog = catalog();
        let policy = ActivePolicy::resolve(PreferredHostOptions::enabled().with_channel("B"), &catalog).unwrap();
        let machine = active_on(Target::WarmStandby { group: 0, server: 0 });

        assert_eq!(
            machine.evaluate(&policy, &catalog, FailoverCause::PolicyChanged),
            Decision::FailOver { target: Target::Channel(1), cause: FailoverCause::PolicyChanged }
        );
    }

    #[test]
    fn test_evaluate_noop_when_disabled_or_inactive() {
        let catalog = catalog();
        let disabled = ActivePolicy::resolve(PreferredHostOptions::default().with_channel("B"), &catalog).unwrap();
        let machine = active_on(Target::Channel(0));
        assert_eq!(machine.evaluate(&disabled, &catalog, FailoverCause::ExplicitFallback), Decision::NoOp);

        let enabled = ActivePolicy::resolve(PreferredHostOptions::enabled().with_channel("B"), &catalog).unwrap();
        let connecting = FailoverStateMachine::new();
        assert_eq!(connecting.evaluate(&enabled, &catalog, FailoverCause::ExplicitFallback), Decision::NoOp);
    }

    #[test]
    fn test_standby_falls_back_to_starting_active() {
        let catalog = catalog();
        let policy = ActivePolicy::resolve(PreferredHostOptions::enabled(), &catalog).unwrap();
        let machine = active_on(Target::WarmStandby { group: 0, server: 1 });
        assert_eq!(
            machine.evaluate(&policy, &catalog, FailoverCause::ScheduledCheck),
            Decision::FailOver { target: Target::WarmStandby { group: 0, server: 0 }, cause: FailoverCause::ScheduledCheck }
        );
    }

    #[test]
    fn test_preferred_candidates_cover_group() {
        let catalog = catalog();
        assert_eq!(
            preferred_candidates(&catalog, Target::WarmStandby { group: 0, server: 0 }),
            vec![Target::WarmStandby { group: 0, server: 0 }, Target::WarmStandby { group: 0, server: 1 }]
        );
        assert_eq!(preferred_candidates(&catalog, Target::Channel(2)), vec![Target::Channel(2)]);
    }

    #[test]
    fn test_fallback_candidates_stop_at_current() {
        let catalog = catalog();
        let active = Target::WarmStandby { group: 0, server: 0 };
        let standby = Target::WarmStandby { group: 0, server: 1 };
        let none = BTreeSet::new();

        // On the standby only the starting active server is an improvement
        assert_eq!(fallback_candidates(&catalog, active, Some(standby), &none), vec![active]);
        // Outside the group the whole group is tried
        assert_eq!(fallback_candidates(&catalog, active, Some(Target::Channel(2)), &none), vec![active, standby]);
        assert!(fallback_candidates(&catalog, active, Some(active), &none).is_empty());
    }

    #[test]
    fn test_fallback_candidates_rank_service_based_group() {
        let a = ChannelConfig::new("A", "a", 1);
        let b = ChannelConfig::new("B", "b", 1);
        let wsb = WarmStandbyGroup {
            name: "WSB1".to_string(),
            starting_active: ServerInfo::new(a.clone()).with_services(["ELEKTRON_DD"]),
            standby: vec![ServerInfo::new(b.clone()).with_services(["DIRECT_FEED"])],
            mode: WarmStandbyMode::ServiceBased,
        };
        let catalog = ChannelCatalog::new(vec![a, b], vec![wsb]);
        let active = Target::WarmStandby { group: 0, server: 0 };
        let standby = Target::WarmStandby { group: 0, server: 1 };
        let services: BTreeSet<String> = ["DIRECT_FEED".to_string()].into();

        assert_eq!(fallback_candidates(&catalog, active, None, &services), vec![standby, active]);
        // Already on the server that owns the open services: nothing better
        assert!(fallback_candidates(&catalog, active, Some(standby), &services).is_empty());
    }

    #[test]
    fn test_ordered_candidates_rotate_after_lost_target() {
        let catalog = ChannelCatalog::new(
            vec![ChannelConfig::new("A", "a", 1), ChannelConfig::new("B", "b", 1), ChannelConfig::new("C", "c", 1)],
            vec![],
        );
        assert_eq!(
            ordered_candidates(&catalog, None, Some(Target::Channel(0))),
            vec![Target::Channel(1), Target::Channel(2), Target::Channel(0)]
        );
        assert_eq!(
            ordered_candidates(&catalog, Some(Target::Channel(2)), None),
            vec![Target::Channel(2), Target::Channel(0), Target::Channel(1)]
        );
    }

    #[test]
    fn test_failover_event_names_targets() {
        let catalog = catalog();
        let machine = active_on(Target::Channel(0));
        let event = machine.failover_event(
            &catalog,
            FailoverCause::ExplicitFallback,
            Some(Target::Channel(0)),
            Target::WarmStandby { group: 0, server: 1 },
        );
        assert_eq!(event.from_target.as_deref(), Some("A"));
        assert_eq!(event.to_target, "WSB1/B");
    }
}
