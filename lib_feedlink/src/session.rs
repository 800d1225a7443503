//! # Session
//!
//! The single control loop that owns the connection state, the active policy
//! and every item stream, plus the cloneable `Session` handle the application
//! talks to.
//!
//! ## Event queue
//! Everything the loop reacts to arrives on one queue and is handled in
//! arrival order:
//! - application commands (items, policy, fallback, reconnect, queries, shutdown),
//! - link events from the per-connection I/O worker (frames, loss),
//! - outcomes of connect sequences run by the supervisor on worker tasks.
//!
//! Timers (the detection interval and the cron poll) are separate arms of the
//! same `select!`, so they never interleave with a half-handled event.
//!
//! ## Ownership
//! `Session` handles hold the only strong senders. The loop and its workers
//! hold weak ones, so dropping every handle ends the loop.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::catalog::{Candidate, ChannelCatalog, Target, WarmStandbyMode};
use crate::codec::Codec;
use crate::error::{ConnectError, SessionError};
use crate::failover::{
    fallback_candidates, ordered_candidates, ConnectionState, Decision, FailoverCause, FailoverEvent,
    FailoverStateMachine,
};
use crate::policy::{duration_secs, ActivePolicy, PreferredHostOptions, ReconnectOptions};
use crate::reconfig::{Changed, RuntimeReconfigurator};
use crate::schedule::{system_clock, MinuteGuard, WallClock};
use crate::supervisor::{ConnectionSupervisor, Established};
use crate::transport::{spawn_link, ConnectionId, LinkEvent, LinkHandle, Transport};
use crate::watchlist::{ItemEvent, ItemHandle, ItemInfo, RequestKey, StreamSink, Watchlist};

const SCHEDULE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub catalog: ChannelCatalog,
    pub preferred_host: PreferredHostOptions,
    pub reconnect: ReconnectOptions,
}

/// Session-level events, delivered alongside item events.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    ChannelUp { target: String },
    ChannelDownReconnecting { target: String, reason: String },
    /// Every candidate failed. The session waits in `Disconnected`, items
    /// still registered, until `reconnect()` or `shutdown()`.
    ChannelDown { error: SessionError },
    PreferredHostStartingFallback { from: Option<String>, to: String },
    /// Sent after every fallback attempt, successful or not.
    PreferredHostComplete { active: Option<String> },
    Failover(FailoverEvent),
    Warning { text: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Item(ItemEvent),
    Channel(ChannelEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferredHostInfo {
    pub is_preferred_host_enabled: bool,
    pub is_channel_preferred: bool,
    pub channel_name: String,
    pub wsb_channel_name: String,
    #[serde(with = "duration_secs")]
    pub detection_time_interval: Duration,
    pub detection_time_schedule: String,
    /// Seconds until the interval timer next fires; 0 when it is off.
    pub remaining_detection_time: u64,
    #[serde(rename = "fallBackWithInWSBGroup")]
    pub fall_back_within_wsb_group: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target: Target,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub warm_standby_mode: Option<WarmStandbyMode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInformation {
    pub state: ConnectionState,
    pub active_target: Option<TargetInfo>,
    pub preferred_host_info: PreferredHostInfo,
}

enum Command {
    Open { key: RequestKey, reply: oneshot::Sender<Result<ItemHandle, SessionError>> },
    Reissue { handle: ItemHandle, key: RequestKey, reply: oneshot::Sender<Result<(), SessionError>> },
    Close { handle: ItemHandle, reply: oneshot::Sender<bool> },
    ModifyPolicy { options: PreferredHostOptions, reply: oneshot::Sender<Result<bool, SessionError>> },
    ModifyReconnect { options: ReconnectOptions, reply: oneshot::Sender<Result<(), SessionError>> },
    Fallback { reply: oneshot::Sender<bool> },
    Reconnect { reply: oneshot::Sender<bool> },
    Info { reply: oneshot::Sender<ChannelInformation> },
    Items { reply: oneshot::Sender<Vec<ItemInfo>> },
    Shutdown { reply: oneshot::Sender<()> },
}

enum Event {
    Command(Command),
    Link(LinkEvent),
    ConnectOutcome { attempt: u64, result: Result<Established, ConnectError> },
}

impl From<LinkEvent> for Event {
    fn from(event: LinkEvent) -> Self {
        Event::Link(event)
    }
}

// --- Application handle ---

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct Session {
    events: mpsc::UnboundedSender<Event>,
}

impl Session {
    /// Validates the configuration and spawns the control loop on the current
    /// tokio runtime. The loop starts connecting immediately.
    pub fn start(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
    ) -> Result<(Session, mpsc::UnboundedReceiver<Notification>), SessionError> {
        Self::start_with_clock(config, transport, codec, system_clock())
    }

    /// Same as `start`, with the detection schedule matched against `clock`.
    pub fn start_with_clock(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        clock: WallClock,
    ) -> Result<(Session, mpsc::UnboundedReceiver<Notification>), SessionError> {
        RuntimeReconfigurator::validate_reconnect(&config.reconnect)?;
        let policy = ActivePolicy::resolve(config.preferred_host, &config.catalog)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let control = SessionLoop {
            catalog: Arc::new(config.catalog),
            reconfig: RuntimeReconfigurator::new(policy),
            supervisor: ConnectionSupervisor::new(transport, config.reconnect),
            machine: FailoverStateMachine::new(),
            watchlist: Watchlist::new(),
            codec,
            link: None,
            pending: None,
            next_attempt: 1,
            next_conn: 1,
            events: events_tx.downgrade(),
            notify: notify_tx,
            root: CancellationToken::new(),
            detection_deadline: None,
            schedule_guard: MinuteGuard::default(),
            clock,
        };
        tokio::spawn(control.run(events_rx));

        Ok((Session { events: events_tx }, notify_rx))
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(Event::Command(command(reply)))
            .map_err(|_| SessionError::SessionClosed)?;
        response.await.map_err(|_| SessionError::SessionClosed)
    }

    pub async fn open_item(&self, key: RequestKey) -> Result<ItemHandle, SessionError> {
        self.call(|reply| Command::Open { key, reply }).await?
    }

    pub async fn reissue_item(&self, handle: ItemHandle, key: RequestKey) -> Result<(), SessionError> {
        self.call(|reply| Command::Reissue { handle, key, reply }).await?
    }

    /// Idempotent; returns whether the handle was open.
    pub async fn close_item(&self, handle: ItemHandle) -> Result<bool, SessionError> {
        self.call(|reply| Command::Close { handle, reply }).await
    }

    /// Returns whether the policy actually changed.
    pub async fn modify_preferred_host_policy(&self, options: PreferredHostOptions) -> Result<bool, SessionError> {
        self.call(|reply| Command::ModifyPolicy { options, reply }).await?
    }

    pub async fn modify_reconnect_options(&self, options: ReconnectOptions) -> Result<(), SessionError> {
        self.call(|reply| Command::ModifyReconnect { options, reply }).await?
    }

    /// Same as a detection tick. Returns whether a fallback was started.
    pub async fn fallback_to_preferred_host(&self) -> Result<bool, SessionError> {
        self.call(|reply| Command::Fallback { reply }).await
    }

    /// Starts a new connect sequence after `ChannelDown`. Returns false when
    /// the session is not waiting in `Disconnected`.
    pub async fn reconnect(&self) -> Result<bool, SessionError> {
        self.call(|reply| Command::Reconnect { reply }).await
    }

    pub async fn channel_information(&self) -> Result<ChannelInformation, SessionError> {
        self.call(|reply| Command::Info { reply }).await
    }

    /// Every open item in creation order.
    pub async fn items(&self) -> Result<Vec<ItemInfo>, SessionError> {
        self.call(|reply| Command::Items { reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

// --- Control loop ---

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// First connect of the session.
    Initial,
    /// Moving towards the preferred target while (possibly) still on another.
    Preferred { cause: FailoverCause, from: Option<Target> },
    /// Ordinary reconnect over the general candidate list.
    General { cause: FailoverCause, from: Option<Target> },
}

struct PendingConnect {
    attempt: u64,
    phase: Phase,
    cancel: CancellationToken,
}

struct LinkSink<'a> {
    link: &'a LinkHandle,
    codec: &'a dyn Codec,
}

impl StreamSink for LinkSink<'_> {
    fn connection_id(&self) -> ConnectionId {
        self.link.id()
    }

    fn request(&self, key: &RequestKey, stream_id: i32) -> bool {
        match self.codec.encode_request(key, stream_id) {
            Ok(frame) => self.link.send(frame),
            Err(e) => {
                log::error!("Failed to encode request for {}: {}", key.name, e);
                false
            }
        }
    }

    fn close(&self, stream_id: i32) -> bool {
        match self.codec.encode_close(stream_id) {
            Ok(frame) => self.link.send(frame),
            Err(e) => {
                log::error!("Failed to encode close for stream {}: {}", stream_id, e);
                false
            }
        }
    }
}

fn link_sink<'a>(link: &'a Option<LinkHandle>, codec: &'a Arc<dyn Codec>) -> Option<LinkSink<'a>> {
    link.as_ref().filter(|l| !l.is_closed()).map(|link| LinkSink { link, codec: codec.as_ref() })
}

fn as_dyn<'a>(sink: &'a Option<LinkSink<'a>>) -> Option<&'a dyn StreamSink> {
    sink.as_ref().map(|s| s as &dyn StreamSink)
}

struct SessionLoop {
    catalog: Arc<ChannelCatalog>,
    reconfig: RuntimeReconfigurator,
    supervisor: ConnectionSupervisor,
    machine: FailoverStateMachine,
    watchlist: Watchlist,
    codec: Arc<dyn Codec>,
    link: Option<LinkHandle>,
    pending: Option<PendingConnect>,
    next_attempt: u64,
    next_conn: u64,
    events: mpsc::WeakUnboundedSender<Event>,
    notify: mpsc::UnboundedSender<Notification>,
    root: CancellationToken,
    detection_deadline: Option<Instant>,
    schedule_guard: MinuteGuard,
    clock: WallClock,
}

impl SessionLoop {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        self.begin_initial_connect();

        let mut schedule_poll = tokio::time::interval(SCHEDULE_POLL);
        schedule_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.machine.state() != ConnectionState::Closed {
            let deadline = self.detection_deadline;
            let has_schedule = self.reconfig.current().is_enabled() && self.reconfig.current().schedule().is_some();

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        log::info!("All session handles dropped, shutting down");
                        self.shutdown();
                    }
                },
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => self.on_detection_tick(),
                _ = schedule_poll.tick(), if has_schedule => self.on_schedule_poll(),
            }
        }

        log::info!("Session control loop finished");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Command(command) => self.on_command(command),
            Event::Link(LinkEvent::Frame { conn, bytes }) => self.on_frame(conn, bytes),
            Event::Link(LinkEvent::Lost { conn, reason }) => self.on_link_lost(conn, &reason),
            Event::ConnectOutcome { attempt, result } => self.on_connect_outcome(attempt, result),
        }
    }

    fn emit(&self, notification: Notification) {
        // A dropped receiver only means nobody is listening
        let _ = self.notify.send(notification);
    }

    fn emit_channel(&self, event: ChannelEvent) {
        self.emit(Notification::Channel(event));
    }

    fn describe(&self, target: Option<Target>) -> Option<String> {
        target.map(|t| self.catalog.describe(t))
    }

    // --- Commands ---

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Open { key, reply } => {
                let sink = link_sink(&self.link, &self.codec);
                let result = self.watchlist.open(key, as_dyn(&sink));
                let _ = reply.send(result);
            }
            Command::Reissue { handle, key, reply } => {
                let sink = link_sink(&self.link, &self.codec);
                let result = self.watchlist.reissue(handle, key, as_dyn(&sink));
                let _ = reply.send(result);
            }
            Command::Close { handle, reply } => {
                let closed = if self.machine.state() == ConnectionState::FailingOver {
                    log::debug!("Queueing close of item {} until failover completes", handle);
                    self.watchlist.queue_close(handle)
                } else {
                    let sink = link_sink(&self.link, &self.codec);
                    self.watchlist.close(handle, as_dyn(&sink))
                };
                let _ = reply.send(closed);
            }
            Command::ModifyPolicy { options, reply } => {
                let _ = reply.send(self.modify_policy(options));
            }
            Command::ModifyReconnect { options, reply } => {
                let result = RuntimeReconfigurator::validate_reconnect(&options).map_err(SessionError::from).map(|_| {
                    log::info!("Reconnect options updated: {:?}", options);
                    self.supervisor.set_options(options);
                });
                let _ = reply.send(result);
            }
            Command::Fallback { reply } => {
                let started = self.evaluate(FailoverCause::ExplicitFallback);
                let _ = reply.send(started);
            }
            Command::Reconnect { reply } => {
                let idle = self.machine.state() == ConnectionState::Disconnected && self.pending.is_none();
                if idle {
                    log::info!("Reconnect requested by the application");
                    self.begin_initial_connect();
                }
                let _ = reply.send(idle);
            }
            Command::Info { reply } => {
                let _ = reply.send(self.channel_information());
            }
            Command::Items { reply } => {
                let _ = reply.send(self.watchlist.snapshot());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn modify_policy(&mut self, options: PreferredHostOptions) -> Result<bool, SessionError> {
        match self.reconfig.apply(options, &self.catalog)? {
            Changed::No => Ok(false),
            Changed::Yes(diff) => {
                if diff.affects_interval() {
                    self.arm_detection();
                }
                if diff.affects_schedule() {
                    self.schedule_guard.reset();
                }
                if self.machine.state().is_active() {
                    self.evaluate(FailoverCause::PolicyChanged);
                }
                Ok(true)
            }
        }
    }

    fn channel_information(&self) -> ChannelInformation {
        let policy = self.reconfig.current();
        let options = policy.options();
        let current = self.machine.current();

        let active_target = current.and_then(|target| {
            let channel = self.catalog.resolve(target)?;
            Some(TargetInfo {
                target,
                name: self.catalog.describe(target),
                host: channel.host.clone(),
                port: channel.port,
                warm_standby_mode: self.catalog.group(target).map(|g| g.mode),
            })
        });

        let remaining = self
            .detection_deadline
            .map(|at| at.saturating_duration_since(Instant::now()).as_secs())
            .unwrap_or(0);

        ChannelInformation {
            state: self.machine.state(),
            active_target,
            preferred_host_info: PreferredHostInfo {
                is_preferred_host_enabled: options.enabled,
                is_channel_preferred: self.machine.is_on_preferred(&policy, &self.catalog),
                channel_name: options.channel_name.clone(),
                wsb_channel_name: options.wsb_channel_name.clone(),
                detection_time_interval: options.detection_time_interval,
                detection_time_schedule: options.detection_time_schedule.clone(),
                remaining_detection_time: remaining,
                fall_back_within_wsb_group: options.fall_back_within_wsb_group,
            },
        }
    }

    // --- Detection ---

    fn arm_detection(&mut self) {
        self.detection_deadline = self.reconfig.current().detection_interval().map(|every| Instant::now() + every);
    }

    fn on_detection_tick(&mut self) {
        self.arm_detection();
        log::debug!("Detection interval fired");
        self.evaluate(FailoverCause::ScheduledCheck);
    }

    fn on_schedule_poll(&mut self) {
        let policy = self.reconfig.current();
        let Some(schedule) = policy.schedule() else { return };
        if self.schedule_guard.should_fire(schedule, &(self.clock)()) {
            log::debug!("Detection schedule '{}' fired", schedule.expression());
            self.evaluate(FailoverCause::ScheduledCheck);
        }
    }

    /// Runs the preferred-host check. Returns whether a fallback was started.
    fn evaluate(&mut self, cause: FailoverCause) -> bool {
        if self.pending.is_some() {
            log::debug!("Fallback check ({:?}) skipped: a connect is already in progress", cause);
            return false;
        }
        let policy = self.reconfig.current();
        match self.machine.evaluate(&policy, &self.catalog, cause) {
            Decision::NoOp => false,
            Decision::FailOver { target, cause } => self.start_fallback(target, cause),
        }
    }

    // --- Connecting ---

    fn spawn_connect(&mut self, phase: Phase, candidates: Vec<Candidate>, budget: Option<u32>) {
        let attempt = self.next_attempt;
        self.next_attempt += 1;

        let cancel = self.root.child_token();
        let token = cancel.clone();
        let supervisor = self.supervisor.clone();
        let events = self.events.clone();

        log::debug!(
            "Connect sequence {} ({:?}) over [{}]",
            attempt,
            phase,
            candidates.iter().map(|c| c.channel.name.as_str()).collect::<Vec<_>>().join(", ")
        );

        tokio::spawn(async move {
            let result = supervisor.connect_with_budget(&candidates, budget, &token).await;
            if let Some(events) = events.upgrade() {
                let _ = events.send(Event::ConnectOutcome { attempt, result });
            }
        });

        self.pending = Some(PendingConnect { attempt, phase, cancel });
    }

    /// Preferred candidates first, then the general list after `after`, with
    /// service-based groups ranked for the open items.
    fn connect_candidates(&self, preferred: Option<Target>, after: Option<Target>) -> Vec<Candidate> {
        let mut targets = ordered_candidates(&self.catalog, preferred, after);
        self.catalog.rank_for_services(&mut targets, &self.watchlist.services());
        self.catalog.candidates(&targets)
    }

    fn begin_initial_connect(&mut self) {
        self.machine.transition(ConnectionState::Connecting);
        let policy = self.reconfig.current();
        let preferred = self.machine.preferred_target(&policy, &self.catalog);
        let candidates = self.connect_candidates(preferred, None);
        let budget = self.supervisor.options().attempt_budget(candidates.len());
        self.spawn_connect(Phase::Initial, candidates, budget);
    }

    fn begin_general_connect(&mut self, cause: FailoverCause, from: Option<Target>) {
        self.machine.transition(ConnectionState::Connecting);
        let policy = self.reconfig.current();
        let preferred = policy.preferred_target(&self.catalog, from);
        let candidates = self.connect_candidates(preferred, from);
        let budget = self.supervisor.options().attempt_budget(candidates.len());
        self.spawn_connect(Phase::General { cause, from }, candidates, budget);
    }

    fn start_fallback(&mut self, target: Target, cause: FailoverCause) -> bool {
        let from = self.machine.current();
        let targets = fallback_candidates(&self.catalog, target, from, &self.watchlist.services());
        if targets.is_empty() {
            log::debug!(
                "Fallback check ({:?}): {} is already the best server for the open services",
                cause,
                self.describe(from).unwrap_or_default()
            );
            return false;
        }
        if !self.machine.transition(ConnectionState::FailingOver) {
            return false;
        }
        self.emit_channel(ChannelEvent::PreferredHostStartingFallback {
            from: self.describe(from),
            to: self.catalog.describe(target),
        });

        let candidates = self.catalog.candidates(&targets);
        // The old connection still serves; without a limit make one pass and stay put
        let budget = self
            .supervisor
            .options()
            .attempt_budget(candidates.len())
            .or(Some(candidates.len().max(1) as u32));
        self.spawn_connect(Phase::Preferred { cause, from }, candidates, budget);
        true
    }

    fn on_connect_outcome(&mut self, attempt: u64, result: Result<Established, ConnectError>) {
        let pending = match self.pending.take() {
            Some(pending) if pending.attempt == attempt => pending,
            other => {
                self.pending = other;
                log::debug!("Ignoring outcome of superseded connect sequence {}", attempt);
                return;
            }
        };

        match result {
            Ok(established) => self.on_connected(established, pending.phase),
            Err(ConnectError::Cancelled) => log::debug!("Connect sequence {} cancelled", attempt),
            Err(e) => self.on_connect_failed(e, pending.phase),
        }
    }

    fn on_connected(&mut self, established: Established, phase: Phase) {
        let Established { candidate, io, attempts } = established;
        let target = candidate.target;

        let conn = ConnectionId(self.next_conn);
        self.next_conn += 1;
        let link = spawn_link(conn, io, self.events.clone(), &self.root);
        let old = self.link.replace(link);
        let previous = self.machine.current();
        self.machine.set_current(Some(target));

        // Streams move before anything else touches the loop
        let sink = link_sink(&self.link, &self.codec);
        if let Some(sink) = &sink {
            self.watchlist.migrate(sink);
        }
        let closed = self.watchlist.apply_pending_closes(as_dyn(&sink));
        if !closed.is_empty() {
            log::debug!("Applied {} queued close(s)", closed.len());
        }
        if let Some(old) = old {
            log::info!("Closing previous connection {}", old.id());
            old.close();
        }

        self.machine.transition(FailoverStateMachine::active_state_for(target));
        log::info!("Session active on {} via {} after {} attempt(s)", self.catalog.describe(target), conn, attempts);

        self.emit_channel(ChannelEvent::ChannelUp { target: self.catalog.describe(target) });
        match phase {
            Phase::Initial => {}
            Phase::Preferred { cause, from } => {
                let event = self.machine.failover_event(&self.catalog, cause, from, target);
                self.emit_channel(ChannelEvent::Failover(event));
                self.emit_channel(ChannelEvent::PreferredHostComplete { active: self.describe(Some(target)) });
            }
            Phase::General { cause, from } => {
                let event = self.machine.failover_event(&self.catalog, cause, from.or(previous), target);
                self.emit_channel(ChannelEvent::Failover(event));
            }
        }

        self.arm_detection();
    }

    fn on_connect_failed(&mut self, error: ConnectError, phase: Phase) {
        match phase {
            Phase::Preferred { cause, from } => {
                let still_up = self.link.as_ref().is_some_and(|l| !l.is_closed());
                match (still_up, self.machine.current()) {
                    (true, Some(current)) => {
                        log::warn!("Fallback to preferred host failed ({}), staying on {}", error, self.catalog.describe(current));
                        self.machine.transition(FailoverStateMachine::active_state_for(current));
                        let sink = link_sink(&self.link, &self.codec);
                        self.watchlist.apply_pending_closes(as_dyn(&sink));
                        self.emit_channel(ChannelEvent::Warning { text: format!("preferred host unreachable: {}", error) });
                        self.emit_channel(ChannelEvent::PreferredHostComplete { active: self.describe(Some(current)) });
                        self.arm_detection();
                    }
                    _ => {
                        log::warn!("Preferred host unreachable ({}) and no live connection; using the general list", error);
                        self.emit_channel(ChannelEvent::PreferredHostComplete { active: None });
                        self.watchlist.apply_pending_closes(None);
                        self.begin_general_connect(cause, from);
                    }
                }
            }
            Phase::Initial | Phase::General { .. } => {
                log::error!("Every connection candidate failed: {}", error);
                self.park(SessionError::AttemptsExhausted(error.to_string()));
            }
        }
    }

    // --- Link traffic ---

    fn on_frame(&mut self, conn: ConnectionId, bytes: Bytes) {
        let msg = match self.codec.decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Undecodable frame on {}: {}", conn, e);
                return;
            }
        };
        let sink = link_sink(&self.link, &self.codec);
        if let Some(event) = self.watchlist.on_message(conn, msg, as_dyn(&sink)) {
            self.emit(Notification::Item(event));
        }
    }

    fn on_link_lost(&mut self, conn: ConnectionId, reason: &str) {
        if self.link.as_ref().map(|l| l.id()) != Some(conn) {
            log::debug!("Ignoring loss of retired connection {}", conn);
            return;
        }
        self.link = None;
        let lost = self.machine.current();
        self.machine.set_current(None);
        self.detection_deadline = None;

        log::warn!("Connection {} to {} lost: {}", conn, self.describe(lost).unwrap_or_default(), reason);
        for event in self.watchlist.on_connection_lost(reason) {
            self.emit(Notification::Item(event));
        }
        self.emit_channel(ChannelEvent::ChannelDownReconnecting {
            target: self.describe(lost).unwrap_or_default(),
            reason: reason.to_string(),
        });

        match self.machine.state() {
            ConnectionState::Active | ConnectionState::ActiveWarmStandby => {
                self.machine.transition(ConnectionState::FailingOver);
                self.begin_general_connect(FailoverCause::ConnectionLost, lost);
            }
            // A fallback is in flight; its outcome decides where we go
            ConnectionState::FailingOver => {}
            other => log::debug!("Connection loss in state {}", other),
        }
    }

    // --- Teardown ---

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel.cancel();
        }
    }

    /// Stops connecting. Items stay registered (unbound, waiting for a
    /// refresh) and the session waits in `Disconnected` for `reconnect()`.
    fn park(&mut self, error: SessionError) {
        self.link = None;
        self.machine.set_current(None);
        self.detection_deadline = None;
        self.machine.transition(ConnectionState::Disconnected);
        self.emit_channel(ChannelEvent::ChannelDown { error });
    }

    fn shutdown(&mut self) {
        if self.machine.state() == ConnectionState::Closed {
            return;
        }
        log::info!("Shutting down session");
        self.teardown("session shut down");
    }

    /// Closes every item (telling the live connection), stops all workers and
    /// moves to `Closed`.
    fn teardown(&mut self, text: &str) {
        self.cancel_pending();
        let sink = link_sink(&self.link, &self.codec);
        let events = self.watchlist.close_all(as_dyn(&sink), text);
        for event in events {
            self.emit(Notification::Item(event));
        }
        self.root.cancel();
        self.link = None;
        self.machine.set_current(None);
        self.detection_deadline = None;
        self.machine.transition(ConnectionState::Closed);
    }
}
