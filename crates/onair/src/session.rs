//! Device session: one device instance from handshake to teardown.
//!
//! The session owns the scheduler, the state history and the command sink for
//! a single device, and runs the timeline-update pipeline:
//!
//! ```text
//! handle_state(timeline, mappings, T)
//!   -> Resolver      new state
//!   -> StateHistory  state in effect before max(now, T)
//!   -> Differ        ordered commands
//!   -> Scheduler     clear >= max(now, T), queue commands at T
//!   -> StateHistory  record new state at T
//! ```
//!
//! Lifecycle: `Uninitialized -> Connecting -> Ready <-> Degraded -> Terminated`.
//! Commands are accepted in every state but `Terminated`; while degraded they
//! are queued and reported as failures by the sink if it cannot deliver.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::command::Command;
use crate::differ::CommandGeneratorTree;
use crate::error::{DiffError, DispatchError, ResolutionError, SchedulingError, SessionError};
use crate::primitives::{DeviceId, LaneId, Timestamp};
use crate::resolver::{ContentProjector, FlattenProjector, Mappings, ResolvedTimelineState, Resolver};
use crate::scheduler::{
    log_event, Scheduler, SchedulerEvent, SchedulerObserver, SchedulerOptions,
};
use crate::state::{DeviceState, StateHistory};

/// Backend connection for one device.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Handshake with the device. `options` are the backend-specific settings
    /// from the device configuration.
    async fn connect(&self, options: &Value) -> anyhow::Result<()>;

    async fn send_command(&self, command: &Command) -> anyhow::Result<()>;

    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type LaneMapper = dyn Fn(&Command) -> LaneId + Send + Sync;

/// Everything device-type specific: how state maps to commands, how timeline
/// content maps to state, and which lane a command belongs to.
#[derive(Clone)]
pub struct DeviceProfile {
    pub name: String,
    pub tree: Arc<CommandGeneratorTree>,
    pub base_state: DeviceState,
    pub projector: Arc<dyn ContentProjector>,
    lanes: Option<Arc<LaneMapper>>,
}

impl DeviceProfile {
    pub fn new(name: impl Into<String>, tree: CommandGeneratorTree) -> Self {
        Self {
            name: name.into(),
            tree: Arc::new(tree),
            base_state: DeviceState::empty(),
            projector: Arc::new(FlattenProjector),
            lanes: None,
        }
    }

    /// State the device returns to when no layer constrains a field.
    pub fn with_base_state(mut self, base_state: DeviceState) -> Self {
        self.base_state = base_state;
        self
    }

    pub fn with_projector(mut self, projector: Arc<dyn ContentProjector>) -> Self {
        self.projector = projector;
        self
    }

    pub fn with_lanes<F>(mut self, lanes: F) -> Self
    where
        F: Fn(&Command) -> LaneId + Send + Sync + 'static,
    {
        self.lanes = Some(Arc::new(lanes));
        self
    }

    pub fn lane_for(&self, command: &Command) -> LaneId {
        match &self.lanes {
            Some(lanes) => lanes(command),
            None => LaneId::default(),
        }
    }
}

impl fmt::Debug for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceProfile")
            .field("name", &self.name)
            .field("tree", &self.tree)
            .field("base_state", &self.base_state)
            .field("lanes", &self.lanes.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Ready,
    Degraded,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Good,
    Warning,
    Bad,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub code: StatusCode,
    pub messages: Vec<String>,
}

/// What one `handle_state` call did.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    /// Commands queued, in queue order.
    pub commands: Vec<Command>,
    /// Not-yet-fired entries superseded by this update.
    pub cancelled: usize,
    /// No state was recorded before the effective time; the update
    /// was diffed against an empty state.
    pub prior_missing: bool,
    pub resolution_errors: Vec<ResolutionError>,
    pub diff_errors: Vec<DiffError>,
}

#[derive(Debug)]
struct Health {
    state: SessionState,
    last_failure: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scheduler observer that logs, tracks the last dispatch outcome for
/// status, and forwards to an optional extra observer.
struct SessionObserver {
    device: DeviceId,
    health: Arc<Mutex<Health>>,
    forward: Option<Arc<dyn SchedulerObserver<Command>>>,
}

impl SchedulerObserver<Command> for SessionObserver {
    fn publish(&self, event: SchedulerEvent<Command>) {
        let _span = tracing::debug_span!("device", device.id = %self.device).entered();
        log_event(&event);

        match &event {
            SchedulerEvent::DispatchFailed { error, .. } => {
                lock(&self.health).last_failure = Some(error.to_string());
            }
            SchedulerEvent::Settled { ok: true, .. } => {
                lock(&self.health).last_failure = None;
            }
            _ => {}
        }

        if let Some(forward) = &self.forward {
            forward.publish(event);
        }
    }
}

pub struct DeviceSession {
    device: DeviceId,
    profile: DeviceProfile,
    resolver: Resolver,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn CommandSink>,
    scheduler: Arc<Scheduler<Command>>,
    history: Mutex<StateHistory>,
    health: Arc<Mutex<Health>>,
    wake_loop: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceSession {
    pub fn new(
        device: impl Into<DeviceId>,
        profile: DeviceProfile,
        sink: Arc<dyn CommandSink>,
        clock: Arc<dyn Clock>,
        options: SchedulerOptions,
    ) -> Self {
        Self::with_observer(device, profile, sink, clock, options, None)
    }

    /// Like [`new`](Self::new), additionally forwarding every scheduler event
    /// to `observer`.
    pub fn with_observer(
        device: impl Into<DeviceId>,
        profile: DeviceProfile,
        sink: Arc<dyn CommandSink>,
        clock: Arc<dyn Clock>,
        options: SchedulerOptions,
        observer: Option<Arc<dyn SchedulerObserver<Command>>>,
    ) -> Self {
        let device = device.into();
        let health = Arc::new(Mutex::new(Health {
            state: SessionState::Uninitialized,
            last_failure: None,
        }));
        let session_observer = SessionObserver {
            device: device.clone(),
            health: Arc::clone(&health),
            forward: observer,
        };
        let scheduler = Scheduler::new(Arc::clone(&clock), options, Arc::new(session_observer));
        let resolver = Resolver::new(device.clone())
            .with_base(profile.base_state.clone())
            .with_projector(Arc::clone(&profile.projector));

        Self {
            device,
            profile,
            resolver,
            clock,
            sink,
            scheduler,
            history: Mutex::new(StateHistory::new()),
            health,
            wake_loop: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn state(&self) -> SessionState {
        lock(&self.health).state
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<Command>> {
        &self.scheduler
    }

    /// Times with a recorded device state, oldest first.
    pub fn history_times(&self) -> Vec<Timestamp> {
        lock(&self.history).times()
    }

    /// Handshake with the backend and start the wake loop.
    ///
    /// Retrying after a failed handshake is allowed; the session stays
    /// `Connecting` until one succeeds.
    pub async fn init(&self, options: Value) -> Result<(), SessionError> {
        {
            let mut health = lock(&self.health);
            match health.state {
                SessionState::Uninitialized | SessionState::Connecting => {
                    health.state = SessionState::Connecting;
                }
                SessionState::Terminated => {
                    return Err(SessionError::Terminated(self.device.clone()));
                }
                other => {
                    return Err(SessionError::InvalidState {
                        device: self.device.clone(),
                        operation: "init",
                        state: other.as_str(),
                    });
                }
            }
        }
        info!(device.id = %self.device, profile = %self.profile.name, "connecting");

        if let Err(source) = self.sink.connect(&options).await {
            warn!(device.id = %self.device, error = %source, "handshake failed");
            lock(&self.health).last_failure = Some(format!("handshake failed: {:#}", source));
            return Err(SessionError::Handshake {
                device: self.device.clone(),
                source,
            });
        }

        {
            let mut health = lock(&self.health);
            if health.state == SessionState::Terminated {
                return Err(SessionError::Terminated(self.device.clone()));
            }
            health.state = SessionState::Ready;
            health.last_failure = None;
        }
        *lock(&self.wake_loop) = Some(self.scheduler.start());
        info!(device.id = %self.device, mode = %self.scheduler.options().mode, "device ready");
        Ok(())
    }

    /// Backend connection callback: `false` degrades a ready session, `true`
    /// restores a degraded one. Ignored in other states.
    pub fn set_connected(&self, connected: bool) {
        let mut health = lock(&self.health);
        let next = match (health.state, connected) {
            (SessionState::Ready, false) => SessionState::Degraded,
            (SessionState::Degraded, true) => SessionState::Ready,
            _ => return,
        };
        info!(device.id = %self.device, from = %health.state, to = %next, "connection changed");
        health.state = next;
    }

    pub fn get_status(&self) -> DeviceStatus {
        let health = lock(&self.health);
        let mut messages = Vec::new();
        let code = match health.state {
            SessionState::Ready if health.last_failure.is_none() => StatusCode::Good,
            SessionState::Ready => StatusCode::Warning,
            SessionState::Uninitialized => {
                messages.push("not initialized".to_string());
                StatusCode::Bad
            }
            SessionState::Connecting => {
                messages.push("connecting".to_string());
                StatusCode::Bad
            }
            SessionState::Degraded => {
                messages.push("disconnected".to_string());
                StatusCode::Bad
            }
            SessionState::Terminated => {
                messages.push("terminated".to_string());
                StatusCode::Bad
            }
        };
        if let Some(failure) = &health.last_failure {
            messages.push(failure.clone());
        }
        DeviceStatus { code, messages }
    }

    /// Re-plan the device for a timeline update effective at `time`.
    pub fn handle_state(
        &self,
        timeline: &ResolvedTimelineState,
        mappings: &Mappings,
        time: Timestamp,
    ) -> Result<StateUpdate, SessionError> {
        if self.state() == SessionState::Terminated {
            return Err(SessionError::Terminated(self.device.clone()));
        }
        if time.0 < 0 {
            return Err(SchedulingError::NegativeTime(time).into());
        }

        let resolution = self.resolver.resolve(timeline, mappings, time);
        let now = self.clock.now();
        let effective = now.max(time);

        let mut history = lock(&self.history);
        let prior = history.state_before(effective);
        let prior_missing = prior.is_missing();
        if prior_missing {
            debug!(device.id = %self.device, effective = effective.0, "no prior state, diffing against empty");
        }
        let old_state = prior.into_state();

        let diff = self.profile.tree.diff(&old_state, &resolution.state);
        let cancelled = self.scheduler.clear_queue_now_and_after(effective);

        for command in &diff.commands {
            let lane = self.profile.lane_for(command);
            let sink = Arc::clone(&self.sink);
            self.scheduler.queue(time, lane, command.clone(), move |command| async move {
                sink.send_command(&command)
                    .await
                    .map_err(|e| DispatchError::for_command(&command, format!("{:#}", e)))
            })?;
        }

        history.record(time, resolution.state);
        let horizon = self
            .scheduler
            .earliest_pending()
            .map_or(now, |earliest| earliest.min(now));
        history.prune(horizon);

        info!(
            device.id = %self.device,
            time = time.0,
            queued = diff.commands.len(),
            cancelled,
            "timeline update planned"
        );

        Ok(StateUpdate {
            commands: diff.commands,
            cancelled,
            prior_missing,
            resolution_errors: resolution.errors,
            diff_errors: diff.errors,
        })
    }

    /// Cancel everything pending, stop the wake loop and release the backend.
    /// Safe to call more than once.
    pub async fn terminate(&self) {
        {
            let mut health = lock(&self.health);
            if health.state == SessionState::Terminated {
                return;
            }
            health.state = SessionState::Terminated;
        }

        self.scheduler.dispose();
        let wake_loop = lock(&self.wake_loop).take();
        if let Some(handle) = wake_loop {
            if let Err(e) = handle.await {
                warn!(device.id = %self.device, error = %e, "wake loop ended abnormally");
            }
        }
        if let Err(e) = self.sink.disconnect().await {
            warn!(device.id = %self.device, error = %e, "disconnect failed");
        }
        lock(&self.history).clear();
        info!(device.id = %self.device, "device terminated");
    }
}
