use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::actions::{self, Action, ActionKind};
use crate::api::Services;
use crate::model::PopupNotification;
use crate::thread::{Patch, ThreadState};

pub const DEFAULT_STATUS_RESET: Duration = Duration::from_secs(2);
pub const DEFAULT_NOTIFICATION_DURATION: Duration = Duration::from_millis(2600);

/// Label of the most recent intent. Only one is tracked at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionStatus {
    #[default]
    Idle,
    Running(ActionKind),
    Success(ActionKind),
    Failed(ActionKind),
}

impl ActionStatus {
    pub fn kind(&self) -> Option<ActionKind> {
        match self {
            ActionStatus::Idle => None,
            ActionStatus::Running(kind)
            | ActionStatus::Success(kind)
            | ActionStatus::Failed(kind) => Some(*kind),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ActionStatus::Running(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ActionStatus::Failed(_))
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStatus::Idle => Ok(()),
            ActionStatus::Running(kind) => write!(f, "{kind}:running"),
            ActionStatus::Success(kind) => write!(f, "{kind}:success"),
            ActionStatus::Failed(kind) => write!(f, "{kind}:failed"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub status_reset: Duration,
    pub notification_duration: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            status_reset: DEFAULT_STATUS_RESET,
            notification_duration: DEFAULT_NOTIFICATION_DURATION,
        }
    }
}

struct Completion {
    generation: u64,
    kind: ActionKind,
    result: Result<Option<Patch>>,
}

/// Owns the current thread snapshot and applies handler results to it.
///
/// `dispatch` runs the handler on a worker thread against the snapshot taken
/// at dispatch time; results are merged in arrival order by [`poll`], so
/// concurrent intents touching the same field resolve last-write-wins.
///
/// [`poll`]: Dispatcher::poll
pub struct Dispatcher {
    state: Arc<ThreadState>,
    services: Services,
    options: Options,
    status: ActionStatus,
    reset_at: Option<Instant>,
    generation: u64,
    in_flight: usize,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
}

impl Dispatcher {
    pub fn new(state: ThreadState, services: Services, options: Options) -> Self {
        let (completion_tx, completion_rx) = unbounded();
        Self {
            state: Arc::new(state),
            services,
            options,
            status: ActionStatus::Idle,
            reset_at: None,
            generation: 0,
            in_flight: 0,
            completion_tx,
            completion_rx,
        }
    }

    pub fn state(&self) -> &Arc<ThreadState> {
        &self.state
    }

    pub fn status(&self) -> ActionStatus {
        self.status
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Runs an intent on the calling thread and merges its result.
    pub fn dispatch_blocking(&mut self, action: Action) {
        let kind = self.begin(&action);
        let result = actions::handle(&action, &self.state, &self.services);
        self.finish(kind, result, Instant::now());
    }

    /// Starts an intent on a worker thread. The result is merged by `poll`.
    pub fn dispatch(&mut self, action: Action) {
        let kind = self.begin(&action);
        let state = self.state.clone();
        let services = self.services.clone();
        let tx = self.completion_tx.clone();
        let generation = self.generation;
        self.in_flight += 1;
        thread::spawn(move || {
            let result = actions::handle(&action, &state, &services);
            let _ = tx.send(Completion {
                generation,
                kind,
                result,
            });
        });
    }

    /// Dispatches by intent name. Unknown names are rejected before anything
    /// runs.
    pub fn dispatch_intent(&mut self, name: &str, payload: Option<Value>) -> Result<()> {
        let action = Action::from_intent(name, payload)?;
        self.dispatch(action);
        Ok(())
    }

    /// Drains finished handlers and fires the status timer. Returns true when
    /// anything observable changed.
    pub fn poll(&mut self) -> bool {
        let now = Instant::now();
        let mut changed = false;
        while let Ok(completion) = self.completion_rx.try_recv() {
            changed |= self.complete(completion, now);
        }
        changed | self.tick(now)
    }

    /// Blocks until one handler finishes or `timeout` passes.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        match self.completion_rx.recv_timeout(timeout) {
            Ok(completion) => self.complete(completion, Instant::now()),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Waits for every in-flight handler, up to `timeout` in total.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.wait(deadline - now);
        }
        true
    }

    /// Resets a success label once its delay has elapsed.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.reset_at {
            Some(at) if now >= at => {
                self.reset_at = None;
                self.status = ActionStatus::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn dismiss_notification(&mut self) {
        if self.state.popup_notification.is_some() {
            self.state = Arc::new(self.state.merge(Patch {
                popup_notification: Some(None),
                ..Default::default()
            }));
        }
    }

    /// Cancels the status timer and drops results of handlers still running.
    pub fn shutdown(&mut self) {
        self.reset_at = None;
        self.generation += 1;
        if self.in_flight > 0 {
            info!(pending = self.in_flight, "discarding in-flight actions");
        }
        self.in_flight = 0;
    }

    fn begin(&mut self, action: &Action) -> ActionKind {
        let kind = action.kind();
        self.reset_at = None;
        self.status = ActionStatus::Running(kind);
        debug!(action = %kind, "action started");
        kind
    }

    fn complete(&mut self, completion: Completion, now: Instant) -> bool {
        if completion.generation != self.generation {
            debug!(action = %completion.kind, "dropping result after shutdown");
            return false;
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        self.finish(completion.kind, completion.result, now);
        true
    }

    fn finish(&mut self, kind: ActionKind, result: Result<Option<Patch>>, now: Instant) {
        match result {
            Ok(patch) => {
                let failed = patch.as_ref().is_some_and(Patch::is_failure);
                if let Some(patch) = patch {
                    self.state = Arc::new(self.state.merge(patch));
                }
                if failed {
                    warn!(action = %kind, "action reported failure");
                    self.status = ActionStatus::Failed(kind);
                } else {
                    debug!(action = %kind, "action succeeded");
                    self.status = ActionStatus::Success(kind);
                    self.reset_at = Some(now + self.options.status_reset);
                }
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(action = %kind, error = %message, "action failed");
                let notification = PopupNotification::failure(
                    format!("{kind}:failed"),
                    message,
                    self.options.notification_duration,
                    self.state.popup_notification.as_ref(),
                );
                self.state = Arc::new(self.state.merge(Patch {
                    popup_notification: Some(Some(notification)),
                    ..Default::default()
                }));
                self.status = ActionStatus::Failed(kind);
            }
        }
    }
}
