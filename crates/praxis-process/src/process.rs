use std::fmt;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use praxis_clock::Clock;
use praxis_effect::Effect;
use praxis_types::{AskError, EventKind, EventSink, Fault, Instant, Millis, ProcessId};
use tokio::sync::{Notify, oneshot};

use crate::mailbox::{Enqueued, Mailbox, Queued};
use crate::system::System;

pub const DEFAULT_ASK_TIMEOUT: Millis = Millis::from_millis(5_000);

/// Lifecycle of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why a process is stopping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    Normal,
    Failure(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Failure(message) => write!(f, "failure: {message}"),
        }
    }
}

/// Handle used to answer an ask exactly once.
pub struct ReplyTo<R>(oneshot::Sender<R>);

impl<R> ReplyTo<R> {
    pub(crate) fn new(sender: oneshot::Sender<R>) -> Self {
        Self(sender)
    }

    /// Deliver the reply. Returns false when the asker is gone.
    pub fn send(self, value: R) -> bool {
        self.0.send(value).is_ok()
    }
}

impl<R> fmt::Debug for ReplyTo<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplyTo")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScheduleId(u64);

/// A long-lived actor: private state plus a message handler.
///
/// The actor value itself is the process state; the pump task owns it
/// exclusively, so `handle` can never be re-entered while an invocation is
/// in flight. A handler error fails the process.
#[async_trait]
pub trait Actor: Send + 'static {
    type Msg: Send + 'static;

    async fn handle(
        &mut self,
        msg: Self::Msg,
        tools: &mut Tools<Self::Msg>,
    ) -> anyhow::Result<()>;

    /// Invoked once when the process stops cooperatively. Errors are
    /// captured as `process:fail` events; the process still stops.
    async fn on_stop(
        &mut self,
        _reason: &StopReason,
        _tools: &mut Tools<Self::Msg>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

struct ScheduledMsg<M> {
    id: u64,
    fire_at_wall: i64,
    msg: M,
}

struct ProcState<M> {
    status: ProcessStatus,
    mailbox: Mailbox<M>,
    scheduled: Vec<ScheduledMsg<M>>,
    next_schedule_id: u64,
    should_stop: bool,
    stop_reason: Option<StopReason>,
}

pub(crate) struct Shared<M> {
    pid: ProcessId,
    clock: Arc<dyn Clock>,
    sink: EventSink,
    state: Mutex<ProcState<M>>,
    wake: Notify,
    terminal: Notify,
}

impl<M> Shared<M> {
    pub(crate) fn new(
        pid: ProcessId,
        clock: Arc<dyn Clock>,
        sink: EventSink,
        mailbox: Mailbox<M>,
    ) -> Self {
        Self {
            pid,
            clock,
            sink,
            state: Mutex::new(ProcState {
                status: ProcessStatus::Starting,
                mailbox,
                scheduled: Vec::new(),
                next_schedule_id: 1,
                should_stop: false,
                stop_reason: None,
            }),
            wake: Notify::new(),
            terminal: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProcState<M>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> ProcessStatus {
        self.lock().status
    }

    fn emit(&self, kind: EventKind) {
        self.sink.emit_at(self.clock.now(), kind);
    }

    fn emit_enqueue(&self, at: Instant, outcome: &Enqueued) {
        match outcome {
            Enqueued::Accepted { seq } => self.sink.emit_at(
                at,
                EventKind::MailboxEnqueue {
                    pid: self.pid,
                    seq: *seq,
                },
            ),
            Enqueued::AcceptedAfterDrop { seq, dropped_seq } => {
                self.sink.emit_at(
                    at,
                    EventKind::MailboxFull {
                        pid: self.pid,
                        dropped_seq: Some(*dropped_seq),
                    },
                );
                self.sink.emit_at(
                    at,
                    EventKind::MailboxEnqueue {
                        pid: self.pid,
                        seq: *seq,
                    },
                );
            }
            Enqueued::Rejected => self.sink.emit_at(
                at,
                EventKind::MailboxFull {
                    pid: self.pid,
                    dropped_seq: None,
                },
            ),
        }
    }

    /// Request a cooperative stop. Returns immediately; idempotent.
    pub(crate) fn request_stop(&self, reason: StopReason) {
        {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return;
            }
            if !state.should_stop {
                state.should_stop = true;
                state.stop_reason = Some(reason);
                state.scheduled.clear();
            }
        }
        self.wake.notify_one();
    }

    async fn wait_terminal(&self) {
        loop {
            let mut notified = pin!(self.terminal.notified());
            notified.as_mut().enable();
            if self.status().is_terminal() {
                return;
            }
            notified.await;
        }
    }
}

/// Externally-held capability to a process: send, ask, stop, observe.
pub struct ProcessRef<M> {
    shared: Arc<Shared<M>>,
}

impl<M> Clone for ProcessRef<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Send + 'static> ProcessRef<M> {
    pub(crate) fn new(shared: Arc<Shared<M>>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> ProcessId {
        self.shared.pid
    }

    pub fn status(&self) -> ProcessStatus {
        self.shared.status()
    }

    /// Enqueue a message. Returns false unless the process is running and
    /// the mailbox accepted it.
    pub fn send(&self, msg: M) -> bool {
        let at = self.shared.clock.now();
        let outcome = {
            let mut state = self.shared.lock();
            if state.status != ProcessStatus::Running || state.should_stop {
                return false;
            }
            state.mailbox.enqueue(msg, at)
        };
        self.shared.emit_enqueue(at, &outcome);
        self.shared.wake.notify_one();
        outcome.is_accepted()
    }

    /// Send a message carrying a reply handle and await the reply.
    ///
    /// Resolves on the first of: the reply, the timeout, or the process
    /// stopping (the reply handle is dropped with the mailbox). A process
    /// that is still `starting` is waited out first — a refused send is only
    /// transient there — so `Stopped` always means the process stopped.
    pub async fn ask<R: Send + 'static>(
        &self,
        build: impl FnOnce(ReplyTo<R>) -> M,
        timeout: Millis,
    ) -> Result<R, AskError> {
        let (tx, rx) = oneshot::channel();
        let msg = build(ReplyTo::new(tx));
        self.ready().await;
        if !self.send(msg) {
            return Err(if self.status() == ProcessStatus::Running {
                AskError::MailboxFull
            } else {
                AskError::Stopped
            });
        }
        let timer = self.shared.clock.sleep(timeout);
        tokio::select! {
            biased;
            reply = rx => reply.map_err(|_| AskError::Stopped),
            _ = timer => Err(AskError::Timeout(timeout)),
        }
    }

    /// [`ProcessRef::ask`] as a cancellable effect. Timeouts surface as
    /// `Fault::Timeout`; other ask failures as user errors.
    pub fn ask_effect<R: Send + 'static>(
        &self,
        build: impl FnOnce(ReplyTo<R>) -> M + Send + 'static,
        timeout: Millis,
    ) -> Effect<R, AskError> {
        let this = self.clone();
        Effect::new(move |env| {
            Box::pin(async move {
                tokio::select! {
                    biased;
                    reply = this.ask(build, timeout) => match reply {
                        Ok(value) => Ok(value),
                        Err(AskError::Timeout(limit)) => Err(Fault::Timeout(limit)),
                        Err(other) => Err(Fault::User(other)),
                    },
                    _ = env.cancel.cancelled() => Err(Fault::Interrupted),
                }
            })
        })
    }

    /// Stop the process and wait until it is fully stopped. Idempotent;
    /// stopping an already-terminal process returns immediately.
    pub async fn stop(&self, reason: StopReason) {
        self.shared.request_stop(reason);
        self.shared.wait_terminal().await;
    }

    /// Resolves once the process reaches `stopped` or `failed`.
    pub async fn terminated(&self) {
        self.shared.wait_terminal().await;
    }

    /// Resolves once the process has left `starting`.
    pub async fn ready(&self) {
        while self.status() == ProcessStatus::Starting {
            tokio::task::yield_now().await;
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<M>> {
        &self.shared
    }
}

impl<M> fmt::Debug for ProcessRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRef")
            .field("pid", &self.shared.pid)
            .field("status", &self.shared.status())
            .finish()
    }
}

/// Capabilities handed to the actor inside `handle` and `on_stop`.
pub struct Tools<M> {
    shared: Arc<Shared<M>>,
    system: System,
}

impl<M: Send + 'static> Tools<M> {
    pub(crate) fn new(shared: Arc<Shared<M>>, system: System) -> Self {
        Self { shared, system }
    }

    pub fn pid(&self) -> ProcessId {
        self.shared.pid
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.shared.clock)
    }

    pub fn emit(&self, kind: EventKind) {
        self.shared.emit(kind);
    }

    /// The system this process was spawned in; lets handlers spawn children.
    pub fn system(&self) -> &System {
        &self.system
    }

    /// Enqueue a message to this process itself. Never re-enters `handle`;
    /// the message waits its turn in the mailbox.
    pub fn send_self(&self, msg: M) -> bool {
        let at = self.shared.clock.now();
        let outcome = {
            let mut state = self.shared.lock();
            if state.should_stop {
                return false;
            }
            state.mailbox.enqueue(msg, at)
        };
        self.shared.emit_enqueue(at, &outcome);
        self.shared.wake.notify_one();
        outcome.is_accepted()
    }

    /// Record a self-message to surface in the mailbox at or after
    /// `now + after` on the wall track.
    pub fn schedule(&self, after: Millis, msg: M) -> ScheduleId {
        let fire_at_wall = self.shared.clock.now().wall_ms + after.as_i64();
        let id = {
            let mut state = self.shared.lock();
            let id = state.next_schedule_id;
            state.next_schedule_id += 1;
            state.scheduled.push(ScheduledMsg {
                id,
                fire_at_wall,
                msg,
            });
            id
        };
        self.shared.wake.notify_one();
        ScheduleId(id)
    }

    /// Cancel a scheduled self-message. Returns false when it already fired
    /// or was cancelled.
    pub fn cancel_schedule(&self, id: ScheduleId) -> bool {
        let mut state = self.shared.lock();
        let before = state.scheduled.len();
        state.scheduled.retain(|s| s.id != id.0);
        state.scheduled.len() < before
    }

    /// One-shot resolver with a clock-driven timeout: hand the reply handle
    /// to some external completion source and await it.
    pub async fn await_reply<R: Send + 'static>(
        &self,
        register: impl FnOnce(ReplyTo<R>),
        timeout: Millis,
    ) -> Result<R, AskError> {
        let (tx, rx) = oneshot::channel();
        register(ReplyTo::new(tx));
        let timer = self.shared.clock.sleep(timeout);
        tokio::select! {
            biased;
            reply = rx => reply.map_err(|_| AskError::Stopped),
            _ = timer => Err(AskError::Timeout(timeout)),
        }
    }
}

impl<M> fmt::Debug for Tools<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tools").field("pid", &self.shared.pid).finish()
    }
}

/// Start the pump task for a freshly spawned process.
///
/// One task per process: it promotes due scheduled messages, handles one
/// message at a time, yields between messages for fairness, and runs the
/// stop or failure path exactly once.
pub(crate) fn start<A: Actor>(mut actor: A, shared: Arc<Shared<A::Msg>>, system: System) {
    let mut tools = Tools::new(Arc::clone(&shared), system);
    tokio::spawn(async move {
        shared.lock().status = ProcessStatus::Running;
        shared.emit(EventKind::ProcessReady { pid: shared.pid });

        loop {
            if shared.lock().should_stop {
                break;
            }

            let now = shared.clock.now();
            let (queued, promotions) = {
                let mut state = shared.lock();
                let mut promotions = Vec::new();
                if !state.scheduled.is_empty() {
                    let pending = std::mem::take(&mut state.scheduled);
                    let (mut due, keep): (Vec<_>, Vec<_>) = pending
                        .into_iter()
                        .partition(|s| s.fire_at_wall <= now.wall_ms);
                    state.scheduled = keep;
                    due.sort_by_key(|s| (s.fire_at_wall, s.id));
                    for scheduled in due {
                        promotions.push(state.mailbox.enqueue(scheduled.msg, now));
                    }
                }
                (state.mailbox.dequeue(), promotions)
            };
            for outcome in &promotions {
                shared.emit_enqueue(now, outcome);
            }

            let Some(Queued { msg, seq, .. }) = queued else {
                let next_due = {
                    let state = shared.lock();
                    state.scheduled.iter().map(|s| s.fire_at_wall).min()
                };
                match next_due {
                    Some(due) => {
                        let wait = Millis::from_signed(due - shared.clock.now().wall_ms);
                        if wait.is_zero() {
                            continue;
                        }
                        let timer = shared.clock.sleep(wait);
                        tokio::select! {
                            _ = shared.wake.notified() => {}
                            _ = timer => {}
                        }
                    }
                    None => shared.wake.notified().await,
                }
                continue;
            };

            shared.emit(EventKind::MsgStart {
                pid: shared.pid,
                seq,
            });
            let started = shared.clock.now();
            match actor.handle(msg, &mut tools).await {
                Ok(()) => {
                    let finished = shared.clock.now();
                    shared.emit(EventKind::MsgEnd {
                        pid: shared.pid,
                        seq,
                        duration_ms: finished.mono_since(&started),
                    });
                    // Fairness: let siblings run between messages.
                    tokio::task::yield_now().await;
                }
                Err(error) => {
                    let message = format!("{error:#}");
                    shared.emit(EventKind::MsgError {
                        pid: shared.pid,
                        seq,
                        error: message.clone(),
                    });
                    {
                        let mut state = shared.lock();
                        state.status = ProcessStatus::Failed;
                        state.mailbox.clear();
                        state.scheduled.clear();
                    }
                    shared.emit(EventKind::ProcessFail {
                        pid: shared.pid,
                        error: message,
                    });
                    shared.terminal.notify_waiters();
                    return;
                }
            }
        }

        // Cooperative stop: drain nothing further, run on_stop, settle.
        let reason = {
            let mut state = shared.lock();
            state.status = ProcessStatus::Stopping;
            state.stop_reason.clone().unwrap_or(StopReason::Normal)
        };
        if let Err(error) = actor.on_stop(&reason, &mut tools).await {
            shared.emit(EventKind::ProcessFail {
                pid: shared.pid,
                error: format!("{error:#}"),
            });
            tracing::warn!(pid = %shared.pid, "on_stop failed");
        }
        {
            let mut state = shared.lock();
            state.status = ProcessStatus::Stopped;
            state.mailbox.clear();
            state.scheduled.clear();
        }
        shared.emit(EventKind::ProcessStop {
            pid: shared.pid,
            reason: reason.to_string(),
        });
        shared.terminal.notify_waiters();
    });
}
