//! Shared state of one iteration and the handoff of control between machine threads.
//!
//! Every machine runs on its own OS thread, but only the thread named by `Inner::current` is
//! allowed to make progress. At a suspension point the running machine asks the strategy for the
//! next machine, records the decision, wakes everyone through the condition variable and parks
//! until control comes back to it. The engine thread waits on the same condition variable until
//! the iteration stops.

use crate::cache::{Capture, MonitorStatus, ProgramState, StateCache};
use crate::engine::{Outcome, Truncation};
use crate::event::{short_type_name, AnyEvent};
use crate::liveness::LivenessChecker;
use crate::machine::instance;
use crate::machine::monitor::{MonitorInstance, MonitorRecord, MonitorSlot};
use crate::machine::{ActionError, ActionResult, ActorId, Declaration, Disposition, MailboxPolicy, Machine, Monitor};
use crate::report::BugKind;
use crate::strategy::Strategy;
use crate::trace::{Choice, ScheduleTrace};
use crate::{fingerprint, stable_hash, Fingerprint};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::TypeId;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

mod task;

pub use task::{TaskInfo, TaskRegistry};
pub(crate) use task::schedulable;

pub(crate) type ReceiveFilter = Box<dyn Fn(&AnyEvent) -> bool + Send>;

/// Where a machine is in its life, as far as scheduling is concerned.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    /// Created, but the start state's entry action has not completed.
    Starting,
    Running,
    /// Waiting for the mailbox to yield an event.
    Idle,
    /// Waiting for the start of the given machine to complete.
    Creating(ActorId),
    BlockedOnReceive,
    BlockedOnActors,
    Halted,
}

pub(crate) struct ActorRecord {
    id: ActorId,
    name: &'static str,
    path: &'static str,
    policy: Arc<dyn MailboxPolicy>,
    lifecycle: Lifecycle,
    /// The initial activation has completed or the machine halted during it.
    activated: bool,
    stack: Vec<&'static str>,
    mailbox: VecDeque<AnyEvent>,
    waiting: Option<ReceiveFilter>,
    delivered: Option<AnyEvent>,
    digest: u64,
    /// Decisions the machine made since it last dequeued an event.
    program_counter: usize,
}

impl ActorRecord {
    fn label(&self) -> String {
        format!("{}{}", self.name, self.id)
    }

    fn has_deliverable(&self) -> bool {
        self.mailbox
            .iter()
            .any(|e| self.policy.disposition(&self.stack, e.kind()) != Disposition::Defer)
    }
}

/// Everything that distinguishes one machine's state, without its identifier.
impl Hash for ActorRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.lifecycle.hash(state);
        self.activated.hash(state);
        self.stack.hash(state);
        self.mailbox.hash(state);
        self.delivered.hash(state);
        self.digest.hash(state);
        self.program_counter.hash(state);
    }
}

/// Bounds and switches that apply to one iteration.
#[derive(Clone, Debug, Default)]
pub(crate) struct Limits {
    pub(crate) max_steps: Option<usize>,
    pub(crate) depth_bound: Option<usize>,
    pub(crate) capture_states: bool,
    pub(crate) check_liveness: bool,
    pub(crate) prune: bool,
}

pub(crate) struct Inner {
    limits: Limits,
    current: Option<ActorId>,
    stopped: bool,
    outcome: Option<Outcome>,
    tasks: TaskRegistry,
    actors: Vec<ActorRecord>,
    monitors: Vec<MonitorRecord>,
    strategy: Option<Box<dyn Strategy>>,
    schedule: ScheduleTrace,
    program_trace: ScheduleTrace,
    cache: StateCache,
    liveness: LivenessChecker,
    fingerprints: Vec<Fingerprint>,
    steps: usize,
    dropped_events: usize,
    handles: Vec<JoinHandle<()>>,
}

/// What an iteration leaves behind once its threads are gone.
pub(crate) struct Finished {
    pub(crate) outcome: Outcome,
    pub(crate) schedule: ScheduleTrace,
    pub(crate) strategy: Option<Box<dyn Strategy>>,
    pub(crate) cache: StateCache,
    pub(crate) liveness: LivenessChecker,
    pub(crate) fingerprints: Vec<Fingerprint>,
    pub(crate) steps: usize,
    pub(crate) dropped_events: usize,
}

impl Inner {
    pub(crate) fn new(
        limits: Limits,
        strategy: Box<dyn Strategy>,
        mut cache: StateCache,
        liveness: LivenessChecker,
    ) -> Self {
        cache.start_iteration();
        Inner {
            limits,
            current: None,
            stopped: false,
            outcome: None,
            tasks: TaskRegistry::new(),
            actors: Vec::new(),
            monitors: Vec::new(),
            strategy: Some(strategy),
            schedule: ScheduleTrace::new(),
            program_trace: ScheduleTrace::new(),
            cache,
            liveness,
            fingerprints: Vec::new(),
            steps: 0,
            dropped_events: 0,
            handles: Vec::new(),
        }
    }

    fn label(&self, id: ActorId) -> String {
        match self.actors.get(id.index()) {
            Some(record) => record.label(),
            None => id.to_string(),
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        if self.outcome.is_none() {
            match &outcome {
                Outcome::Bug { kind, message } => log::debug!("{:?}: {}", kind, message),
                other => log::trace!("iteration ends: {:?}", other),
            }
            self.outcome = Some(outcome);
        }
        self.stopped = true;
        self.current = None;
    }

    fn set_digest(&mut self, id: ActorId, digest: u64) {
        if let Some(record) = self.actors.get_mut(id.index()) {
            record.digest = digest;
        }
    }

    fn count_decision(&mut self, id: ActorId) {
        if let Some(record) = self.actors.get_mut(id.index()) {
            record.program_counter += 1;
        }
    }

    fn joined(&self, ids: &[ActorId], all: bool) -> bool {
        let halted = |id: &ActorId| {
            self.actors
                .get(id.index())
                .map_or(true, |r| r.lifecycle == Lifecycle::Halted)
        };
        if all {
            ids.iter().all(halted)
        } else {
            ids.iter().any(halted)
        }
    }

    /// Derives the task flags from the machine records, releasing joins that are satisfied.
    fn sync_tasks(&mut self) {
        for i in 0..self.actors.len() {
            let id = ActorId::from(i);
            if self.actors[i].lifecycle == Lifecycle::BlockedOnActors {
                let released = self
                    .tasks
                    .get(id)
                    .map_or(true, |t| self.joined(&t.blocked_on, t.wait_all));
                if released {
                    self.actors[i].lifecycle = Lifecycle::Running;
                    if let Some(task) = self.tasks.get_mut(id) {
                        task.blocked_on.clear();
                    }
                }
            }
            let record = &self.actors[i];
            let enabled = match record.lifecycle {
                Lifecycle::Starting | Lifecycle::Running => true,
                Lifecycle::Idle => record.has_deliverable(),
                Lifecycle::Creating(child) => {
                    self.actors.get(child.index()).map_or(true, |c| c.activated)
                }
                Lifecycle::BlockedOnReceive | Lifecycle::BlockedOnActors | Lifecycle::Halted => false,
            };
            let blocked = matches!(
                record.lifecycle,
                Lifecycle::BlockedOnReceive | Lifecycle::BlockedOnActors
            );
            let started = record.lifecycle != Lifecycle::Starting;
            let completed = record.lifecycle == Lifecycle::Halted;
            let active = self.current == Some(id);
            if let Some(task) = self.tasks.get_mut(id) {
                task.enabled = enabled;
                task.blocked = blocked;
                task.started = started;
                task.completed = completed;
                task.active = active;
            }
        }
    }

    fn step_bound_reached(&self) -> bool {
        self.limits.max_steps.map_or(false, |max| self.steps >= max)
    }

    fn record(&mut self, choice: Choice) {
        self.steps += 1;
        self.schedule.push(choice.clone());
        self.program_trace.push(choice);
    }

    /// Why no decision could be made.
    fn refusal(&self) -> Outcome {
        match self.strategy.as_ref().and_then(|s| s.error()) {
            Some(error) => Outcome::StrategyFailed(error),
            None => Outcome::Explored,
        }
    }

    /// The outcome once no machine is schedulable, or the strategy declined to choose.
    fn quiescence(&mut self) -> Outcome {
        if self.tasks.schedulable().next().is_some() {
            return self.refusal();
        }
        if let Some(error) = self.strategy.as_ref().and_then(|s| s.error()) {
            return Outcome::StrategyFailed(error);
        }
        if self.tasks.any_blocked() {
            let blocked: Vec<String> = self
                .actors
                .iter()
                .filter(|r| {
                    matches!(r.lifecycle, Lifecycle::BlockedOnReceive | Lifecycle::BlockedOnActors)
                })
                .map(ActorRecord::label)
                .collect();
            return Outcome::bug(
                BugKind::Deadlock,
                format!("deadlock detected: {} waiting with no machine able to run", blocked.join(", ")),
            );
        }
        let statuses = self.monitor_statuses();
        match self.liveness.check_at_termination(statuses) {
            Some(violation) => Outcome::bug(BugKind::LivenessViolation, violation.to_string()),
            None => Outcome::Quiescent,
        }
    }

    fn monitor_statuses(&self) -> Vec<(&'static str, MonitorStatus)> {
        self.monitors.iter().map(|m| (m.path, m.status)).collect()
    }

    fn capture_state(&self) -> ProgramState {
        let mut actors: Vec<u64> = self.actors.iter().map(stable_hash).collect();
        actors.sort_unstable();
        let mut monitors: Vec<u64> = self.monitors.iter().map(stable_hash).collect();
        monitors.sort_unstable();
        ProgramState::new(
            fingerprint(&(actors, monitors)),
            self.tasks.schedulable(),
            self.monitor_statuses(),
        )
    }

    /// Captures the program state after a decision and runs the checks that depend on it.
    fn after_step(&mut self) -> Option<Outcome> {
        if self.limits.capture_states {
            let state = self.capture_state();
            let fp = state.fingerprint();
            self.fingerprints.push(fp);
            let step = self.program_trace.peek_mut()?;
            let index = step.index();
            step.set_state(state);
            match self.cache.capture(index, fp) {
                Capture::Revisited if self.limits.check_liveness => {
                    let violation = self.liveness.check_at_trace_cycle(
                        fp,
                        &mut self.program_trace,
                        &mut self.cache,
                    );
                    if let Some(violation) = violation {
                        return Some(Outcome::bug(BugKind::LivenessViolation, violation.to_string()));
                    }
                }
                Capture::SeenInEarlierIteration if self.limits.prune => {
                    let replaying = self.strategy.as_ref().map_or(true, |s| s.in_prefix());
                    if !replaying {
                        return Some(Outcome::Pruned);
                    }
                }
                _ => {}
            }
        }
        if self.limits.check_liveness {
            let statuses = self.monitor_statuses();
            if let Some(violation) = self.liveness.check_temperature(statuses) {
                return Some(Outcome::bug(BugKind::LivenessViolation, violation.to_string()));
            }
        }
        None
    }
}

/// State shared by the engine and the machine threads of one iteration.
pub(crate) struct Shared {
    inner: Mutex<Inner>,
    turn: Condvar,
    /// Locked before `inner` whenever both are held.
    monitors: Mutex<Vec<Box<dyn MonitorSlot>>>,
}

impl Shared {
    pub(crate) fn new(inner: Inner) -> Arc<Self> {
        Arc::new(Shared {
            inner: Mutex::new(inner),
            turn: Condvar::new(),
            monitors: Mutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    fn stop(&self, inner: &mut Inner, outcome: Outcome) -> ActionError {
        inner.finish(outcome);
        self.turn.notify_all();
        ActionError::Stopped
    }

    /// Ends the iteration with a bug. The first outcome recorded wins.
    pub(crate) fn fail(&self, kind: BugKind, message: String) -> ActionError {
        let mut g = self.lock();
        self.stop(&mut g, Outcome::bug(kind, message))
    }

    fn wait_turn(&self, g: &mut MutexGuard<'_, Inner>, me: ActorId) -> ActionResult {
        loop {
            if g.stopped {
                return Err(ActionError::Stopped);
            }
            if g.current == Some(me) {
                return Ok(());
            }
            self.turn.wait(g);
        }
    }

    /// Asks the strategy for the next machine and hands control to it. When `park` is set the
    /// caller `me` waits until it is scheduled again.
    fn schedule(&self, g: &mut MutexGuard<'_, Inner>, me: Option<ActorId>, park: bool) -> ActionResult {
        if g.stopped {
            return Err(ActionError::Stopped);
        }
        let inner = &mut **g;
        if inner.step_bound_reached() {
            return Err(self.stop(inner, Outcome::Truncated(Truncation::MaxSteps)));
        }
        inner.sync_tasks();
        let next = match inner.strategy.as_mut() {
            Some(strategy) => strategy.next_actor(inner.tasks.as_slice(), me),
            None => None,
        };
        let next = match next {
            Some(next) => next,
            None => {
                let outcome = inner.quiescence();
                return Err(self.stop(inner, outcome));
            }
        };
        if !inner.tasks.get(next).map_or(false, TaskInfo::is_schedulable) {
            let outcome = Outcome::StrategyFailed(format!("scheduled {} which cannot run", next));
            return Err(self.stop(inner, outcome));
        }
        if me != Some(next) {
            log::trace!(
                "{} -> {}",
                me.map_or_else(|| "setup".to_owned(), |me| inner.label(me)),
                inner.label(next)
            );
        }
        if let (Some(me), true) = (me, park) {
            inner.count_decision(me);
        }
        inner.current = Some(next);
        inner.record(Choice::Schedule(next));
        inner.sync_tasks();
        if let Some(outcome) = inner.after_step() {
            return Err(self.stop(inner, outcome));
        }
        self.turn.notify_all();
        match me {
            Some(me) if park => {
                self.wait_turn(g, me)?;
                if let Some(record) = g.actors.get_mut(me.index()) {
                    record.lifecycle = Lifecycle::Running;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Makes the first scheduling decision and blocks the engine thread until the iteration
    /// stops. Past the deadline the iteration is stopped, which takes effect once the running
    /// machine reaches the runtime again.
    pub(crate) fn drive(&self, deadline: Option<Instant>) {
        let mut g = self.lock();
        if self.schedule(&mut g, None, false).is_err() {
            return;
        }
        while !g.stopped {
            match deadline {
                Some(deadline) => {
                    if self.turn.wait_until(&mut g, deadline).timed_out() && !g.stopped {
                        self.stop(&mut g, Outcome::Truncated(Truncation::Timeout));
                    }
                }
                None => self.turn.wait(&mut g),
            }
        }
    }

    /// Stops the iteration from outside the machines.
    pub(crate) fn abort(&self, outcome: Outcome) {
        let mut g = self.lock();
        self.stop(&mut g, outcome);
    }

    /// Joins machine threads until none are left.
    pub(crate) fn join_threads(&self) {
        loop {
            let handles = std::mem::take(&mut self.lock().handles);
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if handle.join().is_err() {
                    log::debug!("a machine thread panicked outside of an action");
                }
            }
        }
    }

    /// Takes the results of the iteration. Must be called after [`Shared::join_threads`].
    pub(crate) fn finish(&self) -> Finished {
        let mut g = self.lock();
        let inner = &mut *g;
        Finished {
            outcome: inner.outcome.take().unwrap_or(Outcome::Quiescent),
            schedule: std::mem::take(&mut inner.schedule),
            strategy: inner.strategy.take(),
            cache: std::mem::take(&mut inner.cache),
            liveness: std::mem::take(&mut inner.liveness),
            fingerprints: std::mem::take(&mut inner.fingerprints),
            steps: inner.steps,
            dropped_events: inner.dropped_events,
        }
    }

    /// Adds the record of a new machine and starts its thread, which waits for its first turn.
    fn spawn<M: Machine>(
        self: &Arc<Self>,
        g: &mut MutexGuard<'_, Inner>,
        machine: M,
        init: Option<AnyEvent>,
    ) -> ActorId {
        let name = short_type_name::<M>();
        let decl = Arc::new(Declaration::build(name, M::declare));
        let id = ActorId::from(g.actors.len());
        g.actors.push(ActorRecord {
            id,
            name,
            path: std::any::type_name::<M>(),
            policy: decl.clone(),
            lifecycle: Lifecycle::Starting,
            activated: false,
            stack: Vec::new(),
            mailbox: VecDeque::new(),
            waiting: None,
            delivered: None,
            digest: Machine::hashed_state(&machine),
            program_counter: 0,
        });
        g.tasks.register(id);
        let shared = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("actor-{}", id.index()))
            .spawn(move || instance::run(shared, id, machine, decl, init))
            .expect("Failed to spawn a machine thread");
        g.handles.push(handle);
        id
    }

    /// Creates a machine before the first scheduling decision of an iteration.
    pub(crate) fn create_root<M: Machine>(self: &Arc<Self>, machine: M, init: Option<AnyEvent>) -> ActorId {
        let mut g = self.lock();
        let id = self.spawn(&mut g, machine, init);
        log::trace!("setup created {}", g.label(id));
        id
    }

    /// Creates a machine on behalf of a running one. This is a suspension point before the
    /// machine exists, after which control passes straight to the new machine until its start
    /// state has been entered.
    pub(crate) fn create<M: Machine>(
        self: &Arc<Self>,
        me: ActorId,
        digest: u64,
        machine: M,
        init: Option<AnyEvent>,
    ) -> Result<ActorId, ActionError> {
        let mut g = self.lock();
        g.set_digest(me, digest);
        self.schedule(&mut g, Some(me), true)?;
        let id = self.spawn(&mut g, machine, init);
        log::trace!("{} created {}", g.label(me), g.label(id));
        // The child's initial activation is part of the call.
        if let Some(record) = g.actors.get_mut(me.index()) {
            record.lifecycle = Lifecycle::Creating(id);
        }
        g.current = Some(id);
        self.turn.notify_all();
        self.wait_turn(&mut g, me)?;
        if let Some(record) = g.actors.get_mut(me.index()) {
            record.lifecycle = Lifecycle::Running;
        }
        Ok(id)
    }

    /// Blocks a freshly spawned machine until it is scheduled for the first time.
    pub(crate) fn first_turn(&self, me: ActorId) -> ActionResult {
        let mut g = self.lock();
        self.wait_turn(&mut g, me)
    }

    /// Mirrors the state stack of a machine, checking the depth bound.
    pub(crate) fn publish_stack(&self, me: ActorId, stack: &[&'static str]) -> ActionResult {
        let mut g = self.lock();
        if g.stopped {
            return Err(ActionError::Stopped);
        }
        if g.limits.depth_bound.map_or(false, |bound| stack.len() > bound) {
            return Err(self.stop(&mut g, Outcome::Truncated(Truncation::DepthBound)));
        }
        if let Some(record) = g.actors.get_mut(me.index()) {
            record.stack.clear();
            record.stack.extend_from_slice(stack);
        }
        Ok(())
    }

    /// The start state has been entered. A machine created by another one hands control back to
    /// its creator and waits to be scheduled; others go on to their mailbox.
    pub(crate) fn activated(&self, me: ActorId, digest: u64) -> ActionResult {
        let mut g = self.lock();
        if g.stopped {
            return Err(ActionError::Stopped);
        }
        let creator = g
            .actors
            .iter()
            .find(|r| r.lifecycle == Lifecycle::Creating(me))
            .map(|r| r.id);
        if let Some(record) = g.actors.get_mut(me.index()) {
            record.lifecycle = match creator {
                Some(_) => Lifecycle::Idle,
                None => Lifecycle::Running,
            };
            record.activated = true;
            record.digest = digest;
        }
        let creator = match creator {
            Some(creator) => creator,
            None => return Ok(()),
        };
        g.current = Some(creator);
        self.turn.notify_all();
        self.wait_turn(&mut g, me)?;
        if let Some(record) = g.actors.get_mut(me.index()) {
            record.lifecycle = Lifecycle::Running;
        }
        Ok(())
    }

    /// Removes the first event of the mailbox that is not deferred, dropping ignored events on
    /// the way.
    pub(crate) fn dequeue(&self, me: ActorId) -> Result<Option<AnyEvent>, ActionError> {
        let mut g = self.lock();
        if g.stopped {
            return Err(ActionError::Stopped);
        }
        let record = match g.actors.get_mut(me.index()) {
            Some(record) => record,
            None => return Ok(None),
        };
        let mut i = 0;
        while i < record.mailbox.len() {
            match record.policy.disposition(&record.stack, record.mailbox[i].kind()) {
                Disposition::Defer => i += 1,
                Disposition::Ignore => {
                    if let Some(event) = record.mailbox.remove(i) {
                        log::trace!("{} ignored {:?}", record.label(), event);
                    }
                }
                Disposition::Handle | Disposition::Unhandled => {
                    record.program_counter = 0;
                    return Ok(record.mailbox.remove(i));
                }
            }
        }
        Ok(None)
    }

    /// Puts a raised event that the current state defers at the front of the mailbox.
    pub(crate) fn requeue(&self, me: ActorId, event: AnyEvent) -> ActionResult {
        let mut g = self.lock();
        if g.stopped {
            return Err(ActionError::Stopped);
        }
        if let Some(record) = g.actors.get_mut(me.index()) {
            record.mailbox.push_front(event);
        }
        Ok(())
    }

    /// The mailbox has nothing to offer. This is a decision point.
    pub(crate) fn idle(&self, me: ActorId, digest: u64) -> ActionResult {
        let mut g = self.lock();
        if let Some(record) = g.actors.get_mut(me.index()) {
            record.lifecycle = Lifecycle::Idle;
            record.digest = digest;
        }
        self.schedule(&mut g, Some(me), true)
    }

    /// The machine has halted. Its pending events are dropped and control moves on without the
    /// machine waiting for it.
    pub(crate) fn halted(&self, me: ActorId, digest: u64) {
        let mut g = self.lock();
        let inner = &mut *g;
        if let Some(record) = inner.actors.get_mut(me.index()) {
            record.lifecycle = Lifecycle::Halted;
            record.activated = true;
            record.stack.clear();
            record.waiting = None;
            record.digest = digest;
            let drained = record.mailbox.len();
            record.mailbox.clear();
            if drained > 0 {
                log::debug!("{} halted, dropping {} pending events", record.label(), drained);
            }
            inner.dropped_events += drained;
        }
        // Stopping is already recorded when this fails.
        let _ = self.schedule(&mut g, Some(me), false);
    }

    pub(crate) fn send(&self, me: ActorId, digest: u64, target: ActorId, event: AnyEvent) -> ActionResult {
        let mut g = self.lock();
        g.set_digest(me, digest);
        self.schedule(&mut g, Some(me), true)?;
        let inner = &mut *g;
        let sender = inner.label(me);
        let record = match inner.actors.get_mut(target.index()) {
            Some(record) => record,
            None => {
                let outcome = Outcome::bug(
                    BugKind::AssertionFailure,
                    format!("{} sent {} to unknown machine {}", sender, event.kind(), target),
                );
                return Err(self.stop(inner, outcome));
            }
        };
        if record.lifecycle == Lifecycle::Halted {
            log::debug!("{} sent {:?} to halted {}, dropping it", sender, event, record.label());
            inner.dropped_events += 1;
            return Ok(());
        }
        if record.lifecycle == Lifecycle::BlockedOnReceive
            && record.waiting.as_ref().map_or(false, |accepts| accepts(&event))
        {
            log::trace!("{} delivered {:?} to waiting {}", sender, event, record.label());
            record.waiting = None;
            record.delivered = Some(event);
            record.lifecycle = Lifecycle::Running;
            return Ok(());
        }
        if let Some(max) = event.max_instances() {
            let queued = record.mailbox.iter().filter(|e| e.kind() == event.kind()).count();
            if queued >= max {
                let outcome = Outcome::bug(
                    BugKind::AssertionFailure,
                    format!(
                        "{} sent {} to {}, exceeding the bound of {} queued instances",
                        sender,
                        event.kind(),
                        record.label(),
                        max
                    ),
                );
                return Err(self.stop(inner, outcome));
            }
        }
        log::trace!("{} sent {:?} to {}", sender, event, record.label());
        record.mailbox.push_back(event);
        Ok(())
    }

    /// Takes the first queued event accepted by `filter`, or blocks until one is sent.
    pub(crate) fn receive(&self, me: ActorId, digest: u64, filter: ReceiveFilter) -> Result<AnyEvent, ActionError> {
        let mut g = self.lock();
        if g.stopped {
            return Err(ActionError::Stopped);
        }
        let record = match g.actors.get_mut(me.index()) {
            Some(record) => record,
            None => return Err(ActionError::Stopped),
        };
        if let Some(position) = record.mailbox.iter().position(|e| filter(e)) {
            if let Some(event) = record.mailbox.remove(position) {
                return Ok(event);
            }
        }
        record.digest = digest;
        record.waiting = Some(filter);
        record.lifecycle = Lifecycle::BlockedOnReceive;
        self.schedule(&mut g, Some(me), true)?;
        match g.actors.get_mut(me.index()).and_then(|r| r.delivered.take()) {
            Some(event) => Ok(event),
            None => {
                let message = format!("{} resumed from a receive without an event", g.label(me));
                Err(self.stop(&mut g, Outcome::StrategyFailed(message)))
            }
        }
    }

    /// Blocks until all (or any) of `ids` have halted.
    pub(crate) fn join(&self, me: ActorId, digest: u64, ids: Vec<ActorId>, all: bool) -> ActionResult {
        let mut g = self.lock();
        if g.stopped {
            return Err(ActionError::Stopped);
        }
        if g.joined(&ids, all) {
            return Ok(());
        }
        g.set_digest(me, digest);
        if let Some(record) = g.actors.get_mut(me.index()) {
            record.lifecycle = Lifecycle::BlockedOnActors;
        }
        if let Some(task) = g.tasks.get_mut(me) {
            task.blocked_on = ids;
            task.wait_all = all;
        }
        self.schedule(&mut g, Some(me), true)
    }

    /// Resolves a boolean choice without handing control away.
    pub(crate) fn choose_boolean(&self, me: ActorId, fair: Option<String>) -> Result<bool, ActionError> {
        let mut g = self.lock();
        let inner = &mut *g;
        if inner.stopped {
            return Err(ActionError::Stopped);
        }
        if inner.step_bound_reached() {
            return Err(self.stop(inner, Outcome::Truncated(Truncation::MaxSteps)));
        }
        let value = inner
            .strategy
            .as_mut()
            .and_then(|s| s.next_boolean(fair.is_some()));
        let value = match value {
            Some(value) => value,
            None => {
                let outcome = inner.refusal();
                return Err(self.stop(inner, outcome));
            }
        };
        log::trace!("{} chose {}", inner.label(me), value);
        inner.count_decision(me);
        inner.record(match fair {
            Some(id) => Choice::FairBoolean { id, value },
            None => Choice::Boolean(value),
        });
        if let Some(outcome) = inner.after_step() {
            return Err(self.stop(inner, outcome));
        }
        Ok(value)
    }

    /// Resolves an integer choice in `0..bound` without handing control away.
    pub(crate) fn choose_integer(&self, me: ActorId, bound: usize) -> Result<usize, ActionError> {
        let mut g = self.lock();
        let inner = &mut *g;
        if inner.stopped {
            return Err(ActionError::Stopped);
        }
        if inner.step_bound_reached() {
            return Err(self.stop(inner, Outcome::Truncated(Truncation::MaxSteps)));
        }
        let value = inner.strategy.as_mut().and_then(|s| s.next_integer(bound));
        let value = match value {
            Some(value) if value < bound => value,
            Some(value) => {
                let outcome = Outcome::StrategyFailed(format!("chose {} for a bound of {}", value, bound));
                return Err(self.stop(inner, outcome));
            }
            None => {
                let outcome = inner.refusal();
                return Err(self.stop(inner, outcome));
            }
        };
        log::trace!("{} chose {}", inner.label(me), value);
        inner.count_decision(me);
        inner.record(Choice::Integer(value));
        if let Some(outcome) = inner.after_step() {
            return Err(self.stop(inner, outcome));
        }
        Ok(value)
    }

    /// Registers a monitor and runs the entry action of its start state.
    ///
    /// # Panics
    ///
    /// Panics when a monitor of the same type is already registered or when the declaration uses
    /// features monitors do not support.
    pub(crate) fn register_monitor<Mon: Monitor>(self: &Arc<Self>, monitor: Mon) {
        let name = short_type_name::<Mon>();
        let decl = Declaration::build(name, Mon::declare);
        if let Err(problem) = decl.validate_monitor() {
            panic!("Invalid declaration for {}: {}", name, problem);
        }
        let mut monitors = self.monitors.lock();
        if monitors.iter().any(|m| m.monitor_type() == TypeId::of::<Mon>()) {
            panic!("Monitor {} is already registered", name);
        }
        let mut slot: Box<dyn MonitorSlot> = Box::new(MonitorInstance::new(monitor, decl));
        // A failing entry action has already ended the iteration.
        let _ = slot.start(self);
        let record = slot.record();
        monitors.push(slot);
        self.lock().monitors.push(record);
    }

    /// Announces an event to a monitor. This is a suspension point.
    pub(crate) fn monitor(self: &Arc<Self>, me: ActorId, digest: u64, monitor: TypeId, event: AnyEvent) -> ActionResult {
        {
            let mut g = self.lock();
            g.set_digest(me, digest);
            self.schedule(&mut g, Some(me), true)?;
        }
        let mut monitors = self.monitors.lock();
        let position = match monitors.iter().position(|m| m.monitor_type() == monitor) {
            Some(position) => position,
            None => {
                return Err(self.fail(
                    BugKind::AssertionFailure,
                    format!("no monitor is registered to observe {}", event.kind()),
                ))
            }
        };
        let result = monitors[position].process(self, event);
        let record = monitors[position].record();
        let mut g = self.lock();
        if let Some(mirror) = g.monitors.get_mut(position) {
            *mirror = record;
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::strategy::RandomStrategy;

    fn inner() -> Inner {
        Inner::new(
            Limits {
                max_steps: Some(100),
                capture_states: true,
                ..Limits::default()
            },
            Box::new(RandomStrategy::new(7)),
            StateCache::new(),
            LivenessChecker::new(None),
        )
    }

    fn record(inner: &mut Inner, lifecycle: Lifecycle) -> ActorId {
        let id = ActorId::from(inner.actors.len());
        inner.actors.push(ActorRecord {
            id,
            name: "Worker",
            path: "runtime::test::Worker",
            policy: Arc::new(Declaration::<()>::empty()),
            lifecycle,
            activated: lifecycle != Lifecycle::Starting,
            stack: vec!["Init"],
            mailbox: VecDeque::new(),
            waiting: None,
            delivered: None,
            digest: 0,
            program_counter: 0,
        });
        inner.tasks.register(id);
        id
    }

    #[test]
    fn derives_task_flags_from_lifecycles() {
        let mut inner = inner();
        let a = record(&mut inner, Lifecycle::Running);
        let b = record(&mut inner, Lifecycle::BlockedOnReceive);
        let c = record(&mut inner, Lifecycle::Halted);
        let d = record(&mut inner, Lifecycle::Creating(c));
        inner.sync_tasks();
        assert_eq!(inner.tasks.schedulable().collect::<Vec<_>>(), vec![a, d]);
        assert!(inner.tasks.get(b).unwrap().blocked);
        assert!(inner.tasks.get(c).unwrap().completed);
    }

    #[test]
    fn creators_wait_for_the_whole_initial_activation() {
        let mut inner = inner();
        let creator = record(&mut inner, Lifecycle::Running);
        let child = record(&mut inner, Lifecycle::Starting);
        inner.actors[creator.index()].lifecycle = Lifecycle::Creating(child);
        inner.sync_tasks();
        assert!(!inner.tasks.get(creator).unwrap().is_schedulable());
        // Resumed after a suspension point inside its start state's entry action.
        inner.actors[child.index()].lifecycle = Lifecycle::Running;
        inner.sync_tasks();
        assert!(!inner.tasks.get(creator).unwrap().is_schedulable());
        inner.actors[child.index()].activated = true;
        inner.sync_tasks();
        assert!(inner.tasks.get(creator).unwrap().is_schedulable());
    }

    #[test]
    fn joins_release_once_targets_halt() {
        let mut inner = inner();
        let target = record(&mut inner, Lifecycle::Running);
        let joiner = record(&mut inner, Lifecycle::BlockedOnActors);
        inner.tasks.get_mut(joiner).unwrap().blocked_on = vec![target];
        inner.tasks.get_mut(joiner).unwrap().wait_all = true;
        inner.sync_tasks();
        assert!(inner.tasks.get(joiner).unwrap().blocked);
        inner.actors[target.index()].lifecycle = Lifecycle::Halted;
        inner.sync_tasks();
        assert!(inner.tasks.get(joiner).unwrap().is_schedulable());
        assert!(inner.tasks.get(joiner).unwrap().blocked_on.is_empty());
    }

    #[test]
    fn blocked_machines_without_runnable_peers_deadlock() {
        let mut inner = inner();
        record(&mut inner, Lifecycle::BlockedOnReceive);
        record(&mut inner, Lifecycle::Halted);
        inner.sync_tasks();
        match inner.quiescence() {
            Outcome::Bug { kind, message } => {
                assert_eq!(kind, BugKind::Deadlock);
                assert!(message.contains("Worker(0)"), "{}", message);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn fingerprints_ignore_identifiers() {
        let mut left = inner();
        record(&mut left, Lifecycle::Running);
        record(&mut left, Lifecycle::Idle);
        let mut right = inner();
        record(&mut right, Lifecycle::Idle);
        record(&mut right, Lifecycle::Running);
        assert_eq!(left.capture_state().fingerprint(), right.capture_state().fingerprint());
        right.actors[0].digest = 1;
        assert_ne!(left.capture_state().fingerprint(), right.capture_state().fingerprint());
    }
}
