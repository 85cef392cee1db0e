use crate::event::{AnyEvent, Event, EventKind};
use crate::machine::{ActionError, ActionResult, ActorId, Exception, Machine, Monitor};
use crate::report::BugKind;
use crate::runtime::Shared;
use std::any::TypeId;
use std::fmt::Display;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::sync::Arc;

/// A state change requested by an action, applied once the action returns.
pub(crate) enum Transition {
    Goto(&'static str, Option<AnyEvent>),
    Push(&'static str, Option<AnyEvent>),
    Pop,
    Raise(AnyEvent),
    Halt,
}

impl Transition {
    pub(crate) fn describe(&self) -> String {
        match self {
            Transition::Goto(target, _) => format!("goto {}", target),
            Transition::Push(target, _) => format!("push {}", target),
            Transition::Pop => "pop".to_owned(),
            Transition::Raise(event) => format!("raise {}", event.kind()),
            Transition::Halt => "halt".to_owned(),
        }
    }
}

/// The view an action has of its machine or monitor and of the runtime.
///
/// The context dereferences to the machine value, so actions read and write fields directly.
/// Calls that hand control to the scheduler return [`ActionError::Stopped`] once the iteration
/// is over, and actions are expected to propagate it with `?`.
///
/// At most one of [`goto`](Context::goto), [`push`](Context::push), [`pop`](Context::pop),
/// [`raise`](Context::raise) and [`halt`](Context::halt) may be issued per action, and nothing
/// may be sent after one of them.
pub struct Context<'a, M> {
    pub(crate) this: &'a mut M,
    pub(crate) shared: &'a Arc<Shared>,
    pub(crate) id: ActorId,
    pub(crate) name: &'static str,
    pub(crate) is_monitor: bool,
    pub(crate) state: &'static str,
    pub(crate) event: Option<AnyEvent>,
    pub(crate) transition: Option<Transition>,
    pub(crate) in_exit: bool,
}

impl<'a, M> Context<'a, M> {
    /// The name of the state whose action is running.
    pub fn state(&self) -> &'static str {
        self.state
    }

    /// The event that triggered this action, if it has the given type.
    pub fn event<E: Event>(&self) -> Option<&E> {
        self.event.as_ref().and_then(|e| e.downcast_ref())
    }

    /// The event that triggered this action.
    pub fn any_event(&self) -> Option<&AnyEvent> {
        self.event.as_ref()
    }

    /// Exits the current state and enters `target` once the action returns.
    pub fn goto(&mut self, target: &'static str) -> ActionResult {
        self.issue(Transition::Goto(target, None))
    }

    /// Handles `event` immediately after the action returns, ahead of the mailbox.
    pub fn raise<E: Event>(&mut self, event: E) -> ActionResult {
        self.issue(Transition::Raise(AnyEvent::new(event)))
    }

    /// Reports an assertion failure unless `condition` holds. This is not a suspension point:
    /// the failure ends the iteration immediately.
    pub fn assert(&self, condition: bool, message: impl Display) -> ActionResult {
        if condition {
            return Ok(());
        }
        Err(self.shared.fail(
            BugKind::AssertionFailure,
            format!("{} in state {}: {}", self.label(), self.state, message),
        ))
    }

    pub(crate) fn label(&self) -> String {
        if self.is_monitor {
            self.name.to_owned()
        } else {
            format!("{}{}", self.name, self.id)
        }
    }

    pub(crate) fn issue(&mut self, transition: Transition) -> ActionResult {
        if self.in_exit {
            return Err(self.violation(format!(
                "{} issued {} in the exit action of state {}",
                self.label(),
                transition.describe(),
                self.state
            )));
        }
        if let Some(previous) = &self.transition {
            return Err(self.violation(format!(
                "{} issued {} after {} in a single action of state {}",
                self.label(),
                transition.describe(),
                previous.describe(),
                self.state
            )));
        }
        self.transition = Some(transition);
        Ok(())
    }

    fn violation(&self, message: String) -> ActionError {
        self.shared.fail(BugKind::DisciplineViolation, message)
    }
}

impl<'a, M: Machine> Context<'a, M> {
    /// The identity of this machine.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Creates a machine and runs its start state's entry action. This is a suspension point.
    pub fn create<N: Machine>(&mut self, machine: N) -> Result<ActorId, ActionError> {
        let digest = Machine::hashed_state(&*self.this);
        self.shared.create(self.id, digest, machine, None)
    }

    /// Creates a machine whose start state's entry action receives `event`.
    pub fn create_with<N: Machine, E: Event>(
        &mut self,
        machine: N,
        event: E,
    ) -> Result<ActorId, ActionError> {
        let digest = Machine::hashed_state(&*self.this);
        self.shared
            .create(self.id, digest, machine, Some(AnyEvent::new(event)))
    }

    /// Enqueues `event` in the mailbox of `target`. This is a suspension point.
    pub fn send<E: Event>(&mut self, target: ActorId, event: E) -> ActionResult {
        if let Some(transition) = &self.transition {
            return Err(self.violation(format!(
                "{} sent {} after issuing {} in state {}",
                self.label(),
                crate::event::short_type_name::<E>(),
                transition.describe(),
                self.state
            )));
        }
        let digest = Machine::hashed_state(&*self.this);
        self.shared.send(self.id, digest, target, AnyEvent::new(event))
    }

    /// Waits for an event of type `E`, bypassing the handler table.
    pub fn receive<E: Event>(&mut self) -> Result<E, ActionError> {
        self.receive_where(|_: &E| true)
    }

    /// Waits for an event of type `E` that satisfies `predicate`.
    pub fn receive_where<E, P>(&mut self, predicate: P) -> Result<E, ActionError>
    where
        E: Event,
        P: Fn(&E) -> bool + Send + 'static,
    {
        let digest = Machine::hashed_state(&*self.this);
        let event = self.shared.receive(
            self.id,
            digest,
            Box::new(move |e: &AnyEvent| e.downcast_ref::<E>().map_or(false, &predicate)),
        )?;
        event.downcast::<E>().map_err(|e| {
            ActionError::from(Exception::new::<E>(format!("received unexpected {:?}", e)))
        })
    }

    /// Waits for an event of any of the given kinds.
    pub fn receive_any(&mut self, kinds: &[EventKind]) -> Result<AnyEvent, ActionError> {
        let kinds = kinds.to_vec();
        let digest = Machine::hashed_state(&*self.this);
        self.shared.receive(
            self.id,
            digest,
            Box::new(move |e: &AnyEvent| kinds.contains(&e.kind())),
        )
    }

    /// Announces `event` to the registered monitor of type `Mon`. This is a suspension point.
    pub fn monitor<Mon: Monitor, E: Event>(&mut self, event: E) -> ActionResult {
        let digest = Machine::hashed_state(&*self.this);
        self.shared
            .monitor(self.id, digest, TypeId::of::<Mon>(), AnyEvent::new(event))
    }

    /// A nondeterministic boolean.
    pub fn random(&mut self) -> Result<bool, ActionError> {
        self.shared.choose_boolean(self.id, None)
    }

    /// A nondeterministic boolean that a fair execution resolves both ways infinitely often.
    /// Each call site of each machine is tracked separately.
    #[track_caller]
    pub fn fair_random(&mut self) -> Result<bool, ActionError> {
        let caller = Location::caller();
        let id = format!(
            "{}{}:{}:{}:{}:{}",
            self.name,
            self.id,
            self.state,
            caller.file(),
            caller.line(),
            caller.column()
        );
        self.shared.choose_boolean(self.id, Some(id))
    }

    /// A nondeterministic integer in `0..bound`.
    pub fn random_integer(&mut self, bound: usize) -> Result<usize, ActionError> {
        if bound == 0 {
            return Err(self.violation(format!(
                "{} asked for a random integer below 0 in state {}",
                self.label(),
                self.state
            )));
        }
        self.shared.choose_integer(self.id, bound)
    }

    /// Blocks until every machine in `ids` has halted.
    pub fn join_all(&mut self, ids: &[ActorId]) -> ActionResult {
        let digest = Machine::hashed_state(&*self.this);
        self.shared.join(self.id, digest, ids.to_vec(), true)
    }

    /// Blocks until at least one machine in `ids` has halted.
    pub fn join_any(&mut self, ids: &[ActorId]) -> ActionResult {
        let digest = Machine::hashed_state(&*self.this);
        self.shared.join(self.id, digest, ids.to_vec(), false)
    }

    /// Enters `target` on top of the current state once the action returns.
    pub fn push(&mut self, target: &'static str) -> ActionResult {
        self.issue(Transition::Push(target, None))
    }

    /// Exits the current state and resumes the state below it once the action returns.
    pub fn pop(&mut self) -> ActionResult {
        self.issue(Transition::Pop)
    }

    /// Halts the machine once the action returns.
    pub fn halt(&mut self) -> ActionResult {
        self.issue(Transition::Halt)
    }
}

impl<'a, M> Deref for Context<'a, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.this
    }
}

impl<'a, M> DerefMut for Context<'a, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.this
    }
}
