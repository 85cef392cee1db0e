use crate::cache::MonitorStatus;
use crate::event::{short_type_name, AnyEvent};
use crate::machine::{
    Action, ActionError, ActionResult, ActorId, Context, Declaration, Handler, Monitor, Temperature,
    Transition,
};
use crate::report::BugKind;
use crate::runtime::Shared;
use std::any::TypeId;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// What the scheduler sees of a monitor.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub(crate) struct MonitorRecord {
    pub(crate) name: &'static str,
    /// The full type path. Liveness bookkeeping is keyed by it.
    pub(crate) path: &'static str,
    pub(crate) state: &'static str,
    pub(crate) status: MonitorStatus,
    pub(crate) digest: u64,
}

/// A registered monitor with its type erased.
pub(crate) trait MonitorSlot: Send {
    fn monitor_type(&self) -> TypeId;
    /// Enters the start state.
    fn start(&mut self, shared: &Arc<Shared>) -> ActionResult;
    /// Handles one announced event to completion, including raised events.
    fn process(&mut self, shared: &Arc<Shared>, event: AnyEvent) -> ActionResult;
    fn record(&self) -> MonitorRecord;
}

pub(crate) struct MonitorInstance<Mon> {
    monitor: Mon,
    decl: Declaration<Mon>,
    name: &'static str,
    state: &'static str,
}

impl<Mon: Monitor> MonitorInstance<Mon> {
    pub(crate) fn new(monitor: Mon, decl: Declaration<Mon>) -> Self {
        let state = decl.start_state();
        MonitorInstance {
            monitor,
            decl,
            name: short_type_name::<Mon>(),
            state,
        }
    }

    fn run(
        &mut self,
        shared: &Arc<Shared>,
        action: &Action<Mon>,
        event: Option<AnyEvent>,
        in_exit: bool,
    ) -> Result<Option<Transition>, ActionError> {
        let mut ctx = Context {
            this: &mut self.monitor,
            shared,
            id: ActorId::from(usize::MAX),
            name: self.name,
            is_monitor: true,
            state: self.state,
            event,
            transition: None,
            in_exit,
        };
        let result = catch_unwind(AssertUnwindSafe(|| action(&mut ctx)));
        let transition = ctx.transition.take();
        let exception = match result {
            Ok(Ok(())) => return Ok(transition),
            Ok(Err(ActionError::Stopped)) => return Err(ActionError::Stopped),
            Ok(Err(ActionError::Exception(exception))) => exception,
            Err(payload) => crate::machine::Exception::from_panic(payload),
        };
        Err(shared.fail(
            BugKind::UnhandledException,
            format!("monitor {} in state {}: {}", self.name, self.state, exception),
        ))
    }

    fn enter(
        &mut self,
        shared: &Arc<Shared>,
        target: &'static str,
        event: Option<AnyEvent>,
    ) -> Result<Option<Transition>, ActionError> {
        let entry = match self.decl.get(target) {
            Some(state) => state.entry.clone(),
            None => {
                return Err(shared.fail(
                    BugKind::DisciplineViolation,
                    format!("monitor {} moved to unknown state {}", self.name, target),
                ))
            }
        };
        log::trace!("monitor {}: {} -> {}", self.name, self.state, target);
        self.state = target;
        match entry {
            Some(action) => self.run(shared, &action, event, false),
            None => Ok(None),
        }
    }

    fn exit(&mut self, shared: &Arc<Shared>) -> ActionResult {
        if let Some(action) = self.decl.get(self.state).and_then(|s| s.exit.clone()) {
            self.run(shared, &action, None, true)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, shared: &Arc<Shared>, event: AnyEvent) -> Result<Option<Transition>, ActionError> {
        let handler = self
            .decl
            .resolve(&[self.state], event.kind())
            .map(|(_, handler)| handler.clone());
        match handler {
            Some(Handler::Goto(target)) => Ok(Some(Transition::Goto(target, Some(event)))),
            Some(Handler::Invoke(action)) => self.run(shared, &action, Some(event), false),
            Some(Handler::Ignore) => Ok(None),
            Some(Handler::Push(_)) | Some(Handler::Defer) | None => Err(shared.fail(
                BugKind::UnhandledEvent,
                format!("monitor {} cannot handle {} in state {}", self.name, event.kind(), self.state),
            )),
        }
    }

    fn settle(&mut self, shared: &Arc<Shared>, mut transition: Option<Transition>) -> ActionResult {
        while let Some(next) = transition.take() {
            transition = match next {
                Transition::Goto(target, event) => {
                    self.exit(shared)?;
                    self.enter(shared, target, event)?
                }
                Transition::Raise(event) => self.dispatch(shared, event)?,
                other => {
                    return Err(shared.fail(
                        BugKind::DisciplineViolation,
                        format!("monitor {} issued {} in state {}", self.name, other.describe(), self.state),
                    ))
                }
            };
        }
        Ok(())
    }
}

impl<Mon: Monitor> MonitorSlot for MonitorInstance<Mon> {
    fn monitor_type(&self) -> TypeId {
        TypeId::of::<Mon>()
    }

    fn start(&mut self, shared: &Arc<Shared>) -> ActionResult {
        let start = self.decl.start_state();
        let transition = self.enter(shared, start, None)?;
        self.settle(shared, transition)
    }

    fn process(&mut self, shared: &Arc<Shared>, event: AnyEvent) -> ActionResult {
        log::trace!("monitor {} observes {:?} in state {}", self.name, event, self.state);
        let transition = self.dispatch(shared, event)?;
        self.settle(shared, transition)
    }

    fn record(&self) -> MonitorRecord {
        let status = match self.decl.get(self.state).map(|s| s.temperature) {
            Some(Temperature::Hot) => MonitorStatus::Hot,
            Some(Temperature::Cold) => MonitorStatus::Cold,
            Some(Temperature::Neutral) | None => MonitorStatus::None,
        };
        MonitorRecord {
            name: self.name,
            path: std::any::type_name::<Mon>(),
            state: self.state,
            status,
            digest: Monitor::hashed_state(&self.monitor),
        }
    }
}
