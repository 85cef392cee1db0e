use crate::event::{short_type_name, AnyEvent, Halt};
use crate::machine::{
    Action, ActionError, ActionResult, ActorId, Context, Declaration, Exception, Handler, Machine,
    OnException, Transition,
};
use crate::report::BugKind;
use crate::runtime::Shared;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Body of a machine thread.
pub(crate) fn run<M: Machine>(
    shared: Arc<Shared>,
    id: ActorId,
    machine: M,
    decl: Arc<Declaration<M>>,
    init: Option<AnyEvent>,
) {
    let mut instance = Instance {
        shared,
        id,
        name: short_type_name::<M>(),
        machine,
        decl,
        stack: Vec::new(),
        halted: false,
    };
    let result = catch_unwind(AssertUnwindSafe(|| instance.execute(init)));
    let exception = match result {
        Ok(Ok(())) | Ok(Err(ActionError::Stopped)) => return,
        Ok(Err(ActionError::Exception(exception))) => exception,
        Err(payload) => Exception::from_panic(payload),
    };
    instance.shared.fail(
        BugKind::UnhandledException,
        format!("{}{}: {}", instance.name, instance.id, exception),
    );
}

struct Instance<M> {
    shared: Arc<Shared>,
    id: ActorId,
    name: &'static str,
    machine: M,
    decl: Arc<Declaration<M>>,
    stack: Vec<&'static str>,
    halted: bool,
}

impl<M: Machine> Instance<M> {
    fn execute(&mut self, init: Option<AnyEvent>) -> ActionResult {
        self.shared.first_turn(self.id)?;
        let start = self.decl.start_state();
        log::trace!("{}{} starts in {}", self.name, self.id, start);
        let transition = self.enter(start, init)?;
        if let Some(raised) = self.settle(transition)? {
            self.handle(raised)?;
        }
        if self.halted {
            return Ok(());
        }
        self.shared.activated(self.id, self.digest())?;
        while !self.halted {
            match self.shared.dequeue(self.id)? {
                Some(event) => self.handle(event)?,
                None => self.shared.idle(self.id, self.digest())?,
            }
        }
        Ok(())
    }

    fn label(&self) -> String {
        format!("{}{}", self.name, self.id)
    }

    fn current(&self) -> &'static str {
        self.stack.last().copied().unwrap_or("")
    }

    fn digest(&self) -> u64 {
        Machine::hashed_state(&self.machine)
    }

    fn violation(&self, message: String) -> ActionError {
        self.shared.fail(BugKind::DisciplineViolation, message)
    }

    /// Handles an event and every event raised while handling it.
    fn handle(&mut self, event: AnyEvent) -> ActionResult {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            if self.halted {
                break;
            }
            next = self.dispatch(event)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, event: AnyEvent) -> Result<Option<AnyEvent>, ActionError> {
        let resolved = self
            .decl
            .resolve(&self.stack, event.kind())
            .map(|(level, handler)| (level, handler.clone()));
        log::trace!("{} handles {:?} in {}", self.label(), event, self.current());
        match resolved {
            Some((_, Handler::Ignore)) => Ok(None),
            Some((_, Handler::Defer)) => {
                self.shared.requeue(self.id, event)?;
                Ok(None)
            }
            Some((level, Handler::Goto(target))) => {
                self.unwind(level)?;
                self.settle(Some(Transition::Goto(target, Some(event))))
            }
            Some((level, Handler::Push(target))) => {
                self.unwind(level)?;
                self.settle(Some(Transition::Push(target, Some(event))))
            }
            Some((level, Handler::Invoke(action))) => {
                self.unwind(level)?;
                if self.halted {
                    return Ok(None);
                }
                let transition = self.run(&action, Some(event), false)?;
                self.settle(transition)
            }
            None if event.is::<Halt>() => {
                self.halt();
                Ok(None)
            }
            None => Err(self.shared.fail(
                BugKind::UnhandledEvent,
                format!("{} cannot handle {} in state {}", self.label(), event.kind(), self.current()),
            )),
        }
    }

    /// Applies transitions until none is pending. A raised event is returned to the caller.
    fn settle(&mut self, mut transition: Option<Transition>) -> Result<Option<AnyEvent>, ActionError> {
        while let Some(next) = transition.take() {
            if self.halted {
                break;
            }
            transition = match next {
                Transition::Raise(event) => return Ok(Some(event)),
                Transition::Goto(target, event) => {
                    self.exit_current()?;
                    if self.halted {
                        break;
                    }
                    self.enter(target, event)?
                }
                Transition::Push(target, event) => self.enter(target, event)?,
                Transition::Pop => {
                    if self.stack.len() <= 1 {
                        return Err(self.violation(format!(
                            "{} popped its last state {}",
                            self.label(),
                            self.current()
                        )));
                    }
                    self.exit_current()?;
                    None
                }
                Transition::Halt => {
                    self.halt();
                    None
                }
            };
        }
        Ok(None)
    }

    /// Exits states above `level`, which supplied the handler being run.
    fn unwind(&mut self, level: usize) -> ActionResult {
        while self.stack.len() > level + 1 {
            self.exit_current()?;
        }
        Ok(())
    }

    fn enter(&mut self, target: &'static str, event: Option<AnyEvent>) -> Result<Option<Transition>, ActionError> {
        let entry = match self.decl.get(target) {
            Some(state) => state.entry.clone(),
            None => {
                return Err(self.violation(format!(
                    "{} moved to unknown state {}",
                    self.label(),
                    target
                )))
            }
        };
        self.stack.push(target);
        self.shared.publish_stack(self.id, &self.stack)?;
        match entry {
            Some(action) => self.run(&action, event, false),
            None => Ok(None),
        }
    }

    fn exit_current(&mut self) -> ActionResult {
        let exit = self.decl.get(self.current()).and_then(|s| s.exit.clone());
        if let Some(action) = exit {
            // Other transitions from exit actions are rejected by the context.
            if let Some(Transition::Halt) = self.run(&action, None, true)? {
                self.halt();
            }
        }
        if self.halted {
            return Ok(());
        }
        self.stack.pop();
        self.shared.publish_stack(self.id, &self.stack)
    }

    fn halt(&mut self) {
        log::trace!("{} halts in {}", self.label(), self.current());
        self.stack.clear();
        self.machine.on_halt();
        self.halted = true;
        self.shared.halted(self.id, self.digest());
    }

    fn run(
        &mut self,
        action: &Action<M>,
        event: Option<AnyEvent>,
        in_exit: bool,
    ) -> Result<Option<Transition>, ActionError> {
        let state = self.current();
        let mut ctx = Context {
            this: &mut self.machine,
            shared: &self.shared,
            id: self.id,
            name: self.name,
            is_monitor: false,
            state,
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
            Err(payload) => Exception::from_panic(payload),
        };
        match self.machine.on_exception(state, &exception) {
            OnException::Handled => {
                log::debug!("{} handled {} in state {}", self.label(), exception, state);
                Ok(None)
            }
            OnException::Halt => {
                log::debug!("{} halts after {} in state {}", self.label(), exception, state);
                Ok(Some(Transition::Halt))
            }
            OnException::Propagate => Err(self.shared.fail(
                BugKind::UnhandledException,
                format!("{} in state {}: {}", self.label(), state, exception),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::test_util::*;
    use crate::*;

    #[test]
    fn raised_events_run_before_the_mailbox() {
        let report = run_once(|setup: &mut Setup| {
            setup.create(Raiser::default());
        });
        assert_eq!(report.outcome, Outcome::Quiescent);
    }

    #[test]
    fn pushed_states_fall_back_to_the_states_below() {
        let report = run_once(|setup: &mut Setup| {
            setup.create(Stacker::default());
        });
        assert_eq!(report.outcome, Outcome::Quiescent);
    }

    #[test]
    fn popping_the_last_state_is_a_violation() {
        let report = run_once(|setup: &mut Setup| {
            setup.create(Popper);
        });
        assert!(
            matches!(report.outcome, Outcome::Bug { kind: BugKind::DisciplineViolation, .. }),
            "{:?}",
            report.outcome
        );
    }

    #[test]
    fn exceptions_follow_the_machine_policy() {
        let report = run_once(|setup: &mut Setup| {
            setup.create(Faulty { policy: OnException::Handled });
        });
        assert_eq!(report.outcome, Outcome::Quiescent);
        let report = run_once(|setup: &mut Setup| {
            setup.create(Faulty { policy: OnException::Halt });
        });
        assert_eq!(report.outcome, Outcome::Quiescent);
        let report = run_once(|setup: &mut Setup| {
            setup.create(Faulty { policy: OnException::Propagate });
        });
        match report.outcome {
            Outcome::Bug { kind, message } => {
                assert_eq!(kind, BugKind::UnhandledException);
                assert!(message.contains("ParseIntError"), "{}", message);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn deferred_events_wait_for_a_state_that_handles_them() {
        for seed in 0..5 {
            let report = TestingEngine::new(
                |setup: &mut Setup| {
                    let gate = setup.create(Gate);
                    setup.create(Feeder { gate });
                    setup.register_monitor(Expectation);
                },
                Config::default().strategy(StrategyKind::Random { seed }),
            )
            .run_iteration();
            assert_eq!(report.outcome, Outcome::Quiescent, "seed {}", seed);
        }
    }

    #[test]
    fn unhandled_halt_halts_the_machine() {
        let report = run_once(|setup: &mut Setup| {
            let target = setup.create(Sink);
            setup.create(Sender { target, halt: true });
        });
        assert_eq!(report.outcome, Outcome::Quiescent);
        assert_eq!(report.dropped_events, 1);
    }

    #[test]
    fn unhandled_events_are_bugs() {
        let report = run_once(|setup: &mut Setup| {
            let target = setup.create(Sink);
            setup.create(Sender { target, halt: false });
        });
        assert!(
            matches!(report.outcome, Outcome::Bug { kind: BugKind::UnhandledEvent, .. }),
            "{:?}",
            report.outcome
        );
    }

    #[test]
    fn halting_in_an_exit_action_cancels_the_transition() {
        let report = run_once(|setup: &mut Setup| {
            setup.create(ExitHalts);
        });
        assert_eq!(report.outcome, Outcome::Quiescent);
    }

    #[test]
    fn a_second_transition_is_a_violation() {
        let report = run_once(|setup: &mut Setup| {
            setup.create(Twice);
        });
        match report.outcome {
            Outcome::Bug { kind, message } => {
                assert_eq!(kind, BugKind::DisciplineViolation);
                assert!(message.contains("goto Next"), "{}", message);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn events_from_one_sender_arrive_in_order() {
        let report = run(
            |setup: &mut Setup| {
                let store = setup.create(Store::default());
                setup.create(Burst { target: store, values: vec![1, 2, 3] });
            },
            Config::default().strategy(StrategyKind::Dfs).iterations(1_000),
        );
        assert!(report.bugs.is_empty(), "{:?}", report.bugs);
        assert!(report.iterations > 0);
    }

    #[test]
    fn receives_pick_matching_events_out_of_order() {
        let report = run(
            |setup: &mut Setup| {
                let collector = setup.create(Collector);
                setup.create(Burst { target: collector, values: vec![1, 2] });
            },
            Config::default().strategy(StrategyKind::Dfs).iterations(1_000),
        );
        assert!(report.bugs.is_empty(), "{:?}", report.bugs);
    }

    #[test]
    fn queued_instances_are_bounded() {
        let report = run_once(|setup: &mut Setup| {
            let target = setup.create(Dam);
            setup.create(Flooder { target });
        });
        match report.outcome {
            Outcome::Bug { kind, message } => {
                assert_eq!(kind, BugKind::AssertionFailure);
                assert!(message.contains("exceeding the bound of 1"), "{}", message);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn deep_stacks_truncate_the_iteration() {
        let report = TestingEngine::new(
            |setup: &mut Setup| {
                setup.create(Stacker::default());
            },
            Config::default().depth_bound(1),
        )
        .run_iteration();
        assert_eq!(report.outcome, Outcome::Truncated(Truncation::DepthBound));
    }
}
