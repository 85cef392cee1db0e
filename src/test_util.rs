//! Utilities for tests.

use crate::{Config, IterationReport, Program, TestingEngine};

pub use behaviors::*;
pub use events::*;
pub use lifecycle::*;
pub use liveness::*;
pub use ping_pong::*;
pub use race::*;

/// Runs one iteration under the default random strategy.
pub fn run_once<P: Program>(program: P) -> IterationReport {
    TestingEngine::new(program, Config::default()).run_iteration()
}

pub mod events {
    use crate::{ActorId, Event};

    #[derive(Debug, Hash)]
    pub struct Ping(pub ActorId);
    impl Event for Ping {}

    #[derive(Debug, Hash)]
    pub struct Pong;
    impl Event for Pong {}

    #[derive(Debug, Hash)]
    pub struct Poke;
    impl Event for Poke {}

    #[derive(Debug, Hash)]
    pub struct Poked;
    impl Event for Poked {}

    #[derive(Debug, Hash)]
    pub struct Tick;
    impl Event for Tick {}

    #[derive(Debug, Hash)]
    pub struct Open;
    impl Event for Open {}

    #[derive(Debug, Hash)]
    pub struct First;
    impl Event for First {}

    #[derive(Debug, Hash)]
    pub struct Second;
    impl Event for Second {}

    #[derive(Debug, Hash)]
    pub struct Step;
    impl Event for Step {}

    #[derive(Debug, Hash)]
    pub struct Computing;
    impl Event for Computing {}

    #[derive(Debug, Hash)]
    pub struct Waiting;
    impl Event for Waiting {}

    #[derive(Debug, Hash)]
    pub struct Write(pub u8);
    impl Event for Write {}

    /// At most one may be queued per mailbox.
    #[derive(Debug, Hash)]
    pub struct Flood;
    impl Event for Flood {
        fn max_instances(&self) -> Option<usize> {
            Some(1)
        }
    }

    #[derive(Debug, Hash)]
    pub struct Stopping;
    impl Event for Stopping {}

    #[derive(Debug, Hash)]
    pub struct Joined;
    impl Event for Joined {}

    #[derive(Debug, Hash)]
    pub struct ChildStep;
    impl Event for ChildStep {}

    #[derive(Debug, Hash)]
    pub struct CreatorResumed;
    impl Event for CreatorResumed {}
}

/// Machines that exercise one feature of the state machine semantics each.
pub mod behaviors {
    use super::events::*;
    use crate::*;

    /// Raises an event while another one waits in its mailbox.
    #[derive(Default)]
    pub struct Raiser {
        seen: Vec<&'static str>,
    }

    impl Machine for Raiser {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Init")
                .entry(|ctx| {
                    let me = ctx.id();
                    ctx.send(me, Second)?;
                    ctx.raise(First)
                })
                .invoke_on::<First>(|ctx| {
                    ctx.seen.push("first");
                    Ok(())
                })
                .invoke_on::<Second>(|ctx| {
                    ctx.seen.push("second");
                    let order = ctx.seen.clone();
                    ctx.assert(order == ["first", "second"], format!("handled {:?}", order))
                });
        }
    }

    /// Pushes a state that leaves its only event to the state below.
    #[derive(Default)]
    pub struct Stacker {
        exited_top: bool,
    }

    impl Machine for Stacker {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Base")
                .entry(|ctx| ctx.push("Top"))
                .invoke_on::<Poke>(|ctx| {
                    let exited = ctx.exited_top;
                    ctx.assert(exited, "Top is still on the stack")?;
                    ctx.assert(ctx.state() == "Base", "handled outside of Base")
                });
            d.state("Top")
                .entry(|ctx| {
                    let me = ctx.id();
                    ctx.send(me, Poke)
                })
                .exit(|ctx| {
                    ctx.exited_top = true;
                    Ok(())
                });
        }
    }

    pub struct Popper;

    impl Machine for Popper {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Init").entry(|ctx| ctx.pop());
        }
    }

    /// Fails on entry and disposes of the error according to `policy`.
    pub struct Faulty {
        pub policy: OnException,
    }

    impl Machine for Faulty {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Init").entry(|_| {
                "x".parse::<u32>()?;
                Ok(())
            });
        }

        fn on_exception(&mut self, _state: &'static str, _exception: &Exception) -> OnException {
            self.policy
        }
    }

    /// Handles nothing.
    pub struct Sink;

    impl Machine for Sink {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Waiting");
        }
    }

    /// Sends a `Poke` to `target`, preceded by a `Halt` when `halt` is set.
    pub struct Sender {
        pub target: ActorId,
        pub halt: bool,
    }

    impl Machine for Sender {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Sending").entry(|ctx| {
                let target = ctx.target;
                if ctx.halt {
                    ctx.send(target, Halt)?;
                }
                ctx.send(target, Poke)
            });
        }
    }

    #[derive(Default)]
    pub struct Counter {
        pokes: usize,
    }

    impl Machine for Counter {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Counting").invoke_on::<Poke>(|ctx| {
                ctx.pokes += 1;
                Ok(())
            });
        }

        fn hashed_state(&self) -> u64 {
            stable_hash(&self.pokes)
        }
    }

    /// Defers `Poke` and ignores `Tick` until it is opened.
    pub struct Gate;

    impl Machine for Gate {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Closed")
                .defer::<Poke>()
                .ignore::<Tick>()
                .goto_on::<Open>("Open");
            d.state("Open")
                .invoke_on::<Poke>(|ctx| ctx.monitor::<Expectation, _>(Poked))
                .invoke_on::<Tick>(|ctx| ctx.assert(false, "ticks are ignored while closed"));
        }
    }

    /// Is hot until a `Poked` is announced.
    pub struct Expectation;

    impl Monitor for Expectation {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Expecting").hot().goto_on::<Poked>("Satisfied");
            d.state("Satisfied").cold().ignore::<Poked>();
        }
    }

    /// Feeds a gate the events it defers, ignores and opens on, in that order.
    pub struct Feeder {
        pub gate: ActorId,
    }

    impl Machine for Feeder {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Feeding").entry(|ctx| {
                let gate = ctx.gate;
                ctx.send(gate, Poke)?;
                ctx.send(gate, Tick)?;
                ctx.send(gate, Open)
            });
        }
    }

    /// Fails to parse in the exit action of its start state and halts on the error.
    pub struct ExitHalts;

    impl Machine for ExitHalts {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Init")
                .entry(|ctx| ctx.goto("Next"))
                .exit(|_| {
                    "x".parse::<u32>()?;
                    Ok(())
                });
            d.state("Next")
                .entry(|ctx| ctx.assert(false, "entered Next after halting"));
        }

        fn on_exception(&mut self, _state: &'static str, _exception: &Exception) -> OnException {
            OnException::Halt
        }
    }

    /// Issues two transitions in one action.
    pub struct Twice;

    impl Machine for Twice {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Init").entry(|ctx| {
                ctx.goto("Next")?;
                ctx.pop()
            });
            d.state("Next");
        }
    }

    /// Defers every `Flood`.
    pub struct Dam;

    impl Machine for Dam {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Holding").defer::<Flood>();
        }
    }

    /// Sends two `Flood`s to `target`.
    pub struct Flooder {
        pub target: ActorId,
    }

    impl Machine for Flooder {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Flooding").entry(|ctx| {
                let target = ctx.target;
                ctx.send(target, Flood)?;
                ctx.send(target, Flood)
            });
        }
    }

    /// Sends `Write`s of `values` to `target`, in order.
    pub struct Burst {
        pub target: ActorId,
        pub values: Vec<u8>,
    }

    impl Machine for Burst {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Sending").entry(|ctx| {
                let target = ctx.target;
                for value in ctx.values.clone() {
                    ctx.send(target, Write(value))?;
                }
                Ok(())
            });
        }
    }

    /// Takes its events through the receive calls instead of handlers: a `Poke` it sent itself,
    /// then `Write(2)` ahead of `Write(1)`.
    pub struct Collector;

    impl Machine for Collector {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Collecting").entry(|ctx| {
                let me = ctx.id();
                ctx.send(me, Poke)?;
                ctx.receive::<Poke>()?;
                let second = ctx.receive_where(|write: &Write| write.0 == 2)?;
                let first = ctx.receive_any(&[EventKind::of::<Write>()])?;
                let first = first.downcast_ref::<Write>().map(|write| write.0);
                ctx.assert(
                    second.0 == 2 && first == Some(1),
                    format!("received {} then {:?}", second.0, first),
                )
            });
        }
    }

    /// Fails an assertion in the exit action of its start state.
    pub struct ExitAssert;

    impl Machine for ExitAssert {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Init")
                .entry(|ctx| ctx.goto("Next"))
                .exit(|ctx| ctx.assert(false, "leaving Init"));
            d.state("Next");
        }
    }
}

/// Machines that wait on the creation and the halting of others.
pub mod lifecycle {
    use super::events::*;
    use crate::*;

    /// Announces that it stops, then halts.
    pub struct Halter;

    impl Machine for Halter {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Working").entry(|ctx| {
                ctx.monitor::<JoinWitness, _>(Stopping)?;
                ctx.halt()
            });
        }
    }

    /// Joins `targets` and announces when the join returns.
    pub struct Joiner {
        pub targets: Vec<ActorId>,
        pub all: bool,
    }

    impl Machine for Joiner {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Joining").entry(|ctx| {
                let targets = ctx.targets.clone();
                if ctx.all {
                    ctx.join_all(&targets)?;
                } else {
                    ctx.join_any(&targets)?;
                }
                ctx.monitor::<JoinWitness, _>(Joined)
            });
        }
    }

    /// Checks that a join returns only once `needed` machines announced they stop.
    pub struct JoinWitness {
        pub stopped: usize,
        pub needed: usize,
    }

    impl Monitor for JoinWitness {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Watching")
                .invoke_on::<Stopping>(|ctx| {
                    ctx.stopped += 1;
                    Ok(())
                })
                .invoke_on::<Joined>(|ctx| {
                    let (stopped, needed) = (ctx.stopped, ctx.needed);
                    ctx.assert(
                        stopped >= needed,
                        format!("join returned after {} of {} machines stopped", stopped, needed),
                    )
                });
        }

        fn hashed_state(&self) -> u64 {
            stable_hash(&self.stopped)
        }
    }

    pub fn joins(all: bool) -> impl Fn(&mut Setup) + Sync {
        move |setup: &mut Setup| {
            setup.register_monitor(JoinWitness {
                stopped: 0,
                needed: if all { 2 } else { 1 },
            });
            let first = setup.create(Halter);
            let second = setup.create(Halter);
            setup.create(Joiner {
                targets: vec![first, second],
                all,
            });
        }
    }

    /// Creates a `Child` and announces when the creation returns.
    pub struct Parent;

    impl Machine for Parent {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Init").entry(|ctx| {
                ctx.create(Child)?;
                ctx.monitor::<CreationWitness, _>(CreatorResumed)
            });
        }
    }

    /// Passes two suspension points in its start state's entry action.
    pub struct Child;

    impl Machine for Child {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Init").entry(|ctx| {
                ctx.monitor::<CreationWitness, _>(ChildStep)?;
                ctx.monitor::<CreationWitness, _>(ChildStep)
            });
        }
    }

    /// Checks that a creation returns only after the whole entry action of the child ran.
    #[derive(Default)]
    pub struct CreationWitness {
        steps: usize,
    }

    impl Monitor for CreationWitness {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Watching")
                .invoke_on::<ChildStep>(|ctx| {
                    ctx.steps += 1;
                    Ok(())
                })
                .invoke_on::<CreatorResumed>(|ctx| {
                    let steps = ctx.steps;
                    ctx.assert(steps == 2, format!("create returned after {} of 2 child steps", steps))
                });
        }

        fn hashed_state(&self) -> u64 {
            stable_hash(&self.steps)
        }
    }

    pub fn nested_creation(setup: &mut Setup) {
        setup.register_monitor(CreationWitness::default());
        setup.create(Parent);
    }
}

/// Programs with liveness properties.
pub mod liveness {
    use super::events::*;
    use crate::*;

    /// Keeps sending itself `Tick` forever.
    pub struct Spinner;

    impl Machine for Spinner {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Spinning")
                .entry(|ctx| {
                    let me = ctx.id();
                    ctx.send(me, Tick)
                })
                .invoke_on::<Tick>(|ctx| {
                    let me = ctx.id();
                    ctx.send(me, Tick)
                });
        }
    }

    /// Is hot forever.
    pub struct Busy;

    impl Monitor for Busy {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Busy").hot();
        }
    }

    /// Never does anything once started.
    pub struct Bystander;

    impl Machine for Bystander {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Idle");
        }
    }

    pub fn spinner(setup: &mut Setup) {
        setup.create(Spinner);
        setup.register_monitor(Busy);
    }

    /// Computes for a fair number of rounds before waiting, then starts over.
    pub struct Toggler;

    impl Machine for Toggler {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Running")
                .entry(|ctx| {
                    let me = ctx.id();
                    ctx.send(me, Step)
                })
                .invoke_on::<Step>(|ctx| {
                    ctx.monitor::<Responsive, _>(Computing)?;
                    if !ctx.fair_random()? {
                        ctx.monitor::<Responsive, _>(Waiting)?;
                    }
                    let me = ctx.id();
                    ctx.send(me, Step)
                });
        }
    }

    /// Hot while the toggler computes.
    pub struct Responsive;

    impl Monitor for Responsive {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Idle")
                .cold()
                .goto_on::<Computing>("Computing")
                .ignore::<Waiting>();
            d.state("Computing")
                .hot()
                .ignore::<Computing>()
                .goto_on::<Waiting>("Idle");
        }
    }

    pub fn fair_toggle(setup: &mut Setup) {
        setup.create(Toggler);
        setup.register_monitor(Responsive);
    }
}

/// A request-response exchange with a single possible schedule.
pub mod ping_pong {
    use super::events::*;
    use crate::*;

    pub struct Client;

    impl Machine for Client {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Init")
                .entry(|ctx| {
                    let server = ctx.create(Server)?;
                    let me = ctx.id();
                    ctx.send(server, Ping(me))
                })
                .goto_on::<Pong>("Done");
            d.state("Done");
        }
    }

    pub struct Server;

    impl Machine for Server {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Serving")
                .on_event(|ctx, ping: &Ping| ctx.send(ping.0, Pong));
        }
    }

    pub fn ping_pong(setup: &mut Setup) {
        setup.create(Client);
    }
}

/// Two writers whose writes a store expects in order.
pub mod race {
    use super::events::*;
    use crate::*;

    #[derive(Default)]
    pub struct Store {
        last: u8,
    }

    impl Machine for Store {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Storing").on_event(|ctx, write: &Write| {
                let expected = ctx.last + 1;
                ctx.assert(write.0 == expected, format!("out of order write {}", write.0))?;
                ctx.last = write.0;
                Ok(())
            });
        }

        fn hashed_state(&self) -> u64 {
            stable_hash(&self.last)
        }
    }

    pub struct Writer {
        pub store: ActorId,
        pub value: u8,
    }

    impl Machine for Writer {
        fn declare(d: &mut Declaration<Self>) {
            d.state("Writing").entry(|ctx| {
                let (store, value) = (ctx.store, ctx.value);
                ctx.send(store, Write(value))
            });
        }
    }

    pub fn racy_counter(setup: &mut Setup) {
        let store = setup.create(Store::default());
        setup.create(Writer { store, value: 1 });
        setup.create(Writer { store, value: 2 });
    }
}
