//! A library for writing programs as communicating state machines and testing them
//! systematically.
//!
//! Programs are built from [`Machine`]s: actors with hierarchical states, a FIFO mailbox and a
//! handler table per state. The [`TestingEngine`] runs a program many times, serializing the
//! machines onto a single logical thread of control and letting a pluggable [`Strategy`] decide
//! which machine runs at every suspension point (create, send, receive, monitor) and how every
//! nondeterministic choice resolves. Each decision is recorded in a [`ScheduleTrace`], so any bug
//! that is found can be replayed exactly.
//!
//! Safety bugs are assertion failures, unhandled events, unhandled exceptions, deadlocks and
//! misuse of the transition API. Liveness properties are expressed with [`Monitor`]s whose states
//! are annotated hot or cold: a monitor that is still hot when the program quiesces, or that stays
//! hot throughout a fair cycle of program states, is reported.
//!
//! A small example follows.
//!
//! ```rust
//! use machinist::*;
//!
//! #[derive(Debug, Hash)]
//! struct Ping(ActorId);
//! impl Event for Ping {}
//!
//! #[derive(Debug, Hash)]
//! struct Pong;
//! impl Event for Pong {}
//!
//! struct Client;
//! impl Machine for Client {
//!     fn declare(d: &mut Declaration<Self>) {
//!         d.state("Init").entry(|ctx| {
//!             let server = ctx.create(Server)?;
//!             let me = ctx.id();
//!             ctx.send(server, Ping(me))
//!         })
//!         .goto_on::<Pong>("Done");
//!         d.state("Done");
//!     }
//! }
//!
//! struct Server;
//! impl Machine for Server {
//!     fn declare(d: &mut Declaration<Self>) {
//!         d.state("Serving").on_event(|ctx, ping: &Ping| ctx.send(ping.0, Pong));
//!     }
//! }
//!
//! let report = TestingEngine::new(
//!     |setup: &mut Setup| {
//!         setup.create(Client);
//!     },
//!     Config::default().strategy(StrategyKind::Dfs).iterations(100),
//! )
//! .run();
//! assert!(report.bugs.is_empty());
//! assert_eq!(report.distinct_schedules, 1);
//! ```

use std::hash::{Hash, Hasher};

mod cache;
mod config;
mod engine;
mod event;
mod liveness;
mod machine;
pub mod report;
mod runtime;
pub mod strategy;
#[cfg(test)]
mod test_util;
mod trace;

pub use cache::{Capture, MonitorStatus, ProgramState, StateCache};
pub use config::{Config, StrategyKind};
pub use engine::{run, IterationReport, Outcome, Program, Setup, TestingEngine, Truncation};
pub use event::{AnyEvent, Event, EventKind, Halt, WildCard};
pub use liveness::{LivenessChecker, LivenessViolation};
pub use machine::{
    Action, ActionError, ActionResult, ActorId, Context, Declaration, Exception, Handler, Machine,
    Monitor, OnException, StateBuilder, Temperature,
};
pub use report::{Bug, BugKind, TestReport};
pub use runtime::{TaskInfo, TaskRegistry};
pub use strategy::Strategy;
pub use trace::{Choice, ReplayError, ScheduleStep, ScheduleTrace, StepKind, TraceError};

/// A fast hash of a program snapshot. Equal fingerprints stand for indistinguishable states.
pub type Fingerprint = std::num::NonZeroU64;

/// Returns the fingerprint of a value.
#[inline]
pub fn fingerprint<T: Hash + ?Sized>(value: &T) -> Fingerprint {
    let mut hasher = stable::hasher();
    value.hash(&mut hasher);
    Fingerprint::new(hasher.finish()).unwrap_or(Fingerprint::MAX)
}

/// Returns a digest of a value that is stable across runs, for use in
/// [`Machine::hashed_state`] and [`Monitor::hashed_state`].
#[inline]
pub fn stable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = stable::hasher();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Hashers with fixed keys so that digests agree between iterations and between processes.
pub(crate) mod stable {
    use ahash::{AHasher, RandomState};
    use std::hash::BuildHasher;

    const KEY1: u64 = 123_456_789_987_654_321;
    const KEY2: u64 = 98_765_432_123_456_789;
    const KEY3: u64 = 0x5eed_f00d_cafe_babe;
    const KEY4: u64 = 0x0dd_ba11_b01d_face;

    pub(crate) fn build_hasher() -> RandomState {
        RandomState::with_seeds(KEY1, KEY2, KEY3, KEY4)
    }

    pub(crate) fn hasher() -> AHasher {
        build_hasher().build_hasher()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fingerprints_are_stable() {
        assert_eq!(fingerprint(&("Init", 3_u8)), fingerprint(&("Init", 3_u8)));
        assert_ne!(fingerprint(&("Init", 3_u8)), fingerprint(&("Init", 4_u8)));
        assert_eq!(stable_hash("abc"), stable_hash("abc"));
    }
}
