//! Machines, monitors and the API their actions use.
//!
//! A [`Machine`] declares its states once through [`Machine::declare`]. Each state has optional
//! entry and exit [`Action`]s, an optional parent it inherits handlers from, and a handler table
//! keyed by event type. At runtime every machine owns a stack of states: [`Context::push`] opens a
//! nested state whose unhandled events fall through to the states below it.
//!
//! A [`Monitor`] is declared the same way but runs synchronously inside the machine that calls
//! [`Context::monitor`]. Its states may be annotated [`Temperature::Hot`] or
//! [`Temperature::Cold`] to express liveness properties.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display, Formatter};

mod context;
mod declaration;
pub(crate) mod instance;
pub(crate) mod monitor;

pub use context::Context;
pub(crate) use context::Transition;
pub use declaration::{Action, Declaration, Handler, StateBuilder, Temperature};
pub(crate) use declaration::{Disposition, MailboxPolicy};

/// Uniquely identifies a machine within one iteration. Identifiers are handed out in creation
/// order starting at zero, which keeps them identical when an iteration is replayed.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ActorId(u64);

impl ActorId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<usize> for ActorId {
    fn from(index: usize) -> Self {
        ActorId(index as u64)
    }
}

impl From<ActorId> for usize {
    fn from(id: ActorId) -> Self {
        id.0 as usize
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0)
    }
}

/// The result of an action.
pub type ActionResult = Result<(), ActionError>;

/// Why an action stopped early.
///
/// User errors convert into [`ActionError::Exception`] through `?`, which routes them to
/// [`Machine::on_exception`]. [`ActionError::Stopped`] means the iteration is over: the runtime
/// returns it from every context call once a bug has been found or a bound has been reached, and
/// actions must propagate it.
pub enum ActionError {
    Stopped,
    Exception(Exception),
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for ActionError {
    fn from(error: E) -> Self {
        ActionError::Exception(Exception::new::<E>(error.to_string()))
    }
}

impl Debug for ActionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ActionError::Stopped => f.write_str("Stopped"),
            ActionError::Exception(e) => f.debug_tuple("Exception").field(e).finish(),
        }
    }
}

impl Display for ActionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ActionError::Stopped => f.write_str("iteration stopped"),
            ActionError::Exception(e) => Display::fmt(e, f),
        }
    }
}

/// An error or panic that escaped an action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exception {
    kind: &'static str,
    message: String,
}

impl Exception {
    pub fn new<E: ?Sized>(message: impl Into<String>) -> Self {
        Exception {
            kind: crate::event::short_type_name::<E>(),
            message: message.into(),
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Exception {
            kind: "panic",
            message,
        }
    }

    /// Name of the error type, or `panic`.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Exception {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<Exception> for ActionError {
    fn from(exception: Exception) -> Self {
        ActionError::Exception(exception)
    }
}

/// How a machine disposes of an exception raised by one of its actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnException {
    /// Report an unhandled exception.
    Propagate,
    /// Continue as if the action had completed.
    Handled,
    /// Halt the machine.
    Halt,
}

/// An actor with hierarchical states and a mailbox.
///
/// ```rust
/// use machinist::*;
///
/// #[derive(Debug, Hash)]
/// struct Tick;
/// impl Event for Tick {}
///
/// struct Counter { ticks: u32 }
///
/// impl Machine for Counter {
///     fn declare(d: &mut Declaration<Self>) {
///         d.state("Counting").on_event(|ctx, _: &Tick| {
///             ctx.ticks += 1;
///             if ctx.ticks == 3 {
///                 ctx.halt()?;
///             }
///             Ok(())
///         });
///     }
///
///     fn hashed_state(&self) -> u64 {
///         stable_hash(&self.ticks)
///     }
/// }
/// ```
pub trait Machine: Sized + Send + 'static {
    /// Declares the states of the machine. The first declared state is the start state unless
    /// [`Declaration::start`] names another.
    fn declare(d: &mut Declaration<Self>);

    /// Digest of the private fields that should distinguish program states.
    fn hashed_state(&self) -> u64 {
        0
    }

    /// Decides what happens when an action in `state` fails.
    fn on_exception(&mut self, _state: &'static str, _exception: &Exception) -> OnException {
        OnException::Propagate
    }

    /// Called once when the machine halts.
    fn on_halt(&mut self) {}
}

/// A globally visible observer of events that machines announce through [`Context::monitor`].
pub trait Monitor: Sized + Send + 'static {
    /// Declares the states of the monitor. Monitors may not push states or defer events.
    fn declare(d: &mut Declaration<Self>);

    /// Digest of the private fields that should distinguish program states.
    fn hashed_state(&self) -> u64 {
        0
    }
}
