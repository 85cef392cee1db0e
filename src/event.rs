//! Private module for selective re-export.

use std::any::{Any, TypeId};
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

/// A payload exchanged between machines or delivered to monitors.
///
/// Events must hash structurally: their digest takes part in program fingerprints, so two events
/// that the program cannot tell apart must hash identically.
///
/// ```rust
/// # use machinist::Event;
/// #[derive(Debug, Hash)]
/// struct Timeout { attempt: u32 }
/// impl Event for Timeout {}
/// ```
pub trait Event: Any + Debug + Hash + Send {
    /// Bounds how many instances of this event type may sit in a single mailbox at once.
    /// Exceeding the bound is reported as an assertion failure.
    fn max_instances(&self) -> Option<usize> {
        None
    }
}

/// Identifies the type of an event. Handler tables are keyed by kind.
#[derive(Clone, Copy)]
pub struct EventKind {
    id: TypeId,
    name: &'static str,
    path: &'static str,
}

impl EventKind {
    pub fn of<E: Event>() -> Self {
        EventKind {
            id: TypeId::of::<E>(),
            name: short_type_name::<E>(),
            path: std::any::type_name::<E>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The full type path, which tells apart events of the same name in different modules.
    pub fn path(&self) -> &'static str {
        self.path
    }
}

impl PartialEq for EventKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventKind {}

impl Hash for EventKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // The path rather than the TypeId, which is not stable between compilations.
        self.path.hash(state);
    }
}

impl Debug for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

trait Payload: Any + Debug + Send {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Debug + Send> Payload for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// A type-erased [`Event`] as it travels through mailboxes.
pub struct AnyEvent {
    kind: EventKind,
    digest: u64,
    max_instances: Option<usize>,
    payload: Box<dyn Payload>,
}

impl AnyEvent {
    pub fn new<E: Event>(event: E) -> Self {
        AnyEvent {
            kind: EventKind::of::<E>(),
            digest: crate::stable_hash(&event),
            max_instances: event.max_instances(),
            payload: Box::new(event),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Structural digest of the payload.
    pub fn digest(&self) -> u64 {
        self.digest
    }

    pub fn max_instances(&self) -> Option<usize> {
        self.max_instances
    }

    pub fn is<E: Event>(&self) -> bool {
        self.kind.id == TypeId::of::<E>()
    }

    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        (*self.payload).as_any().downcast_ref()
    }

    /// Recovers the typed event, or returns the event unchanged when the type does not match.
    pub fn downcast<E: Event>(self) -> Result<E, AnyEvent> {
        if !self.is::<E>() {
            return Err(self);
        }
        match self.payload.into_any().downcast::<E>() {
            Ok(event) => Ok(*event),
            Err(_) => unreachable!("payload type matches its kind"),
        }
    }
}

impl Hash for AnyEvent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.digest.hash(state);
    }
}

impl Debug for AnyEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.payload, f)
    }
}

/// Halts the receiving machine unless its current state handles it.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct Halt;

impl Event for Halt {}

/// Registering a handler for this event matches every event that the declaring state does not
/// handle explicitly. It is never sent.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct WildCard;

impl Event for WildCard {}

/// `std::any::type_name` without the module path, keeping generic arguments readable.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(i) if head.len() == full.len() => &full[i + 2..],
        _ => full,
    }
}
