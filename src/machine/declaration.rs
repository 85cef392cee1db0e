use crate::event::{Event, EventKind, Halt, WildCard};
use crate::machine::{ActionResult, Context};
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

/// Code run on entry to a state, on exit from it, or in response to an event.
pub type Action<M> = Arc<dyn for<'a> Fn(&mut Context<'a, M>) -> ActionResult + Send + Sync>;

/// What a state does with an event of a given type.
pub enum Handler<M> {
    /// Exit the current state and enter the target.
    Goto(&'static str),
    /// Enter the target on top of the current state.
    Push(&'static str),
    /// Run an action without changing state.
    Invoke(Action<M>),
    /// Drop the event.
    Ignore,
    /// Leave the event in the mailbox until a state that does not defer it is reached.
    Defer,
}

impl<M> Clone for Handler<M> {
    fn clone(&self) -> Self {
        match self {
            Handler::Goto(target) => Handler::Goto(*target),
            Handler::Push(target) => Handler::Push(*target),
            Handler::Invoke(action) => Handler::Invoke(Arc::clone(action)),
            Handler::Ignore => Handler::Ignore,
            Handler::Defer => Handler::Defer,
        }
    }
}

impl<M> Debug for Handler<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Goto(target) => write!(f, "Goto({})", target),
            Handler::Push(target) => write!(f, "Push({})", target),
            Handler::Invoke(_) => f.write_str("Invoke"),
            Handler::Ignore => f.write_str("Ignore"),
            Handler::Defer => f.write_str("Defer"),
        }
    }
}

/// Liveness annotation of a monitor state.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum Temperature {
    #[default]
    Neutral,
    Hot,
    Cold,
}

pub(crate) struct StateDecl<M> {
    pub(crate) name: &'static str,
    pub(crate) entry: Option<Action<M>>,
    pub(crate) exit: Option<Action<M>>,
    pub(crate) parent: Option<&'static str>,
    pub(crate) temperature: Temperature,
    handlers: HashMap<EventKind, Handler<M>>,
}

/// The states of one machine or monitor type.
pub struct Declaration<M> {
    states: Vec<StateDecl<M>>,
    index: HashMap<&'static str, usize>,
    start: Option<&'static str>,
}

/// Configures one state. Returned by [`Declaration::state`].
pub struct StateBuilder<'d, M> {
    state: &'d mut StateDecl<M>,
}

impl<M: Send + 'static> Declaration<M> {
    pub(crate) fn empty() -> Self {
        Declaration {
            states: Vec::new(),
            index: HashMap::new(),
            start: None,
        }
    }

    /// Builds the declaration with `declare` and checks that every referenced state exists.
    ///
    /// # Panics
    ///
    /// Panics when the declaration is empty or names a state that was never declared.
    pub(crate) fn build(owner: &str, declare: fn(&mut Self)) -> Self {
        let mut d = Self::empty();
        declare(&mut d);
        if let Err(problem) = d.validate() {
            panic!("Invalid declaration for {}: {}", owner, problem);
        }
        d
    }

    /// Declares a state, or reopens one declared earlier.
    pub fn state(&mut self, name: &'static str) -> StateBuilder<'_, M> {
        let i = match self.index.get(name) {
            Some(i) => *i,
            None => {
                self.states.push(StateDecl {
                    name,
                    entry: None,
                    exit: None,
                    parent: None,
                    temperature: Temperature::Neutral,
                    handlers: HashMap::new(),
                });
                self.index.insert(name, self.states.len() - 1);
                self.states.len() - 1
            }
        };
        StateBuilder {
            state: &mut self.states[i],
        }
    }

    /// Names the start state.
    pub fn start(&mut self, name: &'static str) -> &mut Self {
        self.start = Some(name);
        self
    }

    pub(crate) fn start_state(&self) -> &'static str {
        // Validation guarantees at least one state.
        self.start.unwrap_or_else(|| self.states[0].name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&StateDecl<M>> {
        self.index.get(name).map(|i| &self.states[*i])
    }

    /// Finds the handler for `kind` given a stack of states, top last. Each stacked state is
    /// consulted from the top down, together with its chain of parents. Returns the stack level
    /// of the state that supplied the handler.
    pub(crate) fn resolve(&self, stack: &[&'static str], kind: EventKind) -> Option<(usize, &Handler<M>)> {
        let wildcard = EventKind::of::<WildCard>();
        for level in (0..stack.len()).rev() {
            let mut name = Some(stack[level]);
            while let Some(state) = name.and_then(|n| self.get(n)) {
                if let Some(handler) = state.handlers.get(&kind) {
                    return Some((level, handler));
                }
                if kind != EventKind::of::<Halt>() {
                    if let Some(handler) = state.handlers.get(&wildcard) {
                        return Some((level, handler));
                    }
                }
                name = state.parent;
            }
        }
        None
    }

    /// Checks the restrictions that apply to monitors.
    pub(crate) fn validate_monitor(&self) -> Result<(), String> {
        for state in &self.states {
            for (kind, handler) in &state.handlers {
                if matches!(handler, Handler::Push(_) | Handler::Defer) {
                    return Err(format!(
                        "state {} declares {:?} for {}, which monitors do not support",
                        state.name, handler, kind
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), String> {
        if self.states.is_empty() {
            return Err("no states declared".to_owned());
        }
        let known = |name: &str, context: &str| {
            if self.index.contains_key(name) {
                Ok(())
            } else {
                Err(format!("{} refers to unknown state {}", context, name))
            }
        };
        if let Some(start) = self.start {
            known(start, "start")?;
        }
        for state in &self.states {
            if let Some(parent) = state.parent {
                known(parent, state.name)?;
            }
            let mut ancestor = state.parent;
            for _ in 0..self.states.len() {
                ancestor = ancestor.and_then(|a| self.get(a)).and_then(|a| a.parent);
            }
            if ancestor.is_some() {
                return Err(format!("{} has cyclic parents", state.name));
            }
            for handler in state.handlers.values() {
                if let Handler::Goto(target) | Handler::Push(target) = handler {
                    known(target, state.name)?;
                }
            }
        }
        Ok(())
    }
}

impl<M> Debug for Declaration<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_map();
        for state in &self.states {
            list.entry(&state.name, &state.handlers);
        }
        list.finish()
    }
}

impl<'d, M: Send + 'static> StateBuilder<'d, M> {
    pub fn entry<F>(self, action: F) -> Self
    where
        F: for<'a> Fn(&mut Context<'a, M>) -> ActionResult + Send + Sync + 'static,
    {
        self.state.entry = Some(Arc::new(action));
        self
    }

    pub fn exit<F>(self, action: F) -> Self
    where
        F: for<'a> Fn(&mut Context<'a, M>) -> ActionResult + Send + Sync + 'static,
    {
        self.state.exit = Some(Arc::new(action));
        self
    }

    /// Inherits the handlers of another state that this one does not override.
    pub fn parent(self, parent: &'static str) -> Self {
        self.state.parent = Some(parent);
        self
    }

    pub fn hot(self) -> Self {
        self.state.temperature = Temperature::Hot;
        self
    }

    pub fn cold(self) -> Self {
        self.state.temperature = Temperature::Cold;
        self
    }

    pub fn on<E: Event>(self, handler: Handler<M>) -> Self {
        self.state.handlers.insert(EventKind::of::<E>(), handler);
        self
    }

    /// Runs `action` with the typed event whenever one arrives in this state.
    pub fn on_event<E, F>(self, action: F) -> Self
    where
        E: Event,
        F: for<'a> Fn(&mut Context<'a, M>, &E) -> ActionResult + Send + Sync + 'static,
    {
        let action: Action<M> = Arc::new(move |ctx: &mut Context<'_, M>| {
            let event = ctx.event.take();
            let result = match event.as_ref().and_then(|e| e.downcast_ref::<E>()) {
                Some(typed) => action(ctx, typed),
                None => Ok(()),
            };
            ctx.event = event;
            result
        });
        self.on::<E>(Handler::Invoke(action))
    }

    /// Runs `action` whenever an event of type `E` arrives in this state.
    pub fn invoke_on<E: Event>(
        self,
        action: impl for<'a> Fn(&mut Context<'a, M>) -> ActionResult + Send + Sync + 'static,
    ) -> Self {
        self.on::<E>(Handler::Invoke(Arc::new(action)))
    }

    pub fn goto_on<E: Event>(self, target: &'static str) -> Self {
        self.on::<E>(Handler::Goto(target))
    }

    pub fn push_on<E: Event>(self, target: &'static str) -> Self {
        self.on::<E>(Handler::Push(target))
    }

    pub fn ignore<E: Event>(self) -> Self {
        self.on::<E>(Handler::Ignore)
    }

    pub fn defer<E: Event>(self) -> Self {
        self.on::<E>(Handler::Defer)
    }
}

/// What a mailbox does with a queued event, decided without access to the machine value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    Handle,
    Ignore,
    Defer,
    Unhandled,
}

/// The handler table of a machine type, erased so that the runtime can classify mailbox
/// contents from any thread.
pub(crate) trait MailboxPolicy: Send + Sync {
    fn disposition(&self, stack: &[&'static str], kind: EventKind) -> Disposition;
}

impl<M: Send + 'static> MailboxPolicy for Declaration<M> {
    fn disposition(&self, stack: &[&'static str], kind: EventKind) -> Disposition {
        match self.resolve(stack, kind) {
            Some((_, Handler::Ignore)) => Disposition::Ignore,
            Some((_, Handler::Defer)) => Disposition::Defer,
            Some(_) => Disposition::Handle,
            None => Disposition::Unhandled,
        }
    }
}
