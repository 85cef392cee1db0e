use crate::machine::ActorId;

/// What the scheduler knows about one machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: ActorId,
    /// The machine has work to do: it is running, starting, or has a deliverable event.
    pub enabled: bool,
    /// The machine waits in a receive or a join.
    pub blocked: bool,
    /// The machine holds control.
    pub active: bool,
    /// The start state's entry action has begun.
    pub started: bool,
    /// The machine has halted.
    pub completed: bool,
    /// Machines a join is waiting on.
    pub blocked_on: Vec<ActorId>,
    /// Whether the join waits for all of `blocked_on` rather than any.
    pub wait_all: bool,
}

impl TaskInfo {
    pub fn new(id: ActorId) -> Self {
        TaskInfo {
            id,
            enabled: true,
            blocked: false,
            active: false,
            started: false,
            completed: false,
            blocked_on: Vec::new(),
            wait_all: false,
        }
    }

    /// Whether a strategy may hand control to this machine.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && !self.blocked && !self.completed
    }
}

/// One [`TaskInfo`] per machine, indexed by [`ActorId`].
#[derive(Clone, Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<TaskInfo>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the task of a newly created machine. Identifiers are dense, so `id` must be the next
    /// one.
    pub fn register(&mut self, id: ActorId) -> &mut TaskInfo {
        debug_assert_eq!(id.index(), self.tasks.len());
        self.tasks.push(TaskInfo::new(id));
        let last = self.tasks.len() - 1;
        &mut self.tasks[last]
    }

    pub fn get(&self, id: ActorId) -> Option<&TaskInfo> {
        self.tasks.get(id.index())
    }

    pub fn get_mut(&mut self, id: ActorId) -> Option<&mut TaskInfo> {
        self.tasks.get_mut(id.index())
    }

    pub fn as_slice(&self) -> &[TaskInfo] {
        &self.tasks
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TaskInfo> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Machines a strategy may choose from, in creation order.
    pub fn schedulable(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.tasks.iter().filter(|t| t.is_schedulable()).map(|t| t.id)
    }

    pub fn any_blocked(&self) -> bool {
        self.tasks.iter().any(|t| t.blocked && !t.completed)
    }
}

/// Machines a strategy may choose from, in creation order.
pub(crate) fn schedulable(tasks: &[TaskInfo]) -> Vec<ActorId> {
    tasks.iter().filter(|t| t.is_schedulable()).map(|t| t.id).collect()
}
