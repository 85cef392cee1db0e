use crate::runtime::{schedulable, TaskInfo};
use crate::strategy::Strategy;
use crate::ActorId;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Options {
    Actors(Vec<ActorId>),
    Booleans,
    Integers(usize),
}

impl Options {
    fn len(&self) -> usize {
        match self {
            Options::Actors(ids) => ids.len(),
            Options::Booleans => 2,
            Options::Integers(bound) => *bound,
        }
    }
}

#[derive(Clone, Debug)]
struct ChoicePoint {
    options: Options,
    chosen: usize,
}

/// Exhaustive depth-first enumeration of the decision tree.
///
/// Each iteration replays the decisions of the previous one up to the deepest decision that still
/// has an untried alternative, takes that alternative and continues with first options from
/// there. The currently running machine is always the first option, so the leftmost schedule
/// switches machines only when it must.
pub struct DfsStrategy {
    stack: Vec<ChoicePoint>,
    position: usize,
    prefix: usize,
    max_steps: Option<usize>,
    finished: bool,
    error: Option<String>,
}

impl DfsStrategy {
    pub fn new(max_steps: Option<usize>) -> Self {
        DfsStrategy {
            stack: Vec::new(),
            position: 0,
            prefix: 0,
            max_steps,
            finished: false,
            error: None,
        }
    }

    fn decide(&mut self, options: Options) -> Option<usize> {
        if self.error.is_some() {
            return None;
        }
        if let Some(point) = self.stack.get(self.position) {
            if point.options != options {
                self.error = Some(format!(
                    "nondeterminism detected at decision {}: expected {:?}, found {:?}",
                    self.position, point.options, options
                ));
                return None;
            }
            self.position += 1;
            return Some(point.chosen);
        }
        self.stack.push(ChoicePoint { options, chosen: 0 });
        self.position += 1;
        Some(0)
    }
}

impl Strategy for DfsStrategy {
    fn next_actor(&mut self, tasks: &[TaskInfo], current: Option<ActorId>) -> Option<ActorId> {
        let mut enabled = schedulable(tasks);
        if enabled.is_empty() {
            return None;
        }
        if let Some(i) = current.and_then(|c| enabled.iter().position(|id| *id == c)) {
            let current = enabled.remove(i);
            enabled.insert(0, current);
        }
        let chosen = self.decide(Options::Actors(enabled.clone()))?;
        enabled.get(chosen).copied()
    }

    fn next_boolean(&mut self, _is_fair: bool) -> Option<bool> {
        self.decide(Options::Booleans).map(|chosen| chosen == 1)
    }

    fn next_integer(&mut self, bound: usize) -> Option<usize> {
        self.decide(Options::Integers(bound))
    }

    fn depth_bound(&self) -> Option<usize> {
        self.max_steps
    }

    fn has_finished(&self) -> bool {
        self.finished
    }

    fn advance(&mut self) {
        if self.error.is_some() {
            // The decision tree no longer describes the program.
            self.finished = true;
            return;
        }
        self.stack.truncate(self.position);
        while let Some(point) = self.stack.last_mut() {
            if point.chosen + 1 < point.options.len() {
                point.chosen += 1;
                break;
            }
            self.stack.pop();
        }
        log::trace!("dfs backtracked to depth {}", self.stack.len());
        self.finished = self.stack.is_empty();
        self.prefix = self.stack.len();
        self.position = 0;
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.position = 0;
        self.prefix = 0;
        self.finished = false;
        self.error = None;
    }

    fn description(&self) -> String {
        "dfs".to_owned()
    }

    fn error(&self) -> Option<String> {
        self.error.clone()
    }

    fn in_prefix(&self) -> bool {
        self.position < self.prefix
    }
}
