use crate::runtime::TaskInfo;
use crate::strategy::Strategy;
use crate::trace::{Choice, ScheduleTrace};
use crate::ActorId;

/// Forces the decisions recorded in a [`ScheduleTrace`].
pub struct ReplayStrategy {
    choices: Vec<Choice>,
    position: usize,
    finished: bool,
    error: Option<String>,
}

impl ReplayStrategy {
    pub fn new(trace: &ScheduleTrace) -> Self {
        ReplayStrategy {
            choices: trace.choices().cloned().collect(),
            position: 0,
            finished: false,
            error: None,
        }
    }

    /// Number of recorded decisions reproduced so far.
    pub fn consumed(&self) -> usize {
        self.position
    }

    fn next(&mut self, expected: &str) -> Option<&Choice> {
        if self.error.is_some() {
            return None;
        }
        match self.choices.get(self.position) {
            Some(choice) => {
                self.position += 1;
                Some(choice)
            }
            None => {
                self.error = Some(format!(
                    "the program asked for {} after the last of {} recorded steps",
                    expected,
                    self.choices.len()
                ));
                None
            }
        }
    }

    fn diverge(&mut self, message: String) -> Option<ActorId> {
        self.error = Some(format!("step {}: {}", self.position.saturating_sub(1), message));
        None
    }
}

impl Strategy for ReplayStrategy {
    fn next_actor(&mut self, tasks: &[TaskInfo], _current: Option<ActorId>) -> Option<ActorId> {
        if !tasks.iter().any(TaskInfo::is_schedulable) {
            return None;
        }
        let choice = self.next("a scheduling decision")?.clone();
        match choice {
            Choice::Schedule(id) => {
                if tasks.get(id.index()).map_or(false, TaskInfo::is_schedulable) {
                    Some(id)
                } else {
                    self.diverge(format!("recorded machine {} cannot run", id))
                }
            }
            other => self.diverge(format!("expected a scheduling decision, found {:?}", other)),
        }
    }

    fn next_boolean(&mut self, _is_fair: bool) -> Option<bool> {
        match self.next("a boolean choice")?.clone() {
            Choice::Boolean(value) | Choice::FairBoolean { value, .. } => Some(value),
            other => {
                self.diverge(format!("expected a boolean choice, found {:?}", other));
                None
            }
        }
    }

    fn next_integer(&mut self, bound: usize) -> Option<usize> {
        match self.next("an integer choice")?.clone() {
            Choice::Integer(value) if value < bound => Some(value),
            other => {
                self.diverge(format!("expected an integer below {}, found {:?}", bound, other));
                None
            }
        }
    }

    fn depth_bound(&self) -> Option<usize> {
        None
    }

    fn has_finished(&self) -> bool {
        self.finished
    }

    fn advance(&mut self) {
        self.finished = true;
    }

    fn reset(&mut self) {
        self.position = 0;
        self.finished = false;
        self.error = None;
    }

    fn description(&self) -> String {
        format!("replay ({} steps)", self.choices.len())
    }

    fn error(&self) -> Option<String> {
        self.error.clone()
    }

    fn in_prefix(&self) -> bool {
        true
    }
}
