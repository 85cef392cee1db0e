//! Private module for selective re-export.

use crate::cache::ProgramState;
use crate::machine::ActorId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// A decision made by the scheduling strategy.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Choice {
    /// The machine that was given control.
    Schedule(ActorId),
    /// A boolean choice.
    Boolean(bool),
    /// A boolean choice that is expected to be resolved fairly, tagged by its call site.
    FairBoolean { id: String, value: bool },
    /// An integer choice below a bound.
    Integer(usize),
}

/// The kind of a [`ScheduleStep`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum StepKind {
    SchedulingChoice,
    NondetBooleanChoice,
    FairNondetBooleanChoice,
    NondetIntegerChoice,
}

impl Choice {
    pub fn kind(&self) -> StepKind {
        match self {
            Choice::Schedule(_) => StepKind::SchedulingChoice,
            Choice::Boolean(_) => StepKind::NondetBooleanChoice,
            Choice::FairBoolean { .. } => StepKind::FairNondetBooleanChoice,
            Choice::Integer(_) => StepKind::NondetIntegerChoice,
        }
    }
}

/// One recorded decision, optionally with the program state captured right after it.
#[derive(Clone, Debug)]
pub struct ScheduleStep {
    index: usize,
    choice: Choice,
    state: Option<ProgramState>,
}

impl ScheduleStep {
    /// Position of the step in the iteration. Indices only grow, even across [`ScheduleTrace::pop`].
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> StepKind {
        self.choice.kind()
    }

    pub fn choice(&self) -> &Choice {
        &self.choice
    }

    pub fn state(&self) -> Option<&ProgramState> {
        self.state.as_ref()
    }

    pub(crate) fn set_state(&mut self, state: ProgramState) {
        self.state = Some(state);
    }

    /// The scheduled machine for scheduling steps.
    pub fn scheduled(&self) -> Option<ActorId> {
        match self.choice {
            Choice::Schedule(id) => Some(id),
            _ => None,
        }
    }
}

/// The ordered decisions of one iteration.
///
/// Steps are appended while the program runs. The liveness checker pops steps from the end when
/// it folds a cycle, and [`ScheduleTrace::previous`]/[`ScheduleTrace::next`] walk neighbours.
/// The textual form has one step per line: `(5)` schedules machine 5, `True`/`False` are boolean
/// choices, a bare integer is an integer choice and lines starting with `--` are comments.
#[derive(Clone, Debug, Default)]
pub struct ScheduleTrace {
    steps: Vec<ScheduleStep>,
    next_index: usize,
}

impl ScheduleTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scheduling_choice(&mut self, id: ActorId) -> &mut ScheduleStep {
        self.push(Choice::Schedule(id))
    }

    pub fn add_nondeterministic_boolean_choice(&mut self, value: bool) -> &mut ScheduleStep {
        self.push(Choice::Boolean(value))
    }

    pub fn add_fair_nondeterministic_boolean_choice(
        &mut self,
        id: impl Into<String>,
        value: bool,
    ) -> &mut ScheduleStep {
        self.push(Choice::FairBoolean {
            id: id.into(),
            value,
        })
    }

    pub fn add_nondeterministic_integer_choice(&mut self, value: usize) -> &mut ScheduleStep {
        self.push(Choice::Integer(value))
    }

    pub(crate) fn push(&mut self, choice: Choice) -> &mut ScheduleStep {
        let index = self.next_index;
        self.next_index += 1;
        self.steps.push(ScheduleStep {
            index,
            choice,
            state: None,
        });
        let last = self.steps.len() - 1;
        &mut self.steps[last]
    }

    /// Removes and returns the last step.
    pub fn pop(&mut self) -> Option<ScheduleStep> {
        self.steps.pop()
    }

    /// The last step.
    pub fn peek(&self) -> Option<&ScheduleStep> {
        self.steps.last()
    }

    pub fn peek_mut(&mut self) -> Option<&mut ScheduleStep> {
        self.steps.last_mut()
    }

    /// Looks a step up by its index.
    pub fn get(&self, index: usize) -> Option<&ScheduleStep> {
        self.position(index).map(|i| &self.steps[i])
    }

    pub fn previous(&self, step: &ScheduleStep) -> Option<&ScheduleStep> {
        let i = self.position(step.index)?;
        i.checked_sub(1).map(|i| &self.steps[i])
    }

    pub fn next(&self, step: &ScheduleStep) -> Option<&ScheduleStep> {
        let i = self.position(step.index)?;
        self.steps.get(i + 1)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScheduleStep> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The decisions alone, which is what a replay consumes.
    pub fn choices(&self) -> impl Iterator<Item = &Choice> + '_ {
        self.steps.iter().map(|s| &s.choice)
    }

    /// Writes the textual form to a file, preceded by comment lines.
    pub fn save(&self, path: impl AsRef<Path>, comments: &[&str]) -> Result<(), TraceError> {
        let mut text = String::new();
        for comment in comments {
            for line in comment.lines() {
                text.push_str("-- ");
                text.push_str(line);
                text.push('\n');
            }
        }
        text.push_str(&self.to_string());
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        std::fs::read_to_string(path)?.parse()
    }

    fn position(&self, index: usize) -> Option<usize> {
        self.steps.binary_search_by_key(&index, |s| s.index).ok()
    }
}

impl<'a> IntoIterator for &'a ScheduleTrace {
    type Item = &'a ScheduleStep;
    type IntoIter = std::slice::Iter<'a, ScheduleStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

impl Display for ScheduleTrace {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            match &step.choice {
                Choice::Schedule(id) => writeln!(f, "{}", id)?,
                Choice::Boolean(true) | Choice::FairBoolean { value: true, .. } => {
                    writeln!(f, "True")?
                }
                Choice::Boolean(false) | Choice::FairBoolean { value: false, .. } => {
                    writeln!(f, "False")?
                }
                Choice::Integer(n) => writeln!(f, "{}", n)?,
            }
        }
        Ok(())
    }
}

impl FromStr for ScheduleTrace {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut trace = ScheduleTrace::new();
        for (number, line) in s.lines().enumerate() {
            let text = line.trim();
            if text.is_empty() || text.starts_with("--") {
                continue;
            }
            let malformed = || TraceError::Malformed {
                line: number + 1,
                text: text.to_owned(),
            };
            let choice = match text {
                "True" => Choice::Boolean(true),
                "False" => Choice::Boolean(false),
                _ if text.starts_with('(') && text.ends_with(')') => {
                    let id = text[1..text.len() - 1].parse::<usize>().map_err(|_| malformed())?;
                    Choice::Schedule(ActorId::from(id))
                }
                _ => Choice::Integer(text.parse().map_err(|_| malformed())?),
            };
            trace.push(choice);
        }
        Ok(trace)
    }
}

impl Serialize for ScheduleTrace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ScheduleTrace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Failure to read a schedule trace.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("line {line}: unrecognized schedule step `{text}`")]
    Malformed { line: usize, text: String },
    #[error("unable to access trace file")]
    Io(#[from] std::io::Error),
}

/// Failure to reproduce a schedule trace.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("trace is not reproducible: {0}")]
    Diverged(String),
    #[error("trace is not reproducible: execution ended after {consumed} of {total} steps")]
    Incomplete { consumed: usize, total: usize },
    #[error("trace is not deterministic: replays disagree from step {step}")]
    Nondeterministic { step: usize },
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> ScheduleTrace {
        let mut trace = ScheduleTrace::new();
        trace.add_scheduling_choice(ActorId::from(0));
        trace.add_scheduling_choice(ActorId::from(5));
        trace.add_nondeterministic_boolean_choice(true);
        trace.add_fair_nondeterministic_boolean_choice("(5):Init:lib.rs:1:1", false);
        trace.add_nondeterministic_integer_choice(3);
        trace
    }

    #[test]
    fn formats_one_step_per_line() {
        assert_eq!(sample().to_string(), "(0)\n(5)\nTrue\nFalse\n3\n");
    }

    #[test]
    fn parses_and_skips_comments() {
        let trace: ScheduleTrace = "-- found by random\n(0)\n\n(5)\nTrue\n  False\n3\n".parse().unwrap();
        assert_eq!(
            trace.choices().cloned().collect::<Vec<_>>(),
            vec![
                Choice::Schedule(ActorId::from(0)),
                Choice::Schedule(ActorId::from(5)),
                Choice::Boolean(true),
                Choice::Boolean(false),
                Choice::Integer(3),
            ]
        );
        assert_eq!(trace.to_string(), sample().to_string());
    }

    #[test]
    fn rejects_garbage() {
        let err = "(0)\nmaybe\n".parse::<ScheduleTrace>().unwrap_err();
        assert!(matches!(err, TraceError::Malformed { line: 2, .. }), "{err}");
        assert!("(x)".parse::<ScheduleTrace>().is_err());
    }

    #[test]
    fn pop_keeps_indices_monotonic() {
        let mut trace = sample();
        assert_eq!(trace.pop().map(|s| s.index()), Some(4));
        assert_eq!(trace.peek().map(|s| s.kind()), Some(StepKind::FairNondetBooleanChoice));
        let index = trace.add_nondeterministic_boolean_choice(false).index();
        assert_eq!(index, 5);
        assert_eq!(trace.len(), 5);
    }

    #[test]
    fn walks_neighbours() {
        let trace = sample();
        let second = trace.get(1).unwrap();
        assert_eq!(trace.previous(second).and_then(|s| s.scheduled()), Some(ActorId::from(0)));
        assert_eq!(trace.next(second).map(|s| s.kind()), Some(StepKind::NondetBooleanChoice));
        assert!(trace.previous(trace.get(0).unwrap()).is_none());
        assert!(trace.next(trace.peek().unwrap()).is_none());
    }

    #[test]
    fn serializes_as_text() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert_eq!(json, "\"(0)\\n(5)\\nTrue\\nFalse\\n3\\n\"");
        let back: ScheduleTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 5);
    }
}
