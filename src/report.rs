//! Results of a testing run and progress reporting.

use crate::trace::ScheduleTrace;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::io::Write;
use std::time::Duration;

/// The categories of bugs the engine detects.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum BugKind {
    AssertionFailure,
    UnhandledException,
    /// An event arrived with no applicable handler anywhere on the state stack.
    UnhandledEvent,
    /// No machine can run and at least one is blocked.
    Deadlock,
    LivenessViolation,
    /// Misuse of the transition API, such as two terminal actions in one action.
    DisciplineViolation,
}

impl Display for BugKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            BugKind::AssertionFailure => "assertion failure",
            BugKind::UnhandledException => "unhandled exception",
            BugKind::UnhandledEvent => "unhandled event",
            BugKind::Deadlock => "deadlock",
            BugKind::LivenessViolation => "liveness violation",
            BugKind::DisciplineViolation => "discipline violation",
        };
        f.write_str(text)
    }
}

/// A bug together with the schedule that reproduces it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bug {
    pub kind: BugKind,
    pub message: String,
    /// Iteration of the worker that found the bug.
    pub iteration: usize,
    pub trace: ScheduleTrace,
}

impl Display for Bug {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in iteration {} after {} steps: {}",
            self.kind,
            self.iteration,
            self.trace.len(),
            self.message
        )
    }
}

/// Summary of a testing run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TestReport {
    pub strategy: String,
    /// Whether the strategy eventually schedules every enabled machine. Liveness verdicts of an
    /// unfair strategy may miss fair cycles that it never follows.
    pub fair: bool,
    pub iterations: usize,
    pub distinct_schedules: usize,
    /// Distinct program states, when states are cached.
    pub distinct_states: usize,
    pub bugs: Vec<Bug>,
    /// Iterations stopped by the step or depth bound.
    pub truncated: usize,
    /// Iterations ended on a state explored by an earlier one.
    pub pruned: usize,
    /// Decisions of the longest iteration.
    pub max_steps: usize,
    pub total_steps: usize,
    /// Events sent to machines that had already halted.
    pub dropped_events: usize,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl TestReport {
    /// The schedule of the first bug found.
    pub fn trace_to_replay(&self) -> Option<&ScheduleTrace> {
        self.bugs.first().map(|bug| &bug.trace)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// The data sent during a report event.
pub struct ReportData {
    pub iterations: usize,
    pub bugs: usize,
    pub distinct_schedules: usize,
    pub distinct_states: usize,
    /// The current duration testing has been running for.
    pub duration: Duration,
    /// Whether testing is done.
    pub done: bool,
}

/// A reporter for progress during testing.
pub trait Reporter {
    /// Report a progress event.
    fn report_testing(&mut self, data: ReportData);

    /// Report the bugs at the end of the run.
    fn report_bugs(&mut self, bugs: &[Bug]);
}

pub struct WriteReporter<'a, W> {
    writer: &'a mut W,
}

impl<'a, W> WriteReporter<'a, W> {
    pub fn new(writer: &'a mut W) -> Self {
        Self { writer }
    }
}

impl<'a, W: Write> Reporter for WriteReporter<'a, W> {
    fn report_testing(&mut self, data: ReportData) {
        if data.done {
            let _ = writeln!(
                self.writer,
                "Done. iterations={}, bugs={}, schedules={}, states={}, sec={}",
                data.iterations,
                data.bugs,
                data.distinct_schedules,
                data.distinct_states,
                data.duration.as_secs(),
            );
        } else {
            let _ = writeln!(
                self.writer,
                "Testing. iterations={}, bugs={}, schedules={}, states={}",
                data.iterations, data.bugs, data.distinct_schedules, data.distinct_states,
            );
        }
    }

    fn report_bugs(&mut self, bugs: &[Bug]) {
        for bug in bugs {
            let _ = writeln!(self.writer, "Found {}", bug);
            let _ = write!(self.writer, "{}", bug.trace);
        }
    }
}
