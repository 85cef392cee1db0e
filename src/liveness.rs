//! Private module for selective re-export.

use crate::cache::{MonitorStatus, StateCache};
use crate::machine::ActorId;
use crate::trace::{Choice, ScheduleStep, ScheduleTrace};
use crate::Fingerprint;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// A liveness property that does not hold.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LivenessViolation {
    #[error("monitor {} is hot at termination", .monitors.join(", "))]
    AtTermination { monitors: Vec<&'static str> },
    #[error(
        "monitor {} stays hot throughout a fair cycle of {length} steps",
        .monitors.join(", ")
    )]
    FairCycle {
        monitors: Vec<&'static str>,
        length: usize,
    },
    #[error("monitor {monitor} has been hot for {steps} consecutive steps")]
    Temperature { monitor: &'static str, steps: usize },
}

impl LivenessViolation {
    /// The monitors that are stuck in a hot state.
    pub fn monitors(&self) -> Vec<&'static str> {
        match self {
            LivenessViolation::AtTermination { monitors }
            | LivenessViolation::FairCycle { monitors, .. } => monitors.clone(),
            LivenessViolation::Temperature { monitor, .. } => vec![*monitor],
        }
    }
}

/// Checks hot monitors at termination and along cycles of program states.
///
/// A cycle is a suffix of the program trace whose last state has the fingerprint of an earlier
/// state. It only stands for an infinite execution when it is fair: every machine enabled
/// somewhere in the cycle is scheduled in it, and every fair choice resolves as often to `true` as
/// to `false`.
#[derive(Clone, Debug, Default)]
pub struct LivenessChecker {
    threshold: Option<usize>,
    hot_steps: BTreeMap<&'static str, usize>,
}

impl LivenessChecker {
    /// With a `threshold`, a monitor that stays hot for more consecutive steps is reported by
    /// [`LivenessChecker::check_temperature`].
    pub fn new(threshold: Option<usize>) -> Self {
        LivenessChecker {
            threshold,
            hot_steps: BTreeMap::new(),
        }
    }

    /// Forgets the temperatures of the previous iteration.
    pub fn reset(&mut self) {
        self.hot_steps.clear();
    }

    pub fn check_at_termination(
        &self,
        statuses: impl IntoIterator<Item = (&'static str, MonitorStatus)>,
    ) -> Option<LivenessViolation> {
        let monitors: Vec<_> = statuses
            .into_iter()
            .filter(|(_, status)| *status == MonitorStatus::Hot)
            .map(|(name, _)| name)
            .collect();
        if monitors.is_empty() {
            None
        } else {
            Some(LivenessViolation::AtTermination { monitors })
        }
    }

    /// Folds the cycle that ends at the top of `trace` and reports it if it is fair and some
    /// monitor is hot throughout. The folded steps are removed from the trace and the cache.
    pub fn check_at_trace_cycle(
        &mut self,
        root: Fingerprint,
        trace: &mut ScheduleTrace,
        cache: &mut StateCache,
    ) -> Option<LivenessViolation> {
        let mut cycle = Vec::new();
        loop {
            let step = trace.pop()?;
            if let Some(state) = step.state() {
                cache.forget(step.index(), state.fingerprint());
            }
            cycle.push(step);
            let closed = trace
                .peek()
                .and_then(|s| s.state())
                .map_or(false, |s| s.fingerprint() == root);
            if closed {
                break;
            }
        }
        log::trace!("folded a cycle of {} steps", cycle.len());
        if !is_scheduling_fair(&cycle) || !is_nondeterminism_fair(&cycle) {
            return None;
        }
        let monitors = hot_throughout(&cycle);
        if monitors.is_empty() {
            None
        } else {
            Some(LivenessViolation::FairCycle {
                monitors,
                length: cycle.len(),
            })
        }
    }

    /// Counts consecutive hot steps per monitor and reports one exceeding the threshold.
    pub fn check_temperature(
        &mut self,
        statuses: impl IntoIterator<Item = (&'static str, MonitorStatus)>,
    ) -> Option<LivenessViolation> {
        let threshold = self.threshold?;
        for (monitor, status) in statuses {
            let steps = self.hot_steps.entry(monitor).or_default();
            if status == MonitorStatus::Hot {
                *steps += 1;
                if *steps > threshold {
                    return Some(LivenessViolation::Temperature {
                        monitor,
                        steps: *steps,
                    });
                }
            } else {
                *steps = 0;
            }
        }
        None
    }
}

fn is_scheduling_fair(cycle: &[ScheduleStep]) -> bool {
    let scheduled: BTreeSet<ActorId> = cycle.iter().filter_map(ScheduleStep::scheduled).collect();
    let enabled: BTreeSet<ActorId> = cycle
        .iter()
        .filter_map(ScheduleStep::state)
        .flat_map(|s| s.enabled())
        .collect();
    scheduled == enabled
}

fn is_nondeterminism_fair(cycle: &[ScheduleStep]) -> bool {
    let mut balance: BTreeMap<&str, isize> = BTreeMap::new();
    for step in cycle {
        if let Choice::FairBoolean { id, value } = step.choice() {
            *balance.entry(id.as_str()).or_default() += if *value { 1 } else { -1 };
        }
    }
    balance.values().all(|b| *b == 0)
}

fn hot_throughout(cycle: &[ScheduleStep]) -> Vec<&'static str> {
    let mut states = cycle.iter().filter_map(ScheduleStep::state);
    let first = match states.next() {
        Some(first) => first,
        None => return Vec::new(),
    };
    let mut hot: BTreeSet<&'static str> = first
        .monitors()
        .filter(|(_, status)| *status == MonitorStatus::Hot)
        .map(|(name, _)| name)
        .collect();
    for state in states {
        hot.retain(|name| state.monitor_status(name) == MonitorStatus::Hot);
    }
    hot.into_iter().collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::ProgramState;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::new(n).unwrap()
    }

    /// Appends a step and captures its state the way the runtime does.
    fn step(
        trace: &mut ScheduleTrace,
        cache: &mut StateCache,
        choice: Choice,
        n: u64,
        enabled: &[usize],
        status: MonitorStatus,
    ) -> crate::Capture {
        let state = ProgramState::new(
            fp(n),
            enabled.iter().copied().map(ActorId::from),
            [("Progress", status)],
        );
        let step = trace.push(choice);
        let index = step.index();
        step.set_state(state);
        cache.capture(index, fp(n))
    }

    fn schedule(id: usize) -> Choice {
        Choice::Schedule(ActorId::from(id))
    }

    #[test]
    fn reports_hot_monitors_at_termination() {
        let checker = LivenessChecker::new(None);
        assert_eq!(checker.check_at_termination([("Progress", MonitorStatus::Cold)]), None);
        let violation = checker.check_at_termination([("Progress", MonitorStatus::Hot)]).unwrap();
        assert_eq!(violation.monitors(), vec!["Progress"]);
        assert_eq!(violation.to_string(), "monitor Progress is hot at termination");
    }

    #[test]
    fn reports_fair_hot_cycles() {
        let mut checker = LivenessChecker::new(None);
        let mut trace = ScheduleTrace::new();
        let mut cache = StateCache::new();
        let hot = MonitorStatus::Hot;
        step(&mut trace, &mut cache, schedule(0), 1, &[0, 1], hot);
        step(&mut trace, &mut cache, schedule(1), 2, &[0, 1], hot);
        let capture = step(&mut trace, &mut cache, schedule(0), 1, &[0, 1], hot);
        assert_eq!(capture, crate::Capture::Revisited);
        let violation = checker.check_at_trace_cycle(fp(1), &mut trace, &mut cache).unwrap();
        assert_eq!(
            violation,
            LivenessViolation::FairCycle {
                monitors: vec!["Progress"],
                length: 2
            }
        );
        assert_eq!(trace.len(), 1);
        assert_eq!(cache.steps_of(fp(1)), &[0]);
        assert!(cache.steps_of(fp(2)).is_empty());
    }

    #[test]
    fn ignores_cycles_that_starve_a_machine() {
        let mut checker = LivenessChecker::new(None);
        let mut trace = ScheduleTrace::new();
        let mut cache = StateCache::new();
        let hot = MonitorStatus::Hot;
        step(&mut trace, &mut cache, schedule(0), 1, &[0, 1], hot);
        step(&mut trace, &mut cache, schedule(0), 2, &[0, 1], hot);
        step(&mut trace, &mut cache, schedule(0), 1, &[0, 1], hot);
        assert_eq!(checker.check_at_trace_cycle(fp(1), &mut trace, &mut cache), None);
        assert_eq!(trace.len(), 1);
    }

    #[test]
    fn ignores_unbalanced_fair_choices() {
        let mut checker = LivenessChecker::new(None);
        let mut trace = ScheduleTrace::new();
        let mut cache = StateCache::new();
        let hot = MonitorStatus::Hot;
        let fair = |value| Choice::FairBoolean {
            id: "Worker(0):Working".to_owned(),
            value,
        };
        step(&mut trace, &mut cache, schedule(0), 1, &[0], hot);
        step(&mut trace, &mut cache, fair(true), 2, &[0], hot);
        step(&mut trace, &mut cache, schedule(0), 1, &[0], hot);
        assert_eq!(checker.check_at_trace_cycle(fp(1), &mut trace, &mut cache), None);

        step(&mut trace, &mut cache, fair(true), 3, &[0], hot);
        step(&mut trace, &mut cache, fair(false), 4, &[0], hot);
        step(&mut trace, &mut cache, schedule(0), 1, &[0], hot);
        assert!(checker.check_at_trace_cycle(fp(1), &mut trace, &mut cache).is_some());
    }

    #[test]
    fn cold_steps_break_cycles() {
        let mut checker = LivenessChecker::new(None);
        let mut trace = ScheduleTrace::new();
        let mut cache = StateCache::new();
        step(&mut trace, &mut cache, schedule(0), 1, &[0], MonitorStatus::Hot);
        step(&mut trace, &mut cache, schedule(0), 2, &[0], MonitorStatus::Cold);
        step(&mut trace, &mut cache, schedule(0), 1, &[0], MonitorStatus::Hot);
        assert_eq!(checker.check_at_trace_cycle(fp(1), &mut trace, &mut cache), None);
    }

    #[test]
    fn bounds_consecutive_hot_steps() {
        let mut checker = LivenessChecker::new(Some(2));
        assert_eq!(checker.check_temperature([("Progress", MonitorStatus::Hot)]), None);
        assert_eq!(checker.check_temperature([("Progress", MonitorStatus::Hot)]), None);
        assert_eq!(checker.check_temperature([("Progress", MonitorStatus::Cold)]), None);
        assert_eq!(checker.check_temperature([("Progress", MonitorStatus::Hot)]), None);
        assert_eq!(checker.check_temperature([("Progress", MonitorStatus::Hot)]), None);
        assert_eq!(
            checker.check_temperature([("Progress", MonitorStatus::Hot)]),
            Some(LivenessViolation::Temperature {
                monitor: "Progress",
                steps: 3
            })
        );
        checker.reset();
        assert_eq!(checker.check_temperature([("Progress", MonitorStatus::Hot)]), None);
    }
}
