//! Private module for selective re-export.

use crate::machine::ActorId;
use crate::Fingerprint;
use id_set::IdSet;
use nohash_hasher::NoHashHasher;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::BuildHasherDefault;

type FingerprintHasher = BuildHasherDefault<NoHashHasher<u64>>;

/// Liveness bookkeeping of a monitor.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorStatus {
    /// The current state carries no temperature.
    #[default]
    None,
    /// Progress is still owed.
    Hot,
    /// Progress has been made.
    Cold,
}

/// Snapshot of the program taken right after a scheduling decision.
#[derive(Clone, Debug)]
pub struct ProgramState {
    fingerprint: Fingerprint,
    enabled: IdSet,
    monitors: BTreeMap<&'static str, MonitorStatus>,
}

impl ProgramState {
    pub fn new(
        fingerprint: Fingerprint,
        enabled: impl IntoIterator<Item = ActorId>,
        monitors: impl IntoIterator<Item = (&'static str, MonitorStatus)>,
    ) -> Self {
        let mut set = IdSet::new();
        for id in enabled {
            set.insert(id.index());
        }
        ProgramState {
            fingerprint,
            enabled: set,
            monitors: monitors.into_iter().collect(),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn is_enabled(&self, id: ActorId) -> bool {
        self.enabled.contains(id.index())
    }

    /// Machines that could have been scheduled in this state.
    pub fn enabled(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.enabled.iter().map(ActorId::from)
    }

    pub fn monitor_status(&self, monitor: &str) -> MonitorStatus {
        self.monitors.get(monitor).copied().unwrap_or_default()
    }

    pub fn monitors(&self) -> impl Iterator<Item = (&'static str, MonitorStatus)> + '_ {
        self.monitors.iter().map(|(name, status)| (*name, *status))
    }
}

/// The outcome of [`StateCache::capture`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capture {
    /// The state has not been seen before.
    New,
    /// The state already occurred earlier in the current iteration, closing a cycle.
    Revisited,
    /// The state was reached by a previous iteration but not yet by this one.
    SeenInEarlierIteration,
}

/// Remembers captured program states.
///
/// Fingerprints seen by any iteration are kept for state pruning, while the steps at which each
/// fingerprint occurred are kept for the current iteration only, so that the liveness checker can
/// find where a cycle starts.
#[derive(Default)]
pub struct StateCache {
    seen: HashSet<Fingerprint, FingerprintHasher>,
    steps: HashMap<Fingerprint, Vec<usize>, FingerprintHasher>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the step map of the previous iteration while keeping seen fingerprints.
    pub fn start_iteration(&mut self) {
        self.steps.clear();
    }

    /// Records that the state with `fingerprint` was captured at step `index`.
    pub fn capture(&mut self, index: usize, fingerprint: Fingerprint) -> Capture {
        let steps = self.steps.entry(fingerprint).or_default();
        let revisit = !steps.is_empty();
        steps.push(index);
        let earlier = !self.seen.insert(fingerprint);
        if revisit {
            Capture::Revisited
        } else if earlier {
            Capture::SeenInEarlierIteration
        } else {
            Capture::New
        }
    }

    /// Step indices at which the fingerprint occurred in this iteration, earliest first.
    pub fn steps_of(&self, fingerprint: Fingerprint) -> &[usize] {
        self.steps.get(&fingerprint).map(Vec::as_slice).unwrap_or_default()
    }

    /// Removes a step that has been folded into a cycle.
    pub fn forget(&mut self, index: usize, fingerprint: Fingerprint) {
        if let Some(steps) = self.steps.get_mut(&fingerprint) {
            steps.retain(|i| *i != index);
            if steps.is_empty() {
                self.steps.remove(&fingerprint);
            }
        }
    }

    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.seen.contains(&fingerprint)
    }

    /// Number of distinct states seen by every iteration so far.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::new(n).unwrap()
    }

    #[test]
    fn detects_revisits_within_an_iteration() {
        let mut cache = StateCache::new();
        assert_eq!(cache.capture(0, fp(1)), Capture::New);
        assert_eq!(cache.capture(1, fp(2)), Capture::New);
        assert_eq!(cache.capture(2, fp(1)), Capture::Revisited);
        assert_eq!(cache.steps_of(fp(1)), &[0, 2]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn distinguishes_earlier_iterations() {
        let mut cache = StateCache::new();
        cache.capture(0, fp(1));
        cache.start_iteration();
        assert!(cache.steps_of(fp(1)).is_empty());
        assert_eq!(cache.capture(0, fp(1)), Capture::SeenInEarlierIteration);
        assert_eq!(cache.capture(1, fp(1)), Capture::Revisited);
    }

    #[test]
    fn forgets_folded_steps() {
        let mut cache = StateCache::new();
        cache.capture(0, fp(1));
        cache.capture(1, fp(1));
        cache.forget(1, fp(1));
        assert_eq!(cache.steps_of(fp(1)), &[0]);
        cache.forget(0, fp(1));
        assert!(cache.steps_of(fp(1)).is_empty());
        assert!(cache.contains(fp(1)));
    }

    #[test]
    fn snapshots_answer_enabled_and_monitor_queries() {
        let state = ProgramState::new(
            fp(9),
            [ActorId::from(0), ActorId::from(3)],
            [("Progress", MonitorStatus::Hot)],
        );
        assert!(state.is_enabled(ActorId::from(3)));
        assert!(!state.is_enabled(ActorId::from(1)));
        assert_eq!(state.enabled().count(), 2);
        assert_eq!(state.monitor_status("Progress"), MonitorStatus::Hot);
        assert_eq!(state.monitor_status("Other"), MonitorStatus::None);
    }
}
