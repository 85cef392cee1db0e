use crate::runtime::{schedulable, TaskInfo};
use crate::strategy::Strategy;
use crate::ActorId;
use rand::rngs::SmallRng;
use rand::seq::index;
use rand::Rng;
use rand::SeedableRng;
use std::collections::BTreeSet;

/// Probabilistic concurrency testing.
///
/// Every machine receives a random priority when it first shows up and the highest priority
/// schedulable machine always runs. At a few randomly chosen scheduling steps, sampled over the
/// length of the longest schedule seen so far, the running machine drops to the lowest priority.
/// This biases iterations towards interleavings that need a small number of preemptions.
///
/// The fair variant follows priorities only for a prefix of each iteration and then picks
/// uniformly, so that long executions eventually schedule every enabled machine.
pub struct PctStrategy {
    seed: u64,
    rng: SmallRng,
    switch_points: usize,
    fair_after: Option<usize>,
    max_steps: Option<usize>,
    priorities: Vec<ActorId>,
    change_points: BTreeSet<usize>,
    steps: usize,
    longest: usize,
}

impl PctStrategy {
    pub fn new(seed: u64, switch_points: usize) -> Self {
        PctStrategy {
            seed,
            rng: SmallRng::seed_from_u64(seed),
            switch_points,
            fair_after: None,
            max_steps: None,
            priorities: Vec::new(),
            change_points: BTreeSet::new(),
            steps: 0,
            longest: 0,
        }
    }

    /// Prioritized scheduling for the first `prefix` scheduling steps, uniform afterwards.
    pub fn fair(seed: u64, switch_points: usize, prefix: usize) -> Self {
        PctStrategy {
            fair_after: Some(prefix),
            ..Self::new(seed, switch_points)
        }
    }

    /// Bounds the number of decisions per iteration.
    pub fn with_max_steps(mut self, max_steps: Option<usize>) -> Self {
        self.max_steps = max_steps;
        self
    }

    fn sample_change_points(&mut self) {
        self.change_points.clear();
        if self.longest == 0 {
            return;
        }
        let amount = self.switch_points.min(self.longest);
        self.change_points = index::sample(&mut self.rng, self.longest, amount)
            .into_iter()
            .collect();
    }
}

impl Strategy for PctStrategy {
    fn next_actor(&mut self, tasks: &[TaskInfo], _current: Option<ActorId>) -> Option<ActorId> {
        let enabled = schedulable(tasks);
        if enabled.is_empty() {
            return None;
        }
        for task in tasks {
            if !self.priorities.contains(&task.id) {
                let position = self.rng.gen_range(0..=self.priorities.len());
                self.priorities.insert(position, task.id);
            }
        }
        let step = self.steps;
        self.steps += 1;
        if self.fair_after.map_or(false, |prefix| step >= prefix) {
            return Some(enabled[self.rng.gen_range(0..enabled.len())]);
        }
        if self.change_points.contains(&step) {
            if enabled.len() == 1 {
                // A switch is meaningless with a single candidate.
                self.change_points.insert(step + 1);
            } else if let Some(top) = self.priorities.iter().copied().find(|id| enabled.contains(id)) {
                log::trace!("pct lowers the priority of {} at step {}", top, step);
                self.priorities.retain(|id| *id != top);
                self.priorities.push(top);
            }
        }
        self.priorities.iter().copied().find(|id| enabled.contains(id))
    }

    fn next_boolean(&mut self, _is_fair: bool) -> Option<bool> {
        Some(self.rng.gen_bool(0.5))
    }

    fn next_integer(&mut self, bound: usize) -> Option<usize> {
        Some(self.rng.gen_range(0..bound))
    }

    fn depth_bound(&self) -> Option<usize> {
        self.max_steps
    }

    fn has_finished(&self) -> bool {
        false
    }

    fn advance(&mut self) {
        self.longest = self.longest.max(self.steps);
        self.steps = 0;
        self.priorities.clear();
        self.sample_change_points();
    }

    fn reset(&mut self) {
        self.rng = SmallRng::seed_from_u64(self.seed);
        self.longest = 0;
        self.steps = 0;
        self.priorities.clear();
        self.change_points.clear();
    }

    fn description(&self) -> String {
        match self.fair_after {
            Some(prefix) => format!(
                "fair pct (seed {}, {} switch points, prefix {})",
                self.seed, self.switch_points, prefix
            ),
            None => format!("pct (seed {}, {} switch points)", self.seed, self.switch_points),
        }
    }

    fn is_fair(&self) -> bool {
        self.fair_after.is_some()
    }
}
