use crate::runtime::{schedulable, TaskInfo};
use crate::strategy::Strategy;
use crate::ActorId;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;

/// Uniformly random decisions from a seeded generator. Iterations continue the same random
/// sequence, so a run is reproducible from its seed.
pub struct RandomStrategy {
    seed: u64,
    rng: SmallRng,
    max_steps: Option<usize>,
}

impl RandomStrategy {
    pub fn new(seed: u64) -> Self {
        RandomStrategy {
            seed,
            rng: SmallRng::seed_from_u64(seed),
            max_steps: None,
        }
    }

    /// Bounds the number of decisions per iteration.
    pub fn with_max_steps(mut self, max_steps: Option<usize>) -> Self {
        self.max_steps = max_steps;
        self
    }
}

impl Strategy for RandomStrategy {
    fn next_actor(&mut self, tasks: &[TaskInfo], _current: Option<ActorId>) -> Option<ActorId> {
        let enabled = schedulable(tasks);
        if enabled.is_empty() {
            return None;
        }
        Some(enabled[self.rng.gen_range(0..enabled.len())])
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

    fn advance(&mut self) {}

    fn reset(&mut self) {
        self.rng = SmallRng::seed_from_u64(self.seed);
    }

    fn description(&self) -> String {
        format!("random (seed {})", self.seed)
    }

    fn is_fair(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::strategy::test::tasks;

    fn sample(strategy: &mut RandomStrategy) -> Vec<usize> {
        (0..20)
            .map(|_| strategy.next_actor(&tasks(5, &[0, 1, 2, 3, 4]), None).unwrap().index())
            .collect()
    }

    #[test]
    fn is_reproducible_from_its_seed() {
        let mut strategy = RandomStrategy::new(42);
        let first = sample(&mut strategy);
        strategy.reset();
        assert_eq!(sample(&mut strategy), first);
        assert_ne!(sample(&mut RandomStrategy::new(43)), first);
    }

    #[test]
    fn eventually_picks_every_machine() {
        let mut strategy = RandomStrategy::new(1);
        let mut picked = [false; 5];
        for _ in 0..10 {
            for i in sample(&mut strategy) {
                picked[i] = true;
            }
        }
        assert_eq!(picked, [true; 5]);
        assert!(strategy.is_fair());
    }
}
