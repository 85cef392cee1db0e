//! Private module for selective re-export.

use crate::runtime::Limits;
use crate::strategy::{DfsStrategy, PctStrategy, RandomStrategy, Strategy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which scheduling strategy the engine builds for each worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyKind {
    /// Exhaustive depth-first enumeration. Always runs on a single worker.
    Dfs,
    /// Uniformly random decisions.
    Random { seed: u64 },
    /// Priority-based scheduling with random priority change points.
    Pct { seed: u64, switch_points: usize },
    /// Priority-based scheduling for `prefix` steps, uniformly random afterwards.
    FairPct {
        seed: u64,
        switch_points: usize,
        prefix: usize,
    },
}

impl StrategyKind {
    /// Builds the strategy of a worker. Workers offset the seed so that they explore different
    /// iterations.
    pub(crate) fn build(&self, worker: usize, max_steps: Option<usize>) -> Box<dyn Strategy> {
        let offset = worker as u64;
        match self {
            StrategyKind::Dfs => Box::new(DfsStrategy::new(max_steps)),
            StrategyKind::Random { seed } => {
                Box::new(RandomStrategy::new(seed.wrapping_add(offset)).with_max_steps(max_steps))
            }
            StrategyKind::Pct {
                seed,
                switch_points,
            } => Box::new(
                PctStrategy::new(seed.wrapping_add(offset), *switch_points).with_max_steps(max_steps),
            ),
            StrategyKind::FairPct {
                seed,
                switch_points,
                prefix,
            } => Box::new(
                PctStrategy::fair(seed.wrapping_add(offset), *switch_points, *prefix)
                    .with_max_steps(max_steps),
            ),
        }
    }

    /// Whether the strategy enumerates a finite space and cannot be split across workers.
    pub fn is_exhaustive(&self) -> bool {
        matches!(self, StrategyKind::Dfs)
    }
}

/// Settings of a [`TestingEngine`](crate::TestingEngine) run.
///
/// ```rust
/// use machinist::{Config, StrategyKind};
/// use std::time::Duration;
///
/// let config = Config::default()
///     .strategy(StrategyKind::Pct { seed: 7, switch_points: 3 })
///     .iterations(1_000)
///     .check_liveness(true)
///     .threads(4)
///     .timeout(Duration::from_secs(30));
/// assert!(config.cache_states);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of iterations.
    pub iterations: usize,
    pub strategy: StrategyKind,
    /// Maximum number of decisions per iteration.
    pub max_steps: Option<usize>,
    /// Maximum depth of a machine's state stack.
    pub depth_bound: Option<usize>,
    /// Folds cycles of program states and checks them for fair hot monitors.
    pub check_liveness: bool,
    /// Fingerprints the program state after every decision.
    pub cache_states: bool,
    /// Ends a depth-first iteration that reaches a state explored by an earlier one.
    pub prune_explored_states: bool,
    /// Maximum number of consecutive steps a monitor may stay hot.
    pub liveness_temperature_threshold: Option<usize>,
    /// Stops at the first bug.
    pub fail_fast: bool,
    pub threads: usize,
    pub timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            iterations: 1,
            strategy: StrategyKind::Random { seed: 0 },
            max_steps: Some(10_000),
            depth_bound: None,
            check_liveness: false,
            cache_states: false,
            prune_explored_states: false,
            liveness_temperature_threshold: None,
            fail_fast: false,
            threads: 1,
            timeout: None,
        }
    }
}

impl Config {
    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Lets iterations run until they quiesce.
    pub fn unbounded_steps(mut self) -> Self {
        self.max_steps = None;
        self
    }

    pub fn depth_bound(mut self, depth_bound: usize) -> Self {
        self.depth_bound = Some(depth_bound);
        self
    }

    /// Enabling liveness checking also enables state caching, which cycle detection needs.
    pub fn check_liveness(mut self, check_liveness: bool) -> Self {
        self.check_liveness = check_liveness;
        self.cache_states |= check_liveness;
        self
    }

    pub fn cache_states(mut self, cache_states: bool) -> Self {
        self.cache_states = cache_states;
        self
    }

    /// Pruning only applies to depth-first exploration and implies state caching.
    pub fn prune_explored_states(mut self, prune: bool) -> Self {
        self.prune_explored_states = prune;
        self.cache_states |= prune;
        self
    }

    pub fn liveness_temperature_threshold(mut self, threshold: usize) -> Self {
        self.liveness_temperature_threshold = Some(threshold);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of workers that run iterations in parallel.
    pub(crate) fn worker_count(&self) -> usize {
        if self.strategy.is_exhaustive() {
            1
        } else {
            self.threads.clamp(1, self.iterations.max(1))
        }
    }

    pub(crate) fn limits(&self, strategy: &dyn Strategy) -> Limits {
        Limits {
            max_steps: strategy.depth_bound(),
            depth_bound: self.depth_bound,
            capture_states: self.cache_states || self.check_liveness,
            check_liveness: self.check_liveness,
            prune: self.prune_explored_states && self.strategy.is_exhaustive(),
        }
    }
}
