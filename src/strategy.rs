//! Scheduling strategies decide which machine runs at every decision point and how every
//! nondeterministic choice resolves.
//!
//! A strategy lives for a whole engine run. The engine calls [`Strategy::advance`] between
//! iterations and stops once [`Strategy::has_finished`] holds or the iteration budget is spent.
//! Strategies must be deterministic given their seed and the decisions of earlier iterations,
//! since recorded schedules are replayed by forcing the same decisions.

use crate::runtime::TaskInfo;
use crate::ActorId;

mod dfs;
mod pct;
mod random;
mod replay;

pub use dfs::DfsStrategy;
pub use pct::PctStrategy;
pub use random::RandomStrategy;
pub use replay::ReplayStrategy;

/// A pluggable scheduling policy.
pub trait Strategy: Send {
    /// Picks the next machine among the schedulable `tasks`. `current` is the machine that is
    /// yielding, if any. Returns `None` when no machine is schedulable or when the strategy
    /// cannot continue, in which case [`Strategy::error`] says why.
    fn next_actor(&mut self, tasks: &[TaskInfo], current: Option<ActorId>) -> Option<ActorId>;

    /// Resolves a boolean choice. `is_fair` marks choices that fair executions resolve both ways.
    fn next_boolean(&mut self, is_fair: bool) -> Option<bool>;

    /// Resolves an integer choice in `0..bound`.
    fn next_integer(&mut self, bound: usize) -> Option<usize>;

    /// Maximum number of decisions per iteration.
    fn depth_bound(&self) -> Option<usize>;

    /// Whether every iteration the strategy can produce has been produced.
    fn has_finished(&self) -> bool;

    /// Prepares the next iteration.
    fn advance(&mut self);

    /// Returns to the state the strategy had before the first iteration.
    fn reset(&mut self);

    fn description(&self) -> String;

    /// Whether the strategy eventually schedules every enabled machine.
    fn is_fair(&self) -> bool {
        false
    }

    /// Why the strategy refused to make a decision.
    fn error(&self) -> Option<String> {
        None
    }

    /// Whether the current iteration is still reproducing decisions made by an earlier one.
    fn in_prefix(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runtime::TaskInfo;

    /// Tasks where the listed machines are schedulable and the rest are blocked.
    pub(crate) fn tasks(count: usize, schedulable: &[usize]) -> Vec<TaskInfo> {
        (0..count)
            .map(|i| {
                let mut task = TaskInfo::new(ActorId::from(i));
                task.blocked = !schedulable.contains(&i);
                task
            })
            .collect()
    }

    #[test]
    fn strategies_only_choose_schedulable_machines() {
        let mut strategies: Vec<Box<dyn Strategy>> = vec![
            Box::new(DfsStrategy::new(None)),
            Box::new(RandomStrategy::new(3)),
            Box::new(PctStrategy::new(3, 2)),
            Box::new(PctStrategy::fair(3, 2, 5)),
        ];
        let tasks = tasks(4, &[1, 3]);
        for strategy in &mut strategies {
            for _ in 0..3 {
                for _ in 0..10 {
                    let chosen = strategy.next_actor(&tasks, None).unwrap();
                    assert!(chosen == ActorId::from(1) || chosen == ActorId::from(3));
                }
                strategy.advance();
            }
            assert_eq!(strategy.next_actor(&self::tasks(2, &[]), None), None);
            assert_eq!(strategy.error(), None, "{}", strategy.description());
        }
    }
}
