//! Runs a program over many iterations and gathers what the iterations found.

use crate::cache::StateCache;
use crate::config::Config;
use crate::event::{AnyEvent, Event};
use crate::liveness::LivenessChecker;
use crate::machine::{ActorId, Machine, Monitor};
use crate::report::{Bug, BugKind, ReportData, Reporter, TestReport};
use crate::runtime::{Inner, Shared};
use crate::strategy::{ReplayStrategy, Strategy};
use crate::trace::{ReplayError, ScheduleTrace};
use crate::{fingerprint, Fingerprint};
use dashmap::DashSet;
use nohash_hasher::NoHashHasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::hash::BuildHasherDefault;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

type FingerprintSet = DashSet<Fingerprint, BuildHasherDefault<NoHashHasher<u64>>>;

/// The system under test. Every iteration calls [`Program::setup`] on a fresh runtime to create
/// the initial machines and register monitors.
pub trait Program: Sync {
    fn setup(&self, setup: &mut Setup);
}

impl<F> Program for F
where
    F: Fn(&mut Setup) + Sync,
{
    fn setup(&self, setup: &mut Setup) {
        self(setup)
    }
}

/// Handle used by a [`Program`] to populate an iteration before the first scheduling decision.
pub struct Setup {
    shared: Arc<Shared>,
}

impl Setup {
    pub fn create<M: Machine>(&mut self, machine: M) -> ActorId {
        self.shared.create_root(machine, None)
    }

    /// Creates a machine whose start state's entry action receives `event`.
    pub fn create_with<M: Machine, E: Event>(&mut self, machine: M, event: E) -> ActorId {
        self.shared.create_root(machine, Some(AnyEvent::new(event)))
    }

    /// # Panics
    ///
    /// Panics if a monitor of the same type is already registered.
    pub fn register_monitor<Mon: Monitor>(&mut self, monitor: Mon) {
        self.shared.register_monitor(monitor)
    }
}

/// How an iteration ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// No machine could run and none was blocked.
    Quiescent,
    Bug { kind: BugKind, message: String },
    Truncated(Truncation),
    /// The strategy had no decision left to offer.
    Explored,
    /// Reached a state explored by an earlier iteration.
    Pruned,
    /// The strategy could not follow the program, e.g. a replayed trace diverged.
    StrategyFailed(String),
}

impl Outcome {
    pub(crate) fn bug(kind: BugKind, message: impl Into<String>) -> Self {
        Outcome::Bug {
            kind,
            message: message.into(),
        }
    }

    pub fn is_bug(&self) -> bool {
        matches!(self, Outcome::Bug { .. })
    }
}

/// The bound that stopped an iteration.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Truncation {
    MaxSteps,
    DepthBound,
    Timeout,
}

/// Everything one iteration produced.
#[derive(Clone, Debug)]
pub struct IterationReport {
    pub outcome: Outcome,
    /// Every decision of the iteration, in order.
    pub schedule: ScheduleTrace,
    /// Program states after each decision, when states are cached.
    pub fingerprints: Vec<Fingerprint>,
    pub steps: usize,
    pub dropped_events: usize,
}

/// The strategy and the state that a worker carries from one iteration to the next.
struct Worker {
    index: usize,
    strategy: Option<Box<dyn Strategy>>,
    cache: StateCache,
    liveness: LivenessChecker,
}

impl Worker {
    fn new(config: &Config, index: usize) -> Self {
        Worker {
            index,
            strategy: Some(config.strategy.build(index, config.max_steps)),
            cache: StateCache::new(),
            liveness: LivenessChecker::new(config.liveness_temperature_threshold),
        }
    }

    fn has_finished(&self) -> bool {
        self.strategy.as_ref().map_or(false, |s| s.has_finished())
    }
}

/// Results shared by the workers of a run.
#[derive(Default)]
struct Progress {
    claimed: AtomicUsize,
    completed: AtomicUsize,
    active: AtomicUsize,
    schedules: FingerprintSet,
    states: FingerprintSet,
    bugs: Mutex<Vec<Bug>>,
    truncated: AtomicUsize,
    pruned: AtomicUsize,
    max_steps: AtomicUsize,
    total_steps: AtomicUsize,
    dropped_events: AtomicUsize,
    stop: AtomicBool,
    timed_out: AtomicBool,
}

impl Progress {
    fn record(&self, iteration: usize, report: IterationReport, fail_fast: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let choices: Vec<_> = report.schedule.choices().collect();
        self.schedules.insert(fingerprint(&choices));
        for fp in &report.fingerprints {
            self.states.insert(*fp);
        }
        self.max_steps.fetch_max(report.steps, Ordering::Relaxed);
        self.total_steps.fetch_add(report.steps, Ordering::Relaxed);
        self.dropped_events
            .fetch_add(report.dropped_events, Ordering::Relaxed);
        match report.outcome {
            Outcome::Bug { kind, message } => {
                log::info!("Iteration {} found a bug. {}: {}", iteration, kind, message);
                self.bugs.lock().push(Bug {
                    kind,
                    message,
                    iteration,
                    trace: report.schedule,
                });
                if fail_fast {
                    self.stop.store(true, Ordering::Relaxed);
                }
            }
            Outcome::Truncated(truncation) => {
                if truncation == Truncation::Timeout {
                    self.timed_out.store(true, Ordering::Relaxed);
                }
                self.truncated.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Pruned => {
                self.pruned.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::StrategyFailed(message) => {
                log::warn!("Iteration {} was abandoned: {}", iteration, message);
            }
            Outcome::Quiescent | Outcome::Explored => {}
        }
    }

    fn data(&self, duration: Duration, done: bool) -> ReportData {
        ReportData {
            iterations: self.completed.load(Ordering::Relaxed),
            bugs: self.bugs.lock().len(),
            distinct_schedules: self.schedules.len(),
            distinct_states: self.states.len(),
            duration,
            done,
        }
    }
}

/// Runs a [`Program`] repeatedly under the strategy named by a [`Config`].
///
/// Each worker thread owns a strategy, a state cache and a liveness checker that live across its
/// iterations. Workers share the iteration counter and the sets of distinct schedules and
/// states, and stop early on a timeout or, with `fail_fast`, on the first bug.
pub struct TestingEngine<P> {
    program: P,
    config: Config,
}

impl<P: Program> TestingEngine<P> {
    pub fn new(program: P, config: Config) -> Self {
        TestingEngine { program, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Blocks until testing is complete.
    pub fn run(&self) -> TestReport {
        self.run_with(None)
    }

    /// Blocks until testing is complete, periodically emitting progress to `reporter` and
    /// finally the bugs that were found.
    pub fn run_and_report(&self, reporter: &mut dyn Reporter) -> TestReport {
        self.run_with(Some(reporter))
    }

    /// Runs a single iteration with a fresh strategy.
    pub fn run_iteration(&self) -> IterationReport {
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        self.iterate(&mut Worker::new(&self.config, 0), deadline)
    }

    /// Reruns the iteration recorded in `trace`, failing if the program makes different
    /// decisions or stops before the trace is used up.
    pub fn replay(&self, trace: &ScheduleTrace) -> Result<IterationReport, ReplayError> {
        self.replay_on(&mut self.replayer(trace), trace)
    }

    /// Replays `trace` twice with the same strategy, reset in between, and checks that both runs
    /// reach the same outcome through the same program states. States are compared only when
    /// they are cached.
    pub fn verify_determinism(&self, trace: &ScheduleTrace) -> Result<IterationReport, ReplayError> {
        let mut worker = self.replayer(trace);
        let first = self.replay_on(&mut worker, trace)?;
        if let Some(strategy) = worker.strategy.as_mut() {
            strategy.reset();
        }
        let second = self.replay_on(&mut worker, trace)?;
        let agreed = first
            .fingerprints
            .iter()
            .zip(&second.fingerprints)
            .take_while(|(a, b)| a == b)
            .count();
        let same_length = first.fingerprints.len() == second.fingerprints.len();
        if agreed < first.fingerprints.len() || !same_length || first.outcome != second.outcome {
            return Err(ReplayError::Nondeterministic { step: agreed });
        }
        Ok(second)
    }

    fn replayer(&self, trace: &ScheduleTrace) -> Worker {
        let mut worker = Worker::new(&self.config, 0);
        worker.strategy = Some(Box::new(ReplayStrategy::new(trace)));
        worker
    }

    fn replay_on(&self, worker: &mut Worker, trace: &ScheduleTrace) -> Result<IterationReport, ReplayError> {
        let report = self.iterate(worker, None);
        match &report.outcome {
            Outcome::StrategyFailed(message) => Err(ReplayError::Diverged(message.clone())),
            _ if report.schedule.len() < trace.len() => Err(ReplayError::Incomplete {
                consumed: report.schedule.len(),
                total: trace.len(),
            }),
            _ => Ok(report),
        }
    }

    fn run_with(&self, mut reporter: Option<&mut dyn Reporter>) -> TestReport {
        let start = Instant::now();
        let deadline = self.config.timeout.map(|t| start + t);
        let workers = self.config.worker_count();
        let sample = self.config.strategy.build(0, self.config.max_steps);
        if self.config.check_liveness && !sample.is_fair() {
            log::warn!(
                "Checking liveness under {}, which is not fair. Fair cycles it never follows go unreported.",
                sample.description()
            );
        }
        let progress = Progress::default();
        progress.active.store(workers, Ordering::Relaxed);
        log::debug!(
            "Testing with {} workers. strategy={:?}, iterations={}",
            workers,
            self.config.strategy,
            self.config.iterations
        );

        let result = crossbeam_utils::thread::scope(|scope| {
            for index in 0..workers {
                let progress = &progress;
                scope
                    .builder()
                    .name(format!("worker-{}", index))
                    .spawn(move |_| self.work(index, progress, deadline))
                    .expect("Failed to spawn a thread");
            }
            if let Some(reporter) = reporter.as_mut() {
                let mut last_report = Instant::now();
                while progress.active.load(Ordering::Relaxed) > 0 {
                    std::thread::sleep(POLL_INTERVAL);
                    if last_report.elapsed() >= REPORT_INTERVAL {
                        reporter.report_testing(progress.data(start.elapsed(), false));
                        last_report = Instant::now();
                    }
                }
            }
        });
        if let Err(payload) = result {
            resume_unwind(payload);
        }

        let elapsed = start.elapsed();
        if let Some(reporter) = reporter.as_mut() {
            reporter.report_testing(progress.data(elapsed, true));
        }
        let mut bugs = std::mem::take(&mut *progress.bugs.lock());
        bugs.sort_by_key(|bug| bug.iteration);
        if let Some(reporter) = reporter.as_mut() {
            reporter.report_bugs(&bugs);
        }
        TestReport {
            strategy: sample.description(),
            fair: sample.is_fair(),
            iterations: progress.completed.load(Ordering::Relaxed),
            distinct_schedules: progress.schedules.len(),
            distinct_states: progress.states.len(),
            bugs,
            truncated: progress.truncated.load(Ordering::Relaxed),
            pruned: progress.pruned.load(Ordering::Relaxed),
            max_steps: progress.max_steps.load(Ordering::Relaxed),
            total_steps: progress.total_steps.load(Ordering::Relaxed),
            dropped_events: progress.dropped_events.load(Ordering::Relaxed),
            elapsed,
            timed_out: progress.timed_out.load(Ordering::Relaxed),
        }
    }

    fn work(&self, index: usize, progress: &Progress, deadline: Option<Instant>) {
        log::debug!("{}: Worker started.", index);
        let mut worker = Worker::new(&self.config, index);
        loop {
            if progress.stop.load(Ordering::Relaxed) {
                break;
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                progress.timed_out.store(true, Ordering::Relaxed);
                break;
            }
            let iteration = progress.claimed.fetch_add(1, Ordering::Relaxed);
            if iteration >= self.config.iterations {
                break;
            }
            let report = self.iterate(&mut worker, deadline);
            progress.record(iteration, report, self.config.fail_fast);
            if worker.has_finished() {
                log::debug!("{}: Strategy is exhausted after iteration {}.", index, iteration);
                progress.stop.store(true, Ordering::Relaxed);
                break;
            }
        }
        log::debug!("{}: Worker done.", index);
        progress.active.fetch_sub(1, Ordering::Relaxed);
    }

    fn iterate(&self, worker: &mut Worker, deadline: Option<Instant>) -> IterationReport {
        let strategy = worker
            .strategy
            .take()
            .unwrap_or_else(|| self.config.strategy.build(worker.index, self.config.max_steps));
        let limits = self.config.limits(&*strategy);
        let inner = Inner::new(
            limits,
            strategy,
            std::mem::take(&mut worker.cache),
            std::mem::take(&mut worker.liveness),
        );
        let shared = Shared::new(inner);
        let mut setup = Setup {
            shared: Arc::clone(&shared),
        };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.program.setup(&mut setup))) {
            shared.abort(Outcome::Explored);
            shared.join_threads();
            resume_unwind(payload);
        }
        shared.drive(deadline);
        shared.join_threads();

        let finished = shared.finish();
        let mut strategy = finished.strategy;
        if let Some(strategy) = strategy.as_mut() {
            strategy.advance();
        }
        worker.strategy = strategy;
        worker.cache = finished.cache;
        worker.liveness = finished.liveness;
        worker.liveness.reset();
        log::trace!(
            "{}: Iteration ended after {} steps. {:?}",
            worker.index,
            finished.steps,
            finished.outcome
        );
        IterationReport {
            outcome: finished.outcome,
            schedule: finished.schedule,
            fingerprints: finished.fingerprints,
            steps: finished.steps,
            dropped_events: finished.dropped_events,
        }
    }
}

/// Tests `program` under `config`.
pub fn run<P: Program>(program: P, config: Config) -> TestReport {
    TestingEngine::new(program, config).run()
}
