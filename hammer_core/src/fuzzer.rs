use crate::app::{App, LaunchConfig};
use crate::config::{ConfigError, HammerConfig, SessionSettings};
use crate::generator::{
    GeneratorError, GeneratorKind, InputGenerator, MultiOrderInputGenerator, RandomInputGenerator,
};
use crate::input::Input;
use crate::message::{Injectable, MessageLog, PayloadError, PayloadFormat};
use crate::mutation::{LogMutation, Mutation};
use crate::mutator::build_mutator;
use crate::oracle::{ExitOracle, Oracle, OutcomeKind, Verdict, build_oracle};
use crate::sandbox::{
    AppInstance, InstanceGuard, Observation, ProcessRuntime, SandboxError, SandboxRuntime,
};
use crate::seeds::{SeedError, load_seed_pool};
use crate::store::{
    InMemoryRecordStore, InterestingInputRecord, OnDiskRecordStore, RecordStore, StoreError,
};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Completed iterations between progress log lines.
const PROGRESS_INTERVAL: u64 = 100;

#[derive(Error, Debug)]
pub enum FuzzerError {
    #[error("Invalid session configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to load seeds: {0}")]
    Seeds(#[from] SeedError),
    #[error("Failed to build input generator: {0}")]
    Generator(#[from] GeneratorError),
    #[error("Failed to open record store: {0}")]
    Store(#[from] StoreError),
}

/// Failure inside one iteration that makes its outcome an infra error.
#[derive(Error, Debug)]
enum CycleError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("Payload encoding failed: {0}")]
    Payload(#[from] PayloadError),
}

/// Iteration and wall-clock stopping conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Budget {
    pub max_iterations: Option<u64>,
    pub max_duration: Option<Duration>,
}

impl Budget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn iterations(max_iterations: u64) -> Self {
        Self {
            max_iterations: Some(max_iterations),
            max_duration: None,
        }
    }

    fn time_exhausted(&self, elapsed: Duration) -> bool {
        self.max_duration.is_some_and(|max| elapsed >= max)
    }
}

/// Resources consumed by a session so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub elapsed: Duration,
    /// Iterations that ran through teardown.
    pub iterations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The generator could not produce a first input.
    GeneratorExhausted(GeneratorError),
    InfraErrors { consecutive: u32, last: String },
    StoreFailure(String),
    Interrupted,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::GeneratorExhausted(e) => write!(f, "{e}"),
            AbortReason::InfraErrors { consecutive, last } => {
                write!(f, "{consecutive} consecutive infra errors, last: {last}")
            }
            AbortReason::StoreFailure(e) => write!(f, "record store failure: {e}"),
            AbortReason::Interrupted => write!(f, "stopped by request"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    Completed,
    BudgetExhausted,
    Aborted(AbortReason),
}

impl fmt::Display for SessionExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionExit::Completed => write!(f, "completed"),
            SessionExit::BudgetExhausted => write!(f, "budget exhausted"),
            SessionExit::Aborted(reason) => write!(f, "aborted ({reason})"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    counts: BTreeMap<OutcomeKind, u64>,
}

impl OutcomeCounts {
    pub fn get(&self, kind: OutcomeKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn interesting(&self) -> u64 {
        self.get(OutcomeKind::Crash) + self.get(OutcomeKind::Timeout)
    }
}

impl fmt::Display for OutcomeCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = OutcomeKind::ALL
            .iter()
            .map(|kind| format!("{kind}: {}", self.get(*kind)))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Summary handed back when a session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub exit: SessionExit,
    pub counts: OutcomeCounts,
    pub usage: ResourceUsage,
    pub records_written: usize,
    pub records_location: String,
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Session {}", self.exit)?;
        writeln!(
            f,
            "  iterations: {} in {:.2?}",
            self.usage.iterations, self.usage.elapsed
        )?;
        writeln!(f, "  outcomes:   {}", self.counts)?;
        write!(
            f,
            "  records:    {} in {}",
            self.records_written, self.records_location
        )
    }
}

/// Cloneable flag that asks a running session to stop before its next iteration.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzOptions {
    pub workers: usize,
    pub timeout: Duration,
    pub startup_timeout: Duration,
    pub launch: LaunchConfig,
    pub payload_format: PayloadFormat,
    pub budget: Budget,
    /// The session aborts once more than this many infra errors happen in a row.
    pub max_consecutive_infra_errors: u32,
}

impl Default for FuzzOptions {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::new("", Vec::new()))
    }
}

impl FuzzOptions {
    pub fn from_settings(session: &SessionSettings) -> Self {
        Self {
            workers: session.workers.max(1),
            timeout: session.timeout(),
            startup_timeout: session.startup_timeout(),
            launch: session.launch_config(),
            payload_format: session.payload_format,
            budget: Budget {
                max_iterations: session.budget.max_iterations,
                max_duration: session.budget.max_duration_secs.map(Duration::from_secs),
            },
            max_consecutive_infra_errors: session.max_consecutive_infra_errors,
        }
    }
}

fn lock<X: ?Sized>(mutex: &Mutex<X>) -> MutexGuard<'_, X> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters shared by all workers of one session.
#[derive(Default)]
struct SessionState {
    claimed: AtomicU64,
    completed: AtomicU64,
    counts: [AtomicU64; 4],
    consecutive_infra: AtomicU32,
    exit: Mutex<Option<SessionExit>>,
}

impl SessionState {
    /// Records why the session ends. The first caller wins.
    fn finish(&self, exit: SessionExit) {
        let mut slot = lock(&self.exit);
        if slot.is_none() {
            *slot = Some(exit);
        }
    }

    fn is_finished(&self) -> bool {
        lock(&self.exit).is_some()
    }

    fn count(&self, kind: OutcomeKind) {
        let index = OutcomeKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_default();
        self.counts[index].fetch_add(1, Ordering::SeqCst);
    }

    fn outcome_counts(&self) -> OutcomeCounts {
        OutcomeCounts {
            counts: OutcomeKind::ALL
                .iter()
                .zip(&self.counts)
                .map(|(kind, count)| (*kind, count.load(Ordering::SeqCst)))
                .collect(),
        }
    }

    /// Claims the next iteration number, or `None` once the budget is spent.
    fn claim(&self, max_iterations: Option<u64>) -> Option<u64> {
        match max_iterations {
            Some(max) => self
                .claimed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
                .ok()
                .map(|previous| previous + 1),
            None => Some(self.claimed.fetch_add(1, Ordering::SeqCst) + 1),
        }
    }
}

/// Drives a fuzzing session against one app.
///
/// Each iteration runs `GENERATING -> INSTANTIATING -> INJECTING -> OBSERVING
/// -> CLASSIFYING -> TEARDOWN` on its own instance. With several workers the
/// generator and the record store are the only shared mutable state.
pub struct Fuzzer<T, M> {
    app_name: String,
    app: App,
    runtime: Arc<dyn SandboxRuntime>,
    generator: Mutex<Box<dyn InputGenerator<T, M>>>,
    oracle: Box<dyn Oracle>,
    store: Mutex<Box<dyn RecordStore>>,
    options: FuzzOptions,
    stop: StopHandle,
}

impl<T, M> Fuzzer<T, M>
where
    T: Clone + Injectable + Send + Sync,
    M: Mutation<T> + Serialize,
{
    /// A fuzzer with the exit oracle and an in-memory record store.
    pub fn new(
        app_name: impl Into<String>,
        app: App,
        runtime: Arc<dyn SandboxRuntime>,
        generator: Box<dyn InputGenerator<T, M>>,
        options: FuzzOptions,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app,
            runtime,
            generator: Mutex::new(generator),
            oracle: Box::new(ExitOracle),
            store: Mutex::new(Box::new(InMemoryRecordStore::new())),
            options,
            stop: StopHandle::new(),
        }
    }

    pub fn with_oracle(mut self, oracle: Box<dyn Oracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_store(mut self, store: Box<dyn RecordStore>) -> Self {
        self.store = Mutex::new(store);
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stored records so far, e.g. for inspecting an in-memory store after a run.
    pub fn records(&self) -> Result<Vec<InterestingInputRecord>, StoreError> {
        lock(&self.store).records()
    }

    /// Runs the session to completion and returns its summary.
    ///
    /// Every instance created during the session is stopped before this returns.
    pub fn run(&self) -> SessionReport {
        let started = Instant::now();
        let state = SessionState::default();
        info!(
            "Fuzzing '{}' with {} worker(s) using the {} generator on the {} runtime",
            self.app_name,
            self.options.workers,
            lock(&self.generator).name(),
            self.runtime.name()
        );

        thread::scope(|scope| {
            for worker in 0..self.options.workers {
                let state = &state;
                scope.spawn(move || self.worker_loop(worker, state, started));
            }
        });

        let exit = lock(&state.exit).take().unwrap_or(SessionExit::Completed);
        let store = lock(&self.store);
        let report = SessionReport {
            exit,
            counts: state.outcome_counts(),
            usage: ResourceUsage {
                elapsed: started.elapsed(),
                iterations: state.completed.load(Ordering::SeqCst),
            },
            records_written: store.len(),
            records_location: store.location(),
        };
        info!(
            "Session ended: {} after {} iteration(s) ({})",
            report.exit, report.usage.iterations, report.counts
        );
        report
    }

    /// Runs one full iteration for a given input without persisting anything.
    pub fn run_single(&self, input: &Input<T, M>) -> Verdict {
        self.run_cycle("replay", input)
    }

    fn worker_loop(&self, worker: usize, state: &SessionState, started: Instant) {
        let budget = self.options.budget;
        loop {
            if state.is_finished() {
                break;
            }
            if self.stop.is_stopped() {
                info!("Worker {worker}: stop requested");
                state.finish(SessionExit::Aborted(AbortReason::Interrupted));
                break;
            }
            if budget.time_exhausted(started.elapsed()) {
                state.finish(SessionExit::BudgetExhausted);
                break;
            }
            let Some(iteration) = state.claim(budget.max_iterations) else {
                state.finish(SessionExit::BudgetExhausted);
                break;
            };
            let tag = format!("w{worker}#{iteration}");

            debug!("[{tag}] generating");
            let next = lock(&self.generator).next_input();
            let input = match next {
                Ok(Some(input)) => input,
                Ok(None) => {
                    info!("Input generator has no more inputs");
                    state.finish(SessionExit::Completed);
                    break;
                }
                Err(e) => {
                    error!("Input generation failed: {e}");
                    state.finish(SessionExit::Aborted(AbortReason::GeneratorExhausted(e)));
                    break;
                }
            };

            let verdict = self.run_cycle(&tag, &input);
            let completed = state.completed.fetch_add(1, Ordering::SeqCst) + 1;
            state.count(verdict.kind);
            debug!(
                "[{tag}] outcome {} {}",
                verdict.kind,
                verdict.detail.as_deref().unwrap_or("")
            );
            if completed % PROGRESS_INTERVAL == 0 {
                info!(
                    "{completed} iterations in {:.1?} ({})",
                    started.elapsed(),
                    state.outcome_counts()
                );
            }

            if verdict.kind == OutcomeKind::InfraError {
                let consecutive = state.consecutive_infra.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "[{tag}] infra error ({consecutive} in a row): {}",
                    verdict.detail.as_deref().unwrap_or("unknown")
                );
                if consecutive > self.options.max_consecutive_infra_errors {
                    state.finish(SessionExit::Aborted(AbortReason::InfraErrors {
                        consecutive,
                        last: verdict.detail.unwrap_or_default(),
                    }));
                    break;
                }
                continue;
            }
            state.consecutive_infra.store(0, Ordering::SeqCst);

            if verdict.kind.is_interesting() {
                if let Err(e) = self.persist(&tag, iteration, &input, &verdict) {
                    error!("[{tag}] failed to persist interesting input: {e}");
                    state.finish(SessionExit::Aborted(AbortReason::StoreFailure(e.to_string())));
                    break;
                }
            }
        }
    }

    fn persist(
        &self,
        tag: &str,
        iteration: u64,
        input: &Input<T, M>,
        verdict: &Verdict,
    ) -> Result<(), StoreError> {
        let record = InterestingInputRecord::from_input(input, verdict, &self.app_name, iteration)?;
        let fingerprint = record.fingerprint.clone();
        if lock(&self.store).append(record)? {
            warn!(
                "[{tag}] {} : seed {} with {} mutation(s), fingerprint {}",
                verdict.kind,
                input.seed().reference(),
                input.chain_len(),
                fingerprint
            );
        } else {
            debug!("[{tag}] {} already recorded as {}", verdict.kind, fingerprint);
        }
        Ok(())
    }

    fn run_cycle(&self, tag: &str, input: &Input<T, M>) -> Verdict {
        debug!("[{tag}] instantiating");
        let instance = match self.runtime.create(&self.app) {
            Ok(instance) => instance,
            Err(e) => return Verdict::infra_error(e.to_string()),
        };
        let mut guard = InstanceGuard::new(instance);
        let verdict = match self.exercise(tag, guard.instance(), input) {
            Ok(observation) => {
                debug!("[{tag}] classifying");
                self.oracle.classify(&observation)
            }
            Err(e) => Verdict::infra_error(e.to_string()),
        };
        debug!("[{tag}] teardown");
        guard.teardown();
        verdict
    }

    fn exercise(
        &self,
        tag: &str,
        instance: &mut dyn AppInstance,
        input: &Input<T, M>,
    ) -> Result<Observation, CycleError> {
        instance.start(&self.options.launch, self.options.startup_timeout)?;
        debug!("[{tag}] injecting");
        let payload = input.value().to_payload(self.options.payload_format)?;
        instance.inject(&payload)?;
        debug!("[{tag}] observing");
        Ok(instance.observe(self.options.timeout)?)
    }
}

impl Fuzzer<MessageLog, LogMutation> {
    /// Builds a message-log fuzzer from a validated session configuration:
    /// seeds from disk, records to `session.out`.
    pub fn from_config(
        config: &HammerConfig,
        runtime: Arc<dyn SandboxRuntime>,
    ) -> Result<Self, FuzzerError> {
        config.validate()?;
        let session = &config.session;
        let app = config.app()?.clone();

        let seeds = load_seed_pool(&session.seeds)?;
        if seeds.is_empty() {
            return Err(ConfigError::EmptySeedPool(session.seeds.clone()).into());
        }

        let random_seed = session.random_seed.unwrap_or_else(rand::random);
        info!("Session random seed: {random_seed}");
        let mutator = build_mutator(session.mutator);
        let generator: Box<dyn InputGenerator<MessageLog, LogMutation>> =
            match session.generator.kind {
                GeneratorKind::Random => Box::new(RandomInputGenerator::with_limits(
                    seeds,
                    mutator,
                    random_seed,
                    session.generator.limits(),
                )?),
                GeneratorKind::MultiOrder => Box::new(MultiOrderInputGenerator::new(
                    seeds,
                    mutator,
                    session.generator.order,
                    random_seed,
                    session.generator.limits(),
                )?),
            };
        let store = OnDiskRecordStore::new(&session.out)?;

        Ok(Fuzzer::new(
            session.app.clone(),
            app,
            runtime,
            generator,
            FuzzOptions::from_settings(session),
        )
        .with_oracle(build_oracle(&session.failure_patterns))
        .with_store(Box::new(store)))
    }
}

/// The runtime a configuration asks for.
pub fn default_runtime(session: &SessionSettings) -> Arc<dyn SandboxRuntime> {
    match &session.scratch_root {
        Some(root) => Arc::new(ProcessRuntime::with_scratch_root(root)),
        None => Arc::new(ProcessRuntime::new()),
    }
}
