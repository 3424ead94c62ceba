//! In-memory runtime for exercising the fuzzer without launching processes.

use super::{AppInstance, ExitInfo, InstanceState, Observation, SandboxError, SandboxRuntime};
use crate::app::{App, LaunchConfig};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// What a mock target does with an injected payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    Respond(Vec<u8>),
    Crash(i32),
    /// Never answers; `observe` reports a timeout without actually waiting.
    Hang,
}

type BehaviorFn = dyn Fn(&[u8]) -> MockBehavior + Send + Sync;

struct Shared {
    behavior: Box<BehaviorFn>,
    start_failures: AtomicU64,
    fail_stop: AtomicBool,
    created: AtomicU64,
    live: AtomicUsize,
    max_live: AtomicUsize,
    stop_calls: AtomicU64,
    injected: Mutex<Vec<Vec<u8>>>,
}

/// A [`SandboxRuntime`] whose targets are closures over the injected payload.
///
/// Clones share counters, so a test can keep one handle while the fuzzer
/// owns another. An instance counts as live from `create` until its first
/// `stop`; dropping it without stopping leaves it counted.
#[derive(Clone)]
pub struct MockRuntime {
    shared: Arc<Shared>,
}

impl fmt::Debug for MockRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockRuntime")
            .field("created", &self.created())
            .field("live", &self.live_instances())
            .finish()
    }
}

impl MockRuntime {
    pub fn new(behavior: impl Fn(&[u8]) -> MockBehavior + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                behavior: Box::new(behavior),
                start_failures: AtomicU64::new(0),
                fail_stop: AtomicBool::new(false),
                created: AtomicU64::new(0),
                live: AtomicUsize::new(0),
                max_live: AtomicUsize::new(0),
                stop_calls: AtomicU64::new(0),
                injected: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Every target answers `ok`.
    pub fn responding() -> Self {
        Self::new(|_| MockBehavior::Respond(b"ok".to_vec()))
    }

    /// Makes the next `count` starts fail as provisioning errors.
    pub fn failing_starts(self, count: u64) -> Self {
        self.shared.start_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Makes every `stop` report an error. Resources are still released.
    pub fn failing_stop(self) -> Self {
        self.shared.fail_stop.store(true, Ordering::SeqCst);
        self
    }

    pub fn created(&self) -> u64 {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn live_instances(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Highest number of instances that were alive at the same time.
    pub fn max_live_instances(&self) -> usize {
        self.shared.max_live.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u64 {
        self.shared.stop_calls.load(Ordering::SeqCst)
    }

    pub fn injected_payloads(&self) -> Vec<Vec<u8>> {
        self.shared
            .injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SandboxRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create(&self, _app: &App) -> Result<Box<dyn AppInstance>, SandboxError> {
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(MockInstance {
            shared: Arc::clone(&self.shared),
            state: InstanceState::Created,
            pending: None,
            released: false,
        }))
    }
}

struct MockInstance {
    shared: Arc<Shared>,
    state: InstanceState,
    pending: Option<MockBehavior>,
    released: bool,
}

impl MockInstance {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn require_running(&self, operation: &'static str) -> Result<(), SandboxError> {
        if self.state == InstanceState::Running {
            Ok(())
        } else {
            Err(SandboxError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

impl AppInstance for MockInstance {
    fn state(&self) -> InstanceState {
        self.state
    }

    fn start(&mut self, _launch: &LaunchConfig, _timeout: Duration) -> Result<(), SandboxError> {
        if self.state != InstanceState::Created {
            return Err(SandboxError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        self.state = InstanceState::Starting;
        let should_fail = self
            .shared
            .start_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            self.state = InstanceState::Stopped;
            self.release();
            return Err(SandboxError::Provision("mock start failure".to_string()));
        }
        self.state = InstanceState::Running;
        Ok(())
    }

    fn inject(&mut self, payload: &[u8]) -> Result<(), SandboxError> {
        self.require_running("inject")?;
        self.shared
            .injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.to_vec());
        self.pending = Some((self.shared.behavior)(payload));
        Ok(())
    }

    fn observe(&mut self, _timeout: Duration) -> Result<Observation, SandboxError> {
        self.require_running("observe")?;
        Ok(match self.pending.take() {
            Some(MockBehavior::Respond(data)) => Observation::Response(data),
            Some(MockBehavior::Crash(code)) => Observation::Crashed(ExitInfo::from_code(code)),
            Some(MockBehavior::Hang) | None => Observation::TimedOut,
        })
    }

    fn stop(&mut self) -> Result<(), SandboxError> {
        if self.state == InstanceState::Stopped && self.released {
            return Ok(());
        }
        self.shared.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.state = InstanceState::Stopping;
        self.release();
        self.state = InstanceState::Stopped;
        if self.shared.fail_stop.load(Ordering::SeqCst) {
            return Err(SandboxError::Teardown("mock stop failure".to_string()));
        }
        Ok(())
    }
}
