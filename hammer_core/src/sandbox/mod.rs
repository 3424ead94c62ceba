//! Isolated, ephemeral instances of the app under test.
//!
//! The fuzzer only talks to [`SandboxRuntime`] and [`AppInstance`]. Each
//! iteration creates one instance, wraps it in an [`InstanceGuard`] and lets
//! the guard stop it on every exit path.

pub mod mock;
pub mod process;

use crate::app::{App, LaunchConfig};
use log::warn;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use mock::{MockBehavior, MockRuntime};
pub use process::{ProcessInstance, ProcessRuntime};

/// Lifecycle of an instance: `Created -> Starting -> Running -> Stopping -> Stopped`.
/// A failed start goes straight to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// How a target process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Last lines the target wrote to stderr.
    pub stderr_tail: String,
}

impl ExitInfo {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Self::default()
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}")?,
            (None, Some(signal)) => write!(f, "terminated by signal {signal}")?,
            (None, None) => write!(f, "exited abnormally")?,
        }
        if !self.stderr_tail.is_empty() {
            write!(f, " (stderr: {})", self.stderr_tail.trim_end())?;
        }
        Ok(())
    }
}

/// What a running instance did after injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Response(Vec<u8>),
    Crashed(ExitInfo),
    TimedOut,
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Failed to provision sandbox: {0}")]
    Provision(String),
    #[error("Failed to spawn {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        #[source]
        source: std::io::Error,
    },
    #[error("Target did not signal readiness within {0:?}")]
    StartupTimeout(Duration),
    #[error("Target stopped during startup: {0}")]
    ExitedDuringStartup(ExitInfo),
    #[error("Cannot {operation} an instance in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: InstanceState,
    },
    #[error("Injection failed: {0}")]
    Inject(#[source] std::io::Error),
    #[error("Teardown failed: {0}")]
    Teardown(String),
    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One live, isolated copy of an app.
pub trait AppInstance: Send {
    fn state(&self) -> InstanceState;

    /// Provisions and launches the target, returning once it is ready for input.
    /// On failure the instance has already released its resources.
    fn start(&mut self, launch: &LaunchConfig, startup_timeout: Duration)
    -> Result<(), SandboxError>;

    /// Writes a payload to the target's input channel. Only valid while running.
    fn inject(&mut self, payload: &[u8]) -> Result<(), SandboxError>;

    /// Blocks until the target responds, exits, or `timeout` elapses.
    fn observe(&mut self, timeout: Duration) -> Result<Observation, SandboxError>;

    /// Releases every resource held by the instance. Idempotent.
    fn stop(&mut self) -> Result<(), SandboxError>;
}

/// Creates instances of apps.
pub trait SandboxRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, app: &App) -> Result<Box<dyn AppInstance>, SandboxError>;
}

impl<R: SandboxRuntime + ?Sized> SandboxRuntime for std::sync::Arc<R> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn create(&self, app: &App) -> Result<Box<dyn AppInstance>, SandboxError> {
        (**self).create(app)
    }
}

/// Scoped owner of an instance: stops it exactly once, either through
/// [`InstanceGuard::teardown`] or on drop. Teardown failures are logged.
pub struct InstanceGuard {
    instance: Box<dyn AppInstance>,
    stopped: bool,
}

impl InstanceGuard {
    pub fn new(instance: Box<dyn AppInstance>) -> Self {
        Self {
            instance,
            stopped: false,
        }
    }

    pub fn instance(&mut self) -> &mut dyn AppInstance {
        self.instance.as_mut()
    }

    pub fn teardown(mut self) {
        self.stop_once();
    }

    fn stop_once(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(e) = self.instance.stop() {
            warn!("Sandbox teardown failed: {e}");
        }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.stop_once();
    }
}
