//! Runs each instance as a child process group inside a fresh scratch directory.

use super::{AppInstance, ExitInfo, InstanceState, Observation, SandboxError, SandboxRuntime};
use crate::app::{App, LaunchConfig, Mount};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Environment variable pointing the target at its scratch directory.
pub const SCRATCH_ENV: &str = "HAMMER_SCRATCH";

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const STDERR_TAIL_LINES: usize = 20;
/// How long to keep collecting stdout after the target has exited.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct ProcessRuntime {
    scratch_root: Option<PathBuf>,
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: Some(root.into()),
        }
    }
}

impl SandboxRuntime for ProcessRuntime {
    fn name(&self) -> &'static str {
        "process"
    }

    fn create(&self, app: &App) -> Result<Box<dyn AppInstance>, SandboxError> {
        Ok(Box::new(ProcessInstance::new(
            app.clone(),
            self.scratch_root.clone(),
        )))
    }
}

/// A target process plus everything provisioned for it.
///
/// Stdout is read line by line on a helper thread so that readiness and
/// response markers can be waited on with a deadline. Stderr keeps only its
/// last [`STDERR_TAIL_LINES`] lines for crash reports.
pub struct ProcessInstance {
    app: App,
    scratch_root: Option<PathBuf>,
    state: InstanceState,
    scratch: Option<TempDir>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout_lines: Option<Receiver<String>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_reader: Option<JoinHandle<()>>,
    captured: Vec<String>,
}

impl ProcessInstance {
    pub fn new(app: App, scratch_root: Option<PathBuf>) -> Self {
        Self {
            app,
            scratch_root,
            state: InstanceState::Created,
            scratch: None,
            child: None,
            stdin: None,
            stdout_lines: None,
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
            stderr_reader: None,
            captured: Vec::new(),
        }
    }

    /// Scratch directory of a started instance.
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
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

    fn provision_scratch(&self) -> Result<TempDir, SandboxError> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("hammer-");
            builder
        };
        let scratch = match &self.scratch_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        for mount in &self.app.mounts {
            stage_mount(mount, scratch.path())?;
        }
        Ok(scratch)
    }

    fn launch(&mut self, launch: &LaunchConfig, startup_timeout: Duration) -> Result<(), SandboxError> {
        let command = self.app.full_command();
        let Some((program, args)) = command.split_first() else {
            return Err(SandboxError::Provision("app command is empty".to_string()));
        };

        let scratch = self.provision_scratch()?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(launch.working_dir.as_deref().unwrap_or(scratch.path()))
            .envs(&self.app.env)
            .envs(&launch.env)
            .env(SCRATCH_ENV, scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        self.scratch = Some(scratch);

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            command: command.clone(),
            source,
        })?;
        debug!("Spawned {:?} as pid {}", command, child.id());

        self.stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
            self.stdout_lines = Some(rx);
        }
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&self.stderr_tail);
            self.stderr_reader = Some(thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    let Ok(line) = line else { break };
                    let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }));
        }
        self.child = Some(child);

        if let Some(ready_line) = self.app.ready_line.clone() {
            self.wait_for_ready(&ready_line, startup_timeout)?;
        }
        Ok(())
    }

    fn wait_for_ready(&mut self, ready_line: &str, startup_timeout: Duration) -> Result<(), SandboxError> {
        let deadline = Instant::now() + startup_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SandboxError::StartupTimeout(startup_timeout));
            }
            match self.next_line(remaining.min(POLL_INTERVAL * 10)) {
                Ok(line) if line.trim_end() == ready_line => {
                    trace!("Target signalled readiness");
                    return Ok(());
                }
                Ok(line) => trace!("Pre-ready output: {line}"),
                Err(RecvTimeoutError::Timeout) => {}
                // Stdout closed; readiness can no longer arrive.
                Err(RecvTimeoutError::Disconnected) => {
                    thread::sleep(remaining.min(POLL_INTERVAL));
                }
            }
            if let Some(status) = self.try_exit_status()? {
                return Err(SandboxError::ExitedDuringStartup(self.exit_info(status)));
            }
        }
    }

    fn next_line(&self, timeout: Duration) -> Result<String, RecvTimeoutError> {
        match &self.stdout_lines {
            Some(rx) => rx.recv_timeout(timeout),
            None => Err(RecvTimeoutError::Disconnected),
        }
    }

    fn try_exit_status(&mut self) -> Result<Option<ExitStatus>, SandboxError> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?),
            None => Ok(None),
        }
    }

    /// Gives the stderr reader a moment to catch up once the target has exited.
    fn settle_stderr(&mut self) {
        let grace_deadline = Instant::now() + EXIT_DRAIN_GRACE;
        if let Some(reader) = &self.stderr_reader {
            while !reader.is_finished() && Instant::now() < grace_deadline {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn exit_info(&mut self, status: ExitStatus) -> ExitInfo {
        self.settle_stderr();
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        ExitInfo {
            code: status.code(),
            signal,
            stderr_tail: tail.iter().cloned().collect::<Vec<_>>().join("\n"),
        }
    }

    /// Collects stdout written just before exit.
    fn drain_after_exit(&mut self) {
        let grace_deadline = Instant::now() + EXIT_DRAIN_GRACE;
        loop {
            let remaining = grace_deadline.saturating_duration_since(Instant::now());
            match self.next_line(remaining) {
                Ok(line) => self.captured.push(line),
                Err(_) => break,
            }
        }
    }

    fn captured_output(&self) -> Vec<u8> {
        self.captured.join("\n").into_bytes()
    }

    fn shutdown(&mut self) -> Result<(), SandboxError> {
        let mut failures = Vec::new();
        self.stdin = None;

        if let Some(mut child) = self.child.take() {
            #[cfg(unix)]
            if let Ok(raw) = i32::try_from(child.id()) {
                use nix::errno::Errno;
                use nix::sys::signal::{Signal, killpg};
                use nix::unistd::Pid;

                // The group id is the child's pid: it was spawned with `process_group(0)`.
                match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(err) => failures.push(format!("killpg({raw}): {err}")),
                }
            }
            // Already-exited children report an error here; the wait below is what matters.
            let _ = child.kill();
            if let Err(e) = child.wait() {
                failures.push(format!("wait for pid {}: {e}", child.id()));
            }
        }
        self.stdout_lines = None;
        self.stderr_reader = None;

        if let Some(scratch) = self.scratch.take() {
            let path = scratch.path().to_path_buf();
            if let Err(e) = scratch.close() {
                failures.push(format!("remove scratch {path:?}: {e}"));
            }
        }

        self.state = InstanceState::Stopped;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::Teardown(failures.join("; ")))
        }
    }
}

impl AppInstance for ProcessInstance {
    fn state(&self) -> InstanceState {
        self.state
    }

    fn start(&mut self, launch: &LaunchConfig, startup_timeout: Duration) -> Result<(), SandboxError> {
        if self.state != InstanceState::Created {
            return Err(SandboxError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        self.state = InstanceState::Starting;
        match self.launch(launch, startup_timeout) {
            Ok(()) => {
                self.state = InstanceState::Running;
                Ok(())
            }
            Err(err) => {
                if let Err(teardown) = self.shutdown() {
                    warn!("Cleanup after failed start: {teardown}");
                }
                Err(err)
            }
        }
    }

    fn inject(&mut self, payload: &[u8]) -> Result<(), SandboxError> {
        self.require_running("inject")?;
        let Some(mut stdin) = self.stdin.take() else {
            return Err(SandboxError::Inject(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "input channel already closed",
            )));
        };
        // Dropping `stdin` at the end closes the channel. A target that died
        // early has closed its end already; observe() reports the exit.
        match stdin.write_all(payload).and_then(|()| stdin.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Target closed its input before the payload was written");
                Ok(())
            }
            Err(e) => Err(SandboxError::Inject(e)),
        }
    }

    fn observe(&mut self, timeout: Duration) -> Result<Observation, SandboxError> {
        self.require_running("observe")?;
        let deadline = Instant::now() + timeout;
        let response_line = self.app.response_line.clone();
        self.captured.clear();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(if self.app.pass_if_alive {
                    Observation::Response(self.captured_output())
                } else {
                    Observation::TimedOut
                });
            }

            match self.next_line(remaining.min(POLL_INTERVAL)) {
                Ok(line) => {
                    if response_line.as_deref() == Some(line.trim_end()) {
                        return Ok(Observation::Response(self.captured_output()));
                    }
                    self.captured.push(line);
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    thread::sleep(remaining.min(POLL_INTERVAL));
                }
            }

            if let Some(status) = self.try_exit_status()? {
                self.drain_after_exit();
                return Ok(if status.success() {
                    Observation::Response(self.captured_output())
                } else {
                    Observation::Crashed(self.exit_info(status))
                });
            }
        }
    }

    fn stop(&mut self) -> Result<(), SandboxError> {
        if self.state == InstanceState::Stopped {
            return Ok(());
        }
        self.state = InstanceState::Stopping;
        self.shutdown()
    }
}

impl Drop for ProcessInstance {
    fn drop(&mut self) {
        if self.state != InstanceState::Stopped {
            if let Err(e) = self.stop() {
                warn!("Stopping dropped instance failed: {e}");
            }
        }
    }
}

/// Mount targets must stay inside the scratch directory: relative, no `..`.
fn stage_mount(mount: &Mount, scratch: &Path) -> Result<(), SandboxError> {
    let contained = mount
        .target
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !contained {
        return Err(SandboxError::Provision(format!(
            "mount target {:?} must be relative to the scratch directory",
            mount.target
        )));
    }
    copy_tree(&mount.source, &scratch.join(&mount.target)).map_err(|e| {
        SandboxError::Provision(format!(
            "staging {:?} -> {:?} failed: {e}",
            mount.source, mount.target
        ))
    })
}

fn copy_tree(source: &Path, dest: &Path) -> io::Result<()> {
    if source.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, dest)?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn get_test_target_path(name: &str) -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.join("../test_targets").join(name)
    }

    fn script_app(name: &str) -> App {
        let target_path = get_test_target_path(name);
        if !target_path.exists() {
            panic!("Test target missing: {target_path:?}");
        }
        App::new(vec!["sh".into(), target_path.display().to_string()])
    }

    fn started(app: App) -> ProcessInstance {
        let mut instance = ProcessInstance::new(app, None);
        instance
            .start(&LaunchConfig::default(), Duration::from_secs(5))
            .unwrap();
        instance
    }

    #[test]
    fn clean_exit_is_a_response_with_stdout() {
        let mut instance = started(script_app("test_target_ok.sh"));
        instance.inject(b"hello").unwrap();
        let observation = instance.observe(Duration::from_secs(5)).unwrap();
        assert_eq!(observation, Observation::Response(b"ok".to_vec()));
        instance.stop().unwrap();
        assert_eq!(instance.state(), InstanceState::Stopped);
    }

    #[test]
    fn non_zero_exit_is_a_crash_with_stderr_tail() {
        let mut instance = started(script_app("test_target_crash_few_messages.sh"));
        instance.inject(b"[]").unwrap();
        match instance.observe(Duration::from_secs(5)).unwrap() {
            Observation::Crashed(info) => {
                assert_eq!(info.code, Some(1));
                assert!(info.stderr_tail.contains("too few messages"), "{info}");
            }
            other => panic!("expected crash, got {other:?}"),
        }
    }

    #[test]
    fn enough_messages_do_not_crash() {
        let mut instance = started(script_app("test_target_crash_few_messages.sh"));
        instance
            .inject(br#"[{"channel":"/a","timestamp-ns":0,"payload":[]},{"channel":"/b","timestamp-ns":1,"payload":[]}]"#)
            .unwrap();
        assert!(matches!(
            instance.observe(Duration::from_secs(5)).unwrap(),
            Observation::Response(_)
        ));
    }

    #[test]
    fn hanging_target_times_out_and_is_killed() {
        let mut instance = started(script_app("test_target_hang.sh"));
        instance.inject(b"x").unwrap();
        let started_at = Instant::now();
        assert_eq!(
            instance.observe(Duration::from_millis(200)).unwrap(),
            Observation::TimedOut
        );
        assert!(started_at.elapsed() < Duration::from_secs(5));
        instance.stop().unwrap();
        instance.stop().unwrap();
        assert_eq!(instance.state(), InstanceState::Stopped);
    }

    #[test]
    fn pass_if_alive_turns_deadline_into_response() {
        let mut app = script_app("test_target_hang.sh");
        app.pass_if_alive = true;
        let mut instance = started(app);
        instance.inject(b"x").unwrap();
        assert!(matches!(
            instance.observe(Duration::from_millis(100)).unwrap(),
            Observation::Response(_)
        ));
    }

    #[test]
    fn ready_and_response_markers_frame_the_exchange() {
        let mut app = script_app("test_target_ready.sh");
        app.ready_line = Some("READY".into());
        app.response_line = Some("DONE".into());
        let mut instance = started(app);
        assert_eq!(instance.state(), InstanceState::Running);
        instance.inject(b"ping\n").unwrap();
        assert_eq!(
            instance.observe(Duration::from_secs(5)).unwrap(),
            Observation::Response(b"got ping".to_vec())
        );
    }

    #[test]
    fn missing_ready_marker_is_a_startup_timeout() {
        let mut app = script_app("test_target_hang.sh");
        app.ready_line = Some("READY".into());
        let mut instance = ProcessInstance::new(app, None);
        let err = instance
            .start(&LaunchConfig::default(), Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, SandboxError::StartupTimeout(_)), "{err}");
        assert_eq!(instance.state(), InstanceState::Stopped);
    }

    #[test]
    fn unknown_program_fails_to_spawn() {
        let app = App::new(vec!["/nonexistent/hammer-target".into()]);
        let mut instance = ProcessInstance::new(app, None);
        let err = instance
            .start(&LaunchConfig::default(), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }), "{err}");
        assert_eq!(instance.state(), InstanceState::Stopped);
    }

    #[test]
    fn mounts_are_staged_and_scratch_is_removed_on_stop() {
        let host = tempdir().unwrap();
        fs::create_dir(host.path().join("conf")).unwrap();
        fs::write(host.path().join("conf/value.txt"), "42").unwrap();

        let scratch_root = tempdir().unwrap();
        let mut app = App::new(vec![
            "sh".into(),
            "-c".into(),
            r#"cat "$HAMMER_SCRATCH/params/conf/value.txt""#.into(),
        ]);
        app.mounts.push(Mount {
            source: host.path().to_path_buf(),
            target: PathBuf::from("params"),
        });

        let mut instance = ProcessInstance::new(app, Some(scratch_root.path().to_path_buf()));
        instance
            .start(&LaunchConfig::default(), Duration::from_secs(5))
            .unwrap();
        let scratch = instance.scratch_dir().unwrap().to_path_buf();
        assert!(scratch.starts_with(scratch_root.path()));
        instance.inject(b"").unwrap();
        assert_eq!(
            instance.observe(Duration::from_secs(5)).unwrap(),
            Observation::Response(b"42".to_vec())
        );
        instance.stop().unwrap();
        assert!(!scratch.exists());
    }

    #[test]
    fn absolute_mount_target_is_rejected() {
        let mut app = script_app("test_target_ok.sh");
        app.mounts.push(Mount {
            source: PathBuf::from("/tmp"),
            target: PathBuf::from("/etc"),
        });
        let mut instance = ProcessInstance::new(app, None);
        assert!(matches!(
            instance.start(&LaunchConfig::default(), Duration::from_secs(1)),
            Err(SandboxError::Provision(_))
        ));
    }

    #[test]
    fn parent_dir_mount_target_is_rejected() {
        let host = tempdir().unwrap();
        fs::write(host.path().join("payload.txt"), "x").unwrap();
        let scratch = tempdir().unwrap();
        let inner = scratch.path().join("instance");
        fs::create_dir(&inner).unwrap();

        for target in ["../escaped", "params/../../escaped"] {
            let mount = Mount {
                source: host.path().to_path_buf(),
                target: PathBuf::from(target),
            };
            assert!(
                matches!(stage_mount(&mount, &inner), Err(SandboxError::Provision(_))),
                "{target} was accepted"
            );
        }
        assert!(!scratch.path().join("escaped").exists());

        let nested = Mount {
            source: host.path().to_path_buf(),
            target: PathBuf::from("./params/conf"),
        };
        stage_mount(&nested, &inner).unwrap();
        assert!(inner.join("params/conf/payload.txt").exists());
    }
}
