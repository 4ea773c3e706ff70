//! Remote shell sessions through the AWS CLI and the Session Manager plugin.
//!
//! A session hands the terminal to an external `aws` process. The launcher
//! only tracks its lifecycle (`Idle → Starting → Active → Closed | Failed`),
//! passes stderr through while keeping a tail of it to classify failures,
//! and terminates the child when the application is asked to shut down.

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command as TokioCommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{ConnectivityError, SessionError, SessionFailure, SessionLaunchError, ValidationError};
use crate::model::{Container, LaunchType, Task};
use crate::provider::CloudProvider;

const AWS_CLI: &str = "aws";
const SESSION_PLUGIN: &str = "session-manager-plugin";
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    ContainerExec,
    HostShell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Closed,
    Failed(SessionFailure),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }
}

/// Resolved session target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub task: Task,
    pub container: Option<Container>,
    pub mode: SessionMode,
    /// EC2 instance hosting the task, when the session goes through SSM
    pub instance_id: Option<String>,
}

impl SessionTarget {
    fn uses_host(task: &Task, container: Option<&Container>, mode: SessionMode) -> bool {
        task.launch_type == LaunchType::Ec2
            && (mode == SessionMode::HostShell || container.is_some_and(|c| c.runtime_id.is_some()))
    }

    /// Resolves the host instance when needed and checks it is reachable.
    pub async fn resolve(
        provider: &dyn CloudProvider,
        task: &Task,
        container: Option<&Container>,
        mode: SessionMode,
    ) -> Result<Self, SessionError> {
        if mode == SessionMode::HostShell && task.launch_type == LaunchType::Fargate {
            return Err(ValidationError::HostShellOnFargate.into());
        }

        let instance_id = if Self::uses_host(task, container, mode) {
            if task.container_instance_arn.is_none() {
                return Err(ConnectivityError::NoHostInstance {
                    task_id: task.id.clone(),
                }
                .into());
            }
            let instance = provider.resolve_instance(task).await?;
            if !instance.ssm_registered {
                return Err(ConnectivityError::NotRegistered {
                    instance_id: instance.instance_id,
                }
                .into());
            }
            Some(instance.instance_id)
        } else {
            None
        };

        Ok(Self {
            task: task.clone(),
            container: container.cloned(),
            mode,
            instance_id,
        })
    }
}

/// Program and arguments for the session client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SessionCommand {
    pub fn build(target: &SessionTarget, shell: &str, profile: Option<&str>) -> Result<Self, ValidationError> {
        let task = &target.task;
        let mut args: Vec<String> = match (target.mode, &target.instance_id, &target.container) {
            (SessionMode::HostShell, _, _) if task.launch_type == LaunchType::Fargate => {
                return Err(ValidationError::HostShellOnFargate);
            }
            (SessionMode::HostShell, Some(instance), _) => {
                vec!["ssm".into(), "start-session".into(), "--target".into(), instance.clone()]
            }
            (SessionMode::ContainerExec, Some(instance), Some(container)) if container.runtime_id.is_some() => {
                let runtime_id = container.runtime_id.as_deref().unwrap_or_default();
                let parameters = serde_json::json!({
                    "command": [format!("sudo docker exec -it {runtime_id} {shell}")]
                });
                vec![
                    "ssm".into(),
                    "start-session".into(),
                    "--target".into(),
                    instance.clone(),
                    "--document-name".into(),
                    "AWS-StartInteractiveCommand".into(),
                    "--parameters".into(),
                    parameters.to_string(),
                ]
            }
            (SessionMode::ContainerExec, _, Some(container)) => vec![
                "ecs".into(),
                "execute-command".into(),
                "--cluster".into(),
                task.cluster_arn.clone(),
                "--task".into(),
                task.arn.clone(),
                "--container".into(),
                container.name.clone(),
                "--interactive".into(),
                "--command".into(),
                shell.to_string(),
            ],
            _ => return Err(ValidationError::NothingSelected),
        };

        args.extend(["--region".to_string(), task.region.clone()]);
        if let Some(profile) = profile {
            args.extend(["--profile".to_string(), profile.to_string()]);
        }
        Ok(Self {
            program: AWS_CLI.to_string(),
            args,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub stderr_tail: String,
}

impl ProcessExit {
    fn classify(&self) -> SessionState {
        if self.code == Some(0) {
            return SessionState::Closed;
        }
        let stderr = self.stderr_tail.to_lowercase();
        let failure = if stderr.contains("targetnotconnected") || stderr.contains("is not connected") {
            SessionFailure::InstanceUnreachable
        } else if stderr.contains("accessdenied") || stderr.contains("not authorized") {
            SessionFailure::PermissionDenied
        } else {
            SessionFailure::Unknown { code: self.code }
        };
        SessionState::Failed(failure)
    }
}

/// A running session client.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Waits for the process to exit. Must be cancel-safe.
    async fn wait(&mut self) -> io::Result<ProcessExit>;

    /// Asks the process to terminate without waiting for it.
    fn terminate(&mut self) -> io::Result<()>;
}

pub trait ProcessSpawner: Send + Sync {
    fn is_available(&self, program: &str) -> bool;

    fn spawn(&self, command: &SessionCommand) -> io::Result<Box<dyn ProcessHandle>>;
}

/// Searches `PATH` for an executable file named `program`.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Spawns the session client with the terminal inherited.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn is_available(&self, program: &str) -> bool {
        find_on_path(program).is_some()
    }

    fn spawn(&self, command: &SessionCommand) -> io::Result<Box<dyn ProcessHandle>> {
        let mut child = TokioCommand::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .spawn()?;

        let tail = Arc::new(Mutex::new(String::new()));
        let pump = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(pump_stderr(stderr, Arc::clone(&tail))));

        Ok(Box::new(ChildHandle { child, tail, pump }))
    }
}

struct ChildHandle {
    child: Child,
    tail: Arc<Mutex<String>>,
    pump: Option<JoinHandle<()>>,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    async fn wait(&mut self) -> io::Result<ProcessExit> {
        let status = self.child.wait().await?;
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        let stderr_tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(ProcessExit {
            code: status.code(),
            stderr_tail,
        })
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// Copies the child's stderr to ours and keeps the last few KiB for diagnosis.
async fn pump_stderr(mut from: ChildStderr, tail: Arc<Mutex<String>>) {
    let mut out = tokio::io::stderr();
    let mut buf = [0u8; 4096];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let _ = out.write_all(&buf[..n]).await;
        let _ = out.flush().await;

        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        tail.push_str(&String::from_utf8_lossy(&buf[..n]));
        if tail.len() > STDERR_TAIL_BYTES {
            let cut = tail.len() - STDERR_TAIL_BYTES;
            let cut = (cut..tail.len()).find(|&i| tail.is_char_boundary(i)).unwrap_or(tail.len());
            tail.drain(..cut);
        }
    }
}

/// Owns the one remote session the process may run at a time.
pub struct SessionLauncher {
    spawner: Arc<dyn ProcessSpawner>,
    shell: String,
    profile: Option<String>,
    grace: Duration,
    state: watch::Sender<SessionState>,
    handle: Option<Box<dyn ProcessHandle>>,
}

impl SessionLauncher {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, config: &SessionConfig, profile: Option<String>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            spawner,
            shell: config.shell.clone(),
            profile,
            grace: config.startup_grace(),
            state,
            handle: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every lifecycle transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        let from = self.state.borrow().clone();
        debug!(?from, to = ?next, "session transition");
        self.state.send_replace(next);
    }

    /// Spawns the session client and waits out the startup grace period.
    ///
    /// Valid only from `Idle`. On return the state is `Active`, or already
    /// terminal if the client exited during startup.
    pub async fn start(&mut self, target: &SessionTarget) -> Result<SessionState, SessionError> {
        if self.state() != SessionState::Idle {
            return Err(SessionError::AlreadyActive);
        }
        for binary in [AWS_CLI, SESSION_PLUGIN] {
            if !self.spawner.is_available(binary) {
                return Err(SessionLaunchError::PluginMissing {
                    binary: binary.to_string(),
                }
                .into());
            }
        }
        let command = SessionCommand::build(target, &self.shell, self.profile.as_deref())?;

        self.transition(SessionState::Starting);
        info!(task = %target.task.id, mode = ?target.mode, "starting remote session");
        let mut handle = match self.spawner.spawn(&command) {
            Ok(handle) => handle,
            Err(err) => {
                self.transition(SessionState::Idle);
                return Err(SessionLaunchError::Spawn(err.to_string()).into());
            }
        };

        match tokio::time::timeout(self.grace, handle.wait()).await {
            Ok(exit) => self.finish(exit),
            Err(_) => {
                self.transition(SessionState::Active);
                self.handle = Some(handle);
            }
        }
        Ok(self.state())
    }

    /// Waits for an active session to end. Cancelling `shutdown` terminates
    /// the client first.
    pub async fn wait(&mut self, shutdown: &CancellationToken) -> SessionState {
        let Some(mut handle) = self.handle.take() else {
            return self.state();
        };
        let exit = tokio::select! {
            exit = handle.wait() => exit,
            () = shutdown.cancelled() => {
                info!("terminating remote session on shutdown");
                if let Err(err) = handle.terminate() {
                    warn!(error = %err, "failed to terminate session client");
                }
                handle.wait().await
            }
        };
        self.finish(exit);
        self.state()
    }

    fn finish(&mut self, exit: io::Result<ProcessExit>) {
        let next = match exit {
            Ok(exit) => exit.classify(),
            Err(err) => {
                warn!(error = %err, "failed waiting for session client");
                SessionState::Failed(SessionFailure::Unknown { code: None })
            }
        };
        info!(state = ?next, "remote session ended");
        self.transition(next);
    }

    /// Returns a finished launcher to `Idle`. No-op while a session runs.
    pub fn reset(&mut self) {
        if self.state().is_terminal() {
            self.transition(SessionState::Idle);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn task(launch_type: LaunchType) -> Task {
        Task {
            arn: "arn:aws:ecs:eu-west-1:1:task/prod/abc".into(),
            id: "abc".into(),
            cluster_arn: "arn:aws:ecs:eu-west-1:1:cluster/prod".into(),
            region: "eu-west-1".into(),
            service_name: "api".into(),
            launch_type,
            last_status: "RUNNING".into(),
            container_instance_arn: None,
            started_at: None,
            task_definition_arn: "arn:td".into(),
            containers: vec![],
        }
    }

    fn container(runtime_id: Option<&str>) -> Container {
        Container {
            name: "app".into(),
            task_arn: "arn:aws:ecs:eu-west-1:1:task/prod/abc".into(),
            runtime_id: runtime_id.map(str::to_string),
            last_status: "RUNNING".into(),
        }
    }

    struct FakeHandle {
        runs_for: Duration,
        exit: ProcessExit,
        terminated: Arc<AtomicBool>,
        started: tokio::time::Instant,
    }

    #[async_trait]
    impl ProcessHandle for FakeHandle {
        async fn wait(&mut self) -> io::Result<ProcessExit> {
            loop {
                if self.terminated.load(Ordering::SeqCst) {
                    return Ok(ProcessExit { code: None, stderr_tail: String::new() });
                }
                if self.started.elapsed() >= self.runs_for {
                    return Ok(self.exit.clone());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        fn terminate(&mut self) -> io::Result<()> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeSpawner {
        installed: bool,
        runs_for: Duration,
        exit: ProcessExit,
        spawned: AtomicUsize,
        terminated: Arc<AtomicBool>,
    }

    impl FakeSpawner {
        fn new(runs_for: Duration, code: i32, stderr: &str) -> Arc<Self> {
            Self::with_plugin(true, runs_for, code, stderr)
        }

        fn with_plugin(installed: bool, runs_for: Duration, code: i32, stderr: &str) -> Arc<Self> {
            Arc::new(Self {
                installed,
                runs_for,
                exit: ProcessExit { code: Some(code), stderr_tail: stderr.to_string() },
                spawned: AtomicUsize::new(0),
                terminated: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    impl ProcessSpawner for FakeSpawner {
        fn is_available(&self, _program: &str) -> bool {
            self.installed
        }

        fn spawn(&self, _command: &SessionCommand) -> io::Result<Box<dyn ProcessHandle>> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeHandle {
                runs_for: self.runs_for,
                exit: self.exit.clone(),
                terminated: Arc::clone(&self.terminated),
                started: tokio::time::Instant::now(),
            }))
        }
    }

    fn fargate_target() -> SessionTarget {
        SessionTarget {
            task: task(LaunchType::Fargate),
            container: Some(container(None)),
            mode: SessionMode::ContainerExec,
            instance_id: None,
        }
    }

    #[test]
    fn test_host_shell_command() {
        let target = SessionTarget {
            task: task(LaunchType::Ec2),
            container: None,
            mode: SessionMode::HostShell,
            instance_id: Some("i-0abc".into()),
        };
        let command = SessionCommand::build(&target, "/bin/sh", None).unwrap();
        assert_eq!(command.program, "aws");
        assert_eq!(command.args, vec!["ssm", "start-session", "--target", "i-0abc", "--region", "eu-west-1"]);
    }

    #[test]
    fn test_container_exec_on_ec2_uses_docker_exec() {
        let target = SessionTarget {
            task: task(LaunchType::Ec2),
            container: Some(container(Some("d0c4e1"))),
            mode: SessionMode::ContainerExec,
            instance_id: Some("i-0abc".into()),
        };
        let command = SessionCommand::build(&target, "/bin/sh", Some("prod")).unwrap();
        assert!(command.args.contains(&"AWS-StartInteractiveCommand".to_string()));
        assert!(command.args.contains(&r#"{"command":["sudo docker exec -it d0c4e1 /bin/sh"]}"#.to_string()));
        assert_eq!(&command.args[command.args.len() - 2..], ["--profile", "prod"]);
    }

    #[test]
    fn test_container_exec_on_fargate_uses_execute_command() {
        let command = SessionCommand::build(&fargate_target(), "/bin/bash", None).unwrap();
        assert_eq!(&command.args[..2], ["ecs", "execute-command"]);
        assert!(command.args.contains(&"--interactive".to_string()));
        assert!(command.args.contains(&"/bin/bash".to_string()));
    }

    #[test]
    fn test_host_shell_on_fargate_is_rejected() {
        let mut target = fargate_target();
        target.mode = SessionMode::HostShell;
        assert_eq!(SessionCommand::build(&target, "/bin/sh", None), Err(ValidationError::HostShellOnFargate));
    }

    #[test]
    fn test_exit_classification() {
        let exit = |code, stderr: &str| ProcessExit { code, stderr_tail: stderr.to_string() };
        assert_eq!(exit(Some(0), "").classify(), SessionState::Closed);
        assert_eq!(
            exit(Some(255), "An error occurred (TargetNotConnected) when calling the StartSession operation").classify(),
            SessionState::Failed(SessionFailure::InstanceUnreachable)
        );
        assert_eq!(
            exit(Some(254), "AccessDeniedException: User is not authorized").classify(),
            SessionState::Failed(SessionFailure::PermissionDenied)
        );
        assert_eq!(exit(Some(1), "boom").classify(), SessionState::Failed(SessionFailure::Unknown { code: Some(1) }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lifecycle_closed() {
        let spawner = FakeSpawner::new(Duration::from_secs(5), 0, "");
        let mut launcher = SessionLauncher::new(spawner.clone(), &SessionConfig::default(), None);
        let mut transitions = launcher.subscribe();

        assert_eq!(launcher.start(&fargate_target()).await.unwrap(), SessionState::Active);
        assert!(transitions.has_changed().unwrap());
        assert_eq!(*transitions.borrow_and_update(), SessionState::Active);

        let state = launcher.wait(&CancellationToken::new()).await;
        assert_eq!(state, SessionState::Closed);
        launcher.reset();
        assert_eq!(launcher.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_during_startup_skips_active() {
        let spawner = FakeSpawner::new(Duration::from_millis(100), 255, "TargetNotConnected");
        let mut launcher = SessionLauncher::new(spawner, &SessionConfig::default(), None);
        let state = launcher.start(&fargate_target()).await.unwrap();
        assert_eq!(state, SessionState::Failed(SessionFailure::InstanceUnreachable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plugin_missing_does_not_spawn() {
        let spawner = FakeSpawner::with_plugin(false, Duration::ZERO, 0, "");
        let mut launcher = SessionLauncher::new(spawner.clone(), &SessionConfig::default(), None);
        let err = launcher.start(&fargate_target()).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::Launch(SessionLaunchError::PluginMissing { binary: "aws".into() })
        );
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 0);
        assert_eq!(launcher.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_terminates_active_session() {
        let spawner = FakeSpawner::new(Duration::from_secs(3600), 0, "");
        let mut launcher = SessionLauncher::new(spawner.clone(), &SessionConfig::default(), None);
        launcher.start(&fargate_target()).await.unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let state = launcher.wait(&shutdown).await;
        assert!(spawner.terminated.load(Ordering::SeqCst));
        assert_eq!(state, SessionState::Failed(SessionFailure::Unknown { code: None }));
    }
}
