//! Child process execution with hard timeouts.
//!
//! A [`CommandRunner`] starts one child, buffers its output incrementally,
//! and finalizes exactly once: on exit, on timeout, or on a registry kill.
//! Anything the child does after finalization is ignored.

mod registry;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::core::types::EnvMap;

pub use registry::{ProcessRegistry, Registration};

/// How long to wait for a killed child to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for output readers once the child is gone.
///
/// Grandchildren can keep a pipe open after the child itself died.
const READER_GRACE: Duration = Duration::from_secs(1);

/// Process errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The OS refused to create the process.
    #[error("failed to start {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything needed to run one child.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Label used in logs and the registry.
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Complete environment. The parent environment is not inherited.
    pub env: EnvMap,
    /// Hard budget after which the child is killed.
    pub timeout: Duration,
}

impl ProcessSpec {
    #[must_use]
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: EnvMap::new(),
            timeout,
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, env: EnvMap) -> Self {
        self.env = env;
        self
    }
}

/// How a child was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own.
    Exited,
    /// Killed after its budget ran out.
    TimedOut,
    /// Killed through the registry.
    Killed,
    /// Never started.
    NotStarted,
}

/// Result of running one child.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub termination: Termination,
    /// Exit code, when the child exited on its own and had one.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Start failure, when the child never ran.
    pub error: Option<String>,
    pub duration: Duration,
}

impl ProcessOutput {
    /// Output for a child that never started.
    #[must_use]
    pub fn not_started(error: impl Into<String>) -> Self {
        Self {
            termination: Termination::NotStarted,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.into()),
            duration: Duration::ZERO,
        }
    }

    /// Exited on its own with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }

    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.termination == Termination::TimedOut
    }

    /// Best single line of diagnostic text: start error, else stderr, else stdout.
    #[must_use]
    pub fn diagnostic(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Something that can run a child to completion.
///
/// Implemented by [`ProcessRunner`]; tests substitute their own.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the child described by `spec`. Never returns an error: start
    /// failures are reported in [`ProcessOutput::error`].
    async fn run(&self, spec: ProcessSpec) -> ProcessOutput;

    /// Kill every child this runner still has in flight.
    fn kill_all(&self) -> usize;

    /// Number of children currently in flight.
    fn live_count(&self) -> usize;
}

/// Runner backed by real OS processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    registry: ProcessRegistry,
}

impl ProcessRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }
}

enum Finish {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Killed,
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: ProcessSpec) -> ProcessOutput {
        let started = Instant::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let error = ProcessError::SpawnFailed {
                    program: spec.program.display().to_string(),
                    source,
                };
                tracing::warn!(label = %spec.label, error = %error, "process failed to start");
                return ProcessOutput::not_started(error.to_string());
            }
        };

        let pid = child.id();
        let (registration, mut kill_rx) = self.registry.register(&spec.label, pid);
        tracing::debug!(label = %spec.label, pid = ?pid, timeout_secs = spec.timeout.as_secs_f64(), "process started");

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let readers = [
            child.stdout.take().map(|out| collect(out, Arc::clone(&stdout))),
            child.stderr.take().map(|err| collect(err, Arc::clone(&stderr))),
        ];

        let finish = tokio::select! {
            status = child.wait() => Finish::Exited(status),
            () = tokio::time::sleep(spec.timeout) => Finish::TimedOut,
            _ = &mut kill_rx => Finish::Killed,
        };
        drop(registration);

        let (termination, exit_code, error) = match finish {
            Finish::Exited(Ok(status)) => (Termination::Exited, status.code(), None),
            Finish::Exited(Err(e)) => (
                Termination::Exited,
                None,
                Some(format!("failed to wait for {}: {e}", spec.label)),
            ),
            Finish::TimedOut => {
                tracing::warn!(label = %spec.label, timeout_secs = spec.timeout.as_secs_f64(), "process timed out, killing");
                reap(&mut child, &spec.label, pid).await;
                (Termination::TimedOut, None, None)
            }
            Finish::Killed => {
                reap(&mut child, &spec.label, pid).await;
                (Termination::Killed, None, None)
            }
        };

        for reader in readers.into_iter().flatten() {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
                abort.abort();
            }
        }

        let stdout = String::from_utf8_lossy(&stdout.lock()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr.lock()).into_owned();

        ProcessOutput {
            termination,
            exit_code,
            stdout,
            stderr,
            error,
            duration: started.elapsed(),
        }
    }

    fn kill_all(&self) -> usize {
        self.registry.kill_all()
    }

    fn live_count(&self) -> usize {
        self.registry.len()
    }
}

/// Kill `child` and wait a bounded time for it to be reaped.
async fn reap(child: &mut Child, label: &str, pid: Option<u32>) {
    let _ = child.start_kill();
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        tracing::error!(label = %label, pid = ?pid, "killed process was not reaped");
    }
}

/// Append everything read from `stream` into `buf` as it arrives.
fn collect<R>(mut stream: R, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.lock().extend_from_slice(&chunk[..n]),
            }
        }
    })
}
