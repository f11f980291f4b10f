//! Python runtime provisioning.
//!
//! Guarantees an interpreter plus package path for the agent backend, either
//! from a bundled distribution runtime or from a virtual environment built
//! and validated on demand.
//!
//! Lifecycle: `Uninitialized -> Initializing -> Ready | Failed`. Failed is
//! retriable by calling [`Provisioner::ensure_ready`] again; nothing here
//! retries on its own.

pub mod layout;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::core::augment::{EnvAugmenter, process_env};
use crate::core::process::{CommandRunner, ProcessOutput, ProcessRunner, ProcessSpec};
use crate::core::types::{EnvMap, RuntimeStatus};

/// Variable that redirects the interpreter to another installation.
const INTERPRETER_REDIRECT_VAR: &str = "PYTHONHOME";

/// Flags every provisioned Python invocation gets.
const PYTHON_ENV_FLAGS: &[(&str, &str)] = &[
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("PYTHONIOENCODING", "utf-8"),
    ("PYTHONNOUSERSITE", "1"),
];

/// First version whose venv must provide the graph-memory packages.
const MEMORY_MIN_VERSION: (u32, u32) = (3, 12);

/// Broadcast capacity for progress events.
const EVENT_CAPACITY: usize = 64;

/// Provisioning failures. Rendered into [`RuntimeStatus::error`].
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// No system interpreter to build the venv from.
    #[error("Python not found. Install Python 3.10+ and make sure it is on PATH")]
    SystemPythonNotFound,

    /// Venv creation exited unsuccessfully.
    #[error("failed to create virtual environment: {0}")]
    VenvCreate(String),

    /// Venv creation exceeded its budget.
    #[error("virtual environment creation timed out after {0}s")]
    VenvTimeout(u64),

    /// The interpreter is missing after venv creation.
    #[error("virtual environment interpreter missing at {}", .0.display())]
    VenvInterpreterMissing(PathBuf),

    /// The package installer could not be bootstrapped.
    #[error("failed to bootstrap pip: {0}")]
    InstallerBootstrap(String),

    /// No dependency manifest to install from.
    #[error("dependency manifest not found at {}", .0.display())]
    ManifestMissing(PathBuf),

    /// Installing the manifest failed.
    #[error("failed to install dependencies: {0}")]
    DependencyInstall(String),

    /// A step other than venv creation ran out of time.
    #[error("{step} timed out after {secs}s")]
    StepTimeout { step: &'static str, secs: u64 },

    /// The venv has no discoverable package directory.
    #[error("site-packages not found in {}", .0.display())]
    SitePackagesMissing(PathBuf),
}

/// Progress notifications.
///
/// Status events always precede the terminal `Ready`/`Failed` event, which
/// precedes resolution of the `ensure_ready` future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionEvent {
    Status(String),
    Ready,
    Failed(String),
}

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Timeouts for provisioning subprocesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionTimeouts {
    pub venv_create: Duration,
    pub dependency_check: Duration,
    pub installer_bootstrap: Duration,
    pub dependency_install: Duration,
}

impl Default for ProvisionTimeouts {
    fn default() -> Self {
        Self {
            venv_create: Duration::from_secs(120),
            dependency_check: Duration::from_secs(30),
            installer_bootstrap: Duration::from_secs(120),
            dependency_install: Duration::from_secs(600),
        }
    }
}

/// Static provisioning parameters.
#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    /// Venv directory name, relative to the source path.
    pub venv_dir: String,
    /// Dependency manifest, relative to the source path.
    pub requirements_file: String,
    /// Distribution resources holding a bundled runtime.
    pub bundled_dir: Option<PathBuf>,
    /// Marker file that vouches for a bundled package directory.
    pub bundled_marker: String,
    /// Explicit system interpreter used to build the venv.
    pub system_python: Option<PathBuf>,
    /// Packages every runtime must import.
    pub core_packages: Vec<String>,
    /// Graph-memory packages, required from Python 3.12 on.
    pub memory_packages: Vec<String>,
    /// Extra search path entries for locating the system interpreter.
    pub extra_paths: Vec<PathBuf>,
    pub timeouts: ProvisionTimeouts,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            venv_dir: ".venv".to_string(),
            requirements_file: "requirements.txt".to_string(),
            bundled_dir: None,
            bundled_marker: ".bundled".to_string(),
            system_python: None,
            core_packages: vec!["claude_agent_sdk".to_string(), "dotenv".to_string()],
            memory_packages: vec!["real_ladybug".to_string(), "graphiti_core".to_string()],
            extra_paths: Vec::new(),
            timeouts: ProvisionTimeouts::default(),
        }
    }
}

type InFlight = Shared<BoxFuture<'static, Arc<RuntimeStatus>>>;

struct State {
    phase: Phase,
    source_path: Option<PathBuf>,
    interpreter_path: Option<PathBuf>,
    package_path: Option<PathBuf>,
    using_bundled: bool,
    in_flight: Option<InFlight>,
    last_status: Arc<RuntimeStatus>,
}

struct Inner {
    settings: ProvisionerSettings,
    runner: Arc<dyn CommandRunner>,
    augmenter: EnvAugmenter,
    state: Mutex<State>,
    events: broadcast::Sender<ProvisionEvent>,
}

/// Successful provisioning result.
struct Provisioned {
    interpreter: PathBuf,
    package_path: PathBuf,
    bundled: bool,
}

/// Single-flight provisioner for one backend source path at a time.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Provisioner {
    inner: Arc<Inner>,
}

impl fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Provisioner")
            .field("phase", &state.phase)
            .field("source_path", &state.source_path)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    /// Provisioner running real processes.
    #[must_use]
    pub fn new(settings: ProvisionerSettings) -> Self {
        Self::with_runner(settings, Arc::new(ProcessRunner::new()))
    }

    /// Provisioner running its subprocesses through `runner`.
    #[must_use]
    pub fn with_runner(settings: ProvisionerSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_parts(settings, runner, EnvAugmenter::for_host())
    }

    /// Provisioner with an explicit runner and executable search.
    #[must_use]
    pub fn with_parts(
        settings: ProvisionerSettings,
        runner: Arc<dyn CommandRunner>,
        augmenter: EnvAugmenter,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                settings,
                runner,
                augmenter,
                state: Mutex::new(State {
                    phase: Phase::Uninitialized,
                    source_path: None,
                    interpreter_path: None,
                    package_path: None,
                    using_bundled: false,
                    in_flight: None,
                    last_status: Arc::new(RuntimeStatus::uninitialized()),
                }),
                events,
            }),
        }
    }

    /// Subscribe to progress events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProvisionEvent> {
        self.inner.events.subscribe()
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    /// Last produced status. Does no work.
    #[must_use]
    pub fn status(&self) -> Arc<RuntimeStatus> {
        Arc::clone(&self.inner.state.lock().last_status)
    }

    /// Make sure the runtime for `source_path` is ready.
    ///
    /// Concurrent callers share one provisioning sequence, which runs on its
    /// own task and finishes even if every caller stops waiting. Once ready
    /// for the same source path the cached status is returned without any
    /// work; a different source path provisions again. Failures are reported
    /// in the returned status, never raised.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn ensure_ready(&self, source_path: &Path) -> Arc<RuntimeStatus> {
        let in_flight = {
            let mut state = self.inner.state.lock();

            if let Some(in_flight) = &state.in_flight {
                tracing::debug!("provisioning already in flight, joining");
                in_flight.clone()
            } else if state.phase == Phase::Ready
                && state.source_path.as_deref() == Some(source_path)
            {
                return Arc::clone(&state.last_status);
            } else {
                tracing::info!(source = %source_path.display(), previous = %state.phase, "provisioning python runtime");
                if state.source_path.as_deref() != Some(source_path) {
                    // Paths found for another source must not leak into this one
                    state.interpreter_path = None;
                    state.package_path = None;
                    state.using_bundled = false;
                }
                state.phase = Phase::Initializing;
                state.source_path = Some(source_path.to_path_buf());

                // The task owns the work; callers only wait for its result
                let task =
                    tokio::spawn(Arc::clone(&self.inner).provision(source_path.to_path_buf()));
                let inner = Arc::clone(&self.inner);
                let in_flight: InFlight = async move {
                    match task.await {
                        Ok(status) => status,
                        Err(e) => inner.abandon(&e),
                    }
                }
                .boxed()
                .shared();
                state.in_flight = Some(in_flight.clone());
                in_flight
            }
        };

        in_flight.await
    }

    /// Environment for a provisioned Python child.
    ///
    /// `base` with the interpreter redirect removed, fixed flags added, and
    /// the package path when known. Pure: safe before `ensure_ready`.
    #[must_use]
    pub fn python_env(&self, base: &EnvMap) -> EnvMap {
        let mut env = strip_interpreter_redirect(base);
        env.extend(self.python_layer());
        env
    }

    /// Only the variables provisioning contributes.
    #[must_use]
    pub fn python_layer(&self) -> EnvMap {
        let mut env: EnvMap = PYTHON_ENV_FLAGS
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        if let Some(package_path) = &self.inner.state.lock().package_path {
            env.insert(
                "PYTHONPATH".to_string(),
                package_path.to_string_lossy().into_owned(),
            );
        }
        env
    }

    /// Source path of the current or last provisioning attempt.
    #[must_use]
    pub fn source_path(&self) -> Option<PathBuf> {
        self.inner.state.lock().source_path.clone()
    }

    /// Kill provisioning subprocesses still running. Idempotent.
    pub fn cleanup(&self) -> usize {
        let killed = self.inner.runner.kill_all();
        if killed > 0 {
            tracing::info!(killed, "killed provisioning processes");
        }
        killed
    }
}

/// Absolute form of a backend source directory.
///
/// # Errors
///
/// Returns an error if the path cannot be made absolute or is not a directory.
pub fn resolve_source_path(path: &Path) -> crate::core::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    if !absolute.is_dir() {
        return Err(crate::core::Error::InvalidSourcePath(absolute));
    }
    Ok(absolute)
}

/// Remove the interpreter redirect variable, whatever its case.
#[must_use]
pub fn strip_interpreter_redirect(base: &EnvMap) -> EnvMap {
    base.iter()
        .filter(|(key, _)| !key.eq_ignore_ascii_case(INTERPRETER_REDIRECT_VAR))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl Inner {
    fn emit(&self, event: ProvisionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn status(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(status = %message, "provisioning");
        self.emit(ProvisionEvent::Status(message));
    }

    async fn provision(self: Arc<Self>, source: PathBuf) -> Arc<RuntimeStatus> {
        let result = match self.try_bundled() {
            Some(bundled) => Ok(bundled),
            None => self.provision_venv(&source).await,
        };

        let venv_present =
            layout::venv_interpreter(&source.join(&self.settings.venv_dir)).exists();

        let status = {
            let mut state = self.state.lock();
            state.in_flight = None;

            let status = match result {
                Ok(provisioned) => {
                    state.phase = Phase::Ready;
                    state.interpreter_path = Some(provisioned.interpreter.clone());
                    state.package_path = Some(provisioned.package_path.clone());
                    state.using_bundled = provisioned.bundled;
                    RuntimeStatus {
                        ready: true,
                        interpreter_path: Some(provisioned.interpreter),
                        package_path: Some(provisioned.package_path),
                        using_bundled_packages: provisioned.bundled,
                        virtual_env_present: !provisioned.bundled,
                        dependencies_installed: true,
                        error: None,
                    }
                }
                Err(e) => {
                    state.phase = Phase::Failed;
                    RuntimeStatus {
                        ready: false,
                        interpreter_path: state.interpreter_path.clone(),
                        package_path: state.package_path.clone(),
                        using_bundled_packages: state.using_bundled,
                        virtual_env_present: venv_present,
                        dependencies_installed: false,
                        error: Some(e.to_string()),
                    }
                }
            };

            let status = Arc::new(status);
            state.last_status = Arc::clone(&status);
            status
        };

        match &status.error {
            None => {
                tracing::info!(
                    interpreter = ?status.interpreter_path,
                    bundled = status.using_bundled_packages,
                    "python runtime ready"
                );
                self.emit(ProvisionEvent::Ready);
            }
            Some(error) => {
                tracing::error!(error = %error, "python runtime provisioning failed");
                self.emit(ProvisionEvent::Failed(error.clone()));
            }
        }

        status
    }

    /// Record a provisioning task that died without producing a status.
    fn abandon(&self, error: &tokio::task::JoinError) -> Arc<RuntimeStatus> {
        let message = format!("provisioning task failed: {error}");
        let status = {
            let mut state = self.state.lock();
            state.in_flight = None;
            state.phase = Phase::Failed;
            let status = Arc::new(RuntimeStatus {
                ready: false,
                interpreter_path: state.interpreter_path.clone(),
                package_path: state.package_path.clone(),
                using_bundled_packages: state.using_bundled,
                virtual_env_present: false,
                dependencies_installed: false,
                error: Some(message.clone()),
            });
            state.last_status = Arc::clone(&status);
            status
        };
        tracing::error!(error = %message, "python runtime provisioning aborted");
        self.emit(ProvisionEvent::Failed(message));
        status
    }

    fn try_bundled(&self) -> Option<Provisioned> {
        let root = self.settings.bundled_dir.as_deref()?;
        let bundled = layout::detect_bundled(
            root,
            &self.settings.bundled_marker,
            &self.settings.core_packages,
        )?;
        self.status("Using bundled Python runtime");
        Some(Provisioned {
            interpreter: bundled.interpreter,
            package_path: bundled.site_packages,
            bundled: true,
        })
    }

    async fn provision_venv(&self, source: &Path) -> Result<Provisioned, ProvisionError> {
        let venv_dir = source.join(&self.settings.venv_dir);
        let interpreter = layout::venv_interpreter(&venv_dir);
        let env = self.child_env();

        if !interpreter.exists() {
            self.create_venv(source, &venv_dir, &env).await?;
            if !interpreter.exists() {
                return Err(ProvisionError::VenvInterpreterMissing(interpreter));
            }
        }

        if !self.dependencies_satisfied(&interpreter, source, &env).await {
            self.install_dependencies(&interpreter, source, &env).await?;
        }

        let package_path = layout::venv_site_packages(&venv_dir)
            .ok_or_else(|| ProvisionError::SitePackagesMissing(venv_dir.clone()))?;

        Ok(Provisioned {
            interpreter,
            package_path,
            bundled: false,
        })
    }

    /// Environment for provisioning subprocesses.
    fn child_env(&self) -> EnvMap {
        let base = self
            .augmenter
            .augment(&process_env(), &self.settings.extra_paths);
        let mut env = strip_interpreter_redirect(&base);
        env.extend(
            PYTHON_ENV_FLAGS
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string())),
        );
        env
    }

    fn find_system_python(&self, env: &EnvMap) -> Option<PathBuf> {
        if let Some(explicit) = &self.settings.system_python {
            return Some(explicit.clone());
        }
        layout::system_interpreter_names()
            .iter()
            .find_map(|name| self.augmenter.find_executable_in(name, env))
    }

    async fn create_venv(
        &self,
        source: &Path,
        venv_dir: &Path,
        env: &EnvMap,
    ) -> Result<(), ProvisionError> {
        let python = self
            .find_system_python(env)
            .ok_or(ProvisionError::SystemPythonNotFound)?;
        self.status("Creating Python virtual environment");

        let timeout = self.settings.timeouts.venv_create;
        let output = self
            .runner
            .run(
                ProcessSpec::new("venv-create", python, timeout)
                    .args(["-m".to_string(), "venv".to_string()])
                    .args([venv_dir.to_string_lossy().into_owned()])
                    .cwd(source)
                    .env(env.clone()),
            )
            .await;

        if output.timed_out() {
            return Err(ProvisionError::VenvTimeout(timeout.as_secs()));
        }
        if !output.success() {
            return Err(ProvisionError::VenvCreate(output.diagnostic()));
        }
        Ok(())
    }

    async fn dependencies_satisfied(&self, interpreter: &Path, source: &Path, env: &EnvMap) -> bool {
        self.status("Checking Python dependencies");

        if !self
            .imports_cleanly(interpreter, source, env, &self.settings.core_packages)
            .await
        {
            return false;
        }

        match self.interpreter_version(interpreter, source, env).await {
            Some(version) if version >= MEMORY_MIN_VERSION => {
                self.imports_cleanly(interpreter, source, env, &self.settings.memory_packages)
                    .await
            }
            version => {
                tracing::debug!(?version, "skipping graph-memory dependency check");
                true
            }
        }
    }

    async fn imports_cleanly(
        &self,
        interpreter: &Path,
        source: &Path,
        env: &EnvMap,
        packages: &[String],
    ) -> bool {
        if packages.is_empty() {
            return true;
        }
        let script = format!("import {}", packages.join(", "));
        let output = self
            .run_python(interpreter, source, env, "dependency-check", ["-c".to_string(), script])
            .await;
        if !output.success() {
            tracing::debug!(packages = ?packages, "dependency import failed");
        }
        output.success()
    }

    async fn interpreter_version(
        &self,
        interpreter: &Path,
        source: &Path,
        env: &EnvMap,
    ) -> Option<(u32, u32)> {
        let output = self
            .run_python(interpreter, source, env, "version-check", ["--version".to_string()])
            .await;
        if !output.success() {
            return None;
        }
        // Older interpreters print the version on stderr
        layout::parse_version(&output.stdout).or_else(|| layout::parse_version(&output.stderr))
    }

    async fn run_python<const N: usize>(
        &self,
        interpreter: &Path,
        source: &Path,
        env: &EnvMap,
        label: &str,
        args: [String; N],
    ) -> ProcessOutput {
        self.runner
            .run(
                ProcessSpec::new(label, interpreter, self.settings.timeouts.dependency_check)
                    .args(args)
                    .cwd(source)
                    .env(env.clone()),
            )
            .await
    }

    async fn install_dependencies(
        &self,
        interpreter: &Path,
        source: &Path,
        env: &EnvMap,
    ) -> Result<(), ProvisionError> {
        let manifest = source.join(&self.settings.requirements_file);
        if !manifest.is_file() {
            return Err(ProvisionError::ManifestMissing(manifest));
        }

        self.status("Bootstrapping pip");
        let timeouts = self.settings.timeouts;
        let output = self
            .runner
            .run(
                ProcessSpec::new("pip-bootstrap", interpreter, timeouts.installer_bootstrap)
                    .args(["-m", "ensurepip", "--upgrade"])
                    .cwd(source)
                    .env(env.clone()),
            )
            .await;
        if output.timed_out() {
            return Err(ProvisionError::StepTimeout {
                step: "pip bootstrap",
                secs: timeouts.installer_bootstrap.as_secs(),
            });
        }
        if !output.success() {
            return Err(ProvisionError::InstallerBootstrap(output.diagnostic()));
        }

        self.status("Installing Python dependencies");
        let output = self
            .runner
            .run(
                ProcessSpec::new("pip-install", interpreter, timeouts.dependency_install)
                    .args(["-m", "pip", "install", "-r"])
                    .args([manifest.to_string_lossy().into_owned()])
                    .cwd(source)
                    .env(env.clone()),
            )
            .await;
        if output.timed_out() {
            return Err(ProvisionError::StepTimeout {
                step: "dependency install",
                secs: timeouts.dependency_install.as_secs(),
            });
        }
        if !output.success() {
            return Err(ProvisionError::DependencyInstall(output.diagnostic()));
        }
        Ok(())
    }
}
