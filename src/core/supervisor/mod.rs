//! Subprocess supervision for the agent backend and its helpers.
//!
//! Every spawn goes through the same pipeline: gate on the Python runtime
//! when the purpose needs it, compose the environment, resolve the program,
//! then run it under the purpose's timeout budget. Outcomes are data; the
//! supervisor never interprets exit codes or output.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::augment::EnvAugmenter;
use crate::core::compose::{ComposeRequest, ComposedEnv, CredentialKey, EnvComposer};
use crate::core::process::{CommandRunner, ProcessOutput, ProcessRunner, ProcessSpec, Termination};
use crate::core::python::Provisioner;
use crate::core::secret::{describe, mask_secrets};
use crate::core::types::{EnvMap, SpawnOutcome, SpawnPurpose, SpawnRequest};

/// Longest stderr excerpt that reaches a log line.
const STDERR_LOG_LIMIT: usize = 500;

/// Per-purpose timeout budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnTimeouts {
    pub support_tool: Duration,
    pub title_generation: Duration,
    pub download: Duration,
    pub agent_run: Duration,
}

impl Default for SpawnTimeouts {
    fn default() -> Self {
        Self {
            support_tool: Duration::from_secs(10),
            title_generation: Duration::from_secs(60),
            download: Duration::from_secs(600),
            agent_run: Duration::from_secs(7200),
        }
    }
}

impl SpawnTimeouts {
    #[must_use]
    pub const fn for_purpose(&self, purpose: SpawnPurpose) -> Duration {
        match purpose {
            SpawnPurpose::SupportTool => self.support_tool,
            SpawnPurpose::TitleGeneration => self.title_generation,
            SpawnPurpose::Download => self.download,
            SpawnPurpose::AgentRun => self.agent_run,
        }
    }
}

/// Runs children on behalf of the host and tracks them until they finish.
pub struct Supervisor {
    provisioner: Provisioner,
    composer: EnvComposer,
    augmenter: EnvAugmenter,
    runner: Arc<dyn CommandRunner>,
    timeouts: SpawnTimeouts,
    source_path: PathBuf,
    extra_paths: Vec<PathBuf>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("source_path", &self.source_path)
            .field("timeouts", &self.timeouts)
            .field("live", &self.runner.live_count())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Supervisor for the backend at `source_path`, running real processes.
    #[must_use]
    pub fn new(provisioner: Provisioner, composer: EnvComposer, source_path: impl Into<PathBuf>) -> Self {
        Self {
            provisioner,
            composer,
            augmenter: EnvAugmenter::for_host(),
            runner: Arc::new(ProcessRunner::new()),
            timeouts: SpawnTimeouts::default(),
            source_path: source_path.into(),
            extra_paths: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    #[must_use]
    pub fn with_augmenter(mut self, augmenter: EnvAugmenter) -> Self {
        self.augmenter = augmenter;
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: SpawnTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Directories prepended to the child search path ahead of the
    /// well-known ones.
    #[must_use]
    pub fn with_extra_paths(mut self, extra_paths: Vec<PathBuf>) -> Self {
        self.extra_paths = extra_paths;
        self
    }

    #[must_use]
    pub const fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    #[must_use]
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Compose the environment a child would receive.
    ///
    /// `overrides` are the caller's extra variables.
    pub async fn compose_env(&self, overrides: EnvMap) -> ComposedEnv {
        let base = self.augmenter.augmented_process_env(&self.extra_paths);
        self.composer
            .compose(ComposeRequest {
                base,
                python: self.provisioner.python_layer(),
                dotenv_path: Some(self.source_path.join(".env")),
                overrides,
                source_dir: Some(self.source_path.clone()),
            })
            .await
    }

    /// Run one request to completion.
    ///
    /// Purposes that execute the backend first make sure the runtime is
    /// ready; when it is not, the provisioning error is returned and no
    /// process is created.
    pub async fn spawn(&self, request: SpawnRequest) -> SpawnOutcome {
        let SpawnRequest {
            id,
            working_directory,
            executable,
            args,
            extra_env,
            purpose,
            timeout,
        } = request;

        let interpreter = if purpose.requires_runtime() {
            let status = self.provisioner.ensure_ready(&self.source_path).await;
            if !status.ready {
                let error = status
                    .error
                    .clone()
                    .unwrap_or_else(|| "Python runtime is not ready".to_string());
                tracing::warn!(id = %id, purpose = %purpose, error = %error, "spawn refused, runtime not ready");
                return SpawnOutcome::not_started(error);
            }
            status.interpreter_path.clone()
        } else {
            self.provisioner.status().interpreter_path.clone()
        };

        let env = self.compose_env(extra_env).await;
        log_credentials(&id, &env);

        let program = match resolve_program(&self.augmenter, &executable, interpreter.as_deref(), &env) {
            Ok(program) => program,
            Err(error) => {
                tracing::warn!(id = %id, purpose = %purpose, error = %error, "spawn refused");
                return SpawnOutcome::not_started(error);
            }
        };

        let timeout = timeout.unwrap_or_else(|| self.timeouts.for_purpose(purpose));
        tracing::info!(
            id = %id,
            purpose = %purpose,
            program = %program.display(),
            cwd = %working_directory.display(),
            timeout_secs = timeout.as_secs_f64(),
            "spawning process"
        );

        let output = self
            .runner
            .run(
                ProcessSpec::new(format!("{purpose}:{id}"), program, timeout)
                    .args(args)
                    .cwd(working_directory)
                    .env(env.into_vars()),
            )
            .await;

        log_output(&id, purpose, &output);
        outcome(output)
    }

    /// Kill every child still running. Safe with nothing in flight.
    pub fn kill_all(&self) -> usize {
        let killed = self.runner.kill_all();
        if killed > 0 {
            tracing::info!(killed, "killed supervised processes");
        }
        killed
    }

    /// Number of children currently running.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.runner.live_count()
    }

    /// Host shutdown: kill supervised children and provisioning steps.
    pub fn shutdown(&self) {
        let supervised = self.kill_all();
        let provisioning = self.provisioner.cleanup();
        tracing::debug!(supervised, provisioning, "supervisor shut down");
    }
}

/// Pick the program to run.
///
/// Empty means the provisioned interpreter; a bare name is looked up on the
/// composed search path; anything with a separator is used as given.
fn resolve_program(
    augmenter: &EnvAugmenter,
    executable: &str,
    interpreter: Option<&Path>,
    env: &ComposedEnv,
) -> Result<PathBuf, String> {
    if executable.is_empty() {
        return interpreter
            .map(Path::to_path_buf)
            .ok_or_else(|| "no executable given and the Python runtime is not ready".to_string());
    }

    let candidate = Path::new(executable);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return Ok(candidate.to_path_buf());
    }

    Ok(augmenter
        .find_executable_in(executable, env.vars())
        .unwrap_or_else(|| candidate.to_path_buf()))
}

fn log_credentials(id: &str, env: &ComposedEnv) {
    for key in CredentialKey::ALL.iter().filter(|key| key.is_secret()) {
        let name = key.env_name();
        tracing::debug!(
            id = %id,
            key = name,
            value = %describe(env.get(name)),
            origin = ?env.origin(name),
            "credential"
        );
    }
}

fn log_output(id: &str, purpose: SpawnPurpose, output: &ProcessOutput) {
    let elapsed_ms = u64::try_from(output.duration.as_millis()).unwrap_or(u64::MAX);
    match output.termination {
        Termination::Exited if output.success() => {
            tracing::info!(id = %id, purpose = %purpose, elapsed_ms, "process exited");
        }
        Termination::Exited => {
            let stderr = tail(&output.stderr, STDERR_LOG_LIMIT);
            tracing::warn!(
                id = %id,
                purpose = %purpose,
                exit_code = ?output.exit_code,
                elapsed_ms,
                stderr = %mask_secrets(stderr),
                "process exited unsuccessfully"
            );
        }
        Termination::TimedOut => {
            tracing::warn!(id = %id, purpose = %purpose, elapsed_ms, "process timed out");
        }
        Termination::Killed => {
            tracing::info!(id = %id, purpose = %purpose, elapsed_ms, "process killed");
        }
        Termination::NotStarted => {
            tracing::warn!(id = %id, purpose = %purpose, error = ?output.error, "process did not start");
        }
    }
}

/// Last `limit` bytes of `text`, on a char boundary.
fn tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn outcome(output: ProcessOutput) -> SpawnOutcome {
    let error = match output.termination {
        Termination::Killed => Some("process was killed".to_string()),
        _ => output.error,
    };
    SpawnOutcome {
        exit_code: output.exit_code,
        timed_out: output.termination == Termination::TimedOut,
        stdout: output.stdout,
        stderr: output.stderr,
        error,
        duration: output.duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purposes_have_distinct_budgets() {
        let timeouts = SpawnTimeouts::default();
        assert!(
            timeouts.for_purpose(SpawnPurpose::SupportTool)
                < timeouts.for_purpose(SpawnPurpose::TitleGeneration)
        );
        assert!(
            timeouts.for_purpose(SpawnPurpose::TitleGeneration)
                < timeouts.for_purpose(SpawnPurpose::Download)
        );
        assert_eq!(
            timeouts.for_purpose(SpawnPurpose::AgentRun),
            Duration::from_secs(7200)
        );
    }

    #[test]
    fn empty_executable_means_interpreter() {
        let augmenter = EnvAugmenter::with_candidates(Vec::<String>::new(), false);
        let env = ComposedEnv::default();

        let program =
            resolve_program(&augmenter, "", Some(Path::new("/venv/bin/python")), &env).unwrap();
        assert_eq!(program, PathBuf::from("/venv/bin/python"));

        let error = resolve_program(&augmenter, "", None, &env).unwrap_err();
        assert!(error.contains("not ready"));
    }

    #[test]
    fn explicit_paths_are_used_as_given() {
        let augmenter = EnvAugmenter::with_candidates(Vec::<String>::new(), false);
        let program =
            resolve_program(&augmenter, "./scripts/tool", None, &ComposedEnv::default()).unwrap();
        assert_eq!(program, PathBuf::from("./scripts/tool"));
    }

    #[cfg(unix)]
    #[test]
    fn bare_names_resolve_on_composed_path() {
        let temp = tempfile::tempdir().unwrap();
        let tool = temp.path().join("mytool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let augmenter = EnvAugmenter::with_candidates(Vec::<String>::new(), false);
        let input = crate::core::compose::CompositionInput {
            base: EnvMap::from([(
                "PATH".to_string(),
                temp.path().to_string_lossy().into_owned(),
            )]),
            ..Default::default()
        };
        let env = crate::core::compose::compose_layers(&input, false);

        assert_eq!(resolve_program(&augmenter, "mytool", None, &env).unwrap(), tool);
        assert_eq!(
            resolve_program(&augmenter, "not-a-tool-xyz", None, &env).unwrap(),
            PathBuf::from("not-a-tool-xyz")
        );
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("aé", 1), "");
    }

    #[test]
    fn killed_process_reports_error() {
        let output = ProcessOutput {
            termination: Termination::Killed,
            exit_code: None,
            stdout: "partial".to_string(),
            stderr: String::new(),
            error: None,
            duration: Duration::from_millis(5),
        };
        let outcome = outcome(output);
        assert_eq!(outcome.error.as_deref(), Some("process was killed"));
        assert_eq!(outcome.stdout, "partial");
        assert!(!outcome.timed_out);
    }
}
