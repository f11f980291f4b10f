//! Value objects exchanged between the runtime components.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable map.
///
/// Ordered so composed environments print and compare deterministically.
pub type EnvMap = BTreeMap<String, String>;

/// Snapshot of the Python runtime produced by a single readiness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    /// Whether an interpreter and package path are usable.
    pub ready: bool,
    /// Interpreter to launch the backend with.
    pub interpreter_path: Option<PathBuf>,
    /// Directory exported as the package search path.
    pub package_path: Option<PathBuf>,
    /// Packages come from the distribution bundle rather than a venv.
    pub using_bundled_packages: bool,
    /// A virtual environment exists for the source path.
    pub virtual_env_present: bool,
    /// Required packages import cleanly.
    pub dependencies_installed: bool,
    /// Human-readable failure, set only when `ready` is false.
    pub error: Option<String>,
}

impl RuntimeStatus {
    /// Status reported before any provisioning attempt.
    #[must_use]
    pub const fn uninitialized() -> Self {
        Self {
            ready: false,
            interpreter_path: None,
            package_path: None,
            using_bundled_packages: false,
            virtual_env_present: false,
            dependencies_installed: false,
            error: None,
        }
    }
}

/// Why a subprocess is being spawned. Selects the timeout budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpawnPurpose {
    /// Long-running agent backend invocation.
    AgentRun,
    /// Single-shot generation such as a task title.
    TitleGeneration,
    /// Short helper invocation (version probes, detection).
    SupportTool,
    /// Bulk package or model download.
    Download,
}

impl SpawnPurpose {
    /// Purposes that execute the Python backend and need a provisioned runtime.
    #[must_use]
    pub const fn requires_runtime(self) -> bool {
        matches!(self, Self::AgentRun | Self::TitleGeneration)
    }
}

impl fmt::Display for SpawnPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AgentRun => "agent-run",
            Self::TitleGeneration => "title-generation",
            Self::SupportTool => "support-tool",
            Self::Download => "download",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for SpawnPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent-run" => Ok(Self::AgentRun),
            "title-generation" => Ok(Self::TitleGeneration),
            "support-tool" => Ok(Self::SupportTool),
            "download" => Ok(Self::Download),
            other => Err(format!("unknown spawn purpose: {other}")),
        }
    }
}

/// One subprocess invocation. Consumed by the supervisor.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Caller-chosen identifier, used in logs.
    pub id: String,
    /// Working directory for the child.
    pub working_directory: PathBuf,
    /// Program to run. Empty means the provisioned interpreter.
    pub executable: String,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
    /// Caller overrides merged into the composed environment.
    pub extra_env: EnvMap,
    /// Selects timeout budget and runtime gating.
    pub purpose: SpawnPurpose,
    /// Replaces the purpose budget when set.
    pub timeout: Option<Duration>,
}

impl SpawnRequest {
    /// Create a request with a generated id.
    #[must_use]
    pub fn new(
        purpose: SpawnPurpose,
        working_directory: impl Into<PathBuf>,
        executable: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            working_directory: working_directory.into(),
            executable: executable.into(),
            args,
            extra_env: EnvMap::new(),
            purpose,
            timeout: None,
        }
    }

    /// Agent backend run using the provisioned interpreter.
    #[must_use]
    pub fn agent_run(working_directory: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self::new(SpawnPurpose::AgentRun, working_directory, String::new(), args)
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Terminal result of a [`SpawnRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOutcome {
    /// Exit code when the child exited normally.
    pub exit_code: Option<i32>,
    /// The child was killed because its budget ran out.
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    /// Set when the child never started or was not allowed to start.
    pub error: Option<String>,
    /// Wall time from spawn to finalization.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl SpawnOutcome {
    /// Outcome for a request that never reached process creation.
    #[must_use]
    pub fn not_started(error: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            timed_out: false,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.into()),
            duration: Duration::ZERO,
        }
    }

    /// Exited with status zero and no supervisor-level error.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.timed_out && self.exit_code == Some(0)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}
