//! Configuration management for agent-host.

mod profile;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::python::{ProvisionTimeouts, ProvisionerSettings};
use crate::core::supervisor::SpawnTimeouts;
use crate::core::types::SpawnPurpose;

pub use profile::{ConfigProfileSource, DEFAULT_PROFILE_NAME, ProfileConfig};

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Python runtime provisioning.
    pub python: PythonConfig,

    /// Subprocess budgets, in seconds.
    pub timeouts: TimeoutConfig,

    /// Search path enrichment.
    pub augment: AugmentConfig,

    /// Optional API profile. Absent means OAuth mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileConfig>,
}

impl Config {
    /// Load configuration from the default paths.
    ///
    /// Loads global config first, then merges project-local config if present.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file cannot be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        let project = Self::project_config_path().ok();
        Self::load_from(&Self::config_path()?, project.as_deref())
    }

    /// Load `global`, then merge `project` over it. Missing files are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_from(global: &Path, project: Option<&Path>) -> anyhow::Result<Self> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        for path in std::iter::once(global).chain(project) {
            if !path.exists() {
                continue;
            }
            let contents = std::fs::read_to_string(path)?;
            let value: toml::Value = toml::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
            tracing::debug!(path = %path.display(), "loaded config file");
            merge_values(&mut merged, value);
        }

        Ok(Self::deserialize(merged)?)
    }

    /// Get the project-local configuration file path.
    ///
    /// Looks for `.agent-host/config.toml` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn project_config_path() -> anyhow::Result<PathBuf> {
        let cwd = std::env::current_dir()?;
        Ok(cwd.join(".agent-host").join("config.toml"))
    }

    /// Get the configuration file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Get the config directory path (`~/.config/agent-host/`).
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined.
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(xdg_config_home).join("agent-host"));
        }

        if cfg!(target_os = "macos") {
            if let Ok(home) = std::env::var("HOME") {
                return Ok(PathBuf::from(home).join(".config").join("agent-host"));
            }
        }

        let base = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;

        Ok(base.config_dir().join("agent-host"))
    }

    /// Provisioner parameters from the `[python]`, `[timeouts]` and
    /// `[augment]` sections.
    #[must_use]
    pub fn provisioner_settings(&self) -> ProvisionerSettings {
        ProvisionerSettings {
            venv_dir: self.python.venv_dir.clone(),
            requirements_file: self.python.requirements_file.clone(),
            bundled_dir: self.python.bundled_dir.clone(),
            bundled_marker: self.python.bundled_marker.clone(),
            system_python: self.python.system_python.clone(),
            core_packages: self.python.core_packages.clone(),
            memory_packages: self.python.memory_packages.clone(),
            extra_paths: self.augment.extra_paths.clone(),
            timeouts: self.timeouts.provisioning(),
        }
    }

    /// Supervisor budgets from the `[timeouts]` section.
    #[must_use]
    pub const fn spawn_timeouts(&self) -> SpawnTimeouts {
        self.timeouts.spawning()
    }
}

/// Deep-merge `overlay` into `base`. Tables merge key by key; anything else
/// is replaced.
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Python runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonConfig {
    /// Virtual environment directory, relative to the backend source.
    pub venv_dir: String,

    /// Dependency manifest, relative to the backend source.
    pub requirements_file: String,

    /// Distribution resources containing a bundled runtime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundled_dir: Option<PathBuf>,

    /// Interpreter used to build the venv. Searched on PATH when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_python: Option<PathBuf>,

    /// Packages that must import in every runtime.
    pub core_packages: Vec<String>,

    /// Graph-memory packages, checked on Python 3.12+.
    pub memory_packages: Vec<String>,

    /// File marking a bundled package directory as complete.
    pub bundled_marker: String,
}

impl Default for PythonConfig {
    fn default() -> Self {
        let settings = ProvisionerSettings::default();
        Self {
            venv_dir: settings.venv_dir,
            requirements_file: settings.requirements_file,
            bundled_dir: None,
            system_python: None,
            core_packages: settings.core_packages,
            memory_packages: settings.memory_packages,
            bundled_marker: settings.bundled_marker,
        }
    }
}

/// Timeout budgets in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub venv_create: u64,
    pub dependency_check: u64,
    pub installer_bootstrap: u64,
    pub dependency_install: u64,
    pub support_tool: u64,
    pub title_generation: u64,
    pub download: u64,
    pub agent_run: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            venv_create: 120,
            dependency_check: 30,
            installer_bootstrap: 120,
            dependency_install: 600,
            support_tool: 10,
            title_generation: 60,
            download: 600,
            agent_run: 7200,
        }
    }
}

impl TimeoutConfig {
    /// Budget for a spawn of `purpose`.
    #[must_use]
    pub const fn for_purpose(&self, purpose: SpawnPurpose) -> Duration {
        self.spawning().for_purpose(purpose)
    }

    #[must_use]
    pub const fn provisioning(&self) -> ProvisionTimeouts {
        ProvisionTimeouts {
            venv_create: Duration::from_secs(self.venv_create),
            dependency_check: Duration::from_secs(self.dependency_check),
            installer_bootstrap: Duration::from_secs(self.installer_bootstrap),
            dependency_install: Duration::from_secs(self.dependency_install),
        }
    }

    #[must_use]
    pub const fn spawning(&self) -> SpawnTimeouts {
        SpawnTimeouts {
            support_tool: Duration::from_secs(self.support_tool),
            title_generation: Duration::from_secs(self.title_generation),
            download: Duration::from_secs(self.download),
            agent_run: Duration::from_secs(self.agent_run),
        }
    }
}

/// Search path enrichment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Directories prepended before the well-known install locations.
    pub extra_paths: Vec<PathBuf>,
}
