//! Search-path enrichment for GUI-launched processes
//!
//! Desktop launchers start the host with a minimal `PATH`. The augmenter
//! prepends well-known tool install directories that exist on disk and
//! resolves executables against the result. It keeps no state: every call
//! recomputes from the environment it is given.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::core::types::EnvMap;

/// Well-known install locations for the current host.
///
/// `~` expands to the home directory, `%VAR%` to a variable from the base
/// environment. Entries that cannot be expanded are skipped.
#[cfg(target_os = "macos")]
const WELL_KNOWN_DIRS: &[&str] = &[
    "/opt/homebrew/bin",
    "/opt/homebrew/sbin",
    "/usr/local/bin",
    "/usr/local/sbin",
    "~/.local/bin",
    "~/bin",
];

#[cfg(windows)]
const WELL_KNOWN_DIRS: &[&str] = &[
    "%LOCALAPPDATA%\\Programs\\Python\\Launcher",
    "%LOCALAPPDATA%\\Microsoft\\WindowsApps",
    "%ProgramFiles%\\Git\\cmd",
    "%APPDATA%\\npm",
    "~\\.local\\bin",
    "~\\scoop\\shims",
];

#[cfg(not(any(target_os = "macos", windows)))]
const WELL_KNOWN_DIRS: &[&str] = &[
    "/usr/local/bin",
    "/usr/bin",
    "/snap/bin",
    "/home/linuxbrew/.linuxbrew/bin",
    "~/.local/bin",
    "~/bin",
];

/// Whether path comparison on this host ignores case.
pub const HOST_PATHS_CASE_INSENSITIVE: bool = cfg!(windows);

/// Prepends existing tool directories to the search path.
#[derive(Debug, Clone)]
pub struct EnvAugmenter {
    candidates: Vec<String>,
    case_insensitive: bool,
}

impl Default for EnvAugmenter {
    fn default() -> Self {
        Self::for_host()
    }
}

impl EnvAugmenter {
    /// Augmenter using this host's well-known directories.
    #[must_use]
    pub fn for_host() -> Self {
        Self {
            candidates: WELL_KNOWN_DIRS.iter().map(|s| (*s).to_string()).collect(),
            case_insensitive: HOST_PATHS_CASE_INSENSITIVE,
        }
    }

    /// Augmenter with an explicit candidate list.
    #[must_use]
    pub fn with_candidates<I, S>(candidates: I, case_insensitive: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
            case_insensitive,
        }
    }

    /// Return `base` with missing, existing tool directories prepended to
    /// its search path.
    ///
    /// `extra_paths` are considered before the well-known directories and
    /// keep their relative order in the result.
    #[must_use]
    pub fn augment(&self, base: &EnvMap, extra_paths: &[PathBuf]) -> EnvMap {
        let mut env = base.clone();
        let key = path_key(&env).unwrap_or_else(|| "PATH".to_string());
        let current: Vec<PathBuf> = env
            .get(&key)
            .map(|value| std::env::split_paths(value).collect())
            .unwrap_or_default();

        let mut prepend: Vec<PathBuf> = Vec::new();
        let expanded = self
            .candidates
            .iter()
            .filter_map(|candidate| expand(candidate, base));

        for dir in extra_paths.iter().cloned().chain(expanded) {
            if !dir.is_dir() {
                continue;
            }
            let seen = current
                .iter()
                .chain(prepend.iter())
                .any(|existing| same_path(existing, &dir, self.case_insensitive));
            if !seen {
                prepend.push(dir);
            }
        }

        if prepend.is_empty() {
            return env;
        }

        tracing::debug!(added = ?prepend, "augmented search path");
        let joined = std::env::join_paths(prepend.into_iter().chain(current))
            .map(|value| value.to_string_lossy().into_owned());
        match joined {
            Ok(value) => {
                env.insert(key, value);
            }
            Err(e) => tracing::warn!(error = %e, "search path contains a separator, left unchanged"),
        }
        env
    }

    /// Augment the current process environment.
    #[must_use]
    pub fn augmented_process_env(&self, extra_paths: &[PathBuf]) -> EnvMap {
        self.augment(&process_env(), extra_paths)
    }

    /// Resolve `name` to an absolute executable path using the search path
    /// of `env`.
    ///
    /// Executable suffixes are probed only on hosts with case-insensitive
    /// paths.
    #[must_use]
    pub fn find_executable_in(&self, name: &str, env: &EnvMap) -> Option<PathBuf> {
        let search: OsString = path_key(env)
            .and_then(|key| env.get(&key))
            .map(OsString::from)?;
        let cwd = std::env::current_dir().ok()?;
        which::which_in(name, Some(search), cwd).ok()
    }

    /// Resolve `name` against the freshly augmented process environment.
    #[must_use]
    pub fn find_executable(&self, name: &str) -> Option<PathBuf> {
        self.find_executable_in(name, &self.augmented_process_env(&[]))
    }
}

/// Snapshot of the current process environment, skipping non-Unicode entries.
#[must_use]
pub fn process_env() -> EnvMap {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

/// Name of the search-path variable as spelled in `env`.
///
/// Windows environments commonly spell it `Path`.
#[must_use]
pub fn path_key(env: &EnvMap) -> Option<String> {
    if env.contains_key("PATH") {
        return Some("PATH".to_string());
    }
    env.keys().find(|k| k.eq_ignore_ascii_case("PATH")).cloned()
}

/// Compare two paths, optionally ignoring case and trailing separators.
#[must_use]
pub fn same_path(a: &Path, b: &Path, case_insensitive: bool) -> bool {
    let a = a.to_string_lossy();
    let b = b.to_string_lossy();
    let a = a.trim_end_matches(['/', '\\']);
    let b = b.trim_end_matches(['/', '\\']);
    if case_insensitive {
        a.to_lowercase() == b.to_lowercase()
    } else {
        a == b
    }
}

/// Expand `~` and `%VAR%` in a candidate directory.
fn expand(candidate: &str, env: &EnvMap) -> Option<PathBuf> {
    let mut out = String::new();

    let rest = if let Some(rest) = candidate.strip_prefix('~') {
        let home = env
            .get("HOME")
            .or_else(|| env.get("USERPROFILE"))
            .map(PathBuf::from)
            .or_else(dirs::home_dir)?;
        out.push_str(&home.to_string_lossy());
        rest
    } else {
        candidate
    };

    let mut parts = rest.split('%');
    if let Some(first) = parts.next() {
        out.push_str(first);
    }
    // Odd segments are variable names
    let mut is_var = true;
    for part in parts {
        if is_var {
            let value = env
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(part))
                .map(|(_, v)| v)?;
            out.push_str(value);
        } else {
            out.push_str(part);
        }
        is_var = !is_var;
    }

    Some(PathBuf::from(out))
}
