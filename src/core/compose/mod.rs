//! Environment composition for spawned children.
//!
//! Every child environment is built from the same ordered layers, lowest
//! precedence first:
//!
//! ```text
//!  1  augmented OS environment   (interpreter redirect stripped)
//!  2  provisioned Python env     (package path, Python flags)
//!  3  project .env file
//!  4  caller overrides
//!  5  OAuth credential clearing  (computed from 7 before merging)
//!  6  ancillary profile env      (non-credential settings)
//!  7  credential profile env
//!  8  interpreter flags          (unbuffered, UTF-8)
//!  9  derived package search path
//! ```
//!
//! Layers are plain maps merged by key overwrite; no layer reads another
//! except the clearing layer, which only inspects the credential profile.

mod credentials;
pub mod dotenv;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::augment::{HOST_PATHS_CASE_INSENSITIVE, same_path};
use crate::core::python::strip_interpreter_redirect;
use crate::core::types::EnvMap;

pub use credentials::{
    CREDENTIAL_PREFIX, CredentialKey, CredentialSource, StaticCredentials, oauth_clear_layer,
    profile_is_active,
};

/// Package search path variable.
pub const PACKAGE_PATH_VAR: &str = "PYTHONPATH";

/// Flags applied last, unconditionally.
const INTERPRETER_FLAGS: &[(&str, &str)] = &[
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONIOENCODING", "utf-8"),
    ("PYTHONUTF8", "1"),
];

/// Which source produced a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayerKind {
    AugmentedOs,
    PythonRuntime,
    ProjectDotenv,
    CallerOverrides,
    CredentialClear,
    AncillaryProfile,
    CredentialProfile,
    InterpreterFlags,
    PackagePath,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AugmentedOs => "os",
            Self::PythonRuntime => "python",
            Self::ProjectDotenv => "dotenv",
            Self::CallerOverrides => "overrides",
            Self::CredentialClear => "credential-clear",
            Self::AncillaryProfile => "profile-ancillary",
            Self::CredentialProfile => "profile",
            Self::InterpreterFlags => "flags",
            Self::PackagePath => "package-path",
        };
        f.write_str(name)
    }
}

/// A named map produced by one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvLayer {
    pub kind: LayerKind,
    pub vars: EnvMap,
}

impl EnvLayer {
    #[must_use]
    pub const fn new(kind: LayerKind, vars: EnvMap) -> Self {
        Self { kind, vars }
    }
}

/// Raw inputs for one composition.
#[derive(Debug, Clone, Default)]
pub struct CompositionInput {
    /// Augmented OS environment.
    pub base: EnvMap,
    /// Provisioned Python variables.
    pub python: EnvMap,
    /// Parsed project `.env`.
    pub dotenv: EnvMap,
    /// Explicit caller overrides.
    pub overrides: EnvMap,
    /// Non-credential profile settings.
    pub ancillary_profile: EnvMap,
    /// Active profile environment; empty means OAuth mode.
    pub credential_profile: EnvMap,
    /// Backend source directory appended to the package path.
    pub source_dir: Option<PathBuf>,
}

/// Final environment plus the layer each value came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposedEnv {
    vars: EnvMap,
    origins: BTreeMap<String, LayerKind>,
}

impl ComposedEnv {
    fn apply(&mut self, layer: &EnvLayer) {
        for (key, value) in &layer.vars {
            self.vars.insert(key.clone(), value.clone());
            self.origins.insert(key.clone(), layer.kind);
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Layer that produced the final value of `key`.
    #[must_use]
    pub fn origin(&self, key: &str) -> Option<LayerKind> {
        self.origins.get(key).copied()
    }

    #[must_use]
    pub const fn vars(&self) -> &EnvMap {
        &self.vars
    }

    #[must_use]
    pub fn into_vars(self) -> EnvMap {
        self.vars
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Build the ordered layer list for `input`.
#[must_use]
pub fn layers(input: &CompositionInput, case_insensitive: bool) -> Vec<EnvLayer> {
    let flags: EnvMap = INTERPRETER_FLAGS
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();

    let mut package_path = EnvMap::new();
    if let Some(value) = derive_package_path(
        input.python.get(PACKAGE_PATH_VAR).map(String::as_str),
        input.source_dir.as_deref(),
        case_insensitive,
    ) {
        package_path.insert(PACKAGE_PATH_VAR.to_string(), value);
    }

    vec![
        EnvLayer::new(LayerKind::AugmentedOs, strip_interpreter_redirect(&input.base)),
        EnvLayer::new(LayerKind::PythonRuntime, input.python.clone()),
        EnvLayer::new(LayerKind::ProjectDotenv, input.dotenv.clone()),
        EnvLayer::new(LayerKind::CallerOverrides, input.overrides.clone()),
        EnvLayer::new(
            LayerKind::CredentialClear,
            oauth_clear_layer(&input.credential_profile),
        ),
        EnvLayer::new(LayerKind::AncillaryProfile, input.ancillary_profile.clone()),
        EnvLayer::new(LayerKind::CredentialProfile, input.credential_profile.clone()),
        EnvLayer::new(LayerKind::InterpreterFlags, flags),
        EnvLayer::new(LayerKind::PackagePath, package_path),
    ]
}

/// Merge all layers of `input` in precedence order.
#[must_use]
pub fn compose_layers(input: &CompositionInput, case_insensitive: bool) -> ComposedEnv {
    let mut composed = ComposedEnv::default();
    for layer in layers(input, case_insensitive) {
        composed.apply(&layer);
    }
    composed
}

/// De-duplicate package path segments and append the source directory.
///
/// Segments are trimmed, made absolute and compared case-insensitively when
/// requested. Order of first appearance is kept.
#[must_use]
pub fn derive_package_path(
    python_value: Option<&str>,
    source_dir: Option<&Path>,
    case_insensitive: bool,
) -> Option<String> {
    let mut segments: Vec<PathBuf> = Vec::new();

    let raw = python_value
        .map(|value| std::env::split_paths(value).collect::<Vec<_>>())
        .unwrap_or_default();

    for segment in raw.iter().map(|p| p.as_path()).chain(source_dir) {
        let text = segment.to_string_lossy();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        let absolute =
            std::path::absolute(trimmed).unwrap_or_else(|_| PathBuf::from(trimmed));
        if !segments
            .iter()
            .any(|existing| same_path(existing, &absolute, case_insensitive))
        {
            segments.push(absolute);
        }
    }

    if segments.is_empty() {
        return None;
    }

    match std::env::join_paths(&segments) {
        Ok(joined) => Some(joined.to_string_lossy().into_owned()),
        Err(e) => {
            tracing::warn!(error = %e, "package path segment contains a separator, dropped");
            None
        }
    }
}

/// Inputs the composer cannot fetch on its own.
#[derive(Debug, Clone, Default)]
pub struct ComposeRequest {
    /// Augmented OS environment.
    pub base: EnvMap,
    /// Provisioned Python variables.
    pub python: EnvMap,
    /// Project `.env` to read, if any.
    pub dotenv_path: Option<PathBuf>,
    /// Caller overrides.
    pub overrides: EnvMap,
    /// Backend source directory.
    pub source_dir: Option<PathBuf>,
}

/// Builds child environments from the fixed layer order.
#[derive(Clone)]
pub struct EnvComposer {
    credentials: Arc<dyn CredentialSource>,
    case_insensitive: bool,
}

impl fmt::Debug for EnvComposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvComposer")
            .field("case_insensitive", &self.case_insensitive)
            .finish_non_exhaustive()
    }
}

impl EnvComposer {
    #[must_use]
    pub fn new(credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            credentials,
            case_insensitive: HOST_PATHS_CASE_INSENSITIVE,
        }
    }

    /// Override host path case sensitivity.
    #[must_use]
    pub const fn case_insensitive(mut self, case_insensitive: bool) -> Self {
        self.case_insensitive = case_insensitive;
        self
    }

    /// Compose the final environment for one child.
    pub async fn compose(&self, request: ComposeRequest) -> ComposedEnv {
        let credential_profile = self.credentials.active_profile_env().await;
        let ancillary_profile = self.credentials.ambient_profile_env();
        let dotenv = request
            .dotenv_path
            .as_deref()
            .map(dotenv::load)
            .unwrap_or_default();

        let oauth_mode = !profile_is_active(&credential_profile);
        tracing::debug!(
            oauth_mode,
            profile_keys = credential_profile.len(),
            dotenv_keys = dotenv.len(),
            "composing environment"
        );

        let input = CompositionInput {
            base: request.base,
            python: request.python,
            dotenv,
            overrides: request.overrides,
            ancillary_profile,
            credential_profile,
            source_dir: request.source_dir,
        };

        compose_layers(&input, self.case_insensitive)
    }
}
