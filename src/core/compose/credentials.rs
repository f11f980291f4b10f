//! Credential namespace and profile sources
//!
//! When no API profile is active the backend authenticates with an OAuth
//! token. Any credential variable inherited from the shell must then be
//! overwritten with an empty string: downstream code treats an empty value
//! as unset but an absent key as "inherit the ambient value".

use async_trait::async_trait;

use crate::core::types::EnvMap;

/// Prefix shared by every credential-namespace variable.
pub const CREDENTIAL_PREFIX: &str = "ANTHROPIC_";

/// Credential-namespace variables cleared in OAuth mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    AuthToken,
    ApiKey,
    BaseUrl,
    Model,
    DefaultHaikuModel,
    DefaultSonnetModel,
    DefaultOpusModel,
}

impl CredentialKey {
    pub const ALL: [Self; 7] = [
        Self::AuthToken,
        Self::ApiKey,
        Self::BaseUrl,
        Self::Model,
        Self::DefaultHaikuModel,
        Self::DefaultSonnetModel,
        Self::DefaultOpusModel,
    ];

    /// Environment variable name.
    #[must_use]
    pub const fn env_name(self) -> &'static str {
        match self {
            Self::AuthToken => "ANTHROPIC_AUTH_TOKEN",
            Self::ApiKey => "ANTHROPIC_API_KEY",
            Self::BaseUrl => "ANTHROPIC_BASE_URL",
            Self::Model => "ANTHROPIC_MODEL",
            Self::DefaultHaikuModel => "ANTHROPIC_DEFAULT_HAIKU_MODEL",
            Self::DefaultSonnetModel => "ANTHROPIC_DEFAULT_SONNET_MODEL",
            Self::DefaultOpusModel => "ANTHROPIC_DEFAULT_OPUS_MODEL",
        }
    }

    /// Holds a secret rather than configuration.
    #[must_use]
    pub const fn is_secret(self) -> bool {
        matches!(self, Self::AuthToken | Self::ApiKey)
    }
}

/// A profile is active when it sets any credential-namespace variable.
#[must_use]
pub fn profile_is_active(profile: &EnvMap) -> bool {
    profile.keys().any(|key| key.starts_with(CREDENTIAL_PREFIX))
}

/// Explicit empty values for every known credential key, or nothing when
/// the profile is active.
#[must_use]
pub fn oauth_clear_layer(profile: &EnvMap) -> EnvMap {
    if profile_is_active(profile) {
        return EnvMap::new();
    }
    CredentialKey::ALL
        .iter()
        .map(|key| (key.env_name().to_string(), String::new()))
        .collect()
}

/// Supplies the profile environment. Treated as opaque.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Environment of the active API profile. Empty means OAuth mode.
    async fn active_profile_env(&self) -> EnvMap;

    /// Non-credential profile settings, such as a config directory override.
    fn ambient_profile_env(&self) -> EnvMap;
}

/// Credential source with fixed maps.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    active: EnvMap,
    ambient: EnvMap,
}

impl StaticCredentials {
    #[must_use]
    pub const fn new(active: EnvMap, ambient: EnvMap) -> Self {
        Self { active, ambient }
    }

    /// No active profile and no ambient settings.
    #[must_use]
    pub fn oauth() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn active_profile_env(&self) -> EnvMap {
        self.active.clone()
    }

    fn ambient_profile_env(&self) -> EnvMap {
        self.ambient.clone()
    }
}
