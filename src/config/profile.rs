//! API profile settings and the credential source built from them.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::augment::process_env;
use crate::core::compose::{CredentialKey, CredentialSource};
use crate::core::keychain;
use crate::core::types::EnvMap;

/// Keychain account used when the profile does not name one.
pub const DEFAULT_PROFILE_NAME: &str = "default";

/// Variable the backend reads its config directory override from.
const CONFIG_DIR_VAR: &str = "CLAUDE_CONFIG_DIR";

/// A custom API profile.
///
/// Presence of a resolved key or any endpoint/model setting switches the
/// backend from OAuth to this profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Keychain account holding the API key.
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Environment variable checked for the API key before the keychain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_haiku_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_sonnet_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_opus_model: Option<String>,

    /// Backend config directory override. Not a credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<PathBuf>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROFILE_NAME.to_string(),
            base_url: None,
            api_key_env: None,
            model: None,
            default_haiku_model: None,
            default_sonnet_model: None,
            default_opus_model: None,
            config_dir: None,
        }
    }
}

impl ProfileConfig {
    /// API key from the configured environment variable, then the keychain.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        // Env first: avoids keychain prompts for freshly built binaries
        self.api_key_from_env(&process_env())
            .or_else(|| keychain::get_api_key(&self.name))
    }

    /// API key from `env` alone. Empty values count as unset.
    #[must_use]
    pub fn api_key_from_env(&self, env: &EnvMap) -> Option<String> {
        let var = self.api_key_env.as_deref()?;
        env.get(var).filter(|value| !value.is_empty()).cloned()
    }

    /// Credential-namespace variables for this profile, given its key.
    #[must_use]
    pub fn credential_env(&self, api_key: Option<String>) -> EnvMap {
        let entries = [
            (CredentialKey::AuthToken, api_key),
            (CredentialKey::BaseUrl, self.base_url.clone()),
            (CredentialKey::Model, self.model.clone()),
            (CredentialKey::DefaultHaikuModel, self.default_haiku_model.clone()),
            (CredentialKey::DefaultSonnetModel, self.default_sonnet_model.clone()),
            (CredentialKey::DefaultOpusModel, self.default_opus_model.clone()),
        ];

        entries
            .into_iter()
            .filter_map(|(key, value)| {
                value
                    .filter(|v| !v.is_empty())
                    .map(|v| (key.env_name().to_string(), v))
            })
            .collect()
    }

    /// Non-credential settings.
    #[must_use]
    pub fn ambient_env(&self) -> EnvMap {
        self.config_dir
            .iter()
            .map(|dir| (CONFIG_DIR_VAR.to_string(), dir.to_string_lossy().into_owned()))
            .collect()
    }
}

/// Credential source backed by the `[profile]` config section.
///
/// No section means OAuth mode: the active profile env is empty.
#[derive(Debug, Clone, Default)]
pub struct ConfigProfileSource {
    profile: Option<ProfileConfig>,
}

impl ConfigProfileSource {
    #[must_use]
    pub const fn new(profile: Option<ProfileConfig>) -> Self {
        Self { profile }
    }
}

#[async_trait]
impl CredentialSource for ConfigProfileSource {
    async fn active_profile_env(&self) -> EnvMap {
        let Some(profile) = self.profile.clone() else {
            return EnvMap::new();
        };

        // Keychain access can block on a user prompt
        let resolved = tokio::task::spawn_blocking(move || {
            let key = profile.resolve_api_key();
            profile.credential_env(key)
        })
        .await;

        match resolved {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "profile key lookup failed, using OAuth mode");
                EnvMap::new()
            }
        }
    }

    fn ambient_profile_env(&self) -> EnvMap {
        self.profile
            .as_ref()
            .map(ProfileConfig::ambient_env)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_key_is_preferred() {
        let profile = ProfileConfig {
            api_key_env: Some("WORK_API_KEY".to_string()),
            ..ProfileConfig::default()
        };
        let env = EnvMap::from([("WORK_API_KEY".to_string(), "sk-work".to_string())]);
        assert_eq!(profile.api_key_from_env(&env).as_deref(), Some("sk-work"));

        let empty = EnvMap::from([("WORK_API_KEY".to_string(), String::new())]);
        assert_eq!(profile.api_key_from_env(&empty), None);
    }

    #[test]
    fn credential_env_skips_unset_values() {
        let profile = ProfileConfig {
            base_url: Some("https://proxy.example".to_string()),
            model: Some(String::new()),
            ..ProfileConfig::default()
        };

        let env = profile.credential_env(Some("sk-x".to_string()));
        assert_eq!(env.len(), 2);
        assert_eq!(env["ANTHROPIC_AUTH_TOKEN"], "sk-x");
        assert_eq!(env["ANTHROPIC_BASE_URL"], "https://proxy.example");

        assert!(ProfileConfig::default().credential_env(None).is_empty());
    }

    #[test]
    fn config_dir_is_ambient_not_credential() {
        let profile = ProfileConfig {
            config_dir: Some(PathBuf::from("/profiles/work")),
            ..ProfileConfig::default()
        };
        assert_eq!(profile.ambient_env()["CLAUDE_CONFIG_DIR"], "/profiles/work");
        assert!(profile.credential_env(None).is_empty());
    }

    #[tokio::test]
    async fn no_profile_means_oauth_mode() {
        let source = ConfigProfileSource::new(None);
        assert!(source.active_profile_env().await.is_empty());
        assert!(source.ambient_profile_env().is_empty());
    }
}
