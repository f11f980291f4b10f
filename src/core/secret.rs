//! Log-safe rendering of credential values
//!
//! Credential values must never reach a log sink. Values are described by
//! presence, length and a short prefix; free text captured from children is
//! masked before it is logged.

use std::borrow::Cow;

use regex::Regex;

/// Number of leading characters shown by [`describe`].
const VISIBLE_PREFIX: usize = 4;

/// Patterns that match credential formats the backend handles
const SECRET_PATTERNS: &[(&str, &str)] = &[
    (r"sk-ant-[a-zA-Z0-9_-]{10,}", "[MASKED_ANTHROPIC_KEY]"),
    (r"sk-[a-zA-Z0-9_-]{20,}", "[MASKED_API_KEY]"),
    (r"(?i)bearer\s+[a-zA-Z0-9._-]+", "[MASKED_BEARER_TOKEN]"),
    (r"eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+", "[MASKED_JWT]"),
    (
        r"(?i)(ANTHROPIC_(?:AUTH_TOKEN|API_KEY)|CLAUDE_CODE_OAUTH_TOKEN)\s*=\s*\S+",
        "$1=[MASKED]",
    ),
];

/// Compiled masking patterns
pub struct SecretMasker {
    patterns: Vec<(Regex, &'static str)>,
}

impl Default for SecretMasker {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretMasker {
    #[must_use]
    pub fn new() -> Self {
        let patterns = SECRET_PATTERNS
            .iter()
            .filter_map(|(pattern, replacement)| {
                Regex::new(pattern).ok().map(|re| (re, *replacement))
            })
            .collect();

        Self { patterns }
    }

    /// Mask credentials in a string
    #[must_use]
    pub fn mask<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut result = Cow::Borrowed(text);

        for (pattern, replacement) in &self.patterns {
            if pattern.is_match(&result) {
                result = Cow::Owned(pattern.replace_all(&result, *replacement).into_owned());
            }
        }

        result
    }
}

static MASKER: std::sync::LazyLock<SecretMasker> = std::sync::LazyLock::new(SecretMasker::new);

/// Mask credentials in free text using the shared masker
#[must_use]
pub fn mask_secrets(text: &str) -> Cow<'_, str> {
    MASKER.mask(text)
}

/// Describe a credential value without revealing it.
///
/// `None` renders as `absent`, the empty string as `empty`, anything else as
/// its first few characters plus its length.
#[must_use]
pub fn describe(value: Option<&str>) -> String {
    match value {
        None => "absent".to_string(),
        Some("") => "empty".to_string(),
        Some(v) => {
            let len = v.chars().count();
            if len <= VISIBLE_PREFIX * 2 {
                format!("set (len {len})")
            } else {
                let prefix: String = v.chars().take(VISIBLE_PREFIX).collect();
                format!("{prefix}… (len {len})")
            }
        }
    }
}
