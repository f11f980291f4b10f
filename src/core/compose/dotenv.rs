//! Project `.env` file parsing
//!
//! `KEY=value` lines, `#` comments, blank lines, optional single or double
//! quotes, LF or CRLF endings. Malformed lines are skipped individually.

use std::path::Path;

use crate::core::types::EnvMap;

/// Parse `.env` content.
#[must_use]
pub fn parse(content: &str) -> EnvMap {
    let mut vars = EnvMap::new();

    for raw in content.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw).trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        let key = key.trim();
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            continue;
        }

        vars.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    vars
}

/// Load and parse a `.env` file. A missing or unreadable file is an empty layer.
#[must_use]
pub fn load(path: &Path) -> EnvMap {
    match std::fs::read_to_string(path) {
        Ok(content) => parse(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => EnvMap::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read .env file, ignoring");
            EnvMap::new()
        }
    }
}

/// Strip one matching pair of surrounding quotes.
fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
