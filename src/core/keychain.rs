//! Read-only access to API profile keys in the OS keychain.

use keyring::Entry;

const SERVICE_NAME: &str = "agent-host";

/// Key stored for `profile`, if the keychain has one.
///
/// Any keychain failure (no backend, locked store, missing entry) reads as
/// no key.
#[must_use]
pub fn get_api_key(profile: &str) -> Option<String> {
    let entry = Entry::new(SERVICE_NAME, profile).ok()?;
    entry.get_password().ok()
}
