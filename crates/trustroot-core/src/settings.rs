//! Typed view of the device namespace's settings payload.

use serde::{Deserialize, Serialize};

/// Settings carried in the device policy's `policy_value`, as JSON.
///
/// `user_whitelist` is the legacy spelling of `user_allowlist`; both
/// deserialize into the same field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub allow_new_users: Option<bool>,
    #[serde(alias = "user_whitelist")]
    pub user_allowlist: Option<Vec<String>>,
    pub guest_mode_enabled: Option<bool>,
    pub ephemeral_users_enabled: Option<bool>,
    pub show_user_names: Option<bool>,
    pub block_devmode: Option<bool>,
    pub allow_preserve_device_state: Option<bool>,
}

impl DeviceSettings {
    /// Lenient decode: an undecodable payload yields default settings.
    pub fn from_policy_value(value: Option<&[u8]>) -> Self {
        let Some(bytes) = value.filter(|b| !b.is_empty()) else {
            return Self::default();
        };
        match serde_json::from_slice(bytes) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(event = "device_settings_undecodable", error = %err, "device settings payload undecodable; using defaults");
                Self::default()
            }
        }
    }

    pub fn block_devmode(&self) -> bool {
        self.block_devmode.unwrap_or(false)
    }

    fn allowlist(&self) -> &[String] {
        self.user_allowlist.as_deref().unwrap_or_default()
    }
}

fn canonicalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn allowlist_entry_matches(entry: &str, email: &str) -> bool {
    let entry = canonicalize_email(entry);
    match entry.strip_prefix("*@") {
        Some(domain) => email
            .rsplit_once('@')
            .is_some_and(|(_, user_domain)| user_domain == domain),
        None => entry == email,
    }
}

/// Whether arbitrary new users may sign in.
///
/// `allow_new_users == Some(false)` blocks regardless of the allow-list.
/// Otherwise a present, non-empty allow-list restricts sign-in to its
/// entries, so arbitrary new users are blocked.
pub fn policy_allows_new_users(settings: &DeviceSettings) -> bool {
    if settings.allow_new_users == Some(false) {
        return false;
    }
    settings.allowlist().is_empty()
}

/// Whether `email` may be added as a new user.
pub fn policy_allows_user(settings: &DeviceSettings, email: &str) -> bool {
    if settings.allow_new_users == Some(false) {
        return false;
    }
    let allowlist = settings.allowlist();
    if allowlist.is_empty() {
        return true;
    }
    let email = canonicalize_email(email);
    allowlist
        .iter()
        .any(|entry| allowlist_entry_matches(entry, &email))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(json: &str) -> DeviceSettings {
        DeviceSettings::from_policy_value(Some(json.as_bytes()))
    }

    #[test]
    fn explicit_disallow_beats_allowlist() {
        let s = settings(r#"{"allow_new_users":false,"user_allowlist":["a@b"]}"#);
        assert!(!policy_allows_new_users(&s));
        assert!(!policy_allows_user(&s, "a@b"));
        let s = settings(r#"{"allow_new_users":false}"#);
        assert!(!policy_allows_new_users(&s));
    }

    #[test]
    fn non_empty_allowlist_restricts_users() {
        let s = settings(r#"{"user_allowlist":["a@b"]}"#);
        assert!(!policy_allows_new_users(&s));
        assert!(!policy_allows_user(&s, "c@d"));
        assert!(policy_allows_user(&s, " A@B "));
    }

    #[test]
    fn empty_or_absent_allowlist_allows_all() {
        assert!(policy_allows_new_users(&settings(r#"{"user_allowlist":[]}"#)));
        assert!(policy_allows_new_users(&settings(r#"{"allow_new_users":true}"#)));
        assert!(policy_allows_new_users(&DeviceSettings::default()));
    }

    #[test]
    fn legacy_whitelist_is_same_field() {
        let legacy = settings(r#"{"user_whitelist":["a@b"]}"#);
        let current = settings(r#"{"user_allowlist":["a@b"]}"#);
        assert_eq!(legacy, current);
    }

    #[test]
    fn domain_wildcard_matches_domain_users() {
        let s = settings(r#"{"user_allowlist":["*@example.com"]}"#);
        assert!(policy_allows_user(&s, "x@example.com"));
        assert!(!policy_allows_user(&s, "x@example.org"));
        assert!(!policy_allows_user(&s, "x@sub.example.com"));
    }

    #[test]
    fn garbage_payload_yields_defaults() {
        assert_eq!(settings("not json"), DeviceSettings::default());
        assert_eq!(DeviceSettings::from_policy_value(None), DeviceSettings::default());
    }
}
