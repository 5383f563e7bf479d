//! Rate limit key composition.

use std::fmt;

use crate::error::{Result, ThrottleError};

/// Separator between action and client in a flat key.
pub const KEY_SEPARATOR: char = ':';

/// Check that `action` can lead a flat key.
///
/// Clients may contain the separator (IPv6 addresses do), so actions must
/// not, or `a:b` + `c` would collide with `a` + `b:c`.
pub fn validate_action(action: &str) -> Result<()> {
    if action.trim().is_empty() {
        return Err(ThrottleError::InvalidArgument(
            "action must be non-empty".to_string(),
        ));
    }
    if action.contains(KEY_SEPARATOR) {
        return Err(ThrottleError::InvalidArgument(format!(
            "action '{}' must not contain '{}'",
            action, KEY_SEPARATOR
        )));
    }
    Ok(())
}

/// A key that uniquely identifies one rate limited subject.
///
/// Composed of the action being performed and the caller performing it,
/// rendered as `<action>:<client>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The action being throttled, e.g. `contact`
    pub action: String,
    /// The caller, usually a best-effort IP address
    pub client: String,
}

impl RateLimitKey {
    /// Create a new key from an action and a client identifier.
    pub fn new(action: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            client: client.into(),
        }
    }

    /// The flat string form handed to backends.
    pub fn to_string_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.action, KEY_SEPARATOR, self.client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_to_string() {
        let key = RateLimitKey::new("contact", "1.2.3.4");
        assert_eq!(key.to_string_key(), "contact:1.2.3.4");
        assert_eq!(key.to_string(), "contact:1.2.3.4");
    }

    #[test]
    fn test_key_equality() {
        let a = RateLimitKey::new("upload", "10.0.0.1");
        let b = RateLimitKey::new("upload".to_string(), "10.0.0.1".to_string());
        let c = RateLimitKey::new("contact", "10.0.0.1");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_ipv6_client_keeps_action_prefix() {
        let key = RateLimitKey::new("upload", "2001:db8::1");
        assert_eq!(key.to_string_key(), "upload:2001:db8::1");
    }

    #[test]
    fn test_validate_action() {
        assert!(validate_action("contact").is_ok());
        assert!(validate_action("project_request").is_ok());
        assert!(matches!(validate_action(" "), Err(ThrottleError::InvalidArgument(_))));
        assert!(matches!(validate_action("a:b"), Err(ThrottleError::InvalidArgument(_))));
    }
}
