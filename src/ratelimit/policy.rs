//! Per-action rate limit policies.
//!
//! Each mutating action gets its own ceiling and window. Policies are loaded
//! from YAML and layered on top of the built-in defaults:
//!
//! ```yaml
//! actions:
//!   contact:
//!     limit: 5
//!     window_ms: 60000
//!   upload:
//!     limit: 10
//!     window_ms: 60000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use super::key::validate_action;
use crate::error::{Result, ThrottleError};

/// Limit and window for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPolicy {
    /// Maximum admissions per window
    pub limit: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl ActionPolicy {
    /// Create a policy, rejecting a zero limit or window.
    pub fn new(limit: u32, window_ms: u64) -> Result<Self> {
        let policy = Self { limit, window_ms };
        policy.validate()?;
        Ok(policy)
    }

    /// Check that the limiter can honor this policy.
    pub fn validate(&self) -> Result<()> {
        validate_limit(self.limit, self.window_ms)
    }
}

/// Shared argument check for every entry point into the limiter.
pub(crate) fn validate_limit(limit: u32, window_ms: u64) -> Result<()> {
    if limit == 0 {
        return Err(ThrottleError::InvalidArgument(
            "limit must be greater than zero".to_string(),
        ));
    }
    if window_ms == 0 {
        return Err(ThrottleError::InvalidArgument(
            "window_ms must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// The full table of action policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    /// Map of action name to its policy
    #[serde(default)]
    pub actions: BTreeMap<String, ActionPolicy>,
}

impl Default for PolicySet {
    /// The limits the site's mutating endpoints ship with.
    fn default() -> Self {
        let minute = 60_000;
        let actions = [
            ("contact", 5, minute),
            ("project_request", 5, minute),
            ("create_project", 10, minute),
            ("upload", 10, minute),
        ]
        .into_iter()
        .map(|(name, limit, window_ms)| (name.to_string(), ActionPolicy { limit, window_ms }))
        .collect();

        Self { actions }
    }
}

impl PolicySet {
    /// A table with no actions.
    pub fn empty() -> Self {
        Self {
            actions: BTreeMap::new(),
        }
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading action policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string. Every entry is validated.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let set: PolicySet = serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse action policies: {}", e)))?;

        for (action, policy) in &set.actions {
            validate_action(action)
                .map_err(|e| ThrottleError::Config(format!("action '{}': {}", action, e)))?;
            policy
                .validate()
                .map_err(|e| ThrottleError::Config(format!("action '{}': {}", action, e)))?;
        }

        Ok(set)
    }

    /// Overlay `other` on this table; its entries win.
    pub fn merge(mut self, other: PolicySet) -> Self {
        self.actions.extend(other.actions);
        self
    }

    /// Look up the policy for an action.
    pub fn get(&self, action: &str) -> Option<&ActionPolicy> {
        self.actions.get(action)
    }

    /// Add or replace one action.
    pub fn insert(&mut self, action: impl Into<String>, policy: ActionPolicy) {
        self.actions.insert(action.into(), policy);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
