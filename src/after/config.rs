//! Tunables for the deferred scheduler.

use serde::{Deserialize, Serialize};

/// Nesting depth above which caller chains are not stitched onto errors.
pub const DEFAULT_MAX_STITCH_DEPTH: usize = 64;

/// Scheduler configuration.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use rttp_after::after::AfterConfig;
///
/// let config = AfterConfig::from_json(r#"{ "max_concurrency": 4 }"#).unwrap();
/// assert_eq!(config.max_concurrency, Some(4));
/// assert!(config.stitch_errors);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AfterConfig {
    /// Decorate task errors with the call sites that scheduled them.
    pub stitch_errors: bool,
    /// Maximum nesting depth that is still stitched.
    pub max_stitch_depth: usize,
    /// Maximum number of deferred procedures running at once. `None` leaves
    /// them unconstrained.
    pub max_concurrency: Option<usize>,
}

impl Default for AfterConfig {
    fn default() -> Self {
        Self {
            stitch_errors: true,
            max_stitch_depth: DEFAULT_MAX_STITCH_DEPTH,
            max_concurrency: None,
        }
    }
}

impl AfterConfig {
    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns the [`serde_json::Error`] when `json` is malformed or a field
    /// has the wrong type.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
