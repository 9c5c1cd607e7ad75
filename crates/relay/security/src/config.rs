//! Security layer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::filter::DEFAULT_SENSITIVE_KEYS;
use crate::sanitizer::DEFAULT_DENY_PATTERNS;

/// Configuration for the sanitizer, response filter and idempotency cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Case-insensitive regexes that mark an input as a manipulation attempt.
    pub deny_patterns: Vec<String>,

    /// Keys removed from outputs, compared case-insensitively ignoring `_`, `-` and spaces.
    pub sensitive_keys: Vec<String>,

    /// Mask national IDs, emails, payment cards and tokens inside output strings.
    pub redact_pii: bool,

    /// How long a cached successful result stays valid.
    pub idempotency_ttl: Duration,

    /// Upper bound on cached entries.
    pub idempotency_max_entries: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            deny_patterns: DEFAULT_DENY_PATTERNS.iter().map(|p| p.to_string()).collect(),
            sensitive_keys: DEFAULT_SENSITIVE_KEYS.iter().map(|k| k.to_string()).collect(),
            redact_pii: true,
            idempotency_ttl: Duration::from_secs(300),
            idempotency_max_entries: 10_000,
        }
    }
}
