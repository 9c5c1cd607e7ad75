//! Response filter.
//!
//! Walks a dispatch output, drops sensitive keys and masks personally
//! identifying substrings. Each alteration is reported as a [`Redaction`]
//! whose path uses `$` for the root, `.key` for object members and `[i]`
//! for array elements.

use std::collections::HashSet;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use relay_types::{Redaction, RedactionKind};

use crate::config::SecurityConfig;
use crate::error::{SecurityError, SecurityResult};

/// Keys removed from every output by default.
pub const DEFAULT_SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "client_secret",
    "token",
    "access_token",
    "refresh_token",
    "id_token",
    "api_key",
    "authorization",
    "private_key",
    "credentials",
    "cookie",
    "session_id",
    "ssn",
];

const TOKEN_PATTERN: &str = r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]{8,}=*|\b(?:sk|pk|rk)[-_][A-Za-z0-9_\-]{16,}\b|\bgh[pousr]_[A-Za-z0-9]{20,}\b|\beyJ[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+";
const CARD_PATTERN: &str = r"\b(?:\d[ -]?){12,18}\d\b";
const NATIONAL_ID_PATTERN: &str = r"\b\d{3}-\d{2}-\d{4}\b";
const EMAIL_PATTERN: &str = r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b";

/// A filtered value with the alterations applied to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Filtered {
    pub value: Value,
    pub redactions: Vec<Redaction>,
}

impl Filtered {
    pub fn is_redacted(&self) -> bool {
        !self.redactions.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Detector {
    kind: RedactionKind,
    regex: Regex,
}

/// Output filter for sensitive keys and PII.
#[derive(Debug, Clone)]
pub struct ResponseFilter {
    sensitive_keys: HashSet<String>,
    detectors: Vec<Detector>,
}

impl ResponseFilter {
    pub fn new<S: AsRef<str>>(sensitive_keys: &[S], redact_pii: bool) -> SecurityResult<Self> {
        let sensitive_keys = sensitive_keys
            .iter()
            .map(|k| normalize_key(k.as_ref()))
            .collect();

        let detectors = if redact_pii {
            // Tokens first so a card-like run inside a token is not masked twice.
            [
                (RedactionKind::BearerToken, TOKEN_PATTERN),
                (RedactionKind::PaymentCard, CARD_PATTERN),
                (RedactionKind::NationalId, NATIONAL_ID_PATTERN),
                (RedactionKind::Email, EMAIL_PATTERN),
            ]
            .into_iter()
            .map(|(kind, pattern)| {
                Regex::new(pattern)
                    .map(|regex| Detector { kind, regex })
                    .map_err(|e| SecurityError::InvalidPattern {
                        pattern: pattern.to_string(),
                        reason: e.to_string(),
                    })
            })
            .collect::<SecurityResult<Vec<_>>>()?
        } else {
            Vec::new()
        };

        Ok(Self {
            sensitive_keys,
            detectors,
        })
    }

    pub fn from_config(config: &SecurityConfig) -> SecurityResult<Self> {
        Self::new(&config.sensitive_keys, config.redact_pii)
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_SENSITIVE_KEYS, true).expect("built-in PII patterns compile")
    }

    pub fn is_sensitive_key(&self, key: &str) -> bool {
        self.sensitive_keys.contains(&normalize_key(key))
    }

    pub fn filter(&self, value: Value) -> Filtered {
        let mut redactions = Vec::new();
        let value = self.filter_value(value, "$".to_string(), &mut redactions);
        if !redactions.is_empty() {
            debug!(count = redactions.len(), "Redacted dispatch output");
        }
        Filtered { value, redactions }
    }

    fn filter_value(&self, value: Value, path: String, out: &mut Vec<Redaction>) -> Value {
        match value {
            Value::Object(map) => {
                let mut filtered = Map::with_capacity(map.len());
                for (key, child) in map {
                    let child_path = format!("{path}.{key}");
                    if self.is_sensitive_key(&key) {
                        out.push(Redaction {
                            path: child_path,
                            kind: RedactionKind::SensitiveKey,
                        });
                        continue;
                    }
                    let child = self.filter_value(child, child_path, out);
                    filtered.insert(key, child);
                }
                Value::Object(filtered)
            }
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| self.filter_value(item, format!("{path}[{i}]"), out))
                    .collect(),
            ),
            Value::String(s) => Value::String(self.mask_text(s, &path, out)),
            other => other,
        }
    }

    fn mask_text(&self, mut text: String, path: &str, out: &mut Vec<Redaction>) -> String {
        for detector in &self.detectors {
            let mut hit = false;
            let replaced = detector.regex.replace_all(&text, |caps: &regex::Captures<'_>| {
                let matched = &caps[0];
                if detector.kind == RedactionKind::PaymentCard && !luhn_valid(matched) {
                    return matched.to_string();
                }
                hit = true;
                detector.kind.marker().to_string()
            });
            if hit {
                text = replaced.into_owned();
                out.push(Redaction {
                    path: path.to_string(),
                    kind: detector.kind,
                });
            }
        }
        text
    }
}

impl Default for ResponseFilter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' ' | '.'))
        .flat_map(char::to_lowercase)
        .collect()
}

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
