//! # Relay Security
//!
//! The security layer every dispatch passes through on its way in and out:
//!
//! - [`Sanitizer`] rejects templates and inputs matching a deny-list of
//!   prompt-manipulation patterns before anything is dispatched.
//! - [`ResponseFilter`] removes sensitive keys and masks personally
//!   identifying substrings in outputs, annotating every alteration.
//! - [`fingerprint`] derives a stable idempotency key from target, template
//!   and arguments.
//! - [`IdempotencyCache`] stores successful outputs by fingerprint with a TTL.
//!   It is shared for the whole process lifetime and safe for concurrent use.

#![deny(unsafe_code)]

mod cache;
mod config;
mod error;
mod filter;
mod fingerprint;
mod sanitizer;

pub use cache::{CacheStats, IdempotencyCache};
pub use config::SecurityConfig;
pub use error::{SecurityError, SecurityResult};
pub use filter::{Filtered, ResponseFilter};
pub use fingerprint::{canonical_json, fingerprint};
pub use sanitizer::{Sanitizer, DEFAULT_DENY_PATTERNS};
