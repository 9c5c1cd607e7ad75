//! Dispatcher configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use relay_security::SecurityConfig;

use crate::sandbox::SandboxConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Per-dispatch timeout when neither the step nor the context sets one.
    pub default_timeout: Duration,
    pub security: SecurityConfig,
    pub sandbox: SandboxConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            security: SecurityConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}
