// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Configuration for the admission-control service.
//!
//! Default policies mirror the write endpoints of the directory
//! application: community creation, comment creation, authentication
//! attempts and event RSVPs.

use crate::error::{AdmissionError, Result};
use crate::limiter::Policy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Configuration for the admission-control service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address (default: 0.0.0.0:8080)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Browser origins allowed to call the check endpoints
    #[serde(default)]
    pub cors: CorsConfig,
}

/// Rate limiting configuration shared by every protected operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Interval between expiry sweeps of the counter store (default: 60)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long a guarded operation may run before it is accounted as
    /// failed (default: 30000)
    #[serde(default = "default_outcome_timeout_ms")]
    pub outcome_timeout_ms: u64,

    /// Policies keyed by operation class name
    #[serde(default = "default_policies")]
    pub policies: BTreeMap<String, PolicyConfig>,
}

/// One protected operation class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Fixed window length in milliseconds
    pub window_ms: u64,

    /// Admissions allowed per window
    pub max_requests: u32,

    /// Refund the slot when the guarded operation fails
    #[serde(default)]
    pub count_success_only: bool,

    /// Refund the slot when the guarded operation succeeds
    #[serde(default)]
    pub count_failure_only: bool,

    /// How the counter key is derived from a request
    #[serde(default)]
    pub key_strategy: KeyStrategyKind,
}

/// Key derivation selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategyKind {
    /// Authenticated identity when present, network origin otherwise
    #[default]
    IdentityOrOrigin,
    /// Network origin only, ignoring any identity
    OriginOnly,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics endpoint (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics endpoint path (default: /metrics)
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

/// CORS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins (default: https://localhost)
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

// Default value functions
fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_outcome_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["https://localhost".to_string()]
}

fn default_policies() -> BTreeMap<String, PolicyConfig> {
    let mut policies = BTreeMap::new();
    policies.insert(
        "community-creation".to_string(),
        PolicyConfig {
            window_ms: 60 * 60 * 1000,
            max_requests: 5,
            count_success_only: false,
            count_failure_only: false,
            key_strategy: KeyStrategyKind::IdentityOrOrigin,
        },
    );
    policies.insert(
        "comment-creation".to_string(),
        PolicyConfig {
            window_ms: 60 * 1000,
            max_requests: 30,
            count_success_only: true,
            count_failure_only: false,
            key_strategy: KeyStrategyKind::IdentityOrOrigin,
        },
    );
    // Failed logins only; keyed by origin so rotating usernames does not
    // open a fresh bucket.
    policies.insert(
        "auth-attempt".to_string(),
        PolicyConfig {
            window_ms: 15 * 60 * 1000,
            max_requests: 10,
            count_success_only: false,
            count_failure_only: true,
            key_strategy: KeyStrategyKind::OriginOnly,
        },
    );
    policies.insert(
        "rsvp".to_string(),
        PolicyConfig {
            window_ms: 60 * 1000,
            max_requests: 20,
            count_success_only: false,
            count_failure_only: false,
            key_strategy: KeyStrategyKind::IdentityOrOrigin,
        },
    );
    policies
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            rate_limit: RateLimitConfig::default(),
            metrics: MetricsConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            outcome_timeout_ms: default_outcome_timeout_ms(),
            policies: default_policies(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_metrics_path(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl Config {
    /// Load configuration: a JSON file named by `ADMISSION_CONFIG` (if set),
    /// then individual environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("ADMISSION_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(addr) = std::env::var("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(secs) = env_parse("SWEEP_INTERVAL_SECS") {
            config.rate_limit.sweep_interval_secs = secs;
        }
        if let Some(ms) = env_parse("OUTCOME_TIMEOUT_MS") {
            config.rate_limit.outcome_timeout_ms = ms;
        }
        if let Ok(origins) = std::env::var("ALLOWED_ORIGINS") {
            config.cors.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Reject configurations the limiter cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.sweep_interval_secs == 0 {
            return Err(AdmissionError::InvalidPolicy {
                policy: "*".to_string(),
                reason: "sweep interval must be greater than zero".to_string(),
            });
        }
        for (name, policy) in &self.rate_limit.policies {
            policy.to_policy(name)?;
        }
        Ok(())
    }
}

impl RateLimitConfig {
    /// Get the sweep interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Get the outcome timeout
    pub fn outcome_timeout(&self) -> Duration {
        Duration::from_millis(self.outcome_timeout_ms)
    }
}

impl PolicyConfig {
    /// Build a validated [`Policy`] named `name`.
    pub fn to_policy(&self, name: &str) -> Result<Policy> {
        Policy::new(
            name,
            self.window_ms,
            self.max_requests,
            self.count_success_only,
            self.count_failure_only,
        )
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
