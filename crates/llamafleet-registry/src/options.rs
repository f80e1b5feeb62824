//! Immutable configuration snapshot carried by an [`crate::instance::Instance`].

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ValidationError;

const MAX_RESTARTS_RANGE: std::ops::RangeInclusive<u32> = 0..=100;
const RESTART_DELAY_RANGE: std::ops::RangeInclusive<u64> = 1..=300;

/// Restart policy governing automatic recovery from crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_seconds")]
    pub restart_delay_seconds: u64,
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_delay_seconds() -> u64 {
    5
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            auto_restart: false,
            max_restarts: default_max_restarts(),
            restart_delay_seconds: default_restart_delay_seconds(),
        }
    }
}

impl RestartPolicy {
    /// Clamps out-of-range fields into their valid bounds, logging a warning per clamp.
    pub fn clamp(&mut self, instance_name: &str) {
        if !MAX_RESTARTS_RANGE.contains(&self.max_restarts) {
            warn!(
                instance = instance_name,
                requested = self.max_restarts,
                "max_restarts out of [0,100], clamping"
            );
            self.max_restarts = self.max_restarts.clamp(*MAX_RESTARTS_RANGE.start(), *MAX_RESTARTS_RANGE.end());
        }
        if !RESTART_DELAY_RANGE.contains(&self.restart_delay_seconds) {
            warn!(
                instance = instance_name,
                requested = self.restart_delay_seconds,
                "restart_delay_seconds out of [1,300], clamping"
            );
            self.restart_delay_seconds = self
                .restart_delay_seconds
                .clamp(*RESTART_DELAY_RANGE.start(), *RESTART_DELAY_RANGE.end());
        }
    }
}

/// Backend-specific flags translated into an argv by the command builder (spec §4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendOptions {
    Llama {
        model_path: String,
        #[serde(default)]
        context_size: Option<u32>,
        #[serde(default)]
        gpu_layers: Option<u32>,
        #[serde(default)]
        embedding: bool,
        #[serde(default)]
        extra_args: Vec<String>,
    },
    Mlx {
        model_path: String,
        #[serde(default)]
        context_size: Option<u32>,
        #[serde(default)]
        trust_remote_code: bool,
        #[serde(default)]
        extra_args: Vec<String>,
    },
}

impl BackendOptions {
    pub fn model_path(&self) -> &str {
        match self {
            BackendOptions::Llama { model_path, .. } => model_path,
            BackendOptions::Mlx { model_path, .. } => model_path,
        }
    }
}

/// Immutable configuration snapshot for an instance, per spec §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceOptions {
    pub restart_policy: RestartPolicy,
    pub backend: BackendOptions,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub idle_timeout_minutes: u64,
}

impl InstanceOptions {
    /// Validates field values and clamps restart-policy fields into bounds, matching
    /// `SetOptions` in spec §4.1.
    pub fn validate_and_clamp(&mut self, instance_name: &str) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() {
            return Err(ValidationError::EmptyHost);
        }
        self.restart_policy.clamp(instance_name);
        Ok(())
    }

    pub fn upstream_base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Caller-supplied instance options as received over the management REST surface
/// (spec §4.2 `Create`/`Update`): restart-policy fields are optional and fall back to
/// the registry's configured defaults when omitted.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceOptionsInput {
    #[serde(default)]
    pub auto_restart: Option<bool>,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub restart_delay_seconds: Option<u64>,
    pub backend: BackendOptions,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub idle_timeout_minutes: Option<u64>,
}

impl InstanceOptionsInput {
    /// Merges this request with registry-wide defaults to produce a full, immutable
    /// [`InstanceOptions`] snapshot. `default_idle_timeout_minutes` is the process-wide
    /// default (spec §6 `idle_timeout_minutes`); an explicit `0` in the request means
    /// "disabled" and is kept as-is, only an *omitted* field falls back to the default
    /// (spec §4.3, testable property 5).
    pub fn into_options(self, defaults: &RestartPolicy, default_idle_timeout_minutes: u64) -> InstanceOptions {
        InstanceOptions {
            restart_policy: RestartPolicy {
                auto_restart: self.auto_restart.unwrap_or(defaults.auto_restart),
                max_restarts: self.max_restarts.unwrap_or(defaults.max_restarts),
                restart_delay_seconds: self
                    .restart_delay_seconds
                    .unwrap_or(defaults.restart_delay_seconds),
            },
            backend: self.backend,
            host: self.host,
            port: self.port,
            idle_timeout_minutes: self.idle_timeout_minutes.unwrap_or(default_idle_timeout_minutes),
        }
    }
}

/// Validates an instance name per spec §4.2: nonempty, no path separators or control characters.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    let offending = name
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control());
    if offending {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    Ok(())
}
