//! Process-wide configuration, loaded once at startup into an immutable record and
//! handed to the Registry and Lifecycle Manager (spec §9 "Global state" — no mutable
//! singletons).

use std::path::PathBuf;

use llamafleet_registry::RestartPolicy;
use serde::{Deserialize, Serialize};

/// Immutable configuration shared by the registry, the lifecycle manager, and the
/// HTTP layer. Constructed once by the server crate from a TOML file merged with CLI
/// overrides (spec §6 "Configuration options the core recognizes").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub max_running_instances: usize,
    pub idle_timeout_minutes: u64,
    pub on_demand_start: bool,
    pub restore_last_state: bool,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub default_auto_restart: bool,
    pub default_max_restarts: u32,
    pub default_restart_delay_seconds: u64,
    pub listen_addr: String,
    pub health_check_path: String,
    pub health_check_timeout_seconds: u64,
    pub log_level: String,
    /// How often the idle sweeper runs (spec §4.3, default 1 minute).
    pub idle_sweep_interval_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            max_running_instances: 4,
            idle_timeout_minutes: 0,
            on_demand_start: true,
            restore_last_state: false,
            state_dir: PathBuf::from("./state"),
            log_dir: PathBuf::from("./logs"),
            default_auto_restart: false,
            default_max_restarts: 3,
            default_restart_delay_seconds: 5,
            listen_addr: "127.0.0.1:8080".to_string(),
            health_check_path: "/health".to_string(),
            health_check_timeout_seconds: 120,
            log_level: "info".to_string(),
            idle_sweep_interval_seconds: 60,
        }
    }
}

impl AppConfig {
    pub fn default_restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            auto_restart: self.default_auto_restart,
            max_restarts: self.default_max_restarts,
            restart_delay_seconds: self.default_restart_delay_seconds,
        }
    }

    /// Parses a TOML configuration file. Missing fields fall back to [`AppConfig::default`]
    /// via `#[serde(default)]`.
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = AppConfig::default();
        assert_eq!(config.max_running_instances, 4);
        assert!(config.on_demand_start);
        assert_eq!(config.health_check_path, "/health");
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            max_running_instances = 8
            listen_addr = "0.0.0.0:9000"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_running_instances, 8);
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.health_check_timeout_seconds, 120);
        assert!(!config.restore_last_state);
    }

    #[test]
    fn default_restart_policy_reflects_defaults_section() {
        let mut config = AppConfig::default();
        config.default_max_restarts = 10;
        config.default_restart_delay_seconds = 30;
        config.default_auto_restart = true;
        let policy = config.default_restart_policy();
        assert_eq!(policy.max_restarts, 10);
        assert_eq!(policy.restart_delay_seconds, 30);
        assert!(policy.auto_restart);
    }
}
