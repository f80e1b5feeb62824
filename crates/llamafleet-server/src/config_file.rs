//! Merges a TOML configuration file with CLI flag overrides into one [`AppConfig`].

use llamafleet_runtime::AppConfig;

use crate::cli::Cli;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Loads `cli.config` if it exists (missing file is not an error — defaults apply),
/// then layers CLI flags on top.
pub fn load(cli: &Cli) -> Result<AppConfig, ConfigError> {
    let mut config = match std::fs::read_to_string(&cli.config) {
        Ok(contents) => AppConfig::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: cli.config.display().to_string(),
            source,
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(source) => {
            return Err(ConfigError::Read {
                path: cli.config.display().to_string(),
                source,
            })
        }
    };

    apply_overrides(&mut config, cli);
    Ok(config)
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(addr) = &cli.listen_addr {
        config.listen_addr = addr.clone();
    }
    if let Some(max) = cli.max_running_instances {
        config.max_running_instances = max;
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(dir) = &cli.log_dir {
        config.log_dir = dir.clone();
    }
    if cli.restore_last_state {
        config.restore_last_state = true;
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
}
