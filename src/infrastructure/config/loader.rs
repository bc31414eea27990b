//! Hierarchical configuration loading.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::{Config, ProviderKind};

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_agents: {0}. Must be between 1 and 64")]
    InvalidMaxAgents(usize),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Team name cannot be empty")]
    EmptyTeamName,

    #[error("Target branch cannot be empty")]
    EmptyTargetBranch,

    #[error("No models configured for the team")]
    NoModels,

    #[error("Model references unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider '{0}' has an empty command")]
    EmptyProviderCommand(String),

    #[error("Invalid lock timeout: {0}ms. Must be at least 100ms")]
    InvalidLockTimeout(u64),
}

/// Loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.cohort/config.yaml` (project config, created by init)
    /// 3. `.cohort/local.yaml` (local overrides, optional)
    /// 4. Environment variables (`COHORT_*` prefix)
    ///
    /// Configuration is project-local so multiple teams can run on one
    /// machine against different repositories.
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".cohort/config.yaml"))
            .merge(Yaml::file(".cohort/local.yaml"))
            .merge(Env::prefixed("COHORT_").split("__"))
            .extract()
            .context("failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.team.max_agents == 0 || config.team.max_agents > 64 {
            return Err(ConfigError::InvalidMaxAgents(config.team.max_agents));
        }
        if config.team.name.is_empty() {
            return Err(ConfigError::EmptyTeamName);
        }
        if config.team.target_branch.is_empty() {
            return Err(ConfigError::EmptyTargetBranch);
        }
        if config.team.models.is_empty() {
            return Err(ConfigError::NoModels);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.timeouts.lock_timeout_ms < 100 {
            return Err(ConfigError::InvalidLockTimeout(config.timeouts.lock_timeout_ms));
        }

        for model in &config.team.models {
            if config.provider(&model.provider).is_none() {
                return Err(ConfigError::UnknownProvider(model.provider.clone()));
            }
        }
        for provider in &config.providers {
            if provider.kind == ProviderKind::Subprocess && provider.command.is_empty() {
                return Err(ConfigError::EmptyProviderCommand(provider.name.clone()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ModelSpec, ProviderConfig};

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.providers.push(ProviderConfig {
            name: "claude".into(),
            kind: ProviderKind::Subprocess,
            command: "claude".into(),
            args: vec!["--print".into()],
            analysis_args: None,
            prompt_delivery: Default::default(),
            stream_json: false,
            env: Default::default(),
        });
        config.team.models = vec![ModelSpec::new("claude", "sonnet")];
        config
    }

    #[test]
    fn test_valid_config_passes() {
        ConfigLoader::validate(&valid_config()).expect("config should be valid");
    }

    #[test]
    fn test_zero_agents_rejected() {
        let mut config = valid_config();
        config.team.max_agents = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxAgents(0))
        ));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut config = valid_config();
        config.team.models = vec![ModelSpec::new("mystery", "m1")];
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = valid_config();
        config.logging.level = "shouty".into();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn test_empty_provider_command_rejected() {
        let mut config = valid_config();
        config.providers[0].command = String::new();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::EmptyProviderCommand(_))
        ));
    }

    #[test]
    fn test_yaml_parsing_round_trip() {
        let yaml = r"
root_dir: /tmp/cohort-state
team:
  name: alpha
  max_agents: 5
  target_branch: main
  models:
    - provider: claude
      model: sonnet
providers:
  - name: claude
    command: claude
    args: ['--print']
    stream_json: true
logging:
  level: debug
  format: pretty
";
        let config: Config = serde_yaml::from_str(yaml).expect("yaml should parse");
        assert_eq!(config.team.name, "alpha");
        assert_eq!(config.team.max_agents, 5);
        assert!(config.providers[0].stream_json);
        ConfigLoader::validate(&config).expect("parsed config should validate");
    }

    #[test]
    fn test_hierarchical_merging() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut base = NamedTempFile::new().unwrap();
        writeln!(base, "team:\n  name: alpha\n  max_agents: 2").unwrap();
        base.flush().unwrap();

        let mut overlay = NamedTempFile::new().unwrap();
        writeln!(overlay, "team:\n  max_agents: 7").unwrap();
        overlay.flush().unwrap();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base.path()))
            .merge(Yaml::file(overlay.path()))
            .extract()
            .unwrap();

        assert_eq!(config.team.max_agents, 7, "override should win");
        assert_eq!(config.team.name, "alpha", "base value should persist");
    }
}
