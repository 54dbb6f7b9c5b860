// ========================================================================================
//                                Runtime configuration
// ========================================================================================
//
// Settings are layered: built-in defaults, then an optional TOML file, then environment
// variables. The compute kernel never reads any of this; only the device manager and
// the command-line driver do.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_LOG_LEVEL: &str = "DETPOINT_LOGLEVEL";
pub const ENV_ACCEL: &str = "DETPOINT_ACCEL";
pub const ENV_ACCEL_DISABLE: &str = "DETPOINT_ACCEL_DISABLE";
pub const ENV_DEVICE: &str = "DETPOINT_DEVICE";
pub const ENV_TEAMS: &str = "DETPOINT_TEAMS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Where accelerated kernels execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccelTarget {
    /// No accelerator: every kernel runs on the host, and device pointers are host pointers.
    #[default]
    Host,
    /// A software accelerator with its own memory arena and its own team of workers.
    Emulated,
}

impl fmt::Display for AccelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccelTarget::Host => f.write_str("host"),
            AccelTarget::Emulated => f.write_str("emulated"),
        }
    }
}

impl FromStr for AccelTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" | "none" | "cpu" => Ok(AccelTarget::Host),
            "emulated" | "device" => Ok(AccelTarget::Emulated),
            _ => Err(invalid(ENV_ACCEL, s, "expected 'host' or 'emulated'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    pub target: AccelTarget,
    /// Device id reported by the manager when the target is not the host.
    pub device: i32,
    /// Number of worker threads backing an emulated device.
    pub teams: usize,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            target: AccelTarget::Host,
            device: 0,
            teams: num_cpus::get().max(1),
        }
    }
}

impl AccelConfig {
    /// An emulated device with `teams` workers.
    pub fn emulated(teams: usize) -> Self {
        Self {
            target: AccelTarget::Emulated,
            device: 0,
            teams: teams.max(1),
        }
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies overrides looked up by variable name. `DETPOINT_ACCEL_DISABLE`, when
    /// present with any value, forces host execution regardless of `DETPOINT_ACCEL`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_ACCEL) {
            self.target = value.parse()?;
        }
        if let Some(value) = lookup(ENV_DEVICE) {
            self.device = value
                .trim()
                .parse::<i32>()
                .ok()
                .filter(|id| *id >= 0)
                .ok_or_else(|| invalid(ENV_DEVICE, &value, "expected a non-negative integer"))?;
        }
        if let Some(value) = lookup(ENV_TEAMS) {
            self.teams = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|teams| *teams > 0)
                .ok_or_else(|| invalid(ENV_TEAMS, &value, "expected a positive integer"))?;
        }
        if lookup(ENV_ACCEL_DISABLE).is_some() {
            self.target = AccelTarget::Host;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.teams == 0 {
            return Err(invalid("accel.teams", "0", "expected a positive integer"));
        }
        if self.device < 0 {
            return Err(invalid(
                "accel.device",
                &self.device.to_string(),
                "expected a non-negative integer",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub log_level: String,
    pub accel: AccelConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            accel: AccelConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults, then `path` if given, then the process environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        self.accel.apply_overrides(lookup)?;
        self.validate()
    }

    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        self.log_level
            .trim()
            .parse::<LevelFilter>()
            .map_err(|_| invalid("log_level", &self.log_level, "expected off, error, warn, info, debug or trace"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.level_filter()?;
        self.accel.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_select_the_host() {
        let config = RuntimeConfig::default();
        assert_eq!(config.accel.target, AccelTarget::Host);
        assert_eq!(config.level_filter().unwrap(), LevelFilter::Info);
        assert!(config.accel.teams >= 1);
    }

    #[test]
    fn environment_overrides_target_device_and_teams() {
        let mut config = RuntimeConfig::default();
        config
            .apply_overrides(lookup_from(&[
                (ENV_ACCEL, "emulated"),
                (ENV_DEVICE, "2"),
                (ENV_TEAMS, "3"),
                (ENV_LOG_LEVEL, "debug"),
            ]))
            .unwrap();
        assert_eq!(config.accel.target, AccelTarget::Emulated);
        assert_eq!(config.accel.device, 2);
        assert_eq!(config.accel.teams, 3);
        assert_eq!(config.level_filter().unwrap(), LevelFilter::Debug);
    }

    #[test]
    fn disable_variable_wins_over_target() {
        let mut config = AccelConfig::default();
        config
            .apply_overrides(lookup_from(&[(ENV_ACCEL, "emulated"), (ENV_ACCEL_DISABLE, "1")]))
            .unwrap();
        assert_eq!(config.target, AccelTarget::Host);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let mut config = AccelConfig::default();
        let err = config
            .apply_overrides(lookup_from(&[(ENV_TEAMS, "zero")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = config
            .apply_overrides(lookup_from(&[(ENV_ACCEL, "quantum")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let mut runtime = RuntimeConfig::default();
        let err = runtime
            .apply_overrides(lookup_from(&[(ENV_LOG_LEVEL, "loud")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn toml_sections_fill_missing_fields_with_defaults() {
        let config = RuntimeConfig::from_toml_str(
            r#"
log_level = "warn"

[accel]
target = "emulated"
teams = 2
"#,
        )
        .unwrap();
        assert_eq!(config.level_filter().unwrap(), LevelFilter::Warn);
        assert_eq!(config.accel.target, AccelTarget::Emulated);
        assert_eq!(config.accel.teams, 2);
        assert_eq!(config.accel.device, 0);
    }

    #[test]
    fn toml_with_zero_teams_is_invalid() {
        let err = RuntimeConfig::from_toml_str("[accel]\nteams = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
