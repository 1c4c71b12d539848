//! Runtime configuration.
//!
//! ```toml
//! [process]
//! sh_path = "/bin/sh"
//! program_name = "tierstate"
//! do_undump = false
//! early_taint = false
//!
//! [instances]
//! max_instances = 0        # 0 = unbounded
//!
//! [logging]
//! level = "warn"
//! ```
//!
//! Every section and key is optional. [`RuntimeConfig::discover`] looks in
//! order at an explicit path, `$TIERSTATE_CONFIG`, and
//! `<config dir>/tierstate/config.toml`, and falls back to defaults when
//! none of them exists.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::Level;

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "TIERSTATE_CONFIG";

/// Seeds for the global tier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub sh_path: String,
    pub program_name: String,
    pub do_undump: bool,
    pub early_taint: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            sh_path: "/bin/sh".to_string(),
            program_name: "tierstate".to_string(),
            do_undump: false,
            early_taint: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Maximum number of live instances; 0 means unbounded.
    pub max_instances: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn max_level(&self) -> Result<Level, ConfigError> {
        self.level
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLevel(self.level.clone()))
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub process: ProcessConfig,
    pub instances: InstanceConfig,
    pub logging: LoggingConfig,
}

/// Errors from loading a configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: io::Error },
    Parse {
        path: Option<PathBuf>,
        source: toml::de::Error,
    },
    InvalidLevel(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Failed to read config '{}': {}", path.display(), source)
            }
            ConfigError::Parse {
                path: Some(path),
                source,
            } => write!(f, "Invalid config '{}': {}", path.display(), source),
            ConfigError::Parse { path: None, source } => write!(f, "Invalid config: {}", source),
            ConfigError::InvalidLevel(level) => write!(f, "Unknown log level '{}'", level),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::InvalidLevel(_) => None,
        }
    }
}

impl RuntimeConfig {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig =
            toml::from_str(content).map_err(|source| ConfigError::Parse { path: None, source })?;
        config.logging.max_level()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: Some(path.to_path_buf()),
                source,
            },
            other => other,
        })
    }

    /// Default location: `<config dir>/tierstate/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tierstate").join("config.toml"))
    }

    /// Load from the first configuration source that exists.
    ///
    /// An explicit path must exist. The environment variable and the
    /// default location are skipped when they point at nothing.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        for candidate in env_path.into_iter().chain(Self::default_path()) {
            if candidate.is_file() {
                return Self::load(&candidate);
            }
        }
        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.process.sh_path, "/bin/sh");
        assert_eq!(config.process.program_name, "tierstate");
        assert_eq!(config.instances.max_instances, 0);
        assert_eq!(config.logging.max_level().unwrap(), Level::WARN);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = RuntimeConfig::parse(
            r#"
            [process]
            sh_path = "/usr/bin/dash"

            [instances]
            max_instances = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.process.sh_path, "/usr/bin/dash");
        assert_eq!(config.process.program_name, "tierstate");
        assert_eq!(config.instances.max_instances, 8);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_empty_config() {
        assert_eq!(RuntimeConfig::parse("").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_invalid_level() {
        let err = RuntimeConfig::parse("[logging]\nlevel = \"loud\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLevel(ref l) if l == "loud"));
    }

    #[test]
    fn test_type_error_is_parse_error() {
        let err = RuntimeConfig::parse("[instances]\nmax_instances = \"many\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { path: None, .. }));
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = RuntimeConfig::discover(Some(Path::new("/nonexistent/tierstate.toml")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
