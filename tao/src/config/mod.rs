//! Per-unit configuration.
//!
//! Configuration enters as bytes (YAML, JSON or TOML) and is parsed once into
//! a raw layer keyed by unit name. Each unit later loads its own section into
//! a typed [`UnitConfig`], validates it, and stores the result back into the
//! [`ConfigRegistry`] so the engine can turn it into a task.

mod registry;
mod tao_config;

use std::path::Path;

use tao_shared::{ErrorCode, TaoError, TaoResult};

use crate::pipeline::SharedTask;

pub use registry::ConfigRegistry;
pub use tao_config::{BannerConfig, LogConfig, LogOutput, TAO_CONFIG_KEY, TaoConfig};

/// Typed configuration of one unit.
pub trait UnitConfig: Send + Sync + 'static {
    /// Normalize the loaded values, filling defaults where needed.
    fn validate(&mut self);

    /// Task started by the root pipeline, if the unit has one.
    fn to_task(&self) -> Option<SharedTask> {
        None
    }

    /// Names of units whose tasks must finish before this one runs.
    fn run_after(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Encoding of raw configuration bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// No data; every unit falls back to its defaults.
    None,
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from a file extension.
    pub fn from_path(path: &Path) -> TaoResult<Self> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        match ext {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "json" => Ok(ConfigFormat::Json),
            "toml" => Ok(ConfigFormat::Toml),
            other => Err(TaoError::new(
                ErrorCode::ParamInvalid,
                format!(".{other} file not supported"),
            )),
        }
    }
}

impl std::fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConfigFormat::None => "none",
            ConfigFormat::Yaml => "yaml",
            ConfigFormat::Json => "json",
            ConfigFormat::Toml => "toml",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("conf/config.yaml")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("config.yml")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("./config.json")).unwrap(),
            ConfigFormat::Json
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("config.toml")).unwrap(),
            ConfigFormat::Toml
        );
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let err = ConfigFormat::from_path(Path::new("config.ini")).unwrap_err();
        assert_eq!(err.code(), &ErrorCode::ParamInvalid);
        assert_eq!(err.message(), ".ini file not supported");

        let err = ConfigFormat::from_path(Path::new("config")).unwrap_err();
        assert_eq!(err.code(), &ErrorCode::ParamInvalid);
    }
}
