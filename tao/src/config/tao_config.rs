use serde::{Deserialize, Serialize};

use super::UnitConfig;

/// Section key of the framework's own configuration.
pub const TAO_CONFIG_KEY: &str = "tao";

const DEFAULT_LOG_LEVEL: &str = "debug";
const DEFAULT_LOG_PATH: &str = "./tao.log";
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

const DEFAULT_BANNER: &str = r"
___________
\__    ___/____    ____
  |    |  \__  \  /  _ \
  |    |   / __ \(  <_> )
  |____|  (____  /\____/
               \/
";

/// Framework configuration, loaded from the `tao` section.
///
/// ```yaml
/// tao:
///   log:
///     level: info
///     output: both
///     path: ./logs/tao.log
///   banner:
///     hide: true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaoConfig {
    pub log: LogConfig,
    pub banner: BannerConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    pub fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    pub fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`. `RUST_LOG` takes
    /// precedence when set.
    pub level: String,
    pub disable: bool,
    pub output: LogOutput,
    /// Log file used when `output` includes `file`.
    pub path: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            disable: false,
            output: LogOutput::default(),
            path: DEFAULT_LOG_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BannerConfig {
    pub hide: bool,
    pub content: String,
}

impl Default for BannerConfig {
    fn default() -> Self {
        Self {
            hide: false,
            content: DEFAULT_BANNER.to_string(),
        }
    }
}

impl UnitConfig for TaoConfig {
    fn validate(&mut self) {
        let level = self.log.level.trim().to_ascii_lowercase();
        self.log.level = if LOG_LEVELS.contains(&level.as_str()) {
            level
        } else {
            DEFAULT_LOG_LEVEL.to_string()
        };

        if self.log.path.trim().is_empty() {
            self.log.path = DEFAULT_LOG_PATH.to_string();
        }
        if self.banner.content.trim().is_empty() {
            self.banner.content = DEFAULT_BANNER.to_string();
        }
    }
}
