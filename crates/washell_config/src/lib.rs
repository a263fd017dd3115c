use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellConfig {
    /// Name of the shell session, used for log prefixes.
    pub name: String,
    /// Guest application configuration.
    pub app: AppConfig,

    /// Directory where the config file is located.
    /// This is used as a base directory when the guest image is specified
    /// as a relative path.
    #[serde(skip)]
    config_dir: PathBuf,
}

impl ShellConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config: ShellConfig = serde_yaml::from_reader(
            std::fs::File::open(path).map_err(|e| format!("Failed to open file: {}", e))?,
        )
        .map_err(|e| format!("Failed to parse YAML: {}", e))?;

        let path = path
            .canonicalize()
            .map_err(|e| format!("Failed to canonicalize path: {}", e))?;
        config.config_dir = path
            .parent()
            .ok_or_else(|| format!("Failed to get parent directory of path: {}", path.display()))?
            .to_path_buf();
        config.validate()?;

        Ok(config)
    }

    /// Absolute path of the guest image, when one is configured.
    pub fn guest_image_path(&self) -> Option<PathBuf> {
        self.app.path.as_ref().map(|path| {
            if path.is_relative() {
                self.config_dir.join(path)
            } else {
                path.clone()
            }
        })
    }

    fn validate(&self) -> Result<()> {
        if !self.config_dir.is_dir() {
            return Err(format!(
                "Broken config path: config_dir is not a directory: {}",
                self.config_dir.display()
            ));
        }

        if self.name.is_empty() {
            return Err("Name is required in the name field".to_string());
        }

        for key in self.app.env.keys() {
            if key.is_empty() {
                return Err("Environment variable names must not be empty".to_string());
            }
            if key.contains('=') {
                return Err(format!(
                    "Environment variable name must not contain '=': {}",
                    key
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Path to the guest reactor image, for engines that load one.
    /// If a relative path is specified, it is relative to the directory
    /// where the config file is located.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Arguments passed to the guest init export.
    /// Defaults to the conventional program name when empty.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment seeded into the shell at init. Order is preserved.
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// Preopened directory for guest file access.
    #[serde(default)]
    pub preopened_dir: Option<PathBuf>,
}
