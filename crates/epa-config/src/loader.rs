//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::settings::{EpaConfig, IntegrationMethod};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Project configuration file name
pub const PROJECT_CONFIG_FILE: &str = "epa.toml";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.epa/config.toml) - lowest priority
/// 2. Project config (./epa.toml) - overrides global
/// 3. Environment variables (EPA_*) - overrides project
pub struct ConfigLoader {
    /// Global config path, resolved lazily
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Merged file and environment settings
    pub settings: EpaConfig,

    /// Project root directory (where epa.toml was found)
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Create a loader that reads the global config from `path` instead of ~/.epa
    pub fn with_global_config(path: PathBuf) -> Self {
        Self {
            global_config_path: Some(path),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find epa.toml, merges it over the global
    /// config, then applies environment overrides.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;

        let mut settings = self.load_global_config()?;
        settings.merge(&project_config);
        let settings = self.apply_env_overrides(settings)?;

        Ok(Config {
            settings,
            project_root,
        })
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project_config = EpaConfig::load_from_file(config_path)?;

        let mut settings = self.load_global_config()?;
        settings.merge(&project_config);
        let settings = self.apply_env_overrides(settings)?;

        Ok(Config {
            settings,
            project_root: config_path.parent().map(|p| p.to_path_buf()),
        })
    }

    /// Find project configuration by walking up directory tree
    fn find_project_config(&self, start_dir: &Path) -> ConfigResult<(Option<PathBuf>, EpaConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let project_config = EpaConfig::load_from_file(&config_path)?;
                return Ok((Some(current), project_config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, EpaConfig::default())),
            }
        }
    }

    /// Load global configuration; a missing file (or home directory) yields defaults
    fn load_global_config(&mut self) -> ConfigResult<EpaConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => match Self::global_config_dir() {
                Ok(dir) => {
                    let path = dir.join("config.toml");
                    self.global_config_path = Some(path.clone());
                    path
                }
                Err(ConfigError::HomeNotFound) => return Ok(EpaConfig::default()),
                Err(e) => return Err(e),
            },
        };

        if !path.exists() {
            return Ok(EpaConfig::default());
        }

        EpaConfig::load_from_file(&path)
    }

    /// Apply environment variable overrides
    ///
    /// Recognized: EPA_ABSOLUTE_ERROR, EPA_RELATIVE_ERROR, EPA_ERROR_STEP,
    /// EPA_INTEGRATION_METHOD, EPA_LIBRARY, EPA_LOG
    fn apply_env_overrides(&self, mut config: EpaConfig) -> ConfigResult<EpaConfig> {
        if let Some(value) = env_f64("EPA_ABSOLUTE_ERROR")? {
            config.integration.get_or_insert_with(Default::default).absolute_error = Some(value);
        }

        if let Some(value) = env_f64("EPA_RELATIVE_ERROR")? {
            config.integration.get_or_insert_with(Default::default).relative_error = Some(value);
        }

        if let Some(value) = env_f64("EPA_ERROR_STEP")? {
            config.integration.get_or_insert_with(Default::default).error_step = Some(value);
        }

        if let Ok(method) = env::var("EPA_INTEGRATION_METHOD") {
            let method: IntegrationMethod = method.parse()?;
            config.integration.get_or_insert_with(Default::default).method = Some(method);
        }

        if let Ok(library) = env::var("EPA_LIBRARY") {
            config.library.get_or_insert_with(Default::default).path = Some(library);
        }

        if let Ok(filter) = env::var("EPA_LOG") {
            config.logging.get_or_insert_with(Default::default).filter = Some(filter);
        }

        config.validate()?;
        Ok(config)
    }

    /// Get the global configuration directory (~/.epa)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".epa"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_f64(name: &str) -> ConfigResult<Option<f64>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                field: name.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Absolute error goal (default: 0)
    pub fn absolute_error(&self) -> f64 {
        self.integration_field(|i| i.absolute_error).unwrap_or(0.0)
    }

    /// Relative error goal at level 0 (default: 1e-3)
    pub fn relative_error(&self) -> f64 {
        self.integration_field(|i| i.relative_error).unwrap_or(1e-3)
    }

    /// Relative error factor per nesting level (default: 0.1)
    pub fn error_step(&self) -> f64 {
        self.integration_field(|i| i.error_step).unwrap_or(0.1)
    }

    /// QAG rule (default: gauss41)
    pub fn integration_method(&self) -> IntegrationMethod {
        self.integration_field(|i| i.method).unwrap_or_default()
    }

    /// QAG workspace size (default: 1000)
    pub fn qag_limit(&self) -> usize {
        self.integration_field(|i| i.qag_limit).unwrap_or(1000)
    }

    /// CQUAD workspace size (default: 100)
    pub fn cquad_limit(&self) -> usize {
        self.integration_field(|i| i.cquad_limit).unwrap_or(100)
    }

    /// Library name or path (default: "epa")
    pub fn library_path(&self) -> &str {
        self.settings
            .library
            .as_ref()
            .and_then(|l| l.path.as_deref())
            .unwrap_or("epa")
    }

    /// Extra library search directories
    pub fn library_search_paths(&self) -> &[PathBuf] {
        self.settings
            .library
            .as_ref()
            .map(|l| l.search_paths.as_slice())
            .unwrap_or(&[])
    }

    /// Logging filter, if configured
    pub fn log_filter(&self) -> Option<&str> {
        self.settings.logging.as_ref().and_then(|l| l.filter.as_deref())
    }

    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if an epa.toml was found
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }

    fn integration_field<T>(
        &self,
        get: impl FnOnce(&crate::settings::IntegrationConfig) -> Option<T>,
    ) -> Option<T> {
        self.settings.integration.as_ref().and_then(get)
    }
}
