//! Configuration file schema (epa.toml, ~/.epa/config.toml)
//!
//! Both files share one schema. Every field is optional so that a file only
//! needs to mention what it overrides.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Gauss-Kronrod rule used by the adaptive QAG integrator.
///
/// Discriminants are the GSL `GSL_INTEG_GAUSS*` codes passed to the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationMethod {
    Gauss15 = 1,
    Gauss21 = 2,
    Gauss31 = 3,
    #[default]
    Gauss41 = 4,
    Gauss51 = 5,
    Gauss61 = 6,
}

impl IntegrationMethod {
    pub const ALL: [IntegrationMethod; 6] = [
        IntegrationMethod::Gauss15,
        IntegrationMethod::Gauss21,
        IntegrationMethod::Gauss31,
        IntegrationMethod::Gauss41,
        IntegrationMethod::Gauss51,
        IntegrationMethod::Gauss61,
    ];

    /// GSL code of the rule
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a rule by its GSL code
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            IntegrationMethod::Gauss15 => "gauss15",
            IntegrationMethod::Gauss21 => "gauss21",
            IntegrationMethod::Gauss31 => "gauss31",
            IntegrationMethod::Gauss41 => "gauss41",
            IntegrationMethod::Gauss51 => "gauss51",
            IntegrationMethod::Gauss61 => "gauss61",
        }
    }
}

impl fmt::Display for IntegrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IntegrationMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.name() == lowered)
            .ok_or_else(|| ConfigError::UnknownMethod(s.to_string()))
    }
}

/// Configuration file contents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct EpaConfig {
    /// Integration defaults
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration: Option<IntegrationConfig>,

    /// Native library location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<LibraryConfig>,

    /// Logging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Integration defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct IntegrationConfig {
    /// Absolute error goal (default: 0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub absolute_error: Option<f64>,

    /// Relative error goal at level 0 (default: 1e-3)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_error: Option<f64>,

    /// Factor applied to the relative error per nesting level (default: 0.1)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_step: Option<f64>,

    /// QAG rule (default: gauss41)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<IntegrationMethod>,

    /// QAG workspace size (default: 1000)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qag_limit: Option<usize>,

    /// CQUAD workspace size (default: 100)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cquad_limit: Option<usize>,
}

/// Native library location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LibraryConfig {
    /// Library name ("epa") or path ("/opt/epa/lib/libepa.so")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Extra directories searched before the platform defaults
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. "epa=debug"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl EpaConfig {
    /// Load a configuration file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(integration) = &self.integration {
            integration.validate()?;
        }

        if let Some(library) = &self.library {
            if matches!(&library.path, Some(p) if p.trim().is_empty()) {
                return Err(invalid("library.path", "path cannot be empty"));
            }
        }

        Ok(())
    }

    /// Merge another config into this one; fields set in `other` win
    pub fn merge(&mut self, other: &EpaConfig) {
        if let Some(theirs) = &other.integration {
            let ours = self.integration.get_or_insert_with(Default::default);
            merge_field(&mut ours.absolute_error, theirs.absolute_error);
            merge_field(&mut ours.relative_error, theirs.relative_error);
            merge_field(&mut ours.error_step, theirs.error_step);
            merge_field(&mut ours.method, theirs.method);
            merge_field(&mut ours.qag_limit, theirs.qag_limit);
            merge_field(&mut ours.cquad_limit, theirs.cquad_limit);
        }

        if let Some(theirs) = &other.library {
            let ours = self.library.get_or_insert_with(Default::default);
            if theirs.path.is_some() {
                ours.path = theirs.path.clone();
            }
            // Search paths accumulate, most specific first
            let mut paths = theirs.search_paths.clone();
            paths.extend(ours.search_paths.drain(..));
            ours.search_paths = paths;
        }

        if let Some(theirs) = &other.logging {
            let ours = self.logging.get_or_insert_with(Default::default);
            if theirs.filter.is_some() {
                ours.filter = theirs.filter.clone();
            }
        }
    }
}

impl IntegrationConfig {
    fn validate(&self) -> ConfigResult<()> {
        if let Some(e) = self.absolute_error {
            if !(e >= 0.0 && e.is_finite()) {
                return Err(invalid("integration.absolute_error", "must be a finite non-negative number"));
            }
        }
        if let Some(e) = self.relative_error {
            if !(e >= 0.0 && e.is_finite()) {
                return Err(invalid("integration.relative_error", "must be a finite non-negative number"));
            }
        }
        if let Some(step) = self.error_step {
            if !(step > 0.0 && step < 1.0) {
                return Err(invalid("integration.error_step", "must be between 0 and 1 (exclusive)"));
            }
        }
        if self.qag_limit == Some(0) {
            return Err(invalid("integration.qag_limit", "must be positive"));
        }
        if self.cquad_limit == Some(0) {
            return Err(invalid("integration.cquad_limit", "must be positive"));
        }
        Ok(())
    }
}

fn merge_field<T: Copy>(ours: &mut Option<T>, theirs: Option<T>) {
    if theirs.is_some() {
        *ours = theirs;
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[integration]
absolute_error = 0.0
relative_error = 1e-4
error_step = 0.5
method = "gauss61"
qag_limit = 2000
cquad_limit = 200

[library]
path = "epa"
search_paths = ["/opt/epa/lib"]

[logging]
filter = "epa=debug"
"#;

        let config: EpaConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        let integration = config.integration.unwrap();
        assert_eq!(integration.method, Some(IntegrationMethod::Gauss61));
        assert_eq!(integration.relative_error, Some(1e-4));
        assert_eq!(config.library.unwrap().search_paths.len(), 1);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml = r#"
[integration]
tolerance = 1e-3
"#;
        assert!(toml::from_str::<EpaConfig>(toml).is_err());
    }

    #[test]
    fn test_error_step_out_of_range() {
        let config = EpaConfig {
            integration: Some(IntegrationConfig {
                error_step: Some(1.5),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "integration.error_step"
        ));
    }

    #[test]
    fn test_method_codes_round_trip() {
        for method in IntegrationMethod::ALL {
            assert_eq!(IntegrationMethod::from_code(method.code()), Some(method));
            assert_eq!(method.name().parse::<IntegrationMethod>().unwrap(), method);
        }
        assert_eq!(IntegrationMethod::Gauss15.code(), 1);
        assert_eq!(IntegrationMethod::Gauss61.code(), 6);
        assert!(IntegrationMethod::from_code(7).is_none());
    }

    #[test]
    fn test_merge_overrides_and_accumulates_paths() {
        let mut base = EpaConfig {
            integration: Some(IntegrationConfig {
                relative_error: Some(1e-3),
                qag_limit: Some(500),
                ..Default::default()
            }),
            library: Some(LibraryConfig {
                path: Some("epa".to_string()),
                search_paths: vec![PathBuf::from("/global")],
            }),
            ..Default::default()
        };
        let project = EpaConfig {
            integration: Some(IntegrationConfig {
                relative_error: Some(1e-5),
                ..Default::default()
            }),
            library: Some(LibraryConfig {
                path: None,
                search_paths: vec![PathBuf::from("/project")],
            }),
            ..Default::default()
        };

        base.merge(&project);
        let integration = base.integration.as_ref().unwrap();
        assert_eq!(integration.relative_error, Some(1e-5));
        assert_eq!(integration.qag_limit, Some(500));
        let library = base.library.as_ref().unwrap();
        assert_eq!(library.path.as_deref(), Some("epa"));
        assert_eq!(
            library.search_paths,
            vec![PathBuf::from("/project"), PathBuf::from("/global")]
        );
    }
}
