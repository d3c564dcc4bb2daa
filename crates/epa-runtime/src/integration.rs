//! Integration settings and integrator generators
//!
//! Nested integrals tighten their relative error per nesting level:
//! level `n` uses `relative_error * error_step^n`. An integrator generator
//! (`epa_integrator_generator`) hands the library a fresh integrator for
//! each level it asks for.

use crate::ffi::{FfiError, Function, FunctionKind};
use crate::value::{HostFn, Value};
use epa_config::{Config, IntegrationMethod};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tolerances and workspace sizes used to build integrators
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegrationSettings {
    pub absolute_error: f64,
    pub relative_error: f64,
    pub error_step: f64,
    pub method: IntegrationMethod,
    pub qag_limit: usize,
    pub cquad_limit: usize,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            absolute_error: 0.0,
            relative_error: 1e-3,
            error_step: 0.1,
            method: IntegrationMethod::Gauss41,
            qag_limit: 1000,
            cquad_limit: 100,
        }
    }
}

impl From<&Config> for IntegrationSettings {
    fn from(config: &Config) -> Self {
        Self {
            absolute_error: config.absolute_error(),
            relative_error: config.relative_error(),
            error_step: config.error_step(),
            method: config.integration_method(),
            qag_limit: config.qag_limit(),
            cquad_limit: config.cquad_limit(),
        }
    }
}

impl IntegrationSettings {
    /// Relative error goal for a nesting level
    pub fn relative_error_for(&self, level: u32) -> f64 {
        self.relative_error * self.error_step.powi(level as i32)
    }

    /// Settings for the integrals nested one level deeper
    pub fn nested(&self) -> Self {
        Self {
            relative_error: self.relative_error * self.error_step,
            ..*self
        }
    }
}

/// Build an `epa_integrator_generator` from a per-level integrator factory
///
/// `build` receives the settings and the level and returns an
/// `epa_integrator` function object (native or host-backed).
pub fn integrator_generator<F>(settings: IntegrationSettings, build: F) -> Result<Function, FfiError>
where
    F: Fn(&IntegrationSettings, u32) -> Result<Function, FfiError> + Send + Sync + 'static,
{
    let build = Arc::new(build);
    let host = HostFn::with_arity(1, move |args| {
        let level = args[0].as_unsigned().ok_or_else(|| {
            FfiError::SignatureMismatch {
                expected: "unsigned level".to_string(),
                found: args[0].type_name().to_string(),
            }
        })?;
        tracing::trace!(target: "epa::integration", level, "building integrator");
        let integrator = build(&settings, level)?;
        if integrator.shape() != FunctionKind::Integrator {
            return Err(FfiError::SignatureMismatch {
                expected: "epa_integrator*".to_string(),
                found: integrator.descriptor().canonical().to_string(),
            }
            .into());
        }
        Ok(Value::Function(integrator))
    });
    Function::from_host_kind(host, FunctionKind::IntegratorGenerator)
}
