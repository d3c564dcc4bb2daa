//! EPA Runtime - function objects for the EPA photon flux library
//!
//! This library lets host code and the native EPA library exchange
//! callables:
//! - Host closures become C function objects (static trampolines + user data)
//! - Native function objects become callable host values
//! - Callback failures cross native frames through a thread-local error channel
//! - Typed bindings to spectra, luminosities and cross sections
//!
//! ```
//! use epa_runtime::{Function, FunctionKind, HostFn};
//!
//! let square = Function::from_host_kind(HostFn::unary(|x| x * x), FunctionKind::Function1d).unwrap();
//! assert_eq!(square.eval(&[3.0]).unwrap(), 9.0);
//! ```

/// EPA runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod ffi;
pub mod grid;
pub mod integration;
pub mod logging;
pub mod value;

pub use ffi::{
    CallPath, CallScope, CquadOptions, EpaLibrary, FfiError, FiducialCuts, Function, FunctionKind,
    HandleSet, KeepAlive, Polarization, QagOptions, TypeDescriptor,
};
pub use grid::{sample, sample_parallel, Grid, GridError, SampledFunction};
pub use integration::{integrator_generator, IntegrationSettings};
pub use value::{HostError, HostFn, HostResult, Value};

pub use epa_config::{Config, ConfigLoader, IntegrationMethod};
