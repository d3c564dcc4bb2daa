//! FFI type system - C-compatible types for the function object boundary
//!
//! Defines:
//! - `RawFunction`: the `epa_function` struct shared with the native library
//! - `FunctionKind`: the registered function object types and their signatures
//! - `ExternType`: C types appearing in those signatures
//! - `CType`: runtime representation of C values
//!
//! Type mapping:
//! - ExternType::CDouble → CType::Double(f64)
//! - ExternType::CUnsigned → CType::Unsigned(u32)
//! - ExternType::CInt → CType::Int(i32)
//! - ExternType::CPolarization → CType::Polarization(Polarization)
//! - ExternType::CVoid → CType::Void
//! - ExternType::Function(kind) → CType::Function(*mut RawFunction)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::raw::c_void;
use std::ptr;

/// Type-erased C function pointer stored in a function object
pub type ErasedFn = unsafe extern "C" fn();

/// Destructor for a function object's user data
pub type Destructor = unsafe extern "C" fn(*mut c_void);

/// Native function object (`struct epa_function`)
///
/// `function` is called with the declared arguments followed by `data`.
/// `destructor`, when set, is invoked on `data` when the object is destroyed.
#[repr(C)]
#[derive(Debug)]
pub struct RawFunction {
    pub function: Option<ErasedFn>,
    pub data: *mut c_void,
    pub destructor: Option<Destructor>,
}

/// Photon polarization pair (`epa_polarization`)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Polarization {
    pub parallel: f64,
    pub perpendicular: f64,
}

impl Polarization {
    pub fn new(parallel: f64, perpendicular: f64) -> Self {
        Self {
            parallel,
            perpendicular,
        }
    }

    /// Unpolarized sum of both components
    pub fn total(&self) -> f64 {
        self.parallel + self.perpendicular
    }
}

/// Function object types registered by the library
///
/// Every kind shares the `RawFunction` layout; only the signature of the
/// stored function pointer differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionKind {
    Function1d,
    Function2d,
    Function3d,
    Integrator,
    IntegratorGenerator,
    LuminosityBF,
    LuminosityYBF,
    LuminosityFidBF,
    XsectionBF,
    XsectionPtB,
}

use ExternType::{CDouble, CPolarization, CUnsigned};

impl FunctionKind {
    pub const ALL: [FunctionKind; 10] = [
        FunctionKind::Function1d,
        FunctionKind::Function2d,
        FunctionKind::Function3d,
        FunctionKind::Integrator,
        FunctionKind::IntegratorGenerator,
        FunctionKind::LuminosityBF,
        FunctionKind::LuminosityYBF,
        FunctionKind::LuminosityFidBF,
        FunctionKind::XsectionBF,
        FunctionKind::XsectionPtB,
    ];

    /// C type name, without the pointer
    pub fn c_name(self) -> &'static str {
        match self {
            FunctionKind::Function1d => "epa_function1d",
            FunctionKind::Function2d => "epa_function2d",
            FunctionKind::Function3d => "epa_function3d",
            FunctionKind::Integrator => "epa_integrator",
            FunctionKind::IntegratorGenerator => "epa_integrator_generator",
            FunctionKind::LuminosityBF => "epa_luminosity_b_f",
            FunctionKind::LuminosityYBF => "epa_luminosity_y_b_f",
            FunctionKind::LuminosityFidBF => "epa_luminosity_fid_b_f",
            FunctionKind::XsectionBF => "epa_xsection_b_f",
            FunctionKind::XsectionPtB => "epa_xsection_pT_b",
        }
    }

    pub fn from_c_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.c_name() == name)
    }

    /// Result type of the stored function pointer
    pub fn result(self) -> ExternType {
        match self {
            FunctionKind::IntegratorGenerator => ExternType::Function(FunctionKind::Integrator),
            FunctionKind::XsectionBF | FunctionKind::XsectionPtB => CPolarization,
            _ => CDouble,
        }
    }

    /// Declared parameters, excluding the trailing user data pointer
    pub fn params(self) -> &'static [ExternType] {
        match self {
            FunctionKind::Function1d => &[CDouble],
            FunctionKind::Function2d => &[CDouble, CDouble],
            FunctionKind::Function3d => &[CDouble, CDouble, CDouble],
            FunctionKind::Integrator => &[
                ExternType::Function(FunctionKind::Function1d),
                CDouble,
                CDouble,
            ],
            FunctionKind::IntegratorGenerator => &[CUnsigned],
            FunctionKind::LuminosityBF => &[CDouble, CPolarization],
            FunctionKind::LuminosityYBF => &[CDouble, CDouble, CPolarization],
            FunctionKind::LuminosityFidBF => &[CDouble, CPolarization, CDouble, CDouble],
            FunctionKind::XsectionBF => &[CDouble],
            FunctionKind::XsectionPtB => &[CDouble, CDouble],
        }
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.c_name())
    }
}

/// C types that appear in function object signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExternType {
    /// C double (f64)
    CDouble,
    /// C unsigned int (u32)
    CUnsigned,
    /// C int (i32)
    CInt,
    /// epa_polarization, passed by value
    CPolarization,
    /// C void (result only)
    CVoid,
    /// void* user data
    COpaque,
    /// Pointer to a registered function object type
    Function(FunctionKind),
}

impl ExternType {
    pub fn is_function(&self) -> bool {
        matches!(self, ExternType::Function(_))
    }
}

impl fmt::Display for ExternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternType::CDouble => f.write_str("double"),
            ExternType::CUnsigned => f.write_str("unsigned"),
            ExternType::CInt => f.write_str("int"),
            ExternType::CPolarization => f.write_str("epa_polarization"),
            ExternType::CVoid => f.write_str("void"),
            ExternType::COpaque => f.write_str("void*"),
            ExternType::Function(kind) => write!(f, "{}*", kind.c_name()),
        }
    }
}

/// C value at the boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CType {
    Double(f64),
    Unsigned(u32),
    Int(i32),
    Polarization(Polarization),
    Void,
    /// Function object pointer, possibly null
    Function(*mut RawFunction),
}

impl CType {
    /// Sentinel returned to native code when a callback fails
    pub fn zero(ty: ExternType) -> CType {
        match ty {
            ExternType::CDouble => CType::Double(0.0),
            ExternType::CUnsigned => CType::Unsigned(0),
            ExternType::CInt => CType::Int(0),
            ExternType::CPolarization => CType::Polarization(Polarization::default()),
            ExternType::CVoid | ExternType::COpaque => CType::Void,
            ExternType::Function(_) => CType::Function(ptr::null_mut()),
        }
    }
}
