//! Callback trampolines - let native code call host callables
//!
//! Every function object kind has one static `extern "C"` trampoline,
//! generated below from the table of library signatures. A host-backed
//! function object stores the trampoline of its shape as its function
//! pointer and a `ClosureToken` as its user data; the trampoline recovers
//! the callable from the trailing user data argument.
//!
//! A failing callback never unwinds into native code: the failure goes to
//! the error channel and the trampoline returns the zero sentinel of its
//! result type.

use crate::ffi::error::{self, CallbackPanic, FfiError};
use crate::ffi::handles::{ClosureToken, Lease};
use crate::ffi::marshal;
use crate::ffi::signature::TypeDescriptor;
use crate::ffi::types::{CType, ErasedFn, ExternType, FunctionKind, Polarization, RawFunction};
use crate::value::HostError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Mutex, OnceLock, PoisonError};

/// Rust types passed by value across the boundary
pub(crate) trait Boundary: Copy {
    fn from_ctype(value: CType) -> Option<Self>;
    fn into_ctype(self) -> CType;
    fn zero() -> Self;
}

impl Boundary for f64 {
    fn from_ctype(value: CType) -> Option<Self> {
        match value {
            CType::Double(x) => Some(x),
            _ => None,
        }
    }
    fn into_ctype(self) -> CType {
        CType::Double(self)
    }
    fn zero() -> Self {
        0.0
    }
}

impl Boundary for u32 {
    fn from_ctype(value: CType) -> Option<Self> {
        match value {
            CType::Unsigned(x) => Some(x),
            _ => None,
        }
    }
    fn into_ctype(self) -> CType {
        CType::Unsigned(self)
    }
    fn zero() -> Self {
        0
    }
}

impl Boundary for Polarization {
    fn from_ctype(value: CType) -> Option<Self> {
        match value {
            CType::Polarization(p) => Some(p),
            _ => None,
        }
    }
    fn into_ctype(self) -> CType {
        CType::Polarization(self)
    }
    fn zero() -> Self {
        Polarization::default()
    }
}

impl Boundary for *mut RawFunction {
    fn from_ctype(value: CType) -> Option<Self> {
        match value {
            CType::Function(p) => Some(p),
            _ => None,
        }
    }
    fn into_ctype(self) -> CType {
        CType::Function(self)
    }
    fn zero() -> Self {
        ptr::null_mut()
    }
}

macro_rules! trampolines {
    ($($kind:ident: fn($($arg:ident: $ty:ty),*) -> $ret:ty;)*) => {
        /// Static entry point for host callables of the given shape
        pub(crate) fn entry_point(kind: FunctionKind) -> ErasedFn {
            match kind {
                $(FunctionKind::$kind => {
                    unsafe extern "C" fn trampoline($($arg: $ty,)* data: *mut c_void) -> $ret {
                        dispatch::<$ret>(FunctionKind::$kind, &[$($arg.into_ctype()),*], data)
                    }
                    let typed: unsafe extern "C" fn($($ty,)* *mut c_void) -> $ret = trampoline;
                    // SAFETY: only ever called back through the same signature
                    unsafe { std::mem::transmute::<_, ErasedFn>(typed) }
                })*
            }
        }

        /// Call a function object's function pointer with converted arguments
        ///
        /// # Safety
        ///
        /// `function` must have the signature of `kind` and `data` must be
        /// the user data of the same object.
        pub(crate) unsafe fn call_native(
            kind: FunctionKind,
            function: ErasedFn,
            args: &[CType],
            data: *mut c_void,
        ) -> Result<CType, FfiError> {
            match kind {
                $(FunctionKind::$kind => {
                    let typed: unsafe extern "C" fn($($ty,)* *mut c_void) -> $ret =
                        std::mem::transmute(function);
                    let [$($arg),*] = args else {
                        return Err(FfiError::mismatch(
                            format!("{} argument(s)", kind.params().len()),
                            format!("{} argument(s)", args.len()),
                        ));
                    };
                    $(let $arg = <$ty as Boundary>::from_ctype(*$arg).ok_or_else(|| {
                        FfiError::mismatch(stringify!($ty), format!("{:?}", $arg))
                    })?;)*
                    Ok(typed($($arg,)* data).into_ctype())
                })*
            }
        }
    };
}

trampolines! {
    Function1d: fn(x: f64) -> f64;
    Function2d: fn(x: f64, y: f64) -> f64;
    Function3d: fn(x: f64, y: f64, z: f64) -> f64;
    Integrator: fn(f: *mut RawFunction, a: f64, b: f64) -> f64;
    IntegratorGenerator: fn(level: u32) -> *mut RawFunction;
    LuminosityBF: fn(x: f64, p: Polarization) -> f64;
    LuminosityYBF: fn(x: f64, y: f64, p: Polarization) -> f64;
    LuminosityFidBF: fn(x: f64, p: Polarization, y: f64, z: f64) -> f64;
    XsectionBF: fn(x: f64) -> Polarization;
    XsectionPtB: fn(x: f64, y: f64) -> Polarization;
}

/// All-`double` evaluation without building `CType`s
///
/// Returns `None` when `kind` is not a scalar function of `args.len()` doubles.
///
/// # Safety
///
/// Same contract as [`call_native`].
pub(crate) unsafe fn eval_doubles(
    kind: FunctionKind,
    function: ErasedFn,
    args: &[f64],
    data: *mut c_void,
) -> Option<f64> {
    type F1 = unsafe extern "C" fn(f64, *mut c_void) -> f64;
    type F2 = unsafe extern "C" fn(f64, f64, *mut c_void) -> f64;
    type F3 = unsafe extern "C" fn(f64, f64, f64, *mut c_void) -> f64;

    match (kind, args) {
        (FunctionKind::Function1d, &[x]) => Some(std::mem::transmute::<_, F1>(function)(x, data)),
        (FunctionKind::Function2d, &[x, y]) => {
            Some(std::mem::transmute::<_, F2>(function)(x, y, data))
        }
        (FunctionKind::Function3d, &[x, y, z]) => {
            Some(std::mem::transmute::<_, F3>(function)(x, y, z, data))
        }
        _ => None,
    }
}

fn dispatch<R: Boundary>(kind: FunctionKind, args: &[CType], data: *mut c_void) -> R {
    // Objects in the arguments belong to the native caller
    let lease = kind
        .params()
        .iter()
        .any(|ty| matches!(ty, ExternType::Function(_)))
        .then(Lease::new);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| invoke_host(kind, args, data, lease.as_ref())));
    if let Some(lease) = &lease {
        lease.revoke();
    }

    let err: HostError = match outcome {
        Ok(Ok(value)) => match R::from_ctype(value) {
            Some(result) => return result,
            None => Box::new(FfiError::mismatch(kind.result().to_string(), format!("{:?}", value))),
        },
        Ok(Err(err)) => err,
        Err(payload) => Box::new(CallbackPanic::from_payload(payload)),
    };

    tracing::trace!(target: "epa::ffi::callbacks", %kind, error = %err, "host callback failed");
    error::raise_host(err);
    R::zero()
}

fn invoke_host(
    kind: FunctionKind,
    args: &[CType],
    data: *mut c_void,
    lease: Option<&Lease>,
) -> Result<CType, HostError> {
    // SAFETY: host-backed objects carry a live token (or transferred box) as data
    let host = unsafe { ClosureToken::recover(data) }
        .ok_or_else(|| FfiError::NullFunction("closure data".to_string()))?;

    let values = args
        .iter()
        .zip(kind.params())
        .map(|(value, ty)| marshal::lift_callback_arg(*value, *ty, lease))
        .collect::<Result<Vec<_>, _>>()?;

    let result = host.invoke(&values)?;
    Ok(marshal::lower_callback_result(result, kind.result())?)
}

/// Entry point bound to a descriptor's shape
#[derive(Debug, Clone, Copy)]
pub struct Trampoline {
    kind: FunctionKind,
    entry: ErasedFn,
}

impl Trampoline {
    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn entry(&self) -> ErasedFn {
        self.entry
    }

    pub fn same_entry(&self, other: &Trampoline) -> bool {
        self.entry as usize == other.entry as usize
    }
}

static TRAMPOLINES: OnceLock<Mutex<HashMap<String, Trampoline>>> = OnceLock::new();

thread_local! {
    static LOCAL_TRAMPOLINES: RefCell<HashMap<String, Trampoline>> = RefCell::new(HashMap::new());
}

/// Trampoline for a descriptor, cached by canonical function signature
pub fn trampoline_for(descriptor: &TypeDescriptor) -> Trampoline {
    let key = descriptor.signature_text();
    if let Some(found) = LOCAL_TRAMPOLINES.with(|local| local.borrow().get(key).copied()) {
        return found;
    }

    let trampoline = {
        let mut map = registry().lock().unwrap_or_else(PoisonError::into_inner);
        *map.entry(key.to_string()).or_insert_with(|| {
            tracing::debug!(target: "epa::ffi::callbacks", signature = key, "trampoline materialized");
            Trampoline {
                kind: descriptor.shape(),
                entry: entry_point(descriptor.shape()),
            }
        })
    };

    LOCAL_TRAMPOLINES.with(|local| local.borrow_mut().insert(key.to_string(), trampoline));
    trampoline
}

/// Number of distinct trampolines materialized process-wide
pub fn trampoline_count() -> usize {
    registry().lock().unwrap_or_else(PoisonError::into_inner).len()
}

fn registry() -> &'static Mutex<HashMap<String, Trampoline>> {
    TRAMPOLINES.get_or_init(|| Mutex::new(HashMap::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::signature::{descriptor_for_kind, resolve};
    use crate::value::{HostFn, Value};

    fn call_through(kind: FunctionKind, host: HostFn, args: &[CType]) -> Result<CType, FfiError> {
        let token = ClosureToken::new(host);
        let entry = entry_point(kind);
        let result = unsafe { call_native(kind, entry, args, token.as_data()) }?;
        error::check()?;
        Ok(result)
    }

    #[test]
    fn test_trampoline_scalar_round_trip() {
        let host = HostFn::binary(|x, y| x * y);
        let result = call_through(
            FunctionKind::Function2d,
            host,
            &[CType::Double(3.0), CType::Double(4.0)],
        )
        .unwrap();
        assert_eq!(result, CType::Double(12.0));
    }

    #[test]
    fn test_trampoline_polarization_result() {
        let host = HostFn::new(|args| {
            let x = args[0].as_number().unwrap_or_default();
            Ok(Value::Polarization(Polarization::new(x, 2.0 * x)))
        });
        let result = call_through(FunctionKind::XsectionBF, host, &[CType::Double(1.5)]).unwrap();
        assert_eq!(result, CType::Polarization(Polarization::new(1.5, 3.0)));
    }

    #[test]
    fn test_failure_returns_sentinel_and_sets_channel() {
        let host = HostFn::unary(|_| Err::<f64, _>("always fails"));
        let token = ClosureToken::new(host);
        let entry = entry_point(FunctionKind::Function1d);
        let result = unsafe {
            call_native(FunctionKind::Function1d, entry, &[CType::Double(1.0)], token.as_data())
        }
        .unwrap();
        assert_eq!(result, CType::Double(0.0));
        assert!(error::is_pending());
        assert!(matches!(error::check(), Err(FfiError::HostCallback(_))));
    }

    #[test]
    fn test_panic_is_contained() {
        let host = HostFn::unary(|x| -> f64 { panic!("bad x {}", x) });
        let err = call_through(FunctionKind::Function1d, host, &[CType::Double(2.0)]).unwrap_err();
        let panic = err.downcast_host::<CallbackPanic>().unwrap();
        assert!(panic.message.contains("bad x 2"));
    }

    #[test]
    fn test_wrong_result_type_is_mismatch() {
        let host = HostFn::new(|_| Ok(Value::Polarization(Polarization::default())));
        let err = call_through(FunctionKind::Function1d, host, &[CType::Double(0.0)]).unwrap_err();
        assert!(matches!(err, FfiError::SignatureMismatch { .. }));
    }

    #[test]
    fn test_call_native_checks_arguments() {
        let token = ClosureToken::new(HostFn::unary(|x| x));
        let entry = entry_point(FunctionKind::Function1d);
        let result = unsafe { call_native(FunctionKind::Function1d, entry, &[], token.as_data()) };
        assert!(matches!(result, Err(FfiError::SignatureMismatch { .. })));

        let result = unsafe {
            call_native(FunctionKind::Function1d, entry, &[CType::Unsigned(1)], token.as_data())
        };
        assert!(matches!(result, Err(FfiError::SignatureMismatch { .. })));
    }

    #[test]
    fn test_eval_doubles() {
        let token = ClosureToken::new(HostFn::ternary(|x, y, z| x + y + z));
        let entry = entry_point(FunctionKind::Function3d);
        let sum = unsafe { eval_doubles(FunctionKind::Function3d, entry, &[1.0, 2.0, 3.0], token.as_data()) };
        assert_eq!(sum, Some(6.0));
        let wrong = unsafe { eval_doubles(FunctionKind::Function3d, entry, &[1.0], token.as_data()) };
        assert_eq!(wrong, None);
    }

    #[test]
    fn test_trampoline_shared_between_spellings() {
        let a = trampoline_for(&resolve("double (double)").unwrap());
        let b = trampoline_for(&descriptor_for_kind(FunctionKind::Function1d));
        assert!(a.same_entry(&b));
        assert_eq!(a.kind(), FunctionKind::Function1d);

        let c = trampoline_for(&descriptor_for_kind(FunctionKind::Function2d));
        assert!(!a.same_entry(&c));
    }
}
