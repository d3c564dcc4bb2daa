//! Type marshaling - host values ↔ C values
//!
//! Call side (host calling native):
//! - `CallScope::lower()`: host value → C value; function objects and host
//!   callables are registered in the scope's `HandleSet`
//! - `CallScope::lift()`: returned function object → owning `Function`
//!   that inherits the scope's `HandleSet`
//!
//! Callback side (native calling host):
//! - `lift_callback_arg()`: function object arguments become borrowed
//!   `Function`s, valid until the callback's `Lease` is revoked
//! - `lower_callback_result()`: function object results are freshly
//!   allocated and owned by the native caller
//!
//! # Memory Safety
//!
//! Everything lowered during one native call stays alive until the scope is
//! dropped, or for as long as the object lifted from that call lives.
//! Borrowed views passed as arguments are held (their leases cannot be
//! revoked) for the duration of the call, and a lifted result depends on
//! the same leases.

use crate::ffi::abi;
use crate::ffi::callbacks;
use crate::ffi::error::{self, FfiError};
use crate::ffi::function::Function;
use crate::ffi::handles::{
    release_closure_data, ClosureToken, HandleSet, KeepAlive, Lease, LeaseGuard, NativeHandle,
};
use crate::ffi::signature::{descriptor_for_kind, TypeDescriptor};
use crate::ffi::types::{CType, ExternType, FunctionKind, RawFunction};
use crate::value::{HostFn, Value};
use std::ptr::{self, NonNull};

/// Conversion state of one native call
///
/// # Example
///
/// ```
/// # use epa_runtime::ffi::{CallScope, CType, ExternType};
/// # use epa_runtime::value::Value;
/// let mut scope = CallScope::new();
/// let x = scope.lower(&Value::Number(2.5), ExternType::CDouble).unwrap();
/// assert_eq!(x, CType::Double(2.5));
/// assert!(scope.handles().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct CallScope {
    handles: HandleSet,
    leases: Vec<Lease>,
    held: Vec<LeaseGuard>,
}

impl CallScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower an argument to the declared C type
    pub fn lower(&mut self, value: &Value, ty: ExternType) -> Result<CType, FfiError> {
        if let ExternType::Function(kind) = ty {
            return self.lower_function(value, kind).map(CType::Function);
        }
        lower_scalar(value, ty)
            .ok_or_else(|| FfiError::mismatch(ty.to_string(), value.type_name()))
    }

    /// Lower a function-valued argument
    ///
    /// `Value::Null` lowers to a null pointer for optional arguments.
    pub fn lower_function(
        &mut self,
        value: &Value,
        kind: FunctionKind,
    ) -> Result<*mut RawFunction, FfiError> {
        match value {
            Value::Function(function) => {
                if function.shape() != kind {
                    return Err(FfiError::mismatch(
                        format!("{}*", kind.c_name()),
                        function.descriptor().canonical(),
                    ));
                }
                self.hold(function)?;
                let raw = function.as_ptr();
                if !self.handles.contains_function(function) {
                    self.handles.push(KeepAlive::Function(function.clone()));
                }
                Ok(raw)
            }
            Value::Callable(host) => {
                let function = Function::from_host_kind(host.clone(), kind)?;
                let raw = function.as_ptr();
                self.handles.push(KeepAlive::Function(function));
                Ok(raw)
            }
            Value::Null => Ok(ptr::null_mut()),
            other => Err(FfiError::mismatch(format!("{}*", kind.c_name()), other.type_name())),
        }
    }

    /// Lower two function arguments, passing one object when both are the same
    ///
    /// The first object is required. A `Value::Null` second object means
    /// "the same as the first".
    pub fn lower_pair(
        &mut self,
        first: &Value,
        second: &Value,
        kind: FunctionKind,
    ) -> Result<(*mut RawFunction, *mut RawFunction), FfiError> {
        if matches!(first, Value::Null) {
            return Err(FfiError::mismatch(format!("{}*", kind.c_name()), first.type_name()));
        }
        let a = self.lower_function(first, kind)?;
        let b = if matches!(second, Value::Null) || first.same_object(second) {
            a
        } else {
            self.lower_function(second, kind)?
        };
        Ok((a, b))
    }

    /// Hold the leases of a lent object for the rest of the call
    fn hold(&mut self, function: &Function) -> Result<(), FfiError> {
        for lease in function.leases() {
            if self.leases.iter().any(|held| held.same(lease)) {
                continue;
            }
            let guard = lease
                .hold()
                .ok_or_else(|| FfiError::Expired(function.descriptor().canonical().to_string()))?;
            self.held.push(guard);
            self.leases.push(lease.clone());
        }
        Ok(())
    }

    /// Keep an additional resource alive with whatever this call returns
    pub fn keep(&mut self, entry: KeepAlive) {
        self.handles.push(entry);
    }

    pub fn handles(&self) -> &HandleSet {
        &self.handles
    }

    pub fn into_handles(self) -> HandleSet {
        self.handles
    }

    /// Post-call error check
    pub fn check(&self) -> Result<(), FfiError> {
        error::check()
    }

    /// Take ownership of a returned function object
    ///
    /// A null result surfaces the pending error, or `NullFunction` when
    /// nothing is pending.
    pub fn lift(self, raw: *mut RawFunction, kind: FunctionKind) -> Result<Function, FfiError> {
        let Some(raw) = NonNull::new(raw) else {
            error::check()?;
            return Err(FfiError::NullFunction(kind.c_name().to_string()));
        };

        // SAFETY: native results are owned by the caller and come from the active allocator
        let handle = unsafe { NativeHandle::owned(raw, abi::current().destroy_function) };
        Ok(Function::assemble(
            handle,
            descriptor_for_kind(kind),
            self.handles,
            None,
            self.leases,
        ))
    }

    /// Lift a returned C value of the declared type
    pub fn lift_value(self, value: CType, ty: ExternType) -> Result<Value, FfiError> {
        match (value, ty) {
            (CType::Function(raw), ExternType::Function(kind)) => {
                self.lift(raw, kind).map(Value::Function)
            }
            (other, _) => Ok(lift_scalar(other)),
        }
    }
}

/// Scalar conversion; `None` when the value does not fit the type
pub(crate) fn lower_scalar(value: &Value, ty: ExternType) -> Option<CType> {
    match (value, ty) {
        (Value::Number(n), ExternType::CDouble) => Some(CType::Double(*n)),
        (Value::Unsigned(u), ExternType::CDouble) => Some(CType::Double(f64::from(*u))),
        (Value::Int(i), ExternType::CDouble) => Some(CType::Double(f64::from(*i))),

        (Value::Int(i), ExternType::CInt) => Some(CType::Int(*i)),
        (Value::Unsigned(u), ExternType::CInt) => i32::try_from(*u).ok().map(CType::Int),
        (Value::Number(n), ExternType::CInt) => {
            let in_range = *n >= f64::from(i32::MIN) && *n <= f64::from(i32::MAX);
            (in_range && n.fract() == 0.0).then(|| CType::Int(*n as i32))
        }

        (_, ExternType::CUnsigned) => value.as_unsigned().map(CType::Unsigned),

        (Value::Polarization(p), ExternType::CPolarization) => Some(CType::Polarization(*p)),
        (Value::Null, ExternType::CVoid) => Some(CType::Void),
        _ => None,
    }
}

pub(crate) fn lift_scalar(value: CType) -> Value {
    match value {
        CType::Double(x) => Value::Number(x),
        CType::Unsigned(u) => Value::Unsigned(u),
        CType::Int(i) => Value::Int(i),
        CType::Polarization(p) => Value::Polarization(p),
        // Function results are lifted through a CallScope
        CType::Void | CType::Function(_) => Value::Null,
    }
}

/// Convert an argument native code passed into a callback
///
/// Function objects become views valid until `lease` is revoked.
pub(crate) fn lift_callback_arg(
    value: CType,
    ty: ExternType,
    lease: Option<&Lease>,
) -> Result<Value, FfiError> {
    match (value, ty) {
        (CType::Function(raw), ExternType::Function(kind)) => match (NonNull::new(raw), lease) {
            // SAFETY: the native caller keeps the object alive until the callback returns,
            // which is when the lease is revoked
            (Some(raw), Some(lease)) => {
                Ok(Value::Function(unsafe { Function::borrowed(raw, kind, lease.clone()) }))
            }
            (Some(_), None) => Err(FfiError::mismatch("leased function object", "unleased pointer")),
            (None, _) => Ok(Value::Null),
        },
        (CType::Function(_), other) => Err(FfiError::mismatch(other.to_string(), "function object")),
        (scalar, _) => Ok(lift_scalar(scalar)),
    }
}

/// Convert a callback's result for the native caller
///
/// Function results are newly allocated objects owned by the caller, who
/// destroys them (running the destructor that frees the closure). A
/// borrowed view returned as the result is forwarded; calling the result
/// after the view's lease is revoked fails with `Expired`.
pub(crate) fn lower_callback_result(value: Value, ty: ExternType) -> Result<CType, FfiError> {
    let ExternType::Function(kind) = ty else {
        return lower_scalar(&value, ty)
            .ok_or_else(|| FfiError::mismatch(ty.to_string(), value.type_name()));
    };

    let host = match value {
        Value::Callable(host) => host,
        Value::Function(function) if function.shape() == kind => match function.host() {
            Some(host) => host.clone(),
            None => forwarding(function),
        },
        other => {
            return Err(FfiError::mismatch(
                format!("{}*", kind.c_name()),
                match &other {
                    Value::Function(f) => f.descriptor().canonical().to_string(),
                    _ => other.type_name().to_string(),
                },
            ))
        }
    };

    transfer(host, &descriptor_for_kind(kind)).map(CType::Function)
}

/// Host callable that forwards to a native-backed function object
fn forwarding(function: Function) -> HostFn {
    HostFn::with_arity(function.signature().arity(), move |args| {
        function.call(args).map_err(Into::into)
    })
}

/// Allocate a function object whose closure is owned by the object itself
fn transfer(host: HostFn, descriptor: &TypeDescriptor) -> Result<*mut RawFunction, FfiError> {
    let trampoline = callbacks::trampoline_for(descriptor);
    let token = ClosureToken::new(host);
    let abi = abi::current();
    // SAFETY: the trampoline matches the descriptor's shape; the object owns the token
    let raw = unsafe { abi.make(trampoline.entry(), token.as_data(), Some(release_closure_data)) };
    if raw.is_null() {
        error::check()?;
        return Err(FfiError::NullFunction(descriptor.canonical().to_string()));
    }
    let _ = token.into_data();
    Ok(raw)
}
