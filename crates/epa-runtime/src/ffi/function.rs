//! Function objects as host values
//!
//! A `Function` owns (or borrows) one native function object and the
//! `HandleSet` of everything that object can reach. It is built in one step
//! and immutable afterwards; clones share the object and the last clone
//! releases it, before its handle set.
//!
//! Calls always go through the object's C function pointer, so host-backed
//! and native-backed objects behave the same. Whether a call needs
//! recursive conversion is decided once, at construction:
//! - direct path: every parameter and the result are scalars
//! - marshaled path: function objects are lowered and lifted per call
//!
//! Objects native code passes into a callback arrive as borrowed views
//! tied to a `Lease`; so does anything lifted from a call they took part in.

use crate::ffi::abi;
use crate::ffi::callbacks;
use crate::ffi::error::{self, FfiError};
use crate::ffi::handles::{ClosureToken, HandleSet, KeepAlive, Lease, LeaseGuard, NativeHandle, Release};
use crate::ffi::marshal::{self, CallScope};
use crate::ffi::signature::{descriptor_for_kind, resolve, Signature, TypeDescriptor};
use crate::ffi::types::{ErasedFn, FunctionKind, RawFunction};
use crate::value::{HostFn, Value};
use std::fmt;
use std::os::raw::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

/// How calls are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPath {
    Direct,
    Marshaled,
}

/// A native function object pointer with its ownership
#[derive(Debug)]
pub struct NativePtr {
    raw: *mut RawFunction,
    kind: FunctionKind,
    release: Option<Release>,
}

impl NativePtr {
    /// Pointer owned by the caller, released with the active ABI
    ///
    /// # Safety
    ///
    /// `raw` must be null or a live function object of `kind` allocated by
    /// the active ABI, and nothing else may release it.
    pub unsafe fn owned(raw: *mut RawFunction, kind: FunctionKind) -> Self {
        Self::with_release(raw, kind, abi::current().destroy_function)
    }

    /// Pointer owned by the caller with an explicit release function
    ///
    /// # Safety
    ///
    /// As [`NativePtr::owned`], with `release` able to destroy `raw`.
    pub unsafe fn with_release(raw: *mut RawFunction, kind: FunctionKind, release: Release) -> Self {
        Self {
            raw,
            kind,
            release: Some(release),
        }
    }

    /// Pointer owned elsewhere
    ///
    /// # Safety
    ///
    /// `raw` must be null or a function object of `kind` that outlives the
    /// resulting `Function`.
    pub unsafe fn borrowed(raw: *mut RawFunction, kind: FunctionKind) -> Self {
        Self {
            raw,
            kind,
            release: None,
        }
    }
}

/// What a function object is built from
#[derive(Debug)]
pub enum Source {
    Native(NativePtr),
    Host(HostFn),
}

impl From<HostFn> for Source {
    fn from(host: HostFn) -> Self {
        Source::Host(host)
    }
}

impl From<NativePtr> for Source {
    fn from(ptr: NativePtr) -> Self {
        Source::Native(ptr)
    }
}

/// Shared function object
#[derive(Clone)]
pub struct Function(Arc<FunctionInner>);

// Field order is release order
struct FunctionInner {
    handle: NativeHandle,
    handles: HandleSet,
    descriptor: Arc<TypeDescriptor>,
    path: CallPath,
    host: Option<HostFn>,
    leases: Vec<Lease>,
}

/// Function pointer and user data, valid while the guards live
struct Entry {
    function: ErasedFn,
    data: *mut c_void,
    _leases: Vec<LeaseGuard>,
}

impl Function {
    /// Build a function object
    ///
    /// - native source: a null pointer surfaces the pending error, or
    ///   `NullFunction`; `declared`, when given, must have the kind's signature
    /// - host source: `declared` is required (`MissingType`)
    ///
    /// `handles` are kept alive as long as the result.
    pub fn construct(
        source: Source,
        declared: Option<&str>,
        handles: HandleSet,
    ) -> Result<Self, FfiError> {
        match source {
            Source::Host(host) => {
                let descriptor = resolve(declared.ok_or(FfiError::MissingType)?)?;
                Self::build_host(host, descriptor, handles)
            }
            Source::Native(ptr) => Self::build_native(ptr, declared, handles),
        }
    }

    /// Wrap a host callable with a declared C signature
    ///
    /// ```
    /// # use epa_runtime::{Function, HostFn};
    /// let square = Function::from_host(HostFn::unary(|x| x * x), "double (double)").unwrap();
    /// assert_eq!(square.eval(&[3.0]).unwrap(), 9.0);
    /// ```
    pub fn from_host(host: HostFn, signature: &str) -> Result<Self, FfiError> {
        Self::construct(Source::Host(host), Some(signature), HandleSet::new())
    }

    /// Wrap a host callable as a function object of `kind`
    pub fn from_host_kind(host: HostFn, kind: FunctionKind) -> Result<Self, FfiError> {
        Self::build_host(host, descriptor_for_kind(kind), HandleSet::new())
    }

    /// Take ownership of a native function object
    ///
    /// # Safety
    ///
    /// See [`NativePtr::owned`].
    pub unsafe fn from_native(raw: *mut RawFunction, kind: FunctionKind) -> Result<Self, FfiError> {
        Self::construct(Source::Native(NativePtr::owned(raw, kind)), None, HandleSet::new())
    }

    /// View of an object owned by native code (callback arguments)
    ///
    /// # Safety
    ///
    /// `raw` must stay live until `lease` is revoked.
    pub(crate) unsafe fn borrowed(raw: NonNull<RawFunction>, kind: FunctionKind, lease: Lease) -> Self {
        Self::assemble(
            NativeHandle::borrowed(raw),
            descriptor_for_kind(kind),
            HandleSet::new(),
            None,
            vec![lease],
        )
    }

    fn build_host(
        host: HostFn,
        descriptor: Arc<TypeDescriptor>,
        mut handles: HandleSet,
    ) -> Result<Self, FfiError> {
        let trampoline = callbacks::trampoline_for(&descriptor);
        let token = ClosureToken::new(host.clone());
        let abi = abi::current();

        // The token stays in the handle set, so the object gets no destructor
        // SAFETY: the trampoline matches the descriptor's shape
        let raw = unsafe { abi.make(trampoline.entry(), token.as_data(), None) };
        let Some(raw) = NonNull::new(raw) else {
            error::check()?;
            return Err(FfiError::NullFunction(descriptor.canonical().to_string()));
        };

        // SAFETY: freshly allocated by this ABI
        let handle = unsafe { NativeHandle::owned(raw, abi.destroy_function) };
        handles.push(KeepAlive::Closure(token));
        Ok(Self::assemble(handle, descriptor, handles, Some(host), Vec::new()))
    }

    fn build_native(
        ptr: NativePtr,
        declared: Option<&str>,
        handles: HandleSet,
    ) -> Result<Self, FfiError> {
        let NativePtr { raw, kind, release } = ptr;
        let Some(raw) = NonNull::new(raw) else {
            error::check()?;
            return Err(FfiError::NullFunction(kind.c_name().to_string()));
        };

        // Own the object first so a declared-type failure still releases it
        // SAFETY: upheld by the NativePtr constructors
        let handle = unsafe {
            match release {
                Some(release) => NativeHandle::owned(raw, release),
                None => NativeHandle::borrowed(raw),
            }
        };

        let descriptor = match declared {
            Some(text) => {
                let descriptor = resolve(text)?;
                if descriptor.shape() != kind {
                    return Err(FfiError::mismatch(
                        Signature::for_kind(kind).canonical(),
                        descriptor.signature_text(),
                    ));
                }
                descriptor
            }
            None => descriptor_for_kind(kind),
        };

        Ok(Self::assemble(handle, descriptor, handles, None, Vec::new()))
    }

    pub(crate) fn assemble(
        handle: NativeHandle,
        descriptor: Arc<TypeDescriptor>,
        handles: HandleSet,
        host: Option<HostFn>,
        leases: Vec<Lease>,
    ) -> Self {
        let path = if descriptor.signature().requires_conversion() {
            CallPath::Marshaled
        } else {
            CallPath::Direct
        };
        Self(Arc::new(FunctionInner {
            handle,
            handles,
            descriptor,
            path,
            host,
            leases,
        }))
    }

    /// Call with host values
    ///
    /// Checks the arity against the declared signature, converts the
    /// arguments, calls the function pointer and then consumes any pending
    /// error: a host callback failure surfaces as the error it returned.
    pub fn call(&self, args: &[Value]) -> Result<Value, FfiError> {
        let params = self.signature().leading_params();
        if args.len() != params.len() {
            return Err(FfiError::mismatch(
                format!("{} argument(s) for {}", params.len(), self.0.descriptor),
                format!("{} argument(s)", args.len()),
            ));
        }

        let _call = error::enter();
        let Entry { function, data, _leases } = self.entry()?;
        match self.0.path {
            CallPath::Direct => {
                let c_args = args
                    .iter()
                    .zip(params)
                    .map(|(value, ty)| {
                        marshal::lower_scalar(value, *ty)
                            .ok_or_else(|| FfiError::mismatch(ty.to_string(), value.type_name()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                // SAFETY: the object's function pointer has the descriptor's shape
                let result = unsafe { callbacks::call_native(self.shape(), function, &c_args, data) }?;
                error::check()?;
                Ok(marshal::lift_scalar(result))
            }
            CallPath::Marshaled => {
                let mut scope = CallScope::new();
                let c_args = args
                    .iter()
                    .zip(params)
                    .map(|(value, ty)| scope.lower(value, *ty))
                    .collect::<Result<Vec<_>, _>>()?;

                // SAFETY: as above; lowered arguments live in `scope`
                let result = unsafe { callbacks::call_native(self.shape(), function, &c_args, data) }?;
                let value = scope.lift_value(result, self.signature().result())?;
                error::check()?;
                Ok(value)
            }
        }
    }

    /// Evaluate an all-`double` function object (1-D, 2-D or 3-D)
    pub fn eval(&self, args: &[f64]) -> Result<f64, FfiError> {
        let _call = error::enter();
        let Entry { function, data, _leases } = self.entry()?;
        // SAFETY: the object's function pointer has the descriptor's shape
        let value = unsafe { callbacks::eval_doubles(self.shape(), function, args, data) }
            .ok_or_else(|| {
                FfiError::mismatch(
                    self.0.descriptor.signature_text(),
                    format!("{} double argument(s)", args.len()),
                )
            })?;
        error::check()?;
        Ok(value)
    }

    fn entry(&self) -> Result<Entry, FfiError> {
        let leases = self.hold_leases()?;
        let (function, data) = self.0.handle.entry();
        let function =
            function.ok_or_else(|| FfiError::NullFunction(self.0.descriptor.canonical().to_string()))?;
        Ok(Entry {
            function,
            data,
            _leases: leases,
        })
    }

    /// Guards for every lease this object depends on
    pub(crate) fn hold_leases(&self) -> Result<Vec<LeaseGuard>, FfiError> {
        self.0
            .leases
            .iter()
            .map(|lease| lease.hold())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| FfiError::Expired(self.0.descriptor.canonical().to_string()))
    }

    /// Leases of objects lent by native code that this object depends on
    pub fn leases(&self) -> &[Lease] {
        &self.0.leases
    }

    /// Whether a lent object behind this value has been taken back
    pub fn is_expired(&self) -> bool {
        self.0.leases.iter().any(Lease::is_revoked)
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.0.descriptor
    }

    pub fn signature(&self) -> &Signature {
        self.0.descriptor.signature()
    }

    pub fn shape(&self) -> FunctionKind {
        self.0.descriptor.shape()
    }

    pub fn path(&self) -> CallPath {
        self.0.path
    }

    pub fn is_direct(&self) -> bool {
        self.0.path == CallPath::Direct
    }

    /// Pointer to pass to native code; valid while this value lives
    pub fn as_ptr(&self) -> *mut RawFunction {
        self.0.handle.as_ptr()
    }

    pub fn is_owned(&self) -> bool {
        self.0.handle.is_owned()
    }

    /// The host callable behind a host-backed object
    pub fn host(&self) -> Option<&HostFn> {
        self.0.host.as_ref()
    }

    pub fn handles(&self) -> &HandleSet {
        &self.0.handles
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("type", &self.0.descriptor.canonical())
            .field("ptr", &self.as_ptr())
            .field("path", &self.0.path)
            .field("handles", &self.0.handles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::types::Polarization;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_host_requires_declared_type() {
        let result = Function::construct(Source::Host(HostFn::unary(|x| x)), None, HandleSet::new());
        assert!(matches!(result, Err(FfiError::MissingType)));
    }

    #[test]
    fn test_host_invalid_declared_type() {
        let result = Function::from_host(HostFn::unary(|x| x), "double (string)");
        assert!(matches!(result, Err(FfiError::InvalidSignature { .. })));
    }

    #[test]
    fn test_path_decided_at_construction() {
        let f = Function::from_host(HostFn::unary(|x| x), "double (double)").unwrap();
        assert!(f.is_direct());
        assert_eq!(f.handles().len(), 1);

        let integrator = Function::from_host_kind(
            HostFn::new(|_| Ok(Value::Number(0.0))),
            FunctionKind::Integrator,
        )
        .unwrap();
        assert_eq!(integrator.path(), CallPath::Marshaled);
    }

    #[test]
    fn test_call_arity_checked() {
        let f = Function::from_host(HostFn::binary(|x, y| x - y), "double (double, double)").unwrap();
        assert!(matches!(f.call(&[1.0.into()]), Err(FfiError::SignatureMismatch { .. })));
        assert_eq!(f.call(&[5.0.into(), 2.0.into()]).unwrap(), Value::Number(3.0));
    }

    #[test]
    fn test_call_argument_type_checked() {
        let f = Function::from_host(HostFn::unary(|x| x), "double (double)").unwrap();
        let result = f.call(&[Value::Polarization(Polarization::default())]);
        assert!(matches!(result, Err(FfiError::SignatureMismatch { .. })));
    }

    #[test]
    fn test_polarization_signature() {
        let lum = Function::from_host(
            HostFn::with_arity(2, |args| {
                let x = args[0].as_number().unwrap_or_default();
                let p = args[1].as_polarization().unwrap_or_default();
                Ok(Value::Number(x * p.total()))
            }),
            "double (double, epa_polarization)",
        )
        .unwrap();
        let result = lum
            .call(&[2.0.into(), Polarization::new(1.0, 0.5).into()])
            .unwrap();
        assert_eq!(result, Value::Number(3.0));
    }

    #[test]
    fn test_eval_rejects_non_scalar_shape() {
        let f = Function::from_host(
            HostFn::new(|_| Ok(Value::Polarization(Polarization::default()))),
            "epa_polarization (double)",
        )
        .unwrap();
        assert!(matches!(f.eval(&[1.0]), Err(FfiError::SignatureMismatch { .. })));
    }

    #[test]
    fn test_native_null_without_error() {
        let result = unsafe { Function::from_native(std::ptr::null_mut(), FunctionKind::Function1d) };
        assert!(matches!(result, Err(FfiError::NullFunction(_))));
    }

    #[test]
    fn test_clone_shares_object() {
        let f = Function::from_host(HostFn::unary(|x| x + 1.0), "double (double)").unwrap();
        let g = f.clone();
        assert!(f.ptr_eq(&g));
        assert_eq!(f.as_ptr(), g.as_ptr());
        drop(f);
        assert_eq!(g.eval(&[1.0]).unwrap(), 2.0);
    }
}
