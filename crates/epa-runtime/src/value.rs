//! Host-side values and callables
//!
//! `Value` is what crosses a function object call from the host's point of
//! view: scalars, polarization pairs and function objects. `HostFn` is a
//! shareable host callable with an optional fixed arity.

use crate::ffi::error::FfiError;
use crate::ffi::function::Function;
use crate::ffi::types::Polarization;
use std::fmt;
use std::sync::Arc;

/// Error returned by a host callable; preserved across the native boundary
pub type HostError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type HostResult = Result<Value, HostError>;

/// Value passed to or returned from a function object
#[derive(Clone)]
pub enum Value {
    /// No value (void result, or an absent optional function argument)
    Null,
    Number(f64),
    Unsigned(u32),
    Int(i32),
    Polarization(Polarization),
    /// A function object
    Function(Function),
    /// A host callable not yet lowered to a function object
    Callable(HostFn),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Number(_) => "number",
            Value::Unsigned(_) => "unsigned",
            Value::Int(_) => "int",
            Value::Polarization(_) => "polarization",
            Value::Function(_) => "function",
            Value::Callable(_) => "callable",
        }
    }

    /// Numeric value, widening integers
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Unsigned(u) => Some(f64::from(*u)),
            Value::Int(i) => Some(f64::from(*i)),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u32> {
        match self {
            Value::Unsigned(u) => Some(*u),
            Value::Int(i) => u32::try_from(*i).ok(),
            Value::Number(n) if n.fract() == 0.0 && *n >= 0.0 && *n <= f64::from(u32::MAX) => {
                Some(*n as u32)
            }
            _ => None,
        }
    }

    pub fn as_polarization(&self) -> Option<Polarization> {
        match self {
            Value::Polarization(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Whether both values refer to the same function object or callable
    pub fn same_object(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Callable(a), Value::Callable(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Unsigned(a), Value::Unsigned(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Polarization(a), Value::Polarization(b)) => a == b,
            _ => self.same_object(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::Unsigned(u) => write!(f, "Unsigned({})", u),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Polarization(p) => write!(f, "Polarization({}, {})", p.parallel, p.perpendicular),
            Value::Function(func) => write!(f, "Function({:?})", func),
            Value::Callable(host) => write!(f, "Callable({:?})", host),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<u32> for Value {
    fn from(u: u32) -> Self {
        Value::Unsigned(u)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i)
    }
}

impl From<Polarization> for Value {
    fn from(p: Polarization) -> Self {
        Value::Polarization(p)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

impl From<HostFn> for Value {
    fn from(host: HostFn) -> Self {
        Value::Callable(host)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

/// Conversion of a typed closure's return into a host result
pub trait IntoHostResult {
    fn into_host_result(self) -> HostResult;
}

macro_rules! plain_host_result {
    ($($ty:ty),*) => {
        $(impl IntoHostResult for $ty {
            fn into_host_result(self) -> HostResult {
                Ok(Value::from(self))
            }
        })*
    };
}

plain_host_result!(f64, u32, i32, Polarization, Function, ());

impl IntoHostResult for Value {
    fn into_host_result(self) -> HostResult {
        Ok(self)
    }
}

impl<T, E> IntoHostResult for Result<T, E>
where
    T: Into<Value>,
    E: Into<HostError>,
{
    fn into_host_result(self) -> HostResult {
        self.map(Into::into).map_err(Into::into)
    }
}

type HostCallable = dyn Fn(&[Value]) -> HostResult + Send + Sync;

/// Shareable host callable
#[derive(Clone)]
pub struct HostFn {
    inner: Arc<HostCallable>,
    arity: Option<usize>,
}

impl HostFn {
    /// Wrap a callable taking any number of arguments
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> HostResult + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(f),
            arity: None,
        }
    }

    /// Wrap a callable that must receive exactly `arity` arguments
    pub fn with_arity<F>(arity: usize, f: F) -> Self
    where
        F: Fn(&[Value]) -> HostResult + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(f),
            arity: Some(arity),
        }
    }

    /// One numeric argument
    pub fn unary<F, R>(f: F) -> Self
    where
        F: Fn(f64) -> R + Send + Sync + 'static,
        R: IntoHostResult,
    {
        Self::with_arity(1, move |args| f(number(args, 0)?).into_host_result())
    }

    /// Two numeric arguments
    pub fn binary<F, R>(f: F) -> Self
    where
        F: Fn(f64, f64) -> R + Send + Sync + 'static,
        R: IntoHostResult,
    {
        Self::with_arity(2, move |args| {
            f(number(args, 0)?, number(args, 1)?).into_host_result()
        })
    }

    /// Three numeric arguments
    pub fn ternary<F, R>(f: F) -> Self
    where
        F: Fn(f64, f64, f64) -> R + Send + Sync + 'static,
        R: IntoHostResult,
    {
        Self::with_arity(3, move |args| {
            f(number(args, 0)?, number(args, 1)?, number(args, 2)?).into_host_result()
        })
    }

    pub fn arity(&self) -> Option<usize> {
        self.arity
    }

    /// Call with an arity check
    pub fn invoke(&self, args: &[Value]) -> HostResult {
        if let Some(arity) = self.arity {
            if args.len() != arity {
                return Err(Box::new(FfiError::mismatch(
                    format!("{} argument(s)", arity),
                    format!("{} argument(s)", args.len()),
                )));
            }
        }
        (self.inner)(args)
    }

    pub fn ptr_eq(&self, other: &HostFn) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFn")
            .field("arity", &self.arity)
            .field("ptr", &Arc::as_ptr(&self.inner).cast::<()>())
            .finish()
    }
}

fn number(args: &[Value], index: usize) -> Result<f64, HostError> {
    let value = args.get(index).unwrap_or(&Value::Null);
    value.as_number().ok_or_else(|| {
        Box::new(FfiError::mismatch(
            format!("number at argument {}", index),
            value.type_name(),
        )) as HostError
    })
}
