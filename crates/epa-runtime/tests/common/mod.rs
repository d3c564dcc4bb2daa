//! Native-side fixtures
//!
//! These `extern "C"` functions play the role of the EPA library: they
//! allocate function objects through the exported `epa_ffi_*` allocator,
//! call function objects through their raw pointers and stop as soon as an
//! error is pending, the way the library unwinds.

#![allow(dead_code)]

use epa_runtime::ffi::abi::{
    epa_ffi_destroy_function, epa_ffi_error_pending, epa_ffi_make_function,
    epa_ffi_set_native_error,
};
use epa_runtime::ffi::types::{Destructor, ErasedFn, RawFunction};
use std::os::raw::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type F1 = unsafe extern "C" fn(f64, *mut c_void) -> f64;
type Integrator = unsafe extern "C" fn(*mut RawFunction, f64, f64, *mut c_void) -> f64;
type Generator = unsafe extern "C" fn(u32, *mut c_void) -> *mut RawFunction;

/// Midpoint rule intervals used by the native integrator
pub const MIDPOINT_STEPS: usize = 1000;

fn erase<F: Copy>(function: F) -> Option<ErasedFn> {
    assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<ErasedFn>());
    // SAFETY: F is always an `unsafe extern "C" fn` in this module
    Some(unsafe { std::mem::transmute_copy::<F, ErasedFn>(&function) })
}

unsafe fn make(function: Option<ErasedFn>, data: *mut c_void, destructor: Option<Destructor>) -> *mut RawFunction {
    epa_ffi_make_function(function, data, destructor)
}

/// Call a 1-D function object the way native code does
pub unsafe fn call1(f: *mut RawFunction, x: f64) -> f64 {
    let raw = &*f;
    let function: F1 = std::mem::transmute(raw.function.expect("function pointer"));
    function(x, raw.data)
}

pub fn error_pending() -> bool {
    epa_ffi_error_pending() != 0
}

// ----------------------------------------------------------------------------
// 1-D functions
// ----------------------------------------------------------------------------

unsafe extern "C" fn square(x: f64, _data: *mut c_void) -> f64 {
    x * x
}

/// `x²` with no user data
pub fn native_square() -> *mut RawFunction {
    unsafe { make(erase::<F1>(square), ptr::null_mut(), None) }
}

struct Scaled {
    factor: f64,
    released: Arc<AtomicUsize>,
}

unsafe extern "C" fn scaled(x: f64, data: *mut c_void) -> f64 {
    let scaled = &*data.cast::<Scaled>();
    scaled.factor * x
}

unsafe extern "C" fn release_scaled(data: *mut c_void) {
    let scaled = Box::from_raw(data.cast::<Scaled>());
    scaled.released.fetch_add(1, Ordering::SeqCst);
}

/// `factor * x`; `released` counts destructor runs
pub fn native_scaled(factor: f64, released: Arc<AtomicUsize>) -> *mut RawFunction {
    let data = Box::into_raw(Box::new(Scaled { factor, released }));
    unsafe { make(erase::<F1>(scaled), data.cast(), Some(release_scaled)) }
}

unsafe extern "C" fn failing(x: f64, _data: *mut c_void) -> f64 {
    if x < 0.0 {
        epa_ffi_set_native_error(b"negative argument\0".as_ptr().cast());
        return 0.0;
    }
    x.sqrt()
}

/// `sqrt(x)`, reporting a native error for negative `x`
pub fn native_sqrt() -> *mut RawFunction {
    unsafe { make(erase::<F1>(failing), ptr::null_mut(), None) }
}

unsafe extern "C" fn twice_entry(x: f64, data: *mut c_void) -> f64 {
    2.0 * call1(data.cast(), x)
}

/// Library-style constructor for `2 f(x)`; the result only borrows `f`
pub unsafe extern "C" fn native_twice(f: *mut RawFunction) -> *mut RawFunction {
    if f.is_null() {
        epa_ffi_set_native_error(b"function is null\0".as_ptr().cast());
        return ptr::null_mut();
    }
    make(erase::<F1>(twice_entry), f.cast(), None)
}

// ----------------------------------------------------------------------------
// Integrators and generators
// ----------------------------------------------------------------------------

unsafe extern "C" fn midpoint(f: *mut RawFunction, a: f64, b: f64, _data: *mut c_void) -> f64 {
    if f.is_null() {
        epa_ffi_set_native_error(b"integrand is null\0".as_ptr().cast());
        return 0.0;
    }
    let h = (b - a) / MIDPOINT_STEPS as f64;
    let mut sum = 0.0;
    for i in 0..MIDPOINT_STEPS {
        sum += call1(f, a + h * (i as f64 + 0.5));
        if error_pending() {
            return 0.0;
        }
    }
    sum * h
}

/// Midpoint rule integrator
pub fn native_midpoint() -> *mut RawFunction {
    unsafe { make(erase::<Integrator>(midpoint), ptr::null_mut(), None) }
}

unsafe extern "C" fn generate(_level: u32, _data: *mut c_void) -> *mut RawFunction {
    native_midpoint()
}

/// Generator returning a new midpoint integrator for every level
pub fn native_generator() -> *mut RawFunction {
    unsafe { make(erase::<Generator>(generate), ptr::null_mut(), None) }
}

unsafe extern "C" fn generate_nothing(_level: u32, _data: *mut c_void) -> *mut RawFunction {
    ptr::null_mut()
}

/// Generator that always returns null without reporting an error
pub fn native_null_generator() -> *mut RawFunction {
    unsafe { make(erase::<Generator>(generate_nothing), ptr::null_mut(), None) }
}

unsafe extern "C" fn generate_failure(_level: u32, _data: *mut c_void) -> *mut RawFunction {
    epa_ffi_set_native_error(b"workspace allocation failed\0".as_ptr().cast());
    ptr::null_mut()
}

/// Generator that reports a native error and returns null
pub fn native_failing_generator() -> *mut RawFunction {
    unsafe { make(erase::<Generator>(generate_failure), ptr::null_mut(), None) }
}

/// Library-style consumer: ask `generator` for an integrator at `level`,
/// integrate `f` over `[a, b]` and destroy the integrator
pub unsafe fn integrate_with_generator(
    generator: *mut RawFunction,
    f: *mut RawFunction,
    level: u32,
    a: f64,
    b: f64,
) -> f64 {
    let object = &*generator;
    let generate: Generator = std::mem::transmute(object.function.expect("generator pointer"));
    let integrator = generate(level, object.data);
    if integrator.is_null() || error_pending() {
        return 0.0;
    }

    let raw = &*integrator;
    let integrate: Integrator = std::mem::transmute(raw.function.expect("integrator pointer"));
    let result = integrate(f, a, b, raw.data);
    epa_ffi_destroy_function(integrator);
    result
}
