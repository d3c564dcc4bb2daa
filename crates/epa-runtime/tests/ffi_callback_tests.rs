//! Host callables called back from native code

mod common;

use epa_runtime::ffi::{
    error, CallScope, CallbackPanic, ExternType, FfiError, Function, FunctionKind, Polarization,
};
use epa_runtime::{integrator_generator, HostError, HostFn, IntegrationSettings, Value};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("value out of domain: {x}")]
struct ValueError {
    x: f64,
}

fn native_integrator() -> Function {
    unsafe { Function::from_native(common::native_midpoint(), FunctionKind::Integrator) }.unwrap()
}

/// Host midpoint rule over whatever function object native code passes in
fn host_midpoint(steps: usize) -> HostFn {
    HostFn::with_arity(3, move |args| {
        let f = args[0].as_function().ok_or("integrand must be a function object")?;
        let (a, b) = match (args[1].as_number(), args[2].as_number()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err("integration bounds must be numbers".into()),
        };
        let h = (b - a) / steps as f64;
        let mut sum = 0.0;
        for i in 0..steps {
            sum += f.eval(&[a + h * (i as f64 + 0.5)])?;
        }
        Ok(Value::Number(sum * h))
    })
}

struct DropGuard(Arc<AtomicUsize>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_square_end_to_end() {
    let fails_at_five = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = fails_at_five.clone();
    let square = Function::from_host(
        HostFn::unary(move |x| -> Result<f64, ValueError> {
            if flag.load(Ordering::SeqCst) && x == 5.0 {
                return Err(ValueError { x });
            }
            Ok(x * x)
        }),
        "double (double)",
    )
    .unwrap();

    // Through the raw function pointer, as native code sees it
    assert_eq!(unsafe { common::call1(square.as_ptr(), 5.0) }, 25.0);
    assert!(matches!(square.call(&[Value::Number(5.0)]).unwrap(), Value::Number(n) if n == 25.0));

    fails_at_five.store(true, Ordering::SeqCst);
    let err = square.call(&[Value::Number(5.0)]).unwrap_err();
    assert_eq!(err.downcast_host::<ValueError>(), Some(&ValueError { x: 5.0 }));
    assert_eq!(square.eval(&[4.0]).unwrap(), 16.0);
}

#[test]
fn test_host_error_crosses_native_frames() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let integrand = HostFn::unary(move |x| -> Result<f64, ValueError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if x > 5.0 {
            Err(ValueError { x })
        } else {
            Ok(x * x)
        }
    });

    let err = native_integrator()
        .call(&[Value::Callable(integrand), Value::Number(0.0), Value::Number(10.0)])
        .unwrap_err();

    let failure = err.downcast_host::<ValueError>().expect("host error preserved");
    assert!((failure.x - 5.005).abs() < 1e-9);
    // The integrator stopped at the first failing point
    assert_eq!(calls.load(Ordering::SeqCst), 501);
    assert!(!error::is_pending());
}

#[test]
fn test_host_error_object_is_returned_unchanged() {
    let integrand = HostFn::unary(|x| -> Result<f64, ValueError> { Err(ValueError { x }) });
    let err = native_integrator()
        .call(&[Value::Callable(integrand), Value::Number(0.0), Value::Number(1.0)])
        .unwrap_err();

    let host: HostError = err.into_host_error().unwrap();
    let value_error = host.downcast::<ValueError>().unwrap();
    assert_eq!(*value_error, ValueError { x: 0.0005 });
}

#[test]
fn test_panic_in_callback_becomes_error() {
    let integrand = HostFn::unary(|x| -> f64 {
        if x > 0.5 {
            panic!("integrand blew up");
        }
        x
    });

    let err = native_integrator()
        .call(&[Value::Callable(integrand), Value::Number(0.0), Value::Number(1.0)])
        .unwrap_err();
    assert_eq!(
        err.downcast_host::<CallbackPanic>(),
        Some(&CallbackPanic {
            message: "integrand blew up".to_string()
        })
    );
}

#[test]
fn test_native_error_inside_callback() {
    let sqrt = unsafe { Function::from_native(common::native_sqrt(), FunctionKind::Function1d) }.unwrap();
    let integrand = HostFn::unary(move |x| sqrt.eval(&[x - 0.5]));

    let err = native_integrator()
        .call(&[Value::Callable(integrand), Value::Number(0.0), Value::Number(1.0)])
        .unwrap_err();
    assert!(matches!(err, FfiError::NativeLayer(message) if message == "negative argument"));
}

#[test]
fn test_host_integrator_receives_native_integrand() {
    let integrator = Function::from_host_kind(host_midpoint(100), FunctionKind::Integrator).unwrap();
    let square = unsafe { Function::from_native(common::native_square(), FunctionKind::Function1d) }.unwrap();

    let result = integrator
        .call(&[Value::Function(square), Value::Number(0.0), Value::Number(1.0)])
        .unwrap();
    let value = result.as_number().unwrap();
    assert!((value - 1.0 / 3.0).abs() < 1e-4);
}

#[test]
fn test_lent_integrand_expires_after_callback() {
    let kept: Arc<Mutex<Option<Function>>> = Arc::new(Mutex::new(None));
    let stash = kept.clone();
    let inner = host_midpoint(100);
    let integrator = Function::from_host_kind(
        HostFn::with_arity(3, move |args| {
            let lent = args[0].as_function().cloned().ok_or("integrand must be a function object")?;
            assert!(!lent.is_expired());
            *stash.lock().unwrap() = Some(lent);
            inner.invoke(args)
        }),
        FunctionKind::Integrator,
    )
    .unwrap();
    let square = unsafe { Function::from_native(common::native_square(), FunctionKind::Function1d) }.unwrap();

    let result = integrator
        .call(&[Value::Function(square.clone()), Value::Number(0.0), Value::Number(1.0)])
        .unwrap();
    assert!((result.as_number().unwrap() - 1.0 / 3.0).abs() < 1e-4);

    let lent = kept.lock().unwrap().take().unwrap();
    assert!(lent.is_expired());
    assert!(matches!(lent.eval(&[2.0]), Err(FfiError::Expired(_))));
    assert!(matches!(lent.call(&[Value::Number(2.0)]), Err(FfiError::Expired(_))));

    // Handing it back to native code is refused too
    let mut scope = CallScope::new();
    assert!(matches!(
        scope.lower(&Value::Function(lent), ExternType::Function(FunctionKind::Function1d)),
        Err(FfiError::Expired(_))
    ));

    assert_eq!(square.eval(&[2.0]).unwrap(), 4.0);
}

#[test]
fn test_host_integrator_declared_by_signature() {
    let integrator =
        Function::from_host(host_midpoint(10), "double (epa_function1d*, double, double)").unwrap();
    assert_eq!(integrator.shape(), FunctionKind::Integrator);

    let result = integrator
        .call(&[Value::Callable(HostFn::unary(|_| 2.0)), Value::Number(1.0), Value::Number(4.0)])
        .unwrap();
    assert!((result.as_number().unwrap() - 6.0).abs() < 1e-12);
}

#[test]
fn test_native_code_calls_host_object() {
    let cube = Function::from_host(HostFn::unary(|x| x * x * x), "double (double)").unwrap();
    let value = unsafe { common::call1(cube.as_ptr(), 2.0) };
    assert_eq!(value, 8.0);
    assert!(!error::is_pending());
}

#[test]
fn test_generated_integrator_is_released_by_native_caller() {
    let released = Arc::new(AtomicUsize::new(0));
    let guard_count = released.clone();
    let levels = Arc::new(AtomicUsize::new(0));
    let seen = levels.clone();

    let generator = integrator_generator(IntegrationSettings::default(), move |_, level| {
        seen.store(level as usize, Ordering::SeqCst);
        let guard = DropGuard(guard_count.clone());
        let inner = host_midpoint(200);
        Function::from_host_kind(
            HostFn::with_arity(3, move |args| {
                let _keep = &guard;
                inner.invoke(args)
            }),
            FunctionKind::Integrator,
        )
    })
    .unwrap();
    let square = unsafe { Function::from_native(common::native_square(), FunctionKind::Function1d) }.unwrap();

    let result =
        unsafe { common::integrate_with_generator(generator.as_ptr(), square.as_ptr(), 3, 0.0, 1.0) };
    error::check().unwrap();

    assert!((result - 1.0 / 3.0).abs() < 1e-4);
    assert_eq!(levels.load(Ordering::SeqCst), 3);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_generated_native_integrator_is_forwarded() {
    let generator = integrator_generator(IntegrationSettings::default(), |_, _| Ok(native_integrator())).unwrap();
    let square = unsafe { Function::from_native(common::native_square(), FunctionKind::Function1d) }.unwrap();

    let result =
        unsafe { common::integrate_with_generator(generator.as_ptr(), square.as_ptr(), 0, 0.0, 2.0) };
    error::check().unwrap();
    assert!((result - 8.0 / 3.0).abs() < 1e-5);
}

#[test]
fn test_generator_failure_surfaces_after_native_call() {
    let generator = integrator_generator(IntegrationSettings::default(), |_, level| {
        Err(FfiError::NullFunction(format!("integrator for level {level}")))
    })
    .unwrap();
    let square = unsafe { Function::from_native(common::native_square(), FunctionKind::Function1d) }.unwrap();

    let result =
        unsafe { common::integrate_with_generator(generator.as_ptr(), square.as_ptr(), 1, 0.0, 1.0) };
    assert_eq!(result, 0.0);
    assert!(matches!(
        error::check(),
        Err(FfiError::NullFunction(name)) if name == "integrator for level 1"
    ));
}

#[test]
fn test_callback_result_of_wrong_type() {
    let function = Function::from_host_kind(
        HostFn::unary(|_| Polarization::new(1.0, 2.0)),
        FunctionKind::Function1d,
    )
    .unwrap();
    assert!(matches!(
        function.eval(&[1.0]),
        Err(FfiError::SignatureMismatch { .. })
    ));
}

#[test]
fn test_polarized_cross_section() {
    let xsection = Function::from_host_kind(
        HostFn::unary(|w| Polarization::new(w, 2.0 * w)),
        FunctionKind::XsectionBF,
    )
    .unwrap();

    let value = xsection.call(&[Value::Number(1.5)]).unwrap();
    assert_eq!(value.as_polarization(), Some(Polarization::new(1.5, 3.0)));
}

#[test]
fn test_polarization_argument() {
    let luminosity = Function::from_host_kind(
        HostFn::with_arity(2, |args| {
            let x = args[0].as_number().ok_or("x")?;
            let p = args[1].as_polarization().ok_or("polarization")?;
            Ok(Value::Number(x * p.total()))
        }),
        FunctionKind::LuminosityBF,
    )
    .unwrap();

    let value = luminosity
        .call(&[Value::Number(2.0), Value::Polarization(Polarization::new(0.25, 0.5))])
        .unwrap();
    assert_eq!(value.as_number(), Some(1.5));
}

#[test]
fn test_lifted_result_keeps_lowered_callable_alive() {
    let released = Arc::new(AtomicUsize::new(0));
    let guard = DropGuard(released.clone());
    let callable = HostFn::unary(move |x| {
        let _keep = &guard;
        x + 1.0
    });

    let mut scope = CallScope::new();
    let f = scope
        .lower(&Value::Callable(callable), ExternType::Function(FunctionKind::Function1d))
        .unwrap();
    let epa_runtime::ffi::CType::Function(f) = f else {
        panic!("expected a function pointer");
    };
    let raw = unsafe { common::native_twice(f) };
    let twice = scope.lift(raw, FunctionKind::Function1d).unwrap();

    // Only the lifted object references the lowered callable now
    assert_eq!(twice.handles().len(), 1);
    assert_eq!(twice.eval(&[2.0]).unwrap(), 6.0);
    assert_eq!(released.load(Ordering::SeqCst), 0);

    drop(twice);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_lift_null_result_surfaces_native_error() {
    let scope = CallScope::new();
    let raw = unsafe { common::native_twice(std::ptr::null_mut()) };
    let result = scope.lift(raw, FunctionKind::Function1d);
    assert!(matches!(result, Err(FfiError::NativeLayer(message)) if message == "function is null"));
}
