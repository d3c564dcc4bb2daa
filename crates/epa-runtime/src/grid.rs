//! Sample grids and tabulated functions
//!
//! Evaluating a spectrum or luminosity over a parameter range is the usual
//! way results leave the library. Parallel sampling evaluates points on
//! rayon workers; each worker only sees errors raised on its own thread.

use crate::ffi::{FfiError, Function, FunctionKind};
use crate::value::{HostError, HostFn, Value};
use rayon::prelude::*;
use std::io::{self, Write};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    #[error("grid needs at least one point")]
    Empty,

    #[error("logarithmic grid needs positive bounds, got [{from}, {to}]")]
    NonPositiveBounds { from: f64, to: f64 },

    #[error("grid bounds must be finite, got [{from}, {to}]")]
    NotFinite { from: f64, to: f64 },
}

/// Points from `from` to `to` with linear or geometric spacing
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    points: Vec<f64>,
    log: bool,
}

impl Grid {
    /// `n` points including both ends; a single point grid is just `from`
    pub fn new(from: f64, to: f64, n: usize, log: bool) -> Result<Self, GridError> {
        if n == 0 {
            return Err(GridError::Empty);
        }
        if !from.is_finite() || !to.is_finite() {
            return Err(GridError::NotFinite { from, to });
        }
        if log && (from <= 0.0 || to <= 0.0) {
            return Err(GridError::NonPositiveBounds { from, to });
        }
        if n == 1 {
            return Ok(Self { points: vec![from], log });
        }

        let intervals = (n - 1) as f64;
        let mut points = Vec::with_capacity(n);
        if log {
            let step = (to / from).powf(1.0 / intervals);
            let mut x = from;
            for _ in 0..n - 1 {
                points.push(x);
                x *= step;
            }
        } else {
            let step = (to - from) / intervals;
            // Multiply instead of accumulating to keep rounding bounded
            points.extend((0..n - 1).map(|i| from + step * i as f64));
        }
        points.push(to);

        Ok(Self { points, log })
    }

    pub fn points(&self) -> &[f64] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn is_log(&self) -> bool {
        self.log
    }
}

/// Evaluate `function` at every grid point on the calling thread
pub fn sample(function: &Function, grid: &Grid) -> Result<SampledFunction, FfiError> {
    let values = grid
        .points()
        .iter()
        .map(|&x| function.eval(&[x]))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SampledFunction::new(grid.points().to_vec(), values))
}

/// Evaluate `function` at every grid point on the rayon pool
///
/// Fails with the error of the lowest failing point.
pub fn sample_parallel(function: &Function, grid: &Grid) -> Result<SampledFunction, FfiError> {
    let values = grid
        .points()
        .par_iter()
        .map(|&x| function.eval(&[x]))
        .collect::<Vec<_>>()
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;
    tracing::debug!(target: "epa::grid", points = values.len(), "grid sampled in parallel");
    Ok(SampledFunction::new(grid.points().to_vec(), values))
}

/// Tabulated `y(x)` with linear interpolation
#[derive(Debug, Clone, PartialEq)]
pub struct SampledFunction {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl SampledFunction {
    /// `x` must be ascending and as long as `y`
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Self {
        debug_assert_eq!(x.len(), y.len());
        Self { x, y }
    }

    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.x.iter().copied().zip(self.y.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Interpolated value, `None` outside the sampled range
    pub fn value_at(&self, x: f64) -> Option<f64> {
        let i = self.bisect(x)?;
        if i + 1 == self.x.len() {
            return Some(self.y[i]);
        }
        let (x0, x1) = (self.x[i], self.x[i + 1]);
        let (y0, y1) = (self.y[i], self.y[i + 1]);
        Some(y0 + (y1 - y0) * (x - x0) / (x1 - x0))
    }

    /// Index of the interval containing `x`
    fn bisect(&self, x: f64) -> Option<usize> {
        let (first, last) = (*self.x.first()?, *self.x.last()?);
        if !(first..=last).contains(&x) {
            return None;
        }
        let (mut left, mut right) = (0, self.x.len());
        while right - left > 1 {
            let middle = (left + right) / 2;
            if x < self.x[middle] {
                right = middle;
            } else {
                left = middle;
            }
        }
        Some(left)
    }

    /// Write one `x y` line per point
    pub fn dump<W: Write>(&self, mut out: W) -> io::Result<()> {
        for (x, y) in self.points() {
            writeln!(out, "{:19.12e} {:19.12e}", x, y)?;
        }
        Ok(())
    }

    /// Interpolating `epa_function1d`; out-of-range points evaluate to an error
    pub fn to_function(&self) -> Result<Function, FfiError> {
        Function::from_host_kind(self.clone().into_host(), FunctionKind::Function1d)
    }

    fn into_host(self) -> HostFn {
        HostFn::unary(move |x| {
            self.value_at(x)
                .ok_or_else(|| -> HostError { Box::new(OutOfRange { x }) })
        })
    }
}

/// Interpolation point outside the sampled range
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("{x} is outside the sampled range")]
pub struct OutOfRange {
    pub x: f64,
}

impl From<SampledFunction> for Value {
    fn from(table: SampledFunction) -> Self {
        Value::Callable(table.into_host())
    }
}
