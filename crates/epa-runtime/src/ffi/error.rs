//! Error channel and FFI error taxonomy
//!
//! Failures inside host callbacks cannot unwind through native frames. The
//! trampoline stores them here, returns a zero sentinel, and the call site
//! that started the native call chain consumes the record right after the
//! native call returns.
//!
//! The pending slot is thread-local: a callback failing on one worker thread
//! is only ever observed by the call unwinding on that same thread.
//!
//! A loaded library adds one process-wide slot of its own. Host failures
//! flag it with a per-thread token so only the owning thread clears it, and
//! every other thread inside a native call at that moment fails with
//! `Interrupted` instead of returning the value of a cut-short computation.

use crate::ffi::abi::{self, Drained};
use crate::ffi::loader::LoadError;
use crate::value::HostError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::raw::{c_int, c_void};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use thiserror::Error;

/// Layer code for errors raised by host callbacks ("Rust")
pub const HOST_LAYER: c_int = 0x7473_7552;

/// Layer code used by the native library for its own errors ("C++")
pub const NATIVE_LAYER: c_int = 0x002b_2b43;

/// Errors surfaced by function object construction and calls
#[derive(Error, Debug)]
pub enum FfiError {
    #[error("invalid signature '{signature}': {reason}")]
    InvalidSignature { signature: String, reason: String },

    #[error("cannot wrap a host callable without a declared signature")]
    MissingType,

    #[error("native code returned a null {0}")]
    NullFunction(String),

    #[error("host callback failed: {0}")]
    HostCallback(#[source] HostError),

    #[error("native library error: {0}")]
    NativeLayer(String),

    #[error("signature mismatch: expected {expected}, found {found}")]
    SignatureMismatch { expected: String, found: String },

    #[error("native call interrupted by a failure on another thread: {0}")]
    Interrupted(String),

    #[error("{0} lent to a callback was used after the callback returned")]
    Expired(String),

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl FfiError {
    pub(crate) fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        FfiError::SignatureMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Borrow the original host error if it has type `E`
    pub fn downcast_host<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            FfiError::HostCallback(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Recover the error object a host callback returned
    pub fn into_host_error(self) -> Result<HostError, FfiError> {
        match self {
            FfiError::HostCallback(err) => Ok(err),
            other => Err(other),
        }
    }
}

/// A host callback panicked; the panic was stopped at the trampoline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("host callback panicked: {message}")]
pub struct CallbackPanic {
    pub message: String,
}

impl CallbackPanic {
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }
}

/// Which side of the boundary raised a pending error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLayer {
    Host,
    Native,
}

impl ErrorLayer {
    pub fn code(self) -> c_int {
        match self {
            ErrorLayer::Host => HOST_LAYER,
            ErrorLayer::Native => NATIVE_LAYER,
        }
    }

    pub fn from_code(code: c_int) -> Option<Self> {
        match code {
            HOST_LAYER => Some(ErrorLayer::Host),
            NATIVE_LAYER => Some(ErrorLayer::Native),
            _ => None,
        }
    }
}

/// A pending error
#[derive(Debug)]
pub enum ErrorRecord {
    /// Error object returned (or panic raised) by a host callback
    Host(HostError),
    /// Message reported by native code
    Native(String),
}

impl ErrorRecord {
    pub fn layer(&self) -> ErrorLayer {
        match self {
            ErrorRecord::Host(_) => ErrorLayer::Host,
            ErrorRecord::Native(_) => ErrorLayer::Native,
        }
    }

    /// Convert into the error surfaced at the call site
    ///
    /// A host callback that itself failed with an `FfiError` (typically a
    /// nested call that already unwound) surfaces that error unchanged.
    pub fn into_error(self) -> FfiError {
        match self {
            ErrorRecord::Host(err) => match err.downcast::<FfiError>() {
                Ok(ffi) => *ffi,
                Err(err) => FfiError::HostCallback(err),
            },
            ErrorRecord::Native(message) => FfiError::NativeLayer(message),
        }
    }
}

thread_local! {
    static PENDING: RefCell<Option<ErrorRecord>> = const { RefCell::new(None) };
}

/// Store a record; a previously pending one is replaced
pub fn set(record: ErrorRecord) {
    tracing::trace!(target: "epa::ffi::error", layer = ?record.layer(), "error raised");
    PENDING.with(|slot| {
        if let Some(previous) = slot.borrow_mut().replace(record) {
            tracing::debug!(target: "epa::ffi::error", ?previous, "pending error replaced");
        }
    });
}

pub fn is_pending() -> bool {
    PENDING.with(|slot| slot.borrow().is_some())
}

pub fn layer() -> Option<ErrorLayer> {
    PENDING.with(|slot| slot.borrow().as_ref().map(ErrorRecord::layer))
}

/// Inspect the pending record without consuming it
pub fn with_pending<R>(f: impl FnOnce(Option<&ErrorRecord>) -> R) -> R {
    PENDING.with(|slot| f(slot.borrow().as_ref()))
}

pub fn clear() {
    PENDING.with(|slot| slot.borrow_mut().take());
}

/// Get and clear the pending record in one step
pub fn take() -> Option<ErrorRecord> {
    PENDING.with(|slot| slot.borrow_mut().take())
}

/// Post-call check: consume a pending record and surface it as an error
///
/// Also drains the native error slot of a loaded library. A host record
/// takes precedence over whatever the library reports for the same call.
pub fn check() -> Result<(), FfiError> {
    let drained = match abi::current().error_slot {
        // SAFETY: slot functions come from the installed library ABI
        Some(slot) => unsafe { slot.drain(thread_token()) },
        None => Drained::Empty,
    };

    let interruption = if abi::current().error_slot.is_some() {
        let mut shared = shared();
        if let Drained::Native(message) = &drained {
            shared.interrupt_others(Interruption::Native(message.clone()));
        }
        shared.interrupted.remove(&thread::current().id())
    } else {
        None
    };

    match (take(), drained, interruption) {
        (Some(record), _, _) => Err(record.into_error()),
        (None, Drained::Native(message), _) => Err(FfiError::NativeLayer(message)),
        (None, Drained::ForeignHost, _) | (None, _, Some(Interruption::Host)) => {
            Err(FfiError::Interrupted("host callback failed".to_string()))
        }
        (None, _, Some(Interruption::Native(message))) => Err(FfiError::Interrupted(message)),
        (None, Drained::Empty | Drained::OwnHost, None) => Ok(()),
    }
}

/// Record a host callback failure and flag the native slot so the library
/// unwinds instead of continuing with the sentinel
pub(crate) fn raise_host(err: HostError) {
    set(ErrorRecord::Host(err));
    if let Some(slot) = abi::current().error_slot {
        shared().interrupt_others(Interruption::Host);
        // SAFETY: slot functions come from the installed library ABI
        unsafe { slot.flag_host(thread_token()) };
    }
}

thread_local! {
    static TOKEN: u8 = const { 0 };
}

/// Address unique to the calling thread, stored in the library slot for host errors
pub(crate) fn thread_token() -> *mut c_void {
    TOKEN.with(|token| token as *const u8 as *mut c_void)
}

/// Why a call on this thread may have been cut short by another thread
#[derive(Debug, Clone)]
enum Interruption {
    Host,
    Native(String),
}

/// Threads inside native calls while a process-wide slot is installed
#[derive(Debug, Default)]
struct SharedSlot {
    in_flight: HashMap<ThreadId, usize>,
    interrupted: HashMap<ThreadId, Interruption>,
}

impl SharedSlot {
    fn interrupt_others(&mut self, cause: Interruption) {
        let me = thread::current().id();
        for id in self.in_flight.keys().filter(|id| **id != me) {
            self.interrupted.entry(*id).or_insert_with(|| cause.clone());
        }
    }
}

static SHARED: OnceLock<Mutex<SharedSlot>> = OnceLock::new();

fn shared() -> MutexGuard<'static, SharedSlot> {
    SHARED
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Marks the calling thread as inside a native call until dropped
///
/// Only tracked while a library error slot is installed.
#[derive(Debug)]
pub struct NativeCall {
    tracked: bool,
}

/// Enter a native call; hold the guard until after the post-call [`check`]
pub fn enter() -> NativeCall {
    let tracked = abi::current().error_slot.is_some();
    if tracked {
        *shared().in_flight.entry(thread::current().id()).or_insert(0) += 1;
    }
    NativeCall { tracked }
}

impl Drop for NativeCall {
    fn drop(&mut self) {
        if !self.tracked {
            return;
        }
        let id = thread::current().id();
        let mut shared = shared();
        if let Some(depth) = shared.in_flight.get_mut(&id) {
            *depth -= 1;
            if *depth == 0 {
                shared.in_flight.remove(&id);
                shared.interrupted.remove(&id);
            }
        }
    }
}
