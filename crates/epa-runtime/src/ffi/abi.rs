//! Function object allocation and the native error slot
//!
//! Function objects handed to native code must be allocated and destroyed
//! by the same allocator the native side uses. The built-in ABI allocates
//! with Rust and is exported with C linkage (`epa_ffi_*`), so native code
//! linked against this crate can create, destroy and fail function objects.
//! Opening the EPA library installs the library's own allocator and error
//! slot instead.

use crate::ffi::error::{self, ErrorLayer, ErrorRecord, HOST_LAYER};
use crate::ffi::types::{Destructor, ErasedFn, RawFunction};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::OnceLock;

pub type MakeFunction =
    unsafe extern "C" fn(Option<ErasedFn>, *mut c_void, Option<Destructor>) -> *mut RawFunction;
pub type DestroyFunction = unsafe extern "C" fn(*mut RawFunction);

/// What a drain of the library slot found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drained {
    Empty,
    /// Host error flagged by the calling thread; cleared
    OwnHost,
    /// Host error flagged by another thread; left for its owner
    ForeignHost,
    /// Native-layer error (or an unknown layer); cleared
    Native(String),
}

/// Error slot exported by a loaded library
///
/// The library keeps one process-wide slot. It is only used to make native
/// frames unwind and to fetch native messages; host errors themselves live
/// in the thread-local channel. A host flag stores the raising thread's
/// token as the error pointer.
#[derive(Debug, Clone, Copy)]
pub struct NativeErrorSlot {
    pub get_error: unsafe extern "C" fn() -> *mut c_void,
    pub get_layer: unsafe extern "C" fn() -> c_int,
    pub set_error: unsafe extern "C" fn(*mut c_void, c_int),
    pub clear_error: unsafe extern "C" fn(),
    pub message: unsafe extern "C" fn(*mut c_void) -> *const c_char,
}

impl NativeErrorSlot {
    /// Consume what the slot holds for the thread owning `token`
    ///
    /// # Safety
    ///
    /// The slot functions must belong to a loaded library.
    pub unsafe fn drain(&self, token: *mut c_void) -> Drained {
        let err = (self.get_error)();
        if err.is_null() {
            return Drained::Empty;
        }

        let layer = (self.get_layer)();
        let drained = match ErrorLayer::from_code(layer) {
            Some(ErrorLayer::Host) if err == token => Drained::OwnHost,
            Some(ErrorLayer::Host) => return Drained::ForeignHost,
            Some(ErrorLayer::Native) => {
                let text = (self.message)(err);
                Drained::Native(if text.is_null() {
                    "unknown native error".to_string()
                } else {
                    CStr::from_ptr(text).to_string_lossy().into_owned()
                })
            }
            None => {
                tracing::warn!(target: "epa::ffi::abi", layer, "unexpected error layer in native slot");
                Drained::Native(format!("error from unknown layer {:#010x}", layer))
            }
        };

        (self.clear_error)();
        drained
    }

    /// Mark the slot as holding a host error raised by the owner of `token`
    ///
    /// # Safety
    ///
    /// The slot functions must belong to a loaded library.
    pub unsafe fn flag_host(&self, token: *mut c_void) {
        (self.set_error)(token, HOST_LAYER);
    }
}

/// How function objects are allocated and destroyed
#[derive(Debug, Clone, Copy)]
pub struct FunctionAbi {
    pub make_function: MakeFunction,
    pub destroy_function: DestroyFunction,
    pub error_slot: Option<NativeErrorSlot>,
}

impl FunctionAbi {
    /// Allocate a function object
    ///
    /// # Safety
    ///
    /// `function` must be called with the signature its consumers expect and
    /// `data` must stay valid as long as the object can be called.
    pub unsafe fn make(
        &self,
        function: ErasedFn,
        data: *mut c_void,
        destructor: Option<Destructor>,
    ) -> *mut RawFunction {
        (self.make_function)(Some(function), data, destructor)
    }

    fn same_allocator(&self, other: &FunctionAbi) -> bool {
        self.make_function as usize == other.make_function as usize
            && self.destroy_function as usize == other.destroy_function as usize
    }
}

/// Rust-allocated function objects with the thread-local error channel
pub static BUILTIN: FunctionAbi = FunctionAbi {
    make_function: epa_ffi_make_function,
    destroy_function: epa_ffi_destroy_function,
    error_slot: None,
};

static INSTALLED: OnceLock<FunctionAbi> = OnceLock::new();

/// Install a process-wide ABI; only the first installation takes effect
///
/// Returns `true` when `abi` is (now) the active ABI.
pub fn install(abi: FunctionAbi) -> bool {
    match INSTALLED.set(abi) {
        Ok(()) => {
            tracing::debug!(target: "epa::ffi::abi", has_error_slot = abi.error_slot.is_some(), "function ABI installed");
            true
        }
        Err(_) => {
            let active = current();
            if active.same_allocator(&abi) {
                true
            } else {
                tracing::warn!(target: "epa::ffi::abi", "a different function ABI is already installed");
                false
            }
        }
    }
}

/// The active ABI
pub fn current() -> &'static FunctionAbi {
    INSTALLED.get().unwrap_or(&BUILTIN)
}

/// Allocate a function object with the built-in allocator
///
/// # Safety
///
/// See [`FunctionAbi::make`].
#[no_mangle]
pub unsafe extern "C" fn epa_ffi_make_function(
    function: Option<ErasedFn>,
    data: *mut c_void,
    destructor: Option<Destructor>,
) -> *mut RawFunction {
    Box::into_raw(Box::new(RawFunction {
        function,
        data,
        destructor,
    }))
}

/// Destroy a function object made by [`epa_ffi_make_function`], running its destructor
///
/// # Safety
///
/// `function` must be null or come from `epa_ffi_make_function` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn epa_ffi_destroy_function(function: *mut RawFunction) {
    if function.is_null() {
        return;
    }
    let raw = Box::from_raw(function);
    if let Some(destructor) = raw.destructor {
        destructor(raw.data);
    }
}

/// 1 if an error is pending on the calling thread
#[no_mangle]
pub extern "C" fn epa_ffi_error_pending() -> c_int {
    c_int::from(error::is_pending())
}

/// Layer code of the pending error, 0 when none
#[no_mangle]
pub extern "C" fn epa_ffi_error_layer() -> c_int {
    error::layer().map_or(0, ErrorLayer::code)
}

/// Report a native failure on the calling thread
///
/// # Safety
///
/// `message` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn epa_ffi_set_native_error(message: *const c_char) {
    let message = if message.is_null() {
        "unknown native error".to_string()
    } else {
        CStr::from_ptr(message).to_string_lossy().into_owned()
    };
    error::set(ErrorRecord::Native(message));
}

#[no_mangle]
pub extern "C" fn epa_ffi_clear_error() {
    error::clear();
}
