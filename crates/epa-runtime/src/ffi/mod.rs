//! Foreign function interface for EPA function objects
//!
//! Function objects are C structs `{ function, data, destructor }` whose
//! function pointer always takes a trailing `void*` user data argument.
//! This module converts host callables into function objects (through
//! static trampolines), wraps native function objects as host values, and
//! carries callback failures across native frames.

pub mod abi;
pub mod callbacks;
pub mod error;
pub mod function;
pub mod handles;
pub mod library;
pub mod loader;
pub mod marshal;
pub mod signature;
pub mod types;

pub use abi::{FunctionAbi, NativeErrorSlot};
pub use callbacks::{trampoline_count, trampoline_for, Trampoline};
pub use error::{CallbackPanic, ErrorLayer, ErrorRecord, FfiError};
pub use function::{CallPath, Function, NativePtr, Source};
pub use handles::{ClosureToken, HandleSet, KeepAlive, NativeHandle};
pub use library::{
    Constants, CquadOptions, CquadWorkspace, EpaLibrary, FiducialCuts, QagOptions, QagWorkspace,
    Workspace,
};
pub use loader::{LibraryLoader, LoadError};
pub use marshal::CallScope;
pub use signature::{descriptor_count, descriptor_for_kind, resolve, Signature, TypeDescriptor, TypeKind};
pub use types::{CType, ExternType, FunctionKind, Polarization, RawFunction};
