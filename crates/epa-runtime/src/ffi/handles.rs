//! Ownership of native function objects and everything they can reach
//!
//! - `NativeHandle`: one function object, released exactly once
//! - `ClosureToken`: a boxed host callable passed to native code as user data
//! - `HandleSet`: keep-alive entries released together with their owner
//! - `Lease`: validity of objects native code lends to one callback

use crate::ffi::function::Function;
use crate::ffi::types::{ErasedFn, RawFunction};
use crate::value::HostFn;
use libloading::Library;
use std::fmt;
use std::os::raw::c_void;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Releases a function object (the allocator's destroy function)
pub type Release = unsafe extern "C" fn(*mut RawFunction);

/// Pointer to a native function object
///
/// An owned handle calls its release function on drop. A borrowed handle
/// (an object native code passed into a callback) never releases.
pub struct NativeHandle {
    raw: NonNull<RawFunction>,
    release: Option<Release>,
}

// Safety: the handle is never mutated after construction; thread safety of
// the function object's own code is the library's contract
unsafe impl Send for NativeHandle {}
unsafe impl Sync for NativeHandle {}

impl NativeHandle {
    /// Take ownership of a function object
    ///
    /// # Safety
    ///
    /// `raw` must be a live function object that `release` can destroy, and
    /// nothing else may release it.
    pub unsafe fn owned(raw: NonNull<RawFunction>, release: Release) -> Self {
        Self {
            raw,
            release: Some(release),
        }
    }

    /// Refer to a function object owned elsewhere
    ///
    /// # Safety
    ///
    /// `raw` must outlive the handle.
    pub unsafe fn borrowed(raw: NonNull<RawFunction>) -> Self {
        Self { raw, release: None }
    }

    pub fn as_ptr(&self) -> *mut RawFunction {
        self.raw.as_ptr()
    }

    pub fn is_owned(&self) -> bool {
        self.release.is_some()
    }

    /// Function pointer and user data of the object
    pub(crate) fn entry(&self) -> (Option<ErasedFn>, *mut c_void) {
        // SAFETY: the object is live for the lifetime of the handle
        let raw = unsafe { self.raw.as_ref() };
        (raw.function, raw.data)
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release {
            tracing::trace!(target: "epa::ffi::handles", ptr = ?self.raw, "releasing function object");
            // SAFETY: owned handles are released exactly once, here
            unsafe { release(self.raw.as_ptr()) };
        }
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("raw", &self.raw)
            .field("owned", &self.is_owned())
            .finish()
    }
}

/// Validity of the function objects native code passes into one callback
///
/// Views of those objects may be cloned and kept by host code, but the
/// objects themselves belong to the native caller. Once the callback
/// returns the lease is revoked and every use of a view fails with
/// `FfiError::Expired`. Revoking waits for calls still running through a
/// view on other threads.
#[derive(Clone, Default)]
pub struct Lease(Arc<LeaseState>);

#[derive(Default)]
struct LeaseState {
    holders: Mutex<LeaseCount>,
    released: Condvar,
}

#[derive(Default)]
struct LeaseCount {
    revoked: bool,
    active: usize,
}

impl Lease {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LeaseCount> {
        self.0.holders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_revoked(&self) -> bool {
        self.lock().revoked
    }

    /// Keep the lent objects valid while the guard lives; `None` once revoked
    pub fn hold(&self) -> Option<LeaseGuard> {
        let mut count = self.lock();
        if count.revoked {
            return None;
        }
        count.active += 1;
        Some(LeaseGuard(self.clone()))
    }

    /// End the lease
    pub fn revoke(&self) {
        let mut count = self.lock();
        count.revoked = true;
        while count.active > 0 {
            count = self
                .0
                .released
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn same(&self, other: &Lease) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("revoked", &self.is_revoked()).finish()
    }
}

/// An active use of a [`Lease`]
#[derive(Debug)]
pub struct LeaseGuard(Lease);

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let mut count = self.0.lock();
        count.active -= 1;
        if count.active == 0 {
            self.0 .0.released.notify_all();
        }
    }
}

/// Host callable boxed at a stable address for use as native user data
pub struct ClosureToken {
    host: NonNull<HostFn>,
}

// Safety: HostFn is Send + Sync and the token owns its box
unsafe impl Send for ClosureToken {}
unsafe impl Sync for ClosureToken {}

impl ClosureToken {
    pub fn new(host: HostFn) -> Self {
        Self {
            host: NonNull::from(Box::leak(Box::new(host))),
        }
    }

    /// User data pointer; valid while the token is alive
    pub fn as_data(&self) -> *mut c_void {
        self.host.as_ptr().cast()
    }

    /// Hand the box to native code; it must be freed with [`release_closure_data`]
    pub fn into_data(self) -> *mut c_void {
        let data = self.as_data();
        std::mem::forget(self);
        data
    }

    pub fn host(&self) -> &HostFn {
        // SAFETY: the box lives as long as the token
        unsafe { self.host.as_ref() }
    }

    /// Recover the host callable from user data
    ///
    /// # Safety
    ///
    /// `data` must be null or come from a live token (or `into_data`).
    pub(crate) unsafe fn recover<'a>(data: *mut c_void) -> Option<&'a HostFn> {
        data.cast::<HostFn>().as_ref()
    }
}

impl Drop for ClosureToken {
    fn drop(&mut self) {
        // SAFETY: allocated in `new`, not handed out through `into_data`
        drop(unsafe { Box::from_raw(self.host.as_ptr()) });
    }
}

impl fmt::Debug for ClosureToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClosureToken").field(&self.host).finish()
    }
}

/// Destructor for user data produced by [`ClosureToken::into_data`]
///
/// # Safety
///
/// `data` must be null or come from `into_data`, and is freed at most once.
pub unsafe extern "C" fn release_closure_data(data: *mut c_void) {
    if !data.is_null() {
        drop(Box::from_raw(data.cast::<HostFn>()));
    }
}

/// Something that must outlive a function object
pub enum KeepAlive {
    Function(Function),
    Closure(ClosureToken),
    Library(Arc<Library>),
    Workspace(Arc<dyn Send + Sync>),
}

impl fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepAlive::Function(function) => f.debug_tuple("Function").field(function).finish(),
            KeepAlive::Closure(token) => f.debug_tuple("Closure").field(token).finish(),
            KeepAlive::Library(_) => f.write_str("Library"),
            KeepAlive::Workspace(_) => f.write_str("Workspace"),
        }
    }
}

/// Ordered keep-alive entries of one function object
#[derive(Debug, Default)]
pub struct HandleSet {
    entries: Vec<KeepAlive>,
}

impl HandleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: KeepAlive) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, other: HandleSet) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeepAlive> {
        self.entries.iter()
    }

    /// Whether `function` is already kept alive by this set
    pub fn contains_function(&self, function: &Function) -> bool {
        self.entries
            .iter()
            .any(|entry| matches!(entry, KeepAlive::Function(f) if f.ptr_eq(function)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted_host(counter: &Arc<AtomicUsize>) -> HostFn {
        let guard = DropCounter(counter.clone());
        HostFn::new(move |_| {
            let _ = &guard;
            Ok(Value::Null)
        })
    }

    #[test]
    fn test_token_drop_releases_host() {
        let drops = Arc::new(AtomicUsize::new(0));
        let token = ClosureToken::new(counted_host(&drops));
        assert!(!token.as_data().is_null());
        drop(token);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_token_recovered_from_data() {
        let token = ClosureToken::new(HostFn::new(|_| Ok(Value::Number(7.0))));
        let host = unsafe { ClosureToken::recover(token.as_data()) }.unwrap();
        assert_eq!(host.invoke(&[]).unwrap(), Value::Number(7.0));
        assert!(unsafe { ClosureToken::recover(std::ptr::null_mut()) }.is_none());
    }

    #[test]
    fn test_transferred_token_freed_by_destructor() {
        let drops = Arc::new(AtomicUsize::new(0));
        let data = ClosureToken::new(counted_host(&drops)).into_data();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        unsafe { release_closure_data(data) };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lease_revocation() {
        let lease = Lease::new();
        let guard = lease.hold().unwrap();
        assert!(!lease.is_revoked());
        drop(guard);

        lease.revoke();
        assert!(lease.is_revoked());
        assert!(lease.hold().is_none());
        assert!(lease.same(&lease.clone()));
        assert!(!lease.same(&Lease::new()));
    }

    #[test]
    fn test_revoke_waits_for_active_holders() {
        let lease = Lease::new();
        let guard = lease.hold().unwrap();
        let finished = Arc::new(AtomicUsize::new(0));

        let revoker = {
            let lease = lease.clone();
            let finished = finished.clone();
            std::thread::spawn(move || {
                lease.revoke();
                finished.store(1, Ordering::SeqCst);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        drop(guard);
        revoker.join().unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_set_releases_entries() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut set = HandleSet::new();
        set.push(KeepAlive::Closure(ClosureToken::new(counted_host(&drops))));
        set.push(KeepAlive::Workspace(Arc::new(DropCounter(drops.clone()))));
        assert_eq!(set.len(), 2);
        drop(set);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}
