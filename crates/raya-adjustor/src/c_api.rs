//! C API for foreign exports
//!
//! Generated foreign-export code calls these to turn a pinned closure into a
//! native function pointer and to free it again. The host runtime installs
//! its handle-release function once at startup.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use once_cell::sync::Lazy;
use parking_lot::{const_rwlock, RwLock};

use crate::adjustor::{create_adjustor, StubAddress, StubBuilder, StubReaper};
use crate::capability::ConventionTable;
use crate::convention::CallingConvention;
use crate::error::AdjustorResult;
use crate::handle::{Handle, HandleTable};
use crate::layout::{ArgumentLayout, TypeString};
use crate::memory::PageAllocator;

/// Handle release function supplied by the runtime
pub type ReleaseHook = extern "C" fn(handle: u32);

static PAGES: Lazy<PageAllocator> = Lazy::new(PageAllocator::new);
static RELEASE_HOOK: RwLock<Option<ReleaseHook>> = const_rwlock(None);

struct HookHandles;

impl HandleTable for HookHandles {
    fn release(&self, handle: Handle) {
        match *RELEASE_HOOK.read() {
            Some(hook) => hook(handle.as_raw()),
            None => log::warn!("no release hook installed; leaking {:?}", handle),
        }
    }
}

/// Install the function used to release handles embedded in reaped stubs
#[no_mangle]
pub extern "C" fn raya_adjustor_set_release_hook(hook: Option<ReleaseHook>) {
    *RELEASE_HOOK.write() = hook;
}

/// Build a stub against the host capability table and the process-wide
/// page allocator. Panics on an unsupported convention.
fn create_host_stub(
    cconv: c_int,
    handle: Handle,
    adapter: usize,
    type_string: Option<&str>,
) -> AdjustorResult<StubAddress> {
    let conv = match CallingConvention::from_raw(cconv) {
        Ok(conv) => conv,
        Err(e) => panic!("raya_adjustor_create: {}", e),
    };
    let layout = type_string.map(TypeString::new);
    let builder = StubBuilder::new(ConventionTable::host(), &*PAGES);
    create_adjustor(
        &builder,
        conv,
        handle,
        adapter,
        layout.as_ref().map(|l| l as &dyn ArgumentLayout),
    )
}

/// Create a native function pointer for a pinned closure
///
/// # Arguments
/// * `cconv` - `0` for stdcall, `1` for ccall
/// * `handle` - Stable handle of the closure (ownership moves to the stub)
/// * `adapter` - Native function receiving the handle and the arguments
/// * `type_string` - Argument descriptor, required for ccall
///
/// # Returns
/// * The stub address on success
/// * NULL if executable memory could not be obtained or an argument was bad
///
/// Aborts the process on an unsupported calling convention.
///
/// # Safety
/// `type_string` must be NULL or a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn raya_adjustor_create(
    cconv: c_int,
    handle: u32,
    adapter: *const c_void,
    type_string: *const c_char,
) -> *mut c_void {
    let Some(handle) = Handle::from_raw(handle) else {
        log::warn!("raya_adjustor_create: null handle");
        return ptr::null_mut();
    };
    let type_string = if type_string.is_null() {
        None
    } else {
        Some(CStr::from_ptr(type_string).to_string_lossy())
    };

    match create_host_stub(cconv, handle, adapter as usize, type_string.as_deref()) {
        Ok(addr) => addr.as_usize() as *mut c_void,
        Err(e) => {
            log::warn!("raya_adjustor_create: {}", e);
            ptr::null_mut()
        }
    }
}

/// Free a function pointer returned by `raya_adjustor_create`
///
/// Releases the embedded handle and unmaps the stub.
///
/// # Returns
/// * 0 on success, or if `ptr` is NULL
/// * -1 if `ptr` is not a live stub (nothing is released or unmapped)
#[no_mangle]
pub extern "C" fn raya_adjustor_free(ptr: *mut c_void) -> c_int {
    if ptr.is_null() {
        return 0;
    }
    match StubReaper::new(&*PAGES, &HookHandles).reap(StubAddress::from_raw(ptr as usize)) {
        Ok(_) => 0,
        Err(e) => {
            log::warn!("raya_adjustor_free: {}", e);
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_null_and_unknown_pointers() {
        assert_eq!(raya_adjustor_free(ptr::null_mut()), 0);
        let mut local = 0u8;
        assert_eq!(raya_adjustor_free(&mut local as *mut u8 as *mut c_void), -1);
        assert_eq!(local, 0);
    }

    #[test]
    #[should_panic(expected = "raya_adjustor_create")]
    fn test_unknown_selector_aborts() {
        let _ = create_host_stub(9, Handle::from_raw(1).unwrap(), 0x1000, None);
    }

    #[cfg(not(target_arch = "x86"))]
    #[test]
    #[should_panic(expected = "create_adjustor")]
    fn test_host_without_adjustors_aborts() {
        let _ = create_host_stub(1, Handle::from_raw(1).unwrap(), 0x1000, Some("ii"));
    }

    #[cfg(target_arch = "x86")]
    #[test]
    fn test_host_stub_roundtrip() {
        use crate::memory::ExecAllocator;

        let addr = create_host_stub(1, Handle::from_raw(1).unwrap(), 0x1000, Some("ii")).unwrap();
        assert!(PAGES.lookup(addr.as_usize()).is_some());
        assert_eq!(raya_adjustor_free(addr.as_usize() as *mut c_void), 0);
        assert!(PAGES.lookup(addr.as_usize()).is_none());
        assert_eq!(raya_adjustor_free(addr.as_usize() as *mut c_void), -1);
    }

    #[test]
    fn test_null_handle_is_rejected() {
        let stub = unsafe { raya_adjustor_create(0, 0, ptr::null(), ptr::null()) };
        assert!(stub.is_null());
    }
}
