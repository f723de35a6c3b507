//! Executable memory for stubs
//!
//! Regions follow W^X: writable while the builder fills them, then switched
//! to read+execute before anyone can call into them. A region is never
//! writable and executable at the same time.

use std::ptr::NonNull;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{AdjustorError, AdjustorResult};

// =============================================================================
// Platform layer
// =============================================================================

#[cfg(unix)]
mod platform {
    use std::ptr;

    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    /// Map `size` bytes read+write.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// Switch to read+execute, dropping write.
    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_EXEC) == 0 }
    }

    pub unsafe fn free(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::c_void;
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_READWRITE,
    };

    pub fn page_size() -> usize {
        4096
    }

    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        }
    }

    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        let mut old_protect = 0;
        unsafe {
            VirtualProtect(ptr as *const c_void, size, PAGE_EXECUTE_READ, &mut old_protect) != 0
        }
    }

    pub unsafe fn free(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut c_void, 0, MEM_RELEASE);
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    pub fn page_size() -> usize {
        4096
    }

    pub unsafe fn alloc_rw(_size: usize) -> *mut u8 {
        std::ptr::null_mut()
    }

    pub unsafe fn make_executable(_ptr: *mut u8, _size: usize) -> bool {
        false
    }

    pub unsafe fn free(_ptr: *mut u8, _size: usize) {}
}

static PAGE_SIZE: Lazy<usize> = Lazy::new(platform::page_size);

/// Host page size
pub fn page_size() -> usize {
    *PAGE_SIZE
}

// =============================================================================
// Regions
// =============================================================================

/// Memory being filled by the builder. Not executable.
pub struct WritableRegion {
    base: NonNull<u8>,
    len: usize,
}

impl WritableRegion {
    /// Wrap memory an [`ExecAllocator`] mapped read+write.
    ///
    /// # Safety
    /// `base` must point to `len` writable bytes owned by the caller.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, len: usize) -> Self {
        WritableRegion { base, len }
    }

    /// Address of the first byte
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region has no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the first byte
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// The region's bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }
}

/// Memory holding a finished stub. Readable and executable, never writable.
#[derive(Debug)]
pub struct ExecRegion {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the bytes behind an ExecRegion are immutable until the region is
// freed, so any thread may read or execute them.
unsafe impl Send for ExecRegion {}
unsafe impl Sync for ExecRegion {}
unsafe impl Send for WritableRegion {}

impl ExecRegion {
    /// Wrap memory an [`ExecAllocator`] made read+execute.
    ///
    /// # Safety
    /// `base` must point to `len` readable bytes that stay mapped until the
    /// region is freed.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, len: usize) -> Self {
        ExecRegion { base, len }
    }

    /// Address of the first byte
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region has no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the first byte
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// The region's bytes
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }
}

// =============================================================================
// Allocator interface
// =============================================================================

/// Source of executable memory for stubs. Implementations must be
/// thread-safe; the adjustor does no locking of its own.
pub trait ExecAllocator: Send + Sync {
    /// A fresh writable region of at least `len` bytes
    fn allocate(&self, len: usize) -> AdjustorResult<WritableRegion>;

    /// Turn a filled region executable. On failure the region is released.
    fn make_executable(&self, region: WritableRegion) -> AdjustorResult<ExecRegion>;

    /// Release a region that never became executable
    fn discard(&self, region: WritableRegion);

    /// A view of the live region starting exactly at `addr`, if this
    /// allocator handed one out and nobody has claimed it. Must not touch
    /// the memory at `addr`. The view must not be passed to `free`.
    fn lookup(&self, addr: usize) -> Option<ExecRegion>;

    /// Claim the live region starting exactly at `addr`.
    ///
    /// At most one caller gets a region for a given address; until it is
    /// restored or freed, `take` and `lookup` return `None` for it. Must not
    /// touch the memory at `addr`.
    fn take(&self, addr: usize) -> Option<ExecRegion>;

    /// Give a claimed region back unchanged
    fn restore(&self, region: ExecRegion);

    /// Unmap a region. Freeing an unknown or already-freed region is
    /// ignored.
    fn free(&self, region: ExecRegion);
}

struct LiveRegion {
    len: usize,
    claimed: bool,
}

/// One page-rounded OS mapping per region
pub struct PageAllocator {
    /// Executable mappings by base address
    live: Mutex<FxHashMap<usize, LiveRegion>>,
}

impl PageAllocator {
    /// Create an allocator with no live mappings
    pub fn new() -> Self {
        PageAllocator {
            live: Mutex::new(FxHashMap::default()),
        }
    }

    /// Number of executable regions currently mapped
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    fn align_to_page(len: usize) -> usize {
        let page = page_size();
        (len.max(1) + page - 1) & !(page - 1)
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecAllocator for PageAllocator {
    fn allocate(&self, len: usize) -> AdjustorResult<WritableRegion> {
        let size = Self::align_to_page(len);
        let ptr = unsafe { platform::alloc_rw(size) };
        let base = NonNull::new(ptr).ok_or_else(|| {
            AdjustorError::ExecMemory(format!("failed to map {} bytes", size))
        })?;
        Ok(WritableRegion { base, len: size })
    }

    fn make_executable(&self, region: WritableRegion) -> AdjustorResult<ExecRegion> {
        let WritableRegion { base, len } = region;
        if !unsafe { platform::make_executable(base.as_ptr(), len) } {
            unsafe { platform::free(base.as_ptr(), len) };
            return Err(AdjustorError::ExecMemory(format!(
                "failed to protect {:#x} as executable",
                base.as_ptr() as usize
            )));
        }
        self.live
            .lock()
            .insert(base.as_ptr() as usize, LiveRegion { len, claimed: false });
        Ok(ExecRegion { base, len })
    }

    fn discard(&self, region: WritableRegion) {
        unsafe { platform::free(region.base.as_ptr(), region.len) };
    }

    fn lookup(&self, addr: usize) -> Option<ExecRegion> {
        let live = self.live.lock();
        let entry = live.get(&addr).filter(|entry| !entry.claimed)?;
        let base = NonNull::new(addr as *mut u8)?;
        Some(ExecRegion {
            base,
            len: entry.len,
        })
    }

    fn take(&self, addr: usize) -> Option<ExecRegion> {
        let mut live = self.live.lock();
        let entry = live.get_mut(&addr).filter(|entry| !entry.claimed)?;
        let base = NonNull::new(addr as *mut u8)?;
        entry.claimed = true;
        Some(ExecRegion {
            base,
            len: entry.len,
        })
    }

    fn restore(&self, region: ExecRegion) {
        match self.live.lock().get_mut(&region.base()) {
            Some(entry) => entry.claimed = false,
            None => log::warn!("restore of unknown executable region {:#x}", region.base()),
        }
    }

    fn free(&self, region: ExecRegion) {
        match self.live.lock().remove(&region.base()) {
            Some(entry) => unsafe { platform::free(region.base.as_ptr(), entry.len) },
            None => log::warn!("free of unknown executable region {:#x}", region.base()),
        }
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        for (base, entry) in self.live.get_mut().drain() {
            unsafe { platform::free(base as *mut u8, entry.len) };
        }
    }
}
