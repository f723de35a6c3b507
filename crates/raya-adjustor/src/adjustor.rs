//! Building and reaping adjustor stubs
//!
//! A stub is an ordinary native function pointer that forwards into an
//! adapter with a [`Handle`] injected as the first argument. The builder
//! owns the handle from a successful `build` until `reap` releases it.

use std::fmt;

use crate::capability::ConventionTable;
use crate::convention::{CallingConvention, StubSignature};
use crate::emit::{emit, stub_size, StubParams};
use crate::error::{AdjustorError, AdjustorResult};
use crate::handle::{Handle, HandleTable};
use crate::layout::{ArgumentLayout, FrameLayout};
use crate::memory::ExecAllocator;
use crate::stub::{CCallStub, StdCallStub};

/// Address of a finished stub, callable as a native function
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StubAddress(usize);

impl StubAddress {
    /// Wrap a raw address, e.g. one coming back from native code
    pub fn from_raw(addr: usize) -> Self {
        StubAddress(addr)
    }

    /// The raw address
    pub fn as_usize(self) -> usize {
        self.0
    }

    /// The address as a pointer
    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }
}

impl fmt::Debug for StubAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StubAddress({:#x})", self.0)
    }
}

/// Builds stubs into fresh executable regions
pub struct StubBuilder<'a> {
    conventions: &'a ConventionTable,
    allocator: &'a dyn ExecAllocator,
}

impl<'a> StubBuilder<'a> {
    /// Create a builder for the conventions in `conventions`
    pub fn new(conventions: &'a ConventionTable, allocator: &'a dyn ExecAllocator) -> Self {
        StubBuilder {
            conventions,
            allocator,
        }
    }

    /// Build a stub that calls `adapter` with `handle` prepended.
    ///
    /// `layout` is required for [`CallingConvention::CCall`] and ignored
    /// otherwise. On success the stub owns `handle`; on failure it stays
    /// with the caller.
    pub fn build(
        &self,
        conv: CallingConvention,
        handle: Handle,
        adapter: usize,
        layout: Option<&dyn ArgumentLayout>,
    ) -> AdjustorResult<StubAddress> {
        self.conventions.check(conv)?;

        let frame = match (conv.needs_layout(), layout) {
            (true, None) => return Err(AdjustorError::MissingLayout(conv)),
            (true, Some(layout)) => Some(FrameLayout::for_layout(layout)),
            (false, _) => None,
        };

        let mut region = self.allocator.allocate(stub_size(conv))?;
        let params = StubParams {
            base: region.base(),
            handle,
            adapter,
            ccall_entry: self.conventions.ccall_entry(),
            frame,
        };
        let code = match emit(conv, &params) {
            Ok(code) => code,
            Err(e) => {
                self.allocator.discard(region);
                return Err(e);
            }
        };
        region.as_mut_slice()[..code.len()].copy_from_slice(code.bytes());

        let exec = self.allocator.make_executable(region)?;
        let addr = StubAddress(exec.base());
        log::debug!("built {} adjustor {:?} for {:?}", conv, addr, handle);
        Ok(addr)
    }
}

/// Tears stubs down: releases the embedded handle and frees the region
pub struct StubReaper<'a> {
    allocator: &'a dyn ExecAllocator,
    handles: &'a dyn HandleTable,
}

impl<'a> StubReaper<'a> {
    /// Create a reaper over the allocator that built the stubs
    pub fn new(allocator: &'a dyn ExecAllocator, handles: &'a dyn HandleTable) -> Self {
        StubReaper { allocator, handles }
    }

    /// Reap the stub at `addr`.
    ///
    /// Addresses that are not live stubs (never built, already reaped, or
    /// not starting with a known signature) are reported and left alone.
    /// Concurrent reaps of one address release its handle once; the others
    /// see [`AdjustorError::UnrecognizedStub`].
    pub fn reap(&self, addr: StubAddress) -> AdjustorResult<StubSignature> {
        let unrecognized = || {
            log::warn!("reap: not an adjustor stub: {:?}", addr);
            AdjustorError::UnrecognizedStub { addr: addr.0 }
        };

        let region = self.allocator.take(addr.0).ok_or_else(unrecognized)?;
        let (signature, handle) = match decode_handle(region.as_slice()) {
            Some(decoded) => decoded,
            None => {
                self.allocator.restore(region);
                return Err(unrecognized());
            }
        };

        self.handles.release(handle);
        self.allocator.free(region);
        log::debug!("reaped {} adjustor {:?}", signature.convention(), addr);
        Ok(signature)
    }
}

fn decode_handle(code: &[u8]) -> Option<(StubSignature, Handle)> {
    let signature = StubSignature::from_leading_byte(*code.first()?)?;
    let handle = match signature {
        StubSignature::CCall => CCallStub::decode(code)?.handle,
        StubSignature::StdCall => StdCallStub::decode(code)?.handle,
    };
    Some((signature, handle))
}

/// Builder and reaper over one allocator and handle table
pub struct Adjustors<A, H> {
    conventions: ConventionTable,
    allocator: A,
    handles: H,
}

impl<A: ExecAllocator, H: HandleTable> Adjustors<A, H> {
    /// Bundle the collaborators
    pub fn new(conventions: ConventionTable, allocator: A, handles: H) -> Self {
        Adjustors {
            conventions,
            allocator,
            handles,
        }
    }

    /// See [`StubBuilder::build`]
    pub fn create(
        &self,
        conv: CallingConvention,
        handle: Handle,
        adapter: usize,
        layout: Option<&dyn ArgumentLayout>,
    ) -> AdjustorResult<StubAddress> {
        StubBuilder::new(&self.conventions, &self.allocator).build(conv, handle, adapter, layout)
    }

    /// See [`StubReaper::reap`]
    pub fn free(&self, addr: StubAddress) -> AdjustorResult<StubSignature> {
        StubReaper::new(&self.allocator, &self.handles).reap(addr)
    }

    /// The capability table in use
    pub fn conventions(&self) -> &ConventionTable {
        &self.conventions
    }

    /// The executable-memory allocator
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// The handle table
    pub fn handles(&self) -> &H {
        &self.handles
    }
}

/// Build a stub, aborting on a fatal error.
///
/// Soft failures (memory exhaustion, a missing layout) are returned; an
/// unsupported convention means the caller was built for another platform
/// and panics.
pub fn create_adjustor(
    builder: &StubBuilder<'_>,
    conv: CallingConvention,
    handle: Handle,
    adapter: usize,
    layout: Option<&dyn ArgumentLayout>,
) -> AdjustorResult<StubAddress> {
    match builder.build(conv, handle, adapter, layout) {
        Err(e) if e.is_fatal() => panic!("create_adjustor: {}", e),
        result => result,
    }
}
