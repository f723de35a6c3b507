//! Raya Adjustors
//!
//! Foreign exports hand native code an ordinary function pointer that, when
//! called, enters a Raya closure. This crate generates those pointers:
//! small i386 stubs (adjustors) that inject a stable [`Handle`] ahead of the
//! native arguments and jump into an adapter.
//!
//! - **Builder** ([`StubBuilder`]): allocate, emit, freeze (W^X)
//! - **Reaper** ([`StubReaper`]): identify the stub by its first byte,
//!   release the handle, free the memory
//! - **Collaborators**: [`ExecAllocator`] for executable memory and
//!   [`HandleTable`] for releasing handles, both injected
//!
//! # Example
//!
//! ```rust,ignore
//! use raya_adjustor::*;
//!
//! let handles = StableHandleTable::new();
//! let adjustors = Adjustors::new(ConventionTable::host().clone(), PageAllocator::new(), handles);
//!
//! let handle = adjustors.handles().acquire(closure)?;
//! let layout = TypeString::new("ip");
//! let fn_ptr = adjustors.create(CallingConvention::CCall, handle, adapter as usize, Some(&layout))?;
//! // ... native code calls fn_ptr ...
//! adjustors.free(fn_ptr)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Building and reaping stubs
pub mod adjustor;
/// C API for generated foreign-export code
pub mod c_api;
/// Per-target calling convention availability
pub mod capability;
/// Calling conventions and stub signatures
pub mod convention;
/// i386 stub encoding
pub mod emit;
/// Error types
pub mod error;
/// Stable handles
pub mod handle;
/// Argument layouts and frame arithmetic
pub mod layout;
/// Executable memory
pub mod memory;
/// Stub byte layouts
pub mod stub;

mod entry;

pub use adjustor::{create_adjustor, Adjustors, StubAddress, StubBuilder, StubReaper};
pub use capability::{ConventionTable, Target, TargetArch, TargetOs};
pub use convention::{CallingConvention, StubSignature};
pub use emit::{emit, StubCode, StubParams};
pub use error::{AdjustorError, AdjustorResult};
pub use handle::{Handle, HandleTable, StableHandleTable};
pub use layout::{ArgType, ArgumentLayout, FrameLayout, TypeString};
pub use memory::{ExecAllocator, ExecRegion, PageAllocator, WritableRegion};
pub use stub::{CCallStub, StdCallStub};
