//! Calling conventions and the stub signatures that identify them
//!
//! A stub carries no type tag besides its own machine code. The reaper tells
//! variants apart by the first opcode byte, so every convention owns exactly
//! one leading byte and no two may share it.

use std::fmt;

use crate::error::{AdjustorError, AdjustorResult};

/// Calling convention of the native function pointer handed out for a closure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    /// `__stdcall`: the callee pops its arguments. Fixed-size stub.
    StdCall,
    /// `__cdecl`: the caller pops its arguments. Stub size depends on the
    /// argument block, and the call into the adapter stays 16-byte aligned.
    CCall,
}

impl CallingConvention {
    /// All conventions known to the builder
    pub const ALL: [CallingConvention; 2] = [CallingConvention::StdCall, CallingConvention::CCall];

    /// Decode the selector used by foreign-export call sites (`0` stdcall,
    /// `1` ccall).
    pub fn from_raw(raw: i32) -> AdjustorResult<Self> {
        match raw {
            0 => Ok(CallingConvention::StdCall),
            1 => Ok(CallingConvention::CCall),
            other => Err(AdjustorError::UnsupportedConvention(format!(
                "unknown selector {}",
                other
            ))),
        }
    }

    /// Selector value understood by [`CallingConvention::from_raw`]
    pub fn as_raw(self) -> i32 {
        match self {
            CallingConvention::StdCall => 0,
            CallingConvention::CCall => 1,
        }
    }

    /// Whether the stub needs an argument layout to be built
    pub fn needs_layout(self) -> bool {
        matches!(self, CallingConvention::CCall)
    }

    /// The leading-byte signature stubs of this convention start with
    pub fn signature(self) -> StubSignature {
        match self {
            CallingConvention::StdCall => StubSignature::StdCall,
            CallingConvention::CCall => StubSignature::CCall,
        }
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallingConvention::StdCall => write!(f, "stdcall"),
            CallingConvention::CCall => write!(f, "ccall"),
        }
    }
}

/// `popl %eax`
pub const OP_POP_EAX: u8 = 0x58;
/// `call rel32`
pub const OP_CALL_REL32: u8 = 0xE8;

/// Closed set of leading-byte signatures the reaper recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubSignature {
    /// Stub starts with `popl %eax`
    StdCall,
    /// Stub starts with `call rel32` into the shared entry trampoline
    CCall,
}

impl StubSignature {
    /// Every signature, in dispatch order
    pub const ALL: [StubSignature; 2] = [StubSignature::CCall, StubSignature::StdCall];

    /// First byte of every stub with this signature
    pub const fn leading_byte(self) -> u8 {
        match self {
            StubSignature::StdCall => OP_POP_EAX,
            StubSignature::CCall => OP_CALL_REL32,
        }
    }

    /// Classify a stub by its first byte
    pub fn from_leading_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|sig| sig.leading_byte() == byte)
    }

    /// Convention that produces stubs with this signature
    pub fn convention(self) -> CallingConvention {
        match self {
            StubSignature::StdCall => CallingConvention::StdCall,
            StubSignature::CCall => CallingConvention::CCall,
        }
    }
}

const _: () = {
    let all = StubSignature::ALL;
    let mut i = 0;
    while i < all.len() {
        let mut j = i + 1;
        while j < all.len() {
            assert!(all[i].leading_byte() != all[j].leading_byte());
            j += 1;
        }
        i += 1;
    }
};
