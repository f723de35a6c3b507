//! Error types for adjustor creation and teardown

use crate::convention::CallingConvention;

/// Errors produced while building or reaping adjustor stubs
#[derive(Debug, thiserror::Error)]
pub enum AdjustorError {
    /// The calling convention is not available on this target.
    ///
    /// This is a configuration mismatch between the caller and the
    /// runtime, never a runtime condition; see [`AdjustorError::is_fatal`].
    #[error("Unsupported calling convention: {0}")]
    UnsupportedConvention(String),

    /// A caller-cleanup stub was requested without an argument layout
    #[error("Calling convention {0} requires an argument layout")]
    MissingLayout(CallingConvention),

    /// An address does not fit in the stub's 32-bit immediate fields
    #[error("{what} address {addr:#x} does not fit in a 32-bit immediate")]
    AddressOutOfRange {
        /// Which embedded field overflowed
        what: &'static str,
        /// The offending address
        addr: usize,
    },

    /// The executable-memory allocator could not satisfy a request
    #[error("Executable memory error: {0}")]
    ExecMemory(String),

    /// Every 32-bit handle value is in use
    #[error("Handle table is full")]
    HandlesExhausted,

    /// `reap` was called on an address that is not a live stub
    #[error("Not an adjustor stub: {addr:#x}")]
    UnrecognizedStub {
        /// The address passed to the reaper
        addr: usize,
    },
}

impl AdjustorError {
    /// Whether the error signals a build/platform mismatch that must abort
    /// the caller instead of being handled.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdjustorError::UnsupportedConvention(_))
    }
}

/// Result alias used throughout the crate
pub type AdjustorResult<T> = Result<T, AdjustorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unsupported_convention_is_fatal() {
        assert!(AdjustorError::UnsupportedConvention("stdcall".into()).is_fatal());
        assert!(!AdjustorError::UnrecognizedStub { addr: 0x1000 }.is_fatal());
        assert!(!AdjustorError::ExecMemory("mmap failed".into()).is_fatal());
        assert!(!AdjustorError::MissingLayout(CallingConvention::CCall).is_fatal());
        assert!(!AdjustorError::HandlesExhausted.is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = AdjustorError::AddressOutOfRange {
            what: "adapter",
            addr: 0x1_0000_0000,
        };
        assert_eq!(
            err.to_string(),
            "adapter address 0x100000000 does not fit in a 32-bit immediate"
        );
        let err = AdjustorError::UnrecognizedStub { addr: 0xdead };
        assert_eq!(err.to_string(), "Not an adjustor stub: 0xdead");
    }
}
