//! Which calling conventions exist on which target
//!
//! The table is resolved once per process for the host and injected into the
//! builder. Tests and embedders can build tables for other targets.

use once_cell::sync::Lazy;

use crate::convention::CallingConvention;
use crate::error::{AdjustorError, AdjustorResult};

/// Target architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    /// 32-bit x86 (i386)
    X86,
    /// x86-64
    X86_64,
    /// 64-bit ARM
    AArch64,
    /// Anything else
    Other,
}

/// Target operating system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    /// Linux and other ELF unixes
    Linux,
    /// macOS / iOS
    Darwin,
    /// Windows
    Windows,
    /// Anything else
    Other,
}

/// Architecture and OS pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// CPU architecture
    pub arch: TargetArch,
    /// Operating system
    pub os: TargetOs,
}

impl Target {
    /// Create a target description
    pub const fn new(arch: TargetArch, os: TargetOs) -> Self {
        Target { arch, os }
    }

    /// The target this crate was compiled for
    pub fn host() -> Self {
        #[cfg(target_arch = "x86")]
        let arch = TargetArch::X86;
        #[cfg(target_arch = "x86_64")]
        let arch = TargetArch::X86_64;
        #[cfg(target_arch = "aarch64")]
        let arch = TargetArch::AArch64;
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
        let arch = TargetArch::Other;

        #[cfg(any(target_os = "macos", target_os = "ios"))]
        let os = TargetOs::Darwin;
        #[cfg(windows)]
        let os = TargetOs::Windows;
        #[cfg(all(unix, not(any(target_os = "macos", target_os = "ios"))))]
        let os = TargetOs::Linux;
        #[cfg(not(any(unix, windows)))]
        let os = TargetOs::Other;

        Target { arch, os }
    }
}

/// Capability table: the conventions a target supports and the shared
/// caller-cleanup entry trampoline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConventionTable {
    target: Target,
    stdcall: bool,
    ccall: bool,
    ccall_entry: Option<usize>,
}

static HOST_TABLE: Lazy<ConventionTable> = Lazy::new(|| {
    let table = ConventionTable::for_target(Target::host());
    match crate::entry::host_ccall_entry() {
        Some(entry) => table.with_ccall_entry(entry),
        None => table,
    }
});

impl ConventionTable {
    /// Capabilities of `target`, without a caller-cleanup entry trampoline.
    ///
    /// Stubs are emitted for i386 only. Darwin has no stdcall.
    pub fn for_target(target: Target) -> Self {
        let (stdcall, ccall) = match (target.arch, target.os) {
            (TargetArch::X86, TargetOs::Darwin) => (false, true),
            (TargetArch::X86, _) => (true, true),
            _ => (false, false),
        };
        ConventionTable {
            target,
            stdcall,
            ccall,
            ccall_entry: None,
        }
    }

    /// Table for the host, resolved on first use
    pub fn host() -> &'static ConventionTable {
        &HOST_TABLE
    }

    /// Use `entry` as the shared trampoline caller-cleanup stubs call into
    pub fn with_ccall_entry(mut self, entry: usize) -> Self {
        self.ccall_entry = Some(entry);
        self
    }

    /// Target this table describes
    pub fn target(&self) -> Target {
        self.target
    }

    /// Entry trampoline for caller-cleanup stubs, if one is installed
    pub fn ccall_entry(&self) -> Option<usize> {
        self.ccall_entry
    }

    /// Whether stubs of `conv` can be built
    pub fn supports(&self, conv: CallingConvention) -> bool {
        match conv {
            CallingConvention::StdCall => self.stdcall,
            CallingConvention::CCall => self.ccall && self.ccall_entry.is_some(),
        }
    }

    /// Like [`ConventionTable::supports`], as a fatal error
    pub fn check(&self, conv: CallingConvention) -> AdjustorResult<()> {
        if self.supports(conv) {
            Ok(())
        } else {
            Err(AdjustorError::UnsupportedConvention(format!(
                "{} on {:?}/{:?}",
                conv, self.target.arch, self.target.os
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const I386_LINUX: Target = Target::new(TargetArch::X86, TargetOs::Linux);
    const I386_DARWIN: Target = Target::new(TargetArch::X86, TargetOs::Darwin);

    #[test]
    fn test_i386_supports_both_with_entry() {
        let table = ConventionTable::for_target(I386_LINUX).with_ccall_entry(0x1000);
        assert!(table.supports(CallingConvention::StdCall));
        assert!(table.supports(CallingConvention::CCall));
        assert_eq!(table.ccall_entry(), Some(0x1000));
    }

    #[test]
    fn test_ccall_requires_entry_trampoline() {
        let table = ConventionTable::for_target(I386_LINUX);
        assert!(table.supports(CallingConvention::StdCall));
        assert!(!table.supports(CallingConvention::CCall));
    }

    #[test]
    fn test_darwin_has_no_stdcall() {
        let table = ConventionTable::for_target(I386_DARWIN).with_ccall_entry(0x1000);
        assert!(!table.supports(CallingConvention::StdCall));
        assert!(table.supports(CallingConvention::CCall));

        let err = table.check(CallingConvention::StdCall).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_other_arches_support_nothing() {
        for arch in [TargetArch::X86_64, TargetArch::AArch64, TargetArch::Other] {
            let table = ConventionTable::for_target(Target::new(arch, TargetOs::Linux))
                .with_ccall_entry(0x1000);
            for conv in CallingConvention::ALL {
                assert!(!table.supports(conv));
                assert!(table.check(conv).unwrap_err().is_fatal());
            }
        }
    }

    #[test]
    fn test_host_table_is_resolved_once() {
        let a = ConventionTable::host() as *const ConventionTable;
        let b = ConventionTable::host() as *const ConventionTable;
        assert_eq!(a, b);
        assert_eq!(ConventionTable::host().target(), Target::host());
    }
}
