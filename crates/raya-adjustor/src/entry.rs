//! Shared entry trampoline for caller-cleanup stubs (i386)
//!
//! Every ccall stub is `call raya_adjustor_ccall_entry` followed by its
//! fields (see [`crate::stub::CCallStub`]). The trampoline recovers the stub
//! from the return address, copies the caller's argument block below a fresh
//! frame, pushes the handle and calls the adapter with the stack 16-byte
//! aligned:
//!
//! ```text
//! entry:                      after `subl frame_size, %esp` + copy:
//!   0(%esp)  stub + 5           0(%esp)  dummy argument
//!   4(%esp)  caller return      4(%esp)  argument copy
//!   8(%esp)  arguments          ...      padding
//!                               0(%ebp)  saved %ebp
//! ```
//!
//! The adapter sees `(handle, dummy, args...)`. `leave; ret` returns straight
//! to the original caller, who pops its own arguments.

#[cfg(target_arch = "x86")]
std::arch::global_asm!(
    ".globl raya_adjustor_ccall_entry",
    "raya_adjustor_ccall_entry:",
    "popl %eax",
    "subl $5, %eax",
    "pushl %ebp",
    "movl %esp, %ebp",
    "subl 16(%eax), %esp",
    "movl 20(%eax), %ecx",
    "jmp 2f",
    "1:",
    "subl $4, %ecx",
    "movl 8(%ebp,%ecx), %edx",
    "movl %edx, 4(%esp,%ecx)",
    "2:",
    "testl %ecx, %ecx",
    "jnz 1b",
    "pushl 8(%eax)",
    "calll *12(%eax)",
    "leave",
    "retl",
    options(att_syntax)
);

#[cfg(target_arch = "x86")]
extern "C" {
    fn raya_adjustor_ccall_entry();
}

/// Address of the host's ccall entry trampoline, where one exists
pub(crate) fn host_ccall_entry() -> Option<usize> {
    #[cfg(target_arch = "x86")]
    {
        Some(raya_adjustor_ccall_entry as usize)
    }
    #[cfg(not(target_arch = "x86"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_only_on_i386() {
        assert_eq!(host_ccall_entry().is_some(), cfg!(target_arch = "x86"));
    }
}
