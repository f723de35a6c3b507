//! Byte layouts of the two i386 stub variants
//!
//! The builder writes these layouts and the reaper reads them back; both go
//! through the types here so they cannot disagree about offsets.
//!
//! ```text
//! stdcall (14 bytes)                  ccall (24 bytes)
//! 0x00  58           popl %eax        0x00  e8 rel32  call entry
//! 0x01  68 <handle>  pushl $handle    0x05  00 00 00  padding
//! 0x06  50           pushl %eax       0x08  handle
//! 0x07  b8 <adapter> movl $adapter    0x0c  adapter
//! 0x0c  ff e0        jmp *%eax        0x10  frame_size
//!                                     0x14  argument_size
//! ```

use crate::convention::{OP_CALL_REL32, OP_POP_EAX};
use crate::handle::Handle;
use crate::layout::FrameLayout;

const OP_PUSH_IMM32: u8 = 0x68;
const OP_PUSH_EAX: u8 = 0x50;
const OP_MOV_EAX_IMM32: u8 = 0xB8;
const OP_JMP_EAX: [u8; 2] = [0xFF, 0xE0];

#[inline]
fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

#[inline]
fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Callee-cleanup stub: re-pushes the return address above the handle and
/// jumps to the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdCallStub {
    /// Handle pushed as the adapter's first argument
    pub handle: Handle,
    /// Adapter entry point
    pub adapter: u32,
}

impl StdCallStub {
    /// Encoded size
    pub const SIZE: usize = 14;
    /// Offset of the handle immediate
    pub const HANDLE_OFFSET: usize = 0x02;
    /// Offset of the adapter immediate
    pub const ADAPTER_OFFSET: usize = 0x08;

    /// Encode the stub
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut code = [0u8; Self::SIZE];
        code[0x00] = OP_POP_EAX;
        code[0x01] = OP_PUSH_IMM32;
        write_u32(&mut code, Self::HANDLE_OFFSET, self.handle.as_raw());
        code[0x06] = OP_PUSH_EAX;
        code[0x07] = OP_MOV_EAX_IMM32;
        write_u32(&mut code, Self::ADAPTER_OFFSET, self.adapter);
        code[0x0c..0x0e].copy_from_slice(&OP_JMP_EAX);
        code
    }

    /// Decode a stub, or `None` if `bytes` is not a stdcall stub
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE
            || bytes[0x00] != OP_POP_EAX
            || bytes[0x01] != OP_PUSH_IMM32
            || bytes[0x06] != OP_PUSH_EAX
            || bytes[0x07] != OP_MOV_EAX_IMM32
            || bytes[0x0c..0x0e] != OP_JMP_EAX
        {
            return None;
        }
        Some(StdCallStub {
            handle: Handle::from_raw(read_u32(bytes, Self::HANDLE_OFFSET))?,
            adapter: read_u32(bytes, Self::ADAPTER_OFFSET),
        })
    }
}

/// Caller-cleanup stub: calls the shared entry trampoline, which finds the
/// stub's fields through the return address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CCallStub {
    /// rel32 displacement of the `call` to the entry trampoline
    pub call_disp: u32,
    /// Handle passed as the adapter's first argument
    pub handle: Handle,
    /// Adapter entry point
    pub adapter: u32,
    /// Frame the trampoline reserves and the argument bytes it copies
    pub frame: FrameLayout,
}

impl CCallStub {
    /// Encoded size
    pub const SIZE: usize = 24;
    /// Length of the `call rel32` instruction; the return address it pushes
    /// is the stub base plus this.
    pub const CALL_LEN: usize = 5;
    /// Size of the padded call header
    pub const HEADER: usize = 8;
    /// Offset of the handle
    pub const HANDLE_OFFSET: usize = Self::HEADER;
    /// Offset of the adapter pointer
    pub const ADAPTER_OFFSET: usize = Self::HEADER + 4;
    /// Offset of `frame_size`
    pub const FRAME_SIZE_OFFSET: usize = Self::HEADER + 8;
    /// Offset of `argument_size`
    pub const ARGUMENT_SIZE_OFFSET: usize = Self::HEADER + 12;

    /// Encode the stub
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut code = [0u8; Self::SIZE];
        code[0] = OP_CALL_REL32;
        write_u32(&mut code, 1, self.call_disp);
        write_u32(&mut code, Self::HANDLE_OFFSET, self.handle.as_raw());
        write_u32(&mut code, Self::ADAPTER_OFFSET, self.adapter);
        write_u32(&mut code, Self::FRAME_SIZE_OFFSET, self.frame.frame_size);
        write_u32(&mut code, Self::ARGUMENT_SIZE_OFFSET, self.frame.argument_size);
        code
    }

    /// Decode a stub, or `None` if `bytes` is not a ccall stub
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE || bytes[0] != OP_CALL_REL32 {
            return None;
        }
        Some(CCallStub {
            call_disp: read_u32(bytes, 1),
            handle: Handle::from_raw(read_u32(bytes, Self::HANDLE_OFFSET))?,
            adapter: read_u32(bytes, Self::ADAPTER_OFFSET),
            frame: FrameLayout {
                frame_size: read_u32(bytes, Self::FRAME_SIZE_OFFSET),
                argument_size: read_u32(bytes, Self::ARGUMENT_SIZE_OFFSET),
            },
        })
    }
}

// The entry trampoline hard-codes these offsets.
const _: () = {
    assert!(StdCallStub::ADAPTER_OFFSET + 4 + OP_JMP_EAX.len() == StdCallStub::SIZE);
    assert!(CCallStub::CALL_LEN <= CCallStub::HEADER);
    assert!(CCallStub::HANDLE_OFFSET == 8);
    assert!(CCallStub::ADAPTER_OFFSET == 12);
    assert!(CCallStub::FRAME_SIZE_OFFSET == 16);
    assert!(CCallStub::ARGUMENT_SIZE_OFFSET == 20);
    assert!(CCallStub::ARGUMENT_SIZE_OFFSET + 4 == CCallStub::SIZE);
};
