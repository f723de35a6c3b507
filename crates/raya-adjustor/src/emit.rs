//! i386 stub emission
//!
//! Pure byte generation: given where the stub will live and what it embeds,
//! produce its code. Nothing here touches memory permissions or handles, so
//! the output can be checked without ever running it.

use crate::convention::CallingConvention;
use crate::error::{AdjustorError, AdjustorResult};
use crate::handle::Handle;
use crate::layout::FrameLayout;
use crate::stub::{CCallStub, StdCallStub};

/// Everything a stub embeds
#[derive(Debug, Clone, Copy)]
pub struct StubParams {
    /// Address the stub will be written to
    pub base: usize,
    /// Handle to pass to the adapter
    pub handle: Handle,
    /// Adapter entry point
    pub adapter: usize,
    /// Shared entry trampoline (caller-cleanup only)
    pub ccall_entry: Option<usize>,
    /// Frame arithmetic (caller-cleanup only)
    pub frame: Option<FrameLayout>,
}

/// Encoded stub, ready to be copied to `StubParams::base`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubCode {
    /// Callee-cleanup stub
    StdCall([u8; StdCallStub::SIZE]),
    /// Caller-cleanup stub
    CCall([u8; CCallStub::SIZE]),
}

impl StubCode {
    /// The encoded bytes
    pub fn bytes(&self) -> &[u8] {
        match self {
            StubCode::StdCall(code) => &code[..],
            StubCode::CCall(code) => &code[..],
        }
    }

    /// Encoded length
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    /// Whether the stub has no bytes. An encoded stub never does.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Encoded size of a stub for `conv`
pub fn stub_size(conv: CallingConvention) -> usize {
    match conv {
        CallingConvention::StdCall => StdCallStub::SIZE,
        CallingConvention::CCall => CCallStub::SIZE,
    }
}

/// Encode a stub for `conv`
pub fn emit(conv: CallingConvention, params: &StubParams) -> AdjustorResult<StubCode> {
    let adapter = imm32("adapter", params.adapter)?;
    match conv {
        CallingConvention::StdCall => Ok(StubCode::StdCall(
            StdCallStub {
                handle: params.handle,
                adapter,
            }
            .encode(),
        )),
        CallingConvention::CCall => {
            let entry = params.ccall_entry.ok_or_else(|| {
                AdjustorError::UnsupportedConvention(format!("{} without an entry trampoline", conv))
            })?;
            let frame = params.frame.ok_or(AdjustorError::MissingLayout(conv))?;
            Ok(StubCode::CCall(
                CCallStub {
                    call_disp: rel32(params.base, imm32("ccall entry", entry)?),
                    handle: params.handle,
                    adapter,
                    frame,
                }
                .encode(),
            ))
        }
    }
}

fn imm32(what: &'static str, addr: usize) -> AdjustorResult<u32> {
    u32::try_from(addr).map_err(|_| AdjustorError::AddressOutOfRange { what, addr })
}

/// Displacement of a `call rel32` at `base` that lands on `target`.
///
/// i386 addresses wrap at 2^32, so only the low 32 bits of the distance
/// matter.
fn rel32(base: usize, target: u32) -> u32 {
    let next = (base as u32).wrapping_add(CCallStub::CALL_LEN as u32);
    target.wrapping_sub(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(base: usize, entry: Option<usize>, frame: Option<FrameLayout>) -> StubParams {
        StubParams {
            base,
            handle: Handle::from_raw(0x1234).unwrap(),
            adapter: 0x0040_1000,
            ccall_entry: entry,
            frame,
        }
    }

    #[test]
    fn test_stdcall_emission() {
        let code = emit(CallingConvention::StdCall, &params(0x1000, None, None)).unwrap();
        assert_eq!(code.len(), 14);
        let stub = StdCallStub::decode(code.bytes()).unwrap();
        assert_eq!(stub.handle.as_raw(), 0x1234);
        assert_eq!(stub.adapter, 0x0040_1000);
    }

    #[test]
    fn test_ccall_call_lands_on_entry() {
        let base = 0x0800_0000;
        let entry = 0x0804_2000;
        let frame = FrameLayout::for_slots(3);
        let code = emit(CallingConvention::CCall, &params(base, Some(entry), Some(frame))).unwrap();

        let stub = CCallStub::decode(code.bytes()).unwrap();
        let landed = (base as u32)
            .wrapping_add(CCallStub::CALL_LEN as u32)
            .wrapping_add(stub.call_disp);
        assert_eq!(landed, entry as u32);
        assert_eq!(stub.frame, frame);
    }

    #[test]
    fn test_ccall_backward_call() {
        let code = emit(
            CallingConvention::CCall,
            &params(0x0900_0000, Some(0x0010_0000), Some(FrameLayout::for_slots(0))),
        )
        .unwrap();
        let stub = CCallStub::decode(code.bytes()).unwrap();
        assert!((stub.call_disp as i32) < 0);
    }

    #[test]
    fn test_ccall_needs_frame_and_entry() {
        let err = emit(CallingConvention::CCall, &params(0x1000, Some(0x2000), None)).unwrap_err();
        assert!(matches!(err, AdjustorError::MissingLayout(CallingConvention::CCall)));

        let err = emit(
            CallingConvention::CCall,
            &params(0x1000, None, Some(FrameLayout::for_slots(1))),
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_wide_adapter_is_rejected() {
        let mut p = params(0x1000, None, None);
        p.adapter = 0x7fff_0000_1000;
        let err = emit(CallingConvention::StdCall, &p).unwrap_err();
        assert!(matches!(err, AdjustorError::AddressOutOfRange { what: "adapter", .. }));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_wide_entry_is_rejected() {
        let err = emit(
            CallingConvention::CCall,
            &params(0x1000, Some(0x7fff_0000_0000), Some(FrameLayout::for_slots(1))),
        )
        .unwrap_err();
        assert!(matches!(err, AdjustorError::AddressOutOfRange { what: "ccall entry", .. }));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_displacement_uses_low_32_bits_of_base() {
        let base = 0x7f12_0800_0000;
        let entry = 0x0804_2000;
        let code = emit(
            CallingConvention::CCall,
            &params(base, Some(entry), Some(FrameLayout::for_slots(2))),
        )
        .unwrap();
        let stub = CCallStub::decode(code.bytes()).unwrap();
        let landed = (base as u32).wrapping_add(5).wrapping_add(stub.call_disp);
        assert_eq!(landed, entry as u32);
    }

    #[test]
    fn test_stub_sizes() {
        assert_eq!(stub_size(CallingConvention::StdCall), 14);
        assert_eq!(stub_size(CallingConvention::CCall), 24);
    }
}
