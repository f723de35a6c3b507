//! Argument layouts and caller-cleanup frame arithmetic
//!
//! The builder never looks at individual argument types. It only needs the
//! number of stack slots the native argument block occupies.

/// Width of one argument stack slot on i386
pub const SLOT_WIDTH: usize = 4;

/// Stack words the entry trampoline adds around the argument copy:
/// saved `%ebp`, dummy argument, handle, and return address.
pub const BASE_OVERHEAD: usize = 16;

/// Part of [`BASE_OVERHEAD`] not reserved through `frame_size`
/// (saved `%ebp`, pushed handle, return address).
pub const UNSHUFFLED: usize = 12;

/// Stack alignment at the call into the adapter
pub const STACK_ALIGN: usize = 16;

/// Anything that can report how many stack slots a native argument list uses
pub trait ArgumentLayout {
    /// Number of [`SLOT_WIDTH`] slots the arguments occupy
    fn slot_count(&self) -> usize;
}

impl ArgumentLayout for usize {
    fn slot_count(&self) -> usize {
        *self
    }
}

/// Primitive argument types of a foreign export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// 32-bit signed integer (`i`)
    Int32,
    /// 32-bit unsigned integer (`w`)
    Word32,
    /// 64-bit signed integer (`l`)
    Int64,
    /// 64-bit unsigned integer (`L`)
    Word64,
    /// 32-bit float (`f`)
    Float,
    /// 64-bit float (`d`)
    Double,
    /// Pointer-sized value (`p`)
    Ptr,
    /// Any other descriptor character
    Other(char),
}

impl ArgType {
    /// Decode one character of a type string
    pub fn from_char(c: char) -> Self {
        match c {
            'i' => ArgType::Int32,
            'w' => ArgType::Word32,
            'l' => ArgType::Int64,
            'L' => ArgType::Word64,
            'f' => ArgType::Float,
            'd' => ArgType::Double,
            'p' => ArgType::Ptr,
            other => ArgType::Other(other),
        }
    }

    /// Stack slots this type uses on i386: doubles and 64-bit integers take
    /// two, everything else one.
    pub fn slots(self) -> usize {
        match self {
            ArgType::Double | ArgType::Int64 | ArgType::Word64 => 2,
            _ => 1,
        }
    }
}

impl ArgumentLayout for [ArgType] {
    fn slot_count(&self) -> usize {
        self.iter().map(|ty| ty.slots()).sum()
    }
}

impl ArgumentLayout for Vec<ArgType> {
    fn slot_count(&self) -> usize {
        self.as_slice().slot_count()
    }
}

/// Argument descriptor string, one character per argument (e.g. `"idp"`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeString(String);

impl TypeString {
    /// Wrap a descriptor string
    pub fn new(s: impl Into<String>) -> Self {
        TypeString(s.into())
    }

    /// The decoded argument types
    pub fn arg_types(&self) -> impl Iterator<Item = ArgType> + '_ {
        self.0.chars().map(ArgType::from_char)
    }

    /// The raw descriptor
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ArgumentLayout for TypeString {
    fn slot_count(&self) -> usize {
        self.arg_types().map(ArgType::slots).sum()
    }
}

/// The two integers a caller-cleanup stub stores for its entry trampoline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Bytes reserved below the saved frame pointer: alignment padding, the
    /// argument copy, and the dummy argument.
    pub frame_size: u32,
    /// Bytes of the original argument block
    pub argument_size: u32,
}

impl FrameLayout {
    /// Frame for an argument block of `slots` stack slots.
    ///
    /// Everything the trampoline pushes is counted, rounded up to
    /// [`STACK_ALIGN`], and then the [`UNSHUFFLED`] words are taken back out.
    pub fn for_slots(slots: usize) -> Self {
        let argument_size = slots * SLOT_WIDTH;
        let total = align_up(argument_size + BASE_OVERHEAD, STACK_ALIGN);
        FrameLayout {
            frame_size: (total - UNSHUFFLED) as u32,
            argument_size: argument_size as u32,
        }
    }

    /// Frame for any argument layout
    pub fn for_layout(layout: &dyn ArgumentLayout) -> Self {
        Self::for_slots(layout.slot_count())
    }
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_scalar_arguments() {
        let frame = FrameLayout::for_slots(3);
        assert_eq!(frame.frame_size, 20);
        assert_eq!(frame.argument_size, 12);
    }

    #[test]
    fn test_no_arguments() {
        let frame = FrameLayout::for_slots(0);
        assert_eq!(frame.frame_size, 4);
        assert_eq!(frame.argument_size, 0);
    }

    #[test]
    fn test_frame_keeps_call_aligned() {
        for n in 0..64 {
            let frame = FrameLayout::for_slots(n);
            assert_eq!((frame.frame_size as usize + UNSHUFFLED) % STACK_ALIGN, 0, "n = {}", n);
            assert_eq!(frame.argument_size as usize, n * SLOT_WIDTH);
            // the reserved area always holds the copy plus the dummy slot
            assert!(frame.frame_size >= frame.argument_size + SLOT_WIDTH as u32);
        }
    }

    #[test]
    fn test_type_string_slots() {
        assert_eq!(TypeString::new("").slot_count(), 0);
        assert_eq!(TypeString::new("iii").slot_count(), 3);
        assert_eq!(TypeString::new("dlL").slot_count(), 6);
        assert_eq!(TypeString::new("ifpd").slot_count(), 5);
        // unknown descriptors count as one word
        assert_eq!(TypeString::new("v?").slot_count(), 2);
    }

    #[test]
    fn test_arg_type_slice_layout() {
        let args = vec![ArgType::Ptr, ArgType::Double, ArgType::Word32];
        assert_eq!(args.slot_count(), 4);
        assert_eq!(FrameLayout::for_layout(&args).argument_size, 16);
    }

    #[test]
    fn test_decode_type_string() {
        let ts = TypeString::new("wLx");
        let types: Vec<_> = ts.arg_types().collect();
        assert_eq!(types, vec![ArgType::Word32, ArgType::Word64, ArgType::Other('x')]);
    }
}
