//! Little-endian bit accumulator shared by the safe-byte encoders

/// Bits enter at the top and leave from the low end.
#[derive(Debug, Default)]
pub(crate) struct BitAccumulator {
    register: u64,
    len: u32,
}

impl BitAccumulator {
    /// Start from a full 64-bit register.
    pub fn with_value(value: u64) -> Self {
        Self {
            register: value,
            len: 64,
        }
    }

    /// Append `width` bits above the ones already buffered.
    ///
    /// Bits that would land past bit 63 are dropped.
    #[inline]
    pub fn push(&mut self, word: u64, width: u32) {
        if self.len < 64 {
            self.register |= word << self.len;
        }
        self.len = self.len.saturating_add(width);
    }

    /// Low `width` bits of the register.
    #[inline]
    pub fn peek(&self, width: u32) -> u64 {
        self.register & ((1u64 << width) - 1)
    }

    /// Drop the low `width` bits.
    #[inline]
    pub fn pull(&mut self, width: u32) {
        self.register >>= width;
        self.len -= width;
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn register(&self) -> u64 {
        self.register
    }
}
