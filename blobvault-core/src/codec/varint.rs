//! Zig-zag LEB128 varints
//!
//! Byte-compatible with Go's `binary.PutVarint`, which is how day-file keys
//! have always been laid out.

/// Longest encoding of a 64-bit value.
pub const MAX_VARINT_LEN: usize = 10;

/// Append the varint encoding of `value` to `out`.
pub fn put_varint(value: i64, out: &mut Vec<u8>) {
    let mut ux = ((value << 1) ^ (value >> 63)) as u64;
    while ux >= 0x80 {
        out.push(ux as u8 | 0x80);
        ux >>= 7;
    }
    out.push(ux as u8);
}

/// Read one varint from the front of `data`.
///
/// Returns the value and the number of bytes consumed, or `None` when the
/// buffer ends early or the value overflows 64 bits.
pub fn read_varint(data: &[u8]) -> Option<(i64, usize)> {
    let mut ux = 0u64;
    let mut shift = 0u32;
    for (i, &b) in data.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return None;
        }
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return None;
            }
            ux |= (b as u64) << shift;
            let value = ((ux >> 1) as i64) ^ -((ux & 1) as i64);
            return Some((value, i + 1));
        }
        ux |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    None
}
