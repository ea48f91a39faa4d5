//! Safe-byte encoding
//!
//! The encoder walks the input as a little-endian bit stream. Whenever the
//! next 8 bits would form a byte whose low 7 bits are ASCII alphanumeric, those
//! 8 bits are emitted verbatim. Otherwise only 7 bits are consumed and emitted
//! with the high bit forced on. Either way the emitted byte is alphanumeric or
//! `>= 0x80`.
//!
//! Decoding reverses the classification: a byte whose low 7 bits are
//! alphanumeric carries 8 data bits, any other byte `>= 0x80` carries 7, and
//! everything else is noise and skipped. Decoding never fails.

use super::bits::BitAccumulator;

/// True for bytes that may appear unescaped in an encoded string.
#[inline]
pub fn is_safe_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b >= 0x80
}

/// Whether the low byte of `word` may be emitted as a full 8-bit quantum.
#[inline]
fn is_full_quantum(word: u64) -> bool {
    ((word & 0x7f) as u8).is_ascii_alphanumeric()
}

/// Emit one encoded byte from the low end of the accumulator and return the
/// number of data bits it carries.
#[inline]
fn emit(acc: &BitAccumulator, out: &mut Vec<u8>) -> u32 {
    if is_full_quantum(acc.register()) {
        out.push(acc.peek(8) as u8);
        8
    } else {
        out.push(acc.peek(7) as u8 | 0x80);
        7
    }
}

/// Encode `data`, appending to `out`.
pub fn encode_into(data: &[u8], out: &mut Vec<u8>) {
    out.reserve(data.len() + data.len() / 7 + 1);
    let mut acc = BitAccumulator::default();
    for &b in data {
        acc.push(b as u64, 8);
        while acc.len() >= 8 {
            let width = emit(&acc, out);
            acc.pull(width);
        }
    }
    if acc.len() > 0 {
        emit(&acc, out);
    }
}

/// Encode `data` into a fresh buffer.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(data, &mut out);
    out
}

/// Decode `encoded`, appending to `out`.
pub fn decode_into(encoded: &[u8], out: &mut Vec<u8>) {
    let mut acc = BitAccumulator::default();
    for &b in encoded {
        if !is_safe_byte(b) {
            continue;
        }
        let word = b as u64;
        if is_full_quantum(word) {
            acc.push(word, 8);
        } else {
            acc.push(word & 0x7f, 7);
        }
        if acc.len() >= 8 {
            out.push(acc.peek(8) as u8);
            acc.pull(8);
        }
    }
}

/// Decode `encoded` into a fresh buffer.
pub fn decode(encoded: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded.len());
    decode_into(encoded, &mut out);
    out
}

/// Pack the bits of `value` with the same quantum rules, stopping as soon as
/// the remaining register is zero.
pub fn int_to_code(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    let mut acc = BitAccumulator::with_value(value);
    while acc.len() >= 8 {
        let width = emit(&acc, &mut out);
        acc.pull(width);
        if acc.register() == 0 {
            return out;
        }
    }
    if acc.len() > 0 {
        emit(&acc, &mut out);
    }
    out
}

/// Inverse of [`int_to_code`]. Bits beyond the 64th are ignored.
pub fn code_to_int(encoded: &[u8]) -> u64 {
    let mut acc = BitAccumulator::default();
    for &b in encoded {
        if !is_safe_byte(b) {
            continue;
        }
        let word = b as u64;
        if is_full_quantum(word) {
            acc.push(word, 8);
        } else {
            acc.push(word & 0x7f, 7);
        }
    }
    acc.register()
}

/// Zig-zag style mapping: even codes are non-negative values doubled, odd
/// codes are negated values doubled plus one. Code `1` ("negative zero") is
/// reserved for `i64::MIN`, whose magnitude does not fit the scheme.
pub fn unsigned(value: i64) -> u64 {
    if value == i64::MIN {
        1
    } else if value < 0 {
        (value.unsigned_abs() << 1) | 1
    } else {
        (value as u64) << 1
    }
}

/// Inverse of [`unsigned`].
pub fn signed(code: u64) -> i64 {
    let magnitude = (code >> 1) as i64;
    if code & 1 == 1 {
        if magnitude == 0 {
            i64::MIN
        } else {
            -magnitude
        }
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_alphanumeric_passes_through() {
        assert_eq!(encode(b"hello42"), b"hello42".to_vec());
        assert_eq!(decode(b"hello42"), b"hello42".to_vec());
    }

    #[test]
    fn test_unsafe_bytes_are_widened() {
        let encoded = encode(&[0u8, b'/', b' ', 0x7f]);
        assert!(encoded.len() > 4);
        assert!(encoded.iter().all(|b| is_safe_byte(*b)));
        assert_eq!(decode(&encoded), vec![0u8, b'/', b' ', 0x7f]);
    }

    #[test]
    fn test_empty() {
        assert!(encode(b"").is_empty());
        assert!(decode(b"").is_empty());
        assert_eq!(code_to_int(b""), 0);
    }

    #[test]
    fn test_noise_is_skipped() {
        let mut encoded = encode(b"key/with/slashes");
        encoded.insert(3, b'-');
        encoded.push(0x7f);
        assert_eq!(decode(&encoded), b"key/with/slashes".to_vec());
    }

    #[test]
    fn test_truncated_input_decodes_short() {
        let encoded = encode(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let decoded = decode(&encoded[..encoded.len() / 2]);
        assert!(decoded.len() < 8);
        assert_eq!(&decoded[..], &[1, 2, 3, 4, 5, 6, 7, 8][..decoded.len()]);
    }

    #[test]
    fn test_int_code_is_compact() {
        assert_eq!(int_to_code(0), vec![0x80]);
        assert_eq!(code_to_int(&[0x80]), 0);
        assert!(int_to_code(300).len() <= 2);
        assert!(int_to_code(u64::MAX).len() >= 8);
    }

    #[test]
    fn test_signed_mapping() {
        assert_eq!(unsigned(0), 0);
        assert_eq!(unsigned(1), 2);
        assert_eq!(unsigned(-1), 3);
        assert_eq!(signed(4), 2);
        assert_eq!(signed(5), -2);
        assert_eq!(signed(unsigned(i64::MIN)), i64::MIN);
        assert_eq!(signed(unsigned(i64::MAX)), i64::MAX);
    }

    proptest! {
        #[test]
        fn bytes_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let encoded = encode(&data);
            prop_assert!(encoded.iter().all(|b| is_safe_byte(*b)));
            prop_assert_eq!(decode(&encoded), data);
        }

        #[test]
        fn ints_roundtrip(n in any::<u64>()) {
            let encoded = int_to_code(n);
            prop_assert!(encoded.iter().all(|b| is_safe_byte(*b)));
            prop_assert_eq!(code_to_int(&encoded), n);
        }

        #[test]
        fn signed_roundtrip(n in any::<i64>()) {
            prop_assert_eq!(signed(unsigned(n)), n);
        }
    }
}
