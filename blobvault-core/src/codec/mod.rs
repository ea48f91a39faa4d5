//! Binary-safe codecs for keys, node ids and timestamps
//!
//! Everything that crosses the wire (request paths, response headers) or is
//! used as a text-like mapping key goes through the safe-byte codec in
//! [`safe`]. Every byte it produces is either ASCII alphanumeric or has the
//! high bit set, so it can ride unescaped in text-oriented fields.
//!
//! - [`safe`]: the variable-width bit packer and its integer specialisation
//! - [`varint`]: zig-zag LEB128 varints used inside day-file keys
//! - [`escape`]: percent-escaping of high bytes for HTTP path segments

mod bits;
pub mod escape;
pub mod safe;
pub mod varint;

pub use escape::{escape_segment, unescape_segment};
pub use safe::{
    code_to_int, decode, decode_into, encode, encode_into, int_to_code, is_safe_byte, signed,
    unsigned,
};

/// Encode a signed timestamp (or any i64) for transport.
pub fn encode_timestamp(value: i64) -> Vec<u8> {
    int_to_code(unsigned(value))
}

/// Decode a timestamp produced by [`encode_timestamp`].
///
/// Never fails; garbage decodes to whatever bits were accumulated.
pub fn decode_timestamp(encoded: &[u8]) -> i64 {
    signed(code_to_int(encoded))
}
