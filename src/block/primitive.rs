//! Minimal-width storage of primitive constants.
//!
//! Integers keep their low-order bytes and drop redundant high-order ones;
//! floating point values keep their high-order bytes and drop trailing zero
//! low-order ones, since that is where a float's significant bits live. All
//! byte slices are little-endian. A value with no significant bytes encodes
//! to an empty slice.

/// Drops high-order zero bytes of the low `width` bytes of `value`.
pub fn encode_unsigned(value: u64, width: usize) -> Vec<u8>
{
    let bytes = value.to_le_bytes();
    let mut used = width.min(8);
    while used > 0 && bytes[used - 1] == 0
    {
        used -= 1;
    }
    bytes[..used].to_vec()
}

/// Drops high-order bytes that only repeat the sign.
pub fn encode_signed(value: i64, width: usize) -> Vec<u8>
{
    let bytes = value.to_le_bytes();
    let mut used = width.min(8);
    while used > 0
    {
        let top = bytes[used - 1];
        let below_negative = used >= 2 && bytes[used - 2] & 0x80 != 0;
        let redundant = match top
        {
            0x00 => used == 1 || !below_negative,
            0xff => used >= 2 && below_negative,
            _ => false,
        };
        if !redundant
        {
            break;
        }
        used -= 1;
    }
    bytes[..used].to_vec()
}

/// Drops low-order zero bytes; the remaining high-order bytes are returned.
pub fn encode_right_aligned(bits: u64, width: usize) -> Vec<u8>
{
    let width = width.min(8);
    let bytes = bits.to_le_bytes();
    let mut skip = 0;
    while skip < width && bytes[skip] == 0
    {
        skip += 1;
    }
    bytes[skip..width].to_vec()
}

pub fn decode_unsigned(bytes: &[u8]) -> u64
{
    bytes.iter().take(8).enumerate().fold(0u64, |acc, (i, b)| acc | ((*b as u64) << (8 * i)))
}

pub fn decode_signed(bytes: &[u8]) -> i64
{
    let len = bytes.len().min(8);
    if len == 0
    {
        return 0;
    }
    let raw = decode_unsigned(&bytes[..len]);
    let shift = 64 - 8 * len as u32;
    ((raw << shift) as i64) >> shift
}

/// Reconstructs a `width`-byte value from its stored high-order bytes.
pub fn decode_right_aligned(bytes: &[u8], width: usize) -> u64
{
    let len = bytes.len().min(width);
    if len == 0
    {
        return 0;
    }
    decode_unsigned(&bytes[..len]) << (8 * (width - len))
}

pub fn encode_f32(value: f32) -> Vec<u8>
{
    encode_right_aligned(value.to_bits() as u64, 4)
}

pub fn decode_f32(bytes: &[u8]) -> f32
{
    f32::from_bits(decode_right_aligned(bytes, 4) as u32)
}

pub fn encode_f64(value: f64) -> Vec<u8>
{
    encode_right_aligned(value.to_bits(), 8)
}

pub fn decode_f64(bytes: &[u8]) -> f64
{
    f64::from_bits(decode_right_aligned(bytes, 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_has_no_stored_bytes() {
        assert!(encode_unsigned(0, 4).is_empty());
        assert!(encode_signed(0, 4).is_empty());
        assert!(encode_f32(0.0).is_empty());
        assert_eq!(decode_unsigned(&[]), 0);
        assert_eq!(decode_f32(&[]), 0.0);
    }

    #[test]
    fn one_is_a_single_byte() {
        let stored = encode_unsigned(1, 4);
        assert_eq!(stored, vec![1]);
        assert_eq!(decode_unsigned(&stored), 1);
    }

    #[test]
    fn float_keeps_high_bytes() {
        let stored = encode_f32(1.5);
        assert_eq!(stored, vec![0xc0, 0x3f]);
        assert_eq!(decode_f32(&stored), 1.5);
        assert_eq!(decode_f64(&encode_f64(-2.25)), -2.25);
    }

    #[test]
    fn signed_values_keep_sign() {
        for value in [-1i64, 1, 127, 128, -128, -129, 0x7fff, -0x8000, i32::MIN as i64, i64::MAX] {
            let stored = encode_signed(value, 8);
            assert_eq!(decode_signed(&stored), value, "value {value}");
        }
        assert_eq!(encode_signed(-1, 4), vec![0xff]);
        assert_eq!(encode_signed(128, 4), vec![0x80, 0x00]);
        assert_eq!(encode_signed(-129, 4), vec![0x7f, 0xff]);
    }

    #[test]
    fn unsigned_respects_width() {
        assert_eq!(encode_unsigned(0x1234, 2), vec![0x34, 0x12]);
        assert_eq!(decode_unsigned(&encode_unsigned(0xffff_ffff, 4)), 0xffff_ffff);
    }
}
