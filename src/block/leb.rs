//! LEB128 variable-length integers as used by the dex format.

pub(crate) fn encode_uleb128(value: u32) -> Vec<u8>
{
    let mut out = Vec::with_capacity(uleb128_len(value));
    let mut rest = value;
    loop
    {
        let low = (rest & 0x7f) as u8;
        rest >>= 7;
        if rest == 0
        {
            out.push(low);
            return out;
        }
        out.push(low | 0x80);
    }
}

/// Returns the value and the number of bytes consumed (at most 5).
pub(crate) fn decode_uleb128(encoded: &[u8]) -> (u32, usize)
{
    let mut value = 0u32;
    for (i, byte) in encoded.iter().take(5).enumerate()
    {
        value |= ((byte & 0x7f) as u32).wrapping_shl(7 * i as u32);
        if byte & 0x80 == 0
        {
            return (value, i + 1);
        }
    }
    (value, encoded.len().min(5))
}

pub(crate) fn encode_sleb128(value: i32) -> Vec<u8>
{
    let mut out = Vec::new();
    let mut rest = value;
    loop
    {
        let low = (rest & 0x7f) as u8;
        rest >>= 7;
        let done = (rest == 0 && low & 0x40 == 0) || (rest == -1 && low & 0x40 != 0);
        if done
        {
            out.push(low);
            return out;
        }
        out.push(low | 0x80);
    }
}

pub(crate) fn decode_sleb128(encoded: &[u8]) -> (i32, usize)
{
    let mut value = 0i32;
    let mut shift = 0u32;
    let mut count = 0usize;
    let mut last = 0u8;
    for byte in encoded.iter().take(5)
    {
        last = *byte;
        count += 1;
        value |= ((byte & 0x7f) as i32).wrapping_shl(shift);
        shift += 7;
        if byte & 0x80 == 0
        {
            break;
        }
    }
    if shift < 32 && last & 0x40 != 0
    {
        value |= (-1i32).wrapping_shl(shift);
    }
    (value, count)
}

/// uleb128 of `value + 1`, so that -1 (no index) encodes as a single zero byte.
pub(crate) fn encode_uleb128p1(value: i32) -> Vec<u8>
{
    encode_uleb128(value.wrapping_add(1) as u32)
}

pub(crate) fn decode_uleb128p1(encoded: &[u8]) -> (i32, usize)
{
    let (value, count) = decode_uleb128(encoded);
    ((value as i32).wrapping_sub(1), count)
}

pub(crate) fn uleb128_len(value: u32) -> usize
{
    match value
    {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0xfff_ffff => 4,
        _ => 5,
    }
}

pub(crate) fn sleb128_len(value: i32) -> usize
{
    let mut rest = value;
    let mut count = 1;
    loop
    {
        let low = rest & 0x7f;
        rest >>= 7;
        if (rest == 0 && low & 0x40 == 0) || (rest == -1 && low & 0x40 != 0)
        {
            return count;
        }
        count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uleb128_known_encodings() {
        let cases: [(u32, &[u8]); 6] = [
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (16256, &[0x80, 0x7f]),
            (624485, &[0xe5, 0x8e, 0x26]),
        ];
        for (value, bytes) in cases {
            assert_eq!(encode_uleb128(value), bytes);
            assert_eq!(decode_uleb128(bytes), (value, bytes.len()));
        }
    }

    #[test]
    fn sleb128_known_encodings() {
        let cases: [(i32, &[u8]); 6] = [
            (0, &[0x00]),
            (1, &[0x01]),
            (-1, &[0x7f]),
            (127, &[0xff, 0x00]),
            (-128, &[0x80, 0x7f]),
            (-123456, &[0xc0, 0xbb, 0x78]),
        ];
        for (value, bytes) in cases {
            assert_eq!(encode_sleb128(value), bytes);
            assert_eq!(decode_sleb128(bytes), (value, bytes.len()));
            assert_eq!(sleb128_len(value), bytes.len());
        }
    }

    #[test]
    fn uleb128_len_matches_encoding() {
        for value in [0u32, 1, 127, 128, 16383, 16384, 0x1f_ffff, 0x20_0000, 0xfff_ffff, u32::MAX] {
            assert_eq!(uleb128_len(value), encode_uleb128(value).len(), "value {value:#x}");
        }
    }

    #[test]
    fn uleb128p1_no_index() {
        assert_eq!(encode_uleb128p1(-1), vec![0x00]);
        assert_eq!(decode_uleb128p1(&[0x00]), (-1, 1));
        assert_eq!(decode_uleb128p1(&[0x05]), (4, 1));
    }
}
