//! Forward cursor over an input buffer and the append-only sink blocks write into.

use crate::block::error::{BlockError, BlockResult};
use crate::block::leb::{decode_sleb128, decode_uleb128, decode_uleb128p1, encode_sleb128, encode_uleb128, encode_uleb128p1};

pub struct BlockReader<'a>
{
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlockReader<'a>
{
    pub fn new(data: &'a [u8]) -> Self
    {
        BlockReader { data, pos: 0 }
    }

    pub fn data(&self) -> &'a [u8]
    {
        self.data
    }

    pub fn len(&self) -> usize
    {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.data.is_empty()
    }

    pub fn position(&self) -> usize
    {
        self.pos
    }

    pub fn remaining(&self) -> usize
    {
        self.data.len().saturating_sub(self.pos)
    }

    /// Absolute position to come back to with [`BlockReader::reset`].
    pub fn bookmark(&self) -> usize
    {
        self.pos
    }

    pub fn reset(&mut self, bookmark: usize)
    {
        self.pos = bookmark;
    }

    pub fn seek(&mut self, offset: usize) -> BlockResult<()>
    {
        if offset > self.data.len()
        {
            fail!("Attempted to seek to 0x{:x} past end of buffer (0x{:x})", offset, self.data.len());
        }
        self.pos = offset;
        Ok(())
    }

    pub fn skip(&mut self, count: usize) -> BlockResult<()>
    {
        self.ensure(count, "skip")?;
        self.pos += count;
        Ok(())
    }

    fn ensure(&self, count: usize, what: &str) -> BlockResult<()>
    {
        if self.pos.checked_add(count).map_or(true, |end| end > self.data.len())
        {
            fail!("Unexpected end of stream reading {} at index 0x{:x}", what, self.pos);
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> BlockResult<u8>
    {
        self.ensure(1, "u1")?;
        let result = self.data[self.pos];
        self.pos += 1;
        Ok(result)
    }

    pub fn read_u16(&mut self) -> BlockResult<u16>
    {
        self.ensure(2, "u2")?;
        let result = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(result)
    }

    pub fn peek_u16(&self) -> BlockResult<u16>
    {
        self.ensure(2, "u2")?;
        Ok(u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]))
    }

    pub fn read_u32(&mut self) -> BlockResult<u32>
    {
        self.ensure(4, "u4")?;
        let d = &self.data[self.pos..self.pos + 4];
        self.pos += 4;
        Ok(u32::from_le_bytes([d[0], d[1], d[2], d[3]]))
    }

    pub fn read_u64(&mut self) -> BlockResult<u64>
    {
        let low = self.read_u32()? as u64;
        let high = self.read_u32()? as u64;
        Ok((high << 32) | low)
    }

    pub fn read_bytes(&mut self, length: usize) -> BlockResult<&'a [u8]>
    {
        self.ensure(length, "byte array")?;
        let slice = &self.data[self.pos..self.pos + length];
        self.pos += length;
        Ok(slice)
    }

    pub fn read_uleb128(&mut self) -> BlockResult<u32>
    {
        let (value, size) = decode_uleb128(&self.data[self.pos.min(self.data.len())..]);
        self.check_leb(size, "uleb128")?;
        Ok(value)
    }

    pub fn read_uleb128p1(&mut self) -> BlockResult<i32>
    {
        let (value, size) = decode_uleb128p1(&self.data[self.pos.min(self.data.len())..]);
        self.check_leb(size, "uleb128p1")?;
        Ok(value)
    }

    pub fn read_sleb128(&mut self) -> BlockResult<i32>
    {
        let (value, size) = decode_sleb128(&self.data[self.pos.min(self.data.len())..]);
        self.check_leb(size, "sleb128")?;
        Ok(value)
    }

    fn check_leb(&mut self, size: usize, what: &str) -> BlockResult<()>
    {
        // A zero size or a final byte with the continuation bit means the input ran out.
        if size == 0 || (size < 5 && self.data[self.pos + size - 1] & 0x80 != 0)
        {
            fail!("Unexpected end of stream reading {} at index 0x{:x}", what, self.pos);
        }
        self.pos += size;
        Ok(())
    }

    /// A reader over the next `length` bytes; this reader skips past them.
    pub fn sub_reader(&mut self, length: usize) -> BlockResult<BlockReader<'a>>
    {
        let data = self.read_bytes(length)?;
        Ok(BlockReader::new(data))
    }

    pub fn align(&mut self, alignment: usize) -> BlockResult<()>
    {
        let pad = padding(self.pos, alignment);
        self.skip(pad)
    }
}

pub(crate) fn padding(position: usize, alignment: usize) -> usize
{
    if alignment <= 1
    {
        return 0;
    }
    (alignment - position % alignment) % alignment
}

#[derive(Debug, Default)]
pub struct BlockWriter
{
    buffer: Vec<u8>,
}

impl BlockWriter
{
    pub fn new() -> Self
    {
        BlockWriter { buffer: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self
    {
        BlockWriter { buffer: Vec::with_capacity(capacity) }
    }

    pub fn position(&self) -> usize
    {
        self.buffer.len()
    }

    pub fn write_u8(&mut self, val: u8) -> usize
    {
        self.buffer.push(val);
        1
    }

    pub fn write_u16(&mut self, val: u16) -> usize
    {
        self.buffer.extend_from_slice(&val.to_le_bytes());
        2
    }

    pub fn write_u32(&mut self, val: u32) -> usize
    {
        self.buffer.extend_from_slice(&val.to_le_bytes());
        4
    }

    pub fn write_u64(&mut self, val: u64) -> usize
    {
        self.buffer.extend_from_slice(&val.to_le_bytes());
        8
    }

    pub fn write_bytes(&mut self, val: &[u8]) -> usize
    {
        self.buffer.extend_from_slice(val);
        val.len()
    }

    pub fn write_uleb128(&mut self, val: u32) -> usize
    {
        self.write_bytes(&encode_uleb128(val))
    }

    pub fn write_uleb128p1(&mut self, val: i32) -> usize
    {
        self.write_bytes(&encode_uleb128p1(val))
    }

    pub fn write_sleb128(&mut self, val: i32) -> usize
    {
        self.write_bytes(&encode_sleb128(val))
    }

    pub fn fill(&mut self, count: usize, byte: u8) -> usize
    {
        self.buffer.resize(self.buffer.len() + count, byte);
        count
    }

    /// Zero-fills up to the next multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) -> usize
    {
        let pad = padding(self.buffer.len(), alignment);
        self.fill(pad, 0)
    }

    /// Like [`BlockWriter::align`], measured from `base` instead of the buffer start.
    pub fn align_from(&mut self, base: usize, alignment: usize) -> usize
    {
        let pad = padding(self.buffer.len().saturating_sub(base), alignment);
        self.fill(pad, 0)
    }

    pub fn patch_u32(&mut self, position: usize, val: u32) -> BlockResult<()>
    {
        match self.buffer.get_mut(position..position + 4)
        {
            Some(slot) => { slot.copy_from_slice(&val.to_le_bytes()); Ok(()) }
            None => Err(BlockError::usage(format!("patch position 0x{:x} is outside the written bytes", position))),
        }
    }

    pub fn as_slice(&self) -> &[u8]
    {
        &self.buffer
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8]
    {
        &mut self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8>
    {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut reader = BlockReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_u16().unwrap(), 0x0302);
        assert_eq!(reader.read_u32().unwrap(), 0x07060504);
        assert_eq!(reader.remaining(), 0);
        assert!(reader.read_u8().is_err());
    }

    #[test]
    fn bookmark_and_reset() {
        let bytes = [0xAA, 0xBB, 0xCC];
        let mut reader = BlockReader::new(&bytes);
        reader.read_u8().unwrap();
        let mark = reader.bookmark();
        reader.read_u16().unwrap();
        reader.reset(mark);
        assert_eq!(reader.read_u8().unwrap(), 0xBB);
    }

    #[test]
    fn truncated_leb_is_an_error() {
        let bytes = [0x80, 0x80];
        let mut reader = BlockReader::new(&bytes);
        assert!(reader.read_uleb128().is_err());
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn writer_aligns_and_patches() {
        let mut writer = BlockWriter::new();
        writer.write_u8(1);
        assert_eq!(writer.align(4), 3);
        writer.write_u32(0);
        writer.patch_u32(4, 0xdeadbeef).unwrap();
        assert_eq!(writer.into_bytes(), vec![1, 0, 0, 0, 0xef, 0xbe, 0xad, 0xde]);
    }
}
