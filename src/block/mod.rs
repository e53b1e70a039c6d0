//! The block protocol shared by every binary format in the crate.
//!
//! Every parseable unit is a [`Block`]: it reads exactly the bytes it owns,
//! recomputes its derived fields on [`Block::refresh`], and writes exactly
//! [`Block::byte_len`] bytes. Refresh runs children first so that a parent
//! asking for its own length sees the final sizes of its children; offsets are
//! then assigned top-down as running sums (see [`BlockList::assign_offsets`]).

#[macro_use]
pub mod error;
pub mod io;
pub(crate) mod leb;
pub mod pool;
pub mod primitive;
pub mod reference;

use crate::block::error::BlockResult;
use crate::block::io::{BlockReader, BlockWriter};

pub trait Block
{
    fn read(&mut self, reader: &mut BlockReader<'_>) -> BlockResult<()>;

    /// Recomputes derived fields, returning whether the byte length changed.
    fn refresh(&mut self) -> bool
    {
        false
    }

    /// Only meaningful after a complete refresh pass.
    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()>;

    fn byte_len(&self) -> usize;
}

/// Refreshes `block` and returns its serialized bytes.
pub fn block_bytes<B: Block>(block: &mut B) -> BlockResult<Vec<u8>>
{
    block.refresh();
    let mut writer = BlockWriter::with_capacity(block.byte_len());
    block.write(&mut writer)?;
    Ok(writer.into_bytes())
}

/// Ordered children whose layout is the concatenation of their bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockList<T>
{
    items: Vec<T>,
    offsets: Vec<usize>,
    length: usize,
}

impl<T> Default for BlockList<T>
{
    fn default() -> Self
    {
        BlockList { items: Vec::new(), offsets: Vec::new(), length: 0 }
    }
}

impl<T: Block> BlockList<T>
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn from_items(items: Vec<T>) -> Self
    {
        let mut list = BlockList { items, offsets: Vec::new(), length: 0 };
        list.assign_offsets();
        list
    }

    /// Reads `count` children created by `create`, recording their offsets
    /// relative to the first child.
    pub fn read_items<F>(&mut self, reader: &mut BlockReader<'_>, count: usize, mut create: F) -> BlockResult<()>
    where
        F: FnMut(&mut BlockReader<'_>) -> BlockResult<T>,
    {
        let start = reader.position();
        self.items.clear();
        self.offsets.clear();
        for i in 0..count
        {
            self.offsets.push(reader.position() - start);
            let item = create(reader).map_err(|e| err!(e, "item {}", i))?;
            self.items.push(item);
        }
        self.length = reader.position() - start;
        Ok(())
    }

    /// Running sum of the current children's lengths.
    pub fn assign_offsets(&mut self)
    {
        self.offsets.clear();
        let mut offset = 0;
        for item in &self.items
        {
            self.offsets.push(offset);
            offset += item.byte_len();
        }
        self.length = offset;
    }

    pub fn refresh(&mut self) -> bool
    {
        let before = self.length;
        for item in &mut self.items
        {
            item.refresh();
        }
        self.assign_offsets();
        before != self.length
    }

    pub fn write(&self, writer: &mut BlockWriter) -> BlockResult<()>
    {
        for item in &self.items
        {
            item.write(writer)?;
        }
        Ok(())
    }

    pub fn byte_len(&self) -> usize
    {
        self.items.iter().map(|i| i.byte_len()).sum()
    }

    /// Offset of child `index` as of the last read or refresh.
    pub fn offset_of(&self, index: usize) -> Option<usize>
    {
        self.offsets.get(index).copied()
    }

    /// Whether the recorded offsets still match the children's current lengths.
    pub fn is_laid_out(&self) -> bool
    {
        let mut offset = 0;
        self.offsets.len() == self.items.len()
            && self.items.iter().zip(&self.offsets).all(|(item, recorded)| {
                let matches = *recorded == offset;
                offset += item.byte_len();
                matches
            })
            && offset == self.length
    }

    pub fn index_at_offset(&self, offset: usize) -> Option<usize>
    {
        self.offsets.binary_search(&offset).ok()
    }

    pub fn len(&self) -> usize
    {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T>
    {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T>
    {
        self.items.get_mut(index)
    }

    pub fn push(&mut self, item: T)
    {
        self.items.push(item);
    }

    pub fn insert(&mut self, index: usize, item: T)
    {
        self.items.insert(index, item);
    }

    pub fn remove(&mut self, index: usize) -> T
    {
        self.items.remove(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T>
    {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T>
    {
        self.items.iter_mut()
    }

    pub fn items(&self) -> &[T]
    {
        &self.items
    }

    pub fn into_items(self) -> Vec<T>
    {
        self.items
    }

    pub fn clear(&mut self)
    {
        self.items.clear();
        self.offsets.clear();
        self.length = 0;
    }
}

/// Opaque bytes, kept as read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteArray
{
    bytes: Vec<u8>,
}

impl ByteArray
{
    pub fn new(bytes: Vec<u8>) -> Self
    {
        ByteArray { bytes }
    }

    pub fn with_len(length: usize) -> Self
    {
        ByteArray { bytes: vec![0; length] }
    }

    pub fn bytes(&self) -> &[u8]
    {
        &self.bytes
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>)
    {
        self.bytes = bytes;
    }

    pub fn set_len(&mut self, length: usize)
    {
        self.bytes.resize(length, 0);
    }
}

impl Block for ByteArray
{
    fn read(&mut self, reader: &mut BlockReader<'_>) -> BlockResult<()>
    {
        let length = self.bytes.len();
        self.bytes = reader.read_bytes(length)?.to_vec();
        Ok(())
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()>
    {
        writer.write_bytes(&self.bytes);
        Ok(())
    }

    fn byte_len(&self) -> usize
    {
        self.bytes.len()
    }
}

/// A footer that exists only while a sibling counter is non-zero.
///
/// Its width is re-derived from the live counter on every read and refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalTrailer
{
    size: usize,
    fill: u8,
    present: bool,
}

impl ConditionalTrailer
{
    pub const fn new(size: usize, fill: u8) -> Self
    {
        ConditionalTrailer { size, fill, present: false }
    }

    fn update(&mut self, counter: u32) -> bool
    {
        let before = self.present;
        self.present = counter != 0;
        before != self.present
    }

    /// Reads the trailer if `counter` says it is present.
    pub fn read_with(&mut self, reader: &mut BlockReader<'_>, counter: u32) -> BlockResult<()>
    {
        self.update(counter);
        if self.present
        {
            let bytes = reader.read_bytes(self.size)?;
            if bytes.iter().any(|b| *b != self.fill)
            {
                log::warn!("trailer at 0x{:x} is not filled with 0x{:02x}", reader.position() - self.size, self.fill);
            }
        }
        Ok(())
    }

    pub fn refresh_with(&mut self, counter: u32) -> bool
    {
        self.update(counter)
    }

    pub fn write(&self, writer: &mut BlockWriter)
    {
        if self.present
        {
            writer.fill(self.size, self.fill);
        }
    }

    pub fn byte_len(&self) -> usize
    {
        if self.present { self.size } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_list_offsets_are_running_sums() {
        let mut list = BlockList::from_items(vec![ByteArray::with_len(3), ByteArray::with_len(5), ByteArray::with_len(2)]);
        assert_eq!(list.offset_of(2), Some(8));
        list.get_mut(0).unwrap().set_len(1);
        assert!(list.refresh());
        assert_eq!(list.offset_of(1), Some(1));
        assert_eq!(list.offset_of(2), Some(6));
        assert!(!list.refresh());
    }

    #[test]
    fn pushed_children_need_a_refresh() {
        let mut list = BlockList::from_items(vec![ByteArray::with_len(4)]);
        assert!(list.is_laid_out());
        list.push(ByteArray::with_len(2));
        assert!(!list.is_laid_out());
        assert_eq!(list.offset_of(1), None);
        list.refresh();
        assert!(list.is_laid_out());
        assert_eq!(list.index_at_offset(4), Some(1));
        list.get_mut(0).unwrap().set_len(8);
        assert!(!list.is_laid_out());
    }

    #[test]
    fn trailer_follows_counter() {
        let mut trailer = ConditionalTrailer::new(8, 0xff);
        assert_eq!(trailer.byte_len(), 0);
        assert!(trailer.refresh_with(2));
        assert_eq!(trailer.byte_len(), 8);
        assert!(!trailer.refresh_with(2));
        let mut writer = BlockWriter::new();
        trailer.write(&mut writer);
        assert_eq!(writer.as_slice(), &[0xff; 8]);
        assert!(trailer.refresh_with(0));
        assert_eq!(trailer.byte_len(), 0);
    }

    #[test]
    fn trailer_read_depends_on_counter() {
        let bytes = [0xff; 8];
        let mut trailer = ConditionalTrailer::new(8, 0xff);
        let mut reader = BlockReader::new(&bytes);
        trailer.read_with(&mut reader, 0).unwrap();
        assert_eq!(reader.position(), 0);
        trailer.read_with(&mut reader, 1).unwrap();
        assert_eq!(reader.position(), 8);
    }
}
