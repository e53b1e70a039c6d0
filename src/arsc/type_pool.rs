//! The per-package pool of type names (`attr`, `string`, `layout`, ...).
//!
//! Type ids are handed out by the package, not by this pool: a type's id is
//! fixed when the type is created and the pool must be densely numbered up to
//! it. `id = index + 1 + type_id_offset`.

use crate::arsc::string_pool::{ResString, StringPoolChunk};
use crate::block::error::{BlockError, BlockResult};
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::pool::{ItemId, Numbering};

#[derive(Debug, Clone)]
pub struct TypeStringPool {
    chunk: StringPoolChunk,
    id_offset: u32,
}

impl Default for TypeStringPool {
    fn default() -> Self {
        Self::new(0)
    }
}

impl TypeStringPool {
    pub fn new(id_offset: u32) -> Self {
        let mut chunk = StringPoolChunk::new(false);
        chunk.set_numbering(Numbering::Id { offset: id_offset });
        TypeStringPool { chunk, id_offset }
    }

    pub fn read(reader: &mut BlockReader<'_>, id_offset: u32) -> BlockResult<Self> {
        let mut chunk = StringPoolChunk::read(reader)?;
        chunk.set_numbering(Numbering::Id { offset: id_offset });
        Ok(TypeStringPool { chunk, id_offset })
    }

    pub fn chunk(&self) -> &StringPoolChunk {
        &self.chunk
    }

    pub fn chunk_mut(&mut self) -> &mut StringPoolChunk {
        &mut self.chunk
    }

    pub fn id_offset(&self) -> u32 {
        self.id_offset
    }

    pub fn set_id_offset(&mut self, id_offset: u32) {
        self.id_offset = id_offset;
        self.chunk.set_numbering(Numbering::Id { offset: id_offset });
    }

    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    pub fn to_type_id(&self, index: usize) -> u32 {
        self.chunk.strings().to_id(index)
    }

    pub fn to_index(&self, type_id: u32) -> Option<usize> {
        self.chunk.strings().to_index(type_id)
    }

    /// Highest type id currently named, or 0 for an empty pool.
    pub fn last_id(&self) -> u32 {
        if self.is_empty() { 0 } else { self.to_type_id(self.len() - 1) }
    }

    pub fn get_by_id(&self, type_id: u32) -> BlockResult<&str> {
        self.chunk.strings().get_by_id(type_id).map(|s| s.text())
    }

    /// Type id of `name`, or 0 when the pool has no such type.
    pub fn id_of(&self, name: &str) -> u32 {
        self.chunk.strings().id_of(name)
    }

    /// Names the type `type_id`, growing the pool with `type-<index>`
    /// placeholders so that every lower id stays named.
    pub fn get_or_create_with_id(&mut self, type_id: u32, name: &str) -> BlockResult<ItemId<ResString>> {
        let index = match self.to_index(type_id) {
            Some(index) => index,
            None => {
                return Err(BlockError::usage(format!(
                    "type id 0x{:x} is below the first id 0x{:x}",
                    type_id,
                    self.id_offset + 1
                )))
            }
        };
        let strings = self.chunk.strings_mut();
        while strings.len() <= index {
            let placeholder = format!("type-{}", strings.len());
            strings.push(ResString::new(placeholder));
        }
        let item = strings.get_mut(index)?;
        if item.text() != name {
            item.set_text(name);
        }
        strings.id_at(index).ok_or_else(|| BlockError::resolution(format!("type index {} vanished", index)))
    }

    /// Returns the existing type named `name`.
    ///
    /// Type ids are never assigned by the pool, so an absent name is a usage
    /// error; use [`TypeStringPool::get_or_create_with_id`].
    pub fn get_or_create(&mut self, name: &str) -> BlockResult<ItemId<ResString>> {
        match self.chunk.strings().find_key(name) {
            Some(id) => Ok(id),
            None => Err(BlockError::usage(format!(
                "type pool cannot create \"{}\" without an explicit type id",
                name
            ))),
        }
    }

    pub fn refresh(&mut self) -> BlockResult<bool> {
        self.chunk.refresh()
    }

    pub fn commit(&mut self) {
        self.chunk.commit();
    }

    pub fn byte_len(&self) -> usize {
        self.chunk.byte_len()
    }

    pub fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        self.chunk.write(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::error::ErrorKind;

    #[test]
    fn explicit_id_fills_placeholders() {
        let mut pool = TypeStringPool::new(0);
        let id = pool.to_type_id(5);
        pool.get_or_create_with_id(id, "Foo").unwrap();
        assert_eq!(pool.len(), 6);
        for i in 0..5 {
            assert_eq!(pool.chunk().get(i).unwrap(), format!("type-{}", i));
        }
        assert_eq!(pool.chunk().get(5).unwrap(), "Foo");
        assert_eq!(pool.get_by_id(6).unwrap(), "Foo");
        assert_eq!(pool.id_of("Foo"), 6);
        assert_eq!(pool.last_id(), 6);
    }

    #[test]
    fn create_without_id_is_usage_error() {
        let mut pool = TypeStringPool::new(0);
        pool.get_or_create_with_id(1, "attr").unwrap();
        assert!(pool.get_or_create("attr").is_ok());
        let e = pool.get_or_create("string").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Usage);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn id_offset_shifts_numbering() {
        let mut pool = TypeStringPool::new(0x10);
        assert!(pool.get_or_create_with_id(0x10, "x").is_err());
        pool.get_or_create_with_id(0x11, "attr").unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.to_type_id(0), 0x11);
        assert_eq!(pool.to_index(0x11), Some(0));
        for index in 0..8 {
            assert_eq!(pool.to_index(pool.to_type_id(index)), Some(index));
        }
    }

    #[test]
    fn existing_entries_keep_their_ids() {
        let mut pool = TypeStringPool::new(0);
        pool.get_or_create_with_id(1, "attr").unwrap();
        pool.get_or_create_with_id(2, "string").unwrap();
        pool.get_or_create_with_id(4, "layout").unwrap();
        assert_eq!(pool.id_of("attr"), 1);
        assert_eq!(pool.id_of("string"), 2);
        assert_eq!(pool.get_by_id(3).unwrap(), "type-2");
    }
}
