//! Integers stored inside a block that mean "index of" or "offset of" another block.
//!
//! A reference holds the raw value it was read with until the first access,
//! at which point it is bound to the item that value named in the pool's
//! last-written order. From then on it resolves by identity, and
//! [`IndexReference::refresh`] rewrites the stored value from the item's
//! current index.

use std::cell::Cell;
use std::fmt;

use crate::block::error::{BlockError, BlockResult};
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::leb::uleb128_len;
use crate::block::pool::{ItemId, Pool};

/// Stored value meaning "no item".
pub const NO_INDEX: u32 = u32::MAX;

/// Physical encoding of a stored index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefWidth
{
    Short,
    Int,
    Uleb,
    /// uleb128 of `value + 1`, so that "no item" is a single zero byte.
    UlebP1,
}

impl RefWidth
{
    fn read(self, reader: &mut BlockReader<'_>) -> BlockResult<u32>
    {
        Ok(match self
        {
            RefWidth::Short => match reader.read_u16()?
            {
                0xffff => NO_INDEX,
                v => v as u32,
            },
            RefWidth::Int => reader.read_u32()?,
            RefWidth::Uleb => reader.read_uleb128()?,
            RefWidth::UlebP1 => reader.read_uleb128p1()? as u32,
        })
    }

    fn write(self, writer: &mut BlockWriter, value: u32) -> usize
    {
        match self
        {
            RefWidth::Short => writer.write_u16(value as u16),
            RefWidth::Int => writer.write_u32(value),
            RefWidth::Uleb => writer.write_uleb128(value),
            RefWidth::UlebP1 => writer.write_uleb128p1(value as i32),
        }
    }

    fn len(self, value: u32) -> usize
    {
        match self
        {
            RefWidth::Short => 2,
            RefWidth::Int => 4,
            RefWidth::Uleb => uleb128_len(value),
            RefWidth::UlebP1 => uleb128_len(value.wrapping_add(1)),
        }
    }
}

/// Reference by position in a [`Pool`].
pub struct IndexReference<T>
{
    width: RefWidth,
    stored: Cell<u32>,
    bound: Cell<Option<ItemId<T>>>,
}

impl<T> Clone for IndexReference<T>
{
    fn clone(&self) -> Self
    {
        IndexReference { width: self.width, stored: self.stored.clone(), bound: self.bound.clone() }
    }
}

impl<T> fmt::Debug for IndexReference<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.bound.get()
        {
            Some(id) => write!(f, "@{:?}", id),
            None => write!(f, "#{}", self.stored.get()),
        }
    }
}

impl<T> IndexReference<T>
{
    pub fn new(width: RefWidth) -> Self
    {
        IndexReference { width, stored: Cell::new(NO_INDEX), bound: Cell::new(None) }
    }

    pub fn to(width: RefWidth, id: ItemId<T>) -> Self
    {
        let r = Self::new(width);
        r.bound.set(Some(id));
        r
    }

    /// A reference holding `raw` unbound, as if read from bytes.
    pub fn from_raw(width: RefWidth, raw: u32) -> Self
    {
        let r = Self::new(width);
        r.stored.set(raw);
        r
    }

    pub fn read(width: RefWidth, reader: &mut BlockReader<'_>) -> BlockResult<Self>
    {
        Ok(Self::from_raw(width, width.read(reader)?))
    }

    pub fn width(&self) -> RefWidth
    {
        self.width
    }

    /// The value last read or written, not necessarily the current index.
    pub fn stored(&self) -> u32
    {
        self.stored.get()
    }

    pub fn is_set(&self) -> bool
    {
        self.bound.get().is_some() || self.stored.get() != NO_INDEX
    }

    /// The handle this reference is bound to, if it has been bound yet.
    pub fn bound(&self) -> Option<ItemId<T>>
    {
        self.bound.get()
    }

    /// Resolves to the referenced item's handle, binding a raw value on first use.
    pub fn get(&self, pool: &Pool<T>) -> BlockResult<Option<ItemId<T>>>
    {
        if let Some(id) = self.bound.get()
        {
            if !pool.contains(id)
            {
                return Err(BlockError::resolution(format!("reference to {:?} names a removed item", id)));
            }
            return Ok(Some(id));
        }
        let raw = self.stored.get();
        if raw == NO_INDEX
        {
            return Ok(None);
        }
        let id = pool.bind_index(raw)?;
        self.bound.set(Some(id));
        Ok(Some(id))
    }

    /// Like [`IndexReference::get`] but an unset reference is an error.
    pub fn require(&self, pool: &Pool<T>) -> BlockResult<ItemId<T>>
    {
        match self.get(pool)?
        {
            Some(id) => Ok(id),
            None => Err(BlockError::resolution("reference is not set")),
        }
    }

    pub fn item<'p>(&self, pool: &'p Pool<T>) -> BlockResult<Option<&'p T>>
    {
        match self.get(pool)?
        {
            Some(id) => pool.item(id).map(Some),
            None => Ok(None),
        }
    }

    pub fn require_item<'p>(&self, pool: &'p Pool<T>) -> BlockResult<&'p T>
    {
        pool.item(self.require(pool)?)
    }

    pub fn set(&mut self, id: Option<ItemId<T>>)
    {
        self.bound.set(id);
        if id.is_none()
        {
            self.stored.set(NO_INDEX);
        }
    }

    /// Current index of the referenced item without rewriting anything.
    pub fn index(&self, pool: &Pool<T>) -> BlockResult<Option<usize>>
    {
        match self.get(pool)?
        {
            Some(id) => match pool.index_of(id)
            {
                Some(index) => Ok(Some(index)),
                None => Err(BlockError::resolution(format!("reference to {:?} names a removed item", id))),
            },
            None => Ok(None),
        }
    }

    /// Rewrites the stored value from the current index; returns whether the encoded length changed.
    pub fn refresh(&self, pool: &Pool<T>) -> BlockResult<bool>
    {
        let before = self.byte_len();
        let value = match self.index(pool)?
        {
            Some(index) => index as u32,
            None => NO_INDEX,
        };
        if self.width == RefWidth::Short && value != NO_INDEX && value > 0xffff
        {
            return Err(BlockError::usage(format!("index {} does not fit a 16-bit reference", value)));
        }
        self.stored.set(value);
        Ok(before != self.byte_len())
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        self.width.write(writer, self.stored.get())
    }

    pub fn byte_len(&self) -> usize
    {
        self.width.len(self.stored.get())
    }
}

/// Reference by byte offset; a stored 0 means "none".
pub struct OffsetReference<T>
{
    width: RefWidth,
    stored: Cell<u32>,
    bound: Cell<Option<ItemId<T>>>,
}

impl<T> Clone for OffsetReference<T>
{
    fn clone(&self) -> Self
    {
        OffsetReference { width: self.width, stored: self.stored.clone(), bound: self.bound.clone() }
    }
}

impl<T> fmt::Debug for OffsetReference<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.bound.get()
        {
            Some(id) => write!(f, "@{:?}", id),
            None => write!(f, "0x{:x}", self.stored.get()),
        }
    }
}

impl<T> Default for OffsetReference<T>
{
    fn default() -> Self
    {
        Self::new(RefWidth::Int)
    }
}

impl<T> OffsetReference<T>
{
    pub fn new(width: RefWidth) -> Self
    {
        OffsetReference { width, stored: Cell::new(0), bound: Cell::new(None) }
    }

    pub fn to(width: RefWidth, id: ItemId<T>) -> Self
    {
        let r = Self::new(width);
        r.bound.set(Some(id));
        r
    }

    pub fn read(width: RefWidth, reader: &mut BlockReader<'_>) -> BlockResult<Self>
    {
        let r = Self::new(width);
        r.stored.set(width.read(reader)?);
        Ok(r)
    }

    pub fn stored(&self) -> u32
    {
        self.stored.get()
    }

    pub fn is_set(&self) -> bool
    {
        self.bound.get().is_some() || self.stored.get() != 0
    }

    pub fn get(&self, pool: &Pool<T>) -> BlockResult<Option<ItemId<T>>>
    {
        if let Some(id) = self.bound.get()
        {
            if !pool.contains(id)
            {
                return Err(BlockError::resolution(format!("offset reference to {:?} names a removed item", id)));
            }
            return Ok(Some(id));
        }
        let raw = self.stored.get();
        if raw == 0
        {
            return Ok(None);
        }
        let id = pool.bind_offset(raw)?;
        self.bound.set(Some(id));
        Ok(Some(id))
    }

    pub fn item<'p>(&self, pool: &'p Pool<T>) -> BlockResult<Option<&'p T>>
    {
        match self.get(pool)?
        {
            Some(id) => pool.item(id).map(Some),
            None => Ok(None),
        }
    }

    pub fn set(&mut self, id: Option<ItemId<T>>)
    {
        self.bound.set(id);
        if id.is_none()
        {
            self.stored.set(0);
        }
    }

    pub fn refresh(&self, pool: &Pool<T>) -> BlockResult<bool>
    {
        let before = self.byte_len();
        let value = match self.get(pool)?
        {
            Some(id) => match pool.offset_of(id)
            {
                Some(offset) => offset,
                None => return Err(BlockError::resolution(format!("offset reference to {:?} names a removed item", id))),
            },
            None => 0,
        };
        self.stored.set(value);
        Ok(before != self.byte_len())
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        self.width.write(writer, self.stored.get())
    }

    pub fn byte_len(&self) -> usize
    {
        self.width.len(self.stored.get())
    }
}

/// An integer inside a record that can be read and rewritten in place.
pub trait IntegerReference
{
    fn get(&self) -> i32;
    fn set(&mut self, value: i32);
}

/// Receives every integer-bearing field of a record stream.
pub trait IntegerVisitor
{
    fn visit(&mut self, reference: &mut dyn IntegerReference);
}

impl<F: FnMut(&mut dyn IntegerReference)> IntegerVisitor for F
{
    fn visit(&mut self, reference: &mut dyn IntegerReference)
    {
        self(reference)
    }
}

/// Records that expose their integer fields to an [`IntegerVisitor`].
pub trait VisitableInteger
{
    fn visit_integers(&mut self, visitor: &mut dyn IntegerVisitor);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_survives_reorder() {
        let mut pool = Pool::new();
        pool.push("A");
        let b = pool.push("B");
        pool.push("C");
        pool.commit_order();

        let reference = IndexReference::from_raw(RefWidth::Int, 1);
        assert_eq!(reference.get(&pool).unwrap(), Some(b));

        pool.move_item(2, 0).unwrap();
        assert_eq!(reference.item(&pool).unwrap(), Some(&"B"));
        assert!(!reference.refresh(&pool).unwrap());
        assert_eq!(reference.stored(), 2);
        pool.commit_order();
        assert_eq!(*pool.get(reference.stored() as usize).unwrap(), "B");
    }

    #[test]
    fn unbound_reference_binds_against_written_order() {
        let mut pool = Pool::new();
        pool.push("A");
        pool.push("B");
        pool.commit_order();
        let reference = IndexReference::from_raw(RefWidth::Short, 0);
        pool.move_item(1, 0).unwrap();
        assert_eq!(reference.item(&pool).unwrap(), Some(&"A"));
    }

    #[test]
    fn out_of_range_is_a_resolution_error() {
        let mut pool = Pool::new();
        pool.push("A");
        pool.commit_order();
        let reference = IndexReference::from_raw(RefWidth::Int, 7);
        assert!(reference.get(&pool).unwrap_err().is_resolution());
    }

    #[test]
    fn removed_target_fails_refresh() {
        let mut pool = Pool::new();
        pool.push("A");
        let b = pool.push("B");
        let reference = IndexReference::to(RefWidth::Int, b);
        pool.remove(1).unwrap();
        assert!(reference.refresh(&pool).unwrap_err().is_resolution());
    }

    #[test]
    fn uleb_width_tracks_index() {
        let mut pool = Pool::new();
        for i in 0..200 {
            pool.push(i);
        }
        let last = pool.id_at(199).unwrap();
        let reference = IndexReference::to(RefWidth::Uleb, last);
        assert!(reference.refresh(&pool).unwrap());
        assert_eq!(reference.byte_len(), 2);
        pool.move_item(199, 0).unwrap();
        assert!(reference.refresh(&pool).unwrap());
        assert_eq!(reference.byte_len(), 1);
        assert!(!reference.refresh(&pool).unwrap());
    }

    #[test]
    fn no_index_round_trips() {
        let pool: Pool<&str> = Pool::new();
        let mut writer = BlockWriter::new();
        let reference: IndexReference<&str> = IndexReference::new(RefWidth::UlebP1);
        reference.refresh(&pool).unwrap();
        reference.write(&mut writer);
        assert_eq!(writer.as_slice(), &[0]);
        let mut reader = BlockReader::new(writer.as_slice());
        let back: IndexReference<&str> = IndexReference::read(RefWidth::UlebP1, &mut reader).unwrap();
        assert_eq!(back.get(&pool).unwrap(), None);
    }

    #[test]
    fn offset_reference_follows_item() {
        let mut pool = Pool::new();
        let a = pool.push("A");
        pool.set_offset(a, 0x100);
        pool.commit_order();
        let reference = OffsetReference::from_stored_for_test(0x100);
        assert_eq!(reference.get(&pool).unwrap(), Some(a));
        pool.set_offset(a, 0x180);
        reference.refresh(&pool).unwrap();
        assert_eq!(reference.stored(), 0x180);
    }

    impl<T> OffsetReference<T> {
        fn from_stored_for_test(raw: u32) -> Self {
            let r = Self::new(RefWidth::Int);
            r.stored.set(raw);
            r
        }
    }

    struct Literal(i32);

    impl IntegerReference for Literal {
        fn get(&self) -> i32 {
            self.0
        }
        fn set(&mut self, value: i32) {
            self.0 = value;
        }
    }

    impl VisitableInteger for Vec<Literal> {
        fn visit_integers(&mut self, visitor: &mut dyn IntegerVisitor) {
            for l in self.iter_mut() {
                visitor.visit(l);
            }
        }
    }

    #[test]
    fn visitor_rewrites_integers() {
        let mut stream = vec![Literal(1), Literal(0x7f010000), Literal(3)];
        let mut remap = |r: &mut dyn IntegerReference| {
            if r.get() == 0x7f010000 {
                r.set(0x7f020000);
            }
        };
        stream.visit_integers(&mut remap);
        assert_eq!(stream[1].0, 0x7f020000);
    }
}
