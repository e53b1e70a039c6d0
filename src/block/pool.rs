//! Ordered, deduplicating collections of interned items.
//!
//! Items live in stable slots and are addressed from the outside by
//! [`ItemId`] handles, so reordering the pool never invalidates a handle.
//! Two orders are tracked: the current one, which edits change, and the one
//! the bytes were last read or written in. Raw integers found in the input
//! are bound against the latter; [`Pool::commit_order`] moves it forward once
//! every referrer has been rewritten.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use once_cell::unsync::OnceCell;

use crate::block::error::{BlockError, BlockResult};

/// Stable handle to a pool item, valid across reordering.
pub struct ItemId<T>
{
    slot: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ItemId<T>
{
    fn new(slot: u32) -> Self
    {
        ItemId { slot, _marker: PhantomData }
    }

    pub fn slot(&self) -> u32
    {
        self.slot
    }
}

impl<T> Clone for ItemId<T>
{
    fn clone(&self) -> Self
    {
        *self
    }
}

impl<T> Copy for ItemId<T> {}

impl<T> PartialEq for ItemId<T>
{
    fn eq(&self, other: &Self) -> bool
    {
        self.slot == other.slot
    }
}

impl<T> Eq for ItemId<T> {}

impl<T> Hash for ItemId<T>
{
    fn hash<H: Hasher>(&self, state: &mut H)
    {
        self.slot.hash(state);
    }
}

impl<T> fmt::Debug for ItemId<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "ItemId({})", self.slot)
    }
}

/// Items that are deduplicated by a textual value.
pub trait Interned
{
    fn intern_key(&self) -> &str;
}

/// How a pool maps its 0-based indices to the ids the format exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Numbering
{
    /// `id == index`.
    Index,
    /// `id == index + 1 + offset`, with 0 meaning "no entry".
    Id { offset: u32 },
}

const REMOVED: u32 = u32::MAX;

pub struct Pool<T>
{
    slots: Vec<Option<T>>,
    order: Vec<u32>,
    positions: Vec<u32>,
    written: Vec<u32>,
    offsets: Vec<u32>,
    written_offsets: HashMap<u32, u32>,
    numbering: Numbering,
    lookup: OnceCell<HashMap<String, u32>>,
}

impl<T> Default for Pool<T>
{
    fn default() -> Self
    {
        Pool::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Pool<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: Clone> Clone for Pool<T>
{
    fn clone(&self) -> Self
    {
        Pool {
            slots: self.slots.clone(),
            order: self.order.clone(),
            positions: self.positions.clone(),
            written: self.written.clone(),
            offsets: self.offsets.clone(),
            written_offsets: self.written_offsets.clone(),
            numbering: self.numbering,
            lookup: OnceCell::new(),
        }
    }
}

impl<T> Pool<T>
{
    pub fn new() -> Self
    {
        Pool {
            slots: Vec::new(),
            order: Vec::new(),
            positions: Vec::new(),
            written: Vec::new(),
            offsets: Vec::new(),
            written_offsets: HashMap::new(),
            numbering: Numbering::Index,
            lookup: OnceCell::new(),
        }
    }

    pub fn with_numbering(numbering: Numbering) -> Self
    {
        let mut pool = Pool::new();
        pool.numbering = numbering;
        pool
    }

    pub fn numbering(&self) -> Numbering
    {
        self.numbering
    }

    pub fn set_numbering(&mut self, numbering: Numbering)
    {
        self.numbering = numbering;
    }

    pub fn len(&self) -> usize
    {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.order.is_empty()
    }

    pub fn to_id(&self, index: usize) -> u32
    {
        match self.numbering
        {
            Numbering::Index => index as u32,
            Numbering::Id { offset } => index as u32 + 1 + offset,
        }
    }

    /// Inverse of [`Pool::to_id`]; `None` for ids below the numbering origin.
    pub fn to_index(&self, id: u32) -> Option<usize>
    {
        match self.numbering
        {
            Numbering::Index => Some(id as usize),
            Numbering::Id { offset } => id.checked_sub(1 + offset).map(|i| i as usize),
        }
    }

    pub fn get(&self, index: usize) -> BlockResult<&T>
    {
        let slot = self.slot_at(index)?;
        self.slot_item(slot)
    }

    pub fn get_mut(&mut self, index: usize) -> BlockResult<&mut T>
    {
        let slot = self.slot_at(index)?;
        self.invalidate_lookup();
        match self.slots.get_mut(slot as usize).and_then(|s| s.as_mut())
        {
            Some(item) => Ok(item),
            None => Err(BlockError::resolution(format!("pool slot {} was removed", slot))),
        }
    }

    pub fn get_by_id(&self, id: u32) -> BlockResult<&T>
    {
        match self.to_index(id)
        {
            Some(index) => self.get(index),
            None => Err(BlockError::resolution(format!("id 0x{:x} is below the pool's numbering origin", id))),
        }
    }

    fn slot_at(&self, index: usize) -> BlockResult<u32>
    {
        match self.order.get(index)
        {
            Some(slot) => Ok(*slot),
            None => Err(BlockError::resolution(format!("index {} out of range for pool of {} items", index, self.order.len()))),
        }
    }

    fn slot_item(&self, slot: u32) -> BlockResult<&T>
    {
        match self.slots.get(slot as usize).and_then(|s| s.as_ref())
        {
            Some(item) => Ok(item),
            None => Err(BlockError::resolution(format!("pool slot {} was removed", slot))),
        }
    }

    pub fn item(&self, id: ItemId<T>) -> BlockResult<&T>
    {
        self.slot_item(id.slot)
    }

    pub fn item_mut(&mut self, id: ItemId<T>) -> BlockResult<&mut T>
    {
        self.invalidate_lookup();
        match self.slots.get_mut(id.slot as usize).and_then(|s| s.as_mut())
        {
            Some(item) => Ok(item),
            None => Err(BlockError::resolution(format!("pool slot {} was removed", id.slot))),
        }
    }

    pub fn contains(&self, id: ItemId<T>) -> bool
    {
        self.positions.get(id.slot as usize).map_or(false, |p| *p != REMOVED)
    }

    pub fn id_at(&self, index: usize) -> Option<ItemId<T>>
    {
        self.order.get(index).map(|slot| ItemId::new(*slot))
    }

    /// Current index of `id`, or `None` if it was removed.
    pub fn index_of(&self, id: ItemId<T>) -> Option<usize>
    {
        match self.positions.get(id.slot as usize)
        {
            Some(p) if *p != REMOVED => Some(*p as usize),
            _ => None,
        }
    }

    pub fn push(&mut self, item: T) -> ItemId<T>
    {
        let index = self.order.len();
        self.insert(index, item)
    }

    pub fn insert(&mut self, index: usize, item: T) -> ItemId<T>
    {
        let slot = self.slots.len() as u32;
        self.slots.push(Some(item));
        self.offsets.push(0);
        self.positions.push(REMOVED);
        let index = index.min(self.order.len());
        self.order.insert(index, slot);
        self.reindex_from(index);
        self.invalidate_lookup();
        ItemId::new(slot)
    }

    pub fn move_item(&mut self, from: usize, to: usize) -> BlockResult<()>
    {
        let slot = self.slot_at(from)?;
        if to >= self.order.len()
        {
            return Err(BlockError::usage(format!("cannot move to index {} of pool with {} items", to, self.order.len())));
        }
        self.order.remove(from);
        self.order.insert(to, slot);
        self.reindex_from(from.min(to));
        Ok(())
    }

    /// Removes the item at `index`, compacting later indices.
    pub fn remove(&mut self, index: usize) -> BlockResult<T>
    {
        let slot = self.slot_at(index)?;
        self.order.remove(index);
        self.positions[slot as usize] = REMOVED;
        self.reindex_from(index);
        self.invalidate_lookup();
        match self.slots[slot as usize].take()
        {
            Some(item) => Ok(item),
            None => Err(BlockError::resolution(format!("pool slot {} was removed", slot))),
        }
    }

    /// Stable sort of the current order; handles are unaffected.
    pub fn sort_by<F>(&mut self, mut compare: F)
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        let slots = &self.slots;
        self.order.sort_by(|a, b| match (&slots[*a as usize], &slots[*b as usize])
        {
            (Some(x), Some(y)) => compare(x, y),
            _ => Ordering::Equal,
        });
        self.reindex_from(0);
    }

    /// Replaces the current order with `ids`, which must be a permutation of it.
    pub fn reorder(&mut self, ids: &[ItemId<T>]) -> BlockResult<()>
    {
        if ids.len() != self.order.len() || ids.iter().any(|id| !self.contains(*id))
        {
            return Err(BlockError::usage("reorder must name every live item exactly once"));
        }
        self.order = ids.iter().map(|id| id.slot).collect();
        self.reindex_from(0);
        Ok(())
    }

    fn reindex_from(&mut self, start: usize)
    {
        for (i, slot) in self.order.iter().enumerate().skip(start)
        {
            self.positions[*slot as usize] = i as u32;
        }
    }

    pub fn find<P>(&self, mut predicate: P) -> Option<ItemId<T>>
    where
        P: FnMut(&T) -> bool,
    {
        self.iter_ids().find(|(_, item)| predicate(item)).map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_
    {
        self.order.iter().filter_map(move |slot| self.slots[*slot as usize].as_ref())
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = (ItemId<T>, &T)> + '_
    {
        self.order.iter().filter_map(move |slot| self.slots[*slot as usize].as_ref().map(|item| (ItemId::new(*slot), item)))
    }

    pub fn ids(&self) -> Vec<ItemId<T>>
    {
        self.order.iter().map(|slot| ItemId::new(*slot)).collect()
    }

    pub fn for_each_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut T),
    {
        self.invalidate_lookup();
        for slot in &self.order
        {
            if let Some(item) = self.slots[*slot as usize].as_mut()
            {
                f(item);
            }
        }
    }

    pub fn set_offset(&mut self, id: ItemId<T>, offset: u32)
    {
        if let Some(o) = self.offsets.get_mut(id.slot as usize)
        {
            *o = offset;
        }
    }

    /// Byte offset assigned by the last layout pass or read.
    pub fn offset_of(&self, id: ItemId<T>) -> Option<u32>
    {
        if self.contains(id) { self.offsets.get(id.slot as usize).copied() } else { None }
    }

    /// Makes the current order and offsets the ones raw stored values refer to.
    pub fn commit_order(&mut self)
    {
        self.written = self.order.clone();
        self.written_offsets.clear();
        for slot in &self.order
        {
            self.written_offsets.insert(self.offsets[*slot as usize], *slot);
        }
    }

    /// Binds a raw index as last written to the item that held it.
    pub fn bind_index(&self, raw: u32) -> BlockResult<ItemId<T>>
    {
        match self.written.get(raw as usize)
        {
            Some(slot) if self.contains(ItemId::new(*slot)) => Ok(ItemId::new(*slot)),
            Some(_) => Err(BlockError::resolution(format!("index {} names a removed item", raw))),
            None => Err(BlockError::resolution(format!("index {} out of range for pool of {} items", raw, self.written.len()))),
        }
    }

    pub fn bind_offset(&self, raw: u32) -> BlockResult<ItemId<T>>
    {
        match self.written_offsets.get(&raw)
        {
            Some(slot) if self.contains(ItemId::new(*slot)) => Ok(ItemId::new(*slot)),
            Some(_) => Err(BlockError::resolution(format!("offset 0x{:x} names a removed item", raw))),
            None => Err(BlockError::resolution(format!("no item at offset 0x{:x}", raw))),
        }
    }

    fn invalidate_lookup(&mut self)
    {
        self.lookup.take();
    }
}

impl<T: Interned> Pool<T>
{
    fn lookup(&self) -> &HashMap<String, u32>
    {
        self.lookup.get_or_init(|| {
            let mut map = HashMap::with_capacity(self.order.len());
            for slot in &self.order
            {
                if let Some(item) = &self.slots[*slot as usize]
                {
                    map.entry(item.intern_key().to_string()).or_insert(*slot);
                }
            }
            map
        })
    }

    pub fn find_key(&self, key: &str) -> Option<ItemId<T>>
    {
        self.lookup().get(key).map(|slot| ItemId::new(*slot))
    }

    /// Returns the existing item equal to `key`, or appends `create()`.
    pub fn get_or_create_with<F>(&mut self, key: &str, create: F) -> ItemId<T>
    where
        F: FnOnce() -> T,
    {
        if let Some(id) = self.find_key(key)
        {
            return id;
        }
        self.push(create())
    }

    /// `to_id(index_of(key))`, or 0 when absent. Only meaningful for id-numbered pools.
    pub fn id_of(&self, key: &str) -> u32
    {
        self.find_key(key).and_then(|id| self.index_of(id)).map_or(0, |index| self.to_id(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Name(String);

    impl Interned for Name {
        fn intern_key(&self) -> &str {
            &self.0
        }
    }

    fn name(s: &str) -> Name {
        Name(s.to_string())
    }

    #[test]
    fn get_or_create_deduplicates() {
        let mut pool = Pool::new();
        let a = pool.get_or_create_with("x", || name("x"));
        let b = pool.get_or_create_with("x", || name("x"));
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
        pool.get_or_create_with("y", || name("y"));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn lookup_is_rebuilt_after_edits() {
        let mut pool = Pool::new();
        pool.push(name("a"));
        assert!(pool.find_key("a").is_some());
        pool.get_mut(0).unwrap().0 = "b".to_string();
        assert!(pool.find_key("a").is_none());
        assert!(pool.find_key("b").is_some());
    }

    #[test]
    fn id_and_index_are_inverse() {
        for numbering in [Numbering::Index, Numbering::Id { offset: 0 }, Numbering::Id { offset: 3 }] {
            let pool: Pool<Name> = Pool::with_numbering(numbering);
            for index in 0..20usize {
                assert_eq!(pool.to_index(pool.to_id(index)), Some(index));
            }
            let first = pool.to_id(0);
            for id in first..first + 20 {
                assert_eq!(pool.to_id(pool.to_index(id).unwrap()), id);
            }
        }
        let pool: Pool<Name> = Pool::with_numbering(Numbering::Id { offset: 0 });
        assert_eq!(pool.to_id(0), 1);
        assert_eq!(pool.to_index(0), None);
    }

    #[test]
    fn id_of_uses_sentinel() {
        let mut pool = Pool::with_numbering(Numbering::Id { offset: 0 });
        pool.push(name("attr"));
        pool.push(name("string"));
        assert_eq!(pool.id_of("string"), 2);
        assert_eq!(pool.id_of("missing"), 0);
        assert_eq!(pool.get_by_id(2).unwrap(), &name("string"));
    }

    #[test]
    fn handles_survive_reordering() {
        let mut pool = Pool::new();
        let a = pool.push(name("a"));
        let b = pool.push(name("b"));
        let c = pool.push(name("c"));
        pool.move_item(2, 0).unwrap();
        assert_eq!(pool.index_of(c), Some(0));
        assert_eq!(pool.index_of(a), Some(1));
        assert_eq!(pool.index_of(b), Some(2));
        pool.sort_by(|x, y| y.0.cmp(&x.0));
        assert_eq!(pool.index_of(c), Some(0));
        assert_eq!(pool.index_of(b), Some(1));
        assert_eq!(pool.item(a).unwrap(), &name("a"));
    }

    #[test]
    fn remove_compacts_and_invalidates() {
        let mut pool = Pool::new();
        pool.push(name("a"));
        let b = pool.push(name("b"));
        let c = pool.push(name("c"));
        pool.commit_order();
        pool.remove(1).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.index_of(c), Some(1));
        assert!(pool.item(b).is_err());
        assert!(pool.bind_index(1).unwrap_err().is_resolution());
        assert_eq!(pool.bind_index(2).unwrap(), c);
        assert!(pool.get(5).is_err());
    }

    #[test]
    fn binding_uses_last_written_order() {
        let mut pool = Pool::new();
        let a = pool.push(name("a"));
        let b = pool.push(name("b"));
        pool.commit_order();
        pool.move_item(1, 0).unwrap();
        assert_eq!(pool.bind_index(0).unwrap(), a);
        pool.commit_order();
        assert_eq!(pool.bind_index(0).unwrap(), b);
    }

    #[test]
    fn offsets_bind_to_items() {
        let mut pool = Pool::new();
        let a = pool.push(name("a"));
        let b = pool.push(name("b"));
        pool.set_offset(a, 0x70);
        pool.set_offset(b, 0x90);
        pool.commit_order();
        assert_eq!(pool.bind_offset(0x90).unwrap(), b);
        assert!(pool.bind_offset(0x80).is_err());
    }
}
