//! `ResTable_entry` in its simple, complex (bag) and compact forms.

use bitflags::bitflags;

use crate::arsc::string_pool::ResString;
use crate::arsc::value::ResValue;
use crate::block::error::BlockResult;
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::pool::{ItemId, Pool};
use crate::block::reference::{IndexReference, RefWidth};
use crate::block::Block;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u16 {
        const COMPLEX = 0x0001;
        const PUBLIC = 0x0002;
        const WEAK = 0x0004;
        const COMPACT = 0x0008;
    }
}

const SIMPLE_HEADER_SIZE: u16 = 8;
const COMPLEX_HEADER_SIZE: u16 = 16;

/// One `name -> value` pair of a bag.
#[derive(Debug, Clone, PartialEq)]
pub struct ResTableMap {
    /// Attribute resource id (or a bag key such as `^type`).
    pub name: u32,
    pub value: ResValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryBody {
    Simple(ResValue),
    Complex { parent: u32, maps: Vec<ResTableMap> },
    /// Eight bytes: key index, flags with the data type in the high byte, data.
    Compact(ResValue),
}

#[derive(Debug, Clone)]
pub struct ResEntry {
    header_size: u16,
    flags: EntryFlags,
    key: IndexReference<ResString>,
    body: EntryBody,
}

impl ResEntry {
    pub fn simple(key: ItemId<ResString>, value: ResValue) -> Self {
        ResEntry {
            header_size: SIMPLE_HEADER_SIZE,
            flags: EntryFlags::empty(),
            key: IndexReference::to(RefWidth::Int, key),
            body: EntryBody::Simple(value),
        }
    }

    pub fn complex(key: ItemId<ResString>, parent: u32, maps: Vec<ResTableMap>) -> Self {
        ResEntry {
            header_size: COMPLEX_HEADER_SIZE,
            flags: EntryFlags::COMPLEX,
            key: IndexReference::to(RefWidth::Int, key),
            body: EntryBody::Complex { parent, maps },
        }
    }

    pub fn read_from(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let size = reader.read_u16()?;
        let raw_flags = reader.read_u16()?;
        let flags = EntryFlags::from_bits_retain(raw_flags & 0x00ff);
        if flags.contains(EntryFlags::COMPACT) {
            let data = reader.read_u32()?;
            let value = ResValue::new((raw_flags >> 8) as u8, data);
            return Ok(ResEntry {
                header_size: SIMPLE_HEADER_SIZE,
                flags,
                key: IndexReference::from_raw(RefWidth::Short, size as u32),
                body: EntryBody::Compact(value),
            });
        }
        let start = reader.position() - 4;
        let key = IndexReference::read(RefWidth::Int, reader)?;
        let body = if flags.contains(EntryFlags::COMPLEX) {
            let parent = reader.read_u32()?;
            let count = reader.read_u32()?;
            reader.seek(start + size as usize)?;
            let mut maps = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name = reader.read_u32()?;
                let value = ResValue::read_from(reader)?;
                maps.push(ResTableMap { name, value });
            }
            EntryBody::Complex { parent, maps }
        } else {
            reader.seek(start + size as usize)?;
            EntryBody::Simple(ResValue::read_from(reader)?)
        };
        Ok(ResEntry { header_size: size, flags, key, body })
    }

    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    pub fn set_public(&mut self, public: bool) {
        self.flags.set(EntryFlags::PUBLIC, public);
    }

    pub fn key(&self) -> &IndexReference<ResString> {
        &self.key
    }

    pub fn set_key(&mut self, key: ItemId<ResString>) {
        self.key.set(Some(key));
    }

    pub fn key_name<'p>(&self, keys: &'p Pool<ResString>) -> BlockResult<&'p str> {
        Ok(self.key.require_item(keys)?.text())
    }

    pub fn body(&self) -> &EntryBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut EntryBody {
        &mut self.body
    }

    /// The value of a simple or compact entry.
    pub fn value(&self) -> Option<&ResValue> {
        match &self.body {
            EntryBody::Simple(value) | EntryBody::Compact(value) => Some(value),
            EntryBody::Complex { .. } => None,
        }
    }

    pub fn set_value(&mut self, value: ResValue) {
        match &mut self.body {
            EntryBody::Simple(v) | EntryBody::Compact(v) => *v = value,
            EntryBody::Complex { .. } => {
                self.header_size = SIMPLE_HEADER_SIZE;
                self.flags.remove(EntryFlags::COMPLEX);
                self.body = EntryBody::Simple(value);
            }
        }
    }

    /// Rewrites the key index and string value indices from current pool order.
    pub fn refresh_references(&self, keys: &Pool<ResString>, strings: &Pool<ResString>) -> BlockResult<()> {
        self.key.refresh(keys)?;
        match &self.body {
            EntryBody::Simple(value) | EntryBody::Compact(value) => value.refresh_references(strings),
            EntryBody::Complex { maps, .. } => {
                for map in maps {
                    map.value.refresh_references(strings)?;
                }
                Ok(())
            }
        }
    }
}

impl Block for ResEntry {
    fn read(&mut self, reader: &mut BlockReader<'_>) -> BlockResult<()> {
        *self = ResEntry::read_from(reader)?;
        Ok(())
    }

    fn byte_len(&self) -> usize {
        match &self.body {
            EntryBody::Simple(_) => self.header_size as usize + 8,
            EntryBody::Complex { maps, .. } => self.header_size as usize + maps.len() * 12,
            EntryBody::Compact(_) => 8,
        }
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        match &self.body {
            EntryBody::Compact(value) => {
                writer.write_u16(self.key.stored() as u16);
                writer.write_u16(self.flags.bits() | ((value.data_type() as u16) << 8));
                writer.write_u32(value.data());
            }
            EntryBody::Simple(value) => {
                writer.write_u16(self.header_size);
                writer.write_u16(self.flags.bits());
                self.key.write(writer);
                writer.fill(self.header_size as usize - SIMPLE_HEADER_SIZE as usize, 0);
                value.write(writer)?;
            }
            EntryBody::Complex { parent, maps } => {
                writer.write_u16(self.header_size);
                writer.write_u16(self.flags.bits());
                self.key.write(writer);
                writer.write_u32(*parent);
                writer.write_u32(maps.len() as u32);
                writer.fill(self.header_size as usize - COMPLEX_HEADER_SIZE as usize, 0);
                for map in maps {
                    writer.write_u32(map.name);
                    map.value.write(writer)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> (Pool<ResString>, ItemId<ResString>) {
        let mut keys = Pool::new();
        keys.push(ResString::new("app_name"));
        let id = keys.push(ResString::new("theme"));
        keys.commit_order();
        (keys, id)
    }

    fn round_trip(entry: &ResEntry) -> ResEntry {
        let mut writer = BlockWriter::new();
        entry.write(&mut writer).unwrap();
        assert_eq!(writer.position(), entry.byte_len());
        let bytes = writer.into_bytes();
        let mut reader = BlockReader::new(&bytes);
        let back = ResEntry::read_from(&mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);
        back
    }

    #[test]
    fn simple_entry_round_trips() {
        let (keys, theme) = keys();
        let entry = ResEntry::simple(theme, ResValue::int(7));
        entry.refresh_references(&keys, &Pool::new()).unwrap();
        let back = round_trip(&entry);
        assert_eq!(back.key_name(&keys).unwrap(), "theme");
        assert_eq!(back.value(), Some(&ResValue::int(7)));
        assert_eq!(back.byte_len(), 16);
    }

    #[test]
    fn bag_entry_round_trips() {
        let (keys, theme) = keys();
        let maps = vec![
            ResTableMap { name: 0x0101_0000, value: ResValue::boolean(true) },
            ResTableMap { name: 0x0101_0001, value: ResValue::reference(0x7f02_0000) },
        ];
        let entry = ResEntry::complex(theme, 0x0103_0005, maps.clone());
        entry.refresh_references(&keys, &Pool::new()).unwrap();
        let back = round_trip(&entry);
        assert_eq!(back.byte_len(), 16 + 24);
        assert_eq!(back.body(), &EntryBody::Complex { parent: 0x0103_0005, maps });
    }

    #[test]
    fn compact_entry_round_trips() {
        let bytes = [0x01, 0x00, 0x08, 0x10, 0x2a, 0x00, 0x00, 0x00];
        let mut reader = BlockReader::new(&bytes);
        let entry = ResEntry::read_from(&mut reader).unwrap();
        let (keys, _) = keys();
        assert_eq!(entry.key_name(&keys).unwrap(), "theme");
        assert_eq!(entry.value(), Some(&ResValue::int(42)));
        let mut writer = BlockWriter::new();
        entry.write(&mut writer).unwrap();
        assert_eq!(writer.into_bytes(), bytes.to_vec());
    }
}
