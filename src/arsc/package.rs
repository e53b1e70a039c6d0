//! Package chunks and the type-spec, type and library chunks they contain.

use std::collections::BTreeMap;

use bitflags::bitflags;
use log::{debug, warn};

use crate::arsc::chunk::{
    read_chunk, read_header_extra, ChunkHeader, RawChunk, RES_TABLE_LIBRARY_TYPE, RES_TABLE_PACKAGE_TYPE,
    RES_TABLE_TYPE_SPEC_TYPE, RES_TABLE_TYPE_TYPE,
};
use crate::arsc::config::ResConfig;
use crate::arsc::entry::ResEntry;
use crate::arsc::string_pool::{ResString, StringPoolChunk};
use crate::arsc::type_pool::TypeStringPool;
use crate::arsc::value::ResValue;
use crate::block::error::{BlockError, BlockResult};
use crate::block::io::{padding, BlockReader, BlockWriter};
use crate::block::pool::Pool;
use crate::block::{Block, BlockList};

const NO_ENTRY: u32 = 0xFFFF_FFFF;
const NO_ENTRY_16: u16 = 0xFFFF;
const PACKAGE_NAME_BYTES: usize = 256;
const PACKAGE_HEADER_SIZE: u16 = 288;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u8 {
        const SPARSE = 0x01;
        const OFFSET16 = 0x02;
    }
}

/// `ResTable_typeSpec`: one configuration-change mask per entry of a type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSpecBlock {
    id: u8,
    res0: u8,
    types_count: u16,
    header_extra: Vec<u8>,
    pub spec_flags: Vec<u32>,
}

impl TypeSpecBlock {
    const HEADER_SIZE: u16 = 16;

    pub fn new(id: u8) -> Self {
        TypeSpecBlock { id, res0: 0, types_count: 0, header_extra: Vec::new(), spec_flags: Vec::new() }
    }

    pub fn read_from(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let (header, mut chunk) = read_chunk(reader)?;
        let id = chunk.read_u8()?;
        let res0 = chunk.read_u8()?;
        let types_count = chunk.read_u16()?;
        let entry_count = chunk.read_u32()?;
        let header_extra = read_header_extra(&mut chunk, &header)?;
        let mut spec_flags = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            spec_flags.push(chunk.read_u32()?);
        }
        Ok(TypeSpecBlock { id, res0, types_count, header_extra, spec_flags })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn entry_count(&self) -> usize {
        self.spec_flags.len()
    }

    fn header_size(&self) -> usize {
        Self::HEADER_SIZE as usize + self.header_extra.len()
    }

    pub fn byte_len(&self) -> usize {
        self.header_size() + self.spec_flags.len() * 4
    }

    pub fn write(&self, writer: &mut BlockWriter) {
        let header = ChunkHeader {
            chunk_type: RES_TABLE_TYPE_SPEC_TYPE,
            header_size: self.header_size() as u16,
            chunk_size: self.byte_len() as u32,
        };
        header.write(writer);
        writer.write_u8(self.id);
        writer.write_u8(self.res0);
        writer.write_u16(self.types_count);
        writer.write_u32(self.spec_flags.len() as u32);
        writer.write_bytes(&self.header_extra);
        for flags in &self.spec_flags {
            writer.write_u32(*flags);
        }
    }
}

/// `ResTable_type`: the entries of one type under one configuration.
///
/// `slots` maps entry ids to positions in `entries`; several slots may share
/// one entry, which is then written once.
#[derive(Debug, Clone)]
pub struct TypeBlock {
    id: u8,
    flags: TypeFlags,
    reserved: u16,
    config: ResConfig,
    header_extra: Vec<u8>,
    slots: Vec<Option<usize>>,
    entries: BlockList<ResEntry>,
}

impl TypeBlock {
    const FIXED_HEADER_SIZE: usize = 20;

    pub fn new(id: u8, config: ResConfig) -> Self {
        TypeBlock {
            id,
            flags: TypeFlags::empty(),
            reserved: 0,
            config,
            header_extra: Vec::new(),
            slots: Vec::new(),
            entries: BlockList::new(),
        }
    }

    pub fn read_from(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let (header, mut chunk) = read_chunk(reader)?;
        let id = chunk.read_u8()?;
        let flags = TypeFlags::from_bits_retain(chunk.read_u8()?);
        let reserved = chunk.read_u16()?;
        let entry_count = chunk.read_u32()? as usize;
        let entries_start = chunk.read_u32()? as usize;
        let config = ResConfig::read_from(&mut chunk)?;
        let header_extra = read_header_extra(&mut chunk, &header)?;

        let mut offsets: Vec<(usize, Option<u32>)> = Vec::with_capacity(entry_count);
        if flags.contains(TypeFlags::SPARSE) {
            for _ in 0..entry_count {
                let index = chunk.read_u16()? as usize;
                let offset = chunk.read_u16()? as u32 * 4;
                offsets.push((index, Some(offset)));
            }
        } else if flags.contains(TypeFlags::OFFSET16) {
            for index in 0..entry_count {
                let raw = chunk.read_u16()?;
                offsets.push((index, (raw != NO_ENTRY_16).then(|| raw as u32 * 4)));
            }
        } else {
            for index in 0..entry_count {
                let raw = chunk.read_u32()?;
                offsets.push((index, (raw != NO_ENTRY).then_some(raw)));
            }
        }

        let mut unique: Vec<u32> = offsets.iter().filter_map(|(_, o)| *o).collect();
        unique.sort_unstable();
        unique.dedup();
        let mut positions = BTreeMap::new();
        let mut entries = Vec::with_capacity(unique.len());
        for offset in unique {
            chunk.seek(entries_start + offset as usize)?;
            let entry = ResEntry::read_from(&mut chunk).map_err(|e| err!(e, "entry at 0x{:x}", offset))?;
            positions.insert(offset, entries.len());
            entries.push(entry);
        }
        let slot_count = offsets.iter().map(|(i, _)| i + 1).max().unwrap_or(0);
        let mut slots = vec![None; slot_count];
        for (index, offset) in offsets {
            slots[index] = offset.and_then(|o| positions.get(&o).copied());
        }
        let entries = BlockList::from_items(entries);
        Ok(TypeBlock { id, flags, reserved, config, header_extra, slots, entries })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn config(&self) -> &ResConfig {
        &self.config
    }

    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    pub fn entry_count(&self) -> usize {
        self.slots.len()
    }

    pub fn entry(&self, entry_id: usize) -> Option<&ResEntry> {
        self.slots.get(entry_id).copied().flatten().and_then(|i| self.entries.get(i))
    }

    pub fn entry_mut(&mut self, entry_id: usize) -> Option<&mut ResEntry> {
        match self.slots.get(entry_id).copied().flatten() {
            Some(i) => self.entries.get_mut(i),
            None => None,
        }
    }

    /// Entry ids that hold an entry, ascending.
    pub fn entry_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| s.map(|_| i))
    }

    pub fn entries(&self) -> &[ResEntry] {
        self.entries.items()
    }

    pub fn set_entry_count(&mut self, count: usize) {
        if count < self.slots.len() {
            self.slots.truncate(count);
            self.compact_entries();
        } else {
            self.slots.resize(count, None);
        }
    }

    /// Stores `entry` under `entry_id`, replacing any entry this id had alone.
    pub fn put_entry(&mut self, entry_id: usize, entry: ResEntry) {
        if entry_id >= self.slots.len() {
            self.slots.resize(entry_id + 1, None);
        }
        let shared = match self.slots[entry_id] {
            Some(i) => self.slots.iter().filter(|s| **s == Some(i)).count() > 1,
            None => true,
        };
        match self.slots[entry_id].filter(|_| !shared) {
            Some(i) => {
                if let Some(existing) = self.entries.get_mut(i) {
                    *existing = entry;
                }
            }
            None => {
                self.slots[entry_id] = Some(self.entries.len());
                self.entries.push(entry);
            }
        }
        self.compact_entries();
    }

    pub fn remove_entry(&mut self, entry_id: usize) {
        if let Some(slot) = self.slots.get_mut(entry_id) {
            *slot = None;
            self.compact_entries();
        }
    }

    fn compact_entries(&mut self) {
        let mut used = vec![false; self.entries.len()];
        for i in self.slots.iter().flatten() {
            used[*i] = true;
        }
        if used.iter().all(|u| *u) {
            return;
        }
        let mut remap = vec![usize::MAX; self.entries.len()];
        let mut kept = Vec::with_capacity(self.entries.len());
        for (i, entry) in std::mem::take(&mut self.entries).into_items().into_iter().enumerate() {
            if used[i] {
                remap[i] = kept.len();
                kept.push(entry);
            }
        }
        self.entries = BlockList::from_items(kept);
        for slot in self.slots.iter_mut().flatten() {
            *slot = remap[*slot];
        }
    }

    fn offsets_len(&self) -> usize {
        if self.flags.contains(TypeFlags::SPARSE) {
            self.slots.iter().flatten().count() * 4
        } else if self.flags.contains(TypeFlags::OFFSET16) {
            self.slots.len() * 2
        } else {
            self.slots.len() * 4
        }
    }

    fn header_size(&self) -> usize {
        Self::FIXED_HEADER_SIZE + self.config.byte_len() + self.header_extra.len()
    }

    fn entries_start(&self) -> usize {
        let end = self.header_size() + self.offsets_len();
        end + padding(end, 4)
    }

    pub fn refresh_references(&self, keys: &Pool<ResString>, strings: &Pool<ResString>) -> BlockResult<()> {
        for (i, entry) in self.entries.iter().enumerate() {
            entry.refresh_references(keys, strings).map_err(|e| err!(e, "entry {} of type 0x{:02x}", i, self.id))?;
        }
        Ok(())
    }

}

impl Block for TypeBlock {
    fn read(&mut self, reader: &mut BlockReader<'_>) -> BlockResult<()> {
        *self = TypeBlock::read_from(reader)?;
        Ok(())
    }

    /// Lays the entries out again, leaving the 16-bit offset forms once an offset outgrows them.
    fn refresh(&mut self) -> bool {
        let before = self.byte_len();
        self.entries.refresh();
        if self.flags.intersects(TypeFlags::OFFSET16 | TypeFlags::SPARSE) {
            let limit = self.entries.len().checked_sub(1).and_then(|last| self.entries.offset_of(last)).unwrap_or(0);
            if limit / 4 >= NO_ENTRY_16 as usize {
                debug!("type 0x{:02x} entries outgrew 16-bit offsets", self.id);
                self.flags.remove(TypeFlags::OFFSET16 | TypeFlags::SPARSE);
            }
        }
        before != self.byte_len()
    }

    fn byte_len(&self) -> usize {
        self.entries_start() + self.entries.byte_len()
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        if !self.entries.is_laid_out() {
            return Err(BlockError::usage(format!("type 0x{:02x} written before refresh", self.id)));
        }
        let start = writer.position();
        let header = ChunkHeader {
            chunk_type: RES_TABLE_TYPE_TYPE,
            header_size: self.header_size() as u16,
            chunk_size: self.byte_len() as u32,
        };
        header.write(writer);
        writer.write_u8(self.id);
        writer.write_u8(self.flags.bits());
        writer.write_u16(self.reserved);
        let declared = if self.flags.contains(TypeFlags::SPARSE) {
            self.slots.iter().flatten().count()
        } else {
            self.slots.len()
        };
        writer.write_u32(declared as u32);
        writer.write_u32(self.entries_start() as u32);
        self.config.write(writer)?;
        writer.write_bytes(&self.header_extra);

        for (index, slot) in self.slots.iter().enumerate() {
            let offset = slot.and_then(|i| self.entries.offset_of(i));
            if self.flags.contains(TypeFlags::SPARSE) {
                if let Some(offset) = offset {
                    writer.write_u16(index as u16);
                    writer.write_u16((offset / 4) as u16);
                }
            } else if self.flags.contains(TypeFlags::OFFSET16) {
                writer.write_u16(offset.map_or(NO_ENTRY_16, |o| (o / 4) as u16));
            } else {
                writer.write_u32(offset.map_or(NO_ENTRY, |o| o as u32));
            }
        }
        writer.align_from(start, 4);
        self.entries.write(writer)
    }
}

/// `ResTable_lib_header`: shared-library package ids this package depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryChunk {
    header_extra: Vec<u8>,
    pub entries: Vec<(u32, String)>,
}

impl LibraryChunk {
    const HEADER_SIZE: u16 = 12;

    pub fn read_from(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let (header, mut chunk) = read_chunk(reader)?;
        let count = chunk.read_u32()?;
        let header_extra = read_header_extra(&mut chunk, &header)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = chunk.read_u32()?;
            let name = read_utf16_fixed(&mut chunk, PACKAGE_NAME_BYTES)?;
            entries.push((id, name));
        }
        Ok(LibraryChunk { header_extra, entries })
    }

    pub fn byte_len(&self) -> usize {
        Self::HEADER_SIZE as usize + self.header_extra.len() + self.entries.len() * (4 + PACKAGE_NAME_BYTES)
    }

    pub fn write(&self, writer: &mut BlockWriter) {
        let header = ChunkHeader {
            chunk_type: RES_TABLE_LIBRARY_TYPE,
            header_size: (Self::HEADER_SIZE as usize + self.header_extra.len()) as u16,
            chunk_size: self.byte_len() as u32,
        };
        header.write(writer);
        writer.write_u32(self.entries.len() as u32);
        writer.write_bytes(&self.header_extra);
        for (id, name) in &self.entries {
            writer.write_u32(*id);
            writer.write_bytes(&encode_utf16_fixed(name, PACKAGE_NAME_BYTES));
        }
    }
}

fn read_utf16_fixed(reader: &mut BlockReader<'_>, length: usize) -> BlockResult<String> {
    let bytes = reader.read_bytes(length)?;
    Ok(decode_utf16_fixed(bytes))
}

fn decode_utf16_fixed(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn encode_utf16_fixed(text: &str, length: usize) -> Vec<u8> {
    let mut bytes: Vec<u8> = text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    bytes.truncate(length - 2);
    bytes.resize(length, 0);
    bytes
}

#[derive(Debug, Clone)]
pub enum PackageChunk {
    TypeSpec(TypeSpecBlock),
    Type(TypeBlock),
    Library(LibraryChunk),
    Raw(RawChunk),
}

impl PackageChunk {
    pub fn read_from(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let next = ChunkHeader::peek(reader)?;
        Ok(match next.chunk_type {
            RES_TABLE_TYPE_SPEC_TYPE => PackageChunk::TypeSpec(TypeSpecBlock::read_from(reader)?),
            RES_TABLE_TYPE_TYPE => PackageChunk::Type(TypeBlock::read_from(reader)?),
            RES_TABLE_LIBRARY_TYPE => PackageChunk::Library(LibraryChunk::read_from(reader)?),
            other => {
                debug!("keeping package chunk 0x{:04x} as raw bytes", other);
                PackageChunk::Raw(RawChunk::read_from(reader)?)
            }
        })
    }
}

impl Block for PackageChunk {
    fn read(&mut self, reader: &mut BlockReader<'_>) -> BlockResult<()> {
        *self = PackageChunk::read_from(reader)?;
        Ok(())
    }

    fn refresh(&mut self) -> bool {
        match self {
            PackageChunk::Type(block) => block.refresh(),
            _ => false,
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            PackageChunk::TypeSpec(spec) => spec.byte_len(),
            PackageChunk::Type(block) => block.byte_len(),
            PackageChunk::Library(library) => library.byte_len(),
            PackageChunk::Raw(raw) => raw.byte_len(),
        }
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        match self {
            PackageChunk::TypeSpec(spec) => spec.write(writer),
            PackageChunk::Type(block) => block.write(writer)?,
            PackageChunk::Library(library) => library.write(writer),
            PackageChunk::Raw(raw) => raw.write(writer)?,
        }
        Ok(())
    }
}

/// Fully qualified name of a resource id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceName {
    pub package: String,
    pub type_name: String,
    pub entry_name: String,
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.package.is_empty() {
            write!(f, "{}/{}", self.type_name, self.entry_name)
        } else {
            write!(f, "{}:{}/{}", self.package, self.type_name, self.entry_name)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackageBlock {
    id: u32,
    name: String,
    name_bytes: Vec<u8>,
    last_public_type: u32,
    last_public_key: u32,
    has_type_id_offset: bool,
    header_extra: Vec<u8>,
    type_pool: TypeStringPool,
    key_pool: StringPoolChunk,
    chunks: BlockList<PackageChunk>,
}

impl PackageBlock {
    pub fn new(id: u8, name: &str) -> Self {
        PackageBlock {
            id: id as u32,
            name: name.to_string(),
            name_bytes: encode_utf16_fixed(name, PACKAGE_NAME_BYTES),
            last_public_type: 0,
            last_public_key: 0,
            has_type_id_offset: true,
            header_extra: Vec::new(),
            type_pool: TypeStringPool::new(0),
            key_pool: StringPoolChunk::new(true),
            chunks: BlockList::new(),
        }
    }

    pub fn read_from(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let (header, mut chunk) = read_chunk(reader)?;
        if header.chunk_type != RES_TABLE_PACKAGE_TYPE {
            fail!("Expected package chunk, found 0x{:04x}", header.chunk_type);
        }
        let id = chunk.read_u32()?;
        let name_bytes = chunk.read_bytes(PACKAGE_NAME_BYTES)?.to_vec();
        let name = decode_utf16_fixed(&name_bytes);
        let type_strings = chunk.read_u32()? as usize;
        let last_public_type = chunk.read_u32()?;
        let key_strings = chunk.read_u32()? as usize;
        let last_public_key = chunk.read_u32()?;
        let has_type_id_offset = header.header_size as usize >= PACKAGE_HEADER_SIZE as usize;
        let type_id_offset = if has_type_id_offset { chunk.read_u32()? } else { 0 };
        let header_extra = read_header_extra(&mut chunk, &header)?;
        let context = |e: BlockError| err!(e, "package 0x{:02x} ({})", id, name);

        chunk.seek(type_strings)?;
        let type_pool = TypeStringPool::read(&mut chunk, type_id_offset).map_err(context)?;
        let mut end = chunk.position();
        chunk.seek(key_strings)?;
        let key_pool = StringPoolChunk::read(&mut chunk).map_err(context)?;
        end = end.max(chunk.position());
        chunk.seek(end)?;

        let mut chunks = Vec::new();
        while chunk.remaining() >= ChunkHeader::SIZE {
            chunks.push(PackageChunk::read_from(&mut chunk).map_err(context)?);
        }
        if chunk.remaining() > 0 {
            warn!("{} trailing bytes in package 0x{:02x}", chunk.remaining(), id);
        }

        Ok(PackageBlock {
            id,
            name,
            name_bytes,
            last_public_type,
            last_public_key,
            has_type_id_offset,
            header_extra,
            type_pool,
            key_pool,
            chunks: BlockList::from_items(chunks),
        })
    }

    pub fn id(&self) -> u8 {
        self.id as u8
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
        self.name_bytes = encode_utf16_fixed(name, PACKAGE_NAME_BYTES);
    }

    pub fn type_pool(&self) -> &TypeStringPool {
        &self.type_pool
    }

    pub fn type_pool_mut(&mut self) -> &mut TypeStringPool {
        &mut self.type_pool
    }

    pub fn key_pool(&self) -> &StringPoolChunk {
        &self.key_pool
    }

    pub fn key_pool_mut(&mut self) -> &mut StringPoolChunk {
        &mut self.key_pool
    }

    pub fn chunks(&self) -> &[PackageChunk] {
        self.chunks.items()
    }

    pub fn type_specs(&self) -> impl Iterator<Item = &TypeSpecBlock> {
        self.chunks.iter().filter_map(|c| match c {
            PackageChunk::TypeSpec(spec) => Some(spec),
            _ => None,
        })
    }

    pub fn type_blocks(&self) -> impl Iterator<Item = &TypeBlock> {
        self.chunks.iter().filter_map(|c| match c {
            PackageChunk::Type(block) => Some(block),
            _ => None,
        })
    }

    pub fn type_spec(&self, type_id: u8) -> Option<&TypeSpecBlock> {
        self.type_specs().find(|s| s.id == type_id)
    }

    pub fn type_block(&self, type_id: u8, config: &ResConfig) -> Option<&TypeBlock> {
        self.type_blocks().find(|b| b.id == type_id && &b.config == config)
    }

    pub fn type_block_mut(&mut self, type_id: u8, config: &ResConfig) -> Option<&mut TypeBlock> {
        self.chunks.iter_mut().find_map(|c| match c {
            PackageChunk::Type(block) if block.id == type_id && &block.config == config => Some(block),
            _ => None,
        })
    }

    pub fn type_name(&self, type_id: u8) -> BlockResult<&str> {
        self.type_pool.get_by_id(type_id as u32)
    }

    /// Makes sure type `type_id` is named `name` and has a type-spec chunk.
    pub fn get_or_create_type(&mut self, type_id: u8, name: &str) -> BlockResult<()> {
        if type_id == 0 {
            return Err(BlockError::usage("type id 0 is reserved"));
        }
        self.type_pool.get_or_create_with_id(type_id as u32, name)?;
        if self.type_spec(type_id).is_none() {
            let position = self
                .chunks
                .iter()
                .position(|c| matches!(c, PackageChunk::TypeSpec(s) if s.id > type_id))
                .unwrap_or(self.chunks.len());
            self.chunks.insert(position, PackageChunk::TypeSpec(TypeSpecBlock::new(type_id)));
        }
        Ok(())
    }

    /// Entry id already used for `key` in type `type_id`, under any configuration.
    fn entry_id_of(&self, type_id: u8, key: &str) -> Option<usize> {
        let keys = self.key_pool.strings();
        self.type_blocks().filter(|b| b.id == type_id).find_map(|block| {
            block
                .entry_ids()
                .find(|i| block.entry(*i).map_or(false, |e| e.key_name(keys).ok() == Some(key)))
        })
    }

    /// Adds or replaces the value of `key` in type `type_id` under `config`; returns the resource id.
    pub fn add_entry(&mut self, type_id: u8, config: &ResConfig, key: &str, value: ResValue) -> BlockResult<u32> {
        if self.type_spec(type_id).is_none() {
            return Err(BlockError::usage(format!(
                "type 0x{:02x} must be created before adding entries",
                type_id
            )));
        }
        let entry_id = match self.entry_id_of(type_id, key) {
            Some(id) => id,
            None => self.type_spec(type_id).map_or(0, |s| s.entry_count()),
        };
        let key_id = self.key_pool.get_or_create(key);
        let count = (entry_id + 1).max(self.type_spec(type_id).map_or(0, |s| s.entry_count()));
        for chunk in self.chunks.iter_mut() {
            match chunk {
                PackageChunk::TypeSpec(spec) if spec.id == type_id && spec.spec_flags.len() < count => {
                    spec.spec_flags.resize(count, 0);
                }
                PackageChunk::Type(block) if block.id == type_id && block.entry_count() < count => {
                    block.set_entry_count(count);
                }
                _ => {}
            }
        }
        if self.type_block(type_id, config).is_none() {
            let mut block = TypeBlock::new(type_id, config.clone());
            block.set_entry_count(count);
            let position = self
                .chunks
                .iter()
                .rposition(|c| match c {
                    PackageChunk::TypeSpec(s) => s.id == type_id,
                    PackageChunk::Type(b) => b.id == type_id,
                    _ => false,
                })
                .map_or(self.chunks.len(), |p| p + 1);
            self.chunks.insert(position, PackageChunk::Type(block));
            if let Some(PackageChunk::TypeSpec(spec)) =
                self.chunks.iter_mut().find(|c| matches!(c, PackageChunk::TypeSpec(s) if s.id == type_id))
            {
                spec.types_count = spec.types_count.saturating_add(1);
            }
        }
        let block = self
            .type_block_mut(type_id, config)
            .ok_or_else(|| BlockError::usage("type block vanished"))?;
        block.put_entry(entry_id, ResEntry::simple(key_id, value));
        Ok(self.resource_id(type_id, entry_id))
    }

    pub fn resource_id(&self, type_id: u8, entry_id: usize) -> u32 {
        (self.id << 24) | ((type_id as u32) << 16) | (entry_id as u32 & 0xffff)
    }

    /// Looks `res_id` up in this package; `None` when no configuration defines it.
    pub fn resource_name(&self, res_id: u32) -> BlockResult<Option<ResourceName>> {
        if res_id >> 24 != self.id {
            return Ok(None);
        }
        let type_id = ((res_id >> 16) & 0xff) as u8;
        let entry_id = (res_id & 0xffff) as usize;
        let entry = self.type_blocks().filter(|b| b.id == type_id).find_map(|b| b.entry(entry_id));
        match entry {
            Some(entry) => Ok(Some(ResourceName {
                package: self.name.clone(),
                type_name: self.type_name(type_id)?.to_string(),
                entry_name: entry.key_name(self.key_pool.strings())?.to_string(),
            })),
            None => Ok(None),
        }
    }

    pub fn find_entry(&self, res_id: u32, config: &ResConfig) -> Option<&ResEntry> {
        let type_id = ((res_id >> 16) & 0xff) as u8;
        self.type_block(type_id, config).and_then(|b| b.entry((res_id & 0xffff) as usize))
    }

    fn header_size(&self) -> usize {
        if self.has_type_id_offset {
            PACKAGE_HEADER_SIZE as usize + self.header_extra.len()
        } else {
            PACKAGE_HEADER_SIZE as usize - 4 + self.header_extra.len()
        }
    }

    /// Rewrites every reference held by this package and recomputes sizes.
    ///
    /// `strings` is the table's global pool that string values index into.
    pub fn refresh(&mut self, strings: &Pool<ResString>) -> BlockResult<()> {
        self.type_pool.refresh()?;
        self.key_pool.refresh()?;
        let keys = self.key_pool.strings();
        for chunk in self.chunks.iter_mut() {
            if let PackageChunk::Type(block) = chunk {
                block.refresh_references(keys, strings)?;
            }
        }
        self.chunks.refresh();
        Ok(())
    }

    pub(crate) fn commit(&mut self) {
        self.type_pool.commit();
        self.key_pool.commit();
    }

    pub fn byte_len(&self) -> usize {
        self.header_size()
            + self.type_pool.byte_len()
            + self.key_pool.byte_len()
            + self.chunks.byte_len()
    }

    pub fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        let header_size = self.header_size();
        let header = ChunkHeader {
            chunk_type: RES_TABLE_PACKAGE_TYPE,
            header_size: header_size as u16,
            chunk_size: self.byte_len() as u32,
        };
        header.write(writer);
        writer.write_u32(self.id);
        writer.write_bytes(&self.name_bytes);
        writer.write_u32(header_size as u32);
        writer.write_u32(self.last_public_type);
        writer.write_u32((header_size + self.type_pool.byte_len()) as u32);
        writer.write_u32(self.last_public_key);
        if self.has_type_id_offset {
            writer.write_u32(self.type_pool.id_offset());
        }
        writer.write_bytes(&self.header_extra);
        self.type_pool.write(writer)?;
        self.key_pool.write(writer)?;
        self.chunks.write(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refreshed(package: &mut PackageBlock, strings: &Pool<ResString>) -> Vec<u8> {
        package.refresh(strings).unwrap();
        package.commit();
        let mut writer = BlockWriter::new();
        package.write(&mut writer).unwrap();
        assert_eq!(writer.position(), package.byte_len());
        writer.into_bytes()
    }

    #[test]
    fn package_round_trips() {
        let strings = Pool::new();
        let mut package = PackageBlock::new(0x7f, "com.example");
        package.get_or_create_type(1, "attr").unwrap();
        package.get_or_create_type(3, "integer").unwrap();
        let config = ResConfig::default();
        let first = package.add_entry(3, &config, "count", ResValue::int(3)).unwrap();
        let second = package.add_entry(3, &config, "limit", ResValue::int(10)).unwrap();
        assert_eq!(first, 0x7f03_0000);
        assert_eq!(second, 0x7f03_0001);
        assert_eq!(package.type_name(2).unwrap(), "type-1");

        let bytes = refreshed(&mut package, &strings);
        let mut reader = BlockReader::new(&bytes);
        let mut back = PackageBlock::read_from(&mut reader).unwrap();
        assert_eq!(back.name(), "com.example");
        let name = back.resource_name(0x7f03_0001).unwrap().unwrap();
        assert_eq!(name.to_string(), "com.example:integer/limit");
        assert_eq!(refreshed(&mut back, &strings), bytes);
    }

    #[test]
    fn same_key_reuses_entry_id_across_configs() {
        let mut package = PackageBlock::new(0x7f, "p");
        package.get_or_create_type(2, "string").unwrap();
        let mut land = ResConfig::default();
        land.set_density(240);
        let a = package.add_entry(2, &ResConfig::default(), "title", ResValue::int(1)).unwrap();
        let b = package.add_entry(2, &land, "title", ResValue::int(2)).unwrap();
        assert_eq!(a, b);
        assert_eq!(package.type_blocks().count(), 2);
        assert_eq!(package.type_spec(2).unwrap().types_count, 2);
        assert_eq!(package.find_entry(b, &land).unwrap().value(), Some(&ResValue::int(2)));
    }

    #[test]
    fn adding_to_missing_type_is_usage_error() {
        let mut package = PackageBlock::new(0x7f, "p");
        let e = package.add_entry(4, &ResConfig::default(), "x", ResValue::int(0)).unwrap_err();
        assert!(e.is_usage());
    }

    #[test]
    fn shared_and_sparse_entries_round_trip() {
        let mut block = TypeBlock::new(1, ResConfig::default());
        let mut keys = Pool::new();
        let key = keys.push(ResString::new("k"));
        block.put_entry(0, ResEntry::simple(key, ResValue::int(5)));
        block.set_entry_count(4);
        block.put_entry(3, ResEntry::simple(key, ResValue::int(6)));
        block.flags = TypeFlags::SPARSE;
        block.refresh_references(&keys, &Pool::new()).unwrap();
        assert!(block.write(&mut BlockWriter::new()).unwrap_err().is_usage());
        block.refresh();
        let mut writer = BlockWriter::new();
        block.write(&mut writer).unwrap();
        assert_eq!(writer.position(), block.byte_len());
        let bytes = writer.into_bytes();
        let mut reader = BlockReader::new(&bytes);
        let back = TypeBlock::read_from(&mut reader).unwrap();
        assert_eq!(back.entry_ids().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(back.entry(3).unwrap().value(), Some(&ResValue::int(6)));
        assert!(back.entry(1).is_none());

        // Two ids pointing at one offset are read as one shared entry.
        let mut shared = back.clone();
        shared.flags = TypeFlags::empty();
        shared.slots[1] = shared.slots[0];
        let mut writer = BlockWriter::new();
        shared.write(&mut writer).unwrap();
        let bytes = writer.into_bytes();
        let mut reader = BlockReader::new(&bytes);
        let back = TypeBlock::read_from(&mut reader).unwrap();
        assert_eq!(back.entries().len(), 2);
        assert_eq!(back.entry(1).unwrap().value(), Some(&ResValue::int(5)));
    }
}
