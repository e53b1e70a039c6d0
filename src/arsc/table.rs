//! The `resources.arsc` root chunk.

use std::path::Path;

use log::{debug, warn};

use crate::arsc::chunk::{read_chunk, read_header_extra, ChunkHeader, RawChunk, RES_STRING_POOL_TYPE, RES_TABLE_PACKAGE_TYPE, RES_TABLE_TYPE};
use crate::arsc::package::{PackageBlock, ResourceName};
use crate::arsc::string_pool::StringPoolChunk;
use crate::block::error::{BlockError, BlockResult};
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::{Block, BlockList};

/// Which package unqualified references resolve against.
///
/// An empty context picks the first package of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PackageContext {
    pub package_id: Option<u8>,
    pub name: Option<String>,
}

impl PackageContext {
    pub fn by_id(package_id: u8) -> Self {
        PackageContext { package_id: Some(package_id), name: None }
    }

    pub fn by_name(name: &str) -> Self {
        PackageContext { package_id: None, name: Some(name.to_string()) }
    }

    fn matches(&self, package: &PackageBlock) -> bool {
        self.package_id.map_or(true, |id| id == package.id())
            && self.name.as_deref().map_or(true, |name| name == package.name())
    }
}

#[derive(Debug, Clone)]
enum TableChunk {
    Package(PackageBlock),
    Raw(RawChunk),
}

impl TableChunk {
    fn read_from(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        Ok(match ChunkHeader::peek(reader)?.chunk_type {
            RES_TABLE_PACKAGE_TYPE => TableChunk::Package(PackageBlock::read_from(reader)?),
            other => {
                debug!("keeping table chunk 0x{:04x} as raw bytes", other);
                TableChunk::Raw(RawChunk::read_from(reader)?)
            }
        })
    }
}

impl Block for TableChunk {
    fn read(&mut self, reader: &mut BlockReader<'_>) -> BlockResult<()> {
        *self = TableChunk::read_from(reader)?;
        Ok(())
    }

    fn byte_len(&self) -> usize {
        match self {
            TableChunk::Package(package) => package.byte_len(),
            TableChunk::Raw(raw) => raw.byte_len(),
        }
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        match self {
            TableChunk::Package(package) => package.write(writer),
            TableChunk::Raw(raw) => raw.write(writer),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableBlock {
    header_extra: Vec<u8>,
    strings: StringPoolChunk,
    chunks: BlockList<TableChunk>,
}

impl Default for TableBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBlock {
    const HEADER_SIZE: usize = 12;

    pub fn new() -> Self {
        TableBlock { header_extra: Vec::new(), strings: StringPoolChunk::new(true), chunks: BlockList::new() }
    }

    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let (header, mut chunk) = read_chunk(reader)?;
        if header.chunk_type != RES_TABLE_TYPE {
            fail!("Not a resource table: chunk type 0x{:04x}", header.chunk_type);
        }
        let package_count = chunk.read_u32()?;
        let header_extra = read_header_extra(&mut chunk, &header)?;

        let mut strings = None;
        let mut chunks = Vec::new();
        while chunk.remaining() >= ChunkHeader::SIZE {
            let next = ChunkHeader::peek(&chunk)?;
            match next.chunk_type {
                RES_STRING_POOL_TYPE if strings.is_none() => {
                    strings = Some(StringPoolChunk::read(&mut chunk).map_err(|e| err!(e, "table string pool"))?);
                }
                _ => chunks.push(TableChunk::read_from(&mut chunk)?),
            }
        }
        let strings = match strings {
            Some(strings) => strings,
            None => fail!("Resource table has no string pool"),
        };
        let table = TableBlock { header_extra, strings, chunks: BlockList::from_items(chunks) };
        let found = table.packages().count();
        if found != package_count as usize {
            warn!("table declares {} packages, found {}", package_count, found);
        }
        debug!("read table with {} strings and {} packages", table.strings.len(), found);
        Ok(table)
    }

    pub fn from_bytes(data: &[u8]) -> BlockResult<Self> {
        let mut reader = BlockReader::new(data);
        Self::read(&mut reader)
    }

    pub fn read_file(path: &Path) -> BlockResult<Self> {
        let data = std::fs::read(path).map_err(|e| BlockError::from(e).with_path(path))?;
        Self::from_bytes(&data).map_err(|e| e.with_path(path))
    }

    pub fn strings(&self) -> &StringPoolChunk {
        &self.strings
    }

    pub fn strings_mut(&mut self) -> &mut StringPoolChunk {
        &mut self.strings
    }

    pub fn packages(&self) -> impl Iterator<Item = &PackageBlock> {
        self.chunks.iter().filter_map(|c| match c {
            TableChunk::Package(package) => Some(package),
            TableChunk::Raw(_) => None,
        })
    }

    pub fn packages_mut(&mut self) -> impl Iterator<Item = &mut PackageBlock> {
        self.chunks.iter_mut().filter_map(|c| match c {
            TableChunk::Package(package) => Some(package),
            TableChunk::Raw(_) => None,
        })
    }

    pub fn package(&self, id: u8) -> Option<&PackageBlock> {
        self.packages().find(|p| p.id() == id)
    }

    pub fn package_mut(&mut self, id: u8) -> Option<&mut PackageBlock> {
        self.packages_mut().find(|p| p.id() == id)
    }

    pub fn new_package(&mut self, id: u8, name: &str) -> BlockResult<&mut PackageBlock> {
        if self.package(id).is_some() {
            return Err(BlockError::usage(format!("package 0x{:02x} already exists", id)));
        }
        let index = self.chunks.len();
        self.chunks.push(TableChunk::Package(PackageBlock::new(id, name)));
        match self.chunks.get_mut(index) {
            Some(TableChunk::Package(package)) => Ok(package),
            _ => Err(BlockError::usage("package vanished after insertion")),
        }
    }

    /// The package `context` names; an empty context picks the first package.
    pub fn pick_package(&self, context: &PackageContext) -> Option<&PackageBlock> {
        self.packages().find(|p| context.matches(p))
    }

    /// Name of `res_id`, or `None` when no package defines it.
    pub fn resolve_reference(&self, res_id: u32) -> BlockResult<Option<ResourceName>> {
        let package_id = (res_id >> 24) as u8;
        match self.package(package_id) {
            Some(package) => package.resource_name(res_id),
            None => Ok(None),
        }
    }

    /// Rewrites every stored index from current pool order and recomputes sizes.
    ///
    /// Pools are normalized first, then every referrer rewrites its indices,
    /// and only then is the new order committed as the written order.
    pub fn refresh(&mut self) -> BlockResult<bool> {
        let before = self.byte_len();
        self.strings.refresh()?;
        let strings = self.strings.strings();
        for chunk in self.chunks.iter_mut() {
            if let TableChunk::Package(package) = chunk {
                package.refresh(strings).map_err(|e| err!(e, "package 0x{:02x}", package.id()))?;
            }
        }
        for package in self.packages_mut() {
            package.commit();
        }
        self.chunks.refresh();
        self.strings.commit();
        Ok(before != self.byte_len())
    }

    pub fn byte_len(&self) -> usize {
        Self::HEADER_SIZE
            + self.header_extra.len()
            + self.strings.byte_len()
            + self.chunks.byte_len()
    }

    pub fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        let header = ChunkHeader {
            chunk_type: RES_TABLE_TYPE,
            header_size: (Self::HEADER_SIZE + self.header_extra.len()) as u16,
            chunk_size: self.byte_len() as u32,
        };
        header.write(writer);
        writer.write_u32(self.packages().count() as u32);
        writer.write_bytes(&self.header_extra);
        self.strings.write(writer)?;
        self.chunks.write(writer)
    }

    /// Refreshes and serializes the table.
    pub fn to_bytes(&mut self) -> BlockResult<Vec<u8>> {
        self.refresh()?;
        let mut writer = BlockWriter::with_capacity(self.byte_len());
        self.write(&mut writer)?;
        Ok(writer.into_bytes())
    }

    pub fn write_file(&mut self, path: &Path) -> BlockResult<()> {
        let bytes = self.to_bytes().map_err(|e| e.with_path(path))?;
        std::fs::write(path, bytes).map_err(|e| BlockError::from(e).with_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arsc::config::ResConfig;
    use crate::arsc::value::ResValue;

    fn sample() -> TableBlock {
        let mut table = TableBlock::new();
        let app_name = table.strings_mut().get_or_create("Example");
        let package = table.new_package(0x7f, "com.example").unwrap();
        package.get_or_create_type(1, "string").unwrap();
        package.add_entry(1, &ResConfig::default(), "app_name", ResValue::string(app_name)).unwrap();
        table
    }

    #[test]
    fn table_round_trips() {
        let mut table = sample();
        let bytes = table.to_bytes().unwrap();
        let mut back = TableBlock::from_bytes(&bytes).unwrap();
        assert_eq!(back.to_bytes().unwrap(), bytes);
        let name = back.resolve_reference(0x7f01_0000).unwrap().unwrap();
        assert_eq!(name.to_string(), "com.example:string/app_name");
        assert!(back.resolve_reference(0x0101_0000).unwrap().is_none());
    }

    #[test]
    fn refresh_is_idempotent() {
        let mut table = sample();
        table.refresh().unwrap();
        let first = table.to_bytes().unwrap();
        assert!(!table.refresh().unwrap());
        assert_eq!(table.to_bytes().unwrap(), first);
    }

    #[test]
    fn string_values_follow_pool_reorder() {
        let mut table = sample();
        let bytes = table.to_bytes().unwrap();
        let mut back = TableBlock::from_bytes(&bytes).unwrap();
        back.strings_mut().strings_mut().insert(0, crate::arsc::string_pool::ResString::new("first"));
        let bytes = back.to_bytes().unwrap();
        let back = TableBlock::from_bytes(&bytes).unwrap();
        let package = back.package(0x7f).unwrap();
        let value = package.find_entry(0x7f01_0000, &ResConfig::default()).unwrap().value().unwrap();
        assert_eq!(value.data(), 1);
        assert_eq!(value.string_text(back.strings().strings()).unwrap(), Some("Example"));
    }

    #[test]
    fn duplicate_package_is_usage_error() {
        let mut table = sample();
        assert!(table.new_package(0x7f, "again").unwrap_err().is_usage());
    }

    #[test]
    fn empty_context_picks_first_package() {
        let mut table = sample();
        table.new_package(0x02, "lib").unwrap();
        assert_eq!(table.pick_package(&PackageContext::default()).unwrap().id(), 0x7f);
        assert_eq!(table.pick_package(&PackageContext::by_name("lib")).unwrap().id(), 0x02);
        assert!(table.pick_package(&PackageContext::by_id(0x03)).is_none());
    }

    #[test]
    fn missing_file_error_names_path() {
        let path = Path::new("/nonexistent/resources.arsc");
        let e = TableBlock::read_file(path).unwrap_err();
        assert!(e.to_string().contains("/nonexistent/resources.arsc"));
    }
}
