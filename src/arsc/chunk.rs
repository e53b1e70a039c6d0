use crate::block::error::BlockResult;
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::Block;

pub const RES_NULL_TYPE: u16 = 0x0000;
pub const RES_STRING_POOL_TYPE: u16 = 0x0001;
pub const RES_TABLE_TYPE: u16 = 0x0002;
pub const RES_XML_TYPE: u16 = 0x0003;
pub const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
pub const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
pub const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
pub const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
pub const RES_XML_CDATA_TYPE: u16 = 0x0104;
pub const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;
pub const RES_TABLE_PACKAGE_TYPE: u16 = 0x0200;
pub const RES_TABLE_TYPE_TYPE: u16 = 0x0201;
pub const RES_TABLE_TYPE_SPEC_TYPE: u16 = 0x0202;
pub const RES_TABLE_LIBRARY_TYPE: u16 = 0x0203;
pub const RES_TABLE_OVERLAYABLE_TYPE: u16 = 0x0204;
pub const RES_TABLE_OVERLAYABLE_POLICY_TYPE: u16 = 0x0205;
pub const RES_TABLE_STAGED_ALIAS_TYPE: u16 = 0x0206;

/// The 8-byte prefix of every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: u16,
    pub header_size: u16,
    pub chunk_size: u32,
}

impl ChunkHeader {
    pub const SIZE: usize = 8;

    pub fn new(chunk_type: u16, header_size: u16) -> Self {
        ChunkHeader { chunk_type, header_size, chunk_size: header_size as u32 }
    }

    pub fn peek(reader: &BlockReader<'_>) -> BlockResult<Self> {
        let mut probe = BlockReader::new(reader.data());
        probe.seek(reader.position())?;
        Self::read_fields(&mut probe)
    }

    fn read_fields(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let start = reader.position();
        let chunk_type = reader.read_u16()?;
        let header_size = reader.read_u16()?;
        let chunk_size = reader.read_u32()?;
        if (header_size as usize) < Self::SIZE || chunk_size < header_size as u32 {
            fail!("Invalid chunk sizing (header 0x{:x}, chunk 0x{:x}) at 0x{:x}", header_size, chunk_size, start);
        }
        if start + chunk_size as usize > reader.len() {
            fail!("Chunk 0x{:04x} at 0x{:x} extends past end of data", chunk_type, start);
        }
        Ok(ChunkHeader { chunk_type, header_size, chunk_size })
    }

    pub fn write(&self, writer: &mut BlockWriter) {
        writer.write_u16(self.chunk_type);
        writer.write_u16(self.header_size);
        writer.write_u32(self.chunk_size);
    }
}

/// Splits the next chunk off `reader`.
///
/// The returned reader covers the whole chunk, so positions inside it are
/// chunk-relative, and is positioned just past the 8-byte header.
pub fn read_chunk<'a>(reader: &mut BlockReader<'a>) -> BlockResult<(ChunkHeader, BlockReader<'a>)> {
    let header = ChunkHeader::peek(reader)?;
    let mut chunk = reader.sub_reader(header.chunk_size as usize)?;
    chunk.skip(ChunkHeader::SIZE)?;
    Ok((header, chunk))
}

/// Reads whatever header bytes lie between the fields a chunk knows and its declared header size.
pub(crate) fn read_header_extra(reader: &mut BlockReader<'_>, header: &ChunkHeader) -> BlockResult<Vec<u8>> {
    let end = header.header_size as usize;
    if reader.position() > end {
        fail!("Chunk 0x{:04x} header is shorter than its fixed fields", header.chunk_type);
    }
    let extra = reader.read_bytes(end - reader.position())?;
    Ok(extra.to_vec())
}

/// A chunk this crate does not model, preserved byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    header: ChunkHeader,
    body: Vec<u8>,
}

impl RawChunk {
    pub fn read_from(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let mut chunk = RawChunk { header: ChunkHeader::new(RES_NULL_TYPE, 8), body: Vec::new() };
        chunk.read(reader)?;
        Ok(chunk)
    }

    pub fn chunk_type(&self) -> u16 {
        self.header.chunk_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

impl Block for RawChunk {
    fn read(&mut self, reader: &mut BlockReader<'_>) -> BlockResult<()> {
        let (header, mut chunk) = read_chunk(reader)?;
        self.body = chunk.read_bytes(chunk.remaining())?.to_vec();
        self.header = header;
        Ok(())
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        self.header.write(writer);
        writer.write_bytes(&self.body);
        Ok(())
    }

    fn byte_len(&self) -> usize {
        ChunkHeader::SIZE + self.body.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_bytes;

    #[test]
    fn raw_chunk_round_trips() {
        let bytes = [0x04, 0x02, 0x0c, 0x00, 0x0c, 0x00, 0x00, 0x00, 1, 2, 3, 4];
        let mut reader = BlockReader::new(&bytes);
        let mut chunk = RawChunk::read_from(&mut reader).unwrap();
        assert_eq!(chunk.chunk_type(), RES_TABLE_OVERLAYABLE_TYPE);
        assert_eq!(block_bytes(&mut chunk).unwrap(), bytes.to_vec());
    }

    #[test]
    fn oversized_chunk_is_structural_error() {
        let bytes = [0x01, 0x00, 0x08, 0x00, 0xff, 0x00, 0x00, 0x00];
        let mut reader = BlockReader::new(&bytes);
        assert!(read_chunk(&mut reader).is_err());
    }
}
