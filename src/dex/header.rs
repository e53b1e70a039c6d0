/* Dex header, checksum and signature */

use log::warn;
use sha1::{Digest, Sha1};

use crate::block::error::BlockResult;
use crate::block::io::{BlockReader, BlockWriter};

pub const HEADER_SIZE: u32 = 0x70;
pub const ENDIAN_CONSTANT: u32 = 0x12345678;
pub const REVERSE_ENDIAN_CONSTANT: u32 = 0x78563412;
pub const DEX_FILE_MAGIC: [u8; 8] = [0x64, 0x65, 0x78, 0x0a, 0x30, 0x33, 0x35, 0x00];

/// Size and offset of one header-described section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionSpan
{
    pub size: u32,
    pub offset: u32,
}

impl SectionSpan
{
    fn read(reader: &mut BlockReader<'_>) -> BlockResult<SectionSpan>
    {
        Ok(SectionSpan { size: reader.read_u32()?, offset: reader.read_u32()? })
    }

    fn write(&self, writer: &mut BlockWriter) -> usize
    {
        writer.write_u32(self.size) + writer.write_u32(self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header
{
    pub magic: [u8; 8],
    pub checksum: u32,
    pub signature: [u8; 20],
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub link: SectionSpan,
    pub map_off: u32,
    pub string_ids: SectionSpan,
    pub type_ids: SectionSpan,
    pub proto_ids: SectionSpan,
    pub field_ids: SectionSpan,
    pub method_ids: SectionSpan,
    pub class_defs: SectionSpan,
    pub data: SectionSpan,
}

impl Default for Header
{
    fn default() -> Self
    {
        Header {
            magic: DEX_FILE_MAGIC,
            checksum: 0,
            signature: [0; 20],
            file_size: 0,
            header_size: HEADER_SIZE,
            endian_tag: ENDIAN_CONSTANT,
            link: SectionSpan::default(),
            map_off: 0,
            string_ids: SectionSpan::default(),
            type_ids: SectionSpan::default(),
            proto_ids: SectionSpan::default(),
            field_ids: SectionSpan::default(),
            method_ids: SectionSpan::default(),
            class_defs: SectionSpan::default(),
            data: SectionSpan::default(),
        }
    }
}

impl Header
{
    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<Header>
    {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(reader.read_bytes(8)?);
        if &magic[0..4] != b"dex\n" || magic[7] != 0 || !magic[4..7].iter().all(|b| b.is_ascii_digit())
        {
            fail!("Bad dex magic {:02x?}", magic);
        }
        let checksum = reader.read_u32()?;
        let mut signature = [0u8; 20];
        signature.copy_from_slice(reader.read_bytes(20)?);
        let file_size = reader.read_u32()?;
        let header_size = reader.read_u32()?;
        let endian_tag = reader.read_u32()?;
        if endian_tag == REVERSE_ENDIAN_CONSTANT
        {
            fail!("Big-endian dex files are not supported");
        }
        if endian_tag != ENDIAN_CONSTANT
        {
            fail!("Bad endian tag 0x{:08x}", endian_tag);
        }
        if header_size != HEADER_SIZE
        {
            warn!("dex header declares size 0x{:x}", header_size);
        }
        Ok(Header {
            magic,
            checksum,
            signature,
            file_size,
            header_size,
            endian_tag,
            link: SectionSpan::read(reader)?,
            map_off: reader.read_u32()?,
            string_ids: SectionSpan::read(reader)?,
            type_ids: SectionSpan::read(reader)?,
            proto_ids: SectionSpan::read(reader)?,
            field_ids: SectionSpan::read(reader)?,
            method_ids: SectionSpan::read(reader)?,
            class_defs: SectionSpan::read(reader)?,
            data: SectionSpan::read(reader)?,
        })
    }

    /// Format version from the magic, e.g. 35 for `dex\n035\0`.
    pub fn version(&self) -> u32
    {
        self.magic[4..7].iter().fold(0, |acc, b| acc * 10 + (b - b'0') as u32)
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        let mut c = writer.write_bytes(&self.magic);
        c += writer.write_u32(self.checksum);
        c += writer.write_bytes(&self.signature);
        c += writer.write_u32(self.file_size);
        c += writer.write_u32(self.header_size);
        c += writer.write_u32(self.endian_tag);
        c += self.link.write(writer);
        c += writer.write_u32(self.map_off);
        c += self.string_ids.write(writer);
        c += self.type_ids.write(writer);
        c += self.proto_ids.write(writer);
        c += self.field_ids.write(writer);
        c += self.method_ids.write(writer);
        c += self.class_defs.write(writer);
        c += self.data.write(writer);
        c
    }
}

/// Adler-32 of everything after the checksum field.
pub fn compute_checksum(bytes: &[u8]) -> u32
{
    adler::adler32_slice(bytes.get(12..).unwrap_or(&[]))
}

/// SHA-1 of everything after the signature field.
pub fn compute_signature(bytes: &[u8]) -> [u8; 20]
{
    let mut hasher = Sha1::new();
    hasher.update(bytes.get(32..).unwrap_or(&[]));
    let digest = hasher.finalize();
    let mut signature = [0u8; 20];
    signature.copy_from_slice(&digest);
    signature
}

/// Rewrites signature then checksum in a complete file image.
pub fn update_checksums(bytes: &mut [u8])
{
    if bytes.len() < HEADER_SIZE as usize
    {
        return;
    }
    let signature = compute_signature(bytes);
    bytes[12..32].copy_from_slice(&signature);
    let checksum = compute_checksum(bytes);
    bytes[8..12].copy_from_slice(&checksum.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = Header { file_size: 0x70, map_off: 0x70, ..Header::default() };
        let mut writer = BlockWriter::new();
        assert_eq!(header.write(&mut writer), HEADER_SIZE as usize);
        let bytes = writer.into_bytes();
        let back = Header::read(&mut BlockReader::new(&bytes)).unwrap();
        assert_eq!(back, header);
        assert_eq!(back.version(), 35);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = vec![0u8; HEADER_SIZE as usize];
        bytes[..4].copy_from_slice(b"zip\n");
        assert!(Header::read(&mut BlockReader::new(&bytes)).is_err());
    }

    #[test]
    fn checksums_cover_the_tail() {
        let mut writer = BlockWriter::new();
        Header::default().write(&mut writer);
        let mut bytes = writer.into_bytes();
        update_checksums(&mut bytes);
        let checksum = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(checksum, compute_checksum(&bytes));
        assert_eq!(&bytes[12..32], &compute_signature(&bytes));
        bytes[0x40] ^= 1;
        assert_ne!(checksum, compute_checksum(&bytes));
    }
}
