/* Map list and the section types it names */

use crate::block::error::BlockResult;
use crate::block::io::{BlockReader, BlockWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionType
{
    Header,
    StringId,
    TypeId,
    ProtoId,
    FieldId,
    MethodId,
    ClassDef,
    CallSiteId,
    MethodHandle,
    MapList,
    TypeList,
    AnnotationSetRefList,
    AnnotationSet,
    ClassData,
    Code,
    StringData,
    DebugInfo,
    Annotation,
    EncodedArray,
    AnnotationsDirectory,
    HiddenApiClassData,
}

/// Layout order used for sections a file did not have when it was read.
pub const DEFAULT_ORDER: [SectionType; 18] = [
    SectionType::Header,
    SectionType::StringId,
    SectionType::TypeId,
    SectionType::ProtoId,
    SectionType::FieldId,
    SectionType::MethodId,
    SectionType::ClassDef,
    SectionType::Code,
    SectionType::DebugInfo,
    SectionType::TypeList,
    SectionType::StringData,
    SectionType::Annotation,
    SectionType::EncodedArray,
    SectionType::AnnotationSet,
    SectionType::AnnotationSetRefList,
    SectionType::AnnotationsDirectory,
    SectionType::ClassData,
    SectionType::MapList,
];

impl SectionType
{
    pub fn from_code(code: u16) -> Option<SectionType>
    {
        Some(match code
        {
            0x0000 => SectionType::Header,
            0x0001 => SectionType::StringId,
            0x0002 => SectionType::TypeId,
            0x0003 => SectionType::ProtoId,
            0x0004 => SectionType::FieldId,
            0x0005 => SectionType::MethodId,
            0x0006 => SectionType::ClassDef,
            0x0007 => SectionType::CallSiteId,
            0x0008 => SectionType::MethodHandle,
            0x1000 => SectionType::MapList,
            0x1001 => SectionType::TypeList,
            0x1002 => SectionType::AnnotationSetRefList,
            0x1003 => SectionType::AnnotationSet,
            0x2000 => SectionType::ClassData,
            0x2001 => SectionType::Code,
            0x2002 => SectionType::StringData,
            0x2003 => SectionType::DebugInfo,
            0x2004 => SectionType::Annotation,
            0x2005 => SectionType::EncodedArray,
            0x2006 => SectionType::AnnotationsDirectory,
            0xF000 => SectionType::HiddenApiClassData,
            _ => return None,
        })
    }

    pub fn code(&self) -> u16
    {
        match self
        {
            SectionType::Header => 0x0000,
            SectionType::StringId => 0x0001,
            SectionType::TypeId => 0x0002,
            SectionType::ProtoId => 0x0003,
            SectionType::FieldId => 0x0004,
            SectionType::MethodId => 0x0005,
            SectionType::ClassDef => 0x0006,
            SectionType::CallSiteId => 0x0007,
            SectionType::MethodHandle => 0x0008,
            SectionType::MapList => 0x1000,
            SectionType::TypeList => 0x1001,
            SectionType::AnnotationSetRefList => 0x1002,
            SectionType::AnnotationSet => 0x1003,
            SectionType::ClassData => 0x2000,
            SectionType::Code => 0x2001,
            SectionType::StringData => 0x2002,
            SectionType::DebugInfo => 0x2003,
            SectionType::Annotation => 0x2004,
            SectionType::EncodedArray => 0x2005,
            SectionType::AnnotationsDirectory => 0x2006,
            SectionType::HiddenApiClassData => 0xF000,
        }
    }

    /// Byte alignment of every item in the section.
    pub fn alignment(&self) -> usize
    {
        match self
        {
            SectionType::ClassData
            | SectionType::StringData
            | SectionType::DebugInfo
            | SectionType::Annotation
            | SectionType::EncodedArray => 1,
            _ => 4,
        }
    }

    /// True for sections this crate refuses to load.
    pub fn is_unsupported(&self) -> bool
    {
        matches!(self, SectionType::CallSiteId | SectionType::MethodHandle | SectionType::HiddenApiClassData)
    }

    pub fn is_data(&self) -> bool
    {
        self.code() >= 0x1000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapItem
{
    pub section: SectionType,
    pub unused: u16,
    pub size: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapList
{
    pub items: Vec<MapItem>,
}

impl MapList
{
    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<MapList>
    {
        let size = reader.read_u32()?;
        let mut items = Vec::with_capacity(size as usize);
        for _ in 0..size
        {
            let code = reader.read_u16()?;
            let section = match SectionType::from_code(code)
            {
                Some(s) => s,
                None => fail!("Unknown map item type 0x{:04x}", code),
            };
            let unused = reader.read_u16()?;
            let size = reader.read_u32()?;
            let offset = reader.read_u32()?;
            items.push(MapItem { section, unused, size, offset });
        }
        Ok(MapList { items })
    }

    pub fn get(&self, section: SectionType) -> Option<&MapItem>
    {
        self.items.iter().find(|i| i.section == section)
    }

    /// Sections in file order.
    pub fn order(&self) -> Vec<SectionType>
    {
        let mut items = self.items.clone();
        items.sort_by_key(|i| i.offset);
        items.into_iter().map(|i| i.section).collect()
    }

    pub fn byte_len(&self) -> usize
    {
        4 + 12 * self.items.len()
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        let mut c = writer.write_u32(self.items.len() as u32);
        for item in &self.items
        {
            c += writer.write_u16(item.section.code());
            c += writer.write_u16(item.unused);
            c += writer.write_u32(item.size);
            c += writer.write_u32(item.offset);
        }
        c
    }
}

/// Places `section` into `order` next to the sections that precede it by default.
pub(crate) fn insert_in_order(order: &mut Vec<SectionType>, section: SectionType)
{
    if order.contains(&section)
    {
        return;
    }
    let rank = |s: &SectionType| DEFAULT_ORDER.iter().position(|d| d == s).unwrap_or(DEFAULT_ORDER.len());
    let wanted = rank(&section);
    let position = order.iter().position(|s| rank(s) > wanted && *s != SectionType::Header).unwrap_or(order.len());
    order.insert(position, section);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for section in DEFAULT_ORDER {
            assert_eq!(SectionType::from_code(section.code()), Some(section));
        }
        assert_eq!(SectionType::from_code(0x7777), None);
        assert!(SectionType::CallSiteId.is_unsupported());
    }

    #[test]
    fn map_list_round_trips() {
        let map = MapList {
            items: vec![
                MapItem { section: SectionType::Header, unused: 0, size: 1, offset: 0 },
                MapItem { section: SectionType::MapList, unused: 0, size: 1, offset: 0x200 },
                MapItem { section: SectionType::StringId, unused: 0, size: 3, offset: 0x70 },
            ],
        };
        let mut writer = BlockWriter::new();
        assert_eq!(map.write(&mut writer), map.byte_len());
        let bytes = writer.into_bytes();
        let back = MapList::read(&mut BlockReader::new(&bytes)).unwrap();
        assert_eq!(back, map);
        assert_eq!(back.order(), vec![SectionType::Header, SectionType::StringId, SectionType::MapList]);
    }

    #[test]
    fn new_sections_follow_default_rank() {
        let mut order = vec![SectionType::Header, SectionType::StringId, SectionType::StringData, SectionType::MapList];
        insert_in_order(&mut order, SectionType::Code);
        insert_in_order(&mut order, SectionType::TypeId);
        assert_eq!(
            order,
            vec![
                SectionType::Header,
                SectionType::StringId,
                SectionType::TypeId,
                SectionType::Code,
                SectionType::StringData,
                SectionType::MapList
            ]
        );
    }
}
