/* A whole dex file: sections, layout and the refresh cycle */

use std::collections::HashSet;
use std::path::Path;

use log::{debug, warn};

use crate::block::error::{BlockError, BlockResult};
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::pool::{ItemId, Pool};
use crate::block::reference::{IndexReference, IntegerVisitor, OffsetReference, RefWidth};
use crate::block::Block;
use crate::dex::annotation::{AnnotationItem, AnnotationPools, AnnotationSet, AnnotationSetRefList, AnnotationsDirectory};
use crate::dex::class::{ClassData, ClassDef, EncodedField, EncodedMethod, ACC_CONSTRUCTOR, ACC_PRIVATE, ACC_STATIC};
use crate::dex::code::CodeItem;
use crate::dex::debug::DebugInfo;
use crate::dex::header::{update_checksums, Header, SectionSpan, HEADER_SIZE};
use crate::dex::ids::{class_mismatch, FieldId, IdPools, MethodId, ProtoId, StringData, TypeId, TypeList};
use crate::dex::key::{FieldKey, MethodKey, ProtoKey};
use crate::dex::section::{insert_in_order, MapItem, MapList, SectionType, DEFAULT_ORDER};
use crate::dex::value::{default_for, EncodedArray, EncodedValue};
use crate::dex::DexOptions;

#[derive(Debug, Clone)]
pub struct DexFile
{
    pub header: Header,
    pub ids: IdPools,
    pub class_defs: Pool<ClassDef>,
    pub annotations: AnnotationPools,
    pub class_data: Pool<ClassData>,
    pub code_items: Pool<CodeItem>,
    pub debug_infos: Pool<DebugInfo>,
    pub encoded_arrays: Pool<EncodedArray>,
    pub options: DexOptions,
    section_order: Vec<SectionType>,
    map: MapList,
}

impl Default for DexFile
{
    fn default() -> Self
    {
        DexFile::new()
    }
}

fn align_up(offset: usize, alignment: usize) -> usize
{
    (offset + alignment - 1) / alignment * alignment
}

fn read_section<T, F>(reader: &mut BlockReader<'_>, item: &MapItem, pool: &mut Pool<T>, mut read: F) -> BlockResult<()>
where
    F: FnMut(&mut BlockReader<'_>) -> BlockResult<T>,
{
    reader.seek(item.offset as usize)?;
    let alignment = item.section.alignment();
    for i in 0..item.size
    {
        reader.align(alignment)?;
        let offset = reader.position();
        let value = read(reader).map_err(|e| err!(e, "{:?} item {} at 0x{:x}", item.section, i, offset))?;
        let id = pool.push(value);
        pool.set_offset(id, offset as u32);
    }
    Ok(())
}

fn place<T, F>(pool: &mut Pool<T>, cursor: &mut usize, alignment: usize, trace: &mut Vec<u32>, len: F)
where
    F: Fn(&T) -> usize,
{
    for id in pool.ids()
    {
        *cursor = align_up(*cursor, alignment);
        pool.set_offset(id, *cursor as u32);
        trace.push(*cursor as u32);
        *cursor += pool.item(id).map_or(0, |item| len(item));
    }
}

fn pad_to(writer: &mut BlockWriter, offset: usize) -> BlockResult<()>
{
    if writer.position() > offset
    {
        fail!("Layout overlap: writing at 0x{:x}, item placed at 0x{:x}", writer.position(), offset);
    }
    writer.fill(offset - writer.position(), 0);
    Ok(())
}

fn write_section<T, F>(pool: &Pool<T>, writer: &mut BlockWriter, mut write: F) -> BlockResult<()>
where
    F: FnMut(&T, &mut BlockWriter) -> BlockResult<()>,
{
    for (id, item) in pool.iter_ids()
    {
        pad_to(writer, pool.offset_of(id).unwrap_or(0) as usize)?;
        write(item, writer)?;
    }
    Ok(())
}

impl DexFile
{
    /// An empty version 035 dex file.
    pub fn new() -> DexFile
    {
        DexFile {
            header: Header::default(),
            ids: IdPools::default(),
            class_defs: Pool::new(),
            annotations: AnnotationPools::default(),
            class_data: Pool::new(),
            code_items: Pool::new(),
            debug_infos: Pool::new(),
            encoded_arrays: Pool::new(),
            options: DexOptions::default(),
            section_order: DEFAULT_ORDER.to_vec(),
            map: MapList::default(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> BlockResult<DexFile>
    {
        DexFile::from_bytes_with(bytes, DexOptions::default())
    }

    pub fn from_bytes_with(bytes: &[u8], options: DexOptions) -> BlockResult<DexFile>
    {
        let mut reader = BlockReader::new(bytes);
        let header = Header::read(&mut reader)?;
        if header.map_off == 0
        {
            fail!("Dex file has no map list");
        }
        reader.seek(header.map_off as usize)?;
        let map = MapList::read(&mut reader).map_err(|e| err!(e, "map list at 0x{:x}", header.map_off))?;
        if header.link.size > 0
        {
            warn!("dropping {} bytes of link data", header.link.size);
        }

        let mut dex = DexFile { header, options, ..DexFile::new() };
        let order = map.order();
        for item in &map.items
        {
            if item.section.is_unsupported()
            {
                fail!("Unsupported dex section {:?} ({} items at 0x{:x})", item.section, item.size, item.offset);
            }
        }
        for item in order.iter().filter_map(|s| map.get(*s))
        {
            dex.read_section_items(&mut reader, item)?;
        }
        dex.section_order = order;
        dex.map = map;
        dex.commit_order();
        debug!(
            "read dex v{:03}: {} strings, {} types, {} methods, {} classes",
            dex.header.version(),
            dex.ids.strings.len(),
            dex.ids.types.len(),
            dex.ids.methods.len(),
            dex.class_defs.len()
        );
        Ok(dex)
    }

    fn read_section_items(&mut self, reader: &mut BlockReader<'_>, item: &MapItem) -> BlockResult<()>
    {
        match item.section
        {
            SectionType::Header | SectionType::MapList | SectionType::StringData => Ok(()),
            SectionType::StringId => {
                reader.seek(item.offset as usize)?;
                let mut offsets = Vec::with_capacity(item.size as usize);
                for _ in 0..item.size
                {
                    offsets.push(reader.read_u32()?);
                }
                for (i, offset) in offsets.into_iter().enumerate()
                {
                    reader.seek(offset as usize)?;
                    let mut string = StringData::default();
                    string.read(reader).map_err(|e| err!(e, "string_data {} at 0x{:x}", i, offset))?;
                    let id = self.ids.strings.push(string);
                    self.ids.strings.set_offset(id, offset);
                }
                Ok(())
            }
            SectionType::TypeId => read_section(reader, item, &mut self.ids.types, TypeId::read),
            SectionType::ProtoId => read_section(reader, item, &mut self.ids.protos, ProtoId::read),
            SectionType::FieldId => read_section(reader, item, &mut self.ids.fields, FieldId::read),
            SectionType::MethodId => read_section(reader, item, &mut self.ids.methods, MethodId::read),
            SectionType::ClassDef => read_section(reader, item, &mut self.class_defs, ClassDef::read),
            SectionType::TypeList => read_section(reader, item, &mut self.ids.type_lists, TypeList::read_from),
            SectionType::AnnotationSetRefList => read_section(reader, item, &mut self.annotations.ref_lists, AnnotationSetRefList::read),
            SectionType::AnnotationSet => read_section(reader, item, &mut self.annotations.sets, AnnotationSet::read),
            SectionType::AnnotationsDirectory => read_section(reader, item, &mut self.annotations.directories, AnnotationsDirectory::read),
            SectionType::Annotation => read_section(reader, item, &mut self.annotations.items, AnnotationItem::read),
            SectionType::ClassData => read_section(reader, item, &mut self.class_data, ClassData::read),
            SectionType::Code => read_section(reader, item, &mut self.code_items, CodeItem::read),
            SectionType::DebugInfo => read_section(reader, item, &mut self.debug_infos, DebugInfo::read),
            SectionType::EncodedArray => read_section(reader, item, &mut self.encoded_arrays, EncodedArray::read),
            SectionType::CallSiteId | SectionType::MethodHandle | SectionType::HiddenApiClassData => {
                fail!("Unsupported dex section {:?}", item.section)
            }
        }
    }

    pub fn read_file(path: &Path) -> BlockResult<DexFile>
    {
        let data = std::fs::read(path).map_err(|e| BlockError::from(e).with_path(path))?;
        DexFile::from_bytes(&data).map_err(|e| e.with_path(path))
    }

    pub fn write_file(&mut self, path: &Path) -> BlockResult<()>
    {
        let bytes = self.to_bytes().map_err(|e| e.with_path(path))?;
        std::fs::write(path, bytes).map_err(|e| BlockError::from(e).with_path(path))
    }

    /// Map list as of the last read or refresh.
    pub fn map(&self) -> &MapList
    {
        &self.map
    }

    fn commit_order(&mut self)
    {
        self.ids.commit_order();
        self.class_defs.commit_order();
        self.annotations.commit_order();
        self.class_data.commit_order();
        self.code_items.commit_order();
        self.debug_infos.commit_order();
        self.encoded_arrays.commit_order();
    }

    fn bind(&self) -> BlockResult<()>
    {
        for class in self.class_defs.iter()
        {
            class.bind(&self.ids)?;
            class.annotations.get(&self.annotations.directories)?;
            class.class_data.get(&self.class_data)?;
            class.static_values.get(&self.encoded_arrays)?;
        }
        for data in self.class_data.iter()
        {
            data.bind(&self.ids)?;
            for m in data.methods()
            {
                m.code.get(&self.code_items)?;
            }
        }
        for code in self.code_items.iter()
        {
            code.bind(&self.ids)?;
            code.debug_info.get(&self.debug_infos)?;
        }
        for info in self.debug_infos.iter()
        {
            info.bind(&self.ids)?;
        }
        for array in self.encoded_arrays.iter()
        {
            array.bind(&self.ids)?;
        }
        self.annotations.bind(&self.ids)
    }

    /// Sorts the identifier pools and every list ordered by identifier index.
    pub fn sort_ids(&mut self) -> BlockResult<()>
    {
        self.bind()?;
        self.ids.sort()?;
        self.annotations.sort(&self.ids)
    }

    fn refresh_indices(&mut self) -> BlockResult<()>
    {
        let ids = &self.ids;
        ids.refresh_references()?;
        for (i, class) in self.class_defs.iter().enumerate()
        {
            class.refresh_indices(ids).map_err(|e| err!(e, "class_def {}", i))?;
        }
        let mut refreshed = HashSet::new();
        for class in self.class_defs.iter()
        {
            let data = match class.class_data.get(&self.class_data)?
            {
                Some(d) => d,
                None => continue,
            };
            let values = match class.static_values.get(&self.encoded_arrays)?
            {
                Some(v) => Some(self.encoded_arrays.item_mut(v)?),
                None => None,
            };
            self.class_data.item_mut(data)?.refresh_indices(ids, values)?;
            refreshed.insert(data);
        }
        for id in self.class_data.ids()
        {
            if !refreshed.contains(&id)
            {
                self.class_data.item_mut(id)?.refresh_indices(ids, None)?;
            }
        }
        for id in self.code_items.ids()
        {
            let offset = self.code_items.offset_of(id).unwrap_or(0);
            self.code_items.item_mut(id)?.refresh(ids).map_err(|e| err!(e, "code_item at 0x{:x}", offset))?;
        }
        for info in self.debug_infos.iter()
        {
            info.refresh(ids)?;
        }
        for array in self.encoded_arrays.iter()
        {
            array.refresh(ids)?;
        }
        self.annotations.refresh_indices(ids)
    }

    fn refresh_offsets(&self) -> BlockResult<()>
    {
        for proto in self.ids.protos.iter()
        {
            proto.parameters.refresh(&self.ids.type_lists)?;
        }
        for class in self.class_defs.iter()
        {
            class.interfaces.refresh(&self.ids.type_lists)?;
            class.annotations.refresh(&self.annotations.directories)?;
            class.class_data.refresh(&self.class_data)?;
            class.static_values.refresh(&self.encoded_arrays)?;
        }
        for data in self.class_data.iter()
        {
            for m in data.methods()
            {
                m.code.refresh(&self.code_items)?;
            }
        }
        for code in self.code_items.iter()
        {
            code.debug_info.refresh(&self.debug_infos)?;
        }
        self.annotations.refresh_offsets()
    }

    fn section_count(&self, section: SectionType) -> usize
    {
        match section
        {
            SectionType::Header | SectionType::MapList => 1,
            SectionType::StringId | SectionType::StringData => self.ids.strings.len(),
            SectionType::TypeId => self.ids.types.len(),
            SectionType::ProtoId => self.ids.protos.len(),
            SectionType::FieldId => self.ids.fields.len(),
            SectionType::MethodId => self.ids.methods.len(),
            SectionType::ClassDef => self.class_defs.len(),
            SectionType::TypeList => self.ids.type_lists.len(),
            SectionType::AnnotationSetRefList => self.annotations.ref_lists.len(),
            SectionType::AnnotationSet => self.annotations.sets.len(),
            SectionType::AnnotationsDirectory => self.annotations.directories.len(),
            SectionType::Annotation => self.annotations.items.len(),
            SectionType::ClassData => self.class_data.len(),
            SectionType::Code => self.code_items.len(),
            SectionType::DebugInfo => self.debug_infos.len(),
            SectionType::EncodedArray => self.encoded_arrays.len(),
            SectionType::CallSiteId | SectionType::MethodHandle | SectionType::HiddenApiClassData => 0,
        }
    }

    /// One top-down layout pass. Returns every assigned offset, for the caller
    /// to detect when a pass no longer moves anything.
    fn assign_layout(&mut self) -> Vec<u32>
    {
        let sections: Vec<SectionType> =
            self.section_order.iter().copied().filter(|s| self.section_count(*s) > 0).collect();
        let mut trace = Vec::new();
        let mut items = Vec::with_capacity(sections.len());
        let mut cursor = 0usize;
        for section in sections
        {
            let alignment = section.alignment();
            cursor = align_up(cursor, alignment);
            let count = self.section_count(section);
            items.push(MapItem { section, unused: 0, size: count as u32, offset: cursor as u32 });
            trace.push(cursor as u32);
            match section
            {
                SectionType::Header => cursor += HEADER_SIZE as usize,
                SectionType::MapList => cursor += 4 + 12 * self.map_len_hint(),
                SectionType::StringId | SectionType::TypeId => cursor += 4 * count,
                SectionType::ProtoId => cursor += 12 * count,
                SectionType::FieldId | SectionType::MethodId => cursor += 8 * count,
                SectionType::ClassDef => cursor += ClassDef::SIZE * count,
                SectionType::StringData => place(&mut self.ids.strings, &mut cursor, alignment, &mut trace, |s| s.byte_len()),
                SectionType::TypeList => place(&mut self.ids.type_lists, &mut cursor, alignment, &mut trace, |t| t.byte_len()),
                SectionType::AnnotationSetRefList => {
                    place(&mut self.annotations.ref_lists, &mut cursor, alignment, &mut trace, |l| l.byte_len())
                }
                SectionType::AnnotationSet => place(&mut self.annotations.sets, &mut cursor, alignment, &mut trace, |s| s.byte_len()),
                SectionType::AnnotationsDirectory => {
                    place(&mut self.annotations.directories, &mut cursor, alignment, &mut trace, |d| d.byte_len())
                }
                SectionType::Annotation => place(&mut self.annotations.items, &mut cursor, alignment, &mut trace, |a| a.byte_len()),
                SectionType::ClassData => place(&mut self.class_data, &mut cursor, alignment, &mut trace, |c| c.byte_len()),
                SectionType::Code => place(&mut self.code_items, &mut cursor, alignment, &mut trace, |c| c.byte_len()),
                SectionType::DebugInfo => place(&mut self.debug_infos, &mut cursor, alignment, &mut trace, |d| d.byte_len()),
                SectionType::EncodedArray => place(&mut self.encoded_arrays, &mut cursor, alignment, &mut trace, |a| a.byte_len()),
                SectionType::CallSiteId | SectionType::MethodHandle | SectionType::HiddenApiClassData => {}
            }
        }
        trace.push(cursor as u32);
        self.map = MapList { items };
        self.header.file_size = cursor as u32;
        trace
    }

    fn map_len_hint(&self) -> usize
    {
        self.section_order.iter().filter(|s| self.section_count(**s) > 0).count()
    }

    fn update_header(&mut self)
    {
        let span = |map: &MapList, section: SectionType| -> SectionSpan {
            match map.get(section)
            {
                Some(item) => SectionSpan { size: item.size, offset: item.offset },
                None => SectionSpan::default(),
            }
        };
        self.header.link = SectionSpan::default();
        self.header.header_size = HEADER_SIZE;
        self.header.map_off = self.map.get(SectionType::MapList).map_or(0, |m| m.offset);
        self.header.string_ids = span(&self.map, SectionType::StringId);
        self.header.type_ids = span(&self.map, SectionType::TypeId);
        self.header.proto_ids = span(&self.map, SectionType::ProtoId);
        self.header.field_ids = span(&self.map, SectionType::FieldId);
        self.header.method_ids = span(&self.map, SectionType::MethodId);
        self.header.class_defs = span(&self.map, SectionType::ClassDef);
        let data_off = self.map.items.iter().filter(|i| i.section.is_data()).map(|i| i.offset).min().unwrap_or(self.header.file_size);
        self.header.data = SectionSpan { size: self.header.file_size - data_off, offset: data_off };
    }

    /// Brings every stored index, offset, size and count up to date.
    ///
    /// Index references are rewritten first, then layout passes run until no
    /// offset moves, then offset references are rewritten against the final layout.
    pub fn refresh(&mut self) -> BlockResult<()>
    {
        self.bind()?;
        if self.options.sort_ids_on_refresh
        {
            self.sort_ids()?;
        }
        self.refresh_indices()?;
        for section in DEFAULT_ORDER
        {
            if self.section_count(section) > 0
            {
                insert_in_order(&mut self.section_order, section);
            }
        }
        let mut previous = None;
        let mut settled = false;
        for pass in 0..self.options.max_layout_passes
        {
            let trace = self.assign_layout();
            self.refresh_offsets()?;
            if previous.as_ref() == Some(&trace)
            {
                debug!("dex layout settled after {} passes, {} bytes", pass + 1, self.header.file_size);
                settled = true;
                break;
            }
            previous = Some(trace);
        }
        if !settled
        {
            fail!("Dex layout did not settle after {} passes", self.options.max_layout_passes);
        }
        self.update_header();
        self.commit_order();
        Ok(())
    }

    /// Writes the file as last refreshed.
    pub fn write(&self, writer: &mut BlockWriter) -> BlockResult<()>
    {
        let start = writer.position();
        for item in self.map.items.clone()
        {
            pad_to(writer, start + item.offset as usize)?;
            self.write_section(writer, item.section)
                .map_err(|e| err!(e, "{:?} section at 0x{:x}", item.section, item.offset))?;
        }
        pad_to(writer, start + self.header.file_size as usize)
    }

    fn write_section(&self, writer: &mut BlockWriter, section: SectionType) -> BlockResult<()>
    {
        match section
        {
            SectionType::Header => {
                self.header.write(writer);
            }
            SectionType::MapList => {
                self.map.write(writer);
            }
            SectionType::StringId => {
                for id in self.ids.strings.ids()
                {
                    writer.write_u32(self.ids.strings.offset_of(id).unwrap_or(0));
                }
            }
            SectionType::TypeId => {
                for t in self.ids.types.iter()
                {
                    t.write(writer);
                }
            }
            SectionType::ProtoId => {
                for p in self.ids.protos.iter()
                {
                    p.write(writer);
                }
            }
            SectionType::FieldId => {
                for f in self.ids.fields.iter()
                {
                    f.write(writer);
                }
            }
            SectionType::MethodId => {
                for m in self.ids.methods.iter()
                {
                    m.write(writer);
                }
            }
            SectionType::ClassDef => {
                for c in self.class_defs.iter()
                {
                    c.write(writer);
                }
            }
            SectionType::StringData => write_section(&self.ids.strings, writer, |s, w| s.write(w))?,
            SectionType::TypeList => write_section(&self.ids.type_lists, writer, |t, w| t.write(w))?,
            SectionType::AnnotationSetRefList => write_section(&self.annotations.ref_lists, writer, |l, w| {
                l.write(w);
                Ok(())
            })?,
            SectionType::AnnotationSet => write_section(&self.annotations.sets, writer, |s, w| {
                s.write(w);
                Ok(())
            })?,
            SectionType::AnnotationsDirectory => write_section(&self.annotations.directories, writer, |d, w| {
                d.write(w);
                Ok(())
            })?,
            SectionType::Annotation => write_section(&self.annotations.items, writer, |a, w| {
                a.write(w);
                Ok(())
            })?,
            SectionType::ClassData => write_section(&self.class_data, writer, |c, w| c.write(w).map(drop))?,
            SectionType::Code => write_section(&self.code_items, writer, |c, w| c.write(w).map(drop))?,
            SectionType::DebugInfo => write_section(&self.debug_infos, writer, |d, w| {
                d.write(w);
                Ok(())
            })?,
            SectionType::EncodedArray => write_section(&self.encoded_arrays, writer, |a, w| {
                a.write(w);
                Ok(())
            })?,
            SectionType::CallSiteId | SectionType::MethodHandle | SectionType::HiddenApiClassData => {
                fail!("Unsupported dex section {:?}", section)
            }
        }
        Ok(())
    }

    /// Refreshes, then serializes with the header checksum and signature
    /// recomputed when the options ask for it.
    pub fn to_bytes(&mut self) -> BlockResult<Vec<u8>>
    {
        self.refresh()?;
        let mut writer = BlockWriter::with_capacity(self.header.file_size as usize);
        self.write(&mut writer)?;
        let mut bytes = writer.into_bytes();
        if self.options.update_checksum
        {
            update_checksums(&mut bytes);
            self.header.signature.copy_from_slice(&bytes[12..32]);
            self.header.checksum = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        }
        Ok(bytes)
    }

    pub fn get_or_create_string(&mut self, text: &str) -> ItemId<StringData>
    {
        self.ids.get_or_create_string(text)
    }

    pub fn get_or_create_type(&mut self, descriptor: &str) -> ItemId<TypeId>
    {
        self.ids.get_or_create_type(descriptor)
    }

    pub fn get_or_create_proto(&mut self, key: &ProtoKey) -> ItemId<ProtoId>
    {
        self.ids.get_or_create_proto(key)
    }

    pub fn get_or_create_field(&mut self, key: &FieldKey) -> ItemId<FieldId>
    {
        self.ids.get_or_create_field(key)
    }

    pub fn get_or_create_method(&mut self, key: &MethodKey) -> ItemId<MethodId>
    {
        self.ids.get_or_create_method(key)
    }

    pub fn find_class(&self, descriptor: &str) -> Option<ItemId<ClassDef>>
    {
        let type_id = self.ids.find_type(descriptor)?;
        self.class_defs.find(|c| c.class_type.get(&self.ids.types).ok().flatten() == Some(type_id))
    }

    pub fn class(&self, id: ItemId<ClassDef>) -> BlockResult<&ClassDef>
    {
        self.class_defs.item(id)
    }

    pub fn class_descriptors(&self) -> BlockResult<Vec<String>>
    {
        let mut out = Vec::with_capacity(self.class_defs.len());
        for c in self.class_defs.iter()
        {
            out.push(c.descriptor(&self.ids)?.to_string());
        }
        Ok(out)
    }

    /// Defines a new class; a second definition of the same type is a usage error.
    pub fn create_class(&mut self, descriptor: &str, access_flags: u32, superclass: Option<&str>, interfaces: &[String]) -> BlockResult<ItemId<ClassDef>>
    {
        if self.find_class(descriptor).is_some()
        {
            return Err(BlockError::usage(format!("class {} is already defined", descriptor)));
        }
        let type_id = self.ids.get_or_create_type(descriptor);
        let mut class = ClassDef::new(type_id, access_flags);
        if let Some(s) = superclass
        {
            class.superclass = IndexReference::to(RefWidth::Int, self.ids.get_or_create_type(s));
        }
        if let Some(list) = self.ids.get_or_create_type_list(interfaces)
        {
            class.interfaces = OffsetReference::to(RefWidth::Int, list);
        }
        Ok(self.class_defs.push(class))
    }

    pub fn set_source_file(&mut self, class: ItemId<ClassDef>, name: Option<&str>) -> BlockResult<()>
    {
        let reference = match name
        {
            Some(n) => IndexReference::to(RefWidth::Int, self.ids.get_or_create_string(n)),
            None => IndexReference::from_raw(RefWidth::Int, crate::block::reference::NO_INDEX),
        };
        self.class_defs.item_mut(class)?.source_file = reference;
        Ok(())
    }

    pub fn class_data_of(&self, class: ItemId<ClassDef>) -> BlockResult<Option<&ClassData>>
    {
        self.class_defs.item(class)?.class_data.item(&self.class_data)
    }

    fn class_data_mut(&mut self, class: ItemId<ClassDef>) -> BlockResult<ItemId<ClassData>>
    {
        let existing = self.class_defs.item(class)?.class_data.get(&self.class_data)?;
        match existing
        {
            Some(id) => Ok(id),
            None => {
                let id = self.class_data.push(ClassData::default());
                self.class_defs.item_mut(class)?.class_data = OffsetReference::to(RefWidth::Int, id);
                Ok(id)
            }
        }
    }

    fn check_owner(&self, class: ItemId<ClassDef>, owner: &str) -> BlockResult<()>
    {
        let descriptor = self.class_defs.item(class)?.descriptor(&self.ids)?;
        if descriptor != owner
        {
            return Err(class_mismatch(descriptor, owner));
        }
        Ok(())
    }

    /// Adds a field to `class`. A static field with an initial value extends
    /// the class's static values, filling earlier fields with their defaults.
    pub fn add_field(&mut self, class: ItemId<ClassDef>, key: &FieldKey, access_flags: u32, initial: Option<EncodedValue>) -> BlockResult<ItemId<FieldId>>
    {
        self.check_owner(class, &key.class)?;
        let field = self.ids.get_or_create_field(key);
        let data = self.class_data_mut(class)?;
        let encoded = EncodedField { field: IndexReference::to(RefWidth::Uleb, field), access_flags };
        if access_flags & ACC_STATIC == 0
        {
            self.class_data.item_mut(data)?.instance_fields.push(encoded);
            return Ok(field);
        }
        let position = self.class_data.item(data)?.static_fields.len();
        let mut types = Vec::with_capacity(position);
        for f in &self.class_data.item(data)?.static_fields
        {
            types.push(self.ids.field_key(f.field.require(&self.ids.fields)?)?.field_type);
        }
        self.class_data.item_mut(data)?.static_fields.push(encoded);
        if let Some(value) = initial
        {
            let array = match self.class_defs.item(class)?.static_values.get(&self.encoded_arrays)?
            {
                Some(a) => a,
                None => {
                    let a = self.encoded_arrays.push(EncodedArray::default());
                    self.class_defs.item_mut(class)?.static_values = OffsetReference::to(RefWidth::Int, a);
                    a
                }
            };
            let values = &mut self.encoded_arrays.item_mut(array)?.values;
            while values.len() < position
            {
                values.push(default_for(&types[values.len()]));
            }
            values.truncate(position);
            values.push(value);
        }
        Ok(field)
    }

    /// Adds a method to `class`, as a direct method when it is static, private
    /// or a constructor and as a virtual method otherwise.
    pub fn add_method(&mut self, class: ItemId<ClassDef>, key: &MethodKey, access_flags: u32, code: Option<CodeItem>) -> BlockResult<ItemId<MethodId>>
    {
        self.check_owner(class, &key.class)?;
        let method = self.ids.get_or_create_method(key);
        let code = match code
        {
            Some(c) => OffsetReference::to(RefWidth::Uleb, self.code_items.push(c)),
            None => OffsetReference::new(RefWidth::Uleb),
        };
        let encoded = EncodedMethod { method: IndexReference::to(RefWidth::Uleb, method), access_flags, code };
        let data = self.class_data_mut(class)?;
        let data = self.class_data.item_mut(data)?;
        if access_flags & (ACC_STATIC | ACC_PRIVATE | ACC_CONSTRUCTOR) != 0
        {
            data.direct_methods.push(encoded);
        }
        else
        {
            data.virtual_methods.push(encoded);
        }
        Ok(method)
    }

    pub fn code_of(&self, method: &EncodedMethod) -> BlockResult<Option<&CodeItem>>
    {
        method.code.item(&self.code_items)
    }

    /// Visits every integer constant: encoded values, annotation elements and `const` literals.
    pub fn visit_integers(&mut self, visitor: &mut dyn IntegerVisitor)
    {
        self.encoded_arrays.for_each_mut(|a| {
            for v in a.values.iter_mut()
            {
                v.visit_integers(visitor);
            }
        });
        self.annotations.items.for_each_mut(|item| {
            for e in item.annotation.elements.iter_mut()
            {
                e.value.visit_integers(visitor);
            }
        });
        self.code_items.for_each_mut(|c| c.visit_integers(visitor));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::class::ACC_PUBLIC;
    use crate::dex::header::compute_checksum;
    use crate::dex::ins::{IndexOperand, InsBody, Operation};
    use crate::dex::value::DexValue;

    fn hello() -> DexFile {
        let mut dex = DexFile::new();
        let class = dex.create_class("LHello;", ACC_PUBLIC, Some("Ljava/lang/Object;"), &[]).unwrap();
        dex.set_source_file(class, Some("Hello.java")).unwrap();
        let text = dex.get_or_create_string("hi");
        let mut code = CodeItem::new(1, 0, 0);
        let mut load = Operation::new(0x1a);
        load.regs = vec![0];
        load.index = Some(IndexOperand::String(IndexReference::to(RefWidth::Int, text)));
        code.push(InsBody::Op(load));
        code.push(InsBody::Op(Operation::new(0x0e)));
        let run = MethodKey::new("LHello;", "run", ProtoKey::new(vec![], "V"));
        dex.add_method(class, &run, ACC_PUBLIC | ACC_STATIC, Some(code)).unwrap();
        let count = FieldKey::new("LHello;", "count", "I");
        dex.add_field(class, &count, ACC_STATIC, Some(EncodedValue::new(DexValue::Int(3)))).unwrap();
        dex
    }

    fn loaded_string(dex: &DexFile) -> String {
        let class = dex.find_class("LHello;").unwrap();
        let data = dex.class_data_of(class).unwrap().unwrap();
        let code = dex.code_of(&data.direct_methods[0]).unwrap().unwrap();
        match &code.instructions()[0].operation().unwrap().index {
            Some(IndexOperand::String(r)) => dex.ids.string(r).unwrap().to_string(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn built_file_reads_back() {
        let mut dex = hello();
        let bytes = dex.to_bytes().unwrap();
        assert_eq!(bytes.len(), dex.header.file_size as usize);
        assert_eq!(compute_checksum(&bytes), dex.header.checksum);

        let back = DexFile::from_bytes(&bytes).unwrap();
        assert_eq!(back.class_descriptors().unwrap(), vec!["LHello;"]);
        let class = back.find_class("LHello;").unwrap();
        assert_eq!(back.class(class).unwrap().superclass(&back.ids).unwrap(), Some("Ljava/lang/Object;"));
        assert_eq!(back.class(class).unwrap().source_file(&back.ids).unwrap(), Some("Hello.java"));
        assert_eq!(loaded_string(&back), "hi");
        let data = back.class_data_of(class).unwrap().unwrap();
        let key = back.ids.method_key(data.direct_methods[0].method.require(&back.ids.methods).unwrap()).unwrap();
        assert_eq!(key.to_string(), "LHello;->run()V");
    }

    #[test]
    fn rewriting_is_stable() {
        let mut dex = hello();
        let first = dex.to_bytes().unwrap();
        let mut back = DexFile::from_bytes(&first).unwrap();
        let second = back.to_bytes().unwrap();
        assert_eq!(first, second);
        assert_eq!(back.to_bytes().unwrap(), second);
    }

    #[test]
    fn new_strings_shift_indices_without_breaking_code() {
        let mut dex = hello();
        let bytes = dex.to_bytes().unwrap();
        let mut back = DexFile::from_bytes(&bytes).unwrap();
        back.get_or_create_string("aaa");
        back.get_or_create_type("LAaa;");
        let bytes = back.to_bytes().unwrap();
        let again = DexFile::from_bytes(&bytes).unwrap();
        assert_eq!(loaded_string(&again), "hi");
        assert_eq!(again.ids.strings.get(0).unwrap().text(), "Hello.java");
        assert!(again.ids.find_string("aaa").is_some());
    }

    #[test]
    fn constants_are_visited() {
        let mut dex = hello();
        let mut seen = Vec::new();
        dex.visit_integers(&mut |r: &mut dyn crate::block::reference::IntegerReference| {
            seen.push(r.get());
            r.set(r.get() + 1);
        });
        assert_eq!(seen, vec![3]);
        let class = dex.find_class("LHello;").unwrap();
        let array = dex.class(class).unwrap().static_values.item(&dex.encoded_arrays).unwrap().unwrap();
        assert!(matches!(array.values[0].value(), DexValue::Int(4)));
    }

    #[test]
    fn members_must_belong_to_their_class() {
        let mut dex = hello();
        let class = dex.find_class("LHello;").unwrap();
        let foreign = MethodKey::new("LOther;", "run", ProtoKey::new(vec![], "V"));
        assert!(dex.add_method(class, &foreign, ACC_PUBLIC, None).unwrap_err().is_usage());
        assert!(dex.create_class("LHello;", 0, None, &[]).unwrap_err().is_usage());
    }

    #[test]
    fn unsupported_sections_are_rejected() {
        let mut writer = BlockWriter::new();
        Header { map_off: HEADER_SIZE, file_size: HEADER_SIZE + 28, ..Header::default() }.write(&mut writer);
        MapList {
            items: vec![
                MapItem { section: SectionType::Header, unused: 0, size: 1, offset: 0 },
                MapItem { section: SectionType::CallSiteId, unused: 0, size: 1, offset: HEADER_SIZE },
            ],
        }
        .write(&mut writer);
        let e = DexFile::from_bytes(writer.as_slice()).unwrap_err();
        assert!(!e.is_usage() && !e.is_resolution());
        assert!(e.to_string().contains("CallSiteId"));
    }
}
