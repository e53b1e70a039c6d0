/* Annotation items, sets, set ref lists and class annotation directories */

use crate::block::error::BlockResult;
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::pool::{ItemId, Pool};
use crate::block::reference::{IndexReference, OffsetReference, RefWidth};
use crate::dex::ids::{class_mismatch, FieldId, IdPools, MethodId};
use crate::dex::value::EncodedAnnotation;

pub const VISIBILITY_BUILD: u8 = 0x00;
pub const VISIBILITY_RUNTIME: u8 = 0x01;
pub const VISIBILITY_SYSTEM: u8 = 0x02;

pub fn visibility_name(visibility: u8) -> &'static str
{
    match visibility
    {
        VISIBILITY_BUILD => "build",
        VISIBILITY_RUNTIME => "runtime",
        _ => "system",
    }
}

pub fn visibility_from_name(name: &str) -> Option<u8>
{
    match name
    {
        "build" => Some(VISIBILITY_BUILD),
        "runtime" => Some(VISIBILITY_RUNTIME),
        "system" => Some(VISIBILITY_SYSTEM),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct AnnotationItem
{
    pub visibility: u8,
    pub annotation: EncodedAnnotation,
}

impl AnnotationItem
{
    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<AnnotationItem>
    {
        let visibility = reader.read_u8()?;
        let annotation = EncodedAnnotation::read(reader)?;
        Ok(AnnotationItem { visibility, annotation })
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        writer.write_u8(self.visibility) + self.annotation.write(writer)
    }

    pub fn byte_len(&self) -> usize
    {
        1 + self.annotation.byte_len()
    }
}

/// An `annotation_set_item`; entries are kept sorted by annotation type index.
#[derive(Debug, Clone, Default)]
pub struct AnnotationSet
{
    pub entries: Vec<OffsetReference<AnnotationItem>>,
}

impl AnnotationSet
{
    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<AnnotationSet>
    {
        let size = reader.read_u32()?;
        let mut entries = Vec::with_capacity(size.min(0x10000) as usize);
        for _ in 0..size
        {
            entries.push(OffsetReference::read(RefWidth::Int, reader)?);
        }
        Ok(AnnotationSet { entries })
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        let mut c = writer.write_u32(self.entries.len() as u32);
        for e in &self.entries
        {
            c += e.write(writer);
        }
        c
    }

    pub fn byte_len(&self) -> usize
    {
        4 + 4 * self.entries.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnnotationSetRefList
{
    pub lists: Vec<OffsetReference<AnnotationSet>>,
}

impl AnnotationSetRefList
{
    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<AnnotationSetRefList>
    {
        let size = reader.read_u32()?;
        let mut lists = Vec::with_capacity(size.min(0x10000) as usize);
        for _ in 0..size
        {
            lists.push(OffsetReference::read(RefWidth::Int, reader)?);
        }
        Ok(AnnotationSetRefList { lists })
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        let mut c = writer.write_u32(self.lists.len() as u32);
        for l in &self.lists
        {
            c += l.write(writer);
        }
        c
    }

    pub fn byte_len(&self) -> usize
    {
        4 + 4 * self.lists.len()
    }
}

#[derive(Debug, Clone)]
pub struct FieldAnnotation
{
    pub field: IndexReference<FieldId>,
    pub annotations: OffsetReference<AnnotationSet>,
}

#[derive(Debug, Clone)]
pub struct MethodAnnotation
{
    pub method: IndexReference<MethodId>,
    pub annotations: OffsetReference<AnnotationSet>,
}

#[derive(Debug, Clone)]
pub struct ParameterAnnotation
{
    pub method: IndexReference<MethodId>,
    pub annotations: OffsetReference<AnnotationSetRefList>,
}

/// An `annotations_directory_item`: the annotations of one class and its members.
#[derive(Debug, Clone, Default)]
pub struct AnnotationsDirectory
{
    pub class_annotations: OffsetReference<AnnotationSet>,
    pub fields: Vec<FieldAnnotation>,
    pub methods: Vec<MethodAnnotation>,
    pub parameters: Vec<ParameterAnnotation>,
}

impl AnnotationsDirectory
{
    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<AnnotationsDirectory>
    {
        let class_annotations = OffsetReference::read(RefWidth::Int, reader)?;
        let fields_size = reader.read_u32()?;
        let methods_size = reader.read_u32()?;
        let parameters_size = reader.read_u32()?;
        let mut directory = AnnotationsDirectory { class_annotations, ..Default::default() };
        for _ in 0..fields_size
        {
            directory.fields.push(FieldAnnotation {
                field: IndexReference::read(RefWidth::Int, reader)?,
                annotations: OffsetReference::read(RefWidth::Int, reader)?,
            });
        }
        for _ in 0..methods_size
        {
            directory.methods.push(MethodAnnotation {
                method: IndexReference::read(RefWidth::Int, reader)?,
                annotations: OffsetReference::read(RefWidth::Int, reader)?,
            });
        }
        for _ in 0..parameters_size
        {
            directory.parameters.push(ParameterAnnotation {
                method: IndexReference::read(RefWidth::Int, reader)?,
                annotations: OffsetReference::read(RefWidth::Int, reader)?,
            });
        }
        Ok(directory)
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        let mut c = self.class_annotations.write(writer);
        c += writer.write_u32(self.fields.len() as u32);
        c += writer.write_u32(self.methods.len() as u32);
        c += writer.write_u32(self.parameters.len() as u32);
        for f in &self.fields
        {
            c += f.field.write(writer) + f.annotations.write(writer);
        }
        for m in &self.methods
        {
            c += m.method.write(writer) + m.annotations.write(writer);
        }
        for p in &self.parameters
        {
            c += p.method.write(writer) + p.annotations.write(writer);
        }
        c
    }

    pub fn byte_len(&self) -> usize
    {
        16 + 8 * (self.fields.len() + self.methods.len() + self.parameters.len())
    }

    pub fn is_empty(&self) -> bool
    {
        !self.class_annotations.is_set() && self.fields.is_empty() && self.methods.is_empty() && self.parameters.is_empty()
    }
}

/// The four annotation pools of a dex file, which only reference each other by offset.
#[derive(Debug, Clone, Default)]
pub struct AnnotationPools
{
    pub items: Pool<AnnotationItem>,
    pub sets: Pool<AnnotationSet>,
    pub ref_lists: Pool<AnnotationSetRefList>,
    pub directories: Pool<AnnotationsDirectory>,
}

impl AnnotationPools
{
    pub fn add_item(&mut self, visibility: u8, annotation: EncodedAnnotation) -> ItemId<AnnotationItem>
    {
        self.items.push(AnnotationItem { visibility, annotation })
    }

    pub fn add_set(&mut self, items: &[ItemId<AnnotationItem>]) -> ItemId<AnnotationSet>
    {
        let entries = items.iter().map(|i| OffsetReference::to(RefWidth::Int, *i)).collect();
        self.sets.push(AnnotationSet { entries })
    }

    pub fn add_ref_list(&mut self, sets: &[Option<ItemId<AnnotationSet>>]) -> ItemId<AnnotationSetRefList>
    {
        let lists = sets
            .iter()
            .map(|s| match s
            {
                Some(id) => OffsetReference::to(RefWidth::Int, *id),
                None => OffsetReference::new(RefWidth::Int),
            })
            .collect();
        self.ref_lists.push(AnnotationSetRefList { lists })
    }

    /// Items of `set`, in stored order.
    pub fn set_items(&self, set: ItemId<AnnotationSet>) -> BlockResult<Vec<&AnnotationItem>>
    {
        let set = self.sets.item(set)?;
        let mut items = Vec::with_capacity(set.entries.len());
        for e in &set.entries
        {
            if let Some(item) = e.item(&self.items)?
            {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Attaches `set` to `field` in the directory of `class`.
    ///
    /// The field must be declared by `class`; anything else is a usage error.
    pub fn attach_field(
        &mut self,
        ids: &IdPools,
        directory: ItemId<AnnotationsDirectory>,
        class: &str,
        field: ItemId<FieldId>,
        set: ItemId<AnnotationSet>,
    ) -> BlockResult<()>
    {
        let key = ids.field_key(field)?;
        if key.class != class
        {
            return Err(class_mismatch(class, &key.class));
        }
        let dir = self.directories.item_mut(directory)?;
        dir.fields.push(FieldAnnotation {
            field: IndexReference::to(RefWidth::Int, field),
            annotations: OffsetReference::to(RefWidth::Int, set),
        });
        Ok(())
    }

    pub fn attach_method(
        &mut self,
        ids: &IdPools,
        directory: ItemId<AnnotationsDirectory>,
        class: &str,
        method: ItemId<MethodId>,
        set: ItemId<AnnotationSet>,
    ) -> BlockResult<()>
    {
        let key = ids.method_key(method)?;
        if key.class != class
        {
            return Err(class_mismatch(class, &key.class));
        }
        let dir = self.directories.item_mut(directory)?;
        dir.methods.push(MethodAnnotation {
            method: IndexReference::to(RefWidth::Int, method),
            annotations: OffsetReference::to(RefWidth::Int, set),
        });
        Ok(())
    }

    pub fn attach_parameters(
        &mut self,
        ids: &IdPools,
        directory: ItemId<AnnotationsDirectory>,
        class: &str,
        method: ItemId<MethodId>,
        list: ItemId<AnnotationSetRefList>,
    ) -> BlockResult<()>
    {
        let key = ids.method_key(method)?;
        if key.class != class
        {
            return Err(class_mismatch(class, &key.class));
        }
        let dir = self.directories.item_mut(directory)?;
        dir.parameters.push(ParameterAnnotation {
            method: IndexReference::to(RefWidth::Int, method),
            annotations: OffsetReference::to(RefWidth::Int, list),
        });
        Ok(())
    }

    /// Binds every stored offset and index while the written layout is still current.
    pub(crate) fn bind(&self, ids: &IdPools) -> BlockResult<()>
    {
        for item in self.items.iter()
        {
            item.annotation.bind(ids)?;
        }
        for set in self.sets.iter()
        {
            for e in &set.entries
            {
                e.get(&self.items)?;
            }
        }
        for list in self.ref_lists.iter()
        {
            for l in &list.lists
            {
                l.get(&self.sets)?;
            }
        }
        for dir in self.directories.iter()
        {
            dir.class_annotations.get(&self.sets)?;
            for f in &dir.fields
            {
                f.field.get(&ids.fields)?;
                f.annotations.get(&self.sets)?;
            }
            for m in &dir.methods
            {
                m.method.get(&ids.methods)?;
                m.annotations.get(&self.sets)?;
            }
            for p in &dir.parameters
            {
                p.method.get(&ids.methods)?;
                p.annotations.get(&self.ref_lists)?;
            }
        }
        Ok(())
    }

    /// Restores the orderings the format requires: annotation elements by name,
    /// set entries by type, and directory members by field or method index.
    pub(crate) fn sort(&mut self, ids: &IdPools) -> BlockResult<()>
    {
        self.bind(ids)?;
        for item in self.items.ids()
        {
            let item = self.items.item_mut(item)?;
            item.annotation.sort_elements_by(|name| name.index(&ids.strings).ok().flatten().unwrap_or(usize::MAX));
        }
        let items = &self.items;
        let type_index = |e: &OffsetReference<AnnotationItem>| -> usize {
            match e.item(items)
            {
                Ok(Some(item)) => item.annotation.annotation_type.index(&ids.types).ok().flatten().unwrap_or(usize::MAX),
                _ => usize::MAX,
            }
        };
        self.sets.for_each_mut(|set| set.entries.sort_by_key(|e| type_index(e)));
        self.directories.for_each_mut(|dir| {
            let field_index = |r: &IndexReference<FieldId>| r.index(&ids.fields).ok().flatten().unwrap_or(usize::MAX);
            let method_index = |r: &IndexReference<MethodId>| r.index(&ids.methods).ok().flatten().unwrap_or(usize::MAX);
            dir.fields.sort_by_key(|f| field_index(&f.field));
            dir.methods.sort_by_key(|m| method_index(&m.method));
            dir.parameters.sort_by_key(|p| method_index(&p.method));
        });
        Ok(())
    }

    /// Rewrites identifier indices; offsets are refreshed after layout.
    pub(crate) fn refresh_indices(&self, ids: &IdPools) -> BlockResult<()>
    {
        for (i, item) in self.items.iter().enumerate()
        {
            item.annotation.refresh(ids).map_err(|e| err!(e, "annotation_item {}", i))?;
        }
        for dir in self.directories.iter()
        {
            for f in &dir.fields
            {
                f.field.refresh(&ids.fields)?;
            }
            for m in &dir.methods
            {
                m.method.refresh(&ids.methods)?;
            }
            for p in &dir.parameters
            {
                p.method.refresh(&ids.methods)?;
            }
        }
        Ok(())
    }

    pub(crate) fn refresh_offsets(&self) -> BlockResult<()>
    {
        for set in self.sets.iter()
        {
            for e in &set.entries
            {
                e.refresh(&self.items)?;
            }
        }
        for list in self.ref_lists.iter()
        {
            for l in &list.lists
            {
                l.refresh(&self.sets)?;
            }
        }
        for dir in self.directories.iter()
        {
            dir.class_annotations.refresh(&self.sets)?;
            for f in &dir.fields
            {
                f.annotations.refresh(&self.sets)?;
            }
            for m in &dir.methods
            {
                m.annotations.refresh(&self.sets)?;
            }
            for p in &dir.parameters
            {
                p.annotations.refresh(&self.ref_lists)?;
            }
        }
        Ok(())
    }

    pub(crate) fn commit_order(&mut self)
    {
        self.items.commit_order();
        self.sets.commit_order();
        self.ref_lists.commit_order();
        self.directories.commit_order();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::key::{FieldKey, MethodKey, ProtoKey};

    fn annotation(ids: &mut IdPools, descriptor: &str) -> EncodedAnnotation {
        let t = ids.get_or_create_type(descriptor);
        EncodedAnnotation { annotation_type: IndexReference::to(RefWidth::Uleb, t), elements: vec![] }
    }

    #[test]
    fn directory_round_trips() {
        let directory = AnnotationsDirectory::read(&mut BlockReader::new(&[
            0x10, 0, 0, 0, // class annotations
            1, 0, 0, 0, // fields
            0, 0, 0, 0, // methods
            1, 0, 0, 0, // parameters
            2, 0, 0, 0, 0x20, 0, 0, 0, //
            5, 0, 0, 0, 0x30, 0, 0, 0,
        ]))
        .unwrap();
        assert_eq!(directory.fields.len(), 1);
        assert_eq!(directory.parameters[0].method.stored(), 5);
        let mut writer = BlockWriter::new();
        assert_eq!(directory.write(&mut writer), directory.byte_len());
        assert_eq!(writer.position(), 32);
    }

    #[test]
    fn set_entries_sort_by_type() {
        let mut ids = IdPools::default();
        let b = annotation(&mut ids, "LB;");
        let a = annotation(&mut ids, "LA;");
        let mut pools = AnnotationPools::default();
        let first = pools.add_item(VISIBILITY_RUNTIME, b);
        let second = pools.add_item(VISIBILITY_BUILD, a);
        let set = pools.add_set(&[first, second]);
        ids.sort().unwrap();
        pools.sort(&ids).unwrap();
        let items = pools.set_items(set).unwrap();
        assert_eq!(items[0].annotation.type_descriptor(&ids).unwrap(), "LA;");
        assert_eq!(visibility_name(items[1].visibility), "runtime");
    }

    #[test]
    fn foreign_member_is_usage_error() {
        let mut ids = IdPools::default();
        let own = ids.get_or_create_field(&FieldKey::new("LOwner;", "x", "I"));
        let foreign = ids.get_or_create_method(&MethodKey::new("LOther;", "run", ProtoKey::new(vec![], "V")));
        let mut pools = AnnotationPools::default();
        let item = pools.add_item(VISIBILITY_RUNTIME, annotation(&mut ids, "LAnno;"));
        let set = pools.add_set(&[item]);
        let directory = pools.directories.push(AnnotationsDirectory::default());
        pools.attach_field(&ids, directory, "LOwner;", own, set).unwrap();
        let e = pools.attach_method(&ids, directory, "LOwner;", foreign, set).unwrap_err();
        assert!(e.is_usage());
        assert_eq!(pools.directories.item(directory).unwrap().methods.len(), 0);
    }
}
