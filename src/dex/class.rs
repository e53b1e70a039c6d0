/* class_def_item and class_data_item */

use crate::block::error::{BlockError, BlockResult};
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::leb::uleb128_len;
use crate::block::pool::ItemId;
use crate::block::reference::{IndexReference, OffsetReference, RefWidth, NO_INDEX};
use crate::dex::annotation::AnnotationsDirectory;
use crate::dex::code::CodeItem;
use crate::dex::ids::{FieldId, IdPools, MethodId, StringData, TypeId, TypeList};
use crate::dex::value::{default_for, EncodedArray, EncodedValue};

pub const ACC_PUBLIC: u32 = 0x1;
pub const ACC_PRIVATE: u32 = 0x2;
pub const ACC_PROTECTED: u32 = 0x4;
pub const ACC_STATIC: u32 = 0x8;
pub const ACC_FINAL: u32 = 0x10;
pub const ACC_SYNCHRONIZED: u32 = 0x20;
pub const ACC_VOLATILE: u32 = 0x40;
pub const ACC_BRIDGE: u32 = 0x40;
pub const ACC_TRANSIENT: u32 = 0x80;
pub const ACC_VARARGS: u32 = 0x80;
pub const ACC_NATIVE: u32 = 0x100;
pub const ACC_INTERFACE: u32 = 0x200;
pub const ACC_ABSTRACT: u32 = 0x400;
pub const ACC_STRICT: u32 = 0x800;
pub const ACC_SYNTHETIC: u32 = 0x1000;
pub const ACC_ANNOTATION: u32 = 0x2000;
pub const ACC_ENUM: u32 = 0x4000;
pub const ACC_CONSTRUCTOR: u32 = 0x10000;
pub const ACC_DECLARED_SYNCHRONIZED: u32 = 0x20000;

/// What an access flag word belongs to; bits 0x40 and 0x80 mean different things per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind
{
    Class,
    Field,
    Method,
}

const ACCESS_NAMES: [(u32, &str); 19] = [
    (ACC_PUBLIC, "public"),
    (ACC_PRIVATE, "private"),
    (ACC_PROTECTED, "protected"),
    (ACC_STATIC, "static"),
    (ACC_FINAL, "final"),
    (ACC_SYNCHRONIZED, "synchronized"),
    (ACC_VOLATILE, "volatile"),
    (ACC_BRIDGE, "bridge"),
    (ACC_TRANSIENT, "transient"),
    (ACC_VARARGS, "varargs"),
    (ACC_NATIVE, "native"),
    (ACC_INTERFACE, "interface"),
    (ACC_ABSTRACT, "abstract"),
    (ACC_STRICT, "strictfp"),
    (ACC_SYNTHETIC, "synthetic"),
    (ACC_ANNOTATION, "annotation"),
    (ACC_ENUM, "enum"),
    (ACC_CONSTRUCTOR, "constructor"),
    (ACC_DECLARED_SYNCHRONIZED, "declared-synchronized"),
];

fn applies(name: &str, kind: MemberKind) -> bool
{
    match name
    {
        "volatile" | "transient" => kind == MemberKind::Field,
        "bridge" | "varargs" | "native" | "constructor" | "declared-synchronized" | "synchronized" => kind == MemberKind::Method,
        "interface" | "annotation" => kind == MemberKind::Class,
        _ => true,
    }
}

/// Modifier keywords set in `flags`, in canonical order.
pub fn access_names(flags: u32, kind: MemberKind) -> Vec<&'static str>
{
    ACCESS_NAMES
        .iter()
        .filter(|(bit, name)| flags & bit != 0 && applies(name, kind))
        .map(|(_, name)| *name)
        .collect()
}

pub fn access_flag(name: &str) -> Option<u32>
{
    ACCESS_NAMES.iter().find(|(_, n)| *n == name).map(|(bit, _)| *bit)
}

/// A `class_def_item`.
#[derive(Debug, Clone)]
pub struct ClassDef
{
    pub class_type: IndexReference<TypeId>,
    pub access_flags: u32,
    pub superclass: IndexReference<TypeId>,
    pub interfaces: OffsetReference<TypeList>,
    pub source_file: IndexReference<StringData>,
    pub annotations: OffsetReference<AnnotationsDirectory>,
    pub class_data: OffsetReference<ClassData>,
    pub static_values: OffsetReference<EncodedArray>,
}

impl ClassDef
{
    pub const SIZE: usize = 32;

    pub fn new(class_type: ItemId<TypeId>, access_flags: u32) -> ClassDef
    {
        ClassDef {
            class_type: IndexReference::to(RefWidth::Int, class_type),
            access_flags,
            superclass: IndexReference::from_raw(RefWidth::Int, NO_INDEX),
            interfaces: OffsetReference::new(RefWidth::Int),
            source_file: IndexReference::from_raw(RefWidth::Int, NO_INDEX),
            annotations: OffsetReference::new(RefWidth::Int),
            class_data: OffsetReference::new(RefWidth::Int),
            static_values: OffsetReference::new(RefWidth::Int),
        }
    }

    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<ClassDef>
    {
        Ok(ClassDef {
            class_type: IndexReference::read(RefWidth::Int, reader)?,
            access_flags: reader.read_u32()?,
            superclass: IndexReference::read(RefWidth::Int, reader)?,
            interfaces: OffsetReference::read(RefWidth::Int, reader)?,
            source_file: IndexReference::read(RefWidth::Int, reader)?,
            annotations: OffsetReference::read(RefWidth::Int, reader)?,
            class_data: OffsetReference::read(RefWidth::Int, reader)?,
            static_values: OffsetReference::read(RefWidth::Int, reader)?,
        })
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        self.class_type.write(writer)
            + writer.write_u32(self.access_flags)
            + self.superclass.write(writer)
            + self.interfaces.write(writer)
            + self.source_file.write(writer)
            + self.annotations.write(writer)
            + self.class_data.write(writer)
            + self.static_values.write(writer)
    }

    pub(crate) fn bind(&self, ids: &IdPools) -> BlockResult<()>
    {
        self.class_type.get(&ids.types)?;
        self.superclass.get(&ids.types)?;
        self.source_file.get(&ids.strings)?;
        self.interfaces.get(&ids.type_lists)?;
        Ok(())
    }

    pub(crate) fn refresh_indices(&self, ids: &IdPools) -> BlockResult<()>
    {
        self.class_type.refresh(&ids.types)?;
        self.superclass.refresh(&ids.types)?;
        self.source_file.refresh(&ids.strings)?;
        Ok(())
    }

    pub fn descriptor<'p>(&self, ids: &'p IdPools) -> BlockResult<&'p str>
    {
        ids.type_descriptor(&self.class_type)
    }

    pub fn superclass<'p>(&self, ids: &'p IdPools) -> BlockResult<Option<&'p str>>
    {
        ids.optional_type(&self.superclass)
    }

    pub fn source_file<'p>(&self, ids: &'p IdPools) -> BlockResult<Option<&'p str>>
    {
        ids.optional_string(&self.source_file)
    }
}

#[derive(Debug, Clone)]
pub struct EncodedField
{
    pub field: IndexReference<FieldId>,
    pub access_flags: u32,
}

#[derive(Debug, Clone)]
pub struct EncodedMethod
{
    pub method: IndexReference<MethodId>,
    pub access_flags: u32,
    pub code: OffsetReference<CodeItem>,
}

/// A `class_data_item`. Member indices are held absolute; the diff encoding
/// is applied on write, over members sorted by index.
#[derive(Debug, Clone, Default)]
pub struct ClassData
{
    pub static_fields: Vec<EncodedField>,
    pub instance_fields: Vec<EncodedField>,
    pub direct_methods: Vec<EncodedMethod>,
    pub virtual_methods: Vec<EncodedMethod>,
}

fn read_fields(reader: &mut BlockReader<'_>, count: u32) -> BlockResult<Vec<EncodedField>>
{
    let mut fields = Vec::with_capacity(count.min(0x10000) as usize);
    let mut index = 0u32;
    for _ in 0..count
    {
        index = index.wrapping_add(reader.read_uleb128()?);
        fields.push(EncodedField {
            field: IndexReference::from_raw(RefWidth::Uleb, index),
            access_flags: reader.read_uleb128()?,
        });
    }
    Ok(fields)
}

fn read_methods(reader: &mut BlockReader<'_>, count: u32) -> BlockResult<Vec<EncodedMethod>>
{
    let mut methods = Vec::with_capacity(count.min(0x10000) as usize);
    let mut index = 0u32;
    for _ in 0..count
    {
        index = index.wrapping_add(reader.read_uleb128()?);
        methods.push(EncodedMethod {
            method: IndexReference::from_raw(RefWidth::Uleb, index),
            access_flags: reader.read_uleb128()?,
            code: OffsetReference::read(RefWidth::Uleb, reader)?,
        });
    }
    Ok(methods)
}

fn diffs<I>(stored: I) -> BlockResult<Vec<u32>>
where
    I: Iterator<Item = u32>,
{
    let mut previous = None;
    let mut out = Vec::new();
    for index in stored
    {
        let diff = match previous
        {
            None => index,
            Some(p) if index > p => index - p,
            Some(p) => {
                return Err(BlockError::usage(format!("class data member index {} follows {}", index, p)));
            }
        };
        out.push(diff);
        previous = Some(index);
    }
    Ok(out)
}

impl ClassData
{
    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<ClassData>
    {
        let static_count = reader.read_uleb128()?;
        let instance_count = reader.read_uleb128()?;
        let direct_count = reader.read_uleb128()?;
        let virtual_count = reader.read_uleb128()?;
        Ok(ClassData {
            static_fields: read_fields(reader, static_count)?,
            instance_fields: read_fields(reader, instance_count)?,
            direct_methods: read_methods(reader, direct_count)?,
            virtual_methods: read_methods(reader, virtual_count)?,
        })
    }

    pub fn is_empty(&self) -> bool
    {
        self.static_fields.is_empty() && self.instance_fields.is_empty() && self.direct_methods.is_empty() && self.virtual_methods.is_empty()
    }

    pub fn methods(&self) -> impl Iterator<Item = &EncodedMethod>
    {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }

    pub fn fields(&self) -> impl Iterator<Item = &EncodedField>
    {
        self.static_fields.iter().chain(self.instance_fields.iter())
    }

    pub(crate) fn bind(&self, ids: &IdPools) -> BlockResult<()>
    {
        for f in self.fields()
        {
            f.field.get(&ids.fields)?;
        }
        for m in self.methods()
        {
            m.method.get(&ids.methods)?;
        }
        Ok(())
    }

    /// Rewrites member indices and re-sorts each list by its new index.
    ///
    /// `static_values` holds the initial values of the leading static fields
    /// and is permuted along with them.
    pub(crate) fn refresh_indices(&mut self, ids: &IdPools, static_values: Option<&mut EncodedArray>) -> BlockResult<()>
    {
        for f in self.static_fields.iter().chain(self.instance_fields.iter())
        {
            f.field.refresh(&ids.fields)?;
        }
        for m in self.direct_methods.iter().chain(self.virtual_methods.iter())
        {
            m.method.refresh(&ids.methods)?;
        }
        if let Some(array) = static_values
        {
            let mut paired: Vec<(EncodedField, Option<EncodedValue>)> = std::mem::take(&mut self.static_fields)
                .into_iter()
                .zip(std::mem::take(&mut array.values).into_iter().map(Some).chain(std::iter::repeat_with(|| None)))
                .collect();
            paired.sort_by_key(|(f, _)| f.field.stored());
            let last = paired.iter().rposition(|(_, v)| v.is_some()).map_or(0, |p| p + 1);
            for (i, (field, value)) in paired.into_iter().enumerate()
            {
                if i < last
                {
                    let value = match value
                    {
                        Some(v) => v,
                        None => default_for(&ids.field_key(field.field.require(&ids.fields)?)?.field_type),
                    };
                    array.values.push(value);
                }
                self.static_fields.push(field);
            }
        }
        self.static_fields.sort_by_key(|f| f.field.stored());
        self.instance_fields.sort_by_key(|f| f.field.stored());
        self.direct_methods.sort_by_key(|m| m.method.stored());
        self.virtual_methods.sort_by_key(|m| m.method.stored());
        Ok(())
    }

    pub fn byte_len(&self) -> usize
    {
        let mut len = uleb128_len(self.static_fields.len() as u32)
            + uleb128_len(self.instance_fields.len() as u32)
            + uleb128_len(self.direct_methods.len() as u32)
            + uleb128_len(self.virtual_methods.len() as u32);
        for list in [&self.static_fields, &self.instance_fields]
        {
            let ds = diffs(list.iter().map(|f| f.field.stored())).unwrap_or_default();
            len += ds.iter().map(|d| uleb128_len(*d)).sum::<usize>();
            len += list.iter().map(|f| uleb128_len(f.access_flags)).sum::<usize>();
        }
        for list in [&self.direct_methods, &self.virtual_methods]
        {
            let ds = diffs(list.iter().map(|m| m.method.stored())).unwrap_or_default();
            len += ds.iter().map(|d| uleb128_len(*d)).sum::<usize>();
            len += list.iter().map(|m| uleb128_len(m.access_flags) + m.code.byte_len()).sum::<usize>();
        }
        len
    }

    pub fn write(&self, writer: &mut BlockWriter) -> BlockResult<usize>
    {
        let start = writer.position();
        writer.write_uleb128(self.static_fields.len() as u32);
        writer.write_uleb128(self.instance_fields.len() as u32);
        writer.write_uleb128(self.direct_methods.len() as u32);
        writer.write_uleb128(self.virtual_methods.len() as u32);
        for list in [&self.static_fields, &self.instance_fields]
        {
            let ds = diffs(list.iter().map(|f| f.field.stored()))?;
            for (f, d) in list.iter().zip(ds)
            {
                writer.write_uleb128(d);
                writer.write_uleb128(f.access_flags);
            }
        }
        for list in [&self.direct_methods, &self.virtual_methods]
        {
            let ds = diffs(list.iter().map(|m| m.method.stored()))?;
            for (m, d) in list.iter().zip(ds)
            {
                writer.write_uleb128(d);
                writer.write_uleb128(m.access_flags);
                m.code.write(writer);
            }
        }
        Ok(writer.position() - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::key::{FieldKey, MethodKey, ProtoKey};
    use crate::dex::value::DexValue;

    #[test]
    fn access_names_depend_on_member_kind() {
        assert_eq!(access_names(ACC_PUBLIC | ACC_VOLATILE, MemberKind::Field), vec!["public", "volatile"]);
        assert_eq!(access_names(ACC_PUBLIC | ACC_BRIDGE, MemberKind::Method), vec!["public", "bridge"]);
        assert_eq!(access_names(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT, MemberKind::Class), vec!["public", "interface", "abstract"]);
        assert_eq!(access_flag("constructor"), Some(ACC_CONSTRUCTOR));
        assert_eq!(access_flag("nonsense"), None);
    }

    #[test]
    fn class_data_uses_index_diffs() {
        // 1 static field, 0 instance, 2 direct methods, 0 virtual
        let bytes = [1, 0, 2, 0, 3, 0x08, 1, 0x09, 0x00, 4, 0x0a, 0x00];
        let data = ClassData::read(&mut BlockReader::new(&bytes)).unwrap();
        assert_eq!(data.static_fields[0].field.stored(), 3);
        assert_eq!(data.direct_methods[1].method.stored(), 5);
        assert_eq!(data.direct_methods[1].access_flags, ACC_PRIVATE | ACC_STATIC);
        let mut writer = BlockWriter::new();
        assert_eq!(data.write(&mut writer).unwrap(), data.byte_len());
        assert_eq!(writer.as_slice(), &bytes);
    }

    #[test]
    fn members_resort_after_rebinding() {
        let mut ids = IdPools::default();
        let b = ids.get_or_create_method(&MethodKey::new("LA;", "b", ProtoKey::new(vec![], "V")));
        let a = ids.get_or_create_method(&MethodKey::new("LA;", "a", ProtoKey::new(vec![], "V")));
        let f = ids.get_or_create_field(&FieldKey::new("LA;", "x", "I"));
        let mut data = ClassData::default();
        for m in [b, a] {
            data.direct_methods.push(EncodedMethod {
                method: IndexReference::to(RefWidth::Uleb, m),
                access_flags: ACC_PUBLIC,
                code: OffsetReference::new(RefWidth::Uleb),
            });
        }
        data.static_fields.push(EncodedField { field: IndexReference::to(RefWidth::Uleb, f), access_flags: ACC_STATIC });
        ids.sort().unwrap();
        data.refresh_indices(&ids, None).unwrap();
        assert_eq!(ids.method_key(data.direct_methods[0].method.require(&ids.methods).unwrap()).unwrap().name, "a");
        let mut writer = BlockWriter::new();
        assert_eq!(data.write(&mut writer).unwrap(), data.byte_len());
    }

    #[test]
    fn static_values_follow_their_fields() {
        let mut ids = IdPools::default();
        let z = ids.get_or_create_field(&FieldKey::new("LA;", "z", "I"));
        let y = ids.get_or_create_field(&FieldKey::new("LA;", "y", "J"));
        let mut data = ClassData::default();
        for f in [z, y] {
            data.static_fields.push(EncodedField { field: IndexReference::to(RefWidth::Uleb, f), access_flags: ACC_STATIC });
        }
        let mut values = EncodedArray { values: vec![EncodedValue::new(DexValue::Int(7))] };
        ids.sort().unwrap();
        data.refresh_indices(&ids, Some(&mut values)).unwrap();
        // y sorts first and gets its type's default ahead of z's 7
        assert_eq!(values.values.len(), 2);
        assert!(matches!(values.values[0].value(), DexValue::Long(0)));
        assert!(matches!(values.values[1].value(), DexValue::Int(7)));
    }

    #[test]
    fn duplicate_members_cannot_be_written() {
        let mut data = ClassData::default();
        for _ in 0..2 {
            data.static_fields.push(EncodedField { field: IndexReference::from_raw(RefWidth::Uleb, 1), access_flags: 0 });
        }
        assert!(data.write(&mut BlockWriter::new()).unwrap_err().is_usage());
    }
}
