/* Identifier sections: strings, types, prototypes, fields and methods */

use std::borrow::Cow;
use std::cmp::Ordering;

use cesu8::{from_java_cesu8, to_java_cesu8};
use log::warn;

use crate::block::error::{BlockError, BlockResult};
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::leb::uleb128_len;
use crate::block::pool::{Interned, ItemId, Pool};
use crate::block::reference::{IndexReference, OffsetReference, RefWidth};
use crate::block::Block;
use crate::dex::key::{FieldKey, MethodKey, ProtoKey};

/// A `string_data_item`: utf16 length followed by MUTF-8 bytes.
///
/// Bytes that are not valid MUTF-8 are kept as read and written back untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StringData
{
    text: String,
    raw: Option<Vec<u8>>,
}

impl StringData
{
    pub fn new(text: &str) -> StringData
    {
        StringData { text: text.to_string(), raw: None }
    }

    pub fn text(&self) -> &str
    {
        &self.text
    }

    pub fn set_text(&mut self, text: &str)
    {
        self.text = text.to_string();
        self.raw = None;
    }

    pub fn is_decoded(&self) -> bool
    {
        self.raw.is_none()
    }

    pub fn read_from(reader: &mut BlockReader<'_>) -> BlockResult<StringData>
    {
        let mut s = StringData::default();
        s.read(reader)?;
        Ok(s)
    }

    fn encoded(&self) -> Cow<'_, [u8]>
    {
        to_java_cesu8(&self.text)
    }

    /// Dex string order: by UTF-16 code units.
    pub fn compare(&self, other: &StringData) -> Ordering
    {
        self.text.encode_utf16().cmp(other.text.encode_utf16())
    }
}

impl Interned for StringData
{
    fn intern_key(&self) -> &str
    {
        &self.text
    }
}

impl Block for StringData
{
    fn read(&mut self, reader: &mut BlockReader<'_>) -> BlockResult<()>
    {
        let start = reader.position();
        let utf16_len = reader.read_uleb128()?;
        let data_start = reader.position();
        while reader.read_u8()? != 0 {}
        let end = reader.position();
        let data = &reader.data()[data_start..end - 1];
        match from_java_cesu8(data)
        {
            Ok(text) => {
                self.text = text.into_owned();
                self.raw = None;
                if self.text.encode_utf16().count() != utf16_len as usize
                {
                    warn!("string at 0x{:x} declares {} utf16 units", start, utf16_len);
                    self.raw = Some(reader.data()[start..end].to_vec());
                }
            }
            Err(_) => {
                warn!("string at 0x{:x} is not valid MUTF-8, keeping raw bytes", start);
                self.text = String::from_utf8_lossy(data).into_owned();
                self.raw = Some(reader.data()[start..end].to_vec());
            }
        }
        Ok(())
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()>
    {
        match &self.raw
        {
            Some(raw) => {
                writer.write_bytes(raw);
            }
            None => {
                writer.write_uleb128(self.text.encode_utf16().count() as u32);
                writer.write_bytes(&self.encoded());
                writer.write_u8(0);
            }
        }
        Ok(())
    }

    fn byte_len(&self) -> usize
    {
        match &self.raw
        {
            Some(raw) => raw.len(),
            None => uleb128_len(self.text.encode_utf16().count() as u32) + self.encoded().len() + 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypeId
{
    pub descriptor: IndexReference<StringData>,
}

impl TypeId
{
    pub fn new(descriptor: ItemId<StringData>) -> TypeId
    {
        TypeId { descriptor: IndexReference::to(RefWidth::Int, descriptor) }
    }

    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<TypeId>
    {
        Ok(TypeId { descriptor: IndexReference::read(RefWidth::Int, reader)? })
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        self.descriptor.write(writer)
    }
}

#[derive(Debug, Clone)]
pub struct ProtoId
{
    pub shorty: IndexReference<StringData>,
    pub return_type: IndexReference<TypeId>,
    pub parameters: OffsetReference<TypeList>,
}

impl ProtoId
{
    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<ProtoId>
    {
        Ok(ProtoId {
            shorty: IndexReference::read(RefWidth::Int, reader)?,
            return_type: IndexReference::read(RefWidth::Int, reader)?,
            parameters: OffsetReference::read(RefWidth::Int, reader)?,
        })
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        self.shorty.write(writer) + self.return_type.write(writer) + self.parameters.write(writer)
    }
}

#[derive(Debug, Clone)]
pub struct FieldId
{
    pub class: IndexReference<TypeId>,
    pub field_type: IndexReference<TypeId>,
    pub name: IndexReference<StringData>,
}

impl FieldId
{
    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<FieldId>
    {
        Ok(FieldId {
            class: IndexReference::read(RefWidth::Short, reader)?,
            field_type: IndexReference::read(RefWidth::Short, reader)?,
            name: IndexReference::read(RefWidth::Int, reader)?,
        })
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        self.class.write(writer) + self.field_type.write(writer) + self.name.write(writer)
    }
}

#[derive(Debug, Clone)]
pub struct MethodId
{
    pub class: IndexReference<TypeId>,
    pub proto: IndexReference<ProtoId>,
    pub name: IndexReference<StringData>,
}

impl MethodId
{
    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<MethodId>
    {
        Ok(MethodId {
            class: IndexReference::read(RefWidth::Short, reader)?,
            proto: IndexReference::read(RefWidth::Short, reader)?,
            name: IndexReference::read(RefWidth::Int, reader)?,
        })
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        self.class.write(writer) + self.proto.write(writer) + self.name.write(writer)
    }
}

/// A `type_list`: u32 count then one u16 type index per entry.
#[derive(Debug, Clone, Default)]
pub struct TypeList
{
    pub types: Vec<IndexReference<TypeId>>,
}

impl TypeList
{
    pub fn read_from(reader: &mut BlockReader<'_>) -> BlockResult<TypeList>
    {
        let mut list = TypeList::default();
        list.read(reader)?;
        Ok(list)
    }
}

impl Block for TypeList
{
    fn read(&mut self, reader: &mut BlockReader<'_>) -> BlockResult<()>
    {
        let size = reader.read_u32()?;
        self.types.clear();
        for _ in 0..size
        {
            self.types.push(IndexReference::read(RefWidth::Short, reader)?);
        }
        Ok(())
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()>
    {
        writer.write_u32(self.types.len() as u32);
        for t in &self.types
        {
            t.write(writer);
        }
        Ok(())
    }

    fn byte_len(&self) -> usize
    {
        4 + 2 * self.types.len()
    }
}

/// The five index-addressed identifier pools, plus the type lists prototypes point at.
#[derive(Debug, Clone, Default)]
pub struct IdPools
{
    pub strings: Pool<StringData>,
    pub types: Pool<TypeId>,
    pub protos: Pool<ProtoId>,
    pub fields: Pool<FieldId>,
    pub methods: Pool<MethodId>,
    pub type_lists: Pool<TypeList>,
}

impl IdPools
{
    pub fn string(&self, reference: &IndexReference<StringData>) -> BlockResult<&str>
    {
        Ok(reference.require_item(&self.strings)?.text())
    }

    pub fn optional_string(&self, reference: &IndexReference<StringData>) -> BlockResult<Option<&str>>
    {
        Ok(reference.item(&self.strings)?.map(|s| s.text()))
    }

    pub fn type_descriptor(&self, reference: &IndexReference<TypeId>) -> BlockResult<&str>
    {
        let type_id = reference.require_item(&self.types)?;
        self.string(&type_id.descriptor)
    }

    pub fn optional_type(&self, reference: &IndexReference<TypeId>) -> BlockResult<Option<&str>>
    {
        match reference.item(&self.types)?
        {
            Some(t) => Ok(Some(self.string(&t.descriptor)?)),
            None => Ok(None),
        }
    }

    pub fn type_list(&self, reference: &OffsetReference<TypeList>) -> BlockResult<Vec<String>>
    {
        match reference.item(&self.type_lists)?
        {
            Some(list) => list.types.iter().map(|t| self.type_descriptor(t).map(str::to_string)).collect(),
            None => Ok(Vec::new()),
        }
    }

    pub fn proto_key(&self, id: ItemId<ProtoId>) -> BlockResult<ProtoKey>
    {
        let proto = self.protos.item(id)?;
        Ok(ProtoKey {
            parameters: self.type_list(&proto.parameters)?,
            return_type: self.type_descriptor(&proto.return_type)?.to_string(),
        })
    }

    pub fn field_key(&self, id: ItemId<FieldId>) -> BlockResult<FieldKey>
    {
        let field = self.fields.item(id)?;
        Ok(FieldKey {
            class: self.type_descriptor(&field.class)?.to_string(),
            name: self.string(&field.name)?.to_string(),
            field_type: self.type_descriptor(&field.field_type)?.to_string(),
        })
    }

    /// The method's `Lcls;->name(params)ret` key, rebuilt from its current references.
    pub fn method_key(&self, id: ItemId<MethodId>) -> BlockResult<MethodKey>
    {
        let method = self.methods.item(id)?;
        Ok(MethodKey {
            class: self.type_descriptor(&method.class)?.to_string(),
            name: self.string(&method.name)?.to_string(),
            proto: self.proto_key(method.proto.require(&self.protos)?)?,
        })
    }

    pub fn find_string(&self, text: &str) -> Option<ItemId<StringData>>
    {
        self.strings.find_key(text)
    }

    pub fn get_or_create_string(&mut self, text: &str) -> ItemId<StringData>
    {
        self.strings.get_or_create_with(text, || StringData::new(text))
    }

    pub fn find_type(&self, descriptor: &str) -> Option<ItemId<TypeId>>
    {
        let string = self.find_string(descriptor)?;
        self.types.find(|t| t.descriptor.get(&self.strings).ok().flatten() == Some(string))
    }

    pub fn get_or_create_type(&mut self, descriptor: &str) -> ItemId<TypeId>
    {
        if let Some(id) = self.find_type(descriptor)
        {
            return id;
        }
        let string = self.get_or_create_string(descriptor);
        self.types.push(TypeId::new(string))
    }

    fn find_type_list(&self, types: &[ItemId<TypeId>]) -> Option<ItemId<TypeList>>
    {
        self.type_lists.find(|list| {
            list.types.len() == types.len()
                && list.types.iter().zip(types).all(|(r, t)| r.get(&self.types).ok().flatten() == Some(*t))
        })
    }

    /// Returns a type list equal to `descriptors`, or `None` for an empty list.
    pub fn get_or_create_type_list(&mut self, descriptors: &[String]) -> Option<ItemId<TypeList>>
    {
        if descriptors.is_empty()
        {
            return None;
        }
        let types: Vec<ItemId<TypeId>> = descriptors.iter().map(|d| self.get_or_create_type(d)).collect();
        if let Some(id) = self.find_type_list(&types)
        {
            return Some(id);
        }
        let list = TypeList { types: types.into_iter().map(|t| IndexReference::to(RefWidth::Short, t)).collect() };
        Some(self.type_lists.push(list))
    }

    pub fn find_proto(&self, key: &ProtoKey) -> Option<ItemId<ProtoId>>
    {
        let ids = self.protos.ids();
        ids.into_iter().find(|id| self.proto_key(*id).map_or(false, |k| &k == key))
    }

    pub fn get_or_create_proto(&mut self, key: &ProtoKey) -> ItemId<ProtoId>
    {
        if let Some(id) = self.find_proto(key)
        {
            return id;
        }
        let shorty = self.get_or_create_string(&key.shorty());
        let return_type = self.get_or_create_type(&key.return_type);
        let parameters = match self.get_or_create_type_list(&key.parameters)
        {
            Some(list) => OffsetReference::to(RefWidth::Int, list),
            None => OffsetReference::new(RefWidth::Int),
        };
        self.protos.push(ProtoId {
            shorty: IndexReference::to(RefWidth::Int, shorty),
            return_type: IndexReference::to(RefWidth::Int, return_type),
            parameters,
        })
    }

    pub fn find_field(&self, key: &FieldKey) -> Option<ItemId<FieldId>>
    {
        self.fields.ids().into_iter().find(|id| self.field_key(*id).map_or(false, |k| &k == key))
    }

    pub fn get_or_create_field(&mut self, key: &FieldKey) -> ItemId<FieldId>
    {
        if let Some(id) = self.find_field(key)
        {
            return id;
        }
        let class = self.get_or_create_type(&key.class);
        let field_type = self.get_or_create_type(&key.field_type);
        let name = self.get_or_create_string(&key.name);
        self.fields.push(FieldId {
            class: IndexReference::to(RefWidth::Short, class),
            field_type: IndexReference::to(RefWidth::Short, field_type),
            name: IndexReference::to(RefWidth::Int, name),
        })
    }

    pub fn find_method(&self, key: &MethodKey) -> Option<ItemId<MethodId>>
    {
        self.methods.ids().into_iter().find(|id| self.method_key(*id).map_or(false, |k| &k == key))
    }

    pub fn get_or_create_method(&mut self, key: &MethodKey) -> ItemId<MethodId>
    {
        if let Some(id) = self.find_method(key)
        {
            return id;
        }
        let class = self.get_or_create_type(&key.class);
        let proto = self.get_or_create_proto(&key.proto);
        let name = self.get_or_create_string(&key.name);
        self.methods.push(MethodId {
            class: IndexReference::to(RefWidth::Short, class),
            proto: IndexReference::to(RefWidth::Short, proto),
            name: IndexReference::to(RefWidth::Int, name),
        })
    }

    /// Rewrites every index stored in the identifier records themselves.
    pub fn refresh_references(&self) -> BlockResult<()>
    {
        for (i, t) in self.types.iter().enumerate()
        {
            t.descriptor.refresh(&self.strings).map_err(|e| err!(e, "type_id {}", i))?;
        }
        for (i, p) in self.protos.iter().enumerate()
        {
            p.shorty.refresh(&self.strings).map_err(|e| err!(e, "proto_id {}", i))?;
            p.return_type.refresh(&self.types).map_err(|e| err!(e, "proto_id {}", i))?;
        }
        for (i, f) in self.fields.iter().enumerate()
        {
            f.class.refresh(&self.types).map_err(|e| err!(e, "field_id {}", i))?;
            f.field_type.refresh(&self.types).map_err(|e| err!(e, "field_id {}", i))?;
            f.name.refresh(&self.strings).map_err(|e| err!(e, "field_id {}", i))?;
        }
        for (i, m) in self.methods.iter().enumerate()
        {
            m.class.refresh(&self.types).map_err(|e| err!(e, "method_id {}", i))?;
            m.proto.refresh(&self.protos).map_err(|e| err!(e, "method_id {}", i))?;
            m.name.refresh(&self.strings).map_err(|e| err!(e, "method_id {}", i))?;
        }
        for list in self.type_lists.iter()
        {
            for t in &list.types
            {
                t.refresh(&self.types)?;
            }
        }
        Ok(())
    }

    /// Sorts the identifier pools into the order the format requires.
    ///
    /// Strings by UTF-16 code units, types by descriptor index, prototypes by
    /// return type then parameters, fields and methods by class, name and type.
    pub fn sort(&mut self) -> BlockResult<()>
    {
        self.bind_all()?;
        self.strings.sort_by(|a, b| a.compare(b));
        let strings = &self.strings;
        self.types.sort_by(|a, b| index_or_max(&a.descriptor, strings).cmp(&index_or_max(&b.descriptor, strings)));
        let types = &self.types;
        let type_lists = &self.type_lists;
        let list_indices = |p: &ProtoId| -> Vec<usize> {
            match p.parameters.item(type_lists)
            {
                Ok(Some(list)) => list.types.iter().map(|t| index_or_max(t, types)).collect(),
                _ => Vec::new(),
            }
        };
        self.protos.sort_by(|a, b| {
            index_or_max(&a.return_type, types)
                .cmp(&index_or_max(&b.return_type, types))
                .then_with(|| list_indices(a).cmp(&list_indices(b)))
        });
        self.fields.sort_by(|a, b| {
            index_or_max(&a.class, types)
                .cmp(&index_or_max(&b.class, types))
                .then_with(|| index_or_max(&a.name, strings).cmp(&index_or_max(&b.name, strings)))
                .then_with(|| index_or_max(&a.field_type, types).cmp(&index_or_max(&b.field_type, types)))
        });
        let protos = &self.protos;
        self.methods.sort_by(|a, b| {
            index_or_max(&a.class, types)
                .cmp(&index_or_max(&b.class, types))
                .then_with(|| index_or_max(&a.name, strings).cmp(&index_or_max(&b.name, strings)))
                .then_with(|| index_or_max(&a.proto, protos).cmp(&index_or_max(&b.proto, protos)))
        });
        Ok(())
    }

    /// Binds every raw index held by the identifier records before any pool moves.
    fn bind_all(&self) -> BlockResult<()>
    {
        for t in self.types.iter()
        {
            t.descriptor.get(&self.strings)?;
        }
        for p in self.protos.iter()
        {
            p.shorty.get(&self.strings)?;
            p.return_type.get(&self.types)?;
            p.parameters.get(&self.type_lists)?;
        }
        for f in self.fields.iter()
        {
            f.class.get(&self.types)?;
            f.field_type.get(&self.types)?;
            f.name.get(&self.strings)?;
        }
        for m in self.methods.iter()
        {
            m.class.get(&self.types)?;
            m.proto.get(&self.protos)?;
            m.name.get(&self.strings)?;
        }
        for list in self.type_lists.iter()
        {
            for t in &list.types
            {
                t.get(&self.types)?;
            }
        }
        Ok(())
    }

    pub fn commit_order(&mut self)
    {
        self.strings.commit_order();
        self.types.commit_order();
        self.protos.commit_order();
        self.fields.commit_order();
        self.methods.commit_order();
        self.type_lists.commit_order();
    }
}

fn index_or_max<T>(reference: &IndexReference<T>, pool: &Pool<T>) -> usize
{
    reference.index(pool).ok().flatten().unwrap_or(usize::MAX)
}

/// Usage error for a key whose class does not match the slot it is bound into.
pub(crate) fn class_mismatch(expected: &str, found: &str) -> BlockError
{
    BlockError::usage(format!("member of {} cannot be attached to {}", found, expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_data_round_trips_mutf8() {
        let mut s = StringData::new("h\u{e9}llo\u{0}\u{1F600}");
        let mut writer = BlockWriter::new();
        s.write(&mut writer).unwrap();
        assert_eq!(writer.position(), s.byte_len());
        let bytes = writer.into_bytes();
        // NUL is two bytes in MUTF-8 and the emoji is a surrogate pair of three bytes each.
        assert_eq!(bytes[0], 8);
        let back = StringData::read_from(&mut BlockReader::new(&bytes)).unwrap();
        assert_eq!(back.text(), s.text());
        assert!(back.is_decoded());
        s.set_text("x");
        assert_eq!(s.byte_len(), 3);
    }

    #[test]
    fn get_or_create_deduplicates() {
        let mut pools = IdPools::default();
        let a = pools.get_or_create_type("Ljava/lang/Object;");
        let b = pools.get_or_create_type("Ljava/lang/Object;");
        assert_eq!(a, b);
        assert_eq!(pools.types.len(), 1);
        assert_eq!(pools.strings.len(), 1);

        let key = MethodKey::new("LFoo;", "run", ProtoKey::new(vec!["I".to_string()], "V"));
        let m1 = pools.get_or_create_method(&key);
        let m2 = pools.get_or_create_method(&key);
        assert_eq!(m1, m2);
        assert_eq!(pools.methods.len(), 1);
        assert_eq!(pools.protos.len(), 1);
        assert_eq!(pools.method_key(m1).unwrap(), key);
    }

    #[test]
    fn method_key_follows_rebinding() {
        let mut pools = IdPools::default();
        let key = MethodKey::new("LFoo;", "run", ProtoKey::new(vec![], "V"));
        let method = pools.get_or_create_method(&key);
        let bar = pools.get_or_create_type("LBar;");
        let name = pools.get_or_create_string("walk");
        let item = pools.methods.item_mut(method).unwrap();
        item.class.set(Some(bar));
        item.name.set(Some(name));
        assert_eq!(pools.method_key(method).unwrap().to_string(), "LBar;->walk()V");
    }

    #[test]
    fn sort_orders_by_utf16_and_indices() {
        let mut pools = IdPools::default();
        let f = pools.get_or_create_field(&FieldKey::new("LB;", "z", "I"));
        let g = pools.get_or_create_field(&FieldKey::new("LA;", "y", "I"));
        pools.sort().unwrap();
        let texts: Vec<&str> = pools.strings.iter().map(|s| s.text()).collect();
        let mut sorted = texts.clone();
        sorted.sort();
        assert_eq!(texts, sorted);
        assert_eq!(pools.fields.index_of(g), Some(0));
        assert_eq!(pools.fields.index_of(f), Some(1));
        pools.refresh_references().unwrap();
        pools.commit_order();
        assert_eq!(pools.field_key(f).unwrap().to_string(), "LB;->z:I");
    }
}
