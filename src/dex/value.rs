/* encoded_value, encoded_array and encoded_annotation */

use log::warn;

use crate::block::error::{BlockError, BlockResult};
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::leb::uleb128_len;
use crate::block::primitive::{decode_right_aligned, decode_signed, decode_unsigned, encode_right_aligned, encode_signed, encode_unsigned};
use crate::block::reference::{IndexReference, IntegerReference, IntegerVisitor, RefWidth};
use crate::dex::ids::{FieldId, IdPools, MethodId, ProtoId, StringData, TypeId};

pub const VALUE_BYTE: u8 = 0x00;
pub const VALUE_SHORT: u8 = 0x02;
pub const VALUE_CHAR: u8 = 0x03;
pub const VALUE_INT: u8 = 0x04;
pub const VALUE_LONG: u8 = 0x06;
pub const VALUE_FLOAT: u8 = 0x10;
pub const VALUE_DOUBLE: u8 = 0x11;
pub const VALUE_METHOD_TYPE: u8 = 0x15;
pub const VALUE_METHOD_HANDLE: u8 = 0x16;
pub const VALUE_STRING: u8 = 0x17;
pub const VALUE_TYPE: u8 = 0x18;
pub const VALUE_FIELD: u8 = 0x19;
pub const VALUE_METHOD: u8 = 0x1a;
pub const VALUE_ENUM: u8 = 0x1b;
pub const VALUE_ARRAY: u8 = 0x1c;
pub const VALUE_ANNOTATION: u8 = 0x1d;
pub const VALUE_NULL: u8 = 0x1e;
pub const VALUE_BOOLEAN: u8 = 0x1f;

#[derive(Debug, Clone)]
pub enum DexValue
{
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    MethodType(IndexReference<ProtoId>),
    /// Index into the method handle section, which is kept opaque.
    MethodHandle(u32),
    String(IndexReference<StringData>),
    Type(IndexReference<TypeId>),
    Field(IndexReference<FieldId>),
    Method(IndexReference<MethodId>),
    Enum(IndexReference<FieldId>),
    Array(Vec<EncodedValue>),
    Annotation(EncodedAnnotation),
    Null,
    Boolean(bool),
}

impl DexValue
{
    pub fn value_type(&self) -> u8
    {
        match self
        {
            DexValue::Byte(_) => VALUE_BYTE,
            DexValue::Short(_) => VALUE_SHORT,
            DexValue::Char(_) => VALUE_CHAR,
            DexValue::Int(_) => VALUE_INT,
            DexValue::Long(_) => VALUE_LONG,
            DexValue::Float(_) => VALUE_FLOAT,
            DexValue::Double(_) => VALUE_DOUBLE,
            DexValue::MethodType(_) => VALUE_METHOD_TYPE,
            DexValue::MethodHandle(_) => VALUE_METHOD_HANDLE,
            DexValue::String(_) => VALUE_STRING,
            DexValue::Type(_) => VALUE_TYPE,
            DexValue::Field(_) => VALUE_FIELD,
            DexValue::Method(_) => VALUE_METHOD,
            DexValue::Enum(_) => VALUE_ENUM,
            DexValue::Array(_) => VALUE_ARRAY,
            DexValue::Annotation(_) => VALUE_ANNOTATION,
            DexValue::Null => VALUE_NULL,
            DexValue::Boolean(_) => VALUE_BOOLEAN,
        }
    }

    /// Widest payload the value type allows, in bytes; 0 for types without a payload.
    fn max_width(&self) -> usize
    {
        match self
        {
            DexValue::Byte(_) => 1,
            DexValue::Short(_) | DexValue::Char(_) => 2,
            DexValue::Long(_) | DexValue::Double(_) => 8,
            DexValue::Array(_) | DexValue::Annotation(_) | DexValue::Null | DexValue::Boolean(_) => 0,
            _ => 4,
        }
    }

    fn index(&self) -> Option<u32>
    {
        match self
        {
            DexValue::MethodType(r) => Some(r.stored()),
            DexValue::MethodHandle(i) => Some(*i),
            DexValue::String(r) => Some(r.stored()),
            DexValue::Type(r) => Some(r.stored()),
            DexValue::Field(r) | DexValue::Enum(r) => Some(r.stored()),
            DexValue::Method(r) => Some(r.stored()),
            _ => None,
        }
    }

    /// Shortest payload encoding, at least one byte.
    fn minimal_bytes(&self) -> Vec<u8>
    {
        let width = self.max_width();
        let mut bytes = match self
        {
            DexValue::Byte(v) => vec![*v as u8],
            DexValue::Short(v) => encode_signed(*v as i64, width),
            DexValue::Char(v) => encode_unsigned(*v as u64, width),
            DexValue::Int(v) => encode_signed(*v as i64, width),
            DexValue::Long(v) => encode_signed(*v, width),
            DexValue::Float(v) => encode_right_aligned(v.to_bits() as u64, width),
            DexValue::Double(v) => encode_right_aligned(v.to_bits(), width),
            _ => match self.index()
            {
                Some(index) => encode_unsigned(index as u64, width),
                None => return Vec::new(),
            },
        };
        if bytes.is_empty()
        {
            bytes.push(0);
        }
        bytes
    }

    /// Payload encoded in exactly `width` bytes; `width` must be at least the minimal width.
    fn bytes_with_width(&self, width: usize) -> Vec<u8>
    {
        let max = self.max_width();
        let full: [u8; 8] = match self
        {
            DexValue::Byte(v) => (*v as i64).to_le_bytes(),
            DexValue::Short(v) => (*v as i64).to_le_bytes(),
            DexValue::Char(v) => (*v as u64).to_le_bytes(),
            DexValue::Int(v) => (*v as i64).to_le_bytes(),
            DexValue::Long(v) => v.to_le_bytes(),
            DexValue::Float(v) => {
                return (v.to_bits() as u64).to_le_bytes()[max - width..max].to_vec();
            }
            DexValue::Double(v) => {
                return v.to_bits().to_le_bytes()[max - width..max].to_vec();
            }
            _ => (self.index().unwrap_or(0) as u64).to_le_bytes(),
        };
        full[..width].to_vec()
    }

    fn refresh(&self, pools: &IdPools) -> BlockResult<()>
    {
        match self
        {
            DexValue::MethodType(r) => {
                r.refresh(&pools.protos)?;
            }
            DexValue::String(r) => {
                r.refresh(&pools.strings)?;
            }
            DexValue::Type(r) => {
                r.refresh(&pools.types)?;
            }
            DexValue::Field(r) | DexValue::Enum(r) => {
                r.refresh(&pools.fields)?;
            }
            DexValue::Method(r) => {
                r.refresh(&pools.methods)?;
            }
            DexValue::Array(values) => {
                for v in values
                {
                    v.refresh(pools)?;
                }
            }
            DexValue::Annotation(a) => a.refresh(pools)?,
            _ => {}
        }
        Ok(())
    }

    fn bind(&self, pools: &IdPools) -> BlockResult<()>
    {
        match self
        {
            DexValue::MethodType(r) => {
                r.get(&pools.protos)?;
            }
            DexValue::String(r) => {
                r.get(&pools.strings)?;
            }
            DexValue::Type(r) => {
                r.get(&pools.types)?;
            }
            DexValue::Field(r) | DexValue::Enum(r) => {
                r.get(&pools.fields)?;
            }
            DexValue::Method(r) => {
                r.get(&pools.methods)?;
            }
            DexValue::Array(values) => {
                for v in values
                {
                    v.value.bind(pools)?;
                }
            }
            DexValue::Annotation(a) => a.bind(pools)?,
            _ => {}
        }
        Ok(())
    }
}

/// An `encoded_value` together with the payload width it was read with.
///
/// Values read from a file keep their stored width as long as the value still
/// fits it; values set through [`EncodedValue::set`] use the minimal width.
#[derive(Debug, Clone)]
pub struct EncodedValue
{
    value: DexValue,
    stored_width: Option<u8>,
}

impl EncodedValue
{
    pub fn new(value: DexValue) -> EncodedValue
    {
        EncodedValue { value, stored_width: None }
    }

    pub fn value(&self) -> &DexValue
    {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut DexValue
    {
        self.stored_width = None;
        &mut self.value
    }

    pub fn set(&mut self, value: DexValue)
    {
        self.value = value;
        self.stored_width = None;
    }

    pub fn stored_width(&self) -> Option<u8>
    {
        self.stored_width
    }

    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<EncodedValue>
    {
        let start = reader.position();
        let header = reader.read_u8()?;
        let value_arg = (header >> 5) as usize;
        let value_type = header & 0x1f;
        let size = value_arg + 1;
        let value = match value_type
        {
            VALUE_BYTE => DexValue::Byte(read_payload(reader, size, 1)?[0] as i8),
            VALUE_SHORT => DexValue::Short(decode_signed(read_payload(reader, size, 2)?) as i16),
            VALUE_CHAR => DexValue::Char(decode_unsigned(read_payload(reader, size, 2)?) as u16),
            VALUE_INT => DexValue::Int(decode_signed(read_payload(reader, size, 4)?) as i32),
            VALUE_LONG => DexValue::Long(decode_signed(read_payload(reader, size, 8)?)),
            VALUE_FLOAT => DexValue::Float(f32::from_bits(decode_right_aligned(read_payload(reader, size, 4)?, 4) as u32)),
            VALUE_DOUBLE => DexValue::Double(f64::from_bits(decode_right_aligned(read_payload(reader, size, 8)?, 8))),
            VALUE_METHOD_TYPE => DexValue::MethodType(IndexReference::from_raw(RefWidth::Int, read_index(reader, size)?)),
            VALUE_METHOD_HANDLE => DexValue::MethodHandle(read_index(reader, size)?),
            VALUE_STRING => DexValue::String(IndexReference::from_raw(RefWidth::Int, read_index(reader, size)?)),
            VALUE_TYPE => DexValue::Type(IndexReference::from_raw(RefWidth::Int, read_index(reader, size)?)),
            VALUE_FIELD => DexValue::Field(IndexReference::from_raw(RefWidth::Int, read_index(reader, size)?)),
            VALUE_METHOD => DexValue::Method(IndexReference::from_raw(RefWidth::Int, read_index(reader, size)?)),
            VALUE_ENUM => DexValue::Enum(IndexReference::from_raw(RefWidth::Int, read_index(reader, size)?)),
            VALUE_ARRAY => DexValue::Array(read_array(reader)?),
            VALUE_ANNOTATION => DexValue::Annotation(EncodedAnnotation::read(reader)?),
            VALUE_NULL => DexValue::Null,
            VALUE_BOOLEAN => DexValue::Boolean(value_arg != 0),
            _ => fail!("Unknown encoded value type 0x{:02x} at 0x{:x}", value_type, start),
        };
        let stored_width = if value.max_width() > 0 && value_type != VALUE_BYTE { Some(size as u8) } else { None };
        let encoded = EncodedValue { value, stored_width };
        if let Some(width) = stored_width
        {
            if (width as usize) > encoded.value.minimal_bytes().len()
            {
                warn!("keeping non-minimal {}-byte encoded value at 0x{:x}", width, start);
            }
        }
        Ok(encoded)
    }

    fn payload(&self) -> Vec<u8>
    {
        let minimal = self.value.minimal_bytes();
        match self.stored_width
        {
            Some(width) if (width as usize) > minimal.len() && (width as usize) <= self.value.max_width() => {
                self.value.bytes_with_width(width as usize)
            }
            _ => minimal,
        }
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        let value_type = self.value.value_type();
        match &self.value
        {
            DexValue::Array(values) => {
                let mut c = writer.write_u8(value_type);
                c += writer.write_uleb128(values.len() as u32);
                for v in values
                {
                    c += v.write(writer);
                }
                c
            }
            DexValue::Annotation(a) => writer.write_u8(value_type) + a.write(writer),
            DexValue::Null => writer.write_u8(value_type),
            DexValue::Boolean(b) => writer.write_u8(((*b as u8) << 5) | value_type),
            _ => {
                let payload = self.payload();
                writer.write_u8((((payload.len() - 1) as u8) << 5) | value_type) + writer.write_bytes(&payload)
            }
        }
    }

    pub fn byte_len(&self) -> usize
    {
        match &self.value
        {
            DexValue::Array(values) => 1 + uleb128_len(values.len() as u32) + values.iter().map(|v| v.byte_len()).sum::<usize>(),
            DexValue::Annotation(a) => 1 + a.byte_len(),
            DexValue::Null | DexValue::Boolean(_) => 1,
            _ => 1 + self.payload().len(),
        }
    }

    pub fn refresh(&self, pools: &IdPools) -> BlockResult<()>
    {
        self.value.refresh(pools)
    }

    pub(crate) fn bind(&self, pools: &IdPools) -> BlockResult<()>
    {
        self.value.bind(pools)
    }

    pub fn visit_integers(&mut self, visitor: &mut dyn IntegerVisitor)
    {
        if matches!(self.value, DexValue::Byte(_) | DexValue::Short(_) | DexValue::Char(_) | DexValue::Int(_))
        {
            visitor.visit(self);
            return;
        }
        match &mut self.value
        {
            DexValue::Array(values) => {
                for v in values
                {
                    v.visit_integers(visitor);
                }
            }
            DexValue::Annotation(a) => {
                for e in a.elements.iter_mut()
                {
                    e.value.visit_integers(visitor);
                }
            }
            _ => {}
        }
    }
}

impl IntegerReference for EncodedValue
{
    fn get(&self) -> i32
    {
        match self.value
        {
            DexValue::Byte(v) => v as i32,
            DexValue::Short(v) => v as i32,
            DexValue::Char(v) => v as i32,
            DexValue::Int(v) => v,
            DexValue::Long(v) => v as i32,
            DexValue::Boolean(b) => b as i32,
            _ => 0,
        }
    }

    fn set(&mut self, value: i32)
    {
        let replaced = match self.value
        {
            DexValue::Byte(_) => DexValue::Byte(value as i8),
            DexValue::Short(_) => DexValue::Short(value as i16),
            DexValue::Char(_) => DexValue::Char(value as u16),
            DexValue::Int(_) => DexValue::Int(value),
            DexValue::Long(_) => DexValue::Long(value as i64),
            DexValue::Boolean(_) => DexValue::Boolean(value != 0),
            _ => return,
        };
        EncodedValue::set(self, replaced);
    }
}

/// The value a field of type `descriptor` holds before initialization.
pub fn default_for(descriptor: &str) -> EncodedValue
{
    EncodedValue::new(match descriptor
    {
        "Z" => DexValue::Boolean(false),
        "B" => DexValue::Byte(0),
        "S" => DexValue::Short(0),
        "C" => DexValue::Char(0),
        "I" => DexValue::Int(0),
        "J" => DexValue::Long(0),
        "F" => DexValue::Float(0.0),
        "D" => DexValue::Double(0.0),
        _ => DexValue::Null,
    })
}

fn read_payload<'a>(reader: &mut BlockReader<'a>, size: usize, max: usize) -> BlockResult<&'a [u8]>
{
    if size > max
    {
        fail!("Encoded value of {} bytes exceeds its type's {} bytes", size, max);
    }
    reader.read_bytes(size)
}

fn read_index(reader: &mut BlockReader<'_>, size: usize) -> BlockResult<u32>
{
    Ok(decode_unsigned(read_payload(reader, size, 4)?) as u32)
}

fn read_array(reader: &mut BlockReader<'_>) -> BlockResult<Vec<EncodedValue>>
{
    let size = reader.read_uleb128()?;
    let mut values = Vec::with_capacity(size.min(0x10000) as usize);
    for i in 0..size
    {
        values.push(EncodedValue::read(reader).map_err(|e| err!(e, "array element {}", i))?);
    }
    Ok(values)
}

#[derive(Debug, Clone)]
pub struct AnnotationElement
{
    pub name: IndexReference<StringData>,
    pub value: EncodedValue,
}

#[derive(Debug, Clone)]
pub struct EncodedAnnotation
{
    pub annotation_type: IndexReference<TypeId>,
    pub elements: Vec<AnnotationElement>,
}

impl EncodedAnnotation
{
    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<EncodedAnnotation>
    {
        let annotation_type = IndexReference::read(RefWidth::Uleb, reader)?;
        let size = reader.read_uleb128()?;
        let mut elements = Vec::with_capacity(size.min(0x10000) as usize);
        for _ in 0..size
        {
            let name = IndexReference::read(RefWidth::Uleb, reader)?;
            let value = EncodedValue::read(reader)?;
            elements.push(AnnotationElement { name, value });
        }
        Ok(EncodedAnnotation { annotation_type, elements })
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        let mut c = self.annotation_type.write(writer);
        c += writer.write_uleb128(self.elements.len() as u32);
        for e in &self.elements
        {
            c += e.name.write(writer);
            c += e.value.write(writer);
        }
        c
    }

    pub fn byte_len(&self) -> usize
    {
        self.annotation_type.byte_len()
            + uleb128_len(self.elements.len() as u32)
            + self.elements.iter().map(|e| e.name.byte_len() + e.value.byte_len()).sum::<usize>()
    }

    /// Rewrites indices; elements are kept sorted by name index as the format requires.
    pub fn refresh(&self, pools: &IdPools) -> BlockResult<()>
    {
        self.annotation_type.refresh(&pools.types)?;
        for e in &self.elements
        {
            e.name.refresh(&pools.strings)?;
            e.value.refresh(pools)?;
        }
        Ok(())
    }

    pub(crate) fn sort_elements_by<F>(&mut self, mut name_index: F)
    where
        F: FnMut(&IndexReference<StringData>) -> usize,
    {
        self.elements.sort_by_key(|e| name_index(&e.name));
    }

    pub(crate) fn bind(&self, pools: &IdPools) -> BlockResult<()>
    {
        self.annotation_type.get(&pools.types)?;
        for e in &self.elements
        {
            e.name.get(&pools.strings)?;
            e.value.bind(pools)?;
        }
        Ok(())
    }

    pub fn type_descriptor<'p>(&self, pools: &'p IdPools) -> BlockResult<&'p str>
    {
        pools.type_descriptor(&self.annotation_type)
    }

    pub fn element(&self, pools: &IdPools, name: &str) -> Option<&EncodedValue>
    {
        self.elements.iter().find(|e| pools.string(&e.name).map_or(false, |n| n == name)).map(|e| &e.value)
    }
}

/// An `encoded_array_item`, used for static field initial values.
#[derive(Debug, Clone, Default)]
pub struct EncodedArray
{
    pub values: Vec<EncodedValue>,
}

impl EncodedArray
{
    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<EncodedArray>
    {
        Ok(EncodedArray { values: read_array(reader)? })
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        let mut c = writer.write_uleb128(self.values.len() as u32);
        for v in &self.values
        {
            c += v.write(writer);
        }
        c
    }

    pub fn byte_len(&self) -> usize
    {
        uleb128_len(self.values.len() as u32) + self.values.iter().map(|v| v.byte_len()).sum::<usize>()
    }

    pub fn refresh(&self, pools: &IdPools) -> BlockResult<()>
    {
        for v in &self.values
        {
            v.refresh(pools)?;
        }
        Ok(())
    }

    pub(crate) fn bind(&self, pools: &IdPools) -> BlockResult<()>
    {
        for v in &self.values
        {
            v.bind(pools)?;
        }
        Ok(())
    }
}

/// Checks that an annotation bound into a slot carries the type the slot declares.
pub fn check_annotation_type(annotation: &EncodedAnnotation, pools: &IdPools, expected: &str) -> BlockResult<()>
{
    let found = annotation.type_descriptor(pools)?;
    if found != expected
    {
        return Err(BlockError::usage(format!("annotation of type {} bound where {} is declared", found, expected)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &EncodedValue) -> Vec<u8> {
        let mut writer = BlockWriter::new();
        let written = value.write(&mut writer);
        assert_eq!(written, value.byte_len());
        writer.into_bytes()
    }

    fn decode(bytes: &[u8]) -> EncodedValue {
        let mut reader = BlockReader::new(bytes);
        let value = EncodedValue::read(&mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);
        value
    }

    #[test]
    fn zero_and_one_use_one_byte() {
        assert_eq!(encode(&EncodedValue::new(DexValue::Int(0))), vec![VALUE_INT, 0x00]);
        assert_eq!(encode(&EncodedValue::new(DexValue::Int(1))), vec![VALUE_INT, 0x01]);
        assert_eq!(encode(&EncodedValue::new(DexValue::Int(-1))), vec![VALUE_INT, 0xff]);
        assert_eq!(encode(&EncodedValue::new(DexValue::Int(0x1234))), vec![0x20 | VALUE_INT, 0x34, 0x12]);
    }

    #[test]
    fn float_keeps_high_order_bytes() {
        let bytes = encode(&EncodedValue::new(DexValue::Float(1.5)));
        assert_eq!(bytes, vec![0x20 | VALUE_FLOAT, 0xc0, 0x3f]);
        match decode(&bytes).value() {
            DexValue::Float(f) => assert_eq!(*f, 1.5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn padded_width_is_kept_until_set() {
        // int 1 stored in four bytes
        let bytes = [0x60 | VALUE_INT, 0x01, 0x00, 0x00, 0x00];
        let mut value = decode(&bytes);
        assert_eq!(value.stored_width(), Some(4));
        assert_eq!(encode(&value), bytes.to_vec());
        IntegerReference::set(&mut value, 2);
        assert_eq!(encode(&value), vec![VALUE_INT, 0x02]);
    }

    #[test]
    fn nested_values_round_trip() {
        let bytes = [
            VALUE_ARRAY, 0x03, // three elements
            VALUE_NULL,
            0x20 | VALUE_BOOLEAN,
            0x20 | VALUE_STRING, 0x00, 0x01, // string index 256
        ];
        let value = decode(&bytes);
        match value.value() {
            DexValue::Array(items) => {
                assert_eq!(items.len(), 3);
                assert!(matches!(items[1].value(), DexValue::Boolean(true)));
                assert!(matches!(items[2].value(), DexValue::String(r) if r.stored() == 256));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(encode(&value), bytes.to_vec());
    }

    #[test]
    fn annotation_type_mismatch_is_usage_error() {
        let mut pools = IdPools::default();
        let t = pools.get_or_create_type("Ldalvik/annotation/Signature;");
        let annotation = EncodedAnnotation { annotation_type: IndexReference::to(RefWidth::Uleb, t), elements: vec![] };
        assert!(check_annotation_type(&annotation, &pools, "Ldalvik/annotation/Signature;").is_ok());
        let e = check_annotation_type(&annotation, &pools, "Ldalvik/annotation/Throws;").unwrap_err();
        assert!(e.is_usage());
    }

    #[test]
    fn visitor_sees_integer_values() {
        let mut value = EncodedValue::new(DexValue::Array(vec![
            EncodedValue::new(DexValue::Int(7)),
            EncodedValue::new(DexValue::Null),
            EncodedValue::new(DexValue::Short(3)),
        ]));
        let mut seen = Vec::new();
        let mut visitor = |r: &mut dyn IntegerReference| {
            seen.push(r.get());
            r.set(r.get() * 2);
        };
        value.visit_integers(&mut visitor);
        assert_eq!(seen, vec![7, 3]);
        match value.value() {
            DexValue::Array(items) => assert!(matches!(items[0].value(), DexValue::Int(14))),
            other => panic!("unexpected {:?}", other),
        }
    }
}
