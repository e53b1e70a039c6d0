//! `Res_value`: the 8-byte typed value used by entries, bags and XML attributes.

use crate::arsc::string_pool::ResString;
use crate::block::error::BlockResult;
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::pool::{ItemId, Pool};
use crate::block::reference::{IndexReference, IntegerReference, RefWidth};
use crate::block::Block;

pub const TYPE_NULL: u8 = 0x00;
pub const TYPE_REFERENCE: u8 = 0x01;
pub const TYPE_ATTRIBUTE: u8 = 0x02;
pub const TYPE_STRING: u8 = 0x03;
pub const TYPE_FLOAT: u8 = 0x04;
pub const TYPE_DIMENSION: u8 = 0x05;
pub const TYPE_FRACTION: u8 = 0x06;
pub const TYPE_DYNAMIC_REFERENCE: u8 = 0x07;
pub const TYPE_DYNAMIC_ATTRIBUTE: u8 = 0x08;
pub const TYPE_INT_DEC: u8 = 0x10;
pub const TYPE_INT_HEX: u8 = 0x11;
pub const TYPE_INT_BOOLEAN: u8 = 0x12;
pub const TYPE_INT_COLOR_ARGB8: u8 = 0x1c;
pub const TYPE_INT_COLOR_RGB8: u8 = 0x1d;
pub const TYPE_INT_COLOR_ARGB4: u8 = 0x1e;
pub const TYPE_INT_COLOR_RGB4: u8 = 0x1f;

/// `data` of a `TYPE_NULL` value that means "explicitly empty" rather than "undefined".
pub const DATA_NULL_EMPTY: u32 = 1;

const VALUE_SIZE: u16 = 8;

const RADIX_MULTS: [f32; 4] = [
    1.0 / (1u32 << 8) as f32,
    1.0 / (1u32 << 15) as f32,
    1.0 / (1u32 << 23) as f32,
    1.0 / (1u64 << 31) as f32,
];
const DIMENSION_UNITS: [&str; 6] = ["px", "dp", "sp", "pt", "in", "mm"];
const FRACTION_UNITS: [&str; 2] = ["%", "%p"];

#[derive(Debug, Clone)]
enum ValueData {
    Raw(u32),
    String(IndexReference<ResString>),
}

#[derive(Debug, Clone)]
pub struct ResValue {
    size: u16,
    res0: u8,
    data_type: u8,
    data: ValueData,
}

impl Default for ResValue {
    fn default() -> Self {
        ResValue::new(TYPE_NULL, 0)
    }
}

impl PartialEq for ResValue {
    fn eq(&self, other: &Self) -> bool {
        self.data_type == other.data_type && self.data() == other.data()
    }
}

impl ResValue {
    pub fn new(data_type: u8, data: u32) -> Self {
        let mut value = ResValue { size: VALUE_SIZE, res0: 0, data_type: TYPE_NULL, data: ValueData::Raw(0) };
        value.set(data_type, data);
        value
    }

    pub fn string(id: ItemId<ResString>) -> Self {
        ResValue {
            size: VALUE_SIZE,
            res0: 0,
            data_type: TYPE_STRING,
            data: ValueData::String(IndexReference::to(RefWidth::Int, id)),
        }
    }

    pub fn int(value: i32) -> Self {
        Self::new(TYPE_INT_DEC, value as u32)
    }

    pub fn hex(value: u32) -> Self {
        Self::new(TYPE_INT_HEX, value)
    }

    pub fn boolean(value: bool) -> Self {
        Self::new(TYPE_INT_BOOLEAN, if value { 0xFFFF_FFFF } else { 0 })
    }

    pub fn float(value: f32) -> Self {
        Self::new(TYPE_FLOAT, value.to_bits())
    }

    pub fn reference(res_id: u32) -> Self {
        Self::new(TYPE_REFERENCE, res_id)
    }

    pub fn attribute(res_id: u32) -> Self {
        Self::new(TYPE_ATTRIBUTE, res_id)
    }

    pub fn color(argb: u32) -> Self {
        Self::new(TYPE_INT_COLOR_ARGB8, argb)
    }

    pub fn empty() -> Self {
        Self::new(TYPE_NULL, DATA_NULL_EMPTY)
    }

    pub fn data_type(&self) -> u8 {
        self.data_type
    }

    /// The stored 32-bit data; for strings, the pool index last written.
    pub fn data(&self) -> u32 {
        match &self.data {
            ValueData::Raw(data) => *data,
            ValueData::String(reference) => reference.stored(),
        }
    }

    pub fn set(&mut self, data_type: u8, data: u32) {
        self.data_type = data_type;
        self.data = if data_type == TYPE_STRING {
            ValueData::String(IndexReference::from_raw(RefWidth::Int, data))
        } else {
            ValueData::Raw(data)
        };
    }

    pub fn set_string(&mut self, id: ItemId<ResString>) {
        self.data_type = TYPE_STRING;
        self.data = ValueData::String(IndexReference::to(RefWidth::Int, id));
    }

    pub fn string_ref(&self) -> Option<&IndexReference<ResString>> {
        match &self.data {
            ValueData::String(reference) => Some(reference),
            ValueData::Raw(_) => None,
        }
    }

    pub fn string_text<'p>(&self, strings: &'p Pool<ResString>) -> BlockResult<Option<&'p str>> {
        match &self.data {
            ValueData::String(reference) => Ok(reference.item(strings)?.map(|s| s.text())),
            ValueData::Raw(_) => Ok(None),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        (self.data_type == TYPE_INT_BOOLEAN).then(|| self.data() != 0)
    }

    pub fn as_float(&self) -> Option<f32> {
        (self.data_type == TYPE_FLOAT).then(|| f32::from_bits(self.data()))
    }

    pub fn as_reference(&self) -> Option<u32> {
        match self.data_type {
            TYPE_REFERENCE | TYPE_DYNAMIC_REFERENCE => Some(self.data()),
            _ => None,
        }
    }

    /// Rewrites a string value's stored index from the pool's current order.
    pub fn refresh_references(&self, strings: &Pool<ResString>) -> BlockResult<()> {
        if let ValueData::String(reference) = &self.data {
            reference.refresh(strings)?;
        }
        Ok(())
    }

    /// Readable text the way aapt prints values; strings are resolved through `strings`.
    pub fn decode_text(&self, strings: &Pool<ResString>) -> BlockResult<String> {
        let data = self.data();
        Ok(match self.data_type {
            TYPE_STRING => self.string_text(strings)?.unwrap_or_default().to_string(),
            TYPE_NULL if data == DATA_NULL_EMPTY => "@empty".to_string(),
            TYPE_NULL => "@null".to_string(),
            TYPE_REFERENCE | TYPE_DYNAMIC_REFERENCE => format!("@0x{:08x}", data),
            TYPE_ATTRIBUTE | TYPE_DYNAMIC_ATTRIBUTE => format!("?0x{:08x}", data),
            TYPE_FLOAT => format!("{:?}", f32::from_bits(data)),
            TYPE_DIMENSION => decode_complex(data, &DIMENSION_UNITS, 1.0),
            TYPE_FRACTION => decode_complex(data, &FRACTION_UNITS, 100.0),
            TYPE_INT_HEX => format!("0x{:x}", data),
            TYPE_INT_BOOLEAN => (data != 0).to_string(),
            TYPE_INT_COLOR_ARGB8 => format!("#{:08x}", data),
            TYPE_INT_COLOR_RGB8 => format!("#{:06x}", data & 0x00ff_ffff),
            TYPE_INT_COLOR_ARGB4 => format!(
                "#{:x}{:x}{:x}{:x}",
                (data >> 28) & 0xf,
                (data >> 20) & 0xf,
                (data >> 12) & 0xf,
                (data >> 4) & 0xf
            ),
            TYPE_INT_COLOR_RGB4 => format!("#{:x}{:x}{:x}", (data >> 20) & 0xf, (data >> 12) & 0xf, (data >> 4) & 0xf),
            _ => (data as i32).to_string(),
        })
    }
}

fn decode_complex(data: u32, units: &[&str], scale: f32) -> String {
    let mantissa = (data & 0xffff_ff00) as i32 as f32;
    let value = mantissa * RADIX_MULTS[((data >> 4) & 0x3) as usize] * scale;
    match units.get((data & 0xf) as usize) {
        Some(unit) => format!("{}{}", value, unit),
        None => format!("{}", value),
    }
}

impl IntegerReference for ResValue {
    fn get(&self) -> i32 {
        self.data() as i32
    }

    fn set(&mut self, value: i32) {
        let data_type = self.data_type;
        ResValue::set(self, data_type, value as u32);
    }
}

impl Block for ResValue {
    fn read(&mut self, reader: &mut BlockReader<'_>) -> BlockResult<()> {
        self.size = reader.read_u16()?;
        if self.size != VALUE_SIZE {
            log::warn!("Res_value of size {} at 0x{:x}", self.size, reader.position() - 2);
        }
        self.res0 = reader.read_u8()?;
        let data_type = reader.read_u8()?;
        let data = reader.read_u32()?;
        self.set(data_type, data);
        Ok(())
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        writer.write_u16(self.size);
        writer.write_u8(self.res0);
        writer.write_u8(self.data_type);
        writer.write_u32(self.data());
        Ok(())
    }

    fn byte_len(&self) -> usize {
        8
    }
}

impl ResValue {
    pub fn read_from(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let mut value = ResValue::default();
        value.read(reader)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_bytes;

    #[test]
    fn value_round_trips() {
        let bytes = [0x08, 0x00, 0x00, TYPE_INT_COLOR_ARGB8, 0x00, 0xff, 0x00, 0xff];
        let mut reader = BlockReader::new(&bytes);
        let mut value = ResValue::read_from(&mut reader).unwrap();
        let strings = Pool::new();
        assert_eq!(value.decode_text(&strings).unwrap(), "#ff00ff00");
        assert_eq!(block_bytes(&mut value).unwrap(), bytes.to_vec());
    }

    #[test]
    fn string_value_follows_pool_order() {
        let mut strings = Pool::new();
        strings.push(ResString::new("a"));
        let b = strings.push(ResString::new("b"));
        let value = ResValue::string(b);
        strings.move_item(1, 0).unwrap();
        value.refresh_references(&strings).unwrap();
        assert_eq!(value.data(), 0);
        assert_eq!(value.decode_text(&strings).unwrap(), "b");
    }

    #[test]
    fn decodes_dimensions_and_literals() {
        let strings = Pool::new();
        // 16dp: mantissa 16 << 8, radix 0, unit dp
        let dp = ResValue::new(TYPE_DIMENSION, (16 << 8) | 1);
        assert_eq!(dp.decode_text(&strings).unwrap(), "16dp");
        assert_eq!(ResValue::boolean(true).decode_text(&strings).unwrap(), "true");
        assert_eq!(ResValue::float(1.5).decode_text(&strings).unwrap(), "1.5");
        assert_eq!(ResValue::reference(0x7f010000).decode_text(&strings).unwrap(), "@0x7f010000");
        assert_eq!(ResValue::int(-3).decode_text(&strings).unwrap(), "-3");
    }

    #[test]
    fn integer_reference_rewrites_data() {
        let mut value = ResValue::reference(0x7f010001);
        IntegerReference::set(&mut value, 0x7f020001);
        assert_eq!(value.as_reference(), Some(0x7f020001));
    }
}
