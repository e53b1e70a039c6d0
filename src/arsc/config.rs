//! `ResTable_config`, kept as its size-prefixed bytes with typed accessors.

use std::fmt;

use crate::block::error::BlockResult;
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::Block;

const DEFAULT_SIZE: usize = 64;

const OFFSET_MCC: usize = 4;
const OFFSET_MNC: usize = 6;
const OFFSET_LANGUAGE: usize = 8;
const OFFSET_COUNTRY: usize = 10;
const OFFSET_ORIENTATION: usize = 12;
const OFFSET_DENSITY: usize = 14;
const OFFSET_SDK_VERSION: usize = 24;
const OFFSET_UI_MODE: usize = 29;
const OFFSET_SMALLEST_WIDTH: usize = 30;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ResConfig {
    bytes: Vec<u8>,
}

impl Default for ResConfig {
    fn default() -> Self {
        let mut bytes = vec![0; DEFAULT_SIZE];
        bytes[..4].copy_from_slice(&(DEFAULT_SIZE as u32).to_le_bytes());
        ResConfig { bytes }
    }
}

impl fmt::Debug for ResConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResConfig({})", if self.is_default() { "default".to_string() } else { self.qualifiers() })
    }
}

impl ResConfig {
    pub fn read_from(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let mut config = ResConfig { bytes: Vec::new() };
        config.read(reader)?;
        Ok(config)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn u8_at(&self, offset: usize) -> u8 {
        self.bytes.get(offset).copied().unwrap_or(0)
    }

    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.u8_at(offset), self.u8_at(offset + 1)])
    }

    fn set_u8(&mut self, offset: usize, value: u8) {
        if offset >= self.bytes.len() {
            self.bytes.resize(offset + 1, 0);
            let size = self.bytes.len() as u32;
            self.bytes[..4].copy_from_slice(&size.to_le_bytes());
        }
        self.bytes[offset] = value;
    }

    fn set_u16(&mut self, offset: usize, value: u16) {
        let [low, high] = value.to_le_bytes();
        self.set_u8(offset, low);
        self.set_u8(offset + 1, high);
    }

    /// True when every qualifier field is zero.
    pub fn is_default(&self) -> bool {
        self.bytes.iter().skip(4).all(|b| *b == 0)
    }

    pub fn mcc(&self) -> u16 {
        self.u16_at(OFFSET_MCC)
    }

    pub fn mnc(&self) -> u16 {
        self.u16_at(OFFSET_MNC)
    }

    pub fn language(&self) -> String {
        unpack_locale_part(self.u8_at(OFFSET_LANGUAGE), self.u8_at(OFFSET_LANGUAGE + 1), b'a')
    }

    pub fn set_language(&mut self, language: &str) {
        let [a, b] = pack_locale_part(language, b'a');
        self.set_u8(OFFSET_LANGUAGE, a);
        self.set_u8(OFFSET_LANGUAGE + 1, b);
    }

    pub fn country(&self) -> String {
        unpack_locale_part(self.u8_at(OFFSET_COUNTRY), self.u8_at(OFFSET_COUNTRY + 1), b'0')
    }

    pub fn set_country(&mut self, country: &str) {
        let [a, b] = pack_locale_part(country, b'0');
        self.set_u8(OFFSET_COUNTRY, a);
        self.set_u8(OFFSET_COUNTRY + 1, b);
    }

    pub fn orientation(&self) -> u8 {
        self.u8_at(OFFSET_ORIENTATION)
    }

    pub fn density(&self) -> u16 {
        self.u16_at(OFFSET_DENSITY)
    }

    pub fn set_density(&mut self, density: u16) {
        self.set_u16(OFFSET_DENSITY, density);
    }

    pub fn sdk_version(&self) -> u16 {
        self.u16_at(OFFSET_SDK_VERSION)
    }

    pub fn set_sdk_version(&mut self, sdk: u16) {
        self.set_u16(OFFSET_SDK_VERSION, sdk);
    }

    pub fn night_mode(&self) -> u8 {
        (self.u8_at(OFFSET_UI_MODE) >> 4) & 0x3
    }

    pub fn smallest_width_dp(&self) -> u16 {
        self.u16_at(OFFSET_SMALLEST_WIDTH)
    }

    /// Qualifier suffix in resource-directory form, e.g. `-en-rUS-hdpi-v21`.
    pub fn qualifiers(&self) -> String {
        let mut out = String::new();
        if self.mcc() != 0 {
            out.push_str(&format!("-mcc{}", self.mcc()));
        }
        if self.mnc() != 0 {
            out.push_str(&format!("-mnc{}", self.mnc()));
        }
        let language = self.language();
        if !language.is_empty() {
            out.push('-');
            out.push_str(&language);
            let country = self.country();
            if !country.is_empty() {
                out.push_str("-r");
                out.push_str(&country);
            }
        }
        if self.smallest_width_dp() != 0 {
            out.push_str(&format!("-sw{}dp", self.smallest_width_dp()));
        }
        match self.orientation() {
            1 => out.push_str("-port"),
            2 => out.push_str("-land"),
            _ => {}
        }
        match self.night_mode() {
            1 => out.push_str("-notnight"),
            2 => out.push_str("-night"),
            _ => {}
        }
        match self.density() {
            0 => {}
            120 => out.push_str("-ldpi"),
            160 => out.push_str("-mdpi"),
            213 => out.push_str("-tvdpi"),
            240 => out.push_str("-hdpi"),
            320 => out.push_str("-xhdpi"),
            480 => out.push_str("-xxhdpi"),
            640 => out.push_str("-xxxhdpi"),
            0xfffe => out.push_str("-anydpi"),
            0xffff => out.push_str("-nodpi"),
            d => out.push_str(&format!("-{}dpi", d)),
        }
        if self.sdk_version() != 0 {
            out.push_str(&format!("-v{}", self.sdk_version()));
        }
        out
    }
}

fn unpack_locale_part(a: u8, b: u8, base: u8) -> String {
    if a == 0 {
        return String::new();
    }
    if a & 0x80 == 0 {
        return [a as char, b as char].iter().filter(|c| **c != '\0').collect();
    }
    // Packed three-letter code: 5 bits per letter.
    let first = b & 0x1f;
    let second = ((a & 0x3) << 3) | (b >> 5);
    let third = (a >> 2) & 0x1f;
    [first, second, third].iter().map(|c| (c + base) as char).collect()
}

fn pack_locale_part(text: &str, base: u8) -> [u8; 2] {
    let bytes = text.as_bytes();
    match bytes.len() {
        2 => [bytes[0], bytes[1]],
        3 => {
            let first = bytes[0].wrapping_sub(base) & 0x1f;
            let second = bytes[1].wrapping_sub(base) & 0x1f;
            let third = bytes[2].wrapping_sub(base) & 0x1f;
            [0x80 | (third << 2) | (second >> 3), (second << 5) | first]
        }
        _ => [0, 0],
    }
}

impl Block for ResConfig {
    fn read(&mut self, reader: &mut BlockReader<'_>) -> BlockResult<()> {
        let start = reader.position();
        let size = reader.read_u32()? as usize;
        if size < 4 {
            fail!("ResTable_config at 0x{:x} declares size {}", start, size);
        }
        reader.reset(start);
        self.bytes = reader.read_bytes(size)?.to_vec();
        Ok(())
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        writer.write_bytes(&self.bytes);
        Ok(())
    }

    fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_qualifiers() {
        let config = ResConfig::default();
        assert!(config.is_default());
        assert_eq!(config.qualifiers(), "");
        assert_eq!(config.byte_len(), 64);
    }

    #[test]
    fn qualifiers_follow_fields() {
        let mut config = ResConfig::default();
        config.set_language("en");
        config.set_country("US");
        config.set_density(240);
        config.set_sdk_version(21);
        assert_eq!(config.qualifiers(), "-en-rUS-hdpi-v21");
        assert!(!config.is_default());
    }

    #[test]
    fn three_letter_language_is_packed() {
        let mut config = ResConfig::default();
        config.set_language("fil");
        assert_eq!(config.language(), "fil");
    }

    #[test]
    fn short_config_reads_as_is() {
        let bytes = [0x1c, 0, 0, 0, 0, 0, 0, 0, b'd', b'e', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut reader = BlockReader::new(&bytes);
        let config = ResConfig::read_from(&mut reader).unwrap();
        assert_eq!(config.language(), "de");
        assert_eq!(config.byte_len(), 28);
        assert_eq!(config.sdk_version(), 0);
    }
}
