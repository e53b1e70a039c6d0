//! `ResStringPool` chunks: the interned strings every resource structure points into.

use log::{debug, warn};

use crate::arsc::chunk::{read_chunk, read_header_extra, ChunkHeader, RES_STRING_POOL_TYPE};
use crate::block::error::{BlockError, BlockResult};
use crate::block::io::{padding, BlockReader, BlockWriter};
use crate::block::pool::{Interned, ItemId, Numbering, Pool};
use crate::block::reference::{IndexReference, RefWidth};
use crate::block::ConditionalTrailer;

pub const SORTED_FLAG: u32 = 0x0000_0001;
pub const UTF8_FLAG: u32 = 0x0000_0100;

const STRING_POOL_HEADER_SIZE: u16 = 28;
const SPAN_END: u32 = 0xFFFF_FFFF;
/// Largest character or byte count a UTF-8 pool string can declare.
const UTF8_MAX_LENGTH: usize = 0x7fff;

/// One pool string. Strings read from a file keep their exact bytes until changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ResString {
    text: String,
    raw: Option<Vec<u8>>,
    style: Option<ResStyle>,
}

impl ResString {
    pub fn new(text: impl Into<String>) -> Self {
        ResString { text: text.into(), raw: None, style: None }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.raw = None;
    }

    pub fn style(&self) -> Option<&ResStyle> {
        self.style.as_ref()
    }

    pub fn style_mut(&mut self) -> Option<&mut ResStyle> {
        self.style.as_mut()
    }

    pub fn set_style(&mut self, style: Option<ResStyle>) {
        self.style = style;
    }

    pub fn is_styled(&self) -> bool {
        self.style.is_some()
    }

    fn encoded_len(&self, utf8: bool) -> usize {
        if let Some(raw) = &self.raw {
            return raw.len();
        }
        if utf8 {
            let units = self.text.encode_utf16().count();
            utf8_length_size(units) + utf8_length_size(self.text.len()) + self.text.len() + 1
        } else {
            let units = self.text.encode_utf16().count();
            (if units > 0x7fff { 4 } else { 2 }) + units * 2 + 2
        }
    }

    fn check_utf8_length(&self) -> BlockResult<()> {
        if self.raw.is_some() {
            return Ok(());
        }
        let units = self.text.encode_utf16().count();
        if units > UTF8_MAX_LENGTH || self.text.len() > UTF8_MAX_LENGTH {
            return Err(BlockError::usage(format!(
                "string of {} bytes does not fit a UTF-8 pool (limit 0x{:x})",
                self.text.len(),
                UTF8_MAX_LENGTH
            )));
        }
        Ok(())
    }

    fn write(&self, writer: &mut BlockWriter, utf8: bool) -> BlockResult<()> {
        if let Some(raw) = &self.raw {
            writer.write_bytes(raw);
            return Ok(());
        }
        if utf8 {
            self.check_utf8_length()?;
            write_utf8_length(writer, self.text.encode_utf16().count());
            write_utf8_length(writer, self.text.len());
            writer.write_bytes(self.text.as_bytes());
            writer.write_u8(0);
        } else {
            let units: Vec<u16> = self.text.encode_utf16().collect();
            if units.len() > 0x7fff {
                writer.write_u16(0x8000 | ((units.len() >> 16) as u16 & 0x7fff));
                writer.write_u16((units.len() & 0xffff) as u16);
            } else {
                writer.write_u16(units.len() as u16);
            }
            for unit in units {
                writer.write_u16(unit);
            }
            writer.write_u16(0);
        }
        Ok(())
    }
}

impl Interned for ResString {
    fn intern_key(&self) -> &str {
        &self.text
    }
}

/// A markup span over a range of characters of its string.
#[derive(Debug, Clone)]
pub struct StyleSpan {
    /// Tag name, itself a string of the same pool.
    pub name: IndexReference<ResString>,
    pub first_char: u32,
    pub last_char: u32,
}

impl PartialEq for StyleSpan {
    fn eq(&self, other: &Self) -> bool {
        self.name.stored() == other.name.stored()
            && self.first_char == other.first_char
            && self.last_char == other.last_char
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResStyle {
    pub spans: Vec<StyleSpan>,
}

impl ResStyle {
    fn byte_len(&self) -> usize {
        self.spans.len() * 12 + 4
    }
}

fn utf8_length_size(length: usize) -> usize {
    if length > 0x7f { 2 } else { 1 }
}

/// `length` must not exceed [`UTF8_MAX_LENGTH`].
fn write_utf8_length(writer: &mut BlockWriter, length: usize) {
    if length > 0x7f {
        writer.write_u8(0x80 | ((length >> 8) as u8 & 0x7f));
        writer.write_u8((length & 0xff) as u8);
    } else {
        writer.write_u8(length as u8);
    }
}

fn read_utf8_length(reader: &mut BlockReader<'_>) -> BlockResult<usize> {
    let first = reader.read_u8()?;
    if first & 0x80 == 0 {
        return Ok(first as usize);
    }
    let second = reader.read_u8()?;
    Ok((((first & 0x7f) as usize) << 8) | second as usize)
}

fn read_utf16_length(reader: &mut BlockReader<'_>) -> BlockResult<usize> {
    let first = reader.read_u16()?;
    if first & 0x8000 == 0 {
        return Ok(first as usize);
    }
    let second = reader.read_u16()?;
    Ok((((first & 0x7fff) as usize) << 16) | second as usize)
}

fn read_string(reader: &mut BlockReader<'_>, utf8: bool) -> BlockResult<ResString> {
    let start = reader.position();
    let text = if utf8 {
        let _units = read_utf8_length(reader)?;
        let length = read_utf8_length(reader)?;
        let bytes = reader.read_bytes(length)?;
        if reader.read_u8()? != 0 {
            warn!("UTF-8 pool string at 0x{:x} is not NUL terminated", start);
        }
        match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => match cesu8::from_java_cesu8(bytes) {
                Ok(text) => text.into_owned(),
                Err(_) => String::from_utf8_lossy(bytes).into_owned(),
            },
        }
    } else {
        let length = read_utf16_length(reader)?;
        let mut units = Vec::with_capacity(length);
        for _ in 0..length {
            units.push(reader.read_u16()?);
        }
        if reader.read_u16()? != 0 {
            warn!("UTF-16 pool string at 0x{:x} is not NUL terminated", start);
        }
        String::from_utf16_lossy(&units)
    };
    let end = reader.position();
    reader.reset(start);
    let raw = reader.read_bytes(end - start)?.to_vec();
    Ok(ResString { text, raw: Some(raw), style: None })
}

/// Offset tables and data regions exactly as read.
///
/// Offsets may share or reorder string data; while the strings keep their
/// read order, bytes and styles, `write` emits these regions unchanged.
#[derive(Debug, Clone)]
struct ReadLayout {
    ids: Vec<ItemId<ResString>>,
    styles: Vec<Option<ResStyle>>,
    string_offsets: Vec<u32>,
    string_data: Vec<u8>,
    style_offsets: Vec<u32>,
    style_data: Vec<u8>,
}

impl ReadLayout {
    fn matches(&self, strings: &Pool<ResString>) -> bool {
        strings.len() == self.ids.len()
            && strings.iter_ids().zip(&self.ids).all(|((id, s), read)| id == *read && s.raw.is_some())
            && strings.iter().map(|s| s.style.as_ref()).eq(self.styles.iter().map(Option::as_ref))
    }
}

/// A string pool chunk.
///
/// Styles belong to strings; a styled string must sit before every unstyled
/// one, which refresh restores if edits broke it.
#[derive(Debug, Clone)]
pub struct StringPoolChunk {
    header_size: u16,
    header_extra: Vec<u8>,
    flags: u32,
    strings: Pool<ResString>,
    style_end: ConditionalTrailer,
    style_count: u32,
    string_data_len: usize,
    style_data_len: usize,
    read_layout: Option<ReadLayout>,
}

impl Default for StringPoolChunk {
    fn default() -> Self {
        Self::new(false)
    }
}

impl StringPoolChunk {
    pub fn new(utf8: bool) -> Self {
        StringPoolChunk {
            header_size: STRING_POOL_HEADER_SIZE,
            header_extra: Vec::new(),
            flags: if utf8 { UTF8_FLAG } else { 0 },
            strings: Pool::new(),
            style_end: ConditionalTrailer::new(8, 0xff),
            style_count: 0,
            string_data_len: 0,
            style_data_len: 0,
            read_layout: None,
        }
    }

    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let (header, mut chunk) = read_chunk(reader)?;
        if header.chunk_type != RES_STRING_POOL_TYPE {
            fail!("Expected string pool chunk, found 0x{:04x}", header.chunk_type);
        }
        let string_count = chunk.read_u32()? as usize;
        let style_count = chunk.read_u32()? as usize;
        let flags = chunk.read_u32()?;
        let strings_start = chunk.read_u32()? as usize;
        let styles_start = chunk.read_u32()? as usize;
        let header_extra = read_header_extra(&mut chunk, &header)?;
        if style_count > string_count {
            fail!("String pool declares {} styles for {} strings", style_count, string_count);
        }

        let mut string_offsets = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            string_offsets.push(chunk.read_u32()? as usize);
        }
        let mut style_offsets = Vec::with_capacity(style_count);
        for _ in 0..style_count {
            style_offsets.push(chunk.read_u32()? as usize);
        }

        let utf8 = flags & UTF8_FLAG != 0;
        let mut strings = Pool::new();
        let mut expected = 0;
        for (i, offset) in string_offsets.iter().enumerate() {
            if *offset != expected {
                debug!("string {} at pool offset 0x{:x}, expected 0x{:x}", i, offset, expected);
            }
            chunk.seek(strings_start + offset)?;
            let string = read_string(&mut chunk, utf8).map_err(|e| err!(e, "string {}", i))?;
            expected = offset + string.encoded_len(utf8);
            strings.push(string);
        }
        strings.commit_order();

        let mut style_end = ConditionalTrailer::new(8, 0xff);
        let mut styles_end = styles_start;
        if style_count > 0 {
            let mut end = 0;
            for (i, offset) in style_offsets.iter().enumerate() {
                chunk.seek(styles_start + offset)?;
                let mut style = ResStyle::default();
                loop {
                    let name = chunk.read_u32()?;
                    if name == SPAN_END {
                        break;
                    }
                    let first_char = chunk.read_u32()?;
                    let last_char = chunk.read_u32()?;
                    style.spans.push(StyleSpan {
                        name: IndexReference::from_raw(RefWidth::Int, name),
                        first_char,
                        last_char,
                    });
                }
                end = end.max(chunk.position());
                strings.get_mut(i)?.style = Some(style);
            }
            chunk.seek(end)?;
            styles_end = end;
            if chunk.remaining() >= 8 {
                style_end.read_with(&mut chunk, style_count as u32)?;
            } else {
                warn!("String pool styles lack their end marker");
            }
        }

        let read_layout = capture_layout(
            &mut chunk,
            &header,
            &strings,
            utf8,
            (strings_start, string_offsets),
            (styles_start, styles_end, style_offsets),
        );
        let mut pool = StringPoolChunk {
            header_size: header.header_size,
            header_extra,
            flags,
            strings,
            style_end,
            style_count: style_count as u32,
            string_data_len: 0,
            style_data_len: 0,
            read_layout,
        };
        pool.compute_layout();
        Ok(pool)
    }

    pub fn is_utf8(&self) -> bool {
        self.flags & UTF8_FLAG != 0
    }

    pub fn is_sorted(&self) -> bool {
        self.flags & SORTED_FLAG != 0
    }

    pub fn set_sorted(&mut self, sorted: bool) {
        if sorted {
            self.flags |= SORTED_FLAG;
        } else {
            self.flags &= !SORTED_FLAG;
        }
    }

    pub fn strings(&self) -> &Pool<ResString> {
        &self.strings
    }

    pub fn strings_mut(&mut self) -> &mut Pool<ResString> {
        &mut self.strings
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn get(&self, index: usize) -> BlockResult<&str> {
        self.strings.get(index).map(|s| s.text())
    }

    pub fn text(&self, id: ItemId<ResString>) -> BlockResult<&str> {
        self.strings.item(id).map(|s| s.text())
    }

    /// Index of the unstyled string equal to `text`.
    pub fn index_of(&self, text: &str) -> Option<usize> {
        self.find_plain(text).and_then(|id| self.strings.index_of(id))
    }

    fn find_plain(&self, text: &str) -> Option<ItemId<ResString>> {
        match self.strings.find_key(text) {
            Some(id) if self.strings.item(id).map_or(false, |s| !s.is_styled()) => Some(id),
            Some(_) => self.strings.find(|s| !s.is_styled() && s.text == text),
            None => None,
        }
    }

    /// Returns the existing unstyled string equal to `text`, or appends one.
    pub fn get_or_create(&mut self, text: &str) -> ItemId<ResString> {
        match self.find_plain(text) {
            Some(id) => id,
            None => self.strings.push(ResString::new(text)),
        }
    }

    /// Appends a styled string, placed after the existing styled ones.
    pub fn add_styled(&mut self, text: &str, style: ResStyle) -> ItemId<ResString> {
        let position = self.strings.iter().take_while(|s| s.is_styled()).count();
        self.strings.insert(position, ResString { text: text.to_string(), raw: None, style: Some(style) })
    }

    pub fn style_count(&self) -> u32 {
        self.style_count
    }

    pub(crate) fn set_numbering(&mut self, numbering: Numbering) {
        self.strings.set_numbering(numbering);
    }

    /// Restores the styled-first order, rewrites span references and recomputes the layout.
    ///
    /// Returns whether the chunk size changed. Referrers from other chunks must be
    /// refreshed before [`StringPoolChunk::commit`].
    pub fn refresh(&mut self) -> BlockResult<bool> {
        let before = self.byte_len();
        let partitioned = {
            let mut seen_plain = false;
            self.strings.iter().all(|s| {
                if !s.is_styled() {
                    seen_plain = true;
                    true
                } else {
                    !seen_plain
                }
            })
        };
        if !partitioned {
            debug!("moving styled strings ahead of unstyled ones");
            self.strings.sort_by(|a, b| b.is_styled().cmp(&a.is_styled()));
        }
        if self.is_utf8() {
            for string in self.strings.iter() {
                string.check_utf8_length()?;
            }
        }
        for string in self.strings.iter() {
            if let Some(style) = &string.style {
                for span in &style.spans {
                    span.name.refresh(&self.strings).map_err(|e| err!(e, "style span of \"{}\"", string.text))?;
                }
            }
        }
        self.compute_layout();
        Ok(before != self.byte_len())
    }

    pub fn commit(&mut self) {
        self.strings.commit_order();
    }

    fn compute_layout(&mut self) {
        let utf8 = self.is_utf8();
        self.style_count = self.strings.iter().take_while(|s| s.is_styled()).count() as u32;
        self.style_end.refresh_with(self.style_count);
        if let Some(layout) = &self.read_layout {
            if layout.matches(&self.strings) {
                self.string_data_len = layout.string_data.len();
                self.style_data_len = layout.style_data.len();
                return;
            }
            debug!("string pool edited, rebuilding its data layout");
            self.read_layout = None;
        }
        let data: usize = self.strings.iter().map(|s| s.encoded_len(utf8)).sum();
        self.string_data_len = data + padding(data, 4);
        self.style_data_len = self
            .strings
            .iter()
            .filter_map(|s| s.style.as_ref())
            .map(|s| s.byte_len())
            .sum();
    }

    fn offsets_len(&self) -> usize {
        (self.strings.len() + self.style_count as usize) * 4
    }

    pub fn byte_len(&self) -> usize {
        self.header_size as usize
            + self.offsets_len()
            + self.string_data_len
            + self.style_data_len
            + self.style_end.byte_len()
    }

    pub fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        let start = writer.position();
        let utf8 = self.is_utf8();
        let header = ChunkHeader {
            chunk_type: RES_STRING_POOL_TYPE,
            header_size: self.header_size,
            chunk_size: self.byte_len() as u32,
        };
        let strings_start = if self.strings.is_empty() {
            0
        } else {
            self.header_size as u32 + self.offsets_len() as u32
        };
        let styles_start = if self.style_count == 0 {
            0
        } else {
            self.header_size as u32 + self.offsets_len() as u32 + self.string_data_len as u32
        };
        header.write(writer);
        writer.write_u32(self.strings.len() as u32);
        writer.write_u32(self.style_count);
        writer.write_u32(self.flags);
        writer.write_u32(strings_start);
        writer.write_u32(styles_start);
        writer.write_bytes(&self.header_extra);

        match &self.read_layout {
            Some(layout) if layout.matches(&self.strings) => {
                for offset in layout.string_offsets.iter().chain(&layout.style_offsets) {
                    writer.write_u32(*offset);
                }
                writer.write_bytes(&layout.string_data);
                writer.write_bytes(&layout.style_data);
            }
            _ => self.write_data(writer, start, utf8)?,
        }
        self.style_end.write(writer);
        if writer.position() - start != self.byte_len() {
            return Err(BlockError::usage("string pool written before refresh"));
        }
        Ok(())
    }

    fn write_data(&self, writer: &mut BlockWriter, start: usize, utf8: bool) -> BlockResult<()> {
        let mut offset = 0;
        for string in self.strings.iter() {
            writer.write_u32(offset as u32);
            offset += string.encoded_len(utf8);
        }
        let mut offset = 0;
        for style in self.strings.iter().filter_map(|s| s.style.as_ref()) {
            writer.write_u32(offset as u32);
            offset += style.byte_len();
        }
        for string in self.strings.iter() {
            string.write(writer, utf8)?;
        }
        writer.align_from(start, 4);
        for style in self.strings.iter().filter_map(|s| s.style.as_ref()) {
            for span in &style.spans {
                span.name.write(writer);
                writer.write_u32(span.first_char);
                writer.write_u32(span.last_char);
            }
            writer.write_u32(SPAN_END);
        }
        Ok(())
    }
}

/// Snapshots the data regions of a freshly read pool, if they sit where a rewrite would put them.
fn capture_layout(
    chunk: &mut BlockReader<'_>,
    header: &ChunkHeader,
    strings: &Pool<ResString>,
    utf8: bool,
    (strings_start, string_offsets): (usize, Vec<usize>),
    (styles_start, styles_end, style_offsets): (usize, usize, Vec<usize>),
) -> Option<ReadLayout> {
    if strings.is_empty() {
        return None;
    }
    let offsets_len = (string_offsets.len() + style_offsets.len()) * 4;
    if strings_start != header.header_size as usize + offsets_len {
        debug!("string data at 0x{:x} is detached from the offset table", strings_start);
        return None;
    }
    let extent = string_offsets.iter().zip(strings.iter()).map(|(offset, s)| offset + s.encoded_len(utf8)).max()?;
    let extent = extent + padding(extent, 4);
    if !style_offsets.is_empty() && styles_start != strings_start + extent {
        debug!("style data at 0x{:x} is detached from the string data", styles_start);
        return None;
    }
    let string_data = read_region(chunk, strings_start, extent)?;
    let style_data = if style_offsets.is_empty() {
        Vec::new()
    } else {
        read_region(chunk, styles_start, styles_end.checked_sub(styles_start)?)?
    };
    Some(ReadLayout {
        ids: strings.ids(),
        styles: strings.iter().map(|s| s.style.clone()).collect(),
        string_offsets: string_offsets.into_iter().map(|o| o as u32).collect(),
        string_data,
        style_offsets: style_offsets.into_iter().map(|o| o as u32).collect(),
        style_data,
    })
}

fn read_region(chunk: &mut BlockReader<'_>, start: usize, length: usize) -> Option<Vec<u8>> {
    chunk.seek(start).ok()?;
    chunk.read_bytes(length).ok().map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(pool: &mut StringPoolChunk) -> StringPoolChunk {
        pool.refresh().unwrap();
        pool.commit();
        let mut writer = BlockWriter::new();
        pool.write(&mut writer).unwrap();
        let bytes = writer.into_bytes();
        let mut reader = BlockReader::new(&bytes);
        let back = StringPoolChunk::read(&mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);
        let mut writer = BlockWriter::new();
        back.write(&mut writer).unwrap();
        assert_eq!(writer.into_bytes(), bytes);
        back
    }

    #[test]
    fn utf8_and_utf16_round_trip() {
        for utf8 in [true, false] {
            let mut pool = StringPoolChunk::new(utf8);
            pool.get_or_create("app_name");
            pool.get_or_create("Grüße");
            pool.get_or_create(&"x".repeat(300));
            let back = round_trip(&mut pool);
            assert_eq!(back.len(), 3);
            assert_eq!(back.get(1).unwrap(), "Grüße");
            assert_eq!(back.get(2).unwrap().len(), 300);
            assert_eq!(back.is_utf8(), utf8);
        }
    }

    #[test]
    fn get_or_create_is_deduplicated() {
        let mut pool = StringPoolChunk::new(true);
        let a = pool.get_or_create("x");
        let b = pool.get_or_create("x");
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn style_end_follows_style_count() {
        let mut pool = StringPoolChunk::new(false);
        pool.get_or_create("plain");
        pool.refresh().unwrap();
        let unstyled = pool.byte_len();
        assert_eq!(pool.style_end.byte_len(), 0);

        let bold = pool.get_or_create("b");
        let style = ResStyle {
            spans: vec![StyleSpan { name: IndexReference::to(RefWidth::Int, bold), first_char: 0, last_char: 3 }],
        };
        pool.add_styled("bold", style);
        pool.refresh().unwrap();
        assert_eq!(pool.style_count(), 1);
        assert_eq!(pool.style_end.byte_len(), 8);
        assert!(pool.byte_len() > unstyled);

        let back = round_trip(&mut pool);
        assert_eq!(back.style_count(), 1);
        assert_eq!(back.get(0).unwrap(), "bold");
        let span = &back.strings().get(0).unwrap().style().unwrap().spans[0];
        assert_eq!(span.name.require_item(back.strings()).unwrap().text(), "b");
        assert_eq!(back.style_end.byte_len(), 8);

        pool.strings_mut().get_mut(0).unwrap().set_style(None);
        pool.refresh().unwrap();
        assert_eq!(pool.style_count(), 0);
        assert_eq!(pool.style_end.byte_len(), 0);
    }

    #[test]
    fn refresh_is_idempotent() {
        let mut pool = StringPoolChunk::new(true);
        pool.get_or_create("one");
        pool.get_or_create("two");
        assert!(pool.refresh().unwrap());
        assert!(!pool.refresh().unwrap());
    }

    #[test]
    fn styled_strings_are_moved_first() {
        let mut pool = StringPoolChunk::new(false);
        let plain = pool.get_or_create("plain");
        let styled = pool.strings_mut().push(ResString::new("styled"));
        pool.strings_mut().item_mut(styled).unwrap().set_style(Some(ResStyle::default()));
        pool.refresh().unwrap();
        assert_eq!(pool.strings().index_of(styled), Some(0));
        assert_eq!(pool.strings().index_of(plain), Some(1));
    }

    fn hand_built_utf8(offsets: &[u32], data: &[u8]) -> Vec<u8> {
        let header_and_offsets = 28 + offsets.len() as u32 * 4;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&RES_STRING_POOL_TYPE.to_le_bytes());
        bytes.extend_from_slice(&28u16.to_le_bytes());
        bytes.extend_from_slice(&(header_and_offsets + data.len() as u32).to_le_bytes());
        for field in [offsets.len() as u32, 0, UTF8_FLAG, header_and_offsets, 0] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        for offset in offsets {
            bytes.extend_from_slice(&offset.to_le_bytes());
        }
        bytes.extend_from_slice(data);
        bytes
    }

    fn rewrite(pool: &StringPoolChunk) -> Vec<u8> {
        let mut writer = BlockWriter::new();
        pool.write(&mut writer).unwrap();
        writer.into_bytes()
    }

    #[test]
    fn shared_and_reordered_offsets_are_written_back_unchanged() {
        let shared = hand_built_utf8(&[0, 0], &[2, 2, b'a', b'b', 0, 0, 0, 0]);
        let reordered = hand_built_utf8(&[4, 0], &[1, 1, b'b', 0, 1, 1, b'a', 0]);
        for bytes in [&shared, &reordered] {
            let mut pool = StringPoolChunk::read(&mut BlockReader::new(bytes)).unwrap();
            assert_eq!(rewrite(&pool), *bytes);
            assert!(!pool.refresh().unwrap());
            assert_eq!(rewrite(&pool), *bytes);
        }

        let pool = StringPoolChunk::read(&mut BlockReader::new(&shared)).unwrap();
        assert_eq!((pool.get(0).unwrap(), pool.get(1).unwrap()), ("ab", "ab"));
        let pool = StringPoolChunk::read(&mut BlockReader::new(&reordered)).unwrap();
        assert_eq!((pool.get(0).unwrap(), pool.get(1).unwrap()), ("a", "b"));
    }

    #[test]
    fn editing_a_shared_string_lays_the_data_out_again() {
        let shared = hand_built_utf8(&[0, 0], &[2, 2, b'a', b'b', 0, 0, 0, 0]);
        let mut pool = StringPoolChunk::read(&mut BlockReader::new(&shared)).unwrap();
        pool.strings_mut().get_mut(1).unwrap().set_text("cd");
        assert!(pool.refresh().unwrap());
        let bytes = rewrite(&pool);
        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[28..36], &[0, 0, 0, 0, 5, 0, 0, 0]);

        let back = StringPoolChunk::read(&mut BlockReader::new(&bytes)).unwrap();
        assert_eq!((back.get(0).unwrap(), back.get(1).unwrap()), ("ab", "cd"));
        assert_eq!(rewrite(&back), bytes);
    }

    #[test]
    fn overlong_utf8_strings_are_rejected() {
        let long = "x".repeat(0x8000);
        let mut pool = StringPoolChunk::new(true);
        pool.get_or_create(&long);
        assert_eq!(pool.refresh().unwrap_err().kind(), crate::block::error::ErrorKind::Usage);
        let mut writer = BlockWriter::new();
        assert_eq!(pool.write(&mut writer).unwrap_err().kind(), crate::block::error::ErrorKind::Usage);

        let mut wide = StringPoolChunk::new(false);
        wide.get_or_create(&long);
        let back = round_trip(&mut wide);
        assert_eq!(back.get(0).unwrap().len(), 0x8000);
    }
}
