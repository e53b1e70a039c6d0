//! Compiled XML documents (`AndroidManifest.xml`, layouts): a string pool,
//! an optional resource map and a flat run of element and namespace nodes.

use std::path::Path;

use log::{debug, warn};

use crate::arsc::chunk::{
    read_chunk, read_header_extra, ChunkHeader, RawChunk, RES_STRING_POOL_TYPE, RES_XML_CDATA_TYPE, RES_XML_END_ELEMENT_TYPE,
    RES_XML_END_NAMESPACE_TYPE, RES_XML_RESOURCE_MAP_TYPE, RES_XML_START_ELEMENT_TYPE, RES_XML_START_NAMESPACE_TYPE, RES_XML_TYPE,
};
use crate::arsc::string_pool::{ResString, StringPoolChunk};
use crate::arsc::value::ResValue;
use crate::block::error::{BlockError, BlockResult};
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::pool::{ItemId, Pool};
use crate::block::reference::{IndexReference, RefWidth};
use crate::block::{Block, BlockList};

pub const ANDROID_NAMESPACE: &str = "http://schemas.android.com/apk/res/android";
pub const ANDROID_PREFIX: &str = "android";
pub const RES_AUTO_NAMESPACE: &str = "http://schemas.android.com/apk/res-auto";
pub const RES_AUTO_PREFIX: &str = "app";

const NODE_HEADER_SIZE: u16 = 16;
const ATTRIBUTE_START: u16 = 20;
const ATTRIBUTE_SIZE: u16 = 20;

fn string_ref(raw: u32) -> IndexReference<ResString> {
    IndexReference::from_raw(RefWidth::Int, raw)
}

fn to_string_ref(id: Option<ItemId<ResString>>) -> IndexReference<ResString> {
    let mut reference = IndexReference::new(RefWidth::Int);
    reference.set(id);
    reference
}

/// Line number and comment every node header carries.
#[derive(Debug, Clone)]
pub struct NodeHeader {
    pub line: u32,
    pub comment: IndexReference<ResString>,
    extra: Vec<u8>,
}

impl NodeHeader {
    pub fn new(line: u32) -> Self {
        NodeHeader { line, comment: IndexReference::new(RefWidth::Int), extra: Vec::new() }
    }

    fn read(chunk: &mut BlockReader<'_>, header: &ChunkHeader) -> BlockResult<Self> {
        let line = chunk.read_u32()?;
        let comment = string_ref(chunk.read_u32()?);
        let extra = read_header_extra(chunk, header)?;
        Ok(NodeHeader { line, comment, extra })
    }

    fn byte_len(&self) -> usize {
        NODE_HEADER_SIZE as usize + self.extra.len()
    }

    fn write(&self, writer: &mut BlockWriter, chunk_type: u16, chunk_size: usize) {
        ChunkHeader { chunk_type, header_size: self.byte_len() as u16, chunk_size: chunk_size as u32 }.write(writer);
        writer.write_u32(self.line);
        self.comment.write(writer);
        writer.write_bytes(&self.extra);
    }

    fn refresh(&self, strings: &Pool<ResString>) -> BlockResult<()> {
        self.comment.refresh(strings)?;
        Ok(())
    }
}

/// Bytes a node chunk declares beyond the fields it is known to hold.
fn read_trailer(chunk: &mut BlockReader<'_>, chunk_type: u16) -> BlockResult<Vec<u8>> {
    let trailer = chunk.read_bytes(chunk.remaining())?.to_vec();
    if !trailer.is_empty() {
        warn!("xml node 0x{:04x} carries {} trailing bytes", chunk_type, trailer.len());
    }
    Ok(trailer)
}

/// A start or end namespace node.
#[derive(Debug, Clone)]
pub struct XmlNamespace {
    pub header: NodeHeader,
    pub prefix: IndexReference<ResString>,
    pub uri: IndexReference<ResString>,
    trailer: Vec<u8>,
}

impl XmlNamespace {
    pub fn new(prefix: ItemId<ResString>, uri: ItemId<ResString>) -> Self {
        XmlNamespace {
            header: NodeHeader::new(0),
            prefix: to_string_ref(Some(prefix)),
            uri: to_string_ref(Some(uri)),
            trailer: Vec::new(),
        }
    }

    fn read(chunk: &mut BlockReader<'_>, header: &ChunkHeader) -> BlockResult<Self> {
        let node = NodeHeader::read(chunk, header)?;
        let prefix = string_ref(chunk.read_u32()?);
        let uri = string_ref(chunk.read_u32()?);
        let trailer = read_trailer(chunk, header.chunk_type)?;
        Ok(XmlNamespace { header: node, prefix, uri, trailer })
    }

    fn byte_len(&self) -> usize {
        self.header.byte_len() + 8 + self.trailer.len()
    }

    fn write(&self, writer: &mut BlockWriter, chunk_type: u16) {
        self.header.write(writer, chunk_type, self.byte_len());
        self.prefix.write(writer);
        self.uri.write(writer);
        writer.write_bytes(&self.trailer);
    }

    fn refresh(&self, strings: &Pool<ResString>) -> BlockResult<()> {
        self.header.refresh(strings)?;
        self.prefix.refresh(strings)?;
        self.uri.refresh(strings)?;
        Ok(())
    }
}

/// One attribute of a start element: its raw text and its typed value.
#[derive(Debug, Clone)]
pub struct XmlAttribute {
    pub namespace: IndexReference<ResString>,
    pub name: IndexReference<ResString>,
    pub raw_value: IndexReference<ResString>,
    pub value: ResValue,
    extra: Vec<u8>,
}

impl XmlAttribute {
    pub fn new(namespace: Option<ItemId<ResString>>, name: ItemId<ResString>, value: ResValue) -> Self {
        let raw_value = to_string_ref(value.string_ref().and_then(|r| r.bound()));
        XmlAttribute { namespace: to_string_ref(namespace), name: to_string_ref(Some(name)), raw_value, value, extra: Vec::new() }
    }

    fn read(chunk: &mut BlockReader<'_>, size: usize) -> BlockResult<Self> {
        let start = chunk.position();
        let namespace = string_ref(chunk.read_u32()?);
        let name = string_ref(chunk.read_u32()?);
        let raw_value = string_ref(chunk.read_u32()?);
        let value = ResValue::read_from(chunk)?;
        let extra = chunk.read_bytes(size - (chunk.position() - start))?.to_vec();
        Ok(XmlAttribute { namespace, name, raw_value, value, extra })
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        self.namespace.write(writer);
        self.name.write(writer);
        self.raw_value.write(writer);
        self.value.write(writer)?;
        writer.write_bytes(&self.extra);
        Ok(())
    }

    fn refresh(&self, strings: &Pool<ResString>) -> BlockResult<()> {
        self.namespace.refresh(strings)?;
        self.name.refresh(strings)?;
        self.raw_value.refresh(strings)?;
        self.value.refresh_references(strings)
    }
}

#[derive(Debug, Clone)]
pub struct XmlStartElement {
    pub header: NodeHeader,
    pub namespace: IndexReference<ResString>,
    pub name: IndexReference<ResString>,
    attribute_start: u16,
    attribute_size: u16,
    gap: Vec<u8>,
    id_index: u16,
    class_index: u16,
    style_index: u16,
    pub attributes: Vec<XmlAttribute>,
    trailer: Vec<u8>,
}

impl XmlStartElement {
    pub fn new(namespace: Option<ItemId<ResString>>, name: ItemId<ResString>) -> Self {
        XmlStartElement {
            header: NodeHeader::new(0),
            namespace: to_string_ref(namespace),
            name: to_string_ref(Some(name)),
            attribute_start: ATTRIBUTE_START,
            attribute_size: ATTRIBUTE_SIZE,
            gap: Vec::new(),
            id_index: 0,
            class_index: 0,
            style_index: 0,
            attributes: Vec::new(),
            trailer: Vec::new(),
        }
    }

    fn read(chunk: &mut BlockReader<'_>, header: &ChunkHeader) -> BlockResult<Self> {
        let node = NodeHeader::read(chunk, header)?;
        let body = chunk.position();
        let namespace = string_ref(chunk.read_u32()?);
        let name = string_ref(chunk.read_u32()?);
        let attribute_start = chunk.read_u16()?;
        let attribute_size = chunk.read_u16()?;
        let count = chunk.read_u16()? as usize;
        let id_index = chunk.read_u16()?;
        let class_index = chunk.read_u16()?;
        let style_index = chunk.read_u16()?;
        if attribute_start < ATTRIBUTE_START || attribute_size < ATTRIBUTE_SIZE {
            fail!("Start element declares attributes at {} of size {}", attribute_start, attribute_size);
        }
        let gap = chunk.read_bytes(body + attribute_start as usize - chunk.position())?.to_vec();
        let mut attributes = Vec::with_capacity(count);
        for i in 0..count {
            attributes.push(XmlAttribute::read(chunk, attribute_size as usize).map_err(|e| err!(e, "attribute {}", i))?);
        }
        let trailer = read_trailer(chunk, header.chunk_type)?;
        Ok(XmlStartElement {
            header: node,
            namespace,
            name,
            attribute_start,
            attribute_size,
            gap,
            id_index,
            class_index,
            style_index,
            attributes,
            trailer,
        })
    }

    /// 1-based positions of the `id`, `class` and `style` attributes, 0 when absent.
    pub fn special_indices(&self) -> (u16, u16, u16) {
        (self.id_index, self.class_index, self.style_index)
    }

    fn byte_len(&self) -> usize {
        self.header.byte_len()
            + self.attribute_start as usize
            + self.attributes.len() * self.attribute_size as usize
            + self.trailer.len()
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        self.header.write(writer, RES_XML_START_ELEMENT_TYPE, self.byte_len());
        self.namespace.write(writer);
        self.name.write(writer);
        writer.write_u16(self.attribute_start);
        writer.write_u16(self.attribute_size);
        writer.write_u16(self.attributes.len() as u16);
        writer.write_u16(self.id_index);
        writer.write_u16(self.class_index);
        writer.write_u16(self.style_index);
        writer.write_bytes(&self.gap);
        for attribute in &self.attributes {
            attribute.write(writer)?;
        }
        writer.write_bytes(&self.trailer);
        Ok(())
    }

    fn refresh(&mut self, strings: &Pool<ResString>) -> BlockResult<()> {
        if self.attributes.len() > u16::MAX as usize {
            return Err(BlockError::usage(format!("element has {} attributes", self.attributes.len())));
        }
        self.header.refresh(strings)?;
        self.namespace.refresh(strings)?;
        self.name.refresh(strings)?;
        let mut indices = (0, 0, 0);
        for (i, attribute) in self.attributes.iter().enumerate() {
            attribute.refresh(strings).map_err(|e| err!(e, "attribute {}", i))?;
            let name = attribute.name.item(strings)?.map(|s| s.text());
            let namespace = attribute.namespace.item(strings)?.map(|s| s.text());
            let position = (i + 1) as u16;
            match (namespace, name) {
                (Some(ANDROID_NAMESPACE), Some("id")) if indices.0 == 0 => indices.0 = position,
                (None, Some("class")) if indices.1 == 0 => indices.1 = position,
                (None, Some("style")) if indices.2 == 0 => indices.2 = position,
                _ => {}
            }
        }
        self.id_index = indices.0;
        self.class_index = indices.1;
        self.style_index = indices.2;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct XmlEndElement {
    pub header: NodeHeader,
    pub namespace: IndexReference<ResString>,
    pub name: IndexReference<ResString>,
    trailer: Vec<u8>,
}

impl XmlEndElement {
    pub fn new(namespace: Option<ItemId<ResString>>, name: ItemId<ResString>) -> Self {
        XmlEndElement {
            header: NodeHeader::new(0),
            namespace: to_string_ref(namespace),
            name: to_string_ref(Some(name)),
            trailer: Vec::new(),
        }
    }

    fn read(chunk: &mut BlockReader<'_>, header: &ChunkHeader) -> BlockResult<Self> {
        let node = NodeHeader::read(chunk, header)?;
        let namespace = string_ref(chunk.read_u32()?);
        let name = string_ref(chunk.read_u32()?);
        let trailer = read_trailer(chunk, header.chunk_type)?;
        Ok(XmlEndElement { header: node, namespace, name, trailer })
    }

    fn byte_len(&self) -> usize {
        self.header.byte_len() + 8 + self.trailer.len()
    }

    fn write(&self, writer: &mut BlockWriter) {
        self.header.write(writer, RES_XML_END_ELEMENT_TYPE, self.byte_len());
        self.namespace.write(writer);
        self.name.write(writer);
        writer.write_bytes(&self.trailer);
    }

    fn refresh(&self, strings: &Pool<ResString>) -> BlockResult<()> {
        self.header.refresh(strings)?;
        self.namespace.refresh(strings)?;
        self.name.refresh(strings)?;
        Ok(())
    }
}

/// Character data between elements.
#[derive(Debug, Clone)]
pub struct XmlCData {
    pub header: NodeHeader,
    pub data: IndexReference<ResString>,
    pub value: ResValue,
    trailer: Vec<u8>,
}

impl XmlCData {
    pub fn new(data: ItemId<ResString>) -> Self {
        XmlCData { header: NodeHeader::new(0), data: to_string_ref(Some(data)), value: ResValue::default(), trailer: Vec::new() }
    }

    fn read(chunk: &mut BlockReader<'_>, header: &ChunkHeader) -> BlockResult<Self> {
        let node = NodeHeader::read(chunk, header)?;
        let data = string_ref(chunk.read_u32()?);
        let value = ResValue::read_from(chunk)?;
        let trailer = read_trailer(chunk, header.chunk_type)?;
        Ok(XmlCData { header: node, data, value, trailer })
    }

    fn byte_len(&self) -> usize {
        self.header.byte_len() + 12 + self.trailer.len()
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        self.header.write(writer, RES_XML_CDATA_TYPE, self.byte_len());
        self.data.write(writer);
        self.value.write(writer)?;
        writer.write_bytes(&self.trailer);
        Ok(())
    }

    fn refresh(&self, strings: &Pool<ResString>) -> BlockResult<()> {
        self.header.refresh(strings)?;
        self.data.refresh(strings)?;
        self.value.refresh_references(strings)
    }
}

/// One chunk of the document body, in file order.
#[derive(Debug, Clone)]
pub enum XmlNode {
    StartNamespace(XmlNamespace),
    EndNamespace(XmlNamespace),
    StartElement(XmlStartElement),
    EndElement(XmlEndElement),
    CData(XmlCData),
    Raw(RawChunk),
}

impl XmlNode {
    pub fn read_from(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let header = ChunkHeader::peek(reader)?;
        if header.chunk_type != RES_XML_CDATA_TYPE
            && !(RES_XML_START_NAMESPACE_TYPE..=RES_XML_END_ELEMENT_TYPE).contains(&header.chunk_type)
        {
            debug!("keeping xml chunk 0x{:04x} as raw bytes", header.chunk_type);
            return Ok(XmlNode::Raw(RawChunk::read_from(reader)?));
        }
        let (header, mut chunk) = read_chunk(reader)?;
        Ok(match header.chunk_type {
            RES_XML_START_NAMESPACE_TYPE => XmlNode::StartNamespace(XmlNamespace::read(&mut chunk, &header)?),
            RES_XML_END_NAMESPACE_TYPE => XmlNode::EndNamespace(XmlNamespace::read(&mut chunk, &header)?),
            RES_XML_START_ELEMENT_TYPE => XmlNode::StartElement(XmlStartElement::read(&mut chunk, &header)?),
            RES_XML_END_ELEMENT_TYPE => XmlNode::EndElement(XmlEndElement::read(&mut chunk, &header)?),
            _ => XmlNode::CData(XmlCData::read(&mut chunk, &header)?),
        })
    }

    pub fn line(&self) -> Option<u32> {
        self.header().map(|h| h.line)
    }

    pub fn header(&self) -> Option<&NodeHeader> {
        match self {
            XmlNode::StartNamespace(n) | XmlNode::EndNamespace(n) => Some(&n.header),
            XmlNode::StartElement(e) => Some(&e.header),
            XmlNode::EndElement(e) => Some(&e.header),
            XmlNode::CData(c) => Some(&c.header),
            XmlNode::Raw(_) => None,
        }
    }

    pub fn header_mut(&mut self) -> Option<&mut NodeHeader> {
        match self {
            XmlNode::StartNamespace(n) | XmlNode::EndNamespace(n) => Some(&mut n.header),
            XmlNode::StartElement(e) => Some(&mut e.header),
            XmlNode::EndElement(e) => Some(&mut e.header),
            XmlNode::CData(c) => Some(&mut c.header),
            XmlNode::Raw(_) => None,
        }
    }

    fn refresh_references(&mut self, strings: &Pool<ResString>) -> BlockResult<()> {
        match self {
            XmlNode::StartNamespace(n) | XmlNode::EndNamespace(n) => n.refresh(strings),
            XmlNode::StartElement(e) => e.refresh(strings),
            XmlNode::EndElement(e) => e.refresh(strings),
            XmlNode::CData(c) => c.refresh(strings),
            XmlNode::Raw(_) => Ok(()),
        }
    }
}

impl Block for XmlNode {
    fn read(&mut self, reader: &mut BlockReader<'_>) -> BlockResult<()> {
        *self = XmlNode::read_from(reader)?;
        Ok(())
    }

    fn byte_len(&self) -> usize {
        match self {
            XmlNode::StartNamespace(n) | XmlNode::EndNamespace(n) => n.byte_len(),
            XmlNode::StartElement(e) => e.byte_len(),
            XmlNode::EndElement(e) => e.byte_len(),
            XmlNode::CData(c) => c.byte_len(),
            XmlNode::Raw(r) => r.byte_len(),
        }
    }

    fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        match self {
            XmlNode::StartNamespace(n) => n.write(writer, RES_XML_START_NAMESPACE_TYPE),
            XmlNode::EndNamespace(n) => n.write(writer, RES_XML_END_NAMESPACE_TYPE),
            XmlNode::StartElement(e) => e.write(writer)?,
            XmlNode::EndElement(e) => e.write(writer),
            XmlNode::CData(c) => c.write(writer)?,
            XmlNode::Raw(r) => r.write(writer)?,
        }
        Ok(())
    }
}

/// Attribute resource ids, keyed by the name string at the same pool index.
#[derive(Debug, Clone, Default)]
struct ResourceMap {
    header_extra: Vec<u8>,
    ids: Vec<(ItemId<ResString>, u32)>,
}

impl ResourceMap {
    fn read(reader: &mut BlockReader<'_>, strings: &Pool<ResString>) -> BlockResult<Self> {
        let (header, mut chunk) = read_chunk(reader)?;
        let header_extra = read_header_extra(&mut chunk, &header)?;
        let count = chunk.remaining() / 4;
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let res_id = chunk.read_u32()?;
            match strings.id_at(i) {
                Some(name) => ids.push((name, res_id)),
                None => fail!("Resource map entry {} has no string to name", i),
            }
        }
        Ok(ResourceMap { header_extra, ids })
    }

    fn byte_len(&self) -> usize {
        ChunkHeader::SIZE + self.header_extra.len() + self.ids.len() * 4
    }

    fn write(&self, writer: &mut BlockWriter) {
        let header = ChunkHeader {
            chunk_type: RES_XML_RESOURCE_MAP_TYPE,
            header_size: (ChunkHeader::SIZE + self.header_extra.len()) as u16,
            chunk_size: self.byte_len() as u32,
        };
        header.write(writer);
        writer.write_bytes(&self.header_extra);
        for (_, res_id) in &self.ids {
            writer.write_u32(*res_id);
        }
    }
}

/// A compiled XML document.
#[derive(Debug, Clone)]
pub struct ResXmlDocument {
    header_extra: Vec<u8>,
    strings: StringPoolChunk,
    resource_map: Option<ResourceMap>,
    nodes: BlockList<XmlNode>,
}

impl Default for ResXmlDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ResXmlDocument {
    const HEADER_SIZE: usize = 8;

    pub fn new() -> Self {
        ResXmlDocument { header_extra: Vec::new(), strings: StringPoolChunk::new(false), resource_map: None, nodes: BlockList::new() }
    }

    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<Self> {
        let (header, mut chunk) = read_chunk(reader)?;
        if header.chunk_type != RES_XML_TYPE {
            fail!("Not a binary xml document: chunk type 0x{:04x}", header.chunk_type);
        }
        let header_extra = read_header_extra(&mut chunk, &header)?;
        let mut strings = None;
        let mut resource_map = None;
        let mut nodes = Vec::new();
        while chunk.remaining() >= ChunkHeader::SIZE {
            let next = ChunkHeader::peek(&chunk)?;
            match next.chunk_type {
                RES_STRING_POOL_TYPE if strings.is_none() => {
                    strings = Some(StringPoolChunk::read(&mut chunk).map_err(|e| err!(e, "xml string pool"))?);
                }
                RES_XML_RESOURCE_MAP_TYPE if resource_map.is_none() => {
                    let pool = match &strings {
                        Some(pool) => pool.strings(),
                        None => fail!("Resource map precedes the string pool"),
                    };
                    resource_map = Some(ResourceMap::read(&mut chunk, pool).map_err(|e| err!(e, "resource map"))?);
                }
                _ => {
                    let index = nodes.len();
                    nodes.push(XmlNode::read_from(&mut chunk).map_err(|e| err!(e, "xml node {}", index))?);
                }
            }
        }
        if chunk.remaining() > 0 {
            warn!("{} stray bytes after the last xml chunk", chunk.remaining());
        }
        let strings = match strings {
            Some(strings) => strings,
            None => fail!("Binary xml document has no string pool"),
        };
        debug!("read xml document with {} strings and {} nodes", strings.len(), nodes.len());
        Ok(ResXmlDocument { header_extra, strings, resource_map, nodes: BlockList::from_items(nodes) })
    }

    pub fn from_bytes(data: &[u8]) -> BlockResult<Self> {
        let mut reader = BlockReader::new(data);
        Self::read(&mut reader)
    }

    pub fn read_file(path: &Path) -> BlockResult<Self> {
        let data = std::fs::read(path).map_err(|e| BlockError::from(e).with_path(path))?;
        Self::from_bytes(&data).map_err(|e| e.with_path(path))
    }

    pub fn strings(&self) -> &StringPoolChunk {
        &self.strings
    }

    pub fn strings_mut(&mut self) -> &mut StringPoolChunk {
        &mut self.strings
    }

    pub fn nodes(&self) -> &[XmlNode] {
        self.nodes.items()
    }

    pub fn nodes_mut(&mut self) -> &mut BlockList<XmlNode> {
        &mut self.nodes
    }

    /// Byte offset of node `index` from the start of the document, as of the last read or refresh.
    pub fn node_offset(&self, index: usize) -> Option<usize> {
        let body = Self::HEADER_SIZE
            + self.header_extra.len()
            + self.strings.byte_len()
            + self.resource_map.as_ref().map_or(0, |m| m.byte_len());
        self.nodes.offset_of(index).map(|offset| body + offset)
    }

    pub fn push_node(&mut self, node: XmlNode) {
        self.nodes.push(node);
    }

    /// Text of a string reference held by one of this document's nodes.
    pub fn text(&self, reference: &IndexReference<ResString>) -> BlockResult<Option<&str>> {
        Ok(reference.item(self.strings.strings())?.map(|s| s.text()))
    }

    /// The resource id mapped to an attribute's name, if any.
    pub fn resource_id(&self, attribute: &XmlAttribute) -> BlockResult<Option<u32>> {
        let name = match attribute.name.get(self.strings.strings())? {
            Some(name) => name,
            None => return Ok(None),
        };
        Ok(self.resource_map.as_ref().and_then(|map| map.ids.iter().find(|(id, _)| *id == name).map(|(_, res_id)| *res_id)))
    }

    /// Name string for an attribute, mapped to `res_id` when that is non-zero.
    ///
    /// Mapped names are never shared with unmapped uses of the same text.
    pub fn attribute_name(&mut self, name: &str, res_id: u32) -> ItemId<ResString> {
        if res_id == 0 {
            return self.strings.get_or_create(name);
        }
        let strings = self.strings.strings();
        let map = self.resource_map.get_or_insert_with(ResourceMap::default);
        if let Some((id, _)) = map.ids.iter().find(|(id, r)| *r == res_id && strings.item(*id).map_or(false, |s| s.text() == name)) {
            return *id;
        }
        let id = self.strings.strings_mut().push(ResString::new(name));
        map.ids.push((id, res_id));
        id
    }

    /// Gives attributes with a resource id but no namespace the namespace their
    /// package implies, declaring it around the root element when missing.
    pub fn fix_attribute_namespaces(&mut self) -> BlockResult<usize> {
        let mut fixed = 0;
        let mut needed: Vec<(&str, &str)> = Vec::new();
        for index in 0..self.nodes.len() {
            let updates = match self.nodes.get(index) {
                Some(XmlNode::StartElement(element)) => {
                    let mut updates = Vec::new();
                    for (i, attribute) in element.attributes.iter().enumerate() {
                        if attribute.namespace.get(self.strings.strings())?.is_some() {
                            continue;
                        }
                        let res_id = match self.resource_id(attribute)? {
                            Some(res_id) if res_id != 0 => res_id,
                            _ => continue,
                        };
                        let namespace = if res_id >> 24 == 0x01 {
                            (ANDROID_PREFIX, ANDROID_NAMESPACE)
                        } else {
                            (RES_AUTO_PREFIX, RES_AUTO_NAMESPACE)
                        };
                        if !needed.contains(&namespace) {
                            needed.push(namespace);
                        }
                        updates.push((i, namespace.1));
                    }
                    updates
                }
                _ => continue,
            };
            for (i, uri) in updates {
                let uri = self.strings.get_or_create(uri);
                if let Some(XmlNode::StartElement(element)) = self.nodes.get_mut(index) {
                    element.attributes[i].namespace.set(Some(uri));
                    fixed += 1;
                }
            }
        }
        for (prefix, uri) in needed {
            if !self.declares_namespace(uri)? {
                self.declare_namespace(prefix, uri);
            }
        }
        if fixed > 0 {
            debug!("assigned namespaces to {} attributes", fixed);
        }
        Ok(fixed)
    }

    fn declares_namespace(&self, uri: &str) -> BlockResult<bool> {
        for node in self.nodes.iter() {
            if let XmlNode::StartNamespace(ns) = node {
                if self.text(&ns.uri)? == Some(uri) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Wraps the whole body in a start/end namespace pair.
    pub fn declare_namespace(&mut self, prefix: &str, uri: &str) {
        let prefix = self.strings.get_or_create(prefix);
        let uri = self.strings.get_or_create(uri);
        let first = self.nodes.iter().position(|n| !matches!(n, XmlNode::Raw(_))).unwrap_or(self.nodes.len());
        let last = self.nodes.iter().rposition(|n| !matches!(n, XmlNode::Raw(_))).map_or(first, |i| i + 1);
        self.nodes.insert(last, XmlNode::EndNamespace(XmlNamespace::new(prefix, uri)));
        self.nodes.insert(first, XmlNode::StartNamespace(XmlNamespace::new(prefix, uri)));
    }

    /// Rewrites every stored string index and recomputes sizes.
    ///
    /// Mapped attribute names are moved to the front of the pool in map order.
    pub fn refresh(&mut self) -> BlockResult<bool> {
        let before = self.byte_len();
        if let Some(map) = &self.resource_map {
            let pool = self.strings.strings();
            let in_place = map.ids.iter().enumerate().all(|(i, (id, _))| pool.index_of(*id) == Some(i));
            if !in_place {
                let mapped: Vec<ItemId<ResString>> = map.ids.iter().map(|(id, _)| *id).collect();
                let mut order = mapped.clone();
                order.extend(pool.ids().into_iter().filter(|id| !mapped.contains(id)));
                self.strings.strings_mut().reorder(&order)?;
            }
        }
        self.strings.refresh()?;
        if let Some(map) = &self.resource_map {
            let pool = self.strings.strings();
            if map.ids.iter().enumerate().any(|(i, (id, _))| pool.index_of(*id) != Some(i)) {
                return Err(BlockError::usage("styled strings cannot precede resource-mapped attribute names"));
            }
        }
        let strings = self.strings.strings();
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.refresh_references(strings).map_err(|e| err!(e, "xml node {}", i))?;
        }
        self.nodes.refresh();
        self.strings.commit();
        Ok(before != self.byte_len())
    }

    pub fn byte_len(&self) -> usize {
        Self::HEADER_SIZE
            + self.header_extra.len()
            + self.strings.byte_len()
            + self.resource_map.as_ref().map_or(0, |m| m.byte_len())
            + self.nodes.byte_len()
    }

    pub fn write(&self, writer: &mut BlockWriter) -> BlockResult<()> {
        let header = ChunkHeader {
            chunk_type: RES_XML_TYPE,
            header_size: (Self::HEADER_SIZE + self.header_extra.len()) as u16,
            chunk_size: self.byte_len() as u32,
        };
        header.write(writer);
        writer.write_bytes(&self.header_extra);
        self.strings.write(writer)?;
        if let Some(map) = &self.resource_map {
            map.write(writer);
        }
        self.nodes.write(writer)
    }

    /// Refreshes and serializes the document.
    pub fn to_bytes(&mut self) -> BlockResult<Vec<u8>> {
        self.refresh()?;
        let mut writer = BlockWriter::with_capacity(self.byte_len());
        self.write(&mut writer)?;
        Ok(writer.into_bytes())
    }

    pub fn write_file(&mut self, path: &Path) -> BlockResult<()> {
        let bytes = self.to_bytes().map_err(|e| e.with_path(path))?;
        std::fs::write(path, bytes).map_err(|e| BlockError::from(e).with_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> ResXmlDocument {
        let mut doc = ResXmlDocument::new();
        let prefix = doc.strings_mut().get_or_create(ANDROID_PREFIX);
        let uri = doc.strings_mut().get_or_create(ANDROID_NAMESPACE);
        let manifest = doc.strings_mut().get_or_create("manifest");
        let package = doc.strings_mut().get_or_create("package");
        let name = doc.strings_mut().get_or_create("com.example");
        let app = doc.strings_mut().get_or_create("Example");
        let label = doc.attribute_name("label", 0x0101_0001);

        let mut root = XmlStartElement::new(None, manifest);
        root.header.line = 2;
        root.attributes.push(XmlAttribute::new(None, package, ResValue::string(name)));
        root.attributes.push(XmlAttribute::new(Some(uri), label, ResValue::string(app)));
        doc.push_node(XmlNode::StartNamespace(XmlNamespace::new(prefix, uri)));
        doc.push_node(XmlNode::StartElement(root));
        doc.push_node(XmlNode::EndElement(XmlEndElement::new(None, manifest)));
        doc.push_node(XmlNode::EndNamespace(XmlNamespace::new(prefix, uri)));
        doc
    }

    #[test]
    fn document_round_trips() {
        let mut doc = manifest();
        let bytes = doc.to_bytes().unwrap();
        let mut back = ResXmlDocument::from_bytes(&bytes).unwrap();
        assert_eq!(back.nodes().len(), 4);
        assert_eq!(back.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn mapped_names_lead_the_pool() {
        let mut doc = manifest();
        doc.to_bytes().unwrap();
        assert_eq!(doc.strings().get(0).unwrap(), "label");
        let root = match &doc.nodes()[1] {
            XmlNode::StartElement(e) => e.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(root.attributes[1].name.stored(), 0);
        assert_eq!(doc.resource_id(&root.attributes[1]).unwrap(), Some(0x0101_0001));
        assert_eq!(doc.resource_id(&root.attributes[0]).unwrap(), None);
        assert_eq!(doc.text(&root.attributes[0].raw_value).unwrap(), Some("com.example"));
    }

    #[test]
    fn refresh_is_idempotent() {
        let mut doc = manifest();
        doc.refresh().unwrap();
        let first = doc.to_bytes().unwrap();
        assert!(!doc.refresh().unwrap());
        assert_eq!(doc.to_bytes().unwrap(), first);
    }

    #[test]
    fn missing_namespaces_are_filled_in() {
        let mut doc = ResXmlDocument::new();
        let icon = doc.attribute_name("icon", 0x0101_0002);
        let custom = doc.attribute_name("tint", 0x7f01_0000);
        let app = doc.strings_mut().get_or_create("application");
        let mut element = XmlStartElement::new(None, app);
        element.attributes.push(XmlAttribute::new(None, icon, ResValue::reference(0x7f02_0000)));
        element.attributes.push(XmlAttribute::new(None, custom, ResValue::int(3)));
        doc.push_node(XmlNode::StartElement(element));
        doc.push_node(XmlNode::EndElement(XmlEndElement::new(None, app)));

        assert_eq!(doc.fix_attribute_namespaces().unwrap(), 2);
        assert_eq!(doc.nodes().len(), 6);
        let element = match &doc.nodes()[2] {
            XmlNode::StartElement(e) => e.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(doc.text(&element.attributes[0].namespace).unwrap(), Some(ANDROID_NAMESPACE));
        assert_eq!(doc.text(&element.attributes[1].namespace).unwrap(), Some(RES_AUTO_NAMESPACE));
        assert_eq!(doc.fix_attribute_namespaces().unwrap(), 0);

        let bytes = doc.to_bytes().unwrap();
        assert_eq!(ResXmlDocument::from_bytes(&bytes).unwrap().to_bytes().unwrap(), bytes);
    }

    #[test]
    fn node_offsets_follow_refresh() {
        let check = |doc: &ResXmlDocument, bytes: &[u8]| {
            for (index, node) in doc.nodes().iter().enumerate() {
                let offset = doc.node_offset(index).unwrap();
                let read = XmlNode::read_from(&mut BlockReader::new(&bytes[offset..])).unwrap();
                assert_eq!((read.byte_len(), read.line()), (node.byte_len(), node.line()));
            }
            let last = doc.nodes().len() - 1;
            assert_eq!(doc.node_offset(last).unwrap() + doc.nodes()[last].byte_len(), bytes.len());
        };
        let mut doc = manifest();
        let bytes = doc.to_bytes().unwrap();
        check(&doc, &bytes);
        assert_eq!(doc.node_offset(1), ResXmlDocument::from_bytes(&bytes).unwrap().node_offset(1));

        doc.declare_namespace(RES_AUTO_PREFIX, RES_AUTO_NAMESPACE);
        assert_eq!(doc.node_offset(doc.nodes().len() - 1), None);
        let bytes = doc.to_bytes().unwrap();
        check(&doc, &bytes);
    }

    #[test]
    fn truncated_document_is_structural_error() {
        let mut doc = manifest();
        let bytes = doc.to_bytes().unwrap();
        let err = ResXmlDocument::from_bytes(&bytes[..bytes.len() - 4]).unwrap_err();
        assert!(!err.is_usage() && !err.is_resolution());
    }
}
