//! Event sinks: XML text and a freshly built [`ResXmlDocument`].

use std::collections::HashMap;
use std::io::Write;

use log::{debug, warn};
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesPI, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::arsc::string_pool::{ResString, StringPoolChunk};
use crate::arsc::value::{ResValue, TYPE_INT_COLOR_ARGB4, TYPE_INT_COLOR_RGB4, TYPE_INT_COLOR_RGB8, TYPE_NULL};
use crate::block::error::{BlockError, BlockResult};
use crate::block::pool::ItemId;
use crate::xml::document::{ResXmlDocument, XmlAttribute, XmlCData, XmlEndElement, XmlNamespace, XmlNode, XmlStartElement};
use crate::xml::event::{XmlAttr, XmlEvent, XmlName, XmlNamespaceDecl, XmlPushSink};

/// Writes events as XML text.
pub struct TextXmlSerializer<W: Write> {
    writer: Writer<W>,
    pending: Option<BytesStart<'static>>,
    scopes: Vec<Vec<XmlNamespaceDecl>>,
    indenting: bool,
}

impl<W: Write> TextXmlSerializer<W> {
    /// `indent` spaces per level; 0 writes everything on one line.
    pub fn new(out: W, indent: usize) -> Self {
        let writer = if indent > 0 { Writer::new_with_indent(out, b' ', indent) } else { Writer::new(out) };
        TextXmlSerializer { writer, pending: None, scopes: Vec::new(), indenting: indent > 0 }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn flush_pending(&mut self) -> BlockResult<()> {
        if let Some(start) = self.pending.take() {
            self.writer.write_event(Event::Start(start))?;
        }
        Ok(())
    }

    fn qname(&self, name: &XmlName) -> String {
        if name.prefix.is_some() {
            return name.qname();
        }
        match name.namespace.as_deref() {
            Some(uri) => match self.scopes.iter().rev().flatten().find(|ns| ns.uri == uri) {
                Some(ns) if ns.prefix.is_empty() => name.local.clone(),
                Some(ns) => format!("{}:{}", ns.prefix, name.local),
                None => {
                    warn!("no prefix in scope for namespace {}", uri);
                    name.local.clone()
                }
            },
            None => name.local.clone(),
        }
    }

    fn write(&mut self, event: Event<'_>) -> BlockResult<()> {
        self.flush_pending()?;
        self.writer.write_event(event)?;
        Ok(())
    }
}

impl<W: Write> XmlPushSink for TextXmlSerializer<W> {
    fn push(&mut self, event: XmlEvent) -> BlockResult<()> {
        match event {
            XmlEvent::StartDocument => self.write(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?,
            XmlEvent::EndDocument => self.flush_pending()?,
            XmlEvent::StartTag { name, namespaces, attributes, .. } => {
                self.flush_pending()?;
                self.scopes.push(namespaces);
                let mut start = BytesStart::new(self.qname(&name));
                if let Some(declared) = self.scopes.last() {
                    for ns in declared {
                        let key = if ns.prefix.is_empty() { "xmlns".to_string() } else { format!("xmlns:{}", ns.prefix) };
                        start.push_attribute((key.as_str(), ns.uri.as_str()));
                    }
                }
                for attr in &attributes {
                    let key = self.qname(&attr.name);
                    start.push_attribute((key.as_str(), attr.value.as_str()));
                }
                self.pending = Some(start);
            }
            XmlEvent::EndTag { name, .. } => {
                match self.pending.take() {
                    Some(start) => self.writer.write_event(Event::Empty(start))?,
                    None => {
                        let qname = self.qname(&name);
                        self.writer.write_event(Event::End(BytesEnd::new(qname)))?;
                    }
                }
                self.scopes.pop();
            }
            XmlEvent::Text(text) => self.write(Event::Text(BytesText::new(&text)))?,
            XmlEvent::CData(text) => self.write(Event::CData(BytesCData::new(text)))?,
            XmlEvent::Comment(text) => self.write(Event::Comment(BytesText::from_escaped(text)))?,
            XmlEvent::EntityRef(name) => self.write(Event::Text(BytesText::from_escaped(format!("&{};", name))))?,
            XmlEvent::IgnorableWhitespace(text) => {
                if !self.indenting {
                    self.write(Event::Text(BytesText::from_escaped(text)))?;
                }
            }
            XmlEvent::DocDecl(text) => self.write(Event::DocType(BytesText::from_escaped(text)))?,
            XmlEvent::ProcessingInstruction(text) => self.write(Event::PI(BytesPI::new(text)))?,
        }
        Ok(())
    }

    fn finish(&mut self) -> BlockResult<()> {
        self.flush_pending()?;
        self.writer.get_mut().flush()?;
        Ok(())
    }
}

fn parse_hex(digits: &str) -> Option<u32> {
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

fn parse_color(digits: &str) -> Option<ResValue> {
    let value = parse_hex(digits)?;
    let nibble = |shift: u32| (value >> shift) & 0xf;
    let double = |n: u32| (n << 4) | n;
    match digits.len() {
        3 => Some(ResValue::new(
            TYPE_INT_COLOR_RGB4,
            0xff00_0000 | double(nibble(8)) << 16 | double(nibble(4)) << 8 | double(nibble(0)),
        )),
        4 => Some(ResValue::new(
            TYPE_INT_COLOR_ARGB4,
            double(nibble(12)) << 24 | double(nibble(8)) << 16 | double(nibble(4)) << 8 | double(nibble(0)),
        )),
        6 => Some(ResValue::new(TYPE_INT_COLOR_RGB8, 0xff00_0000 | value)),
        8 => Some(ResValue::color(value)),
        _ => None,
    }
}

/// Typed value for attribute text, in the spelling the binary side decodes back.
///
/// Anything that does not print back identically stays a string.
pub fn encode_value(text: &str, strings: &mut StringPoolChunk) -> ResValue {
    let lower = text.to_ascii_lowercase();
    let typed = match text {
        "true" => Some(ResValue::boolean(true)),
        "false" => Some(ResValue::boolean(false)),
        "@null" => Some(ResValue::new(TYPE_NULL, 0)),
        "@empty" => Some(ResValue::empty()),
        _ if lower != text => None,
        _ if text.starts_with("@0x") && text.len() == 11 => parse_hex(&text[3..]).map(ResValue::reference),
        _ if text.starts_with("?0x") && text.len() == 11 => parse_hex(&text[3..]).map(ResValue::attribute),
        _ if text.starts_with('#') => parse_color(&text[1..]),
        _ if text.starts_with("0x") => parse_hex(&text[2..]).map(ResValue::hex).filter(|v| format!("0x{:x}", v.data()) == text),
        _ => match text.parse::<i32>() {
            Ok(v) if v.to_string() == text => Some(ResValue::int(v)),
            _ => text
                .parse::<f32>()
                .ok()
                .filter(|f| f.is_finite() && text.contains('.') && format!("{:?}", f) == text)
                .map(ResValue::float),
        },
    };
    match typed {
        Some(value) => value,
        None => ResValue::string(strings.get_or_create(text)),
    }
}

/// Builds a compiled document from events.
#[derive(Debug, Default)]
pub struct ResXmlDocumentBuilder {
    document: ResXmlDocument,
    attribute_ids: HashMap<(String, String), u32>,
    open: Vec<Vec<(ItemId<ResString>, ItemId<ResString>)>>,
    comment: Option<String>,
}

impl ResXmlDocumentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps attribute `name` in `namespace` (empty for none) to a resource id.
    pub fn with_attribute_id(mut self, namespace: &str, name: &str, res_id: u32) -> Self {
        self.attribute_ids.insert((namespace.to_string(), name.to_string()), res_id);
        self
    }

    pub fn document(&self) -> &ResXmlDocument {
        &self.document
    }

    pub fn into_document(self) -> ResXmlDocument {
        self.document
    }

    fn namespace_id(&mut self, name: &XmlName) -> Option<ItemId<ResString>> {
        name.namespace.as_deref().map(|uri| self.document.strings_mut().get_or_create(uri))
    }

    fn start_tag(&mut self, name: XmlName, namespaces: Vec<XmlNamespaceDecl>, attributes: Vec<XmlAttr>, line: u32) -> BlockResult<()> {
        let mut declared = Vec::with_capacity(namespaces.len());
        for ns in namespaces {
            let prefix = self.document.strings_mut().get_or_create(&ns.prefix);
            let uri = self.document.strings_mut().get_or_create(&ns.uri);
            let mut node = XmlNamespace::new(prefix, uri);
            node.header.line = line;
            self.document.push_node(XmlNode::StartNamespace(node));
            declared.push((prefix, uri));
        }
        self.open.push(declared);

        let namespace = self.namespace_id(&name);
        let element_name = self.document.strings_mut().get_or_create(&name.local);
        let mut element = XmlStartElement::new(namespace, element_name);
        element.header.line = line;
        if let Some(comment) = self.comment.take() {
            let comment = self.document.strings_mut().get_or_create(&comment);
            element.header.comment.set(Some(comment));
        }
        for attr in attributes {
            let res_id = attr.resource_id.unwrap_or_else(|| {
                let key = (attr.name.namespace.clone().unwrap_or_default(), attr.name.local.clone());
                self.attribute_ids.get(&key).copied().unwrap_or(0)
            });
            let namespace = self.namespace_id(&attr.name);
            let attr_name = self.document.attribute_name(&attr.name.local, res_id);
            let value = encode_value(&attr.value, self.document.strings_mut());
            element.attributes.push(XmlAttribute::new(namespace, attr_name, value));
        }
        self.document.push_node(XmlNode::StartElement(element));
        Ok(())
    }

    fn end_tag(&mut self, name: XmlName, line: u32) -> BlockResult<()> {
        let declared = match self.open.pop() {
            Some(declared) => declared,
            None => return Err(BlockError::xml(format!("end tag </{}> without a start tag", name.qname()))),
        };
        let namespace = self.namespace_id(&name);
        let element_name = self.document.strings_mut().get_or_create(&name.local);
        let mut end = XmlEndElement::new(namespace, element_name);
        end.header.line = line;
        self.document.push_node(XmlNode::EndElement(end));
        for (prefix, uri) in declared.into_iter().rev() {
            let mut node = XmlNamespace::new(prefix, uri);
            node.header.line = line;
            self.document.push_node(XmlNode::EndNamespace(node));
        }
        Ok(())
    }

    fn text(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let data = self.document.strings_mut().get_or_create(text);
        self.document.push_node(XmlNode::CData(XmlCData::new(data)));
    }
}

impl XmlPushSink for ResXmlDocumentBuilder {
    fn push(&mut self, event: XmlEvent) -> BlockResult<()> {
        match event {
            XmlEvent::StartTag { name, namespaces, attributes, line } => self.start_tag(name, namespaces, attributes, line)?,
            XmlEvent::EndTag { name, line } => self.end_tag(name, line)?,
            XmlEvent::Text(text) | XmlEvent::CData(text) => self.text(&text),
            XmlEvent::EntityRef(name) => self.text(&format!("&{};", name)),
            XmlEvent::Comment(text) => self.comment = Some(text),
            XmlEvent::StartDocument
            | XmlEvent::EndDocument
            | XmlEvent::IgnorableWhitespace(_)
            | XmlEvent::DocDecl(_)
            | XmlEvent::ProcessingInstruction(_) => {}
        }
        Ok(())
    }

    fn finish(&mut self) -> BlockResult<()> {
        if !self.open.is_empty() {
            return Err(BlockError::xml(format!("{} elements left open", self.open.len())));
        }
        self.document.refresh()?;
        debug!("built xml document with {} nodes", self.document.nodes().len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arsc::value::{TYPE_FLOAT, TYPE_INT_BOOLEAN, TYPE_INT_COLOR_ARGB8, TYPE_INT_DEC, TYPE_INT_HEX, TYPE_REFERENCE, TYPE_STRING};

    fn typed(text: &str) -> (u8, String) {
        let mut strings = StringPoolChunk::new(true);
        let value = encode_value(text, &mut strings);
        (value.data_type(), value.decode_text(strings.strings()).unwrap())
    }

    #[test]
    fn values_decode_to_their_own_text() {
        for (text, data_type) in [
            ("12", TYPE_INT_DEC),
            ("-3", TYPE_INT_DEC),
            ("0x1f", TYPE_INT_HEX),
            ("1.5", TYPE_FLOAT),
            ("@0x7f010000", TYPE_REFERENCE),
            ("#ff00ff00", TYPE_INT_COLOR_ARGB8),
            ("#00ff00", TYPE_INT_COLOR_RGB8),
            ("#abc", TYPE_INT_COLOR_RGB4),
            ("true", TYPE_INT_BOOLEAN),
            ("@null", TYPE_NULL),
        ] {
            assert_eq!(typed(text), (data_type, text.to_string()), "{}", text);
        }
    }

    #[test]
    fn non_canonical_text_stays_a_string() {
        for text in ["007", "0x0F", "16dp", "1e3", "Hello", "#GG0000", "@string/app_name"] {
            assert_eq!(typed(text), (TYPE_STRING, text.to_string()), "{}", text);
        }
    }

    #[test]
    fn empty_elements_collapse() {
        let mut out = TextXmlSerializer::new(Vec::new(), 0);
        out.push(XmlEvent::StartDocument).unwrap();
        out.push(XmlEvent::StartTag {
            name: XmlName::local("manifest"),
            namespaces: vec![XmlNamespaceDecl { prefix: "android".to_string(), uri: "urn:a".to_string() }],
            attributes: vec![XmlAttr { name: XmlName::local("package"), value: "a&b".to_string(), resource_id: None }],
            line: 0,
        })
        .unwrap();
        out.push(XmlEvent::StartTag {
            name: XmlName::local("application"),
            namespaces: vec![],
            attributes: vec![XmlAttr {
                name: XmlName { namespace: Some("urn:a".to_string()), prefix: None, local: "label".to_string() },
                value: "x".to_string(),
                resource_id: None,
            }],
            line: 0,
        })
        .unwrap();
        out.push(XmlEvent::EndTag { name: XmlName::local("application"), line: 0 }).unwrap();
        out.push(XmlEvent::Text("hi".to_string())).unwrap();
        out.push(XmlEvent::EndTag { name: XmlName::local("manifest"), line: 0 }).unwrap();
        out.push(XmlEvent::EndDocument).unwrap();
        out.finish().unwrap();
        let text = String::from_utf8(out.into_inner()).unwrap();
        assert_eq!(
            text,
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><manifest xmlns:android=\"urn:a\" package=\"a&amp;b\"><application android:label=\"x\"/>hi</manifest>"
        );
    }

    #[test]
    fn builder_maps_known_attribute_ids() {
        let mut builder = ResXmlDocumentBuilder::new().with_attribute_id("urn:a", "label", 0x0101_0001);
        builder
            .push(XmlEvent::StartTag {
                name: XmlName::local("application"),
                namespaces: vec![XmlNamespaceDecl { prefix: "android".to_string(), uri: "urn:a".to_string() }],
                attributes: vec![XmlAttr { name: XmlName::qualified("android", "urn:a", "label"), value: "7".to_string(), resource_id: None }],
                line: 3,
            })
            .unwrap();
        builder.push(XmlEvent::Text("  \n".to_string())).unwrap();
        builder.push(XmlEvent::EndTag { name: XmlName::local("application"), line: 4 }).unwrap();
        builder.finish().unwrap();
        let doc = builder.into_document();
        assert_eq!(doc.nodes().len(), 4);
        match &doc.nodes()[1] {
            XmlNode::StartElement(element) => {
                assert_eq!(element.header.line, 3);
                assert_eq!(doc.resource_id(&element.attributes[0]).unwrap(), Some(0x0101_0001));
                assert_eq!(element.attributes[0].value, ResValue::int(7));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(doc.strings().get(0).unwrap(), "label");
    }

    #[test]
    fn unbalanced_end_tag_is_an_xml_error() {
        let mut builder = ResXmlDocumentBuilder::new();
        let err = builder.push(XmlEvent::EndTag { name: XmlName::local("a"), line: 0 }).unwrap_err();
        assert_eq!(err.kind(), crate::block::error::ErrorKind::Xml);
    }
}
