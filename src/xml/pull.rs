//! Event sources: a compiled [`ResXmlDocument`] and XML text.

use std::collections::VecDeque;
use std::io::BufRead;

use log::warn;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::arsc::package::PackageBlock;
use crate::arsc::string_pool::ResString;
use crate::arsc::table::{PackageContext, TableBlock};
use crate::arsc::value::{TYPE_ATTRIBUTE, TYPE_DYNAMIC_ATTRIBUTE, TYPE_DYNAMIC_REFERENCE, TYPE_REFERENCE, TYPE_STRING};
use crate::block::error::{BlockError, BlockResult};
use crate::block::reference::IndexReference;
use crate::xml::document::{ResXmlDocument, XmlAttribute, XmlNode, XmlStartElement};
use crate::xml::event::{XmlAttr, XmlEvent, XmlName, XmlNamespaceDecl, XmlPullSource};

/// Resolves resource ids in attribute values to `@type/name` form.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceNames<'t> {
    table: &'t TableBlock,
    package: &'t str,
}

impl<'t> ReferenceNames<'t> {
    /// Names resolve against `table`; names in the package `context` picks
    /// are written without a package qualifier.
    pub fn new(table: &'t TableBlock, context: &PackageContext) -> Self {
        ReferenceNames { table, package: table.pick_package(context).map_or("", PackageBlock::name) }
    }

    fn name(&self, res_id: u32) -> BlockResult<Option<String>> {
        Ok(self.table.resolve_reference(res_id)?.map(|name| {
            if name.package == self.package || name.package.is_empty() {
                format!("{}/{}", name.type_name, name.entry_name)
            } else {
                format!("{}:{}/{}", name.package, name.type_name, name.entry_name)
            }
        }))
    }
}

/// Walks a compiled document as pull events.
pub struct ResXmlPullParser<'d> {
    document: &'d ResXmlDocument,
    references: Option<ReferenceNames<'d>>,
    position: usize,
    started: bool,
    finished: bool,
    namespaces: Vec<XmlNamespaceDecl>,
    declared: Vec<XmlNamespaceDecl>,
    queue: VecDeque<XmlEvent>,
}

impl<'d> ResXmlPullParser<'d> {
    pub fn new(document: &'d ResXmlDocument) -> Self {
        ResXmlPullParser {
            document,
            references: None,
            position: 0,
            started: false,
            finished: false,
            namespaces: Vec::new(),
            declared: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn with_references(mut self, references: ReferenceNames<'d>) -> Self {
        self.references = Some(references);
        self
    }

    fn text(&self, reference: &IndexReference<ResString>) -> BlockResult<Option<String>> {
        Ok(self.document.text(reference)?.map(str::to_string))
    }

    fn name(&self, namespace: Option<String>, local: Option<String>) -> BlockResult<XmlName> {
        let local = match local {
            Some(local) => local,
            None => fail!("Xml node has no name"),
        };
        let prefix = namespace
            .as_deref()
            .and_then(|uri| self.namespaces.iter().rev().find(|ns| ns.uri == uri))
            .map(|ns| ns.prefix.clone());
        Ok(XmlName { namespace, prefix, local })
    }

    fn value(&self, attribute: &XmlAttribute) -> BlockResult<String> {
        let value = &attribute.value;
        let strings = self.document.strings().strings();
        if value.data_type() == TYPE_STRING {
            return Ok(value.string_text(strings)?.unwrap_or_default().to_string());
        }
        if let Some(references) = &self.references {
            let sigil = match value.data_type() {
                TYPE_REFERENCE | TYPE_DYNAMIC_REFERENCE => Some('@'),
                TYPE_ATTRIBUTE | TYPE_DYNAMIC_ATTRIBUTE => Some('?'),
                _ => None,
            };
            if let Some(sigil) = sigil {
                if let Some(name) = references.name(value.data())? {
                    return Ok(format!("{}{}", sigil, name));
                }
            }
        }
        value.decode_text(strings)
    }

    fn start_tag(&mut self, element: &XmlStartElement) -> BlockResult<XmlEvent> {
        let name = self.name(self.text(&element.namespace)?, self.text(&element.name)?)?;
        let mut attributes = Vec::with_capacity(element.attributes.len());
        for attribute in &element.attributes {
            let name = self.name(self.text(&attribute.namespace)?, self.text(&attribute.name)?)?;
            if name.namespace.is_some() && name.prefix.is_none() {
                warn!("attribute {} uses an undeclared namespace", name.local);
            }
            attributes.push(XmlAttr { name, value: self.value(attribute)?, resource_id: self.document.resource_id(attribute)? });
        }
        Ok(XmlEvent::StartTag { name, namespaces: std::mem::take(&mut self.declared), attributes, line: element.header.line })
    }

    fn translate(&mut self, node: &'d XmlNode) -> BlockResult<()> {
        if let Some(header) = node.header() {
            if !matches!(node, XmlNode::EndElement(_) | XmlNode::EndNamespace(_)) {
                if let Some(comment) = self.text(&header.comment)? {
                    self.queue.push_back(XmlEvent::Comment(comment));
                }
            }
        }
        match node {
            XmlNode::StartNamespace(ns) => {
                let decl = XmlNamespaceDecl {
                    prefix: self.text(&ns.prefix)?.unwrap_or_default(),
                    uri: self.text(&ns.uri)?.unwrap_or_default(),
                };
                self.namespaces.push(decl.clone());
                self.declared.push(decl);
            }
            XmlNode::EndNamespace(ns) => {
                let uri = self.text(&ns.uri)?.unwrap_or_default();
                if let Some(i) = self.namespaces.iter().rposition(|d| d.uri == uri) {
                    self.namespaces.remove(i);
                }
            }
            XmlNode::StartElement(element) => {
                let event = self.start_tag(element)?;
                self.queue.push_back(event);
            }
            XmlNode::EndElement(element) => {
                let name = self.name(self.text(&element.namespace)?, self.text(&element.name)?)?;
                self.queue.push_back(XmlEvent::EndTag { name, line: element.header.line });
            }
            XmlNode::CData(cdata) => {
                if let Some(text) = self.text(&cdata.data)? {
                    self.queue.push_back(XmlEvent::Text(text));
                }
            }
            XmlNode::Raw(_) => {}
        }
        Ok(())
    }
}

impl XmlPullSource for ResXmlPullParser<'_> {
    fn next_event(&mut self) -> BlockResult<Option<XmlEvent>> {
        if !self.started {
            self.started = true;
            return Ok(Some(XmlEvent::StartDocument));
        }
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Ok(Some(event));
            }
            let document = self.document;
            match document.nodes().get(self.position) {
                Some(node) => {
                    let index = self.position;
                    self.position += 1;
                    self.translate(node).map_err(|e| match document.node_offset(index) {
                        Some(offset) => err!(e, "xml node {} at 0x{:x}", index, offset),
                        None => err!(e, "xml node {}", index),
                    })?;
                }
                None if !self.finished => {
                    self.finished = true;
                    return Ok(Some(XmlEvent::EndDocument));
                }
                None => return Ok(None),
            }
        }
    }
}

fn utf8(bytes: &[u8]) -> BlockResult<String> {
    std::str::from_utf8(bytes).map(str::to_string).map_err(|e| BlockError::xml(e.to_string()))
}

fn split_qname(qname: &str) -> (&str, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (prefix, local),
        None => ("", qname),
    }
}

/// Reads XML text with quick-xml.
pub struct TextXmlPullParser<R> {
    reader: Reader<R>,
    buffer: Vec<u8>,
    scopes: Vec<Vec<XmlNamespaceDecl>>,
    queue: VecDeque<XmlEvent>,
    started: bool,
    finished: bool,
}

impl<'a> TextXmlPullParser<&'a [u8]> {
    pub fn from_str(text: &'a str) -> Self {
        Self::from_reader(text.as_bytes())
    }
}

impl<R: BufRead> TextXmlPullParser<R> {
    pub fn from_reader(input: R) -> Self {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(false);
        TextXmlPullParser { reader, buffer: Vec::new(), scopes: Vec::new(), queue: VecDeque::new(), started: false, finished: false }
    }

    fn lookup(&self, prefix: &str) -> Option<String> {
        match prefix {
            "xml" => Some("http://www.w3.org/XML/1998/namespace".to_string()),
            _ => self.scopes.iter().rev().flatten().find(|ns| ns.prefix == prefix).map(|ns| ns.uri.clone()),
        }
    }

    fn resolve(&self, qname: &str, is_element: bool) -> BlockResult<XmlName> {
        let (prefix, local) = split_qname(qname);
        if prefix.is_empty() {
            let namespace = if is_element { self.lookup("").filter(|uri| !uri.is_empty()) } else { None };
            return Ok(XmlName { namespace, prefix: None, local: local.to_string() });
        }
        match self.lookup(prefix) {
            Some(uri) => Ok(XmlName::qualified(prefix, &uri, local)),
            None => Err(BlockError::xml(format!("undeclared namespace prefix `{}`", prefix))),
        }
    }

    fn start_tag(&mut self, start: &BytesStart<'_>) -> BlockResult<XmlEvent> {
        let mut namespaces = Vec::new();
        let mut raw = Vec::new();
        for attr in start.attributes() {
            let attr = attr?;
            let key = utf8(attr.key.as_ref())?;
            let value = attr.unescape_value()?.into_owned();
            if key == "xmlns" {
                namespaces.push(XmlNamespaceDecl { prefix: String::new(), uri: value });
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                namespaces.push(XmlNamespaceDecl { prefix: prefix.to_string(), uri: value });
            } else {
                raw.push((key, value));
            }
        }
        self.scopes.push(namespaces.clone());
        let name = self.resolve(&utf8(start.name().as_ref())?, true)?;
        let mut attributes = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            attributes.push(XmlAttr { name: self.resolve(&key, false)?, value, resource_id: None });
        }
        Ok(XmlEvent::StartTag { name, namespaces, attributes, line: 0 })
    }

    fn end_tag(&mut self, qname: &str) -> BlockResult<XmlEvent> {
        let name = self.resolve(qname, true)?;
        self.scopes.pop();
        Ok(XmlEvent::EndTag { name, line: 0 })
    }

    fn read_next(&mut self) -> BlockResult<()> {
        let mut buffer = std::mem::take(&mut self.buffer);
        let event = match self.reader.read_event_into(&mut buffer) {
            Ok(event) => event,
            Err(e) => {
                let position = self.reader.buffer_position();
                let e = BlockError::from(e);
                return Err(err!(e, "byte {}", position));
            }
        };
        match event {
            Event::Start(start) => {
                let event = self.start_tag(&start)?;
                self.queue.push_back(event);
            }
            Event::Empty(start) => {
                let event = self.start_tag(&start)?;
                self.queue.push_back(event);
                let end = self.end_tag(&utf8(start.name().as_ref())?)?;
                self.queue.push_back(end);
            }
            Event::End(end) => {
                let event = self.end_tag(&utf8(end.name().as_ref())?)?;
                self.queue.push_back(event);
            }
            Event::Text(text) => {
                let text = text.unescape()?.into_owned();
                if text.trim().is_empty() {
                    self.queue.push_back(XmlEvent::IgnorableWhitespace(text));
                } else {
                    self.queue.push_back(XmlEvent::Text(text));
                }
            }
            Event::CData(data) => self.queue.push_back(XmlEvent::CData(utf8(&data)?)),
            Event::Comment(comment) => self.queue.push_back(XmlEvent::Comment(utf8(&comment)?)),
            Event::PI(pi) => self.queue.push_back(XmlEvent::ProcessingInstruction(utf8(&pi)?)),
            Event::DocType(doctype) => self.queue.push_back(XmlEvent::DocDecl(utf8(&doctype)?.trim().to_string())),
            Event::Decl(_) => {}
            Event::Eof => {
                if !self.scopes.is_empty() {
                    return Err(BlockError::xml(format!("document ends inside {} open elements", self.scopes.len())));
                }
                self.finished = true;
                self.queue.push_back(XmlEvent::EndDocument);
            }
        }
        buffer.clear();
        self.buffer = buffer;
        Ok(())
    }
}

impl<R: BufRead> XmlPullSource for TextXmlPullParser<R> {
    fn next_event(&mut self) -> BlockResult<Option<XmlEvent>> {
        if !self.started {
            self.started = true;
            return Ok(Some(XmlEvent::StartDocument));
        }
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }
            self.read_next()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arsc::config::ResConfig;
    use crate::arsc::value::ResValue;
    use crate::xml::document::{XmlEndElement, XmlNamespace, ANDROID_NAMESPACE};
    use crate::xml::event::collect_events;

    #[test]
    fn text_events_resolve_namespaces() {
        let text = r#"<?xml version="1.0" encoding="utf-8"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="a.b">
  <!-- app -->
  <application android:label="Hi &amp; bye"/>
</manifest>"#;
        let events = collect_events(&mut TextXmlPullParser::from_str(text)).unwrap();
        assert_eq!(events.first(), Some(&XmlEvent::StartDocument));
        assert_eq!(events.last(), Some(&XmlEvent::EndDocument));
        let starts: Vec<&XmlEvent> = events.iter().filter(|e| matches!(e, XmlEvent::StartTag { .. })).collect();
        assert_eq!(starts.len(), 2);
        match starts[1] {
            XmlEvent::StartTag { name, attributes, .. } => {
                assert_eq!(name.local, "application");
                assert_eq!(attributes[0].name.namespace.as_deref(), Some(ANDROID_NAMESPACE));
                assert_eq!(attributes[0].name.prefix.as_deref(), Some("android"));
                assert_eq!(attributes[0].value, "Hi & bye");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(events.contains(&XmlEvent::Comment(" app ".to_string())));
        assert_eq!(events.iter().filter(|e| matches!(e, XmlEvent::EndTag { .. })).count(), 2);
    }

    #[test]
    fn undeclared_prefix_is_an_xml_error() {
        let err = collect_events(&mut TextXmlPullParser::from_str("<a b:c=\"1\"/>")).unwrap_err();
        assert_eq!(err.kind(), crate::block::error::ErrorKind::Xml);
    }

    #[test]
    fn unclosed_element_is_an_xml_error() {
        assert!(collect_events(&mut TextXmlPullParser::from_str("<a><b></b>")).is_err());
    }

    #[test]
    fn binary_events_decode_values_and_references() {
        let mut table = TableBlock::new();
        let package = table.new_package(0x7f, "com.example").unwrap();
        package.get_or_create_type(1, "string").unwrap();
        package.add_entry(1, &ResConfig::default(), "app_name", ResValue::int(0)).unwrap();

        let mut doc = ResXmlDocument::new();
        let prefix = doc.strings_mut().get_or_create("android");
        let uri = doc.strings_mut().get_or_create(ANDROID_NAMESPACE);
        let app = doc.strings_mut().get_or_create("application");
        let label = doc.attribute_name("label", 0x0101_0001);
        let enabled = doc.strings_mut().get_or_create("enabled");
        let mut element = XmlStartElement::new(None, app);
        element.header.line = 7;
        element.attributes.push(XmlAttribute::new(Some(uri), label, ResValue::reference(0x7f01_0000)));
        element.attributes.push(XmlAttribute::new(None, enabled, ResValue::boolean(true)));
        doc.push_node(XmlNode::StartNamespace(XmlNamespace::new(prefix, uri)));
        doc.push_node(XmlNode::StartElement(element));
        doc.push_node(XmlNode::EndElement(XmlEndElement::new(None, app)));
        doc.push_node(XmlNode::EndNamespace(XmlNamespace::new(prefix, uri)));
        doc.refresh().unwrap();

        let plain = collect_events(&mut ResXmlPullParser::new(&doc)).unwrap();
        assert_eq!(plain.len(), 4);
        match &plain[1] {
            XmlEvent::StartTag { name, namespaces, attributes, line } => {
                assert_eq!(name.local, "application");
                assert_eq!(namespaces, &vec![XmlNamespaceDecl { prefix: "android".to_string(), uri: ANDROID_NAMESPACE.to_string() }]);
                assert_eq!(*line, 7);
                assert_eq!(attributes[0].value, "@0x7f010000");
                assert_eq!(attributes[0].resource_id, Some(0x0101_0001));
                assert_eq!(attributes[0].name.qname(), "android:label");
                assert_eq!(attributes[1].value, "true");
            }
            other => panic!("unexpected {:?}", other),
        }

        let context = PackageContext::default();
        let named = collect_events(&mut ResXmlPullParser::new(&doc).with_references(ReferenceNames::new(&table, &context))).unwrap();
        match &named[1] {
            XmlEvent::StartTag { attributes, .. } => assert_eq!(attributes[0].value, "@string/app_name"),
            other => panic!("unexpected {:?}", other),
        }

        let other = PackageContext::by_id(0x02);
        let qualified = collect_events(&mut ResXmlPullParser::new(&doc).with_references(ReferenceNames::new(&table, &other))).unwrap();
        match &qualified[1] {
            XmlEvent::StartTag { attributes, .. } => assert_eq!(attributes[0].value, "@com.example:string/app_name"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn broken_node_errors_name_its_offset() {
        let mut doc = ResXmlDocument::new();
        let app = doc.strings_mut().get_or_create("application");
        doc.push_node(XmlNode::StartElement(XmlStartElement::new(None, app)));
        doc.push_node(XmlNode::EndElement(XmlEndElement::new(None, app)));
        let mut bytes = doc.to_bytes().unwrap();
        let offset = doc.node_offset(0).unwrap();
        bytes[offset + 12..offset + 16].copy_from_slice(&0x7fffu32.to_le_bytes());

        let broken = ResXmlDocument::from_bytes(&bytes).unwrap();
        let err = collect_events(&mut ResXmlPullParser::new(&broken)).unwrap_err();
        assert!(err.is_resolution());
        assert!(err.to_string().contains(&format!("xml node 0 at 0x{:x}", offset)));
    }
}
