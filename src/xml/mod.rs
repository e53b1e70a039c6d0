//! Compiled XML documents and the event bridge between them and XML text.
//!
//! Sources implement [`XmlPullSource`], sinks implement [`XmlPushSink`];
//! [`ParserToSerializer`] moves one document from a source into a sink and
//! [`DocumentSerializer`] wraps the whole load, transform and write cycle.

pub mod document;
pub mod event;
pub mod pull;
pub mod push;

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Mutex;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::arsc::table::{PackageContext, TableBlock};
use crate::block::error::{BlockError, BlockResult};
use crate::source::InputSource;

pub use crate::xml::document::{
    ResXmlDocument, XmlAttribute, XmlCData, XmlEndElement, XmlNamespace, XmlNode, XmlStartElement, ANDROID_NAMESPACE, RES_AUTO_NAMESPACE,
};
pub use crate::xml::event::{collect_events, EventReplay, XmlAttr, XmlEvent, XmlName, XmlNamespaceDecl, XmlPullSource, XmlPushSink};
pub use crate::xml::pull::{ReferenceNames, ResXmlPullParser, TextXmlPullParser};
pub use crate::xml::push::{encode_value, ResXmlDocumentBuilder, TextXmlSerializer};

/// Knobs for [`DocumentSerializer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XmlOptions {
    /// Spaces per nesting level in written text; 0 keeps everything on one line.
    pub indent: usize,
    /// Run [`ResXmlDocument::fix_attribute_namespaces`] on every loaded document.
    pub fix_attribute_namespaces: bool,
    /// Print resource ids as `@type/name` when a table is at hand.
    pub decode_references: bool,
}

impl Default for XmlOptions {
    fn default() -> Self {
        XmlOptions { indent: 4, fix_attribute_namespaces: false, decode_references: true }
    }
}

/// Pumps events from a source into a sink.
///
/// Depth goes up on start events and down on end events; the transfer stops
/// once it is back at zero after having been positive, so a source without
/// an end-of-document event still terminates after its root element.
#[derive(Debug, Default)]
pub struct ParserToSerializer {
    depth: i32,
    seen_start: bool,
}

impl ParserToSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> i32 {
        self.depth
    }

    /// Returns the number of events handed to `sink`.
    pub fn transfer<P, S>(&mut self, source: &mut P, sink: &mut S) -> BlockResult<usize>
    where
        P: XmlPullSource + ?Sized,
        S: XmlPushSink + ?Sized,
    {
        let mut count = 0;
        while let Some(event) = source.next_event()? {
            self.depth += event.depth_change();
            if self.depth > 0 {
                self.seen_start = true;
            }
            sink.push(event)?;
            count += 1;
            if self.seen_start && self.depth == 0 {
                break;
            }
        }
        if self.depth != 0 {
            return Err(BlockError::xml(format!("event stream ended at depth {}", self.depth)));
        }
        sink.finish()?;
        Ok(count)
    }
}

/// Rewrites a freshly loaded document before any event leaves it.
pub type PostLoadHook = Box<dyn Fn(&mut ResXmlDocument) -> BlockResult<()> + Send + Sync>;

/// Converts whole documents, one conversion at a time.
///
/// Every entry point takes the same lock, so a serializer shared between
/// threads never interleaves two conversions.
pub struct DocumentSerializer {
    options: XmlOptions,
    context: PackageContext,
    post_load: Option<PostLoadHook>,
    lock: Mutex<()>,
}

impl Default for DocumentSerializer {
    fn default() -> Self {
        Self::new(XmlOptions::default())
    }
}

impl DocumentSerializer {
    pub fn new(options: XmlOptions) -> Self {
        DocumentSerializer { options, context: PackageContext::default(), post_load: None, lock: Mutex::new(()) }
    }

    /// Package whose references are written without a package qualifier.
    pub fn with_context(mut self, context: PackageContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_post_load<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut ResXmlDocument) -> BlockResult<()> + Send + Sync + 'static,
    {
        self.post_load = Some(Box::new(hook));
        self
    }

    pub fn options(&self) -> &XmlOptions {
        &self.options
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        // The lock guards no data, so a poisoned lock is still usable.
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn post_process(&self, document: &mut ResXmlDocument) -> BlockResult<()> {
        if self.options.fix_attribute_namespaces {
            document.fix_attribute_namespaces()?;
        }
        if let Some(hook) = &self.post_load {
            hook(document)?;
        }
        Ok(())
    }

    fn load_unlocked(&self, source: &mut dyn InputSource) -> BlockResult<ResXmlDocument> {
        let path = Path::new(source.name()).to_path_buf();
        let bytes = source.read_all();
        source.dispose();
        let bytes = bytes.map_err(|e| e.with_path(&path))?;
        let mut document = ResXmlDocument::from_bytes(&bytes).map_err(|e| e.with_path(&path))?;
        self.post_process(&mut document).map_err(|e| e.with_path(&path))?;
        debug!("loaded {} with {} nodes", path.display(), document.nodes().len());
        Ok(document)
    }

    fn write_text_unlocked<W: Write>(&self, document: &ResXmlDocument, table: Option<&TableBlock>, out: W) -> BlockResult<W> {
        let mut parser = ResXmlPullParser::new(document);
        if let (true, Some(table)) = (self.options.decode_references, table) {
            parser = parser.with_references(ReferenceNames::new(table, &self.context));
        }
        let mut serializer = TextXmlSerializer::new(out, self.options.indent);
        ParserToSerializer::new().transfer(&mut parser, &mut serializer)?;
        Ok(serializer.into_inner())
    }

    /// Reads a compiled document from `source`, then runs the post-load steps.
    pub fn load(&self, source: &mut dyn InputSource) -> BlockResult<ResXmlDocument> {
        let _guard = self.guard();
        self.load_unlocked(source)
    }

    /// Writes `document` as XML text into `out`.
    pub fn write_text<W: Write>(&self, document: &ResXmlDocument, table: Option<&TableBlock>, out: W) -> BlockResult<W> {
        let _guard = self.guard();
        self.write_text_unlocked(document, table, out)
    }

    /// Loads a compiled document and writes it as text in one locked pass.
    pub fn decompile<W: Write>(&self, source: &mut dyn InputSource, table: Option<&TableBlock>, out: W) -> BlockResult<W> {
        let _guard = self.guard();
        let document = self.load_unlocked(source)?;
        let name = Path::new(source.name()).to_path_buf();
        self.write_text_unlocked(&document, table, out).map_err(|e| e.with_path(&name))
    }

    /// Compiles XML text into a document through `builder`.
    pub fn compile<R: BufRead>(&self, input: R, mut builder: ResXmlDocumentBuilder) -> BlockResult<ResXmlDocument> {
        let _guard = self.guard();
        let mut parser = TextXmlPullParser::from_reader(input);
        ParserToSerializer::new().transfer(&mut parser, &mut builder)?;
        let mut document = builder.into_document();
        self.post_process(&mut document)?;
        Ok(document)
    }

    /// Refreshes `document` and writes its bytes to `path`.
    pub fn write_file(&self, document: &mut ResXmlDocument, path: &Path) -> BlockResult<()> {
        let _guard = self.guard();
        document.write_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::error::ErrorKind;
    use crate::source::ByteInputSource;

    const MANIFEST: &str = "<manifest xmlns:android=\"http://schemas.android.com/apk/res/android\" package=\"com.example\">\
<application android:label=\"7\" android:enabled=\"true\"/></manifest>";

    fn start(name: &str) -> XmlEvent {
        XmlEvent::StartTag { name: XmlName::local(name), namespaces: vec![], attributes: vec![], line: 0 }
    }

    fn end(name: &str) -> XmlEvent {
        XmlEvent::EndTag { name: XmlName::local(name), line: 0 }
    }

    #[test]
    fn transfer_stops_when_depth_returns_to_zero() {
        let mut source = EventReplay::new(vec![start("a"), start("b"), end("b"), end("a"), XmlEvent::Text("after".to_string())]);
        let mut sink: Vec<XmlEvent> = Vec::new();
        let mut pump = ParserToSerializer::new();
        assert_eq!(pump.transfer(&mut source, &mut sink).unwrap(), 4);
        assert_eq!(pump.depth(), 0);
        assert_eq!(source.next_event().unwrap(), Some(XmlEvent::Text("after".to_string())));
    }

    #[test]
    fn truncated_stream_is_an_xml_error() {
        let mut source = EventReplay::new(vec![start("a"), start("b"), end("b")]);
        let mut sink: Vec<XmlEvent> = Vec::new();
        let err = ParserToSerializer::new().transfer(&mut source, &mut sink).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Xml);
    }

    #[test]
    fn text_compiles_and_decompiles_back() {
        let serializer = DocumentSerializer::new(XmlOptions { indent: 0, ..XmlOptions::default() });
        let mut document = serializer.compile(MANIFEST.as_bytes(), ResXmlDocumentBuilder::new()).unwrap();
        let bytes = document.to_bytes().unwrap();

        let mut source = ByteInputSource::new("AndroidManifest.xml", bytes);
        let text = serializer.decompile(&mut source, None, Vec::new()).unwrap();
        assert!(source.is_disposed());
        assert_eq!(String::from_utf8(text).unwrap(), format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>{}", MANIFEST));
    }

    #[test]
    fn post_load_hook_sees_the_document_first() {
        let serializer = DocumentSerializer::new(XmlOptions { indent: 0, ..XmlOptions::default() }).with_post_load(|document| {
            for node in document.nodes_mut().iter_mut() {
                if let Some(header) = node.header_mut() {
                    header.line = 42;
                }
            }
            Ok(())
        });
        let mut document = serializer.compile(MANIFEST.as_bytes(), ResXmlDocumentBuilder::new()).unwrap();
        assert!(document.nodes().iter().all(|n| n.line() == Some(42)));

        let mut source = ByteInputSource::new("AndroidManifest.xml", document.to_bytes().unwrap());
        let loaded = serializer.load(&mut source).unwrap();
        assert_eq!(loaded.nodes().len(), 6);
    }

    #[test]
    fn load_errors_carry_the_source_name() {
        let serializer = DocumentSerializer::default();
        let mut source = ByteInputSource::new("res/layout/broken.xml", vec![3, 0, 8, 0]);
        let err = serializer.load(&mut source).unwrap_err();
        assert!(err.to_string().contains("broken.xml"));
    }

    #[derive(Default)]
    struct UnreadableSource {
        disposed: bool,
    }

    impl InputSource for UnreadableSource {
        fn name(&self) -> &str {
            "res/xml/locked.xml"
        }

        fn open_stream(&mut self) -> BlockResult<Box<dyn std::io::Read + '_>> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked").into())
        }

        fn dispose(&mut self) {
            self.disposed = true;
        }
    }

    #[test]
    fn unreadable_source_is_still_disposed() {
        let serializer = DocumentSerializer::default();
        let mut source = UnreadableSource::default();
        let err = serializer.load(&mut source).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("locked.xml"));
        assert!(source.disposed);
    }
}
