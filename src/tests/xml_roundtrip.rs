use crate::arsc::config::ResConfig;
use crate::arsc::table::TableBlock;
use crate::arsc::value::ResValue;
use crate::source::ByteInputSource;
use crate::xml::{DocumentSerializer, ResXmlDocument, ResXmlDocumentBuilder, XmlNode, XmlOptions, ANDROID_NAMESPACE};

const DECL: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>";

fn table() -> TableBlock {
    let mut table = TableBlock::new();
    let hello = table.strings_mut().get_or_create("Hello");
    let app = table.new_package(0x7f, "com.example.app").unwrap();
    app.get_or_create_type(1, "string").unwrap();
    app.add_entry(1, &ResConfig::default(), "greeting", ResValue::string(hello)).unwrap();
    table
}

fn one_line() -> XmlOptions {
    XmlOptions { indent: 0, ..XmlOptions::default() }
}

fn manifest(label: &str) -> String {
    format!(
        "<manifest xmlns:android=\"{}\" package=\"com.example.app\">\
<application android:label=\"{}\" android:allowBackup=\"false\"><activity android:name=\".Main\"/></application></manifest>",
        ANDROID_NAMESPACE, label
    )
}

fn builder() -> ResXmlDocumentBuilder {
    ResXmlDocumentBuilder::new()
        .with_attribute_id(ANDROID_NAMESPACE, "label", 0x0101_0001)
        .with_attribute_id(ANDROID_NAMESPACE, "allowBackup", 0x0101_0280)
        .with_attribute_id(ANDROID_NAMESPACE, "name", 0x0101_0003)
}

#[test]
fn text_to_binary_to_text() {
    let serializer = DocumentSerializer::new(one_line());
    let mut document = serializer.compile(manifest("@0x7f010000").as_bytes(), builder()).unwrap();
    let bytes = document.to_bytes().unwrap();
    assert_eq!(ResXmlDocument::from_bytes(&bytes).unwrap().to_bytes().unwrap(), bytes);

    let mut source = ByteInputSource::new("AndroidManifest.xml", bytes.clone());
    let plain = serializer.decompile(&mut source, None, Vec::new()).unwrap();
    assert_eq!(String::from_utf8(plain).unwrap(), format!("{}{}", DECL, manifest("@0x7f010000")));

    let table = table();
    let mut source = ByteInputSource::new("AndroidManifest.xml", bytes);
    let named = serializer.decompile(&mut source, Some(&table), Vec::new()).unwrap();
    assert_eq!(String::from_utf8(named).unwrap(), format!("{}{}", DECL, manifest("@string/greeting")));
}

#[test]
fn compiled_attributes_carry_resource_ids() {
    let serializer = DocumentSerializer::new(one_line());
    let document = serializer.compile(manifest("@0x7f010000").as_bytes(), builder()).unwrap();
    let application = document
        .nodes()
        .iter()
        .filter_map(|node| match node {
            XmlNode::StartElement(element) => Some(element),
            _ => None,
        })
        .nth(1)
        .unwrap();
    assert_eq!(document.text(&application.name).unwrap(), Some("application"));
    let ids: Vec<Option<u32>> = application.attributes.iter().map(|a| document.resource_id(a).unwrap()).collect();
    assert_eq!(ids, vec![Some(0x0101_0001), Some(0x0101_0280)]);
    assert_eq!(application.attributes[0].value, ResValue::reference(0x7f01_0000));
    assert_eq!(application.attributes[1].value, ResValue::boolean(false));
}

#[test]
fn namespaces_are_repaired_on_load() {
    let compiler = DocumentSerializer::new(one_line());
    let bare = ResXmlDocumentBuilder::new().with_attribute_id("", "icon", 0x0101_0002);
    let mut document = compiler.compile("<application icon=\"@0x7f020000\"/>".as_bytes(), bare).unwrap();
    let bytes = document.to_bytes().unwrap();

    let untouched = compiler.decompile(&mut ByteInputSource::new("a.xml", bytes.clone()), None, Vec::new()).unwrap();
    assert_eq!(String::from_utf8(untouched).unwrap(), format!("{}<application icon=\"@0x7f020000\"/>", DECL));

    let repairing = DocumentSerializer::new(XmlOptions { fix_attribute_namespaces: true, ..one_line() });
    let fixed = repairing.decompile(&mut ByteInputSource::new("a.xml", bytes), None, Vec::new()).unwrap();
    assert_eq!(
        String::from_utf8(fixed).unwrap(),
        format!("{}<application xmlns:android=\"{}\" android:icon=\"@0x7f020000\"/>", DECL, ANDROID_NAMESPACE)
    );
}
