use crate::arsc::config::ResConfig;
use crate::arsc::string_pool::ResString;
use crate::arsc::table::{PackageContext, TableBlock};
use crate::arsc::value::ResValue;

fn french() -> ResConfig {
    let mut config = ResConfig::default();
    config.set_language("fr");
    config
}

fn two_packages() -> TableBlock {
    let mut table = TableBlock::new();
    let hello = table.strings_mut().get_or_create("Hello");
    let bonjour = table.strings_mut().get_or_create("Bonjour");

    let app = table.new_package(0x7f, "com.example.app").unwrap();
    app.get_or_create_type(1, "string").unwrap();
    app.get_or_create_type(2, "integer").unwrap();
    assert_eq!(app.add_entry(1, &ResConfig::default(), "greeting", ResValue::string(hello)).unwrap(), 0x7f01_0000);
    assert_eq!(app.add_entry(1, &french(), "greeting", ResValue::string(bonjour)).unwrap(), 0x7f01_0000);
    assert_eq!(app.add_entry(2, &ResConfig::default(), "max_items", ResValue::int(12)).unwrap(), 0x7f02_0000);

    let lib = table.new_package(0x02, "com.example.lib").unwrap();
    lib.get_or_create_type(1, "color").unwrap();
    lib.add_entry(1, &ResConfig::default(), "accent", ResValue::color(0xff33_6699)).unwrap();
    table
}

#[test]
fn table_with_two_packages_round_trips() {
    let mut table = two_packages();
    let bytes = table.to_bytes().unwrap();
    let mut back = TableBlock::from_bytes(&bytes).unwrap();
    assert_eq!(back.to_bytes().unwrap(), bytes);
    assert_eq!(back.packages().count(), 2);

    let names: Vec<String> = [0x7f01_0000, 0x7f02_0000, 0x0201_0000]
        .iter()
        .map(|id| back.resolve_reference(*id).unwrap().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["com.example.app:string/greeting", "com.example.app:integer/max_items", "com.example.lib:color/accent"]);
}

#[test]
fn localized_values_resolve_per_config() {
    let mut table = two_packages();
    let bytes = table.to_bytes().unwrap();
    let back = TableBlock::from_bytes(&bytes).unwrap();
    let app = back.pick_package(&PackageContext::default()).unwrap();
    assert_eq!(app.name(), "com.example.app");

    let strings = back.strings().strings();
    let default = app.find_entry(0x7f01_0000, &ResConfig::default()).unwrap().value().unwrap();
    let localized = app.find_entry(0x7f01_0000, &french()).unwrap().value().unwrap();
    assert_eq!(default.string_text(strings).unwrap(), Some("Hello"));
    assert_eq!(localized.string_text(strings).unwrap(), Some("Bonjour"));

    let max = app.find_entry(0x7f02_0000, &ResConfig::default()).unwrap().value().unwrap();
    assert_eq!(max.decode_text(strings).unwrap(), "12");
    assert!(app.find_entry(0x7f02_0000, &french()).is_none());
}

#[test]
fn edits_after_load_keep_every_value() {
    let mut table = two_packages();
    let bytes = table.to_bytes().unwrap();
    let mut back = TableBlock::from_bytes(&bytes).unwrap();

    back.strings_mut().strings_mut().insert(0, ResString::new("Aloha"));
    let aloha = back.strings_mut().get_or_create("Aloha");
    let app = back.package_mut(0x7f).unwrap();
    assert_eq!(app.add_entry(1, &ResConfig::default(), "farewell", ResValue::string(aloha)).unwrap(), 0x7f01_0001);

    let bytes = back.to_bytes().unwrap();
    let again = TableBlock::from_bytes(&bytes).unwrap();
    let strings = again.strings().strings();
    let app = again.package(0x7f).unwrap();
    let text = |id: u32| app.find_entry(id, &ResConfig::default()).unwrap().value().unwrap().string_text(strings).unwrap();
    assert_eq!(text(0x7f01_0000), Some("Hello"));
    assert_eq!(text(0x7f01_0001), Some("Aloha"));
    assert_eq!(again.resolve_reference(0x7f01_0001).unwrap().unwrap().entry_name, "farewell");
    assert_eq!(again.strings().len(), 3);
}
