mod dex_roundtrip;
mod table_roundtrip;
mod xml_roundtrip;
