use std::collections::BTreeMap;
use std::fs;

use crate::dex::DexFile;
use crate::find_smali_files;
use crate::smali::{parse_class, SmaliClass};

const BASE: &str = r#"
.class public LBase;
.super Ljava/lang/Object;
.source "Base.java"

.field public static final LIMIT:I = 0x20

.method public constructor <init>()V
    .locals 0
    invoke-direct {p0}, Ljava/lang/Object;-><init>()V
    return-void
.end method

.method public static twice(I)I
    .locals 1
    .line 4
    add-int v0, p0, p0
    return v0
.end method
"#;

const CHILD: &str = r#"
.class public final LChild;
.super LBase;
.source "Child.java"

.method public constructor <init>()V
    .locals 0
    invoke-direct {p0}, LBase;-><init>()V
    return-void
.end method

.method public static describe()Ljava/lang/String;
    .locals 2
    sget v0, LBase;->LIMIT:I
    invoke-static {v0}, LBase;->twice(I)I
    move-result v0
    if-lez v0, :cond_0
    const-string v1, "positive"
    return-object v1
    :cond_0
    const-string v1, "empty"
    return-object v1
.end method
"#;

fn class_smali_map(dex: &DexFile) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (index, descriptor) in dex.class_descriptors().unwrap().into_iter().enumerate() {
        map.insert(descriptor, dex.class_to_smali(index).unwrap().to_smali());
    }
    map
}

fn build(classes: &[&str]) -> DexFile {
    let mut dex = DexFile::new();
    for text in classes {
        dex.add_class(&parse_class(text).unwrap()).unwrap();
    }
    dex
}

#[test]
fn classes_survive_write_and_reload() {
    let mut dex = build(&[BASE, CHILD]);
    let original = class_smali_map(&dex);
    assert_eq!(original.keys().collect::<Vec<_>>(), vec!["LBase;", "LChild;"]);

    let bytes = dex.to_bytes().unwrap();
    let mut reloaded = DexFile::from_bytes(&bytes).unwrap();
    assert_eq!(class_smali_map(&reloaded), original);
    assert_eq!(reloaded.to_bytes().unwrap(), bytes);
}

#[test]
fn insertion_order_does_not_change_class_text() {
    let mut forward = build(&[BASE, CHILD]);
    let mut backward = build(&[CHILD, BASE]);
    assert_eq!(backward.class_descriptors().unwrap(), vec!["LChild;", "LBase;"]);

    let forward = DexFile::from_bytes(&forward.to_bytes().unwrap()).unwrap();
    let backward = DexFile::from_bytes(&backward.to_bytes().unwrap()).unwrap();
    assert_eq!(class_smali_map(&forward), class_smali_map(&backward));
}

#[test]
fn adding_a_class_keeps_existing_references() {
    let mut dex = build(&[CHILD]);
    let bytes = dex.to_bytes().unwrap();
    let mut reloaded = DexFile::from_bytes(&bytes).unwrap();
    let before = reloaded.class_to_smali(0).unwrap();

    reloaded.get_or_create_string("aardvark");
    reloaded.add_class(&parse_class(BASE).unwrap()).unwrap();
    let bytes = reloaded.to_bytes().unwrap();
    let again = DexFile::from_bytes(&bytes).unwrap();
    let map = class_smali_map(&again);
    assert_eq!(map["LChild;"], before.to_smali());
    assert!(map["LChild;"].contains("const-string v1, \"positive\""));
}

#[test]
fn smali_tree_is_collected_recursively() {
    let root = std::env::temp_dir().join(format!("apkblock-smali-{}", std::process::id()));
    let nested = root.join("com").join("example");
    fs::create_dir_all(&nested).unwrap();
    fs::write(root.join("Base.smali"), BASE).unwrap();
    fs::write(nested.join("Child.smali"), CHILD).unwrap();
    fs::write(nested.join("notes.txt"), "not smali").unwrap();

    let mut classes: Vec<SmaliClass> = find_smali_files(&root).unwrap();
    fs::remove_dir_all(&root).unwrap();
    classes.sort_by(|a, b| a.descriptor.cmp(&b.descriptor));
    let descriptors: Vec<&str> = classes.iter().map(|c| c.descriptor.as_str()).collect();
    assert_eq!(descriptors, vec!["LBase;", "LChild;"]);

    let mut dex = DexFile::new();
    for class in &classes {
        dex.add_class(class).unwrap();
    }
    let bytes = dex.to_bytes().unwrap();
    assert_eq!(DexFile::from_bytes(&bytes).unwrap().class_descriptors().unwrap().len(), 2);
}
