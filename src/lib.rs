//! # apkblock
//!
//! Read, edit and write the binary formats inside an Android package: the
//! compiled resource table (`resources.arsc`), dex executables and compiled
//! XML documents, plus smali and XML text for the latter two.
//!
//! Every format is a tree of [`block::Block`]s. Cross references are held by
//! identity and only turned into numbers when a tree is refreshed, so records
//! can be added, removed and reordered freely between load and write.
//!
use crate::block::error::{BlockError, BlockResult};
use crate::smali::SmaliClass;
use std::path::Path;

#[macro_use]
pub mod block;
pub mod arsc;
pub mod dex;
pub mod smali;
pub mod source;
pub mod xml;

#[cfg(test)]
mod tests;

pub use crate::block::error::ErrorKind;

/// Recurses a base path, typically a `smali` folder from apktool, returning every class found.
///
/// # Examples
///
/// ```no_run
///  use apkblock::find_smali_files;
///  use std::path::Path;
///
///  let classes = find_smali_files(Path::new("smali")).unwrap();
///  println!("{:} smali classes loaded.", classes.len());
/// ```
pub fn find_smali_files(dir: &Path) -> BlockResult<Vec<SmaliClass>> {
    let mut results = vec![];

    let entries = dir.read_dir().map_err(|e| BlockError::from(e).with_path(dir))?;
    for entry in entries {
        let entry = entry.map_err(|e| BlockError::from(e).with_path(dir))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| BlockError::from(e).with_path(&path))?;
        if file_type.is_dir() {
            results.extend(find_smali_files(&path)?);
        } else if path.extension().map_or(false, |ext| ext == "smali") {
            results.push(SmaliClass::read_file(&path)?);
        }
    }

    Ok(results)
}
