//! Smali text for dex classes.
//!
//! The [`model`] types mirror what a `.smali` file says: labels instead of
//! code addresses, `v`/`p` registers and symbolic references. [`parse`]
//! reads them from text, [`write`] prints them back, and [`convert`] moves
//! whole classes between the model and a [`DexFile`](crate::dex::DexFile).

pub mod convert;
pub mod model;
pub mod parse;
pub mod write;

use serde::{Deserialize, Serialize};

pub use crate::smali::model::{
    Register, SmaliAnnotation, SmaliAnnotationElement, SmaliCatch, SmaliClass, SmaliCode, SmaliField, SmaliInstruction, SmaliMethod,
    SmaliParameter, SmaliReference, SmaliValue,
};
pub use crate::smali::parse::{
    parse_annotation, parse_annotation_element, parse_class, parse_code, parse_field_key, parse_instruction, parse_method_key, parse_value,
};
pub use crate::smali::write::{to_smali, SmaliAppend, SmaliWriter};

/// Output knobs for the smali writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmaliOptions
{
    /// Precede every instruction with a `# 0x..` comment holding its code address.
    pub comment_addresses: bool,
    pub indent: usize,
}

impl Default for SmaliOptions
{
    fn default() -> Self
    {
        SmaliOptions { comment_addresses: false, indent: 4 }
    }
}
