//! The dex executable format.
//!
//! A [`DexFile`] holds every section as a [`Pool`](crate::block::pool::Pool);
//! records reference each other through index and offset references that
//! survive reordering. [`DexFile::refresh`] rewrites all of them, lays the
//! file out again and recomputes the header.

pub mod annotation;
pub mod class;
pub mod code;
pub mod debug;
pub mod file;
pub mod header;
pub mod ids;
pub mod ins;
pub mod key;
pub mod opcode;
pub mod section;
pub mod value;

use serde::{Deserialize, Serialize};

pub use crate::dex::class::{ClassData, ClassDef, EncodedField, EncodedMethod};
pub use crate::dex::code::CodeItem;
pub use crate::dex::file::DexFile;
pub use crate::dex::ids::IdPools;
pub use crate::dex::key::{FieldKey, MethodKey, ProtoKey};
pub use crate::dex::value::{DexValue, EncodedValue};

/// Knobs for [`DexFile::refresh`] and serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DexOptions
{
    /// Re-sort identifier pools into canonical order on every refresh.
    pub sort_ids_on_refresh: bool,
    pub max_layout_passes: usize,
    /// Recompute the header signature and checksum when writing.
    pub update_checksum: bool,
}

impl Default for DexOptions
{
    fn default() -> Self
    {
        DexOptions { sort_ids_on_refresh: true, max_layout_passes: 8, update_checksum: true }
    }
}
