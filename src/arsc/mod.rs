//! Compiled Android resource tables (`resources.arsc`) and the chunk pieces
//! shared with binary XML.

pub mod chunk;
pub mod config;
pub mod entry;
pub mod package;
pub mod string_pool;
pub mod table;
pub mod type_pool;
pub mod value;

pub use config::ResConfig;
pub use entry::{EntryBody, EntryFlags, ResEntry, ResTableMap};
pub use package::{PackageBlock, ResourceName, TypeBlock, TypeSpecBlock};
pub use string_pool::{ResString, ResStyle, StringPoolChunk};
pub use table::{PackageContext, TableBlock};
pub use type_pool::TypeStringPool;
pub use value::ResValue;
