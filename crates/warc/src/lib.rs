//! Hash-indexed ARC archive container: tree model, reader and writer.
//!
//! An archive is read into an [`Archive`] whose file contents stay on disk
//! until asked for, edited in memory, and written back with
//! [`Archive::write`] or [`Archive::save`].

pub mod archive;
pub mod compression;
pub mod entry;
pub mod error;
pub mod hash;
pub mod index;
pub mod pack;
pub mod policy;
pub mod reader;
pub mod writer;

pub use archive::{Archive, DirId, Directory};
pub use entry::{DataHeader, FileContentSource, FileEntry, LazyArchiveRef, SharedStream};
pub use error::{ArcError, ArcResult};
pub use policy::{ArchivePolicy, CompressionFilter};
pub use reader::ArchiveReader;
pub use writer::ArchiveWriter;

/// Fixed 20-byte archive header.
pub const MAGIC: [u8; 20] = [
    0x77, 0x61, 0x72, 0x63, 0xFF, 0xAA, 0x45, 0xF1, 0xE8, 0x03, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00,
    0x02, 0x00, 0x00, 0x00,
];
/// Leading bytes of the encrypted ("warp") archive variant.
pub const ENCRYPTED_MAGIC_PREFIX: [u8; 8] = [0x77, 0x61, 0x72, 0x70, 0xE8, 0x03, 0x00, 0x00];

pub(crate) const DATA_HEADER_LEN: u64 = 16;

pub(crate) const BLOCK_HASH_TABLE_UTF16: i32 = 0;
pub(crate) const BLOCK_HASH_TABLE_UTF8: i32 = 1;
pub(crate) const BLOCK_NAME_TABLE: i32 = 3;
