use std::io::{Cursor, Read, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::{debug, info, trace};

use crate::{
    archive::{Archive, DirId},
    compression,
    entry::{
        share_stream, ArchiveStream, DataHeader, FileContentSource, LazyArchiveRef, SharedStream,
    },
    error::{ArcError, ArcResult},
    index::{HashTableNode, NameTable},
    BLOCK_HASH_TABLE_UTF16, BLOCK_HASH_TABLE_UTF8, BLOCK_NAME_TABLE, ENCRYPTED_MAGIC_PREFIX, MAGIC,
};

/// Raw payloads of the three metadata blocks.
#[derive(Debug, Default)]
struct MetadataBlocks {
    utf16: Option<Vec<u8>>,
    utf8: Option<Vec<u8>>,
    names: Option<Vec<u8>>,
}

impl MetadataBlocks {
    fn missing(&self) -> i32 {
        if self.utf16.is_none() {
            BLOCK_HASH_TABLE_UTF16
        } else if self.utf8.is_none() {
            BLOCK_HASH_TABLE_UTF8
        } else {
            BLOCK_NAME_TABLE
        }
    }

    /// Reads blocks until one of each type has been seen and returns the
    /// UTF-16 table, UTF-8 table and inflated name table.
    fn scan(s: &mut dyn ArchiveStream) -> ArcResult<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let mut blocks = Self::default();
        loop {
            if let Self {
                utf16: Some(utf16),
                utf8: Some(utf8),
                names: Some(names),
            } = blocks
            {
                return Ok((utf16, utf8, names));
            }
            let missing = blocks.missing();
            let block_type = match s.read_i32::<LittleEndian>() {
                Ok(t) => t,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(ArcError::MissingMetadataBlock(missing));
                }
                Err(e) => return Err(e.into()),
            };
            let size = s.read_i64::<LittleEndian>()?;
            trace!(block_type, size, "metadata block");
            if !matches!(
                block_type,
                BLOCK_HASH_TABLE_UTF16 | BLOCK_HASH_TABLE_UTF8 | BLOCK_NAME_TABLE
            ) {
                return Err(ArcError::UnknownMetadataBlockType(block_type));
            }
            let size = u64::try_from(size)
                .map_err(|_| ArcError::corrupt(format!("block {block_type} has size {size}")))?;
            let payload = read_payload(s, size)?;
            match block_type {
                BLOCK_HASH_TABLE_UTF16 => blocks.utf16 = Some(payload),
                BLOCK_HASH_TABLE_UTF8 => blocks.utf8 = Some(payload),
                _ => blocks.names = Some(unwrap_name_table(&payload)?),
            }
        }
    }
}

fn read_payload(s: &mut dyn ArchiveStream, size: u64) -> ArcResult<Vec<u8>> {
    let mut buf = Vec::new();
    Read::take(&mut *s, size).read_to_end(&mut buf)?;
    if (buf.len() as u64) < size {
        return Err(ArcError::UnexpectedEnd);
    }
    Ok(buf)
}

fn unwrap_name_table(payload: &[u8]) -> ArcResult<Vec<u8>> {
    let mut r = Cursor::new(payload);
    let header = DataHeader::read_from(&mut r)?;
    let start = r.position() as usize;
    let data = payload
        .get(start..start + header.stored_size as usize)
        .ok_or(ArcError::UnexpectedEnd)?;
    if header.compressed {
        compression::decompress(data, header.raw_size)
    } else {
        Ok(data.to_vec())
    }
}

fn check_magic(s: &mut dyn ArchiveStream) -> ArcResult<()> {
    let mut header = Vec::with_capacity(MAGIC.len());
    Read::take(&mut *s, MAGIC.len() as u64).read_to_end(&mut header)?;
    if header.starts_with(&ENCRYPTED_MAGIC_PREFIX) {
        return Err(ArcError::UnsupportedEncryptedArchive);
    }
    if header == MAGIC {
        Ok(())
    } else if MAGIC.starts_with(&header) {
        Err(ArcError::UnexpectedEnd)
    } else {
        Err(ArcError::MalformedHeader)
    }
}

fn display_name(stored: &str) -> &str {
    stored
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(stored)
}

/// Parses an archive stream into an [`Archive`] whose files read lazily
/// from that same stream.
pub struct ArchiveReader {
    stream: SharedStream,
}

impl ArchiveReader {
    pub fn new<R: ArchiveStream + 'static>(stream: R) -> Self {
        Self::from_shared(share_stream(stream))
    }

    pub fn from_shared(stream: SharedStream) -> Self {
        Self { stream }
    }

    pub fn read(self) -> ArcResult<Archive> {
        let (base, blocks) = {
            let mut guard = self.stream.lock();
            let s: &mut dyn ArchiveStream = &mut *guard;
            s.seek(SeekFrom::Start(0))?;
            check_magic(s)?;

            let metadata_offset = s.read_i64::<LittleEndian>()?;
            let base = s.stream_position()?;
            let metadata_pos = base.checked_add_signed(metadata_offset).ok_or_else(|| {
                ArcError::corrupt(format!("metadata offset {metadata_offset} before start"))
            })?;
            debug!(base, metadata_pos, "seeking to metadata");
            s.seek(SeekFrom::Start(metadata_pos))?;

            (base, MetadataBlocks::scan(s)?)
        };
        let (utf16, utf8, names) = blocks;

        let index = HashTableNode::parse(&utf16)?;
        let utf8_index = HashTableNode::parse(&utf8)?;
        let (dirs, files) = index.totals();
        if utf8_index.totals() != (dirs, files) {
            return Err(ArcError::corrupt(format!(
                "UTF-8 index holds {:?} directories/files, UTF-16 index holds {:?}",
                utf8_index.totals(),
                (dirs, files)
            )));
        }
        let names = NameTable::parse(&names)?;
        debug!(dirs, files, names = names.len(), "parsed index");

        let mut archive = Archive::new(display_name(names.resolve(index.id)?));
        self.populate(&mut archive, &index, Archive::ROOT, base, &names)?;
        info!(name = archive.name(), dirs, files, "Read archive");
        Ok(archive)
    }

    fn populate(
        &self,
        archive: &mut Archive,
        node: &HashTableNode,
        dir: DirId,
        base: u64,
        names: &NameTable,
    ) -> ArcResult<()> {
        for file in &node.files {
            let name = names.resolve(file.hash)?;
            let offset = base.checked_add_signed(file.offset).ok_or_else(|| {
                ArcError::corrupt(format!("file {name} at offset {}", file.offset))
            })?;
            let source = FileContentSource::Lazy(LazyArchiveRef::new(self.stream.clone(), offset));
            archive.add_file_by_path(dir, name, source)?;
        }
        for entry in &node.directories {
            let name = names.resolve(entry.hash)?;
            let child_dir = archive.get_or_create_directory(dir, name);
            let child = node.child(entry.hash).ok_or_else(|| {
                ArcError::corrupt(format!("directory {name} ({:#018x}) has no table", entry.hash))
            })?;
            self.populate(archive, child, child_dir, base, names)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_takes_last_segment() {
        assert_eq!(display_name("data/ui"), "ui");
        assert_eq!(display_name("c:\\game\\ui"), "ui");
        assert_eq!(display_name("ui"), "ui");
        assert_eq!(display_name(""), "");
    }

    #[test]
    fn magic_variants() {
        let mut stream = Cursor::new(MAGIC.to_vec());
        assert!(check_magic(&mut stream).is_ok());

        let mut warp = ENCRYPTED_MAGIC_PREFIX.to_vec();
        warp.resize(64, 0);
        assert!(matches!(
            check_magic(&mut Cursor::new(warp)),
            Err(ArcError::UnsupportedEncryptedArchive)
        ));

        assert!(matches!(
            check_magic(&mut Cursor::new(b"PK\x03\x04 not an arc at all".to_vec())),
            Err(ArcError::MalformedHeader)
        ));
        assert!(matches!(
            check_magic(&mut Cursor::new(MAGIC[..6].to_vec())),
            Err(ArcError::UnexpectedEnd)
        ));
    }

    #[test]
    fn block_scan_rejects_unknown_type() {
        let mut bytes = vec![];
        crate::index::write_block(&mut bytes, 7, &[1, 2, 3]).unwrap();
        assert!(matches!(
            MetadataBlocks::scan(&mut Cursor::new(bytes)),
            Err(ArcError::UnknownMetadataBlockType(7))
        ));
    }

    #[test]
    fn block_scan_reports_missing_block() {
        let mut bytes = vec![];
        crate::index::write_block(&mut bytes, BLOCK_HASH_TABLE_UTF16, &[0; 4]).unwrap();
        assert!(matches!(
            MetadataBlocks::scan(&mut Cursor::new(bytes)),
            Err(ArcError::MissingMetadataBlock(BLOCK_HASH_TABLE_UTF8))
        ));
    }

    #[test]
    fn uncompressed_name_table_block() {
        let names = NameTable::encode(["x"]).unwrap();
        let mut payload = vec![];
        DataHeader {
            compressed: false,
            raw_size: names.len() as u32,
            stored_size: names.len() as u32,
        }
        .write_to(&mut payload)
        .unwrap();
        payload.extend_from_slice(&names);
        assert_eq!(unwrap_name_table(&payload).unwrap(), names);
        assert!(matches!(
            unwrap_name_table(&payload[..payload.len() - 1]),
            Err(ArcError::UnexpectedEnd)
        ));
    }
}
