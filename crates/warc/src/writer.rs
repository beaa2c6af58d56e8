use std::{
    borrow::Cow,
    collections::HashMap,
    io::{Seek, SeekFrom, Write},
};

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::{debug, info, trace};

use crate::{
    archive::{Archive, DirId},
    compression,
    entry::{size_u32, DataHeader, FileEntry},
    error::{ArcError, ArcResult},
    hash::NameEncoding,
    index::{node_len, write_block, HashTableNode, IndexEntry, NameTable},
    policy::CompressionFilter,
    BLOCK_NAME_TABLE, MAGIC,
};

/// Serializes an [`Archive`]: file data first, then the two hash tables and
/// the name table, then the header's metadata offset is patched in.
pub struct ArchiveWriter<'a> {
    archive: &'a Archive,
    filter: CompressionFilter,
}

impl<'a> ArchiveWriter<'a> {
    pub fn new(archive: &'a Archive) -> ArcResult<Self> {
        Ok(Self {
            filter: archive.policy().compile()?,
            archive,
        })
    }

    pub fn write<W: Write + Seek>(&self, mut w: W) -> ArcResult<W> {
        w.write_all(&MAGIC)?;
        let placeholder = w.stream_position()?;
        w.write_i64::<LittleEndian>(0)?;
        let base = w.stream_position()?;

        let file_offsets = self.write_data(&mut w, base)?;

        let metadata_pos = w.stream_position()?;
        w.seek(SeekFrom::Start(placeholder))?;
        w.write_i64::<LittleEndian>((metadata_pos - base) as i64)?;
        w.seek(SeekFrom::Start(metadata_pos))?;
        debug!(base, metadata_pos, "wrote data region");

        for encoding in [NameEncoding::Utf16, NameEncoding::Utf8] {
            let index = self.build_index(encoding, &file_offsets)?;
            write_block(&mut w, encoding.block_type(), &index.to_bytes()?)?;
        }
        self.write_name_table(&mut w)?;
        w.flush()?;

        info!(
            name = self.archive.name(),
            files = file_offsets.len(),
            bytes = w.stream_position()?,
            "Wrote archive"
        );
        Ok(w)
    }

    /// Writes every file's header and data, returning base-relative offsets
    /// keyed by unique id.
    fn write_data<W: Write + Seek>(&self, w: &mut W, base: u64) -> ArcResult<HashMap<u64, i64>> {
        let mut offsets = HashMap::new();
        for file in self.archive.all_files() {
            let (header, data) = self.stored_form(file)?;
            let offset = (w.stream_position()? - base) as i64;
            trace!(
                path = %self.archive.full_path(file),
                offset,
                compressed = header.compressed,
                "writing file"
            );
            offsets.insert(self.archive.file_unique_id(file), offset);
            header.write_to(w)?;
            w.write_all(&data)?;
        }
        Ok(offsets)
    }

    fn stored_form<'f>(&self, file: &'f FileEntry) -> ArcResult<(DataHeader, Cow<'f, [u8]>)> {
        let source = file.source();
        let current = source.header()?;
        let compress = self.filter.should_compress(file.name());
        let (raw_size, data) = match (compress, current.compressed) {
            (true, false) => (
                current.raw_size,
                Cow::Owned(compression::compress(&source.read_bytes()?)?),
            ),
            (false, true) => {
                let raw = compression::decompress(&source.read_bytes()?, current.raw_size)?;
                (size_u32(raw.len())?, Cow::Owned(raw))
            }
            _ => (current.raw_size, source.read_bytes()?),
        };
        Ok((
            DataHeader {
                compressed: compress,
                raw_size,
                stored_size: size_u32(data.len())?,
            },
            data,
        ))
    }

    fn children_by_hash(&self, dir: DirId, encoding: NameEncoding) -> Vec<(u64, DirId)> {
        let mut children: Vec<(u64, DirId)> = self
            .archive
            .sorted_subdirectories(dir)
            .into_iter()
            .map(|id| (encoding.hash(self.dir_name(id)), id))
            .collect();
        children.sort_by_key(|(hash, _)| *hash);
        children
    }

    fn dir_name(&self, id: DirId) -> &str {
        self.archive.directory(id).map_or("", |d| d.name())
    }

    /// Assigns each directory its node offset relative to its parent's node,
    /// visiting siblings in ascending hash order for `encoding`.
    fn directory_offsets(&self, encoding: NameEncoding) -> HashMap<DirId, i64> {
        let mut offsets = HashMap::new();
        let mut running = 0;
        let mut pending = vec![(Archive::ROOT, 0usize, 0i64)];
        while let Some((dir, depth, ancestor_sum)) = pending.pop() {
            let rel = running - ancestor_sum;
            offsets.insert(dir, rel);
            let entries = self
                .archive
                .directory(dir)
                .map_or(0, |d| d.subdirectory_count() + d.file_count());
            running += node_len(entries, depth);
            for (_, child) in self.children_by_hash(dir, encoding).into_iter().rev() {
                pending.push((child, depth + 1, ancestor_sum + rel));
            }
        }
        offsets
    }

    fn build_index(
        &self,
        encoding: NameEncoding,
        file_offsets: &HashMap<u64, i64>,
    ) -> ArcResult<HashTableNode> {
        let dir_offsets = self.directory_offsets(encoding);
        self.build_node(Archive::ROOT, encoding, &[], &dir_offsets, file_offsets)
    }

    fn build_node(
        &self,
        dir: DirId,
        encoding: NameEncoding,
        ancestors: &[u64],
        dir_offsets: &HashMap<DirId, i64>,
        file_offsets: &HashMap<u64, i64>,
    ) -> ArcResult<HashTableNode> {
        let id = encoding.hash(self.dir_name(dir));

        let mut subdirs = vec![];
        for (hash, child) in self.children_by_hash(dir, encoding) {
            let offset = dir_offsets
                .get(&child)
                .copied()
                .ok_or_else(|| ArcError::corrupt(format!("no offset for {child:?}")))?;
            subdirs.push((IndexEntry { hash, offset }, child));
        }
        subdirs.sort_by_key(|(entry, _)| entry.offset);

        let mut files = vec![];
        for file in self.archive.sorted_files(dir) {
            let offset = file_offsets
                .get(&self.archive.file_unique_id(file))
                .copied()
                .ok_or_else(|| {
                    ArcError::corrupt(format!("no data offset for {}", self.archive.full_path(file)))
                })?;
            files.push(IndexEntry {
                hash: encoding.hash(file.name()),
                offset,
            });
        }
        files.sort_by_key(|entry| entry.hash);

        let mut child_ancestors = Vec::with_capacity(ancestors.len() + 1);
        child_ancestors.push(id);
        child_ancestors.extend_from_slice(ancestors);
        let children = subdirs
            .iter()
            .map(|(_, child)| {
                self.build_node(*child, encoding, &child_ancestors, dir_offsets, file_offsets)
            })
            .collect::<ArcResult<Vec<_>>>()?;

        Ok(HashTableNode {
            id,
            depth: ancestors.len() as i32,
            directories: subdirs.into_iter().map(|(entry, _)| entry).collect(),
            files,
            ancestors: ancestors.to_vec(),
            children,
        })
    }

    /// Names of all files, then all directories, then the root, deflated and
    /// wrapped in a data header.
    fn write_name_table<W: Write>(&self, w: &mut W) -> ArcResult<()> {
        let files = self.archive.all_files();
        let dirs = self.archive.all_directories();
        let names = files
            .iter()
            .map(|f| f.name())
            .chain(
                dirs.iter()
                    .filter(|id| **id != Archive::ROOT)
                    .map(|id| self.dir_name(*id)),
            )
            .chain([self.archive.name()]);
        let table = NameTable::encode(names)?;
        let packed = compression::compress(&table)?;

        let mut payload = Vec::with_capacity(packed.len() + 16);
        DataHeader {
            compressed: true,
            raw_size: size_u32(table.len())?,
            stored_size: size_u32(packed.len())?,
        }
        .write_to(&mut payload)?;
        payload.extend_from_slice(&packed);
        write_block(w, BLOCK_NAME_TABLE, &payload)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{entry::FileContentSource, index::NODE_HEADER_LEN};

    fn sample() -> Archive {
        let mut archive = Archive::new("root");
        for path in ["a.txt", "d1/b.txt", "d1/d2/c.txt", "e/f.txt"] {
            archive
                .create_file(path, FileContentSource::InMemory(path.as_bytes().to_vec()))
                .unwrap();
        }
        archive
    }

    #[test]
    fn header_offset_is_patched() {
        let bytes = sample().write(Cursor::new(vec![])).unwrap().into_inner();
        assert_eq!(&bytes[..20], &MAGIC);
        let metadata = i64::from_le_bytes(bytes[20..28].try_into().unwrap());
        // four files, each a 16 byte header plus its path as content
        let data_len: i64 = ["a.txt", "d1/b.txt", "d1/d2/c.txt", "e/f.txt"]
            .iter()
            .map(|p| 16 + p.len() as i64)
            .sum();
        assert_eq!(metadata, data_len);
        let block_type = i32::from_le_bytes(bytes[28 + data_len as usize..][..4].try_into().unwrap());
        assert_eq!(block_type, 0);
    }

    #[test]
    fn offsets_are_relative_to_parent_node() {
        let archive = sample();
        let writer = ArchiveWriter::new(&archive).unwrap();
        for encoding in [NameEncoding::Utf16, NameEncoding::Utf8] {
            let offsets = writer.directory_offsets(encoding);
            let index = writer
                .build_node(Archive::ROOT, encoding, &[], &offsets, &{
                    let mut m = HashMap::new();
                    for f in archive.all_files() {
                        m.insert(archive.file_unique_id(f), 0);
                    }
                    m
                })
                .unwrap();
            assert_eq!(offsets[&Archive::ROOT], 0);

            // Every child's relative offset must land on its serialized node.
            let bytes = index.to_bytes().unwrap();
            fn check(node: &HashTableNode, at: usize, bytes: &[u8]) {
                let id = u64::from_le_bytes(bytes[at + 8..at + 16].try_into().unwrap());
                assert_eq!(id, node.id);
                for (entry, child) in node.directories.iter().zip(&node.children) {
                    assert_eq!(entry.hash, child.id);
                    check(child, at + entry.offset as usize, bytes);
                }
            }
            check(&index, 0, &bytes);

            let d1 = archive.find_directory(Archive::ROOT, "d1").unwrap();
            let d2 = archive.find_directory(d1, "d2").unwrap();
            let d1_node = index.child(encoding.hash("d1")).unwrap();
            assert_eq!(d1_node.ancestors, vec![encoding.hash("root")]);
            let d2_node = d1_node.child(encoding.hash("d2")).unwrap();
            assert_eq!(d2_node.depth, 2);
            assert_eq!(
                d2_node.ancestors,
                vec![encoding.hash("d1"), encoding.hash("root")]
            );
            // d1 holds one file and one directory
            assert_eq!(offsets[&d2], NODE_HEADER_LEN + 2 * 16 + 8);
        }
    }

    #[test]
    fn sibling_order_follows_hash() {
        let mut archive = Archive::new("root");
        for name in ["alpha", "beta", "gamma", "delta", "epsilon"] {
            archive.get_or_create_directory(Archive::ROOT, name);
            archive
                .create_file(name, FileContentSource::InMemory(vec![]))
                .unwrap();
        }
        let writer = ArchiveWriter::new(&archive).unwrap();
        for encoding in [NameEncoding::Utf16, NameEncoding::Utf8] {
            let offsets = writer.directory_offsets(encoding);
            let file_offsets: HashMap<u64, i64> = archive
                .all_files()
                .into_iter()
                .map(|f| (archive.file_unique_id(f), 0))
                .collect();
            let root = writer
                .build_node(Archive::ROOT, encoding, &[], &offsets, &file_offsets)
                .unwrap();
            let dir_hashes: Vec<u64> = root.directories.iter().map(|e| e.hash).collect();
            let mut sorted = dir_hashes.clone();
            sorted.sort();
            assert_eq!(dir_hashes, sorted);
            assert!(root.directories.windows(2).all(|w| w[0].offset < w[1].offset));
            assert!(root.files.windows(2).all(|w| w[0].hash <= w[1].hash));
        }
    }

    #[test]
    fn double_star_glob_compresses_on_write() {
        let mut archive = sample();
        archive.policy_mut().compress_globs = vec!["a**t".into()];
        let writer = ArchiveWriter::new(&archive).unwrap();
        let (header, _) = writer
            .stored_form(archive.find_file("a.txt").unwrap())
            .unwrap();
        assert!(header.compressed);
        let (header, _) = writer
            .stored_form(archive.find_file("d1/b.txt").unwrap())
            .unwrap();
        assert!(!header.compressed);
        assert!(archive.write(Cursor::new(vec![])).is_ok());
    }

    #[test]
    fn stored_form_respects_policy() {
        let mut archive = Archive::new("root");
        let packed = compression::compress(b"zzzzzzzzzzzzzzzz").unwrap();
        archive
            .create_file(
                "pre.bin",
                FileContentSource::InMemoryCompressed {
                    data: packed.clone(),
                    raw_size: 16,
                },
            )
            .unwrap();
        archive
            .create_file("plain.txt", FileContentSource::InMemory(b"text".to_vec()))
            .unwrap();
        archive.policy_mut().compress_globs = vec!["*.txt".into()];
        let writer = ArchiveWriter::new(&archive).unwrap();

        let (header, data) = writer
            .stored_form(archive.find_file("pre.bin").unwrap())
            .unwrap();
        assert!(!header.compressed);
        assert_eq!(header.raw_size, 16);
        assert_eq!(data.as_ref(), b"zzzzzzzzzzzzzzzz");

        let (header, data) = writer
            .stored_form(archive.find_file("plain.txt").unwrap())
            .unwrap();
        assert!(header.compressed);
        assert_eq!(header.raw_size, 4);
        assert_eq!(compression::decompress(&data, 4).unwrap(), b"text");

        archive.policy_mut().compress_globs = vec!["*.bin".into()];
        let writer = ArchiveWriter::new(&archive).unwrap();
        let (header, data) = writer
            .stored_form(archive.find_file("pre.bin").unwrap())
            .unwrap();
        assert!(header.compressed);
        assert_eq!(data.as_ref(), packed.as_slice());
    }
}
