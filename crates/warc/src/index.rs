//! Codecs for the metadata region: hash-table nodes, the name table and the
//! block framing around them.

use std::{
    collections::{HashMap, HashSet},
    io::{Cursor, Read, Write},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    error::{ArcError, ArcResult},
    hash::name_hash_utf16,
};

pub const NODE_TAG: [u8; 8] = [0x20, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00];
pub const NODE_HEADER_LEN: i64 = 32;
pub const NODE_ENTRY_LEN: i64 = 16;
pub const ANCESTOR_LEN: i64 = 8;

// Nesting limit when parsing, well past anything a game ships.
const MAX_DEPTH: i32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub hash: u64,
    /// Relative to the parent node for directories, relative to the data
    /// base for files.
    pub offset: i64,
}

/// On-disk index record of one directory. Rebuilt on every write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HashTableNode {
    pub id: u64,
    pub depth: i32,
    pub directories: Vec<IndexEntry>,
    pub files: Vec<IndexEntry>,
    /// Nearest parent first.
    pub ancestors: Vec<u64>,
    /// Same order as `directories`.
    pub children: Vec<HashTableNode>,
}

/// Size of a node's own record, children excluded.
pub fn node_len(entries: usize, depth: usize) -> i64 {
    NODE_HEADER_LEN + NODE_ENTRY_LEN * entries as i64 + ANCESTOR_LEN * depth as i64
}

fn read_count<R: Read>(r: &mut R, what: &str) -> ArcResult<usize> {
    let n = r.read_i32::<LittleEndian>()?;
    usize::try_from(n).map_err(|_| ArcError::corrupt(format!("negative {what} count {n}")))
}

fn read_entries<R: Read>(r: &mut R, count: usize) -> ArcResult<Vec<IndexEntry>> {
    let mut entries = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        entries.push(IndexEntry {
            hash: r.read_u64::<LittleEndian>()?,
            offset: r.read_i64::<LittleEndian>()?,
        });
    }
    Ok(entries)
}

impl HashTableNode {
    pub fn parse(bytes: &[u8]) -> ArcResult<Self> {
        Self::read(&mut Cursor::new(bytes), None)
    }

    fn read<R: Read>(r: &mut R, parent_depth: Option<i32>) -> ArcResult<Self> {
        let mut tag = [0u8; 8];
        r.read_exact(&mut tag)?;
        if tag != NODE_TAG {
            return Err(ArcError::corrupt(format!("bad node tag {tag:02x?}")));
        }
        let id = r.read_u64::<LittleEndian>()?;
        let dir_count = read_count(r, "directory")?;
        let file_count = read_count(r, "file")?;
        let depth = r.read_i32::<LittleEndian>()?;
        let _padding = r.read_i32::<LittleEndian>()?;

        let expected = parent_depth.map_or(0, |d| d + 1);
        if depth != expected || depth > MAX_DEPTH {
            return Err(ArcError::corrupt(format!(
                "node {id:#x} has depth {depth}, expected {expected}"
            )));
        }

        let directories = read_entries(r, dir_count)?;
        let files = read_entries(r, file_count)?;
        let mut ancestors = Vec::with_capacity(depth as usize);
        for _ in 0..depth {
            ancestors.push(r.read_u64::<LittleEndian>()?);
        }
        let mut children = Vec::with_capacity(dir_count.min(4096));
        for _ in 0..dir_count {
            children.push(Self::read(r, Some(depth))?);
        }
        Ok(Self {
            id,
            depth,
            directories,
            files,
            ancestors,
            children,
        })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> ArcResult<()> {
        w.write_all(&NODE_TAG)?;
        w.write_u64::<LittleEndian>(self.id)?;
        w.write_i32::<LittleEndian>(self.directories.len() as i32)?;
        w.write_i32::<LittleEndian>(self.files.len() as i32)?;
        w.write_i32::<LittleEndian>(self.depth)?;
        w.write_i32::<LittleEndian>(0)?;
        for entry in self.directories.iter().chain(&self.files) {
            w.write_u64::<LittleEndian>(entry.hash)?;
            w.write_i64::<LittleEndian>(entry.offset)?;
        }
        for hash in &self.ancestors {
            w.write_u64::<LittleEndian>(*hash)?;
        }
        for child in &self.children {
            child.write(w)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> ArcResult<Vec<u8>> {
        let mut buf = vec![];
        self.write(&mut buf)?;
        Ok(buf)
    }

    /// Child node whose id matches a directory entry's hash.
    pub fn child(&self, hash: u64) -> Option<&HashTableNode> {
        self.children.iter().find(|c| c.id == hash)
    }

    /// Directories (this one included) and files in the whole subtree.
    pub fn totals(&self) -> (usize, usize) {
        self.children
            .iter()
            .map(HashTableNode::totals)
            .fold((1, self.files.len()), |(d, f), (cd, cf)| (d + cd, f + cf))
    }
}

/// Reverse lookup from UTF-16 name hash to the original name.
#[derive(Debug, Clone, Default)]
pub struct NameTable {
    names: HashMap<u64, String>,
}

impl NameTable {
    /// Parses `(hash, char_count, UTF-16LE chars)` records until the input
    /// runs out. The first record for a hash wins.
    pub fn parse(bytes: &[u8]) -> ArcResult<Self> {
        let mut r = Cursor::new(bytes);
        let mut names = HashMap::new();
        while (r.position() as usize) < bytes.len() {
            let hash = r.read_u64::<LittleEndian>()?;
            let count = read_count(&mut r, "name character")?;
            let mut units = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                units.push(r.read_u16::<LittleEndian>()?);
            }
            names
                .entry(hash)
                .or_insert_with(|| String::from_utf16_lossy(&units));
        }
        Ok(Self { names })
    }

    /// Serializes `names` in order, skipping repeats of an earlier name.
    pub fn encode<'a>(names: impl IntoIterator<Item = &'a str>) -> ArcResult<Vec<u8>> {
        let mut seen = HashSet::new();
        let mut buf = vec![];
        for name in names {
            if !seen.insert(name) {
                continue;
            }
            let units: Vec<u16> = name.encode_utf16().collect();
            buf.write_u64::<LittleEndian>(name_hash_utf16(name))?;
            buf.write_i32::<LittleEndian>(units.len() as i32)?;
            for unit in units {
                buf.write_u16::<LittleEndian>(unit)?;
            }
        }
        Ok(buf)
    }

    pub fn get(&self, hash: u64) -> Option<&str> {
        self.names.get(&hash).map(String::as_str)
    }

    pub fn resolve(&self, hash: u64) -> ArcResult<&str> {
        self.get(hash)
            .ok_or_else(|| ArcError::corrupt(format!("no name for hash {hash:#018x}")))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

pub(crate) fn write_block<W: Write>(w: &mut W, block_type: i32, payload: &[u8]) -> ArcResult<()> {
    w.write_i32::<LittleEndian>(block_type)?;
    w.write_i64::<LittleEndian>(payload.len() as i64)?;
    w.write_all(payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn leaf(id: u64, depth: i32, ancestors: Vec<u64>, files: Vec<IndexEntry>) -> HashTableNode {
        HashTableNode {
            id,
            depth,
            files,
            ancestors,
            ..Default::default()
        }
    }

    #[test]
    fn nested_nodes() {
        let child = leaf(2, 1, vec![1], vec![IndexEntry { hash: 9, offset: 0 }]);
        let root = HashTableNode {
            id: 1,
            depth: 0,
            directories: vec![IndexEntry {
                hash: 2,
                offset: node_len(2, 0),
            }],
            files: vec![IndexEntry { hash: 7, offset: 40 }],
            ancestors: vec![],
            children: vec![child.clone()],
        };
        let bytes = root.to_bytes().unwrap();
        assert_eq!(bytes.len() as i64, node_len(2, 0) + node_len(1, 1));
        assert_eq!(&bytes[..8], &NODE_TAG);

        let parsed = HashTableNode::parse(&bytes).unwrap();
        assert_eq!(parsed, root);
        assert_eq!(parsed.child(2), Some(&child));
        assert_eq!(parsed.child(3), None);
        assert_eq!(parsed.totals(), (2, 2));
    }

    #[test]
    fn bad_tag_and_depth() {
        let mut bytes = leaf(1, 0, vec![], vec![]).to_bytes().unwrap();
        bytes[0] = 0x21;
        assert!(matches!(
            HashTableNode::parse(&bytes),
            Err(ArcError::CorruptIndex { .. })
        ));

        let bytes = leaf(1, 1, vec![5], vec![]).to_bytes().unwrap();
        assert!(matches!(
            HashTableNode::parse(&bytes),
            Err(ArcError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn truncated_node() {
        let bytes = leaf(1, 0, vec![], vec![IndexEntry { hash: 1, offset: 2 }])
            .to_bytes()
            .unwrap();
        assert!(matches!(
            HashTableNode::parse(&bytes[..bytes.len() - 1]),
            Err(ArcError::UnexpectedEnd)
        ));
    }

    #[test]
    fn name_table_first_occurrence_wins() {
        let mut bytes = NameTable::encode(["Texture.dds", "root"]).unwrap();
        let hash = name_hash_utf16("texture.dds");
        bytes.write_u64::<LittleEndian>(hash).unwrap();
        bytes.write_i32::<LittleEndian>(5).unwrap();
        for unit in "other".encode_utf16() {
            bytes.write_u16::<LittleEndian>(unit).unwrap();
        }

        let table = NameTable::parse(&bytes).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(hash), Some("Texture.dds"));
        assert_eq!(table.resolve(name_hash_utf16("ROOT")).unwrap(), "root");
        assert!(matches!(
            table.resolve(0),
            Err(ArcError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn name_table_skips_repeats() {
        let once = NameTable::encode(["a", "b"]).unwrap();
        let twice = NameTable::encode(["a", "b", "a"]).unwrap();
        assert_eq!(once, twice);
        // hash + count + two bytes per char
        assert_eq!(once.len(), 2 * (8 + 4 + 2));
    }

    #[test]
    fn name_table_truncated_record() {
        let bytes = NameTable::encode(["abc"]).unwrap();
        assert!(matches!(
            NameTable::parse(&bytes[..bytes.len() - 1]),
            Err(ArcError::UnexpectedEnd)
        ));
    }
}
