use std::{
    collections::{btree_map, BTreeMap},
    fs::File,
    io::{BufReader, BufWriter, Seek, Write},
    path::Path,
};

use tracing::debug;

use crate::{
    entry::{ArchiveStream, FileContentSource, FileEntry},
    error::{ArcError, ArcResult},
    hash::unique_id_hash,
    policy::ArchivePolicy,
    reader::ArchiveReader,
    writer::ArchiveWriter,
};

/// Handle to a directory inside one [`Archive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirId(u32);

#[derive(Debug, Clone)]
pub struct Directory {
    name: String,
    parent: Option<DirId>,
    subdirectories: BTreeMap<String, DirId>,
    files: BTreeMap<String, FileEntry>,
}

impl Directory {
    fn new(name: String, parent: Option<DirId>) -> Self {
        Self {
            name,
            parent,
            subdirectories: BTreeMap::new(),
            files: BTreeMap::new(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn parent(&self) -> Option<DirId> {
        self.parent
    }
    pub fn subdirectory(&self, name: &str) -> Option<DirId> {
        self.subdirectories.get(name).copied()
    }
    pub fn subdirectory_count(&self) -> usize {
        self.subdirectories.len()
    }
    /// Looks a file up by its map key (see [`FileEntry::key`]).
    pub fn file(&self, key: &str) -> Option<&FileEntry> {
        self.files.get(key)
    }
    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.values()
    }
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn file_key_by_name(&self, name: &str) -> Option<String> {
        if self.files.contains_key(name) {
            return Some(name.to_string());
        }
        self.files
            .values()
            .find(|f| f.name == name)
            .map(|f| f.key.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Parent,
    Name(&'a str),
}

fn segments(path: &str) -> Vec<Segment<'_>> {
    path.split(|c: char| c == '/' || c == '\\' || c == std::path::MAIN_SEPARATOR)
        .filter(|s| !s.is_empty() && *s != ".")
        .map(|s| if s == ".." { Segment::Parent } else { Segment::Name(s) })
        .collect()
}

fn split_file_path(path: &str) -> ArcResult<(Vec<Segment<'_>>, &str)> {
    let mut segs = segments(path);
    match segs.pop() {
        Some(Segment::Name(name)) => Ok((segs, name)),
        _ => Err(ArcError::InvalidPath(path.to_string())),
    }
}

fn by_folded_name(a: &str, b: &str) -> std::cmp::Ordering {
    a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b))
}

/// In-memory archive: a named directory tree plus the policy used when
/// inserting and writing files.
#[derive(Debug, Clone)]
pub struct Archive {
    directories: BTreeMap<DirId, Directory>,
    next_dir_id: u32,
    policy: ArchivePolicy,
}

impl Default for Archive {
    fn default() -> Self {
        Self::new("")
    }
}

impl Archive {
    pub const ROOT: DirId = DirId(0);

    pub fn new(name: impl Into<String>) -> Self {
        let mut directories = BTreeMap::new();
        directories.insert(Self::ROOT, Directory::new(name.into(), None));
        Self {
            directories,
            next_dir_id: 1,
            policy: ArchivePolicy::default(),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> ArcResult<Self> {
        let path = path.as_ref();
        debug!("Opening archive {}", path.display());
        Self::read(BufReader::new(File::open(path)?))
    }

    /// Parses an archive from `stream`. The stream is kept open by every
    /// lazily read file entry until those entries are dropped or detached.
    pub fn read<R: ArchiveStream + 'static>(stream: R) -> ArcResult<Self> {
        ArchiveReader::new(stream).read()
    }

    pub fn write<W: Write + Seek>(&self, w: W) -> ArcResult<W> {
        ArchiveWriter::new(self)?.write(w)
    }

    /// Writes to a temporary file next to `path` and renames it over `path`
    /// once complete. Saving over the file this archive was read from is
    /// fine: lazy entries keep the old file open.
    pub fn save(&self, path: impl AsRef<Path>) -> ArcResult<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        let (file, tmp_path) = tmp.into_parts();
        let mut file = self.write(BufWriter::new(file))?;
        file.flush()?;
        drop(file);
        tmp_path.persist(path).map_err(|e| ArcError::Io(e.error))?;
        debug!("Saved archive {}", path.display());
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.dir(Self::ROOT).name
    }
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.dir_mut(Self::ROOT).name = name.into();
    }

    pub fn policy(&self) -> &ArchivePolicy {
        &self.policy
    }
    pub fn policy_mut(&mut self) -> &mut ArchivePolicy {
        &mut self.policy
    }
    pub fn set_policy(&mut self, policy: ArchivePolicy) {
        self.policy = policy;
    }

    pub fn root(&self) -> &Directory {
        self.dir(Self::ROOT)
    }
    pub fn directory(&self, id: DirId) -> Option<&Directory> {
        self.directories.get(&id)
    }

    // Ids handed out by this archive stay valid until their directory is
    // deleted. Public methods that index with a caller id either document a
    // panic or check it first.
    fn dir(&self, id: DirId) -> &Directory {
        self.directories
            .get(&id)
            .unwrap_or_else(|| panic!("directory {id:?} is not part of this archive"))
    }
    fn dir_mut(&mut self, id: DirId) -> &mut Directory {
        self.directories
            .get_mut(&id)
            .unwrap_or_else(|| panic!("directory {id:?} is not part of this archive"))
    }

    /// Number of ancestors of `id`; the root has depth 0.
    ///
    /// # Panics
    ///
    /// If `id` belongs to a deleted directory.
    pub fn depth(&self, id: DirId) -> usize {
        let mut depth = 0;
        let mut current = self.dir(id).parent;
        while let Some(parent) = current {
            depth += 1;
            current = self.dir(parent).parent;
        }
        depth
    }

    /// Root-first list of directory names leading to `id`, root excluded.
    fn relative_segments(&self, id: DirId) -> Vec<&str> {
        let mut names = vec![];
        let mut current = id;
        while let Some(parent) = self.dir(current).parent {
            names.push(self.dir(current).name.as_str());
            current = parent;
        }
        names.reverse();
        names
    }

    /// `/`-joined path from the root, starting with the root's own name.
    ///
    /// # Panics
    ///
    /// If `id` belongs to a deleted directory.
    pub fn directory_path(&self, id: DirId) -> String {
        let mut path = self.name().to_string();
        for name in self.relative_segments(id) {
            path.push('/');
            path.push_str(name);
        }
        path
    }

    pub fn full_path(&self, file: &FileEntry) -> String {
        format!("{}/{}", self.directory_path(file.directory), file.name)
    }

    /// Path below the root, as used when extracting.
    pub fn relative_path(&self, file: &FileEntry) -> String {
        let mut segs = self.relative_segments(file.directory);
        segs.push(&file.name);
        segs.join("/")
    }

    /// Case-sensitive identity hash of a file's location.
    pub fn file_unique_id(&self, file: &FileEntry) -> u64 {
        unique_id_hash(&format!(
            "{}/{}",
            self.directory_path(file.directory),
            file.key
        ))
    }

    fn create_child(&mut self, parent: DirId, name: &str) -> DirId {
        let id = DirId(self.next_dir_id);
        self.next_dir_id += 1;
        self.directories
            .insert(id, Directory::new(name.to_string(), Some(parent)));
        self.dir_mut(parent)
            .subdirectories
            .insert(name.to_string(), id);
        id
    }

    fn walk_create(&mut self, start: DirId, segs: &[Segment]) -> DirId {
        let mut current = start;
        for seg in segs {
            current = match *seg {
                Segment::Parent => self.dir(current).parent.unwrap_or(current),
                Segment::Name(name) => match self.dir(current).subdirectory(name) {
                    Some(id) => id,
                    None => self.create_child(current, name),
                },
            };
        }
        current
    }

    fn walk(&self, start: DirId, segs: &[Segment]) -> Option<DirId> {
        let mut current = start;
        for seg in segs {
            let dir = self.directory(current)?;
            current = match *seg {
                Segment::Parent => dir.parent.unwrap_or(current),
                Segment::Name(name) => dir.subdirectory(name)?,
            };
        }
        self.directory(current).map(|_| current)
    }

    /// Walks `path` from `start`, creating missing directories. `..` moves to
    /// the parent and is a no-op at the root.
    ///
    /// # Panics
    ///
    /// If `start` belongs to a deleted directory and `path` has segments to
    /// walk.
    pub fn get_or_create_directory(&mut self, start: DirId, path: &str) -> DirId {
        self.walk_create(start, &segments(path))
    }

    /// Like [`Archive::get_or_create_directory`] but never creates. A deleted
    /// `start` finds nothing.
    pub fn find_directory(&self, start: DirId, path: &str) -> Option<DirId> {
        self.walk(start, &segments(path))
    }

    pub(crate) fn insert_file(
        &mut self,
        dir: DirId,
        name: String,
        key: String,
        source: FileContentSource,
    ) -> &mut FileEntry {
        let entry = FileEntry {
            name,
            key: key.clone(),
            directory: dir,
            source,
        };
        match self.dir_mut(dir).files.entry(key) {
            btree_map::Entry::Occupied(mut slot) => {
                slot.insert(entry);
                slot.into_mut()
            }
            btree_map::Entry::Vacant(slot) => slot.insert(entry),
        }
    }

    /// Creates or replaces the file at `path` below `start`. The entry is
    /// keyed by bare name, or by full path when duplicates are kept.
    pub fn add_file_by_path(
        &mut self,
        start: DirId,
        path: &str,
        source: FileContentSource,
    ) -> ArcResult<&mut FileEntry> {
        let (segs, name) = split_file_path(path)?;
        if self.directory(start).is_none() {
            return Err(ArcError::UnknownDirectory(start));
        }
        let dir = self.walk_create(start, &segs);
        let key = if self.policy.keep_duplicates {
            format!("{}/{}", self.directory_path(dir), name)
        } else {
            name.to_string()
        };
        Ok(self.insert_file(dir, name.to_string(), key, source))
    }

    pub fn create_file(
        &mut self,
        path: &str,
        source: impl Into<FileContentSource>,
    ) -> ArcResult<&mut FileEntry> {
        self.add_file_by_path(Self::ROOT, path, source.into())
    }

    fn locate_file(&self, start: DirId, path: &str) -> Option<(DirId, String)> {
        let (segs, name) = split_file_path(path).ok()?;
        let dir = self.walk(start, &segs)?;
        let key = self.dir(dir).file_key_by_name(name)?;
        Some((dir, key))
    }

    /// Looks `path` up without creating anything. The last segment is
    /// matched as a file key first, then as a file name.
    pub fn find_file_by_path(&self, start: DirId, path: &str) -> Option<&FileEntry> {
        let (dir, key) = self.locate_file(start, path)?;
        self.dir(dir).files.get(&key)
    }

    pub fn find_file_by_path_mut(&mut self, start: DirId, path: &str) -> Option<&mut FileEntry> {
        let (dir, key) = self.locate_file(start, path)?;
        self.dir_mut(dir).files.get_mut(&key)
    }

    pub fn find_file(&self, path: &str) -> Option<&FileEntry> {
        self.find_file_by_path(Self::ROOT, path)
    }

    pub fn delete_file_by_path(&mut self, start: DirId, path: &str) -> bool {
        let Some((dir, key)) = self.locate_file(start, path) else {
            return false;
        };
        self.dir_mut(dir).files.remove(&key).is_some()
    }

    /// Removes a directory and everything below it. The root cannot be
    /// deleted.
    pub fn delete_directory_by_path(&mut self, start: DirId, path: &str) -> bool {
        let Some(id) = self.find_directory(start, path) else {
            return false;
        };
        let Some(parent) = self.dir(id).parent else {
            return false;
        };
        let name = self.dir(id).name.clone();
        self.dir_mut(parent).subdirectories.remove(&name);
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            if let Some(dir) = self.directories.remove(&id) {
                pending.extend(dir.subdirectories.into_values());
            }
        }
        true
    }

    /// Copies the content of the file at `from` to `to`, both relative to the
    /// root. Lazy content keeps sharing the archive stream.
    pub fn copy_file(&mut self, from: &str, to: &str) -> ArcResult<&mut FileEntry> {
        let source = self
            .find_file(from)
            .ok_or_else(|| ArcError::FileNotFound(from.to_string()))?
            .source
            .clone();
        self.add_file_by_path(Self::ROOT, to, source)
    }

    pub(crate) fn sorted_subdirectories(&self, id: DirId) -> Vec<DirId> {
        let mut subs: Vec<(&str, DirId)> = self
            .dir(id)
            .subdirectories
            .iter()
            .map(|(name, id)| (name.as_str(), *id))
            .collect();
        subs.sort_by(|a, b| by_folded_name(a.0, b.0));
        subs.into_iter().map(|(_, id)| id).collect()
    }

    pub(crate) fn sorted_files(&self, id: DirId) -> Vec<&FileEntry> {
        let mut files: Vec<&FileEntry> = self.dir(id).files.values().collect();
        files.sort_by(|a, b| by_folded_name(&a.name, &b.name).then_with(|| a.key.cmp(&b.key)));
        files
    }

    /// Depth-first, root first, siblings ordered by case-insensitive name.
    pub fn all_directories(&self) -> Vec<DirId> {
        let mut out = Vec::with_capacity(self.directories.len());
        let mut pending = vec![Self::ROOT];
        while let Some(id) = pending.pop() {
            out.push(id);
            pending.extend(self.sorted_subdirectories(id).into_iter().rev());
        }
        out
    }

    /// Files in [`Archive::all_directories`] order, each directory's files
    /// ordered by case-insensitive name.
    pub fn all_files(&self) -> Vec<&FileEntry> {
        self.all_directories()
            .into_iter()
            .flat_map(|id| self.sorted_files(id))
            .collect()
    }

    /// Copies every directory and file of `source` into this archive. Copied
    /// files own their data, so `source` may be dropped afterwards.
    pub fn merge_from(&mut self, source: &Archive, keep_duplicates: bool) -> ArcResult<()> {
        self.policy.keep_duplicates = keep_duplicates;
        let mut pending = vec![(Archive::ROOT, Self::ROOT)];
        let mut merged = 0usize;
        while let Some((src, dst)) = pending.pop() {
            for file in source.sorted_files(src) {
                let key = if keep_duplicates {
                    source.full_path(file)
                } else {
                    file.name.clone()
                };
                self.insert_file(dst, file.name.clone(), key, file.source.detach()?);
                merged += 1;
            }
            for child in source.sorted_subdirectories(src).into_iter().rev() {
                let name = source.dir(child).name.as_str();
                let dst_child = self.walk_create(dst, &[Segment::Name(name)]);
                pending.push((child, dst_child));
            }
        }
        debug!(files = merged, from = source.name(), "Merged archive");
        Ok(())
    }
}
