use std::{fs, path::Path};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::{
    archive::Archive,
    entry::FileContentSource,
    error::{ArcError, ArcResult},
};

impl Archive {
    /// Builds an archive named after `dir` holding every regular file below
    /// it. File contents are read into memory.
    pub fn pack(dir: impl AsRef<Path>) -> ArcResult<Self> {
        let dir = dir.as_ref();
        let name = fs::canonicalize(dir)?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut archive = Archive::new(name);

        let mut files = 0usize;
        for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|_| ArcError::InvalidPath(entry.path().display().to_string()))?;
            let rel = rel.to_string_lossy();
            debug!(path = %rel, "packing");
            let data = fs::read(entry.path())?;
            archive.add_file_by_path(Archive::ROOT, &rel, FileContentSource::InMemory(data))?;
            files += 1;
        }
        info!(name = archive.name(), files, "Packed directory {}", dir.display());
        Ok(archive)
    }

    /// Extracts every file below `dir`, decompressing as needed.
    pub fn unpack(&self, dir: impl AsRef<Path>) -> ArcResult<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let files = self.all_files();
        for file in &files {
            let rel = self.relative_path(file);
            debug!(path = %rel, "extracting");
            file.source().extract(&dir.join(rel))?;
        }
        info!(
            name = self.name(),
            files = files.len(),
            "Unpacked archive to {}",
            dir.display()
        );
        Ok(())
    }
}
