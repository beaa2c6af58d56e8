use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::{ArcError, ArcResult};

/// Per-archive settings that influence tree mutation and writing.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ArchivePolicy {
    /// Key files by full path instead of bare name, so same-named files
    /// from different sources can coexist in one directory.
    pub keep_duplicates: bool,
    /// File names matching any of these (`*` and `?` only) are
    /// Deflate-compressed on write.
    pub compress_globs: Vec<String>,
}

impl ArchivePolicy {
    pub fn compile(&self) -> ArcResult<CompressionFilter> {
        let patterns = self
            .compress_globs
            .iter()
            .map(|g| {
                Pattern::new(&escape_classes(g)).map_err(|source| ArcError::InvalidGlobPattern {
                    pattern: g.clone(),
                    source,
                })
            })
            .collect::<ArcResult<Vec<_>>>()?;
        Ok(CompressionFilter { patterns })
    }
}

/// Compiled form of [`ArchivePolicy::compress_globs`].
#[derive(Debug, Clone, Default)]
pub struct CompressionFilter {
    patterns: Vec<Pattern>,
}

impl CompressionFilter {
    pub fn should_compress(&self, file_name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(file_name))
    }
}

// Brackets are literal and a run of `*` is a single `*`: only `*` and `?`
// are wildcards, with no recursive `**`.
fn escape_classes(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len());
    for c in glob.chars() {
        match c {
            '[' => out.push_str("[[]"),
            ']' => out.push_str("[]]"),
            '*' if out.ends_with('*') => {}
            c => out.push(c),
        }
    }
    out
}
