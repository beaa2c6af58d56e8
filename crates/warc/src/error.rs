use std::io;

use thiserror::Error;

use crate::archive::DirId;

pub type ArcResult<T> = Result<T, ArcError>;

#[derive(Debug, Error)]
pub enum ArcError {
    #[error("not an ARC archive: header magic mismatch")]
    MalformedHeader,

    #[error("unsupported: encrypted archive, requires the original decrypted asset")]
    UnsupportedEncryptedArchive,

    #[error("unexpected end of stream")]
    UnexpectedEnd,

    #[error("unknown metadata block type {0}")]
    UnknownMetadataBlockType(i32),

    #[error("metadata block {0} missing before end of stream")]
    MissingMetadataBlock(i32),

    #[error("corrupt index: {reason}")]
    CorruptIndex { reason: String },

    #[error("deflate stream is invalid: {0}")]
    DecompressionFailure(#[source] io::Error),

    #[error("invalid compression glob {pattern:?}: {source}")]
    InvalidGlobPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("path has no file name: {0:?}")]
    InvalidPath(String),

    #[error("directory {0:?} is not part of this archive")]
    UnknownDirectory(DirId),

    #[error("file not found in archive: {0}")]
    FileNotFound(String),

    #[error("walking directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("io: {0}")]
    Io(io::Error),
}

impl ArcError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptIndex {
            reason: reason.into(),
        }
    }
}

impl From<io::Error> for ArcError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::UnexpectedEnd
        } else {
            Self::Io(e)
        }
    }
}
