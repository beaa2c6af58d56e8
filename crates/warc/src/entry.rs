use std::{
    borrow::Cow,
    fmt, fs,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, OnceLock},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    archive::DirId,
    compression,
    error::{ArcError, ArcResult},
    DATA_HEADER_LEN,
};

pub trait ArchiveStream: Read + Seek + Send {}
impl<T: Read + Seek + Send> ArchiveStream for T {}

/// Handle to an open archive, shared by every lazy entry read from it.
///
/// Each read locks the handle for its whole seek+read, so lazy entries may
/// be resolved from several threads, but they still serialize on the one
/// cursor. Open separate handles for parallel extraction.
pub type SharedStream = Arc<Mutex<dyn ArchiveStream>>;

pub fn share_stream<S: ArchiveStream + 'static>(stream: S) -> SharedStream {
    Arc::new(Mutex::new(stream))
}

/// The 16 bytes preceding every stored file and the name table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataHeader {
    pub compressed: bool,
    pub raw_size: u32,
    pub stored_size: u32,
}

impl DataHeader {
    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> ArcResult<Self> {
        let compressed = r.read_u32::<LittleEndian>()? == 1;
        let _padding = r.read_u32::<LittleEndian>()?;
        let raw_size = r.read_u32::<LittleEndian>()?;
        let stored_size = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            compressed,
            raw_size,
            stored_size,
        })
    }

    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> ArcResult<()> {
        w.write_u32::<LittleEndian>(self.compressed as u32)?;
        w.write_u32::<LittleEndian>(0)?;
        w.write_u32::<LittleEndian>(self.raw_size)?;
        w.write_u32::<LittleEndian>(self.stored_size)?;
        Ok(())
    }
}

/// File data still sitting in an open archive at `offset`.
#[derive(Clone)]
pub struct LazyArchiveRef {
    stream: SharedStream,
    offset: u64,
    header: OnceLock<DataHeader>,
}

impl LazyArchiveRef {
    pub fn new(stream: SharedStream, offset: u64) -> Self {
        Self {
            stream,
            offset,
            header: OnceLock::new(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn data_offset(&self) -> u64 {
        self.offset + DATA_HEADER_LEN
    }

    pub fn is_resolved(&self) -> bool {
        self.header.get().is_some()
    }

    pub fn header(&self) -> ArcResult<DataHeader> {
        if let Some(header) = self.header.get() {
            return Ok(*header);
        }
        let header = {
            let mut stream = self.stream.lock();
            stream.seek(SeekFrom::Start(self.offset))?;
            DataHeader::read_from(&mut *stream)?
        };
        trace!(offset = self.offset, ?header, "resolved lazy entry");
        Ok(*self.header.get_or_init(|| header))
    }

    pub fn read_bytes(&self) -> ArcResult<Vec<u8>> {
        let header = self.header()?;
        let mut buf = Vec::new();
        {
            let mut stream = self.stream.lock();
            stream.seek(SeekFrom::Start(self.data_offset()))?;
            Read::take(&mut *stream, u64::from(header.stored_size)).read_to_end(&mut buf)?;
        }
        // stored_size is untrusted until the bytes are there
        if buf.len() < header.stored_size as usize {
            return Err(ArcError::UnexpectedEnd);
        }
        Ok(buf)
    }
}

impl fmt::Debug for LazyArchiveRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyArchiveRef")
            .field("offset", &self.offset)
            .field("header", &self.header.get())
            .finish_non_exhaustive()
    }
}

/// Where a file's bytes currently live.
///
/// Reading never decompresses; see [`FileContentSource::read_decompressed`].
#[derive(Debug, Clone)]
pub enum FileContentSource {
    InMemory(Vec<u8>),
    InMemoryCompressed { data: Vec<u8>, raw_size: u32 },
    Lazy(LazyArchiveRef),
}

impl FileContentSource {
    pub fn header(&self) -> ArcResult<DataHeader> {
        match self {
            FileContentSource::InMemory(data) => {
                let size = size_u32(data.len())?;
                Ok(DataHeader {
                    compressed: false,
                    raw_size: size,
                    stored_size: size,
                })
            }
            FileContentSource::InMemoryCompressed { data, raw_size } => Ok(DataHeader {
                compressed: true,
                raw_size: *raw_size,
                stored_size: size_u32(data.len())?,
            }),
            FileContentSource::Lazy(lazy) => lazy.header(),
        }
    }

    pub fn is_compressed(&self) -> ArcResult<bool> {
        Ok(self.header()?.compressed)
    }

    pub fn raw_size(&self) -> ArcResult<u32> {
        Ok(self.header()?.raw_size)
    }

    pub fn stored_size(&self) -> ArcResult<u32> {
        Ok(self.header()?.stored_size)
    }

    /// The bytes as stored, compressed or not.
    pub fn read_bytes(&self) -> ArcResult<Cow<'_, [u8]>> {
        match self {
            FileContentSource::InMemory(data) => Ok(Cow::Borrowed(data.as_slice())),
            FileContentSource::InMemoryCompressed { data, .. } => {
                Ok(Cow::Borrowed(data.as_slice()))
            }
            FileContentSource::Lazy(lazy) => Ok(Cow::Owned(lazy.read_bytes()?)),
        }
    }

    pub fn read_decompressed(&self) -> ArcResult<Cow<'_, [u8]>> {
        let header = self.header()?;
        let bytes = self.read_bytes()?;
        if header.compressed {
            Ok(Cow::Owned(compression::decompress(&bytes, header.raw_size)?))
        } else {
            Ok(bytes)
        }
    }

    /// Copies the stored bytes into memory, dropping any tie to an archive
    /// stream. Compression state is kept as is.
    pub fn detach(&self) -> ArcResult<FileContentSource> {
        match self {
            FileContentSource::Lazy(lazy) => {
                let header = lazy.header()?;
                let data = lazy.read_bytes()?;
                Ok(if header.compressed {
                    FileContentSource::InMemoryCompressed {
                        data,
                        raw_size: header.raw_size,
                    }
                } else {
                    FileContentSource::InMemory(data)
                })
            }
            other => Ok(other.clone()),
        }
    }

    /// Writes the decompressed content to `target`, creating parent
    /// directories as needed.
    pub fn extract(&self, target: &Path) -> ArcResult<()> {
        let data = self.read_decompressed()?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, &data)?;
        Ok(())
    }
}

impl From<Vec<u8>> for FileContentSource {
    fn from(data: Vec<u8>) -> Self {
        FileContentSource::InMemory(data)
    }
}

pub(crate) fn size_u32(len: usize) -> ArcResult<u32> {
    u32::try_from(len).map_err(|_| {
        ArcError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("entry of {len} bytes exceeds the 4 GiB format limit"),
        ))
    })
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub(crate) name: String,
    pub(crate) key: String,
    pub(crate) directory: DirId,
    pub(crate) source: FileContentSource,
}

impl FileEntry {
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Key of this entry in its directory's file map.
    pub fn key(&self) -> &str {
        &self.key
    }
    pub fn directory(&self) -> DirId {
        self.directory
    }
    pub fn source(&self) -> &FileContentSource {
        &self.source
    }
    pub fn set_source(&mut self, source: FileContentSource) {
        self.source = source;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn stored(entries: &[(bool, &[u8], u32)]) -> (Vec<u8>, Vec<u64>) {
        let mut buf = Cursor::new(vec![0xEE; 4]);
        buf.seek(SeekFrom::End(0)).unwrap();
        let mut offsets = vec![];
        for (compressed, data, raw_size) in entries {
            offsets.push(buf.position());
            DataHeader {
                compressed: *compressed,
                raw_size: *raw_size,
                stored_size: data.len() as u32,
            }
            .write_to(&mut buf)
            .unwrap();
            buf.write_all(data).unwrap();
        }
        (buf.into_inner(), offsets)
    }

    #[test]
    fn lazy_reads_are_repeatable() {
        let (bytes, offsets) = stored(&[(false, &b"first"[..], 5), (false, &b"second!"[..], 7)]);
        let stream = share_stream(Cursor::new(bytes));
        let a = LazyArchiveRef::new(stream.clone(), offsets[0]);
        let b = LazyArchiveRef::new(stream, offsets[1]);
        assert!(!a.is_resolved());
        assert_eq!(a.read_bytes().unwrap(), b"first");
        assert_eq!(b.read_bytes().unwrap(), b"second!");
        assert_eq!(a.read_bytes().unwrap(), b"first");
        assert!(a.is_resolved());
        assert_eq!(b.header().unwrap().stored_size, 7);
        assert_eq!(a.data_offset(), offsets[0] + 16);
    }

    #[test]
    fn lazy_compressed_source() {
        let packed = compression::compress(b"abcabcabcabc").unwrap();
        let (bytes, offsets) = stored(&[(true, packed.as_slice(), 12)]);
        let source = FileContentSource::Lazy(LazyArchiveRef::new(
            share_stream(Cursor::new(bytes)),
            offsets[0],
        ));
        assert!(source.is_compressed().unwrap());
        assert_eq!(source.raw_size().unwrap(), 12);
        assert_eq!(source.read_bytes().unwrap().as_ref(), packed.as_slice());
        assert_eq!(source.read_decompressed().unwrap().as_ref(), b"abcabcabcabc");

        let detached = source.detach().unwrap();
        assert!(matches!(
            detached,
            FileContentSource::InMemoryCompressed { raw_size: 12, .. }
        ));
    }

    #[test]
    fn truncated_lazy_entry() {
        let (mut bytes, offsets) = stored(&[(false, &b"payload"[..], 7)]);
        bytes.truncate(bytes.len() - 2);
        let lazy = LazyArchiveRef::new(share_stream(Cursor::new(bytes)), offsets[0]);
        assert!(matches!(lazy.read_bytes(), Err(ArcError::UnexpectedEnd)));
    }

    #[test]
    fn oversized_declared_length() {
        let mut bytes = vec![];
        DataHeader {
            compressed: false,
            raw_size: u32::MAX,
            stored_size: u32::MAX,
        }
        .write_to(&mut bytes)
        .unwrap();
        bytes.extend_from_slice(b"tiny");
        let lazy = LazyArchiveRef::new(share_stream(Cursor::new(bytes)), 0);
        assert_eq!(lazy.header().unwrap().stored_size, u32::MAX);
        assert!(matches!(lazy.read_bytes(), Err(ArcError::UnexpectedEnd)));
    }

    #[test]
    fn in_memory_headers() {
        let plain = FileContentSource::from(b"xyz".to_vec());
        assert_eq!(
            plain.header().unwrap(),
            DataHeader {
                compressed: false,
                raw_size: 3,
                stored_size: 3
            }
        );
        let packed = FileContentSource::InMemoryCompressed {
            data: vec![1, 2],
            raw_size: 40,
        };
        assert!(packed.is_compressed().unwrap());
        assert_eq!(packed.stored_size().unwrap(), 2);
        assert_eq!(packed.raw_size().unwrap(), 40);
    }

    #[test]
    fn extract_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c.bin");
        let source = FileContentSource::InMemoryCompressed {
            data: compression::compress(b"nested").unwrap(),
            raw_size: 6,
        };
        source.extract(&target).unwrap();
        assert_eq!(fs::read(target).unwrap(), b"nested");
    }
}
