//! Name hashing used by the on-disk index.
//!
//! The mixing function is 64-bit FNV-1a whose high half is folded into the
//! low half once all bytes are consumed.

const OFFSET_BASIS: u64 = 0xCBF2_9CE4_8422_2325;
const PRIME: u64 = 0x0000_0100_0000_01B3;

fn mix(bytes: impl IntoIterator<Item = u8>) -> u64 {
    let mut h = OFFSET_BASIS;
    for b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h ^ (h >> 32)
}

fn utf16le(s: &str) -> impl Iterator<Item = u8> + '_ {
    s.encode_utf16().flat_map(u16::to_le_bytes)
}

/// Case-insensitive hash over the UTF-16LE encoding of `name`.
pub fn name_hash_utf16(name: &str) -> u64 {
    mix(utf16le(&name.to_lowercase()))
}

/// Case-insensitive hash over the UTF-8 encoding of `name`.
pub fn name_hash_utf8(name: &str) -> u64 {
    mix(name.to_lowercase().into_bytes())
}

/// Case-sensitive hash over the UTF-16LE encoding of a full path.
pub fn unique_id_hash(full_path: &str) -> u64 {
    mix(utf16le(full_path))
}

/// Text encoding an index block is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameEncoding {
    Utf16,
    Utf8,
}

impl NameEncoding {
    pub fn hash(self, name: &str) -> u64 {
        match self {
            NameEncoding::Utf16 => name_hash_utf16(name),
            NameEncoding::Utf8 => name_hash_utf8(name),
        }
    }

    pub(crate) fn block_type(self) -> i32 {
        match self {
            NameEncoding::Utf16 => crate::BLOCK_HASH_TABLE_UTF16,
            NameEncoding::Utf8 => crate::BLOCK_HASH_TABLE_UTF8,
        }
    }
}
