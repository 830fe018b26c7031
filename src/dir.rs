//! Directory bodies
//!
//! Small directories keep a linear entry list; once a directory grows past
//! [`DIR_HASH_MIN_ENTRIES`] the body converts to an array of name-hash
//! buckets so lookups in wide directories stay O(1). Entries persist as
//! packed records in chained overflow blocks referenced from the owning
//! inode.

use crate::{FileType, FsError, FsResult, InodeNumber, DIR_HASH_BUCKETS, DIR_HASH_MIN_ENTRIES};

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    /// Entry name
    pub name: String,
    /// Inode the name resolves to
    pub ino: InodeNumber,
    /// File type of the target
    pub kind: FileType,
}

/// FNV-1a hash of an entry name
fn name_hash(name: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for b in name.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

fn bucket_of(name: &str) -> usize {
    (name_hash(name) % DIR_HASH_BUCKETS as u64) as usize
}

/// In-memory directory body
#[derive(Debug, Clone)]
pub enum DirBody {
    /// Linear entry list for small directories
    List(Vec<Dirent>),
    /// Hash buckets for wide directories
    Hash {
        /// `DIR_HASH_BUCKETS` chains keyed by name hash
        buckets: Vec<Vec<Dirent>>,
        /// Total entries across all buckets
        count: usize,
    },
}

impl DirBody {
    /// Create an empty directory body
    pub fn new() -> Self {
        DirBody::List(Vec::new())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        match self {
            DirBody::List(list) => list.len(),
            DirBody::Hash { count, .. } => *count,
        }
    }

    /// True when the directory holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find an entry by name
    pub fn lookup(&self, name: &str) -> Option<&Dirent> {
        match self {
            DirBody::List(list) => list.iter().find(|e| e.name == name),
            DirBody::Hash { buckets, .. } => {
                buckets[bucket_of(name)].iter().find(|e| e.name == name)
            }
        }
    }

    /// Add an entry, converting to hash buckets past the threshold
    pub fn insert(&mut self, name: &str, ino: InodeNumber, kind: FileType) -> FsResult<()> {
        if name.is_empty() || name.len() > crate::disk::NAME_MAX || name.contains('/') {
            return Err(FsError::Invalid);
        }
        if self.lookup(name).is_some() {
            return Err(FsError::Exists);
        }
        let entry = Dirent {
            name: name.to_string(),
            ino,
            kind,
        };
        match self {
            DirBody::List(list) if list.len() + 1 <= DIR_HASH_MIN_ENTRIES => {
                list.push(entry);
            }
            DirBody::List(_) => {
                self.convert_to_hash();
                self.insert_hashed(entry);
            }
            DirBody::Hash { .. } => self.insert_hashed(entry),
        }
        Ok(())
    }

    /// Remove and return the entry named `name`
    pub fn remove(&mut self, name: &str) -> FsResult<Dirent> {
        match self {
            DirBody::List(list) => {
                let pos = list
                    .iter()
                    .position(|e| e.name == name)
                    .ok_or(FsError::NotFound)?;
                Ok(list.remove(pos))
            }
            DirBody::Hash { buckets, count } => {
                let chain = &mut buckets[bucket_of(name)];
                let pos = chain
                    .iter()
                    .position(|e| e.name == name)
                    .ok_or(FsError::NotFound)?;
                *count -= 1;
                Ok(chain.remove(pos))
            }
        }
    }

    /// Entries in iteration order, skipping the first `cookie` of them.
    ///
    /// The order is stable as long as the directory is not modified, which
    /// is what readdir cookies require.
    pub fn entries_from(&self, cookie: usize) -> Vec<Dirent> {
        match self {
            DirBody::List(list) => list.iter().skip(cookie).cloned().collect(),
            DirBody::Hash { buckets, .. } => buckets
                .iter()
                .flatten()
                .skip(cookie)
                .cloned()
                .collect(),
        }
    }

    fn insert_hashed(&mut self, entry: Dirent) {
        if let DirBody::Hash { buckets, count } = self {
            buckets[bucket_of(&entry.name)].push(entry);
            *count += 1;
        }
    }

    fn convert_to_hash(&mut self) {
        if let DirBody::List(list) = self {
            let mut buckets = vec![Vec::new(); DIR_HASH_BUCKETS];
            let count = list.len();
            for entry in list.drain(..) {
                buckets[bucket_of(&entry.name)].push(entry);
            }
            *self = DirBody::Hash { buckets, count };
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Append every entry as a packed record to `out`
    pub fn encode(&self, out: &mut crate::disk::ChainWriter) {
        for entry in self.entries_from(0) {
            let name = entry.name.as_bytes();
            let mut record = Vec::with_capacity(11 + name.len());
            record.extend_from_slice(&entry.ino.to_ne_bytes());
            record.push(kind_to_byte(entry.kind));
            record.extend_from_slice(&(name.len() as u16).to_ne_bytes());
            record.extend_from_slice(name);
            out.push(&record);
        }
    }

    /// Parse the packed records of one chain-block payload
    pub fn parse_block(&mut self, payload: &[u8]) -> FsResult<()> {
        let mut pos = 0;
        while pos < payload.len() {
            if pos + 11 > payload.len() {
                return Err(FsError::Corrupt);
            }
            let ino = u64::from_ne_bytes(payload[pos..pos + 8].try_into().unwrap());
            let kind = byte_to_kind(payload[pos + 8]).ok_or(FsError::Corrupt)?;
            let name_len =
                u16::from_ne_bytes(payload[pos + 9..pos + 11].try_into().unwrap()) as usize;
            pos += 11;
            if pos + name_len > payload.len() {
                return Err(FsError::Corrupt);
            }
            let name = std::str::from_utf8(&payload[pos..pos + name_len])
                .map_err(|_| FsError::Corrupt)?;
            pos += name_len;
            self.insert(name, ino, kind).map_err(|_| FsError::Corrupt)?;
        }
        Ok(())
    }
}

impl Default for DirBody {
    fn default() -> Self {
        Self::new()
    }
}

/// Compact file type tag used in packed directory records
pub fn kind_to_byte(kind: FileType) -> u8 {
    match kind {
        FileType::Regular => 1,
        FileType::Directory => 2,
        FileType::SymbolicLink => 3,
        FileType::CharacterDevice => 4,
        FileType::BlockDevice => 5,
        FileType::NamedPipe => 6,
        FileType::Socket => 7,
    }
}

/// Inverse of [`kind_to_byte`]
pub fn byte_to_kind(byte: u8) -> Option<FileType> {
    Some(match byte {
        1 => FileType::Regular,
        2 => FileType::Directory,
        3 => FileType::SymbolicLink,
        4 => FileType::CharacterDevice,
        5 => FileType::BlockDevice,
        6 => FileType::NamedPipe,
        7 => FileType::Socket,
        _ => return None,
    })
}
