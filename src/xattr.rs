//! Extended attributes
//!
//! Each inode may carry a list of name/value pairs. The list is shared by
//! reference after copy-up and persisted as packed records in chained
//! overflow blocks.

use crate::{FsError, FsResult};

/// Extended attribute list of one inode
#[derive(Debug, Clone, Default)]
pub struct Xattrs {
    list: Vec<(String, Vec<u8>)>,
}

impl Xattrs {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of attribute `name`
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.list
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Set or replace an attribute
    pub fn set(&mut self, name: &str, value: &[u8]) -> FsResult<()> {
        if name.is_empty() || name.len() > crate::disk::NAME_MAX {
            return Err(FsError::Invalid);
        }
        match self.list.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value.to_vec(),
            None => self.list.push((name.to_string(), value.to_vec())),
        }
        Ok(())
    }

    /// Remove an attribute
    pub fn remove(&mut self, name: &str) -> FsResult<()> {
        let pos = self
            .list
            .iter()
            .position(|(n, _)| n == name)
            .ok_or(FsError::NotFound)?;
        self.list.remove(pos);
        Ok(())
    }

    /// All attribute names
    pub fn names(&self) -> Vec<String> {
        self.list.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// True when no attributes are set
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Append every pair as a packed record to `out`
    pub fn encode(&self, out: &mut crate::disk::ChainWriter) {
        for (name, value) in &self.list {
            let mut record = Vec::with_capacity(6 + name.len() + value.len());
            record.extend_from_slice(&(name.len() as u16).to_ne_bytes());
            record.extend_from_slice(&(value.len() as u32).to_ne_bytes());
            record.extend_from_slice(name.as_bytes());
            record.extend_from_slice(value);
            out.push(&record);
        }
    }

    /// Parse the packed records of one chain-block payload
    pub fn parse_block(&mut self, payload: &[u8]) -> FsResult<()> {
        let mut pos = 0;
        while pos < payload.len() {
            if pos + 6 > payload.len() {
                return Err(FsError::Corrupt);
            }
            let name_len =
                u16::from_ne_bytes(payload[pos..pos + 2].try_into().unwrap()) as usize;
            let value_len =
                u32::from_ne_bytes(payload[pos + 2..pos + 6].try_into().unwrap()) as usize;
            pos += 6;
            if pos + name_len + value_len > payload.len() {
                return Err(FsError::Corrupt);
            }
            let name = std::str::from_utf8(&payload[pos..pos + name_len])
                .map_err(|_| FsError::Corrupt)?
                .to_string();
            pos += name_len;
            let value = payload[pos..pos + value_len].to_vec();
            pos += value_len;
            self.list.push((name, value));
        }
        Ok(())
    }
}
