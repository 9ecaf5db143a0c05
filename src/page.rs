//! On-flash page shape: a fixed-size byte array whose last bytes form the
//! page's metadata tail. Two payload kinds share the same physical
//! layout — metadata-tree pages and blob-tree pages — and are told
//! apart by the `level` tag, which this crate reserves 4 bytes for
//! immediately before the 8-byte tail.

use crate::config::{FsConfig, TRAILER_LEN};
use crate::types::Level;

const UNWRITTEN_SEQUENCE: u32 = u32::MAX;
const UNWRITTEN_ID: u32 = u32::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Tail {
    /// `level >= 0`: the sequence number stamped on a page that is (or
    /// was, at the instant it was written) the new metadata root. `0`
    /// means "not a root page"; the all-ones value marks an unwritten
    /// page.
    Metadata { sequence: u32 },
    /// `level < 0`: links a blob page back to its owning file, so GC can
    /// find the metadata entry that owns a candidate page without a
    /// separate index.
    Blob { file_id: u32, parent_id: u32 },
}

impl Tail {
    pub fn is_unwritten(self) -> bool {
        match self {
            Tail::Metadata { sequence } => sequence == UNWRITTEN_SEQUENCE,
            Tail::Blob { file_id, parent_id } => {
                file_id == UNWRITTEN_ID && parent_id == UNWRITTEN_ID
            }
        }
    }

    pub fn sequence(self) -> Option<u32> {
        match self {
            Tail::Metadata { sequence } if sequence != UNWRITTEN_SEQUENCE => Some(sequence),
            _ => None,
        }
    }
}

/// One in-memory copy of a page's bytes, with the level/tail trailer
/// parsed out on demand rather than kept separately — the bytes are the
/// single source of truth, exactly what gets written to the device.
#[derive(Clone)]
pub struct Page {
    bytes: Vec<u8>,
}

impl Page {
    pub fn blank(config: &FsConfig) -> Page {
        Page {
            bytes: vec![0xFF; config.page_size],
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Page {
        Page { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn payload(&self) -> &[u8] {
        let end = self.bytes.len() - TRAILER_LEN;
        &self.bytes[..end]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = self.bytes.len() - TRAILER_LEN;
        &mut self.bytes[..end]
    }

    pub fn level(&self) -> Level {
        let n = self.bytes.len();
        let raw = i32::from_le_bytes(self.bytes[n - TRAILER_LEN..n - TRAILER_LEN + 4].try_into().unwrap());
        Level(raw)
    }

    pub fn set_level(&mut self, level: Level) {
        let n = self.bytes.len();
        self.bytes[n - TRAILER_LEN..n - TRAILER_LEN + 4].copy_from_slice(&level.0.to_le_bytes());
    }

    fn tail_bytes(&mut self) -> &mut [u8] {
        let n = self.bytes.len();
        &mut self.bytes[n - 8..]
    }

    pub fn tail(&self) -> Tail {
        let n = self.bytes.len();
        let raw = &self.bytes[n - 8..];
        if self.level().is_metadata() {
            let sequence = u32::from_le_bytes(raw[0..4].try_into().unwrap());
            Tail::Metadata { sequence }
        } else {
            let file_id = u32::from_le_bytes(raw[0..4].try_into().unwrap());
            let parent_id = u32::from_le_bytes(raw[4..8].try_into().unwrap());
            Tail::Blob { file_id, parent_id }
        }
    }

    pub fn set_tail(&mut self, tail: Tail) {
        match tail {
            Tail::Metadata { sequence } => {
                let bytes = self.tail_bytes();
                bytes[0..4].copy_from_slice(&sequence.to_le_bytes());
                bytes[4..8].copy_from_slice(&UNWRITTEN_ID.to_le_bytes());
            }
            Tail::Blob { file_id, parent_id } => {
                let bytes = self.tail_bytes();
                bytes[0..4].copy_from_slice(&file_id.to_le_bytes());
                bytes[4..8].copy_from_slice(&parent_id.to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;

    fn cfg() -> FsConfig {
        FsConfig::new(256, 4, 10, 3, 2, 2, 32).unwrap()
    }

    #[test]
    fn blank_page_is_unwritten() {
        let page = Page::blank(&cfg());
        assert!(page.tail().is_unwritten());
    }

    #[test]
    fn metadata_tail_round_trips() {
        let mut page = Page::blank(&cfg());
        page.set_level(Level::meta(0));
        page.set_tail(Tail::Metadata { sequence: 7 });
        assert_eq!(page.tail(), Tail::Metadata { sequence: 7 });
        assert_eq!(page.tail().sequence(), Some(7));
    }

    #[test]
    fn blob_tail_round_trips() {
        let mut page = Page::blank(&cfg());
        page.set_level(Level::BLOB_DATA);
        page.set_tail(Tail::Blob {
            file_id: 3,
            parent_id: 1,
        });
        assert_eq!(
            page.tail(),
            Tail::Blob {
                file_id: 3,
                parent_id: 1
            }
        );
    }
}
