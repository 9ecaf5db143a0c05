//! Node/leaf shapes and their on-page encoding. An internal *node*
//! holds separator index keys and child addresses; a leaf (*table*)
//! holds key/value entries. Capacities `M`/`K` are derived from
//! `FsConfig` at construction, not compile-time constants, so one
//! binary can mount devices of different page/block geometry.

use crate::btree::key::{IndexKey, MetaKey, MetaValue};
use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::page::Page;
use crate::types::Address;

const ENTRY_FIXED_LEN: usize = 4 + 4 + 4 + 8 + 4; // parent_id, name_hash, id, blob_root, size
const INDEX_KEY_LEN: usize = 8; // parent_id + name_hash
const ADDRESS_LEN: usize = 8;
const COUNT_LEN: usize = 4;

pub fn entry_len(config: &FsConfig) -> usize {
    ENTRY_FIXED_LEN + config.max_filename_length + 1
}

/// Leaf capacity `M = floor(payload_size / sizeof(Element))`.
pub fn leaf_capacity(config: &FsConfig) -> usize {
    config.payload_size() / entry_len(config)
}

/// Internal fan-out `K`: how many separator/child slots fit a page.
pub fn internal_capacity(config: &FsConfig) -> usize {
    (config.payload_size() + INDEX_KEY_LEN - COUNT_LEN) / (ADDRESS_LEN + INDEX_KEY_LEN)
}

/// Split point, shared by leaves and internal nodes.
pub fn split_point(capacity: usize) -> usize {
    (capacity + 1 + 1) / 2
}

#[derive(Clone, Debug)]
pub struct Leaf {
    pub entries: Vec<(MetaKey, MetaValue)>,
    pub capacity: usize,
}

impl Leaf {
    pub fn empty(config: &FsConfig) -> Leaf {
        Leaf {
            entries: Vec::new(),
            capacity: leaf_capacity(config),
        }
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Position of the first entry whose full key is `>= key`.
    pub fn lower_bound(&self, key: &MetaKey) -> usize {
        self.entries.partition_point(|(k, _)| k < key)
    }

    pub fn decode(page: &Page, config: &FsConfig) -> Leaf {
        let capacity = leaf_capacity(config);
        let elen = entry_len(config);
        let payload = page.payload();
        let mut entries = Vec::new();

        for i in 0..capacity {
            let base = i * elen;
            let parent_id = u32::from_le_bytes(payload[base..base + 4].try_into().unwrap());
            let name_hash = u32::from_le_bytes(payload[base + 4..base + 8].try_into().unwrap());
            let id = u32::from_le_bytes(payload[base + 8..base + 12].try_into().unwrap());
            if id == MetaKey::INVALID_ID {
                break;
            }
            let name_start = base + 12;
            let name_end = name_start + config.max_filename_length + 1;
            let raw_name = &payload[name_start..name_end];
            let nul = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
            let name = raw_name[..nul].to_vec();

            let blob_base = name_end;
            let blob_root = Address(u64::from_le_bytes(
                payload[blob_base..blob_base + 8].try_into().unwrap(),
            ));
            let size = u32::from_le_bytes(payload[blob_base + 8..blob_base + 12].try_into().unwrap());

            entries.push((
                MetaKey {
                    parent_id,
                    name_hash,
                    id,
                    name,
                },
                MetaValue { blob_root, size },
            ));
        }

        Leaf { entries, capacity }
    }

    pub fn encode(&self, page: &mut Page, config: &FsConfig) -> FsResult<()> {
        let elen = entry_len(config);
        if self.entries.len() > self.capacity {
            return Err(FsError::Internal("leaf over capacity".into()));
        }
        let payload = page.payload_mut();
        for b in payload.iter_mut() {
            *b = 0;
        }

        for (i, (key, value)) in self.entries.iter().enumerate() {
            let base = i * elen;
            if key.name.len() > config.max_filename_length {
                return Err(FsError::InvalidArgument("filename too long".into()));
            }
            payload[base..base + 4].copy_from_slice(&key.parent_id.to_le_bytes());
            payload[base + 4..base + 8].copy_from_slice(&key.name_hash.to_le_bytes());
            payload[base + 8..base + 12].copy_from_slice(&key.id.to_le_bytes());
            let name_start = base + 12;
            payload[name_start..name_start + key.name.len()].copy_from_slice(&key.name);
            let blob_base = name_start + config.max_filename_length + 1;
            payload[blob_base..blob_base + 8].copy_from_slice(&value.blob_root.0.to_le_bytes());
            payload[blob_base + 8..blob_base + 12].copy_from_slice(&value.size.to_le_bytes());
        }

        if self.entries.len() < self.capacity {
            let base = self.entries.len() * elen;
            // id = all-ones marks the sentinel "end of live entries".
            payload[base + 8..base + 12].copy_from_slice(&MetaKey::INVALID_ID.to_le_bytes());
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Internal {
    /// `numBranches - 1` separators.
    pub keys: Vec<IndexKey>,
    /// `numBranches` children, one more than `keys`.
    pub children: Vec<Address>,
    pub capacity: usize,
}

impl Internal {
    pub fn new(config: &FsConfig, left: Address, separator: IndexKey, right: Address) -> Internal {
        Internal {
            keys: vec![separator],
            children: vec![left, right],
            capacity: internal_capacity(config),
        }
    }

    pub fn num_branches(&self) -> usize {
        self.children.len()
    }

    pub fn is_full(&self) -> bool {
        self.num_branches() >= self.capacity
    }

    /// Index of the child whose subtree may contain `bound`: the last
    /// child `i` such that `keys[i-1] <= bound` (standard B+tree
    /// descent using the index comparator).
    pub fn child_for(&self, locate: impl Fn(&IndexKey) -> std::cmp::Ordering) -> usize {
        let mut i = 0;
        while i < self.keys.len() && locate(&self.keys[i]) != std::cmp::Ordering::Less {
            i += 1;
        }
        i
    }

    pub fn decode(page: &Page, config: &FsConfig) -> Internal {
        let capacity = internal_capacity(config);
        let payload = page.payload();
        let num_branches = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;

        let mut keys = Vec::with_capacity(num_branches.saturating_sub(1));
        let mut off = COUNT_LEN;
        for _ in 0..num_branches.saturating_sub(1) {
            let parent_id = u32::from_le_bytes(payload[off..off + 4].try_into().unwrap());
            let name_hash = u32::from_le_bytes(payload[off + 4..off + 8].try_into().unwrap());
            keys.push(IndexKey { parent_id, name_hash });
            off += INDEX_KEY_LEN;
        }

        off = COUNT_LEN + (capacity - 1) * INDEX_KEY_LEN;
        let mut children = Vec::with_capacity(num_branches);
        for _ in 0..num_branches {
            let addr = u64::from_le_bytes(payload[off..off + 8].try_into().unwrap());
            children.push(Address(addr));
            off += ADDRESS_LEN;
        }

        Internal { keys, children, capacity }
    }

    pub fn encode(&self, page: &mut Page, config: &FsConfig) -> FsResult<()> {
        if self.children.len() != self.keys.len() + 1 {
            return Err(FsError::Internal("internal node arity mismatch".into()));
        }
        if self.num_branches() > self.capacity {
            return Err(FsError::Internal("internal node over capacity".into()));
        }
        let payload = page.payload_mut();
        for b in payload.iter_mut() {
            *b = 0;
        }

        payload[0..4].copy_from_slice(&(self.num_branches() as u32).to_le_bytes());

        let mut off = COUNT_LEN;
        for k in &self.keys {
            payload[off..off + 4].copy_from_slice(&k.parent_id.to_le_bytes());
            payload[off + 4..off + 8].copy_from_slice(&k.name_hash.to_le_bytes());
            off += INDEX_KEY_LEN;
        }

        off = COUNT_LEN + (self.capacity - 1) * INDEX_KEY_LEN;
        for addr in &self.children {
            payload[off..off + 8].copy_from_slice(&addr.0.to_le_bytes());
            off += ADDRESS_LEN;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FsConfig {
        FsConfig::new(256, 4, 10, 3, 2, 2, 32).unwrap()
    }

    #[test]
    fn leaf_round_trips() {
        let config = cfg();
        let mut leaf = Leaf::empty(&config);
        leaf.entries.push((
            MetaKey::new(0, 1, b"foo"),
            MetaValue { blob_root: Address(42), size: 7 },
        ));
        leaf.entries.push((
            MetaKey::new(0, 2, b"bar"),
            MetaValue::directory(),
        ));
        leaf.entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut page = Page::blank(&config);
        leaf.encode(&mut page, &config).unwrap();
        let decoded = Leaf::decode(&page, &config);
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[0].0.id, leaf.entries[0].0.id);
        assert_eq!(decoded.entries[1].1.size, MetaValue::NO_DATA);
    }

    #[test]
    fn internal_round_trips() {
        let config = cfg();
        let node = Internal::new(
            &config,
            Address(1),
            IndexKey { parent_id: 0, name_hash: 5 },
            Address(2),
        );
        let mut page = Page::blank(&config);
        node.encode(&mut page, &config).unwrap();
        let decoded = Internal::decode(&page, &config);
        assert_eq!(decoded.children, vec![Address(1), Address(2)]);
        assert_eq!(decoded.keys, vec![IndexKey { parent_id: 0, name_hash: 5 }]);
    }

    #[test]
    fn capacities_are_at_least_three() {
        let config = cfg();
        assert!(leaf_capacity(&config) >= 3);
        assert!(internal_capacity(&config) >= 3);
    }
}
