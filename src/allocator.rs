//! C2 — block allocator. Hands out page addresses segregated by
//! level, tracks per-block live-page counts, and picks GC
//! candidates. Built behind one lock as a single struct, generalized
//! from per-page locks to per-block live counters.

use std::sync::Mutex;

use log::debug;

use crate::config::FsConfig;
use crate::device::FlashDevice;
use crate::error::{FsError, FsResult};
use crate::types::Level;

#[derive(Copy, Clone, Debug)]
struct LevelCursor {
    active_block: usize,
    used_count: usize,
}

struct Inner {
    usage_counters: Vec<u16>,
    level_allocations: Vec<LevelCursor>,
    spare_count: usize,
}

pub struct BlockAllocator {
    inner: Mutex<Inner>,
}

impl BlockAllocator {
    /// Purge-mode population: wipe all counters and claim a fresh
    /// active block per level.
    pub fn purge(config: &FsConfig, device: &mut dyn FlashDevice) -> FsResult<BlockAllocator> {
        let mut inner = Inner {
            usage_counters: vec![0u16; config.device_size],
            level_allocations: Vec::with_capacity(config.max_levels()),
            spare_count: config.device_size,
        };
        for _ in 0..config.max_levels() {
            let block = Self::claim_free_block(&mut inner, config, device)?;
            inner.level_allocations.push(LevelCursor {
                active_block: block,
                used_count: 0,
            });
        }
        Ok(BlockAllocator {
            inner: Mutex::new(inner),
        })
    }

    /// Mount-scan population: reconstruct `usage_counters` and the
    /// active-block cursors from a pre-scanned tally; the scan itself
    /// lives in `session::mount`, which knows how to walk the stored
    /// trees.
    pub fn from_scan(
        usage_counters: Vec<u16>,
        level_allocations: Vec<(usize, usize)>,
    ) -> BlockAllocator {
        let spare_count = usage_counters.iter().filter(|&&c| c == 0).count();
        BlockAllocator {
            inner: Mutex::new(Inner {
                usage_counters,
                level_allocations: level_allocations
                    .into_iter()
                    .map(|(active_block, used_count)| LevelCursor {
                        active_block,
                        used_count,
                    })
                    .collect(),
                spare_count,
            }),
        }
    }

    /// Picks a block with no live pages that isn't already some level's
    /// active block — a block can sit at `usage_counters == 0` for a
    /// while after being claimed, before any page lands in it, so the
    /// zero-count scan alone can't tell "free" from "active but still
    /// empty".
    fn claim_free_block(
        inner: &mut Inner,
        config: &FsConfig,
        device: &mut dyn FlashDevice,
    ) -> FsResult<usize> {
        let active: std::collections::HashSet<usize> = inner
            .level_allocations
            .iter()
            .map(|c| c.active_block)
            .collect();
        let block = (0..inner.usage_counters.len())
            .find(|&b| inner.usage_counters[b] == 0 && !active.contains(&b))
            .ok_or(FsError::OutOfMemory)?;
        device.ensure_erased(block)?;
        inner.spare_count -= 1;
        let _ = config;
        Ok(block)
    }

    /// `allocate(level) -> addr`.
    pub fn allocate(
        &self,
        level: Level,
        config: &FsConfig,
        device: &mut dyn FlashDevice,
    ) -> FsResult<crate::types::Address> {
        let mut inner = self.inner.lock().unwrap();
        let idx = config.level_to_index(level);

        if inner.level_allocations[idx].used_count == config.block_size {
            let block = Self::claim_free_block(&mut inner, config, device)?;
            inner.level_allocations[idx] = LevelCursor {
                active_block: block,
                used_count: 0,
            };
        }

        let cursor = inner.level_allocations[idx];
        let addr = config.address_of(cursor.active_block, cursor.used_count);
        inner.level_allocations[idx].used_count += 1;
        inner.usage_counters[cursor.active_block] += 1;
        debug!("allocator: level {} -> {}", level, addr);
        Ok(addr)
    }

    /// `reclaim(addr)`.
    pub fn reclaim(&self, addr: crate::types::Address, config: &FsConfig) {
        let mut inner = self.inner.lock().unwrap();
        let block = addr.block(config.block_size);
        debug_assert!(inner.usage_counters[block] > 0);
        inner.usage_counters[block] -= 1;
        if inner.usage_counters[block] == 0 {
            inner.spare_count += 1;
        }
    }

    /// `claim(addr)`: reverse a prior reclaim, used by rollback.
    pub fn claim(&self, addr: crate::types::Address, config: &FsConfig) {
        let mut inner = self.inner.lock().unwrap();
        let block = addr.block(config.block_size);
        if inner.usage_counters[block] == 0 {
            inner.spare_count -= 1;
        }
        inner.usage_counters[block] += 1;
    }

    /// `gc_needed()`.
    pub fn gc_needed(&self, config: &FsConfig) -> bool {
        self.inner.lock().unwrap().spare_count <= config.max_levels()
    }

    pub fn spare_count(&self) -> usize {
        self.inner.lock().unwrap().spare_count
    }

    pub fn live(&self, block: usize) -> u16 {
        self.inner.lock().unwrap().usage_counters[block]
    }

    /// GC candidate iteration: ascending live count, skipping fully-live
    /// and currently-active blocks, tie-broken by block number.
    pub fn gc_candidates(&self, config: &FsConfig) -> Vec<usize> {
        let inner = self.inner.lock().unwrap();
        let active: std::collections::HashSet<usize> = inner
            .level_allocations
            .iter()
            .map(|c| c.active_block)
            .collect();

        let mut candidates: Vec<usize> = (0..config.device_size)
            .filter(|&b| {
                let live = inner.usage_counters[b];
                live > 0
                    && (live as usize) < config.block_size
                    && !active.contains(&b)
            })
            .collect();
        candidates.sort_by_key(|&b| (inner.usage_counters[b], b));
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn cfg() -> FsConfig {
        FsConfig::new(256, 4, 10, 3, 2, 2, 32).unwrap()
    }

    #[test]
    fn allocate_fills_a_block_then_rolls_over() {
        let config = cfg();
        let mut device = MemoryDevice::new(config.clone());
        let allocator = BlockAllocator::purge(&config, &mut device).unwrap();

        let mut addrs = vec![];
        for _ in 0..config.block_size {
            addrs.push(allocator.allocate(Level::META_LEAF, &config, &mut device).unwrap());
        }
        // all four pages land in the same block
        let block0 = addrs[0].block(config.block_size);
        assert!(addrs.iter().all(|a| a.block(config.block_size) == block0));

        // next allocation must claim a fresh block
        let next = allocator.allocate(Level::META_LEAF, &config, &mut device).unwrap();
        assert_ne!(next.block(config.block_size), block0);
    }

    #[test]
    fn reclaim_frees_a_spare_block() {
        let config = cfg();
        let mut device = MemoryDevice::new(config.clone());
        let allocator = BlockAllocator::purge(&config, &mut device).unwrap();
        let before = allocator.spare_count();

        let addr = allocator.allocate(Level::BLOB_DATA, &config, &mut device).unwrap();
        // drain the rest of the block so the reclaim actually frees it
        for _ in 1..config.block_size {
            allocator.allocate(Level::BLOB_DATA, &config, &mut device).unwrap();
        }
        assert_eq!(allocator.spare_count(), before - 1);

        for i in 0..config.block_size {
            allocator.reclaim(config.address_of(addr.block(config.block_size), i), &config);
        }
        assert_eq!(allocator.spare_count(), before);
    }
}
