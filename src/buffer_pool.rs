//! C1 — page-granularity buffer pool. A fixed array of slots caches
//! pages by address; dirtying a buffer defers its address assignment to
//! release time, where the block allocator (C2) is consulted. Slots are
//! indexed by address in a `HashMap`, with the COW eviction/dirty-release
//! policy below.

use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, trace};

use crate::allocator::BlockAllocator;
use crate::config::FsConfig;
use crate::device::FlashDevice;
use crate::error::{FsError, FsResult};
use crate::page::Page;
use crate::types::{Address, Level, ReleaseMode};

/// Opaque handle into a pool slot. Cheap, `Copy`, valid only for the
/// lifetime of the pin it represents.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferHandle(usize);

struct Slot {
    page: Option<Page>,
    address: Address,
    pin_count: u32,
    dirty: bool,
    recency: u64,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            page: None,
            address: Address::INVALID,
            pin_count: 0,
            dirty: false,
            recency: 0,
        }
    }
}

/// Outcome of a `release()` call, carrying the addresses the session
/// layer needs to thread through its `garbage`/`newish` queues.
#[derive(Copy, Clone, Debug, Default)]
pub struct ReleaseOutcome {
    /// The address the page now lives at, if this release produced a
    /// fresh one (`Dirty` only).
    pub address: Option<Address>,
    /// A previously-stored address this release superseded or disposed
    /// of (`Dirty`, when the buffer held an on-device copy already; or
    /// `Purge`, the buffer's current address).
    pub shadowed: Option<Address>,
}

struct Inner {
    slots: Vec<Slot>,
    index: HashMap<Address, usize>,
    clock: u64,
}

/// All pool state lives behind one mutex: a finer-grained scheme would
/// race between assigning a fresh address and wiping stale copies of it
/// in other slots.
pub struct BufferPool {
    inner: Mutex<Inner>,
}

impl BufferPool {
    pub fn new(config: &FsConfig) -> BufferPool {
        let slots = (0..config.n_buffers).map(|_| Slot::empty()).collect();
        BufferPool {
            inner: Mutex::new(Inner {
                slots,
                index: HashMap::new(),
                clock: 0,
            }),
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.slots.len();
        inner.slots = (0..n).map(|_| Slot::empty()).collect();
        inner.index.clear();
    }

    /// `find(addr)`: pin and return a cached copy, or bring one in. If
    /// `addr == INVALID`, a blank page is allocated in a slot instead
    /// (the caller is expected to `set_level` on it immediately).
    pub fn find(
        &self,
        addr: Address,
        config: &FsConfig,
        device: &mut dyn FlashDevice,
    ) -> FsResult<BufferHandle> {
        let mut inner = self.inner.lock().unwrap();

        if addr.is_valid() {
            if let Some(&idx) = inner.index.get(&addr) {
                inner.slots[idx].pin_count += 1;
                let clock = inner.clock;
                inner.slots[idx].recency = clock;
                inner.clock += 1;
                trace!("buffer_pool: hit {}", addr);
                return Ok(BufferHandle(idx));
            }
        }

        let idx = Self::evict(&mut inner, device)?;

        let page = if addr.is_valid() {
            let mut bytes = vec![0u8; config.page_size];
            device.read(addr, &mut bytes)?;
            Page::from_bytes(bytes)
        } else {
            Page::blank(config)
        };

        if let Some(old_addr) = Some(inner.slots[idx].address).filter(|a| a.is_valid()) {
            inner.index.remove(&old_addr);
        }

        inner.slots[idx] = Slot {
            page: Some(page),
            address: addr,
            pin_count: 1,
            dirty: false,
            recency: inner.clock,
        };
        inner.clock += 1;

        if addr.is_valid() {
            inner.index.insert(addr, idx);
        }

        debug!("buffer_pool: loaded slot {} for {}", idx, addr);
        Ok(BufferHandle(idx))
    }

    /// Scan unpinned slots, tracking the LRU clean and LRU dirty
    /// candidate, flushing the dirty one to the device if it wins out.
    fn evict(inner: &mut Inner, device: &mut dyn FlashDevice) -> FsResult<usize> {
        let clock = inner.clock;
        let mut best_clean: Option<(usize, u64)> = None;
        let mut best_dirty: Option<(usize, u64)> = None;

        for (i, slot) in inner.slots.iter().enumerate() {
            if slot.pin_count > 0 {
                continue;
            }
            let unrecentness = if slot.page.is_none() {
                u64::MAX
            } else {
                clock.wrapping_sub(slot.recency)
            };
            if slot.dirty {
                if best_dirty.map_or(true, |(_, u)| unrecentness > u) {
                    best_dirty = Some((i, unrecentness));
                }
            } else if best_clean.map_or(true, |(_, u)| unrecentness > u) {
                best_clean = Some((i, unrecentness));
            }
        }

        match (best_clean, best_dirty) {
            (None, None) => Err(FsError::OutOfMemory),
            (Some((i, _)), None) => Ok(i),
            (None, Some((i, _))) => {
                Self::flush_slot(inner, i, device)?;
                Ok(i)
            }
            (Some((clean_idx, clean_u)), Some((dirty_idx, dirty_u))) => {
                if clean_u < dirty_u / 2 {
                    Self::flush_slot(inner, dirty_idx, device)?;
                    Ok(dirty_idx)
                } else {
                    Ok(clean_idx)
                }
            }
        }
    }

    fn flush_slot(inner: &mut Inner, idx: usize, device: &mut dyn FlashDevice) -> FsResult<()> {
        let slot = &mut inner.slots[idx];
        debug_assert!(slot.dirty);
        let page = slot.page.as_ref().expect("dirty slot must hold a page");
        device.write(slot.address, page.as_bytes())?;
        slot.dirty = false;
        Ok(())
    }

    pub fn page(&self, handle: BufferHandle) -> PageRef<'_> {
        PageRef {
            inner: self.inner.lock().unwrap(),
            idx: handle.0,
        }
    }

    pub fn page_mut(&self, handle: BufferHandle) -> PageRefMut<'_> {
        PageRefMut {
            inner: self.inner.lock().unwrap(),
            idx: handle.0,
        }
    }

    pub fn address_of(&self, handle: BufferHandle) -> Address {
        self.inner.lock().unwrap().slots[handle.0].address
    }

    pub fn level_of(&self, handle: BufferHandle) -> Level {
        self.inner.lock().unwrap().slots[handle.0]
            .page
            .as_ref()
            .unwrap()
            .level()
    }

    /// `release(buffer, mode)`.
    pub fn release(
        &self,
        handle: BufferHandle,
        mode: ReleaseMode,
        config: &FsConfig,
        device: &mut dyn FlashDevice,
        allocator: &BlockAllocator,
    ) -> FsResult<ReleaseOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let idx = handle.0;

        match mode {
            ReleaseMode::Clean => {
                inner.slots[idx].pin_count -= 1;
                Ok(ReleaseOutcome::default())
            }
            ReleaseMode::Dirty => {
                let already_dirty = inner.slots[idx].dirty;
                let old_address = inner.slots[idx].address;

                if !already_dirty {
                    let level = inner.slots[idx].page.as_ref().unwrap().level();
                    let new_address = allocator.allocate(level, config, device)?;

                    // Wipe any other slot that happens to hold the
                    // freshly-minted address: it must be clean and
                    // unpinned, since a live copy of a not-yet-reused
                    // address could only be the very buffer we're
                    // dirtying right now.
                    if let Some(&shadow_idx) = inner.index.get(&new_address) {
                        debug_assert_ne!(shadow_idx, idx);
                        let shadow = &inner.slots[shadow_idx];
                        assert!(
                            !shadow.dirty && shadow.pin_count == 0,
                            "address {} reused while a stale copy is still live",
                            new_address
                        );
                        inner.slots[shadow_idx] = Slot::empty();
                        inner.index.remove(&new_address);
                    }

                    if old_address.is_valid() {
                        inner.index.remove(&old_address);
                        allocator.reclaim(old_address, config);
                    }
                    inner.index.insert(new_address, idx);

                    inner.slots[idx].address = new_address;
                    inner.slots[idx].dirty = true;
                }

                inner.slots[idx].pin_count -= 1;

                Ok(ReleaseOutcome {
                    address: Some(inner.slots[idx].address),
                    shadowed: if already_dirty || !old_address.is_valid() {
                        None
                    } else {
                        Some(old_address)
                    },
                })
            }
            ReleaseMode::Purge => {
                let address = inner.slots[idx].address;
                if address.is_valid() {
                    allocator.reclaim(address, config);
                    inner.index.remove(&address);
                }
                inner.slots[idx] = Slot::empty();
                Ok(ReleaseOutcome {
                    address: None,
                    shadowed: if address.is_valid() { Some(address) } else { None },
                })
            }
        }
    }

    /// `flush()`: write back every dirty buffer, LRU first.
    pub fn flush(&self, device: &mut dyn FlashDevice) -> FsResult<()> {
        loop {
            let mut inner = self.inner.lock().unwrap();
            let victim = inner
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.dirty)
                .max_by_key(|(_, s)| inner.clock.wrapping_sub(s.recency))
                .map(|(i, _)| i);
            match victim {
                None => return Ok(()),
                Some(idx) => Self::flush_slot(&mut inner, idx, device)?,
            }
        }
    }
}

pub struct PageRef<'a> {
    inner: std::sync::MutexGuard<'a, Inner>,
    idx: usize,
}

impl<'a> std::ops::Deref for PageRef<'a> {
    type Target = Page;
    fn deref(&self) -> &Page {
        self.inner.slots[self.idx].page.as_ref().unwrap()
    }
}

pub struct PageRefMut<'a> {
    inner: std::sync::MutexGuard<'a, Inner>,
    idx: usize,
}

impl<'a> std::ops::Deref for PageRefMut<'a> {
    type Target = Page;
    fn deref(&self) -> &Page {
        self.inner.slots[self.idx].page.as_ref().unwrap()
    }
}

impl<'a> std::ops::DerefMut for PageRefMut<'a> {
    fn deref_mut(&mut self) -> &mut Page {
        self.inner.slots[self.idx].page.as_mut().unwrap()
    }
}
