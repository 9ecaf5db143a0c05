//! C3 — session/storage layer. Wraps the buffer pool and allocator in
//! read-only and read-write transactions with commit/rollback, mount-
//! time root recovery, and the deferred-GC hook: a small `Copy`
//! transaction handle plus a per-`Filesystem` coordinator behind locks.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};

use crate::allocator::BlockAllocator;
use crate::buffer_pool::{BufferHandle, BufferPool};
use crate::config::FsConfig;
use crate::device::FlashDevice;
use crate::error::{FsError, FsResult};
use crate::page::{Page, Tail};
use crate::types::{Address, Level, ReleaseMode};
use crate::util::HandyRwLock;

/// Everything the core shares across sessions: buffer pool, allocator,
/// the root admission lock, the monotone root-sequence counter, the
/// next-node-id counter and the current in-memory root pointer.
///
/// Deliberately NOT a process-global singleton: each mounted filesystem
/// owns its state so tests can mount as many independent instances as
/// they like.
pub struct Filesystem {
    pub(crate) config: FsConfig,
    pub(crate) device: Mutex<Box<dyn FlashDevice>>,
    pub(crate) buffer_pool: BufferPool,
    pub(crate) allocator: BlockAllocator,
    root_lock: RwLock<()>,
    next_sequence: AtomicU32,
    next_id: AtomicU32,
    root: Mutex<RootPointer>,
    read_only: AtomicBool,
    in_gc: AtomicBool,
}

#[derive(Copy, Clone, Debug)]
pub struct RootPointer {
    pub address: Address,
    pub level: Level,
}

impl Filesystem {
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn root(&self) -> RootPointer {
        *self.root.lock().unwrap()
    }

    pub(crate) fn set_root(&self, root: RootPointer) {
        *self.root.lock().unwrap() = root;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_read_only(&self) {
        warn!("filesystem: flipping to read-only after a GC failure");
        self.read_only.store(true, Ordering::SeqCst);
    }

    pub(crate) fn next_sequence(&self) -> u32 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_node_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Format a fresh device: erase everything, claim one active block
    /// per level, and start with an empty metadata root (a single leaf).
    pub fn purge(
        config: FsConfig,
        mut device: Box<dyn FlashDevice>,
    ) -> FsResult<Filesystem> {
        let allocator = BlockAllocator::purge(&config, device.as_mut())?;
        let fs = Filesystem {
            buffer_pool: BufferPool::new(&config),
            config,
            device: Mutex::new(device),
            allocator,
            root_lock: RwLock::new(()),
            next_sequence: AtomicU32::new(1),
            next_id: AtomicU32::new(1),
            root: Mutex::new(RootPointer {
                address: Address::INVALID,
                level: Level::META_LEAF,
            }),
            read_only: AtomicBool::new(false),
            in_gc: AtomicBool::new(false),
        };
        Ok(fs)
    }

    /// Reopens a previously-formatted device: scans every page to
    /// rebuild the allocator's per-block live counts and active-block
    /// cursors, and recovers the root as the metadata page (`level >=
    /// 0`) carrying the highest sequence number. A page counts as live
    /// if it was ever written — this
    /// crate has no separate reachability index, so a page orphaned by
    /// a crash between writing it and writing its parent is counted as
    /// live until the next GC pass notices otherwise.
    pub fn mount(config: FsConfig, device: Box<dyn FlashDevice>) -> FsResult<Filesystem> {
        let mut usage_counters = vec![0u16; config.device_size];
        let mut level_best: Vec<Option<(usize, usize)>> = vec![None; config.max_levels()];
        let mut best_root: Option<(Address, Level, u32)> = None;

        for block in 0..config.device_size {
            for offset in 0..config.block_size {
                let addr = config.address_of(block, offset);
                let mut bytes = vec![0u8; config.page_size];
                device.read(addr, &mut bytes)?;
                let page = Page::from_bytes(bytes);
                let tail = page.tail();
                if tail.is_unwritten() {
                    continue;
                }
                usage_counters[block] += 1;

                let level = page.level();
                let idx = config.level_to_index(level);
                match level_best[idx] {
                    Some((b, u)) if b == block && offset + 1 > u => {
                        level_best[idx] = Some((block, offset + 1));
                    }
                    None => level_best[idx] = Some((block, offset + 1)),
                    _ => {}
                }

                if level.is_metadata() {
                    if let Some(seq) = tail.sequence() {
                        if best_root.map_or(true, |(_, _, s)| seq > s) {
                            best_root = Some((addr, level, seq));
                        }
                    }
                }
            }
        }

        let level_allocations: Vec<(usize, usize)> = (0..config.max_levels())
            .map(|idx| level_best[idx].unwrap_or((0, config.block_size)))
            .collect();
        let allocator = BlockAllocator::from_scan(usage_counters, level_allocations);

        let (root_address, root_level) = match best_root {
            Some((addr, level, _)) => (addr, level),
            None => (Address::INVALID, Level::META_LEAF),
        };
        let next_sequence = best_root.map_or(1, |(_, _, s)| s + 1);

        let fs = Filesystem {
            buffer_pool: BufferPool::new(&config),
            config,
            device: Mutex::new(device),
            allocator,
            root_lock: RwLock::new(()),
            next_sequence: AtomicU32::new(next_sequence),
            next_id: AtomicU32::new(1),
            root: Mutex::new(RootPointer {
                address: root_address,
                level: root_level,
            }),
            read_only: AtomicBool::new(false),
            in_gc: AtomicBool::new(false),
        };

        let max_id = {
            let session = fs.open_read();
            crate::btree::search(&session, root_address, root_level, &crate::btree::AllEntries)?
                .into_iter()
                .map(|(k, _)| k.id)
                .max()
        };
        fs.next_id.store(max_id.map_or(1, |m| m + 1), Ordering::SeqCst);

        info!(
            "filesystem: mounted, root={} level={} next_id={}",
            root_address,
            root_level,
            fs.next_id.load(Ordering::SeqCst)
        );
        Ok(fs)
    }

    pub fn open_read(&self) -> Session<'_> {
        Session {
            fs: self,
            read_guard: Some(self.root_lock.rl()),
            write_guard: None,
            queues: None,
        }
    }

    /// Opens a read-write session. Upgrade from a read session is not
    /// lock-free — the exclusive guard is taken directly rather than
    /// modeling a true read-then-upgrade handshake.
    pub fn open_write(&self) -> FsResult<Session<'_>> {
        if self.is_read_only() {
            return Err(FsError::ReadOnlyFs);
        }
        Ok(Session {
            fs: self,
            read_guard: None,
            write_guard: Some(self.root_lock.wl()),
            queues: Some(Queues::default()),
        })
    }

    pub(crate) fn run_gc_if_needed(&self) -> FsResult<()> {
        if self.in_gc.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.allocator.gc_needed(&self.config) {
            return Ok(());
        }
        self.in_gc.store(true, Ordering::SeqCst);
        let result = crate::gc::run_once(self);
        self.in_gc.store(false, Ordering::SeqCst);
        if result.is_err() {
            self.mark_read_only();
        }
        result
    }
}

#[derive(Default)]
struct Queues {
    garbage: Vec<Address>,
    newish: Vec<Address>,
    pending_root: bool,
}

/// A transaction. Read-only sessions hold the root lock in shared mode;
/// read-write sessions hold it exclusively and additionally track the
/// `garbage`/`newish` queues, described below.
pub struct Session<'fs> {
    fs: &'fs Filesystem,
    read_guard: Option<RwLockReadGuard<'fs, ()>>,
    write_guard: Option<RwLockWriteGuard<'fs, ()>>,
    queues: Option<Queues>,
}

impl<'fs> Session<'fs> {
    pub fn fs(&self) -> &'fs Filesystem {
        self.fs
    }

    pub fn is_write(&self) -> bool {
        self.queues.is_some()
    }

    fn with_device<R>(&self, f: impl FnOnce(&mut dyn FlashDevice) -> R) -> R {
        let mut guard = self.fs.device.lock().unwrap();
        f(&mut **guard)
    }

    /// `read(addr)`.
    pub fn read(&self, addr: Address) -> FsResult<BufferHandle> {
        self.with_device(|device| self.fs.buffer_pool.find(addr, &self.fs.config, device))
    }

    /// `release(buffer)`: always a Clean release.
    pub fn release(&self, handle: BufferHandle) -> FsResult<()> {
        self.with_device(|device| {
            self.fs
                .buffer_pool
                .release(handle, ReleaseMode::Clean, &self.fs.config, device, &self.fs.allocator)
        })?;
        Ok(())
    }

    /// `empty(level)`: a fresh, writable, unaddressed buffer tagged with
    /// `level`. Metadata pages start life stamped with sequence 0 (not a
    /// root) so an un-flagged write is distinguishable from an unwritten
    /// page at mount-scan time; blob pages start with a placeholder tail
    /// the caller is expected to overwrite before `write`.
    pub fn empty(&self, level: Level) -> FsResult<BufferHandle> {
        let handle = self.read(Address::INVALID)?;
        {
            let mut page = self.fs.buffer_pool.page_mut(handle);
            page.set_level(level);
            if level.is_metadata() {
                page.set_tail(Tail::Metadata { sequence: 0 });
            } else {
                page.set_tail(Tail::Blob {
                    file_id: 0,
                    parent_id: 0,
                });
            }
        }
        Ok(handle)
    }

    /// Marks the next `write` as the operation that produces a new
    /// metadata root: its tail will be stamped with the filesystem's
    /// ever-increasing sequence counter.
    pub fn flag_next_as_root(&mut self) -> FsResult<()> {
        let queues = self.queues.as_mut().ok_or(FsError::ReadOnlyFs)?;
        queues.pending_root = true;
        Ok(())
    }

    /// `write(buffer) -> addr`.
    pub fn write(&mut self, handle: BufferHandle) -> FsResult<Address> {
        if self.queues.is_none() {
            return Err(FsError::ReadOnlyFs);
        }

        let is_root = self.queues.as_ref().unwrap().pending_root;
        if is_root {
            let seq = self.fs.next_sequence();
            self.fs
                .buffer_pool
                .page_mut(handle)
                .set_tail(Tail::Metadata { sequence: seq });
        }

        let outcome = self.with_device(|device| {
            self.fs.buffer_pool.release(
                handle,
                ReleaseMode::Dirty,
                &self.fs.config,
                device,
                &self.fs.allocator,
            )
        })?;

        let queues = self.queues.as_mut().unwrap();
        if is_root {
            queues.pending_root = false;
        }
        if let Some(shadow) = outcome.shadowed {
            queues.garbage.push(shadow);
        }
        let addr = outcome.address.expect("dirty release always yields an address");
        queues.newish.push(addr);
        debug!("session: wrote {} (root={})", addr, is_root);
        Ok(addr)
    }

    /// `dispose_buffered(buffer)`: the buffer must be unmodified since
    /// read; its address (if any) is queued for reclamation and the slot
    /// is purged.
    pub fn dispose_buffered(&mut self, handle: BufferHandle) -> FsResult<()> {
        let queues = self.queues.as_mut().ok_or(FsError::ReadOnlyFs)?;
        let outcome = self.with_device(|device| {
            self.fs.buffer_pool.release(
                handle,
                ReleaseMode::Purge,
                &self.fs.config,
                device,
                &self.fs.allocator,
            )
        })?;
        if let Some(addr) = outcome.shadowed {
            queues.garbage.push(addr);
        }
        Ok(())
    }

    /// `dispose_address(addr)`: the caller already knows this address is
    /// live (it didn't come through a buffer read in this transaction).
    /// Queues it for reclamation AND reclaims it immediately so a
    /// concurrent `gc_needed()` check already sees the freed space; a
    /// rollback undoes the reclaim via `claim`. This asymmetry is
    /// intentional.
    pub fn dispose_address(&mut self, addr: Address) -> FsResult<()> {
        let queues = self.queues.as_mut().ok_or(FsError::ReadOnlyFs)?;
        queues.garbage.push(addr);
        self.fs.allocator.reclaim(addr, &self.fs.config);
        Ok(())
    }

    /// `commit()`: clear the queues and run the deferred GC check. The
    /// caller is responsible for having already replaced the in-memory
    /// root pointer (via `Filesystem::set_root`) with the address
    /// produced by the root-flagged write, before calling `commit` —
    /// that's what makes the transaction atomic w.r.t. readers.
    pub fn commit(mut self) -> FsResult<()> {
        let queues = self.queues.take().ok_or(FsError::ReadOnlyFs)?;
        debug!(
            "session: commit, {} garbage, {} newish",
            queues.garbage.len(),
            queues.newish.len()
        );
        drop(queues);
        self.write_guard.take();
        self.fs.run_gc_if_needed()
    }

    /// `rollback()`: undo every reclaim queued in `garbage` and free
    /// every address produced in `newish`, then run the deferred GC
    /// check.
    pub fn rollback(mut self) -> FsResult<()> {
        let queues = self.queues.take().ok_or(FsError::ReadOnlyFs)?;
        info!(
            "session: rollback, {} garbage, {} newish",
            queues.garbage.len(),
            queues.newish.len()
        );
        for addr in &queues.garbage {
            self.fs.allocator.claim(*addr, &self.fs.config);
        }
        for addr in &queues.newish {
            self.fs.allocator.reclaim(*addr, &self.fs.config);
        }
        self.write_guard.take();
        self.fs.run_gc_if_needed()
    }
}
