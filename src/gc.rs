//! The garbage collector: when the allocator reports too few spare
//! blocks (`BlockAllocator::gc_needed`), reclaim the least-live candidate
//! block by relocating every page still reachable from it to a fresh
//! address, then let the allocator's own reclaim bookkeeping (driven by
//! `Session::dispose_address` inside the relocate calls) bring the
//! block's live count to zero.
//!
//! There is no reverse page index, so "is this address still live" is
//! answered the same way a reader would answer it: by walking the
//! reachable structure from the root. `AllEntries` exists
//! precisely so this walk can enumerate every file's blob tree without a
//! second index.

use log::{info, warn};

use crate::blob_tree;
use crate::btree::{self, AllEntries};
use crate::error::FsResult;
use crate::session::{Filesystem, RootPointer};
use crate::types::Address;

/// Runs exactly one reclamation pass over the single least-live
/// candidate block, as its own write transaction. Called by
/// `Filesystem::run_gc_if_needed` after every commit/rollback while
/// `spare_count` stays at or below `max_levels()`; a filesystem under
/// sustained write pressure may call this several times in a row across
/// commits before spare capacity recovers.
pub fn run_once(fs: &Filesystem) -> FsResult<()> {
    let candidates = fs.allocator.gc_candidates(&fs.config);
    let block = match candidates.first() {
        Some(&b) => b,
        None => {
            warn!("gc: spare_count low but no reclaimable block found");
            return Ok(());
        }
    };

    info!(
        "gc: reclaiming block {} (live={}, spare={})",
        block,
        fs.allocator.live(block),
        fs.allocator.spare_count()
    );

    let mut session = fs.open_write()?;
    let root = fs.root();
    let mut meta_root = root.address;
    let mut meta_level = root.level;

    let files = btree::search(&session, meta_root, meta_level, &AllEntries)?;

    for offset in 0..fs.config.block_size {
        let addr = fs.config.address_of(block, offset);

        if let Some((new_root, new_level)) =
            btree::relocate_page(&mut session, meta_root, meta_level, addr)?
        {
            meta_root = new_root;
            meta_level = new_level;
            continue;
        }

        relocate_in_some_file(&mut session, &files, addr, &mut meta_root, &mut meta_level)?;
    }

    fs.set_root(RootPointer {
        address: meta_root,
        level: meta_level,
    });
    session.commit()
}

fn relocate_in_some_file(
    session: &mut crate::session::Session,
    files: &[(btree::MetaKey, btree::MetaValue)],
    addr: Address,
    meta_root: &mut Address,
    meta_level: &mut crate::types::Level,
) -> FsResult<()> {
    for (key, value) in files {
        if value.is_directory() {
            continue;
        }
        if let Some(new_value) = blob_tree::relocate(session, value, addr)? {
            let (new_root, new_level) = btree::put(session, *meta_root, *meta_level, key, new_value)?;
            *meta_root = new_root;
            *meta_level = new_level;
            return Ok(());
        }
    }
    Ok(())
}
