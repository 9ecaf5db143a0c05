//! C4 — the log-structured blob tree: one per-file indexed page array.
//! Content lives in fixed-size data pages at level
//! `BLOB_DATA`; once a file outgrows `blob_fanout()` pages, an index
//! level of the same fan-out is grown on top, one level at a time.
//! Every index/data page is stamped with its owning file's id pair so
//! GC can find the owner without a separate reverse index.
//!
//! Adapted from the metadata tree's COW rewrite-path-to-root shape,
//! swapping key-driven descent for fixed-arity digit addressing.

use crate::error::{FsError, FsResult};
use crate::page::Tail;
use crate::session::Session;
use crate::types::{Address, Level};
use crate::util::{digit_at, digits_needed};

/// How many pages a file of `size` bytes spans.
fn page_count(size: u64, payload: usize) -> u64 {
    if size == 0 {
        0
    } else {
        (size + payload as u64 - 1) / payload as u64
    }
}

/// How many index levels sit above the data pages for a file with this
/// many pages (`0` = the root is itself a data page, or the file is
/// empty).
fn index_levels(pages: u64, b: usize) -> u32 {
    if pages <= 1 {
        0
    } else {
        digits_needed(pages - 1, b as u64)
    }
}

fn root_level(levels: u32) -> Level {
    if levels == 0 {
        Level::BLOB_DATA
    } else {
        Level::blob_index(levels as i32)
    }
}

fn decode_index(payload: &[u8], b: usize) -> Vec<Address> {
    (0..b)
        .map(|i| {
            let off = i * 8;
            Address(u64::from_le_bytes(payload[off..off + 8].try_into().unwrap()))
        })
        .collect()
}

fn encode_index(payload: &mut [u8], children: &[Address]) {
    for (i, addr) in children.iter().enumerate() {
        let off = i * 8;
        payload[off..off + 8].copy_from_slice(&addr.0.to_le_bytes());
    }
}

/// `read(meta, offset, buf) -> n`: fills `buf` from file content starting
/// at `offset`, capped at `size - offset` (reads past EOF return fewer
/// bytes than requested, never an error — the "reading-aware" contract
/// the stream layer relies on).
pub fn read(session: &Session, meta: &crate::btree::MetaValue, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
    if offset >= meta.size as u64 {
        return Ok(0);
    }
    let payload = session.fs().config().payload_size();
    let b = session.fs().config().blob_fanout();
    let want = buf.len().min((meta.size as u64 - offset) as usize);
    let levels = index_levels(page_count(meta.size as u64, payload), b);
    let root = meta.blob_root;

    let mut read_total = 0usize;
    while read_total < want {
        let pos = offset + read_total as u64;
        let page_idx = pos / payload as u64;
        let page_off = (pos % payload as u64) as usize;
        let take = (payload - page_off).min(want - read_total);

        match locate(session, root, root_level(levels), page_idx, b)? {
            Some(addr) => {
                let handle = session.read(addr)?;
                {
                    let page = session.fs().buffer_pool.page(handle);
                    buf[read_total..read_total + take]
                        .copy_from_slice(&page.payload()[page_off..page_off + take]);
                }
                session.release(handle)?;
            }
            None => {
                // Sparse hole: never written, logically zero.
                for b in &mut buf[read_total..read_total + take] {
                    *b = 0;
                }
            }
        }
        read_total += take;
    }
    Ok(read_total)
}

fn locate(
    session: &Session,
    root: Address,
    mut level: Level,
    page_idx: u64,
    b: usize,
) -> FsResult<Option<Address>> {
    if !root.is_valid() {
        return Ok(None);
    }
    let mut addr = root;
    loop {
        if level == Level::BLOB_DATA {
            return Ok(Some(addr));
        }
        let depth_above = -level.0 - 1;
        let handle = session.read(addr)?;
        let children = {
            let page = session.fs().buffer_pool.page(handle);
            decode_index(page.payload(), b)
        };
        session.release(handle)?;

        let digit = digit_at(page_idx, b as u64, (depth_above - 1) as u32) as usize;
        let child = children[digit];
        if !child.is_valid() {
            return Ok(None);
        }
        level = if depth_above - 1 == 0 {
            Level::BLOB_DATA
        } else {
            Level::blob_index(depth_above - 1)
        };
        addr = child;
    }
}

/// `update(meta, offset, data, file_id, parent_id) -> new_meta`: writes
/// `data` at `offset`, extending `size` as needed. Growing the tree by
/// more than one index level in a single call is rejected
/// (`InvalidSeek`) — callers that extend a file far past its current
/// capacity are expected to do so incrementally, one fanout level at a
/// time, the way sequential appends naturally do.
pub fn update(
    session: &mut Session,
    meta: crate::btree::MetaValue,
    offset: u64,
    data: &[u8],
    file_id: u32,
    parent_id: u32,
) -> FsResult<crate::btree::MetaValue> {
    if data.is_empty() {
        return Ok(meta);
    }
    let payload = session.fs().config().payload_size();
    let b = session.fs().config().blob_fanout();

    let new_size = (offset + data.len() as u64).max(meta.size as u64);

    let old_levels = index_levels(page_count(meta.size as u64, payload), b);
    let new_levels = index_levels(page_count(new_size, payload), b);
    if new_levels > old_levels + 1 {
        return Err(FsError::InvalidSeek);
    }

    let (mut root, mut level) = grow(session, meta.blob_root, old_levels, new_levels, b)?;

    let mut written = 0usize;
    while written < data.len() {
        let pos = offset + written as u64;
        let page_idx = pos / payload as u64;
        let page_off = (pos % payload as u64) as usize;
        let take = (payload - page_off).min(data.len() - written);
        let chunk = &data[written..written + take];

        let new_root = write_one_page(
            session, root, level, page_idx, page_off, chunk, payload, b, file_id, parent_id,
        )?;
        root = new_root;
        written += take;
    }

    let _ = level;
    Ok(crate::btree::MetaValue {
        blob_root: root,
        size: new_size as u32,
    })
}

/// Wraps the current root under one more index level, if `new_levels`
/// calls for it; otherwise returns the root unchanged.
fn grow(
    session: &mut Session,
    root: Address,
    old_levels: u32,
    new_levels: u32,
    b: usize,
) -> FsResult<(Address, Level)> {
    if new_levels == old_levels {
        return Ok((root, root_level(old_levels)));
    }
    debug_assert_eq!(new_levels, old_levels + 1);

    if new_levels == 0 {
        // Can't happen: growth only increases levels.
        return Ok((root, Level::BLOB_DATA));
    }

    let mut children = vec![Address::INVALID; b];
    if root.is_valid() {
        children[0] = root;
    }
    let new_level = root_level(new_levels);
    let handle = session.empty(new_level)?;
    {
        let mut page = session.fs().buffer_pool.page_mut(handle);
        encode_index(page.payload_mut(), &children);
    }
    let new_root = session.write(handle)?;
    Ok((new_root, new_level))
}

fn write_one_page(
    session: &mut Session,
    addr: Address,
    level: Level,
    page_idx: u64,
    page_off: usize,
    chunk: &[u8],
    payload: usize,
    b: usize,
    file_id: u32,
    parent_id: u32,
) -> FsResult<Address> {
    if level == Level::BLOB_DATA {
        let mut buf = if addr.is_valid() {
            let handle = session.read(addr)?;
            let bytes = {
                let page = session.fs().buffer_pool.page(handle);
                page.payload().to_vec()
            };
            session.release(handle)?;
            bytes
        } else {
            vec![0u8; payload]
        };
        buf[page_off..page_off + chunk.len()].copy_from_slice(chunk);

        let new_handle = session.empty(Level::BLOB_DATA)?;
        {
            let mut page = session.fs().buffer_pool.page_mut(new_handle);
            page.payload_mut().copy_from_slice(&buf);
            page.set_tail(Tail::Blob { file_id, parent_id });
        }
        let new_addr = session.write(new_handle)?;
        if addr.is_valid() {
            session.dispose_address(addr)?;
        }
        return Ok(new_addr);
    }

    let depth_above = -level.0 - 1;
    let mut children = if addr.is_valid() {
        let handle = session.read(addr)?;
        let decoded = {
            let page = session.fs().buffer_pool.page(handle);
            decode_index(page.payload(), b)
        };
        session.release(handle)?;
        decoded
    } else {
        vec![Address::INVALID; b]
    };

    let digit = digit_at(page_idx, b as u64, (depth_above - 1) as u32) as usize;
    let child_level = if depth_above - 1 == 0 {
        Level::BLOB_DATA
    } else {
        Level::blob_index(depth_above - 1)
    };
    let new_child = write_one_page(
        session,
        children[digit],
        child_level,
        page_idx,
        page_off,
        chunk,
        payload,
        b,
        file_id,
        parent_id,
    )?;
    children[digit] = new_child;

    let new_handle = session.empty(level)?;
    {
        let mut page = session.fs().buffer_pool.page_mut(new_handle);
        encode_index(page.payload_mut(), &children);
        page.set_tail(Tail::Blob { file_id, parent_id });
    }
    let new_addr = session.write(new_handle)?;
    if addr.is_valid() {
        session.dispose_address(addr)?;
    }
    Ok(new_addr)
}

/// `dispose(meta)`: frees every page belonging to the file, leaves
/// first.
pub fn dispose(session: &mut Session, meta: &crate::btree::MetaValue) -> FsResult<()> {
    if !meta.blob_root.is_valid() {
        return Ok(());
    }
    let payload = session.fs().config().payload_size();
    let b = session.fs().config().blob_fanout();
    let levels = index_levels(page_count(meta.size as u64, payload), b);
    dispose_rec(session, meta.blob_root, root_level(levels), b)
}

fn dispose_rec(session: &mut Session, addr: Address, level: Level, b: usize) -> FsResult<()> {
    if !addr.is_valid() {
        return Ok(());
    }
    if level == Level::BLOB_DATA {
        return session.dispose_address(addr);
    }
    let handle = session.read(addr)?;
    let children = {
        let page = session.fs().buffer_pool.page(handle);
        decode_index(page.payload(), b)
    };
    session.release(handle)?;

    let depth_above = -level.0 - 1;
    let child_level = if depth_above - 1 == 0 {
        Level::BLOB_DATA
    } else {
        Level::blob_index(depth_above - 1)
    };
    for &child in &children {
        dispose_rec(session, child, child_level, b)?;
    }
    session.dispose_address(addr)
}

/// Rewrites a single page at `target` to a fresh address, wherever it
/// sits in this file's content tree, propagating the change up to the
/// file's root. Returns `None` if `target` isn't part of this file.
pub fn relocate(
    session: &mut Session,
    meta: &crate::btree::MetaValue,
    target: Address,
) -> FsResult<Option<crate::btree::MetaValue>> {
    if !meta.blob_root.is_valid() {
        return Ok(None);
    }
    let payload = session.fs().config().payload_size();
    let b = session.fs().config().blob_fanout();
    let levels = index_levels(page_count(meta.size as u64, payload), b);

    match relocate_rec(session, meta.blob_root, root_level(levels), target, b)? {
        Some(new_root) => Ok(Some(crate::btree::MetaValue {
            blob_root: new_root,
            size: meta.size,
        })),
        None => Ok(None),
    }
}

fn relocate_rec(
    session: &mut Session,
    addr: Address,
    level: Level,
    target: Address,
    b: usize,
) -> FsResult<Option<Address>> {
    if addr == target {
        let handle = session.read(addr)?;
        let (tail, payload) = {
            let page = session.fs().buffer_pool.page(handle);
            (page.tail(), page.payload().to_vec())
        };
        session.dispose_buffered(handle)?;

        let new_handle = session.empty(level)?;
        {
            let mut page = session.fs().buffer_pool.page_mut(new_handle);
            page.payload_mut().copy_from_slice(&payload);
            page.set_tail(tail);
        }
        return Ok(Some(session.write(new_handle)?));
    }
    if level == Level::BLOB_DATA {
        return Ok(None);
    }

    let handle = session.read(addr)?;
    let (mut children, tail) = {
        let page = session.fs().buffer_pool.page(handle);
        (decode_index(page.payload(), b), page.tail())
    };
    session.release(handle)?;

    let depth_above = -level.0 - 1;
    let child_level = if depth_above - 1 == 0 {
        Level::BLOB_DATA
    } else {
        Level::blob_index(depth_above - 1)
    };

    for i in 0..children.len() {
        if let Some(new_child) = relocate_rec(session, children[i], child_level, target, b)? {
            children[i] = new_child;
            let new_handle = session.empty(level)?;
            {
                let mut page = session.fs().buffer_pool.page_mut(new_handle);
                encode_index(page.payload_mut(), &children);
                page.set_tail(tail);
            }
            let new_addr = session.write(new_handle)?;
            session.dispose_address(addr)?;
            return Ok(Some(new_addr));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::MetaValue;
    use crate::config::FsConfig;
    use crate::device::MemoryDevice;
    use crate::session::Filesystem;

    fn cfg() -> FsConfig {
        FsConfig::new(64, 8, 40, 6, 4, 4, 32).unwrap()
    }

    fn fresh() -> Filesystem {
        let config = cfg();
        let device = MemoryDevice::new(config.clone());
        Filesystem::purge(config, Box::new(device)).unwrap()
    }

    #[test]
    fn write_then_read_small_file() {
        let fs = fresh();
        let mut session = fs.open_write().unwrap();
        let meta = MetaValue { blob_root: Address::INVALID, size: 0 };
        let meta = update(&mut session, meta, 0, b"hello world", 1, 0).unwrap();
        assert_eq!(meta.size as usize, b"hello world".len());

        let mut buf = vec![0u8; 11];
        let n = read(&session, &meta, 0, &mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn write_spanning_many_pages_grows_index() {
        let fs = fresh();
        let mut session = fs.open_write().unwrap();
        let payload = cfg().payload_size();
        let b = cfg().blob_fanout();

        let mut meta = MetaValue { blob_root: Address::INVALID, size: 0 };
        // Fill page-by-page so no single update() jumps more than one
        // index level, matching the incremental-growth contract.
        let total_pages = b + 2;
        for p in 0..total_pages {
            let chunk = vec![(p % 251) as u8; payload];
            meta = update(&mut session, meta, (p * payload) as u64, &chunk, 7, 0).unwrap();
        }

        let mut buf = vec![0u8; payload];
        read(&session, &meta, ((total_pages - 1) * payload) as u64, &mut buf).unwrap();
        assert_eq!(buf[0], ((total_pages - 1) % 251) as u8);
    }

    #[test]
    fn dispose_frees_every_page() {
        let fs = fresh();
        let mut session = fs.open_write().unwrap();
        let meta = MetaValue { blob_root: Address::INVALID, size: 0 };
        let meta = update(&mut session, meta, 0, b"payload bytes", 3, 0).unwrap();
        let before = session.fs().allocator.spare_count();
        dispose(&mut session, &meta).unwrap();
        assert!(session.fs().allocator.spare_count() >= before);
    }
}
