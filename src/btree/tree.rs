//! The copy-on-write B+tree itself: `get`/`put`/`remove` plus the
//! whole-subtree walks `purge` and `relocate_page` that GC and unlink
//! rely on. Every mutation rewrites the COW path from the touched leaf
//! up to the root and returns the new root address/level; nothing here
//! mutates a page already on the device in place.
//!
//! The insert/split/delete machinery generalizes the usual single-fixed-
//! key-type B+tree to the `IndexBound`-parameterized descent the
//! namespace layer needs.

use std::cmp::Ordering;

use crate::btree::key::{IndexBound, IndexKey, MetaKey, MetaValue};
use crate::btree::node::{internal_capacity, leaf_capacity, split_point, Internal, Leaf};
use crate::error::FsResult;
use crate::session::Session;
use crate::types::{Address, Level};

fn min_leaf(capacity: usize) -> usize {
    capacity / 2
}

fn min_branches(capacity: usize) -> usize {
    (capacity / 2).max(2)
}

fn write_leaf(session: &mut Session, leaf: &Leaf, is_root: bool) -> FsResult<Address> {
    let handle = session.empty(Level::META_LEAF)?;
    {
        let config = session.fs().config().clone();
        let mut page = session.fs().buffer_pool.page_mut(handle);
        leaf.encode(&mut page, &config)?;
    }
    if is_root {
        session.flag_next_as_root()?;
    }
    session.write(handle)
}

fn write_internal(
    session: &mut Session,
    level: Level,
    node: &Internal,
    is_root: bool,
) -> FsResult<Address> {
    let handle = session.empty(level)?;
    {
        let config = session.fs().config().clone();
        let mut page = session.fs().buffer_pool.page_mut(handle);
        node.encode(&mut page, &config)?;
    }
    if is_root {
        session.flag_next_as_root()?;
    }
    session.write(handle)
}

fn read_leaf(session: &Session, addr: Address) -> FsResult<Leaf> {
    let handle = session.read(addr)?;
    let leaf = {
        let page = session.fs().buffer_pool.page(handle);
        Leaf::decode(&page, session.fs().config())
    };
    session.release(handle)?;
    Ok(leaf)
}

fn read_internal(session: &Session, addr: Address) -> FsResult<Internal> {
    let handle = session.read(addr)?;
    let node = {
        let page = session.fs().buffer_pool.page(handle);
        Internal::decode(&page, session.fs().config())
    };
    session.release(handle)?;
    Ok(node)
}

/// Conservative child-overlap test used by range/prefix scans: can
/// `bound` possibly match an index key living in child `i`'s range,
/// given the separators on either side? Assumes `B` is monotonic in
/// index-key order, per `IndexBound`'s contract.
fn child_may_match<B: IndexBound>(node: &Internal, bound: &B, i: usize) -> bool {
    if i > 0 && bound.locate(&node.keys[i - 1]) == Ordering::Less {
        return false;
    }
    if i < node.keys.len() && bound.locate(&node.keys[i]) == Ordering::Greater {
        return false;
    }
    true
}

/// `get(key) -> Option<(stored_key, value)>`: exact full-key lookup.
/// The returned key is the one actually stored (carrying its real `id`,
/// since a caller's search key may use a placeholder).
pub fn get(
    session: &Session,
    root: Address,
    root_level: Level,
    key: &MetaKey,
) -> FsResult<Option<(MetaKey, MetaValue)>> {
    if !root.is_valid() {
        return Ok(None);
    }
    let mut addr = root;
    let mut level = root_level;
    loop {
        if level == Level::META_LEAF {
            let leaf = read_leaf(session, addr)?;
            let pos = leaf.lower_bound(key);
            return Ok(leaf
                .entries
                .into_iter()
                .nth(pos)
                .filter(|(k, _)| k == key));
        }
        let node = read_internal(session, addr)?;
        let target = key.index_key();
        let i = node.child_for(|idx| target.locate(idx));
        addr = node.children[i];
        level = Level::meta(level.0 - 1);
    }
}

/// `search(bound) -> entries`: collects every entry whose index key
/// satisfies `bound`, in ascending key order.
pub fn search<B: IndexBound>(
    session: &Session,
    root: Address,
    root_level: Level,
    bound: &B,
) -> FsResult<Vec<(MetaKey, MetaValue)>> {
    let mut out = Vec::new();
    if root.is_valid() {
        collect(session, root, root_level, bound, &mut out)?;
    }
    Ok(out)
}

fn collect<B: IndexBound>(
    session: &Session,
    addr: Address,
    level: Level,
    bound: &B,
    out: &mut Vec<(MetaKey, MetaValue)>,
) -> FsResult<()> {
    if level == Level::META_LEAF {
        let leaf = read_leaf(session, addr)?;
        for (k, v) in leaf.entries {
            if bound.locate(&k.index_key()) == Ordering::Equal {
                out.push((k, v));
            }
        }
        return Ok(());
    }
    let node = read_internal(session, addr)?;
    for i in 0..node.children.len() {
        if child_may_match(&node, bound, i) {
            collect(session, node.children[i], Level::meta(level.0 - 1), bound, out)?;
        }
    }
    Ok(())
}

enum InsertResult {
    Updated(Address),
    Split(Address, IndexKey, Address),
}

/// `put(key, value) -> (new_root, new_level)`: insert-or-update.
pub fn put(
    session: &mut Session,
    root: Address,
    root_level: Level,
    key: &MetaKey,
    value: MetaValue,
) -> FsResult<(Address, Level)> {
    if !root.is_valid() {
        let mut leaf = Leaf::empty(session.fs().config());
        leaf.entries.push((key.clone(), value));
        let addr = write_leaf(session, &leaf, true)?;
        return Ok((addr, Level::META_LEAF));
    }

    match insert_rec(session, root, root_level, key, value, true)? {
        InsertResult::Updated(addr) => Ok((addr, root_level)),
        InsertResult::Split(left, sep, right) => {
            let new_level = Level::meta(root_level.0 + 1);
            let node = Internal::new(session.fs().config(), left, sep, right);
            let addr = write_internal(session, new_level, &node, true)?;
            Ok((addr, new_level))
        }
    }
}

fn insert_rec(
    session: &mut Session,
    addr: Address,
    level: Level,
    key: &MetaKey,
    value: MetaValue,
    is_root: bool,
) -> FsResult<InsertResult> {
    if level == Level::META_LEAF {
        let mut leaf = read_leaf(session, addr)?;
        let pos = leaf.lower_bound(key);
        match leaf.entries.get(pos) {
            Some((k, _)) if k == key => leaf.entries[pos] = (key.clone(), value),
            _ => leaf.entries.insert(pos, (key.clone(), value)),
        }

        let capacity = leaf_capacity(session.fs().config());
        if leaf.entries.len() <= capacity {
            let new_addr = write_leaf(session, &leaf, is_root)?;
            dispose_old(session, addr)?;
            return Ok(InsertResult::Updated(new_addr));
        }

        let s = split_point(capacity);
        let right_entries = leaf.entries.split_off(s);
        let separator = right_entries[0].0.index_key();
        let left = Leaf {
            entries: leaf.entries,
            capacity,
        };
        let right = Leaf {
            entries: right_entries,
            capacity,
        };
        let left_addr = write_leaf(session, &left, false)?;
        let right_addr = write_leaf(session, &right, false)?;
        dispose_old(session, addr)?;
        return Ok(InsertResult::Split(left_addr, separator, right_addr));
    }

    let mut node = read_internal(session, addr)?;
    let target = key.index_key();
    let i = node.child_for(|idx| target.locate(idx));
    let child_level = Level::meta(level.0 - 1);

    match insert_rec(session, node.children[i], child_level, key, value, false)? {
        InsertResult::Updated(new_child) => {
            node.children[i] = new_child;
            let capacity = internal_capacity(session.fs().config());
            debug_assert!(node.num_branches() <= capacity);
            let new_addr = write_internal(session, level, &node, is_root)?;
            dispose_old(session, addr)?;
            Ok(InsertResult::Updated(new_addr))
        }
        InsertResult::Split(left, sep, right) => {
            node.children[i] = left;
            node.keys.insert(i, sep);
            node.children.insert(i + 1, right);

            let capacity = internal_capacity(session.fs().config());
            if node.num_branches() <= capacity {
                let new_addr = write_internal(session, level, &node, is_root)?;
                dispose_old(session, addr)?;
                return Ok(InsertResult::Updated(new_addr));
            }

            let s = split_point(capacity);
            let right_children = node.children.split_off(s);
            let mut right_keys = node.keys.split_off(s);
            let separator = right_keys.remove(0);
            let left_node = Internal {
                keys: node.keys,
                children: node.children,
                capacity,
            };
            let right_node = Internal {
                keys: right_keys,
                children: right_children,
                capacity,
            };
            let left_addr = write_internal(session, level, &left_node, false)?;
            let right_addr = write_internal(session, level, &right_node, false)?;
            dispose_old(session, addr)?;
            Ok(InsertResult::Split(left_addr, separator, right_addr))
        }
    }
}

fn dispose_old(session: &mut Session, addr: Address) -> FsResult<()> {
    session.dispose_address(addr)
}

enum RemoveResult {
    NotFound,
    Updated(Address),
    Underflow(Address),
}

/// `remove(key) -> (new_root, new_level)`, or `Ok(None)` if the key was
/// absent. Root collapse (an internal root left with one child) shrinks
/// `new_level` by one; an emptied leaf root stays as an empty leaf.
pub fn remove(
    session: &mut Session,
    root: Address,
    root_level: Level,
    key: &MetaKey,
) -> FsResult<Option<(Address, Level)>> {
    if !root.is_valid() {
        return Ok(None);
    }

    let result = remove_rec(session, root, root_level, key, true)?;
    let (mut addr, mut level) = match result {
        RemoveResult::NotFound => return Ok(None),
        RemoveResult::Updated(a) | RemoveResult::Underflow(a) => (a, root_level),
    };

    // Collapse internal roots left with a single child.
    while level != Level::META_LEAF {
        let node = read_internal(session, addr)?;
        if node.num_branches() != 1 {
            break;
        }
        let child = node.children[0];
        dispose_old(session, addr)?;
        addr = child;
        level = Level::meta(level.0 - 1);
    }

    Ok(Some((addr, level)))
}

fn remove_rec(
    session: &mut Session,
    addr: Address,
    level: Level,
    key: &MetaKey,
    is_root: bool,
) -> FsResult<RemoveResult> {
    if level == Level::META_LEAF {
        let mut leaf = read_leaf(session, addr)?;
        let pos = leaf.lower_bound(key);
        match leaf.entries.get(pos) {
            Some((k, _)) if k == key => {
                leaf.entries.remove(pos);
            }
            _ => return Ok(RemoveResult::NotFound),
        }

        let capacity = leaf_capacity(session.fs().config());
        let new_addr = write_leaf(session, &leaf, is_root)?;
        dispose_old(session, addr)?;
        if !is_root && leaf.entries.len() < min_leaf(capacity) {
            return Ok(RemoveResult::Underflow(new_addr));
        }
        return Ok(RemoveResult::Updated(new_addr));
    }

    let mut node = read_internal(session, addr)?;
    let target = key.index_key();
    let i = node.child_for(|idx| target.locate(idx));
    let child_level = Level::meta(level.0 - 1);

    match remove_rec(session, node.children[i], child_level, key, false)? {
        RemoveResult::NotFound => Ok(RemoveResult::NotFound),
        RemoveResult::Updated(new_child) => {
            node.children[i] = new_child;
            let new_addr = write_internal(session, level, &node, is_root)?;
            dispose_old(session, addr)?;
            Ok(RemoveResult::Updated(new_addr))
        }
        RemoveResult::Underflow(new_child) => {
            node.children[i] = new_child;
            rebalance(session, addr, level, node, i, is_root)
        }
    }
}

/// Fix an underflowing child `i` of `node` by redistributing from a
/// sibling with surplus, or merging with one otherwise. Mirrors the
/// four shapes: merge-down/merge-up
/// (absorb into a neighbor) and redistribute-from-greater/-from-smaller
/// (borrow one entry across the separator).
fn rebalance(
    session: &mut Session,
    addr: Address,
    level: Level,
    mut node: Internal,
    i: usize,
    is_root: bool,
) -> FsResult<RemoveResult> {
    let child_level = Level::meta(level.0 - 1);

    if child_level == Level::META_LEAF {
        let mut child = read_leaf(session, node.children[i])?;
        let capacity = leaf_capacity(session.fs().config());
        let min = min_leaf(capacity);

        if i > 0 {
            let mut left = read_leaf(session, node.children[i - 1])?;
            if left.entries.len() > min {
                let borrowed = left.entries.pop().unwrap();
                child.entries.insert(0, borrowed);
                node.keys[i - 1] = child.entries[0].0.index_key();
                let left_addr = write_leaf(session, &left, false)?;
                let child_addr = write_leaf(session, &child, false)?;
                dispose_old(session, node.children[i - 1])?;
                dispose_old(session, node.children[i])?;
                node.children[i - 1] = left_addr;
                node.children[i] = child_addr;
                return finish_internal(session, addr, level, node, is_root);
            }
            // merge-down: absorb child into left sibling.
            left.entries.extend(child.entries);
            let merged_addr = write_leaf(session, &left, false)?;
            dispose_old(session, node.children[i - 1])?;
            dispose_old(session, node.children[i])?;
            node.children.remove(i);
            node.children[i - 1] = merged_addr;
            node.keys.remove(i - 1);
            return finish_internal_after_shrink(session, addr, level, node, is_root);
        }

        if i + 1 < node.children.len() {
            let mut right = read_leaf(session, node.children[i + 1])?;
            if right.entries.len() > min {
                let borrowed = right.entries.remove(0);
                child.entries.push(borrowed);
                node.keys[i] = right.entries[0].0.index_key();
                let right_addr = write_leaf(session, &right, false)?;
                let child_addr = write_leaf(session, &child, false)?;
                dispose_old(session, node.children[i + 1])?;
                dispose_old(session, node.children[i])?;
                node.children[i + 1] = right_addr;
                node.children[i] = child_addr;
                return finish_internal(session, addr, level, node, is_root);
            }
            // merge-up: absorb right sibling into child.
            child.entries.extend(right.entries);
            let merged_addr = write_leaf(session, &child, false)?;
            dispose_old(session, node.children[i])?;
            dispose_old(session, node.children[i + 1])?;
            node.children[i] = merged_addr;
            node.children.remove(i + 1);
            node.keys.remove(i);
            return finish_internal_after_shrink(session, addr, level, node, is_root);
        }

        // Lone child (root's only branch): nothing to borrow from.
        let child_addr = write_leaf(session, &child, false)?;
        node.children[i] = child_addr;
        finish_internal(session, addr, level, node, is_root)
    } else {
        let mut child = read_internal(session, node.children[i])?;
        let capacity = internal_capacity(session.fs().config());
        let min = min_branches(capacity);

        if i > 0 {
            let mut left = read_internal(session, node.children[i - 1])?;
            if left.num_branches() > min {
                let borrowed_child = left.children.pop().unwrap();
                let borrowed_key = left.keys.pop().unwrap();
                child.children.insert(0, borrowed_child);
                child.keys.insert(0, node.keys[i - 1]);
                node.keys[i - 1] = borrowed_key;
                let left_addr = write_internal(session, child_level, &left, false)?;
                let child_addr = write_internal(session, child_level, &child, false)?;
                dispose_old(session, node.children[i - 1])?;
                dispose_old(session, node.children[i])?;
                node.children[i - 1] = left_addr;
                node.children[i] = child_addr;
                return finish_internal(session, addr, level, node, is_root);
            }
            left.keys.push(node.keys[i - 1]);
            left.keys.extend(child.keys);
            left.children.extend(child.children);
            let merged_addr = write_internal(session, child_level, &left, false)?;
            dispose_old(session, node.children[i - 1])?;
            dispose_old(session, node.children[i])?;
            node.children.remove(i);
            node.children[i - 1] = merged_addr;
            node.keys.remove(i - 1);
            return finish_internal_after_shrink(session, addr, level, node, is_root);
        }

        if i + 1 < node.children.len() {
            let mut right = read_internal(session, node.children[i + 1])?;
            if right.num_branches() > min {
                let borrowed_child = right.children.remove(0);
                let borrowed_key = right.keys.remove(0);
                child.children.push(borrowed_child);
                child.keys.push(node.keys[i]);
                node.keys[i] = borrowed_key;
                let right_addr = write_internal(session, child_level, &right, false)?;
                let child_addr = write_internal(session, child_level, &child, false)?;
                dispose_old(session, node.children[i + 1])?;
                dispose_old(session, node.children[i])?;
                node.children[i + 1] = right_addr;
                node.children[i] = child_addr;
                return finish_internal(session, addr, level, node, is_root);
            }
            child.keys.push(node.keys[i]);
            child.keys.extend(right.keys);
            child.children.extend(right.children);
            let merged_addr = write_internal(session, child_level, &child, false)?;
            dispose_old(session, node.children[i])?;
            dispose_old(session, node.children[i + 1])?;
            node.children[i] = merged_addr;
            node.children.remove(i + 1);
            node.keys.remove(i);
            return finish_internal_after_shrink(session, addr, level, node, is_root);
        }

        let child_addr = write_internal(session, child_level, &child, false)?;
        node.children[i] = child_addr;
        finish_internal(session, addr, level, node, is_root)
    }
}

fn finish_internal(
    session: &mut Session,
    addr: Address,
    level: Level,
    node: Internal,
    is_root: bool,
) -> FsResult<RemoveResult> {
    let new_addr = write_internal(session, level, &node, is_root)?;
    dispose_old(session, addr)?;
    Ok(RemoveResult::Updated(new_addr))
}

/// Like `finish_internal`, but the node just lost a branch to a merge,
/// so it may itself now be underflowing and need to propagate.
fn finish_internal_after_shrink(
    session: &mut Session,
    addr: Address,
    level: Level,
    node: Internal,
    is_root: bool,
) -> FsResult<RemoveResult> {
    let capacity = internal_capacity(session.fs().config());
    let min = min_branches(capacity);
    let underflowing = !is_root && node.num_branches() < min;
    let new_addr = write_internal(session, level, &node, is_root)?;
    dispose_old(session, addr)?;
    if underflowing {
        Ok(RemoveResult::Underflow(new_addr))
    } else {
        Ok(RemoveResult::Updated(new_addr))
    }
}

/// `purge(root)`: disposes every page in the subtree, leaves first.
pub fn purge(session: &mut Session, root: Address, root_level: Level) -> FsResult<()> {
    if !root.is_valid() {
        return Ok(());
    }
    if root_level == Level::META_LEAF {
        return session.dispose_address(root);
    }
    let node = read_internal(session, root)?;
    for &child in &node.children {
        purge(session, child, Level::meta(root_level.0 - 1))?;
    }
    session.dispose_address(root)
}

/// Rewrites the single page at `target`, wherever it sits in the
/// subtree rooted at `root`, to a fresh address, propagating the
/// address change up to the root. Used by the GC loop to relocate a
/// live page out of a block being reclaimed. Returns `None` if `target`
/// isn't part of this subtree.
pub fn relocate_page(
    session: &mut Session,
    root: Address,
    root_level: Level,
    target: Address,
) -> FsResult<Option<(Address, Level)>> {
    if !root.is_valid() {
        return Ok(None);
    }
    match relocate_rec(session, root, root_level, target, true)? {
        Some(addr) => Ok(Some((addr, root_level))),
        None => Ok(None),
    }
}

fn relocate_rec(
    session: &mut Session,
    addr: Address,
    level: Level,
    target: Address,
    is_root: bool,
) -> FsResult<Option<Address>> {
    if addr == target {
        let handle = session.read(addr)?;
        let new_addr = rewrite_same_bytes(session, handle, is_root)?;
        return Ok(Some(new_addr));
    }
    if level == Level::META_LEAF {
        return Ok(None);
    }

    let mut node = read_internal(session, addr)?;
    for i in 0..node.children.len() {
        let child_level = Level::meta(level.0 - 1);
        if let Some(new_child) = relocate_rec(session, node.children[i], child_level, target, false)? {
            node.children[i] = new_child;
            let new_addr = write_internal(session, level, &node, is_root)?;
            dispose_old(session, addr)?;
            return Ok(Some(new_addr));
        }
    }
    Ok(None)
}

/// Copies a pinned page's bytes into a fresh buffer and writes it back
/// out, preserving level and tail: a pure address change, no content
/// rewrite.
fn rewrite_same_bytes(session: &mut Session, handle: crate::buffer_pool::BufferHandle, is_root: bool) -> FsResult<Address> {
    let (level, tail, payload) = {
        let page = session.fs().buffer_pool.page(handle);
        (page.level(), page.tail(), page.payload().to_vec())
    };
    session.dispose_buffered(handle)?;

    let new_handle = session.empty(level)?;
    {
        let mut page = session.fs().buffer_pool.page_mut(new_handle);
        page.payload_mut().copy_from_slice(&payload);
        page.set_tail(tail);
    }
    if is_root {
        session.flag_next_as_root()?;
    }
    session.write(new_handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::device::MemoryDevice;
    use crate::session::Filesystem;

    fn cfg() -> FsConfig {
        FsConfig::new(256, 8, 40, 6, 4, 4, 32).unwrap()
    }

    fn fresh() -> Filesystem {
        let config = cfg();
        let device = MemoryDevice::new(config.clone());
        Filesystem::purge(config, Box::new(device)).unwrap()
    }

    #[test]
    fn insert_and_get_round_trip() {
        let fs = fresh();
        let mut root = Address::INVALID;
        let mut level = Level::META_LEAF;

        {
            let mut session = fs.open_write().unwrap();
            for i in 0..4u32 {
                let key = MetaKey::new(0, i, format!("f{}", i).as_bytes());
                let value = MetaValue { blob_root: Address(i as u64), size: i };
                let (new_root, new_level) = put(&mut session, root, level, &key, value).unwrap();
                root = new_root;
                level = new_level;
            }
            session.commit().unwrap();
        }

        let session = fs.open_read();
        for i in 0..4u32 {
            let key = MetaKey::new(0, i, format!("f{}", i).as_bytes());
            let (_, value) = get(&session, root, level, &key).unwrap().unwrap();
            assert_eq!(value.blob_root, Address(i as u64));
        }
    }

    #[test]
    fn split_grows_tree_height() {
        let fs = fresh();
        let mut root = Address::INVALID;
        let mut level = Level::META_LEAF;
        let capacity = leaf_capacity(&cfg());

        let mut session = fs.open_write().unwrap();
        for i in 0..(capacity as u32 + 5) {
            let key = MetaKey::new(0, i, format!("name-{}", i).as_bytes());
            let value = MetaValue { blob_root: Address::INVALID, size: 0 };
            let (new_root, new_level) = put(&mut session, root, level, &key, value).unwrap();
            root = new_root;
            level = new_level;
        }
        assert!(level.0 > 0);
        session.commit().unwrap();
    }

    #[test]
    fn remove_then_get_returns_none() {
        let fs = fresh();
        let mut root = Address::INVALID;
        let mut level = Level::META_LEAF;

        let mut session = fs.open_write().unwrap();
        let key = MetaKey::new(0, 1, b"only");
        let (new_root, new_level) = put(
            &mut session,
            root,
            level,
            &key,
            MetaValue { blob_root: Address(9), size: 1 },
        )
        .unwrap();
        root = new_root;
        level = new_level;

        let (new_root, new_level) = remove(&mut session, root, level, &key).unwrap().unwrap();
        root = new_root;
        level = new_level;

        assert_eq!(get(&session, root, level, &key).unwrap(), None);
    }

    #[test]
    fn search_by_parent_collects_siblings() {
        let fs = fresh();
        let mut root = Address::INVALID;
        let mut level = Level::META_LEAF;

        let mut session = fs.open_write().unwrap();
        for i in 0..6u32 {
            let key = MetaKey::new(1, i, format!("c{}", i).as_bytes());
            let (new_root, new_level) = put(
                &mut session,
                root,
                level,
                &key,
                MetaValue::directory(),
            )
            .unwrap();
            root = new_root;
            level = new_level;
        }

        let found = search(&session, root, level, &crate::btree::key::ByParent(1)).unwrap();
        assert_eq!(found.len(), 6);
    }
}
