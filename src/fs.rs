//! C6 — the namespace surface built on top of the metadata tree (C5)
//! and blob tree (C4): the directory/file operations a caller actually
//! wants. Each call opens its own write session and commits before
//! returning, so from the outside every operation here is atomic;
//! callers who need several changes in one transaction should drop to
//! `Filesystem::open_write` and the `btree`/`blob_tree` functions
//! directly instead.

use log::debug;

use crate::blob_tree;
use crate::btree::{self, ByParent, MetaKey, MetaValue};
use crate::error::{FsError, FsResult};
use crate::session::Filesystem;
use crate::types::Address;

/// The root directory's id: it has no entry of its own in the metadata
/// tree (nothing to be "a child of"), so it's synthesized on the fly.
pub const ROOT_ID: u32 = 0;

#[derive(Clone, Debug)]
pub struct Metadata {
    pub id: u32,
    pub parent_id: u32,
    pub name: Vec<u8>,
    pub value: MetaValue,
}

impl Metadata {
    pub fn is_directory(&self) -> bool {
        self.value.is_directory()
    }
}

pub fn fetch_root() -> Metadata {
    Metadata {
        id: ROOT_ID,
        parent_id: ROOT_ID,
        name: Vec::new(),
        value: MetaValue::directory(),
    }
}

pub fn fetch_child_by_name(fs: &Filesystem, parent_id: u32, name: &[u8]) -> FsResult<Option<Metadata>> {
    if name.len() > fs.config().max_filename_length {
        return Err(FsError::InvalidArgument("name too long".into()));
    }
    let session = fs.open_read();
    let root = fs.root();
    let probe = MetaKey::new(parent_id, MetaKey::INVALID_ID, name);
    let found = btree::get(&session, root.address, root.level, &probe)?;
    Ok(found.map(|(k, v)| Metadata {
        id: k.id,
        parent_id: k.parent_id,
        name: k.name,
        value: v,
    }))
}

/// Lists every direct child of `parent_id`, in (name_hash, name) order
/// — not necessarily the order entries were created in.
pub fn fetch_children(fs: &Filesystem, parent_id: u32) -> FsResult<Vec<Metadata>> {
    let session = fs.open_read();
    let root = fs.root();
    let entries = btree::search(&session, root.address, root.level, &ByParent(parent_id))?;
    Ok(entries
        .into_iter()
        .map(|(k, v)| Metadata {
            id: k.id,
            parent_id: k.parent_id,
            name: k.name,
            value: v,
        })
        .collect())
}

/// Finds an entry by id alone, via the full-scan bound.
/// `O(n)`: there is no id-keyed index, by design — see DESIGN.md.
pub fn fetch_child_by_id(fs: &Filesystem, id: u32) -> FsResult<Option<Metadata>> {
    if id == ROOT_ID {
        return Ok(Some(fetch_root()));
    }
    let session = fs.open_read();
    let root = fs.root();
    let entries = btree::search(&session, root.address, root.level, &btree::AllEntries)?;
    Ok(entries.into_iter().find(|(k, _)| k.id == id).map(|(k, v)| Metadata {
        id: k.id,
        parent_id: k.parent_id,
        name: k.name,
        value: v,
    }))
}

fn create(fs: &Filesystem, parent_id: u32, name: &[u8], value: MetaValue) -> FsResult<Metadata> {
    if name.len() > fs.config().max_filename_length || name.is_empty() {
        return Err(FsError::InvalidArgument("invalid name".into()));
    }
    if fetch_child_by_name(fs, parent_id, name)?.is_some() {
        return Err(FsError::AlreadyExists);
    }
    if parent_id != ROOT_ID {
        match fetch_child_by_id(fs, parent_id)? {
            None => return Err(FsError::NoSuchEntry),
            Some(parent) if !parent.is_directory() => return Err(FsError::IsNotDirectory),
            Some(_) => {}
        }
    }

    let mut session = fs.open_write()?;
    let root = fs.root();
    let id = fs.next_node_id();
    let key = MetaKey::new(parent_id, id, name);
    let (new_root, new_level) = btree::put(&mut session, root.address, root.level, &key, value)?;
    fs.set_root(crate::session::RootPointer {
        address: new_root,
        level: new_level,
    });
    session.commit()?;
    debug!("fs: created id {} under parent {}", id, parent_id);
    Ok(Metadata {
        id,
        parent_id,
        name: name.to_vec(),
        value,
    })
}

pub fn new_directory(fs: &Filesystem, parent_id: u32, name: &[u8]) -> FsResult<Metadata> {
    create(fs, parent_id, name, MetaValue::directory())
}

pub fn new_file(fs: &Filesystem, parent_id: u32, name: &[u8]) -> FsResult<Metadata> {
    create(fs, parent_id, name, MetaValue { blob_root: Address::INVALID, size: 0 })
}

/// Removes an entry. Directories must be empty (`NotEmpty`); removing a
/// file also disposes its blob tree.
pub fn remove_node(fs: &Filesystem, parent_id: u32, name: &[u8]) -> FsResult<()> {
    let entry = fetch_child_by_name(fs, parent_id, name)?.ok_or(FsError::NoSuchEntry)?;

    if entry.is_directory() && !fetch_children(fs, entry.id)?.is_empty() {
        return Err(FsError::NotEmpty);
    }

    let mut session = fs.open_write()?;
    let root = fs.root();
    let key = MetaKey::new(parent_id, entry.id, name);
    let (new_root, new_level) = btree::remove(&mut session, root.address, root.level, &key)?
        .ok_or(FsError::NoSuchEntry)?;

    if !entry.is_directory() {
        blob_tree::dispose(&mut session, &entry.value)?;
    }

    fs.set_root(crate::session::RootPointer {
        address: new_root,
        level: new_level,
    });
    session.commit()
}

/// Reads up to `buf.len()` bytes of a file's content starting at
/// `offset`, returning the number of bytes actually read.
pub fn read_file(fs: &Filesystem, file: &Metadata, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
    if file.is_directory() {
        return Err(FsError::IsDirectory);
    }
    let session = fs.open_read();
    blob_tree::read(&session, &file.value, offset, buf)
}

/// Writes `data` at `offset`, extending the file and updating its
/// directory entry in one transaction.
pub fn write_file(fs: &Filesystem, file: &Metadata, offset: u64, data: &[u8]) -> FsResult<Metadata> {
    if file.is_directory() {
        return Err(FsError::IsDirectory);
    }
    let mut session = fs.open_write()?;
    let root = fs.root();
    let new_value = blob_tree::update(&mut session, file.value, offset, data, file.id, file.parent_id)?;

    let key = MetaKey::new(file.parent_id, file.id, &file.name);
    let (new_root, new_level) = btree::put(&mut session, root.address, root.level, &key, new_value)?;
    fs.set_root(crate::session::RootPointer {
        address: new_root,
        level: new_level,
    });
    session.commit()?;

    Ok(Metadata {
        id: file.id,
        parent_id: file.parent_id,
        name: file.name.clone(),
        value: new_value,
    })
}

/// Brings a freshly `Filesystem::purge`d or scanned instance to a usable
/// state: the root directory always exists implicitly, so there is
/// nothing left to do beyond returning it.
pub fn mount(fs: &Filesystem) -> FsResult<Metadata> {
    let _ = fs.root();
    Ok(fetch_root())
}
