//! C5 — the copy-on-write B+tree backing the directory/metadata
//! namespace. `key` defines the compound key and the index-bound search
//! scheme, `node` the on-page leaf/internal layouts, `tree` the
//! algorithms themselves.

pub mod key;
pub mod node;
pub mod tree;

pub use key::{AllEntries, ByParent, IndexBound, IndexKey, MetaKey, MetaValue};
pub use tree::{get, purge, put, relocate_page, remove, search};
