//! Core on-flash data engine for a transactional, copy-on-write flash
//! filesystem: a page-granularity buffer pool (C1), a level-segregated
//! block allocator (C2), read-only/read-write sessions with mount-time
//! recovery (C3), a per-file blob tree (C4), a COW B+tree backing the
//! directory namespace (C5), the namespace surface built on top of it
//! (C6), and the garbage collector that keeps the device from filling
//! up. This crate owns none of the actual flash I/O — it talks to
//! whatever implements `device::FlashDevice`.

pub mod allocator;
pub mod blob_tree;
pub mod btree;
pub mod buffer_pool;
pub mod config;
pub mod device;
pub mod error;
pub mod fs;
pub mod gc;
pub mod logging;
pub mod page;
pub mod session;
pub mod stream;
pub mod types;
pub mod util;

pub use config::FsConfig;
pub use device::FlashDevice;
pub use error::{FsError, FsResult};
pub use session::{Filesystem, Session};
pub use stream::{SeekFrom, Stream};
