//! S4 — repeated writes exhaust free blocks and force the allocator to
//! hand control to the garbage collector mid-commit. `spare_count` isn't
//! part of the public surface (it's an internal allocator counter; see
//! `allocator.rs`'s own unit tests for that), so what's checked here is
//! the externally observable guarantee: every byte written before, during
//! and after the pressure period is still readable afterwards.

mod support;

use wtfs_core::session::Filesystem;
use wtfs_core::{fs, Stream};

use support::SharedDevice;
use wtfs_core::config::FsConfig;

fn tiny_config() -> FsConfig {
    // Small device, small blocks: a handful of incremental writes is
    // enough to run the allocator down to its GC trigger threshold.
    FsConfig::new(64, 4, 10, 6, 2, 2, 32).unwrap()
}

#[test]
fn writes_survive_a_gc_cycle() {
    let config = tiny_config();
    let device = SharedDevice::new(config.clone());
    let fsys = Filesystem::purge(config, Box::new(device)).unwrap();

    let file = fs::new_file(&fsys, fs::ROOT_ID, b"growing.bin").unwrap();
    let mut stream = Stream::open(&fsys, file).unwrap();

    let mut expected = Vec::new();
    for round in 0..60u8 {
        let chunk = [round; 8];
        stream.write(&chunk).unwrap();
        expected.extend_from_slice(&chunk);
    }

    assert_eq!(stream.size(), expected.len() as u64);

    stream.seek(wtfs_core::SeekFrom::Start(0)).unwrap();
    let mut actual = vec![0u8; expected.len()];
    let n = stream.read(&mut actual).unwrap();
    assert_eq!(n, expected.len());
    assert_eq!(actual, expected);
}
