//! S5 — remount finds the latest committed root, not a transaction that
//! never finished landing on the device.

mod support;

use wtfs_core::session::Filesystem;
use wtfs_core::fs;

use support::{small_config, CrashDevice, SharedDevice};

#[test]
fn remount_recovers_latest_committed_root() {
    let config = small_config();
    let disk = SharedDevice::new(config.clone());

    {
        let fsys = Filesystem::purge(config.clone(), Box::new(disk.reopen())).unwrap();
        fs::new_file(&fsys, fs::ROOT_ID, b"a").unwrap();
        fs::new_file(&fsys, fs::ROOT_ID, b"b").unwrap();
        // `fsys` drops here, as if the process exited cleanly after these
        // two commits.
    }

    {
        // Reopen against the same bytes, but through a device that
        // swallows every subsequent write — simulating a crash that
        // happens partway through creating "c", before the page that
        // would have stamped the new root's sequence number ever reaches
        // the device.
        let mut crashing = CrashDevice::new(disk.reopen());
        crashing.arm();
        let fsys = Filesystem::mount(config.clone(), Box::new(crashing)).unwrap();
        fs::new_file(&fsys, fs::ROOT_ID, b"c").unwrap();
        // `fsys` drops here mid-"crash"; none of the writes above
        // actually reached `disk`.
    }

    let fsys = Filesystem::mount(config, Box::new(disk.reopen())).unwrap();
    let mut names: Vec<Vec<u8>> = fs::fetch_children(&fsys, fs::ROOT_ID)
        .unwrap()
        .into_iter()
        .map(|m| m.name)
        .collect();
    names.sort();

    assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec()]);
    assert!(fs::fetch_child_by_name(&fsys, fs::ROOT_ID, b"c")
        .unwrap()
        .is_none());
}
