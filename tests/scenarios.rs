//! End-to-end scenarios against the public namespace surface
//! (`fs`/`Stream`) rather than the lower-level tree primitives those
//! modules' own unit tests already exercise.

mod support;

use wtfs_core::btree::AllEntries;
use wtfs_core::session::Filesystem;
use wtfs_core::{fs, FsError, SeekFrom, Stream};

use support::{small_config, SharedDevice};

fn fresh() -> Filesystem {
    let config = small_config();
    let device = SharedDevice::new(config.clone());
    Filesystem::purge(config, Box::new(device)).unwrap()
}

/// S1 — create three files under root, read them all back via a
/// directory listing, and confirm there's no fourth.
#[test]
fn create_and_list_three_files() {
    let fsys = fresh();
    fs::new_file(&fsys, fs::ROOT_ID, b"foo").unwrap();
    fs::new_file(&fsys, fs::ROOT_ID, b"bar").unwrap();
    fs::new_file(&fsys, fs::ROOT_ID, b"baz").unwrap();

    let mut names: Vec<Vec<u8>> = fs::fetch_children(&fsys, fs::ROOT_ID)
        .unwrap()
        .into_iter()
        .map(|m| m.name)
        .collect();
    names.sort();

    assert_eq!(names, vec![b"bar".to_vec(), b"baz".to_vec(), b"foo".to_vec()]);
}

/// S2 — open a stream, write, seek back to the start, and read the same
/// bytes back out.
#[test]
fn stream_round_trip() {
    let fsys = fresh();
    let file = fs::new_file(&fsys, fs::ROOT_ID, b"greeting.txt").unwrap();

    {
        let mut stream = Stream::open(&fsys, file.clone()).unwrap();
        stream.write(b"Lorem ipsum dolor sit amet.").unwrap();
    }

    let reopened = fs::fetch_child_by_name(&fsys, fs::ROOT_ID, b"greeting.txt")
        .unwrap()
        .unwrap();
    let mut stream = Stream::open(&fsys, reopened).unwrap();
    stream.seek(SeekFrom::Start(0)).unwrap();

    let mut buf = [0u8; 27];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 27);
    assert_eq!(&buf, b"Lorem ipsum dolor sit amet.");
    assert_eq!(stream.size(), 27);
}

/// S3 — removing a non-empty directory fails with `NotEmpty`.
#[test]
fn remove_non_empty_directory_fails() {
    let fsys = fresh();
    let dir = fs::new_directory(&fsys, fs::ROOT_ID, b"d").unwrap();
    fs::new_file(&fsys, dir.id, b"f").unwrap();

    let err = fs::remove_node(&fsys, fs::ROOT_ID, b"d").unwrap_err();
    assert_eq!(err, FsError::NotEmpty);

    // the file itself can still be removed first, then the directory.
    fs::remove_node(&fsys, dir.id, b"f").unwrap();
    fs::remove_node(&fsys, fs::ROOT_ID, b"d").unwrap();
}

/// S6 — a full, unindexed scan visits exactly every entry once, no more
/// and no fewer, regardless of directory nesting.
#[test]
fn full_scan_visits_every_entry_exactly_once() {
    let fsys = fresh();
    let a = fs::new_directory(&fsys, fs::ROOT_ID, b"a").unwrap();
    for i in 0..5u32 {
        fs::new_file(&fsys, fs::ROOT_ID, format!("root-{}", i).as_bytes()).unwrap();
    }
    for i in 0..4u32 {
        fs::new_file(&fsys, a.id, format!("child-{}", i).as_bytes()).unwrap();
    }

    let session = fsys.open_read();
    let root = fsys.root();
    let all = wtfs_core::btree::search(&session, root.address, root.level, &AllEntries).unwrap();

    // 1 directory + 5 root files + 4 children of "a" == 10 entries.
    assert_eq!(all.len(), 10);
}
