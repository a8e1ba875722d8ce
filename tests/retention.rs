//! Deleting one file must not disturb its neighbours' data, and the
//! deleted name must stop resolving.

mod common;

use common::{close_sync, enumerate, mount_fresh, open_sync, read_all, unlink_sync, write_all, VolumeSpec};

const FILE_BYTES: usize = 3072;

fn pattern(tag: u8) -> Vec<u8> {
    (0..FILE_BYTES).map(|i| tag ^ (i as u8)).collect()
}

#[test]
fn neighbours_survive_a_delete() {
    // One sector per cluster, so each file spans several clusters.
    let mut fs = mount_fresh(&VolumeSpec::fat32_40mb(), 0);

    for (name, tag) in [("A.DAT", 0xA1u8), ("B.DAT", 0xB2), ("C.DAT", 0xC3)] {
        let handle = open_sync(&mut fs, name, "a").expect("create failed");
        assert!(write_all(&mut fs, handle, &pattern(tag)));
        close_sync(&mut fs, handle);
    }

    let b = open_sync(&mut fs, "B.DAT", "r").expect("reopen B");
    unlink_sync(&mut fs, b);

    for (name, tag) in [("A.DAT", 0xA1u8), ("C.DAT", 0xC3)] {
        let handle = open_sync(&mut fs, name, "r").expect("reopen survivor");
        let mut data = vec![0u8; FILE_BYTES];
        let read = read_all(&mut fs, handle, &mut data);
        assert_eq!(read, FILE_BYTES, "{name} came back short");
        assert_eq!(data, pattern(tag), "{name} came back corrupted");
        close_sync(&mut fs, handle);
    }

    assert!(open_sync(&mut fs, "B.DAT", "r").is_none());
    let names: Vec<String> = enumerate(&mut fs, None)
        .iter()
        .map(|e| e.display_name().as_str().to_string())
        .collect();
    assert!(names.contains(&"A.DAT".to_string()));
    assert!(names.contains(&"C.DAT".to_string()));
    assert!(!names.contains(&"B.DAT".to_string()));
}
