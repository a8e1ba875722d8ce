//! While a file is open for writing its directory entry carries the
//! physical size, so losing power mid-write leaves every completed sector
//! reachable on the next mount (with possible trailing garbage, never
//! missing data).

mod common;

use asyncfat::{OperationStatus, SeekWhence, SECTOR_SIZE};
use common::{
    file_size, flush_to_quiescence, mount, mount_fresh, open_sync, read_all, validate_log_entries,
    write_log_entries, VolumeSpec, TEST_LOG_ENTRY_SIZE,
};

fn run_powerloss_case(mode: &str, entries: u32) {
    let mut fs = mount_fresh(&VolumeSpec::fat16_100mb(), 1);

    let handle = open_sync(&mut fs, "test.txt", mode).expect("create failed");
    assert!(fs.feof(handle), "a fresh file should be at end of file");

    assert!(write_log_entries(&mut fs, handle, entries));
    let bytes_written = entries * TEST_LOG_ENTRY_SIZE as u32;
    assert!(fs.feof(handle));
    assert_eq!(fs.ftell(handle), Some(bytes_written));

    // Seeking to the end while already there must resolve immediately.
    assert_eq!(
        fs.fseek(handle, 0, SeekWhence::End),
        OperationStatus::Success
    );
    assert_eq!(fs.ftell(handle), Some(bytes_written));

    // Wait for all completed sectors, then cut the power without closing.
    flush_to_quiescence(&mut fs);
    assert!(fs.destroy(true));
    let card = fs.into_device();
    assert!(card.is_ready());

    let mut fs = mount(card);
    let handle = open_sync(&mut fs, "test.txt", "r").expect("file lost after powerloss");
    let recovered = file_size(&mut fs, handle);
    let completed = bytes_written / SECTOR_SIZE as u32 * SECTOR_SIZE as u32;
    assert!(
        recovered >= completed,
        "mode {mode}: recovered {recovered} < completed {completed}"
    );

    assert_eq!(
        fs.fseek(handle, 0, SeekWhence::Set),
        OperationStatus::Success
    );
    let mut data = vec![0u8; completed as usize];
    let read = read_all(&mut fs, handle, &mut data);
    assert_eq!(read, completed as usize);
    validate_log_entries(&data);
}

#[test]
fn powerloss_supercluster_small() {
    // A sector and a bit, stolen from the freefile.
    run_powerloss_case("as", 36);
}

#[test]
fn powerloss_chained_small() {
    run_powerloss_case("a", 36);
}

#[test]
fn powerloss_supercluster_spanning() {
    // Crosses into a second supercluster, re-linking the first one's
    // end-of-chain marker on the way.
    run_powerloss_case("as", 32_772);
}

#[test]
fn powerloss_chained_spanning() {
    // Crosses a cluster boundary in the chained allocator.
    run_powerloss_case("a", 132);
}
