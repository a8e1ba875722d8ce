//! Shared harness for the end-to-end scenarios: the simulated card, the
//! image formatter, and poll-to-completion drivers around the async API.

#![allow(dead_code)]

pub mod mkfs;
pub mod sim;

pub use mkfs::VolumeSpec;
pub use sim::SimCard;

use asyncfat::{DirEntryData, DirFinder, FileHandle, Filesystem, FilesystemState, FindResult};

pub const TEST_LOG_ENTRY_SIZE: usize = 16;

/// Image, mount and return a ready filesystem over a fresh volume.
pub fn mount_fresh(spec: &VolumeSpec, latency: u32) -> Filesystem<SimCard> {
    let image = mkfs::format_image(spec).expect("formatting test image");
    mount(SimCard::new(image, latency))
}

pub fn mount(card: SimCard) -> Filesystem<SimCard> {
    let mut fs = Filesystem::new(card);
    fs.init();
    for _ in 0..20_000_000u64 {
        match fs.filesystem_state() {
            FilesystemState::Ready => return fs,
            FilesystemState::Fatal => panic!("fatal filesystem error during init"),
            _ => fs.poll(),
        }
    }
    panic!("mount never completed");
}

/// Poll until the file has no queued operation.
pub fn wait_idle(fs: &mut Filesystem<SimCard>, handle: FileHandle) {
    for _ in 0..20_000_000u64 {
        if !fs.file_is_busy(handle) {
            return;
        }
        fs.poll();
    }
    panic!("file operation never completed");
}

/// Open and drive the operation to completion. `None` when the open
/// ultimately failed.
pub fn open_sync(
    fs: &mut Filesystem<SimCard>,
    name: &str,
    mode: &str,
) -> Option<FileHandle> {
    let handle = fs.fopen(name, mode, None)?;
    wait_idle(fs, handle);
    fs.file_is_open(handle).then_some(handle)
}

pub fn mkdir_sync(fs: &mut Filesystem<SimCard>, name: &str) -> Option<FileHandle> {
    let handle = fs.mkdir(name, None)?;
    wait_idle(fs, handle);
    fs.file_is_open(handle).then_some(handle)
}

pub fn close_sync(fs: &mut Filesystem<SimCard>, handle: FileHandle) {
    assert!(fs.fclose(handle, None), "close refused");
    for _ in 0..20_000_000u64 {
        if !fs.file_is_open(handle) && !fs.file_is_busy(handle) {
            return;
        }
        fs.poll();
    }
    panic!("close never completed");
}

pub fn unlink_sync(fs: &mut Filesystem<SimCard>, handle: FileHandle) {
    assert!(fs.funlink(handle, None), "unlink refused");
    for _ in 0..20_000_000u64 {
        if !fs.file_is_open(handle) && !fs.file_is_busy(handle) {
            return;
        }
        fs.poll();
    }
    panic!("unlink never completed");
}

/// Write the whole buffer, polling through cache pressure. False when the
/// volume filled up first.
pub fn write_all(fs: &mut Filesystem<SimCard>, handle: FileHandle, data: &[u8]) -> bool {
    let mut offset = 0;
    let mut stalled = 0u64;
    while offset < data.len() {
        let written = fs.fwrite(handle, &data[offset..]);
        offset += written;
        if written == 0 {
            if fs.is_full() {
                return false;
            }
            fs.poll();
            stalled += 1;
            assert!(stalled < 20_000_000, "write stalled");
        } else {
            stalled = 0;
        }
    }
    true
}

/// Read exactly `out.len()` bytes or until end of file; returns the byte
/// count delivered.
pub fn read_all(fs: &mut Filesystem<SimCard>, handle: FileHandle, out: &mut [u8]) -> usize {
    let mut offset = 0;
    let mut stalled = 0u64;
    while offset < out.len() {
        let read = fs.fread(handle, &mut out[offset..]);
        offset += read;
        if read == 0 {
            if fs.feof(handle) {
                break;
            }
            fs.poll();
            stalled += 1;
            assert!(stalled < 20_000_000, "read stalled");
        } else {
            stalled = 0;
        }
    }
    offset
}

/// Drive `flush` until no dirty sector remains, then let the final
/// in-flight write land.
pub fn flush_to_quiescence(fs: &mut Filesystem<SimCard>) {
    for _ in 0..20_000_000u64 {
        fs.poll();
        if fs.flush() {
            for _ in 0..8 {
                fs.poll();
            }
            return;
        }
    }
    panic!("flush never reached quiescence");
}

/// Log-entry helpers in the style of the original test suite: 16-byte
/// records whose bytes repeat the entry index.
pub fn log_entry(index: u32) -> [u8; TEST_LOG_ENTRY_SIZE] {
    [index as u8; TEST_LOG_ENTRY_SIZE]
}

pub fn write_log_entries(
    fs: &mut Filesystem<SimCard>,
    handle: FileHandle,
    entries: u32,
) -> bool {
    for index in 0..entries {
        if !write_all(fs, handle, &log_entry(index)) {
            return false;
        }
    }
    true
}

pub fn validate_log_entries(data: &[u8]) {
    for (i, chunk) in data.chunks(TEST_LOG_ENTRY_SIZE).enumerate() {
        let expected = (i as u32) as u8;
        for &b in chunk {
            assert_eq!(b, expected, "log entry {i} corrupted");
        }
    }
}

/// Collect every live entry of a directory (the working directory when
/// `None`), dot entries included.
pub fn enumerate(fs: &mut Filesystem<SimCard>, dir: Option<FileHandle>) -> Vec<DirEntryData> {
    let mut finder = DirFinder::default();
    assert!(fs.find_first(dir, &mut finder), "find_first refused");
    let mut entries = Vec::new();
    let mut stalled = 0u64;
    loop {
        match fs.find_next(dir, &mut finder) {
            FindResult::Found(entry) => entries.push(entry),
            FindResult::End => return entries,
            FindResult::InProgress => {
                fs.poll();
                stalled += 1;
                assert!(stalled < 20_000_000, "directory walk stalled");
            }
        }
    }
}

/// Seek to the end and report the file size, driving any queued walk.
pub fn file_size(fs: &mut Filesystem<SimCard>, handle: FileHandle) -> u32 {
    use asyncfat::{OperationStatus, SeekWhence};
    match fs.fseek(handle, 0, SeekWhence::End) {
        OperationStatus::Success => {}
        OperationStatus::InProgress => wait_idle(fs, handle),
        other => panic!("seek to end failed: {other:?}"),
    }
    fs.ftell(handle).expect("ftell after seek")
}
