//! Write contiguous-mode log files until the volume reports full, then
//! read every file back and count its newline-terminated lines. Nothing
//! that was reported as written may go missing.

mod common;

use asyncfat::{OperationStatus, SeekWhence};
use common::{close_sync, file_size, mount_fresh, open_sync, read_all, write_all, VolumeSpec};

const LINES_PER_FILE: u32 = 2048;

fn log_line(file_index: u32, line: u32) -> String {
    format!("Log {file_index:05} entry {line:6}/{LINES_PER_FILE:6}\n")
}

#[test]
fn volume_fill_and_readback() {
    let mut fs = mount_fresh(&VolumeSpec::fat32_40mb(), 0);
    assert!(fs.contiguous_free_space() > 0);

    // Fill: one "as" file after another until the freefile runs dry.
    let mut files: Vec<(String, u32, u32)> = Vec::new();
    for file_index in 0..4096 {
        if fs.is_full() {
            break;
        }
        let name = format!("LOG{file_index:05}.TXT");
        let Some(handle) = open_sync(&mut fs, &name, "as") else {
            break;
        };

        let mut lines_written = 0u32;
        for line in 0..LINES_PER_FILE {
            if !write_all(&mut fs, handle, log_line(file_index, line).as_bytes()) {
                break;
            }
            lines_written += 1;
        }
        let bytes_written = fs.ftell(handle).expect("ftell after writing");
        close_sync(&mut fs, handle);
        files.push((name, bytes_written, lines_written));
    }

    assert!(fs.is_full(), "volume never filled");
    assert!(files.len() > 100, "suspiciously few files fit");

    // Readback: every reported byte and line must still be there.
    for (name, bytes_written, lines_written) in &files {
        let handle = open_sync(&mut fs, name, "r").expect("reopen for readback");
        let size = file_size(&mut fs, handle);
        assert!(
            size >= *bytes_written,
            "{name}: size {size} < written {bytes_written}"
        );

        assert_eq!(
            fs.fseek(handle, 0, SeekWhence::Set),
            OperationStatus::Success
        );
        let mut data = vec![0u8; size as usize];
        let read = read_all(&mut fs, handle, &mut data);
        assert!(read as u32 >= *bytes_written);

        let lines_read = data[..read].iter().filter(|&&b| b == b'\n').count() as u32;
        assert!(
            lines_read >= *lines_written,
            "{name}: read {lines_read} lines, wrote {lines_written}"
        );
        close_sync(&mut fs, handle);
    }
}
