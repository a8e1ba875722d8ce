//! Poll-driven FAT16/FAT32 driver for SD-card class block devices.
//!
//! No call in this crate blocks on the medium: operations either complete
//! from the sector cache or park and are advanced by [`Filesystem::poll`].

#![cfg_attr(not(test), no_std)]

pub mod blockdev;
pub mod fat;

mod cache;
mod chain;
mod dir;
mod file;
mod fs;
mod io;
mod ops;

pub use blockdev::{BlockDevice, BlockEvent, SECTOR_SIZE};
pub use fat::DirEntryData;
pub use file::{DirFinder, FileCallback, FileHandle, OperationCallback};
pub use fs::{FilesystemState, FindResult, Filesystem, OperationStatus, SeekWhence, MAX_OPEN_FILES};

/// Tail of the volume's largest free region left out of the freefile so a
/// handful of regular clusters stay allocatable.
pub const FREEFILE_LEAVE_CLUSTERS: u32 = 100;
