use core::mem;

use crate::blockdev::{BlockDevice, SECTOR_SIZE};
use crate::cache::{SectorAccess, SectorCache, CACHE_LOCK, CACHE_READ, CACHE_WRITE};
use crate::chain::{fat_get_next_cluster, ChainStep};
use crate::fat::{Volume, FAT_SMALLEST_CLUSTER};
use crate::file::{
    mode, AppendFreeClusterState, File, FileOperation, FileType, SeekState,
};
use crate::fs::{Allocator, OperationStatus};
use crate::ops;

fn unlock_held_slot(cache: &mut SectorCache, file: &mut File) {
    if let Some(slot) = file.locked_slot.take() {
        cache.unlock_slot(slot as usize);
    }
}

fn track_locked_slot(cache: &mut SectorCache, file: &mut File, slot: usize) {
    if let Some(previous) = file.locked_slot {
        if previous as usize != slot {
            cache.unlock_slot(previous as usize);
        }
    }
    file.locked_slot = Some(slot as u8);
}

/// Move the cursor without queueing an operation. Succeeds when the move
/// stays inside the current sector, inside the current cluster, lands in a
/// contiguous file's allocated range, or crosses exactly one cluster
/// boundary forward off a cached FAT sector. Anything else reports false
/// and the caller falls back to a queued seek.
pub(crate) fn fseek_atomic<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    file: &mut File,
    delta: i64,
) -> bool {
    let new_offset = file.cursor_offset as i64 + delta;
    if new_offset < 0 {
        return false;
    }
    let new_offset = new_offset as u32;

    if new_offset / SECTOR_SIZE as u32 == file.cursor_offset / SECTOR_SIZE as u32 {
        file.cursor_offset = new_offset;
        return true;
    }

    // Leaving the sector invalidates any partially-written sector hold.
    unlock_held_slot(cache, file);

    if file.file_type == FileType::Fat16Root {
        file.cursor_offset = new_offset;
        return true;
    }

    let cluster_size = vol.cluster_size();
    let current_index = file.cursor_offset / cluster_size;
    let new_index = new_offset / cluster_size;

    if new_index == current_index {
        file.cursor_offset = new_offset;
        return true;
    }

    if file.mode & mode::CONTIGUOUS != 0
        && file.first_cluster >= FAT_SMALLEST_CLUSTER
        && new_offset < file.physical_size
    {
        // Contiguous region: the chain is implicit, no FAT traffic.
        file.cursor_previous_cluster = if new_index > 0 {
            file.first_cluster + new_index - 1
        } else {
            0
        };
        file.cursor_cluster = file.first_cluster + new_index;
        file.cursor_offset = new_offset;
        return true;
    }

    if new_index == current_index + 1 && file.cursor_cluster >= FAT_SMALLEST_CLUSTER {
        match fat_get_next_cluster(vol, cache, dev, file.cursor_cluster) {
            ChainStep::Next(next) => {
                file.cursor_previous_cluster = file.cursor_cluster;
                file.cursor_cluster = if vol.is_end_of_chain(next)
                    || next < FAT_SMALLEST_CLUSTER
                    || next >= vol.last_cluster_exclusive()
                {
                    0
                } else {
                    next
                };
                file.cursor_offset = new_offset;
                return true;
            }
            ChainStep::Pending | ChainStep::Fatal => return false,
        }
    }

    false
}

/// Rebase-and-walk seek path behind the public `fseek`. Targets beyond the
/// end of the file park the cursor at the end without allocating.
pub(crate) fn fseek_impl<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    file: &mut File,
    target: u32,
) -> OperationStatus {
    let target = target.min(file.logical_size);
    let delta = target as i64 - file.cursor_offset as i64;
    if fseek_atomic(vol, cache, dev, file, delta) {
        return OperationStatus::Success;
    }

    // Rewind to the head and walk forward; cluster chains are singly
    // linked, so backward moves restart from the first cluster.
    unlock_held_slot(cache, file);
    file.cursor_offset = 0;
    file.cursor_cluster = file.first_cluster;
    file.cursor_previous_cluster = 0;

    let mut st = SeekState {
        remaining: target,
        callback: None,
    };
    match ops::continue_seek(vol, cache, dev, file, &mut st) {
        OperationStatus::Success => OperationStatus::Success,
        OperationStatus::InProgress => {
            file.op = FileOperation::Seek(st);
            OperationStatus::InProgress
        }
        other => other,
    }
}

/// Copy bytes in at the cursor, allocating clusters on demand at the end
/// of the file. Returns the number of bytes accepted; zero means the file
/// is busy, unwritable, or the volume filled up.
pub(crate) fn fwrite_impl<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    alloc: &mut Allocator,
    freefile: &mut File,
    file: &mut File,
    data: &[u8],
) -> usize {
    if !file.is_open() || file.is_busy() || file.is_directory() {
        return 0;
    }
    if file.mode & (mode::WRITE | mode::APPEND) == 0 {
        return 0;
    }

    let mut written = 0;
    while written < data.len() {
        if file.file_type != FileType::Fat16Root && file.cursor_offset == file.physical_size {
            if !extend_file(vol, cache, dev, alloc, freefile, file) {
                break;
            }
            if file.is_busy() {
                // The append parked on the cache; bytes so far are final
                // for this call.
                break;
            }
            continue;
        }
        if file.file_type != FileType::Fat16Root && file.cursor_cluster < FAT_SMALLEST_CLUSTER {
            break;
        }

        let offset_in_sector = (file.cursor_offset % SECTOR_SIZE as u32) as usize;
        let chunk = (data.len() - written).min(SECTOR_SIZE - offset_in_sector);
        let sector = file.cursor_sector(vol);

        // Preserve existing bytes unless this write starts a fresh sector
        // past everything ever written.
        let needs_read = offset_in_sector != 0 || file.cursor_offset < file.logical_size;
        let flags = if needs_read {
            CACHE_READ | CACHE_WRITE | CACHE_LOCK
        } else {
            CACHE_WRITE | CACHE_LOCK
        };

        match cache.get(dev, sector, flags) {
            SectorAccess::Hit(slot) => {
                track_locked_slot(cache, file, slot);
                cache.buffer_mut(slot)[offset_in_sector..offset_in_sector + chunk]
                    .copy_from_slice(&data[written..written + chunk]);
            }
            SectorAccess::Pending => break,
            SectorAccess::Fatal => break,
        }

        // Advance before counting: if the cluster boundary needs a FAT
        // read that is not cached yet, the caller re-sends this chunk.
        if !fseek_atomic(vol, cache, dev, file, chunk as i64) {
            break;
        }
        written += chunk;
        if file.cursor_offset > file.logical_size {
            file.logical_size = file.cursor_offset;
        }
    }
    written
}

/// Queue the flavour of append the file's mode calls for and push it as
/// far as the cache allows right now. Returns false when no space is left.
fn extend_file<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    alloc: &mut Allocator,
    freefile: &mut File,
    file: &mut File,
) -> bool {
    if alloc.filesystem_full {
        return false;
    }

    if file.mode & mode::CONTIGUOUS != 0 {
        match ops::queue_append_supercluster(vol, dev, alloc, freefile, file) {
            Some(op) => file.op = op,
            None => return false,
        }
    } else {
        file.op = FileOperation::AppendFreeCluster(AppendFreeClusterState::new(
            file.cursor_previous_cluster,
            alloc.last_cluster_allocated,
        ));
    }

    let mut op = mem::take(&mut file.op);
    let status = match &mut op {
        FileOperation::AppendFreeCluster(st) => {
            let extent = ops::freefile_extent(vol, freefile);
            ops::continue_append_free_cluster(vol, cache, dev, alloc, extent, file, st)
        }
        FileOperation::AppendSupercluster(st) => {
            ops::continue_append_supercluster(vol, cache, dev, Some(freefile), file, st)
        }
        _ => OperationStatus::Failure,
    };
    match status {
        OperationStatus::Success => true,
        OperationStatus::InProgress => {
            file.op = op;
            true
        }
        _ => false,
    }
}

/// Copy bytes out from the cursor, clamped to the logical size. Returns
/// bytes delivered; zero means busy, end of file, or a cache miss that a
/// poll will resolve.
pub(crate) fn fread_impl<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    file: &mut File,
    out: &mut [u8],
) -> usize {
    if !file.is_open() || file.is_busy() {
        return 0;
    }
    if file.mode & mode::READ == 0 {
        return 0;
    }

    let mut read = 0;
    while read < out.len() {
        if file.cursor_offset >= file.logical_size {
            break;
        }
        if file.file_type != FileType::Fat16Root
            && file.cursor_cluster < FAT_SMALLEST_CLUSTER
        {
            break;
        }

        let offset_in_sector = (file.cursor_offset % SECTOR_SIZE as u32) as usize;
        let chunk = (out.len() - read)
            .min(SECTOR_SIZE - offset_in_sector)
            .min((file.logical_size - file.cursor_offset) as usize);
        let sector = file.cursor_sector(vol);

        match cache.get(dev, sector, CACHE_READ | CACHE_LOCK) {
            SectorAccess::Hit(slot) => {
                track_locked_slot(cache, file, slot);
                out[read..read + chunk].copy_from_slice(
                    &cache.buffer(slot)[offset_in_sector..offset_in_sector + chunk],
                );
            }
            SectorAccess::Pending => break,
            SectorAccess::Fatal => break,
        }

        if !fseek_atomic(vol, cache, dev, file, chunk as i64) {
            break;
        }
        read += chunk;
    }
    read
}
