use crate::blockdev::BlockDevice;
use crate::cache::{
    SectorAccess, SectorCache, CACHE_READ, CACHE_RETAIN, CACHE_WRITE,
};
use crate::chain::{fat_get_next_cluster, ChainStep};
use crate::fat::{Volume, DIR_ENTRIES_PER_SECTOR, DIR_ENTRY_SIZE, FAT_DELETED_FILE_MARKER, FAT_SMALLEST_CLUSTER};
use crate::file::{DirFinder, File, FileType};
use crate::fs::OperationStatus;

pub(crate) enum DirStep {
    /// The finder now points at an entry; the cache slot holds its sector.
    Entry(usize),
    End,
    Pending,
    Fatal,
}

/// Physical sector holding the entry a finder points at. A zero cluster
/// addresses the FAT16 root directory's fixed extent.
pub(crate) fn entry_position_sector(vol: &Volume, pos: &DirFinder) -> u32 {
    if pos.cluster < FAT_SMALLEST_CLUSTER {
        vol.root_dir_start_sector + pos.sector as u32
    } else {
        vol.cluster_to_sector(pos.cluster) + pos.sector as u32
    }
}

/// Step the finder to the next directory entry and cache its sector for
/// reading. The finder is only committed once the sector is resident, so a
/// `Pending` result re-enters cleanly.
pub(crate) fn next_dir_entry<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    dir_type: FileType,
    finder: &mut DirFinder,
) -> DirStep {
    if finder.finished {
        return DirStep::End;
    }
    if dir_type != FileType::Fat16Root && finder.cluster < FAT_SMALLEST_CLUSTER {
        finder.finished = true;
        return DirStep::End;
    }

    let mut pos = *finder;
    if pos.entry_index + 1 < DIR_ENTRIES_PER_SECTOR as i16 {
        pos.entry_index += 1;
    } else {
        pos.entry_index = 0;
        if dir_type == FileType::Fat16Root {
            if pos.sector as u32 + 1 >= vol.root_dir_sectors {
                finder.finished = true;
                return DirStep::End;
            }
            pos.sector += 1;
        } else if pos.sector as u32 + 1 < vol.sectors_per_cluster {
            pos.sector += 1;
        } else {
            match fat_get_next_cluster(vol, cache, dev, pos.cluster) {
                ChainStep::Next(next) => {
                    if vol.is_end_of_chain(next)
                        || next < FAT_SMALLEST_CLUSTER
                        || next >= vol.last_cluster_exclusive()
                    {
                        finder.finished = true;
                        return DirStep::End;
                    }
                    pos.cluster = next;
                    pos.sector = 0;
                }
                ChainStep::Pending => return DirStep::Pending,
                ChainStep::Fatal => return DirStep::Fatal,
            }
        }
    }

    let sector = entry_position_sector(vol, &pos);
    match cache.get(dev, sector, CACHE_READ) {
        SectorAccess::Hit(slot) => {
            *finder = pos;
            DirStep::Entry(slot)
        }
        SectorAccess::Pending => DirStep::Pending,
        SectorAccess::Fatal => DirStep::Fatal,
    }
}

pub(crate) fn entry_bytes_offset(finder: &DirFinder) -> usize {
    finder.entry_index as usize * DIR_ENTRY_SIZE
}

/// Persist the four driver-owned fields of the file's directory entry.
/// Directory entries keep a zero size on disk; only regular files record
/// bytes. `use_physical` selects the optimistic size written while a file
/// is open for writing.
pub(crate) fn save_directory_entry<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    file: &mut File,
    use_physical: bool,
) -> OperationStatus {
    if !file.entry_pos.has_entry() {
        return OperationStatus::Success;
    }
    let sector = entry_position_sector(vol, &file.entry_pos);
    match cache.get(dev, sector, CACHE_READ | CACHE_WRITE) {
        SectorAccess::Hit(slot) => {
            file.entry.first_cluster = file.first_cluster;
            if file.file_type == FileType::Normal {
                file.entry.size = if use_physical {
                    file.physical_size
                } else {
                    file.logical_size
                };
            }
            let offset = entry_bytes_offset(&file.entry_pos);
            file.entry
                .patch_into(&mut cache.buffer_mut(slot)[offset..offset + DIR_ENTRY_SIZE]);
            OperationStatus::Success
        }
        SectorAccess::Pending => OperationStatus::InProgress,
        SectorAccess::Fatal => OperationStatus::Fatal,
    }
}

/// Write a complete fresh entry (name, attributes, zeroed times) at the
/// file's recorded entry position.
pub(crate) fn write_new_directory_entry<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    file: &mut File,
) -> OperationStatus {
    let sector = entry_position_sector(vol, &file.entry_pos);
    match cache.get(dev, sector, CACHE_READ | CACHE_WRITE) {
        SectorAccess::Hit(slot) => {
            file.entry.first_cluster = file.first_cluster;
            let offset = entry_bytes_offset(&file.entry_pos);
            file.entry
                .encode_into(&mut cache.buffer_mut(slot)[offset..offset + DIR_ENTRY_SIZE]);
            OperationStatus::Success
        }
        SectorAccess::Pending => OperationStatus::InProgress,
        SectorAccess::Fatal => OperationStatus::Fatal,
    }
}

pub(crate) fn mark_entry_deleted<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    pos: &DirFinder,
) -> OperationStatus {
    let sector = entry_position_sector(vol, pos);
    match cache.get(dev, sector, CACHE_READ | CACHE_WRITE) {
        SectorAccess::Hit(slot) => {
            cache.buffer_mut(slot)[entry_bytes_offset(pos)] = FAT_DELETED_FILE_MARKER;
            OperationStatus::Success
        }
        SectorAccess::Pending => OperationStatus::InProgress,
        SectorAccess::Fatal => OperationStatus::Fatal,
    }
}

/// Pin the sector holding the file's directory entry so repeated size
/// writebacks never re-read it from the medium.
pub(crate) fn retain_directory_sector<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    pos: &DirFinder,
) -> OperationStatus {
    let sector = entry_position_sector(vol, pos);
    match cache.get(dev, sector, CACHE_READ | CACHE_RETAIN) {
        SectorAccess::Hit(_) => OperationStatus::Success,
        SectorAccess::Pending => OperationStatus::InProgress,
        SectorAccess::Fatal => OperationStatus::Fatal,
    }
}

pub(crate) fn release_directory_sector(vol: &Volume, cache: &mut SectorCache, pos: &DirFinder) {
    if pos.has_entry() {
        cache.release_retain(entry_position_sector(vol, pos));
    }
}
