use core::mem;

use crate::blockdev::BlockDevice;
use crate::cache::{SectorAccess, SectorCache, CACHE_WRITE};
use crate::chain::{
    fat_get_next_cluster, fat_set_next_cluster, fat_write_contiguous_chain,
    find_cluster_with_condition, ChainStep, ClusterCondition, ClusterSearch,
};
use crate::dir::{
    entry_bytes_offset, mark_entry_deleted, next_dir_entry, release_directory_sector,
    retain_directory_sector, save_directory_entry, write_new_directory_entry, DirStep,
};
use crate::fat::{
    DirEntryData, Volume, ATTR_DIRECTORY, ATTR_LONG_NAME, ATTR_VOLUME, DIR_ENTRY_SIZE,
    FAT_DELETED_FILE_MARKER, FAT_SMALLEST_CLUSTER,
};
use crate::file::{
    mode, AppendFreeClusterState, AppendPhase, AppendSuperclusterState, CloseState, ClosePhase,
    CreateFileState, CreatePhase, DirAllocPhase, DirEntryAlloc, File, FileCallback, FileOperation,
    FileType, InitSubdirectoryState, OperationCallback, SeekState, SubdirPhase, SuperPhase,
    TruncatePhase, TruncateState, UnlinkPhase, UnlinkState,
};
use crate::fs::{Allocator, OperationStatus};

/// Callback captured from a finished operation, fired by the caller once
/// all borrows are released.
pub(crate) enum Fired {
    File(FileCallback, bool),
    Flag(OperationCallback, bool),
}

pub(crate) enum OpStep {
    Pending,
    Done(Option<Fired>),
}

enum ArmOutcome {
    Pending,
    Replace(FileOperation),
    Finish(Option<Fired>),
}

/// Cluster range `[start, end)` owned by the freefile, skipped by every
/// free-cluster search.
pub(crate) fn freefile_extent(vol: &Volume, freefile: &File) -> Option<(u32, u32)> {
    if freefile.first_cluster >= FAT_SMALLEST_CLUSTER && freefile.logical_size > 0 {
        Some((
            freefile.first_cluster,
            freefile.first_cluster + freefile.logical_size / vol.cluster_size(),
        ))
    } else {
        None
    }
}

/// Advance the file's queued operation by one slice of work.
pub(crate) fn continue_file_operation<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    alloc: &mut Allocator,
    cwd: &mut File,
    mut freefile: Option<&mut File>,
    file: &mut File,
) -> OpStep {
    let mut op = mem::take(&mut file.op);
    let outcome = match &mut op {
        FileOperation::None => ArmOutcome::Finish(None),
        FileOperation::CreateFile(st) => {
            let extent = freefile.as_deref().and_then(|ff| freefile_extent(vol, ff));
            continue_create_file(vol, cache, dev, alloc, extent, cwd, file, st)
        }
        FileOperation::Seek(st) => match continue_seek(vol, cache, dev, file, st) {
            OperationStatus::Success => {
                ArmOutcome::Finish(st.callback.take().map(|cb| Fired::File(cb, true)))
            }
            OperationStatus::InProgress => ArmOutcome::Pending,
            _ => ArmOutcome::Finish(st.callback.take().map(|cb| Fired::File(cb, false))),
        },
        FileOperation::Close(st) => continue_close(vol, cache, dev, file, st),
        FileOperation::Truncate(st) => {
            match continue_truncate(vol, cache, dev, alloc, freefile.as_deref_mut(), file, st) {
                OperationStatus::Success => {
                    ArmOutcome::Finish(st.callback.take().map(|cb| Fired::File(cb, true)))
                }
                OperationStatus::InProgress => ArmOutcome::Pending,
                _ => ArmOutcome::Finish(st.callback.take().map(|cb| Fired::File(cb, false))),
            }
        }
        FileOperation::Unlink(st) => {
            continue_unlink(vol, cache, dev, alloc, freefile.as_deref_mut(), file, st)
        }
        FileOperation::AppendFreeCluster(st) => {
            let extent = freefile.as_deref().and_then(|ff| freefile_extent(vol, ff));
            match continue_append_free_cluster(vol, cache, dev, alloc, extent, file, st) {
                OperationStatus::InProgress => ArmOutcome::Pending,
                _ => ArmOutcome::Finish(None),
            }
        }
        FileOperation::AppendSupercluster(st) => {
            match continue_append_supercluster(vol, cache, dev, freefile.as_deref_mut(), file, st) {
                OperationStatus::InProgress => ArmOutcome::Pending,
                _ => ArmOutcome::Finish(None),
            }
        }
        FileOperation::InitSubdirectory(st) => {
            let extent = freefile.as_deref().and_then(|ff| freefile_extent(vol, ff));
            continue_init_subdirectory(vol, cache, dev, alloc, extent, file, st)
        }
    };
    match outcome {
        ArmOutcome::Pending => {
            file.op = op;
            OpStep::Pending
        }
        ArmOutcome::Replace(new_op) => {
            file.op = new_op;
            OpStep::Pending
        }
        ArmOutcome::Finish(fired) => OpStep::Done(fired),
    }
}

/// Append one free cluster found by scanning forward from the allocation
/// cursor. Reusable as a sub-machine: directory extension and subdirectory
/// initialisation embed it with `file` bound to the directory.
pub(crate) fn continue_append_free_cluster<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    alloc: &mut Allocator,
    freefile_extent: Option<(u32, u32)>,
    file: &mut File,
    st: &mut AppendFreeClusterState,
) -> OperationStatus {
    loop {
        match st.phase {
            AppendPhase::FindFreespace => {
                match find_cluster_with_condition(
                    vol,
                    cache,
                    dev,
                    freefile_extent,
                    ClusterCondition::Free,
                    &mut st.search_cluster,
                ) {
                    ClusterSearch::Found(cluster) => {
                        st.new_cluster = cluster;
                        alloc.last_cluster_allocated = cluster;
                        st.phase = AppendPhase::UpdateFat1;
                    }
                    ClusterSearch::NotFound => {
                        if st.wrapped {
                            log::warn!("append: no free clusters outside the freefile");
                            alloc.filesystem_full = true;
                            return OperationStatus::Failure;
                        }
                        // One retry from the lowest cluster picks up space
                        // freed behind the allocation cursor.
                        st.wrapped = true;
                        st.search_cluster = FAT_SMALLEST_CLUSTER;
                    }
                    ClusterSearch::Pending => return OperationStatus::InProgress,
                    ClusterSearch::Fatal => return OperationStatus::Fatal,
                }
            }
            AppendPhase::UpdateFat1 => {
                match fat_set_next_cluster(
                    vol,
                    cache,
                    dev,
                    st.new_cluster,
                    vol.end_of_chain_marker(),
                ) {
                    OperationStatus::Success => {
                        if st.previous_cluster == 0 {
                            file.first_cluster = st.new_cluster;
                        }
                        if file.cursor_cluster == 0 && file.cursor_offset == file.physical_size {
                            file.cursor_cluster = st.new_cluster;
                        }
                        file.physical_size += vol.cluster_size();
                        st.phase = if st.previous_cluster != 0 {
                            AppendPhase::UpdateFat2
                        } else {
                            AppendPhase::UpdateFileDirectory
                        };
                    }
                    other => return other,
                }
            }
            AppendPhase::UpdateFat2 => {
                match fat_set_next_cluster(vol, cache, dev, st.previous_cluster, st.new_cluster) {
                    OperationStatus::Success => st.phase = AppendPhase::UpdateFileDirectory,
                    other => return other,
                }
            }
            AppendPhase::UpdateFileDirectory => {
                // The optimistic physical size goes out on every append so
                // completed sectors stay reachable after power loss.
                return save_directory_entry(vol, cache, dev, file, true);
            }
        }
    }
}

/// Steal the freefile's first supercluster for a contiguous-mode file.
/// Bookkeeping happens here at queue time; the cursor may use the new
/// cluster immediately while the FAT and directory writes trail behind.
pub(crate) fn queue_append_supercluster<D: BlockDevice>(
    vol: &Volume,
    dev: &mut D,
    alloc: &mut Allocator,
    freefile: &mut File,
    file: &mut File,
) -> Option<FileOperation> {
    let supercluster_bytes = vol.supercluster_size();
    if freefile.logical_size < supercluster_bytes {
        log::warn!("append: freefile exhausted");
        alloc.filesystem_full = true;
        return None;
    }

    let entries = vol.fat_entries_per_sector();
    let new_cluster = freefile.first_cluster;
    freefile.first_cluster += entries;
    freefile.logical_size -= supercluster_bytes;
    freefile.physical_size -= supercluster_bytes;

    let was_empty = file.first_cluster == 0;
    // Rewriting the preceding supercluster overwrites the file's old
    // end-of-chain marker with a link into the stolen range.
    let fat_start = if was_empty {
        new_cluster
    } else {
        new_cluster - entries
    };
    let fat_end = new_cluster + entries;

    if was_empty {
        file.first_cluster = new_cluster;
    }
    if file.cursor_cluster == 0 && file.cursor_offset == file.physical_size {
        file.cursor_cluster = new_cluster;
    }
    file.physical_size += supercluster_bytes;

    let (first_fat_sector, _) = vol.fat_position(fat_start);
    dev.begin_write_burst(first_fat_sector, (fat_end - fat_start) / entries);

    Some(FileOperation::AppendSupercluster(AppendSuperclusterState {
        phase: SuperPhase::UpdateFat,
        fat_cursor: fat_start,
        fat_end,
    }))
}

pub(crate) fn continue_append_supercluster<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    freefile: Option<&mut File>,
    file: &mut File,
    st: &mut AppendSuperclusterState,
) -> OperationStatus {
    let freefile = match freefile {
        Some(ff) => ff,
        None => return OperationStatus::Failure,
    };
    loop {
        match st.phase {
            SuperPhase::UpdateFat => {
                match fat_write_contiguous_chain(vol, cache, dev, &mut st.fat_cursor, st.fat_end) {
                    OperationStatus::Success => {
                        dev.end_write_burst();
                        st.phase = SuperPhase::UpdateFreefileDirectory;
                    }
                    other => return other,
                }
            }
            SuperPhase::UpdateFreefileDirectory => {
                match save_directory_entry(vol, cache, dev, freefile, false) {
                    OperationStatus::Success => st.phase = SuperPhase::UpdateFileDirectory,
                    other => return other,
                }
            }
            SuperPhase::UpdateFileDirectory => {
                return save_directory_entry(vol, cache, dev, file, true);
            }
        }
    }
}

/// Queued cluster-by-cluster forward walk used when an atomic seek cannot
/// resolve the move. The cursor was rewound to the file's first cluster
/// before this operation was queued.
pub(crate) fn continue_seek<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    file: &mut File,
    st: &mut SeekState,
) -> OperationStatus {
    let cluster_size = vol.cluster_size();
    loop {
        if file.file_type == FileType::Fat16Root {
            file.cursor_offset += st.remaining;
            st.remaining = 0;
            return OperationStatus::Success;
        }
        let offset_in_cluster = file.cursor_offset & vol.byte_in_cluster_mask;
        let remaining_in_cluster = cluster_size - offset_in_cluster;
        if st.remaining < remaining_in_cluster {
            file.cursor_offset += st.remaining;
            st.remaining = 0;
            return OperationStatus::Success;
        }
        if file.cursor_cluster < FAT_SMALLEST_CLUSTER {
            // Chain ended before the target; park at the end.
            file.cursor_offset = file.cursor_offset.min(file.logical_size);
            st.remaining = 0;
            return OperationStatus::Success;
        }
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
                file.cursor_offset += remaining_in_cluster;
                st.remaining -= remaining_in_cluster;
            }
            ChainStep::Pending => return OperationStatus::InProgress,
            ChainStep::Fatal => return OperationStatus::Fatal,
        }
    }
}

/// Find an entry slot whose first byte marks it deleted or terminal,
/// growing the directory by one zeroed cluster when the chain runs out.
/// On success the allocation's finder addresses the claimed slot.
fn continue_dir_entry_alloc<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    alloc: &mut Allocator,
    freefile_extent: Option<(u32, u32)>,
    dir: &mut File,
    st: &mut DirEntryAlloc,
) -> OperationStatus {
    loop {
        match &mut st.phase {
            DirAllocPhase::Scan => {
                match next_dir_entry(vol, cache, dev, dir.file_type, &mut st.finder) {
                    DirStep::Entry(slot) => {
                        let first = cache.buffer(slot)[entry_bytes_offset(&st.finder)];
                        if first == 0x00 || first == FAT_DELETED_FILE_MARKER {
                            return OperationStatus::Success;
                        }
                    }
                    DirStep::End => {
                        if dir.file_type == FileType::Fat16Root {
                            // The FAT16 root has a fixed extent and cannot
                            // grow.
                            return OperationStatus::Failure;
                        }
                        st.phase = DirAllocPhase::Extend(AppendFreeClusterState::new(
                            st.finder.cluster,
                            alloc.last_cluster_allocated,
                        ));
                    }
                    DirStep::Pending => return OperationStatus::InProgress,
                    DirStep::Fatal => return OperationStatus::Fatal,
                }
            }
            DirAllocPhase::Extend(append) => {
                match continue_append_free_cluster(
                    vol,
                    cache,
                    dev,
                    alloc,
                    freefile_extent,
                    dir,
                    append,
                ) {
                    OperationStatus::Success => {
                        let cluster = append.new_cluster;
                        st.phase = DirAllocPhase::Zero { cluster, sector: 0 };
                    }
                    other => return other,
                }
            }
            DirAllocPhase::Zero { cluster, sector } => {
                while (*sector as u32) < vol.sectors_per_cluster {
                    let physical = vol.cluster_to_sector(*cluster) + *sector as u32;
                    match cache.get(dev, physical, CACHE_WRITE) {
                        SectorAccess::Hit(slot) => {
                            cache.buffer_mut(slot).fill(0);
                            *sector += 1;
                        }
                        SectorAccess::Pending => return OperationStatus::InProgress,
                        SectorAccess::Fatal => return OperationStatus::Fatal,
                    }
                }
                st.finder.rewind_to_cluster(*cluster);
                st.phase = DirAllocPhase::Scan;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn continue_create_file<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    alloc: &mut Allocator,
    freefile_extent: Option<(u32, u32)>,
    cwd: &mut File,
    file: &mut File,
    st: &mut CreateFileState,
) -> ArmOutcome {
    loop {
        match &mut st.phase {
            CreatePhase::FindFile(finder) => {
                match next_dir_entry(vol, cache, dev, cwd.file_type, finder) {
                    DirStep::Entry(slot) => {
                        let offset = entry_bytes_offset(finder);
                        let raw = &cache.buffer(slot)[offset..offset + DIR_ENTRY_SIZE];
                        let first = raw[0];
                        if first == 0x00 {
                            // End of used entries.
                            if file.mode & mode::CREATE != 0 {
                                st.phase =
                                    CreatePhase::Allocate(DirEntryAlloc::begin(cwd.first_cluster));
                            } else {
                                return fail_create(file, st);
                            }
                            continue;
                        }
                        if first == FAT_DELETED_FILE_MARKER {
                            continue;
                        }
                        let entry = DirEntryData::decode(raw);
                        if entry.attrib == ATTR_LONG_NAME || entry.attrib & ATTR_VOLUME != 0 {
                            continue;
                        }
                        if entry.filename == file.entry.filename {
                            file.entry = entry;
                            file.entry_pos = *finder;
                            file.first_cluster = entry.first_cluster;
                            file.logical_size = entry.size;
                            file.physical_size =
                                entry.size.div_ceil(vol.cluster_size()) * vol.cluster_size();
                            file.file_type = if entry.is_directory() {
                                FileType::Directory
                            } else {
                                FileType::Normal
                            };
                            if entry.size > 0 {
                                // An append-mode open of existing content
                                // cannot promise an unfragmented chain.
                                file.mode &= !mode::CONTIGUOUS;
                            }
                            st.phase = CreatePhase::Retain;
                        }
                    }
                    DirStep::End => {
                        if file.mode & mode::CREATE != 0 {
                            st.phase = CreatePhase::Allocate(DirEntryAlloc::begin(cwd.first_cluster));
                        } else {
                            return fail_create(file, st);
                        }
                    }
                    DirStep::Pending => return ArmOutcome::Pending,
                    DirStep::Fatal => return fail_create(file, st),
                }
            }
            CreatePhase::Allocate(alloc_st) => {
                match continue_dir_entry_alloc(
                    vol,
                    cache,
                    dev,
                    alloc,
                    freefile_extent,
                    cwd,
                    alloc_st,
                ) {
                    OperationStatus::Success => {
                        file.entry_pos = alloc_st.finder;
                        st.phase = CreatePhase::WriteEntry;
                    }
                    OperationStatus::InProgress => return ArmOutcome::Pending,
                    _ => return fail_create(file, st),
                }
            }
            CreatePhase::WriteEntry => {
                match write_new_directory_entry(vol, cache, dev, file) {
                    OperationStatus::Success => st.phase = CreatePhase::Retain,
                    OperationStatus::InProgress => return ArmOutcome::Pending,
                    _ => return fail_create(file, st),
                }
            }
            CreatePhase::Retain => {
                if file.mode & mode::RETAIN_DIRECTORY != 0 && file.entry_pos.has_entry() {
                    match retain_directory_sector(vol, cache, dev, &file.entry_pos) {
                        OperationStatus::Success => {}
                        OperationStatus::InProgress => return ArmOutcome::Pending,
                        _ => return fail_create(file, st),
                    }
                }
                file.cursor_offset = 0;
                file.cursor_cluster = file.first_cluster;
                file.cursor_previous_cluster = 0;
                let callback = st.callback.take();

                if file.file_type == FileType::Directory && file.first_cluster == 0 {
                    let parent_cluster = if cwd.first_cluster == vol.root_dir_cluster {
                        // ".." pointing at the root is recorded as zero.
                        0
                    } else {
                        cwd.first_cluster
                    };
                    return ArmOutcome::Replace(FileOperation::InitSubdirectory(
                        InitSubdirectoryState {
                            phase: SubdirPhase::Allocate(AppendFreeClusterState::new(
                                0,
                                alloc.last_cluster_allocated,
                            )),
                            parent_cluster,
                            callback,
                        },
                    ));
                }
                if file.mode & mode::APPEND != 0 && file.logical_size > 0 {
                    return ArmOutcome::Replace(FileOperation::Seek(SeekState {
                        remaining: file.logical_size,
                        callback,
                    }));
                }
                // "w" truncates; "r+" (write without create) keeps content.
                if file.mode & mode::WRITE != 0
                    && file.mode & mode::CREATE != 0
                    && file.mode & mode::APPEND == 0
                    && file.logical_size > 0
                {
                    return ArmOutcome::Replace(FileOperation::Truncate(queue_truncate_state(
                        vol, cache, file, callback,
                    )));
                }
                return ArmOutcome::Finish(callback.map(|cb| Fired::File(cb, true)));
            }
        }
    }
}

fn fail_create(file: &mut File, st: &mut CreateFileState) -> ArmOutcome {
    let callback = st.callback.take();
    *file = File::CLOSED;
    ArmOutcome::Finish(callback.map(|cb| Fired::File(cb, false)))
}

/// Capture the chain to release and reset the file to zero length. The
/// released clusters are erased (or donated back to the freefile) by
/// [`continue_truncate`].
pub(crate) fn queue_truncate_state(
    vol: &Volume,
    cache: &mut SectorCache,
    file: &mut File,
    callback: Option<FileCallback>,
) -> TruncateState {
    let start_cluster = file.first_cluster;
    // Range erase is only sound when the file provably owns whole FAT
    // sectors; anything else walks the chain.
    let entries = vol.fat_entries_per_sector();
    let clusters = file.physical_size / vol.cluster_size();
    let contiguous = file.mode & mode::CONTIGUOUS != 0
        && start_cluster >= FAT_SMALLEST_CLUSTER
        && start_cluster % entries == 0
        && clusters % entries == 0;
    let end_cluster = if contiguous {
        start_cluster + clusters
    } else {
        0
    };

    if let Some(slot) = file.locked_slot.take() {
        cache.unlock_slot(slot as usize);
    }
    file.first_cluster = 0;
    file.logical_size = 0;
    file.physical_size = 0;
    file.cursor_offset = 0;
    file.cursor_cluster = 0;
    file.cursor_previous_cluster = 0;

    TruncateState {
        phase: TruncatePhase::UpdateDirectory,
        start_cluster,
        chain_cursor: start_cluster,
        end_cluster,
        callback,
    }
}

pub(crate) fn continue_truncate<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    alloc: &mut Allocator,
    mut freefile: Option<&mut File>,
    file: &mut File,
    st: &mut TruncateState,
) -> OperationStatus {
    loop {
        match st.phase {
            TruncatePhase::UpdateDirectory => {
                match save_directory_entry(vol, cache, dev, file, false) {
                    OperationStatus::Success => {
                        if st.start_cluster < FAT_SMALLEST_CLUSTER {
                            return OperationStatus::Success;
                        }
                        if st.end_cluster != 0 {
                            let adjacent = freefile
                                .as_deref()
                                .map(|ff| ff.first_cluster == st.end_cluster)
                                .unwrap_or(false);
                            if adjacent {
                                // Hand the whole range straight back to the
                                // freefile; its FAT is rewritten anyway the
                                // next time a supercluster is stolen.
                                if let Some(ff) = freefile.as_deref_mut() {
                                    let bytes =
                                        (st.end_cluster - st.start_cluster) * vol.cluster_size();
                                    ff.first_cluster = st.start_cluster;
                                    ff.logical_size += bytes;
                                    ff.physical_size += bytes;
                                }
                                st.phase = TruncatePhase::PrependToFreefile;
                            } else {
                                st.phase = TruncatePhase::EraseRange;
                            }
                        } else {
                            st.phase = TruncatePhase::EraseChain;
                        }
                    }
                    other => return other,
                }
            }
            TruncatePhase::EraseChain => loop {
                if st.chain_cursor < FAT_SMALLEST_CLUSTER
                    || st.chain_cursor >= vol.last_cluster_exclusive()
                {
                    return OperationStatus::Success;
                }
                let next = match fat_get_next_cluster(vol, cache, dev, st.chain_cursor) {
                    ChainStep::Next(next) => next,
                    ChainStep::Pending => return OperationStatus::InProgress,
                    ChainStep::Fatal => return OperationStatus::Fatal,
                };
                match fat_set_next_cluster(vol, cache, dev, st.chain_cursor, 0) {
                    OperationStatus::Success => {}
                    other => return other,
                }
                alloc.lower_allocation_hint(st.chain_cursor);
                if vol.is_end_of_chain(next) || next < FAT_SMALLEST_CLUSTER {
                    return OperationStatus::Success;
                }
                st.chain_cursor = next;
            },
            TruncatePhase::EraseRange => {
                while st.chain_cursor < st.end_cluster {
                    let (sector, _) = vol.fat_position(st.chain_cursor);
                    match cache.get(dev, sector, CACHE_WRITE) {
                        SectorAccess::Hit(slot) => {
                            cache.buffer_mut(slot).fill(0);
                            st.chain_cursor += vol.fat_entries_per_sector();
                        }
                        SectorAccess::Pending => return OperationStatus::InProgress,
                        SectorAccess::Fatal => return OperationStatus::Fatal,
                    }
                }
                alloc.lower_allocation_hint(st.start_cluster);
                return OperationStatus::Success;
            }
            TruncatePhase::PrependToFreefile => {
                let ff = match freefile.as_deref_mut() {
                    Some(ff) => ff,
                    None => return OperationStatus::Failure,
                };
                return save_directory_entry(vol, cache, dev, ff, false);
            }
        }
    }
}

fn continue_close<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    file: &mut File,
    st: &mut CloseState,
) -> ArmOutcome {
    loop {
        match st.phase {
            ClosePhase::SaveEntry => {
                // Directories carry no size; only regular files rewrite
                // their entry with the logical byte count.
                if file.file_type == FileType::Normal {
                    match save_directory_entry(vol, cache, dev, file, false) {
                        OperationStatus::Success => {}
                        OperationStatus::InProgress => return ArmOutcome::Pending,
                        _ => {
                            // Fall through and release resources anyway;
                            // the handle must not leak.
                        }
                    }
                }
                st.phase = ClosePhase::Release;
            }
            ClosePhase::Release => {
                if file.mode & mode::RETAIN_DIRECTORY != 0 {
                    release_directory_sector(vol, cache, &file.entry_pos);
                }
                if let Some(slot) = file.locked_slot.take() {
                    cache.unlock_slot(slot as usize);
                }
                let callback = st.callback.take();
                *file = File::CLOSED;
                return ArmOutcome::Finish(callback.map(|cb| Fired::Flag(cb, true)));
            }
        }
    }
}

fn continue_unlink<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    alloc: &mut Allocator,
    mut freefile: Option<&mut File>,
    file: &mut File,
    st: &mut UnlinkState,
) -> ArmOutcome {
    loop {
        match &mut st.phase {
            UnlinkPhase::Truncate(truncate) => {
                match continue_truncate(
                    vol,
                    cache,
                    dev,
                    alloc,
                    freefile.as_deref_mut(),
                    file,
                    truncate,
                ) {
                    OperationStatus::Success => st.phase = UnlinkPhase::MarkDeleted,
                    OperationStatus::InProgress => return ArmOutcome::Pending,
                    _ => {
                        let callback = st.callback.take();
                        return ArmOutcome::Finish(callback.map(|cb| Fired::Flag(cb, false)));
                    }
                }
            }
            UnlinkPhase::MarkDeleted => {
                match mark_entry_deleted(vol, cache, dev, &file.entry_pos) {
                    OperationStatus::Success => {
                        if file.mode & mode::RETAIN_DIRECTORY != 0 {
                            release_directory_sector(vol, cache, &file.entry_pos);
                        }
                        if let Some(slot) = file.locked_slot.take() {
                            cache.unlock_slot(slot as usize);
                        }
                        let callback = st.callback.take();
                        *file = File::CLOSED;
                        return ArmOutcome::Finish(callback.map(|cb| Fired::Flag(cb, true)));
                    }
                    OperationStatus::InProgress => return ArmOutcome::Pending,
                    _ => {
                        let callback = st.callback.take();
                        return ArmOutcome::Finish(callback.map(|cb| Fired::Flag(cb, false)));
                    }
                }
            }
        }
    }
}

fn continue_init_subdirectory<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    alloc: &mut Allocator,
    freefile_extent: Option<(u32, u32)>,
    file: &mut File,
    st: &mut InitSubdirectoryState,
) -> ArmOutcome {
    loop {
        match &mut st.phase {
            SubdirPhase::Allocate(append) => {
                match continue_append_free_cluster(
                    vol,
                    cache,
                    dev,
                    alloc,
                    freefile_extent,
                    file,
                    append,
                ) {
                    OperationStatus::Success => st.phase = SubdirPhase::Zero { sector: 0 },
                    OperationStatus::InProgress => return ArmOutcome::Pending,
                    _ => {
                        let callback = st.callback.take();
                        *file = File::CLOSED;
                        return ArmOutcome::Finish(callback.map(|cb| Fired::File(cb, false)));
                    }
                }
            }
            SubdirPhase::Zero { sector } => {
                while (*sector as u32) < vol.sectors_per_cluster {
                    let physical = vol.cluster_to_sector(file.first_cluster) + *sector as u32;
                    match cache.get(dev, physical, CACHE_WRITE) {
                        SectorAccess::Hit(slot) => {
                            let buf = cache.buffer_mut(slot);
                            buf.fill(0);
                            if *sector == 0 {
                                let dot = DirEntryData {
                                    filename: *b".          ",
                                    attrib: ATTR_DIRECTORY,
                                    first_cluster: file.first_cluster,
                                    size: 0,
                                };
                                dot.encode_into(&mut buf[..DIR_ENTRY_SIZE]);
                                let dotdot = DirEntryData {
                                    filename: *b"..         ",
                                    attrib: ATTR_DIRECTORY,
                                    first_cluster: st.parent_cluster,
                                    size: 0,
                                };
                                dotdot.encode_into(&mut buf[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]);
                            }
                            *sector += 1;
                        }
                        SectorAccess::Pending => return ArmOutcome::Pending,
                        SectorAccess::Fatal => {
                            let callback = st.callback.take();
                            *file = File::CLOSED;
                            return ArmOutcome::Finish(callback.map(|cb| Fired::File(cb, false)));
                        }
                    }
                }
                let callback = st.callback.take();
                return ArmOutcome::Finish(callback.map(|cb| Fired::File(cb, true)));
            }
        }
    }
}
