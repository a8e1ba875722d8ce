use crate::blockdev::BlockDevice;
use crate::cache::{
    SectorAccess, SectorCache, CACHE_DISCARDABLE, CACHE_READ, CACHE_WRITE,
};
use crate::fat::{Volume, FAT_SMALLEST_CLUSTER};
use crate::fs::OperationStatus;

pub(crate) enum ChainStep {
    Next(u32),
    Pending,
    Fatal,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClusterCondition {
    Free,
    Occupied,
    FreeAtFatSectorBoundary,
}

pub(crate) enum ClusterSearch {
    Found(u32),
    NotFound,
    Pending,
    Fatal,
}

/// Read the FAT entry for `cluster` through the cache. The caller
/// interprets the value with the volume's free / end-of-chain predicates.
pub(crate) fn fat_get_next_cluster<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    cluster: u32,
) -> ChainStep {
    let (sector, offset) = vol.fat_position(cluster);
    match cache.get(dev, sector, CACHE_READ) {
        SectorAccess::Hit(slot) => ChainStep::Next(vol.decode_fat_entry(cache.buffer(slot), offset)),
        SectorAccess::Pending => ChainStep::Pending,
        SectorAccess::Fatal => ChainStep::Fatal,
    }
}

/// Read-modify-write the FAT entry for `cluster`. Only FAT 0 is written;
/// mirror maintenance is out of scope.
pub(crate) fn fat_set_next_cluster<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    cluster: u32,
    next: u32,
) -> OperationStatus {
    let (sector, offset) = vol.fat_position(cluster);
    match cache.get(dev, sector, CACHE_READ | CACHE_WRITE) {
        SectorAccess::Hit(slot) => {
            vol.encode_fat_entry(cache.buffer_mut(slot), offset, next);
            OperationStatus::Success
        }
        SectorAccess::Pending => OperationStatus::InProgress,
        SectorAccess::Fatal => OperationStatus::Fatal,
    }
}

fn align_up(cluster: u32, stride: u32) -> u32 {
    cluster.div_ceil(stride) * stride
}

/// Scan forward from `*cluster` for the first cluster satisfying `cond`,
/// leaving the cursor on the match. The freefile's cluster range is skipped
/// wholesale. FAT sectors touched by the scan are hinted discardable so the
/// sweep does not evict hot directory or data sectors.
///
/// `NotFound` leaves the cursor at or beyond the end of the volume, which
/// lets hole-growing callers treat end-of-volume as an occupied boundary.
pub(crate) fn find_cluster_with_condition<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    freefile_extent: Option<(u32, u32)>,
    cond: ClusterCondition,
    cluster: &mut u32,
) -> ClusterSearch {
    let entries = vol.fat_entries_per_sector();
    let limit = vol.last_cluster_exclusive();
    let boundary = cond == ClusterCondition::FreeAtFatSectorBoundary;

    if boundary {
        *cluster = align_up(*cluster, entries);
    }

    loop {
        if let Some((start, end)) = freefile_extent {
            if *cluster >= start && *cluster < end {
                *cluster = if boundary { align_up(end, entries) } else { end };
            }
        }
        if *cluster >= limit {
            return ClusterSearch::NotFound;
        }

        let (sector, _) = vol.fat_position(*cluster);
        let slot = match cache.get(dev, sector, CACHE_READ | CACHE_DISCARDABLE) {
            SectorAccess::Hit(slot) => slot,
            SectorAccess::Pending => return ClusterSearch::Pending,
            SectorAccess::Fatal => return ClusterSearch::Fatal,
        };

        // Consume every entry the cached sector can answer before touching
        // the cache again.
        let sector_base = (*cluster / entries) * entries;
        loop {
            if *cluster >= limit {
                return ClusterSearch::NotFound;
            }
            if let Some((start, end)) = freefile_extent {
                if *cluster >= start && *cluster < end {
                    *cluster = if boundary { align_up(end, entries) } else { end };
                    break;
                }
            }
            if *cluster - sector_base >= entries {
                break;
            }

            let (_, offset) = vol.fat_position(*cluster);
            let entry = vol.decode_fat_entry(cache.buffer(slot), offset);
            let matched = match cond {
                ClusterCondition::Free | ClusterCondition::FreeAtFatSectorBoundary => {
                    vol.is_free_cluster(entry)
                }
                ClusterCondition::Occupied => !vol.is_free_cluster(entry),
            };
            if matched {
                return ClusterSearch::Found(*cluster);
            }
            *cluster += if boundary { entries } else { 1 };
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchPhase {
    FindHole,
    GrowHole,
}

/// Progress of the largest-contiguous-hole sweep run at mount time.
#[derive(Clone, Copy)]
pub(crate) struct FreeSpaceSearch {
    pub candidate_start: u32,
    pub candidate_end: u32,
    pub best_start: u32,
    pub best_len: u32,
    pub phase: SearchPhase,
}

impl FreeSpaceSearch {
    pub fn new() -> Self {
        Self {
            candidate_start: FAT_SMALLEST_CLUSTER,
            candidate_end: FAT_SMALLEST_CLUSTER,
            best_start: 0,
            best_len: 0,
            phase: SearchPhase::FindHole,
        }
    }
}

/// Advance the hole search. `Found(start)` reports the completed sweep with
/// the best gap recorded in the state (length possibly zero); holes open
/// and close on FAT-sector boundaries so the winner owns its FAT sectors
/// outright.
pub(crate) fn continue_free_space_search<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    st: &mut FreeSpaceSearch,
) -> ClusterSearch {
    let entries = vol.fat_entries_per_sector();
    let limit = vol.last_cluster_exclusive();

    loop {
        match st.phase {
            SearchPhase::FindHole => {
                match find_cluster_with_condition(
                    vol,
                    cache,
                    dev,
                    None,
                    ClusterCondition::FreeAtFatSectorBoundary,
                    &mut st.candidate_start,
                ) {
                    ClusterSearch::Found(start) => {
                        st.candidate_start = start;
                        st.candidate_end = start;
                        st.phase = SearchPhase::GrowHole;
                    }
                    ClusterSearch::NotFound => return ClusterSearch::Found(st.best_start),
                    ClusterSearch::Pending => return ClusterSearch::Pending,
                    ClusterSearch::Fatal => return ClusterSearch::Fatal,
                }
            }
            SearchPhase::GrowHole => {
                match find_cluster_with_condition(
                    vol,
                    cache,
                    dev,
                    None,
                    ClusterCondition::Occupied,
                    &mut st.candidate_end,
                ) {
                    ClusterSearch::Found(_) | ClusterSearch::NotFound => {
                        let end = st.candidate_end.min(limit);
                        let len = end - st.candidate_start;
                        if len > st.best_len {
                            st.best_start = st.candidate_start;
                            st.best_len = len;
                        }
                        st.candidate_start = align_up(end, entries);
                        st.candidate_end = st.candidate_start;
                        st.phase = SearchPhase::FindHole;
                    }
                    ClusterSearch::Pending => return ClusterSearch::Pending,
                    ClusterSearch::Fatal => return ClusterSearch::Fatal,
                }
            }
        }
    }
}

/// Overwrite the FAT over `[*cursor, end)` with a contiguous chain, ending
/// in an end-of-chain marker. The range covers whole FAT sectors, so each
/// sector is rewritten outright with no read-modify-write. Advances
/// `*cursor` one FAT sector per cache hit.
pub(crate) fn fat_write_contiguous_chain<D: BlockDevice>(
    vol: &Volume,
    cache: &mut SectorCache,
    dev: &mut D,
    cursor: &mut u32,
    end: u32,
) -> OperationStatus {
    let entries = vol.fat_entries_per_sector();

    while *cursor < end {
        let (sector, _) = vol.fat_position(*cursor);
        let slot = match cache.get(dev, sector, CACHE_WRITE) {
            SectorAccess::Hit(slot) => slot,
            SectorAccess::Pending => return OperationStatus::InProgress,
            SectorAccess::Fatal => return OperationStatus::Fatal,
        };
        let base = (*cursor / entries) * entries;
        let eoc = vol.end_of_chain_marker();
        let entry_width = match vol.fat_type {
            crate::fat::FatType::Fat16 => 2usize,
            crate::fat::FatType::Fat32 => 4usize,
        };
        let buf = cache.buffer_mut(slot);
        for k in 0..entries {
            let c = base + k;
            let value = if c + 1 == end { eoc } else { c + 1 };
            vol.encode_fresh_fat_entry(buf, k as usize * entry_width, value);
        }
        *cursor = base + entries;
    }
    OperationStatus::Success
}
