use crate::blockdev::BlockDevice;
use crate::cache::{SectorAccess, SectorCache, CACHE_READ};
use crate::chain::{continue_free_space_search, fat_write_contiguous_chain, ClusterSearch, FreeSpaceSearch};
use crate::dir::{entry_bytes_offset, next_dir_entry, save_directory_entry, DirStep};
use crate::fat::{
    first_fat_partition_lba, filename_to_fat_style, parse_volume_id, DirEntryData, FatType, Volume,
    ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_LONG_NAME, ATTR_SYSTEM, ATTR_VOLUME, DIR_ENTRY_SIZE,
    FAT_DELETED_FILE_MARKER,
};
use crate::file::{
    mode, parse_mode, CloseState, ClosePhase, CreateFileState, CreatePhase, DirFinder, File,
    FileCallback, FileHandle, FileOperation, FileType, OperationCallback, UnlinkPhase, UnlinkState,
};
use crate::io;
use crate::ops::{self, Fired, OpStep};
use crate::FREEFILE_LEAVE_CLUSTERS;

/// Files a caller may hold open at once, not counting the freefile and the
/// working directory the filesystem keeps for itself.
pub const MAX_OPEN_FILES: usize = 3;

const FREEFILE_NAME: &str = "FREESPAC.E";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FilesystemState {
    Unknown,
    Fatal,
    Initialization,
    Ready,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperationStatus {
    InProgress,
    Success,
    Failure,
    Fatal,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

/// Result of advancing a directory finder.
#[derive(Clone, Copy, Debug)]
pub enum FindResult {
    Found(DirEntryData),
    End,
    InProgress,
}

/// Free-cluster allocation cursor and the sticky volume-full flag.
pub(crate) struct Allocator {
    pub last_cluster_allocated: u32,
    pub filesystem_full: bool,
}

impl Allocator {
    const fn new() -> Self {
        Self {
            last_cluster_allocated: 0,
            filesystem_full: false,
        }
    }

    /// Pull the search cursor back so freed clusters are found again.
    pub fn lower_allocation_hint(&mut self, cluster: u32) {
        if cluster >= crate::fat::FAT_SMALLEST_CLUSTER && self.last_cluster_allocated > cluster {
            self.last_cluster_allocated = cluster;
        }
    }
}

#[derive(Clone, Copy)]
enum InitPhase {
    ReadMbr,
    ReadVolumeId { partition_lba: u32 },
    FreefileCreating,
    FreefileFatSearch(FreeSpaceSearch),
    FreefileUpdateFat { cursor: u32, end: u32 },
    FreefileSaveDirEntry,
}

/// The filesystem engine. All long-running work is sliced into state
/// machines advanced by [`Filesystem::poll`]; no method blocks on the
/// medium.
pub struct Filesystem<D: BlockDevice> {
    device: D,
    cache: SectorCache,
    state: FilesystemState,
    init_phase: InitPhase,
    vol: Volume,
    alloc: Allocator,
    files: [File; MAX_OPEN_FILES],
    freefile: File,
    cwd: File,
}

impl<D: BlockDevice> Filesystem<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            cache: SectorCache::new(),
            state: FilesystemState::Unknown,
            init_phase: InitPhase::ReadMbr,
            vol: Volume::UNINIT,
            alloc: Allocator::new(),
            files: [File::CLOSED, File::CLOSED, File::CLOSED],
            freefile: File::CLOSED,
            cwd: File::CLOSED,
        }
    }

    /// Begin mounting. Poll until [`Filesystem::filesystem_state`] reports
    /// `Ready` (or `Fatal`).
    pub fn init(&mut self) {
        self.reset_state();
        self.state = FilesystemState::Initialization;
        self.init_phase = InitPhase::ReadMbr;
        self.poll();
    }

    /// Tear down. With `dirty` set, all buffered state is abandoned
    /// immediately (simulating power loss). Otherwise open files are
    /// closed and dirty sectors drained first; keep polling and calling
    /// until it returns true.
    pub fn destroy(&mut self, dirty: bool) -> bool {
        if dirty {
            self.reset_state();
            return true;
        }
        if self.state == FilesystemState::Ready {
            for i in 0..MAX_OPEN_FILES {
                if self.files[i].is_open() && !self.files[i].is_busy() {
                    self.files[i].op = FileOperation::Close(CloseState {
                        phase: ClosePhase::SaveEntry,
                        callback: None,
                    });
                }
            }
        }
        self.poll();
        let settled = !self.files.iter().any(|f| f.is_open() || f.is_busy())
            && !self.cache.has_dirty();
        if !settled {
            return false;
        }
        self.reset_state();
        true
    }

    /// Recover the block device, e.g. to remount after a simulated power
    /// interruption.
    pub fn into_device(self) -> D {
        self.device
    }

    fn reset_state(&mut self) {
        self.cache.reset();
        self.state = FilesystemState::Unknown;
        self.init_phase = InitPhase::ReadMbr;
        self.vol = Volume::UNINIT;
        self.alloc = Allocator::new();
        self.files = [File::CLOSED, File::CLOSED, File::CLOSED];
        self.freefile = File::CLOSED;
        self.cwd = File::CLOSED;
    }

    pub fn filesystem_state(&self) -> FilesystemState {
        self.state
    }

    pub fn is_full(&self) -> bool {
        self.alloc.filesystem_full
    }

    pub fn cluster_size(&self) -> u32 {
        self.vol.cluster_size()
    }

    pub fn supercluster_size(&self) -> u32 {
        self.vol.supercluster_size()
    }

    /// Bytes the freefile can still donate to contiguous-mode files.
    pub fn contiguous_free_space(&self) -> u32 {
        self.freefile.logical_size
    }

    /// Advance device I/O, the mount driver, queued file operations and
    /// the write-back of one dirty sector. The single place progress is
    /// made; call it from the application's main loop.
    pub fn poll(&mut self) {
        {
            let Self { device, cache, .. } = self;
            while let Some(event) = device.poll() {
                cache.handle_event(event);
            }
        }
        if self.cache.fatal() {
            self.enter_fatal();
            return;
        }
        if matches!(self.state, FilesystemState::Unknown | FilesystemState::Fatal) {
            return;
        }

        {
            let Self { device, cache, .. } = self;
            cache.flush(device);
        }

        match self.state {
            FilesystemState::Initialization => self.continue_mount(),
            FilesystemState::Ready => self.continue_file_operations(),
            _ => {}
        }

        if self.cache.fatal() {
            self.enter_fatal();
        }
    }

    fn enter_fatal(&mut self) {
        if self.state != FilesystemState::Fatal {
            log::error!("filesystem entered fatal state");
            self.state = FilesystemState::Fatal;
        }
    }

    fn continue_file_operations(&mut self) {
        for i in 0..MAX_OPEN_FILES {
            self.continue_one(i);
        }
    }

    fn continue_one(&mut self, index: usize) {
        let step = {
            let Self {
                vol,
                cache,
                device,
                alloc,
                files,
                cwd,
                freefile,
                ..
            } = self;
            if !files[index].is_busy() {
                return;
            }
            ops::continue_file_operation(
                vol,
                cache,
                device,
                alloc,
                cwd,
                Some(freefile),
                &mut files[index],
            )
        };
        if let OpStep::Done(fired) = step {
            Self::fire(fired, FileHandle(index as u8));
        }
    }

    fn fire(fired: Option<Fired>, handle: FileHandle) {
        match fired {
            Some(Fired::File(cb, ok)) => cb(ok.then_some(handle)),
            Some(Fired::Flag(cb, ok)) => cb(ok),
            None => {}
        }
    }

    // ---- mount ----------------------------------------------------------

    fn continue_mount(&mut self) {
        loop {
            let mut parked = false;
            let mut phase = self.init_phase;
            match &mut phase {
                InitPhase::ReadMbr => {
                    let Self { device, cache, .. } = self;
                    match cache.get(device, 0, CACHE_READ) {
                        SectorAccess::Hit(slot) => {
                            match first_fat_partition_lba(cache.buffer(slot)) {
                                Some(lba) => {
                                    log::debug!("mount: FAT partition at sector {}", lba);
                                    phase = InitPhase::ReadVolumeId { partition_lba: lba };
                                }
                                None => {
                                    log::error!("mount: no FAT partition in MBR");
                                    self.enter_fatal();
                                }
                            }
                        }
                        SectorAccess::Pending => parked = true,
                        SectorAccess::Fatal => self.enter_fatal(),
                    }
                }
                InitPhase::ReadVolumeId { partition_lba } => {
                    let lba = *partition_lba;
                    let Self { device, cache, .. } = self;
                    match cache.get(device, lba, CACHE_READ) {
                        SectorAccess::Hit(slot) => match parse_volume_id(lba, cache.buffer(slot)) {
                            Ok(vol) => {
                                log::info!(
                                    "mount: {:?}, {} clusters of {} bytes",
                                    vol.fat_type,
                                    vol.num_clusters,
                                    vol.cluster_size()
                                );
                                self.vol = vol;
                                self.cwd = Self::root_directory_file(&self.vol);
                                self.queue_freefile_create();
                                phase = InitPhase::FreefileCreating;
                            }
                            Err(err) => {
                                log::error!("mount: bad volume ID: {:?}", err);
                                self.enter_fatal();
                            }
                        },
                        SectorAccess::Pending => parked = true,
                        SectorAccess::Fatal => self.enter_fatal(),
                    }
                }
                InitPhase::FreefileCreating => {
                    if self.freefile.is_busy() {
                        let Self {
                            vol,
                            cache,
                            device,
                            alloc,
                            cwd,
                            freefile,
                            ..
                        } = self;
                        match ops::continue_file_operation(
                            vol, cache, device, alloc, cwd, None, freefile,
                        ) {
                            OpStep::Pending => parked = true,
                            OpStep::Done(_) => {}
                        }
                    }
                    if !parked {
                        if !self.freefile.is_open() {
                            log::error!("mount: could not open {}", FREEFILE_NAME);
                            self.enter_fatal();
                        } else if self.freefile.logical_size == 0 {
                            phase = InitPhase::FreefileFatSearch(FreeSpaceSearch::new());
                        } else {
                            log::info!(
                                "mount: freefile holds {} bytes",
                                self.freefile.logical_size
                            );
                            self.state = FilesystemState::Ready;
                        }
                    }
                }
                InitPhase::FreefileFatSearch(search) => {
                    let Self { vol, cache, device, .. } = self;
                    match continue_free_space_search(vol, cache, device, search) {
                        ClusterSearch::Found(_) => {
                            let entries = self.vol.fat_entries_per_sector();
                            let usable =
                                search.best_len.saturating_sub(FREEFILE_LEAVE_CLUSTERS);
                            let count = usable / entries * entries;
                            if count == 0 {
                                log::warn!("mount: volume too fragmented for a freefile");
                                self.state = FilesystemState::Ready;
                            } else {
                                let start = search.best_start;
                                self.freefile.first_cluster = start;
                                self.freefile.logical_size = count * self.vol.cluster_size();
                                self.freefile.physical_size = self.freefile.logical_size;
                                log::info!(
                                    "mount: freefile spans clusters {}..{}",
                                    start,
                                    start + count
                                );
                                let (first_fat_sector, _) = self.vol.fat_position(start);
                                self.device
                                    .begin_write_burst(first_fat_sector, count / entries);
                                phase = InitPhase::FreefileUpdateFat {
                                    cursor: start,
                                    end: start + count,
                                };
                            }
                        }
                        ClusterSearch::Pending => parked = true,
                        _ => self.enter_fatal(),
                    }
                }
                InitPhase::FreefileUpdateFat { cursor, end } => {
                    let end = *end;
                    let Self { vol, cache, device, .. } = self;
                    match fat_write_contiguous_chain(vol, cache, device, cursor, end) {
                        OperationStatus::Success => {
                            self.device.end_write_burst();
                            phase = InitPhase::FreefileSaveDirEntry;
                        }
                        OperationStatus::InProgress => parked = true,
                        _ => self.enter_fatal(),
                    }
                }
                InitPhase::FreefileSaveDirEntry => {
                    let Self {
                        vol,
                        cache,
                        device,
                        freefile,
                        ..
                    } = self;
                    match save_directory_entry(vol, cache, device, freefile, false) {
                        OperationStatus::Success => {
                            log::info!("mount: ready");
                            self.state = FilesystemState::Ready;
                        }
                        OperationStatus::InProgress => parked = true,
                        _ => self.enter_fatal(),
                    }
                }
            }
            self.init_phase = phase;
            if parked || self.state != FilesystemState::Initialization {
                return;
            }
        }
    }

    fn root_directory_file(vol: &Volume) -> File {
        let mut root = File::CLOSED;
        root.file_type = match vol.fat_type {
            FatType::Fat16 => FileType::Fat16Root,
            FatType::Fat32 => FileType::Directory,
        };
        root.mode = mode::READ | mode::WRITE;
        root.first_cluster = vol.root_dir_cluster;
        root.cursor_cluster = vol.root_dir_cluster;
        root
    }

    fn queue_freefile_create(&mut self) {
        let mut freefile = File::CLOSED;
        freefile.file_type = FileType::Normal;
        freefile.mode = mode::CREATE | mode::RETAIN_DIRECTORY;
        freefile.entry = DirEntryData {
            filename: filename_to_fat_style(FREEFILE_NAME),
            attrib: ATTR_SYSTEM,
            first_cluster: 0,
            size: 0,
        };
        freefile.op = FileOperation::CreateFile(CreateFileState {
            phase: CreatePhase::FindFile(DirFinder::begin(self.cwd.first_cluster)),
            callback: None,
        });
        self.freefile = freefile;
    }

    // ---- files ----------------------------------------------------------

    fn file_index(&self, handle: FileHandle) -> Option<usize> {
        let index = handle.0 as usize;
        (index < MAX_OPEN_FILES).then_some(index)
    }

    pub fn file_is_open(&self, handle: FileHandle) -> bool {
        self.file_index(handle)
            .map(|i| self.files[i].is_open())
            .unwrap_or(false)
    }

    pub fn file_is_busy(&self, handle: FileHandle) -> bool {
        self.file_index(handle)
            .map(|i| self.files[i].is_busy())
            .unwrap_or(false)
    }

    pub fn file_is_directory(&self, handle: FileHandle) -> bool {
        self.file_index(handle)
            .map(|i| self.files[i].is_directory())
            .unwrap_or(false)
    }

    /// Queue an open/create. The returned handle is already allocated but
    /// not usable until the operation finishes; poll until the file is no
    /// longer busy, or supply a callback. A failed open releases the
    /// handle (it stops reporting open).
    pub fn fopen(
        &mut self,
        filename: &str,
        mode_str: &str,
        callback: Option<FileCallback>,
    ) -> Option<FileHandle> {
        let flags = parse_mode(mode_str)?;
        self.open_internal(filename, flags, FileType::Normal, ATTR_ARCHIVE, callback)
    }

    /// Create (or open) a subdirectory of the current directory. Close the
    /// returned handle when done with it; `chdir` keeps its own copy.
    pub fn mkdir(&mut self, name: &str, callback: Option<FileCallback>) -> Option<FileHandle> {
        self.open_internal(
            name,
            mode::READ | mode::WRITE | mode::CREATE,
            FileType::Directory,
            ATTR_DIRECTORY,
            callback,
        )
    }

    fn open_internal(
        &mut self,
        filename: &str,
        flags: u8,
        file_type: FileType,
        attrib: u8,
        callback: Option<FileCallback>,
    ) -> Option<FileHandle> {
        if self.state != FilesystemState::Ready || filename.is_empty() {
            return None;
        }
        let index = self.files.iter().position(|f| !f.is_open())?;

        let file = &mut self.files[index];
        *file = File::CLOSED;
        file.file_type = file_type;
        file.mode = flags;
        file.entry = DirEntryData {
            filename: filename_to_fat_style(filename),
            attrib,
            first_cluster: 0,
            size: 0,
        };
        file.op = FileOperation::CreateFile(CreateFileState {
            phase: CreatePhase::FindFile(DirFinder::begin(self.cwd.first_cluster)),
            callback,
        });

        self.continue_one(index);
        Some(FileHandle(index as u8))
    }

    /// Queue a close. Returns false when the file is unknown or busy.
    pub fn fclose(&mut self, handle: FileHandle, callback: Option<OperationCallback>) -> bool {
        if self.state != FilesystemState::Ready {
            return false;
        }
        let Some(index) = self.file_index(handle) else {
            return false;
        };
        if !self.files[index].is_open() || self.files[index].is_busy() {
            return false;
        }
        self.files[index].op = FileOperation::Close(CloseState {
            phase: ClosePhase::SaveEntry,
            callback,
        });
        self.continue_one(index);
        true
    }

    /// Queue deletion of an open file: its clusters are released and its
    /// directory entry marked deleted, then the handle is freed.
    pub fn funlink(&mut self, handle: FileHandle, callback: Option<OperationCallback>) -> bool {
        if self.state != FilesystemState::Ready {
            return false;
        }
        let Some(index) = self.file_index(handle) else {
            return false;
        };
        if !self.files[index].is_open() || self.files[index].is_busy() {
            return false;
        }
        if !self.files[index].entry_pos.has_entry() {
            return false;
        }
        let truncate = {
            let Self { vol, cache, files, .. } = self;
            ops::queue_truncate_state(vol, cache, &mut files[index], None)
        };
        self.files[index].op = FileOperation::Unlink(UnlinkState {
            phase: UnlinkPhase::Truncate(truncate),
            callback,
        });
        self.continue_one(index);
        true
    }

    /// Queue truncation to zero length.
    pub fn ftruncate(&mut self, handle: FileHandle, callback: Option<FileCallback>) -> bool {
        if self.state != FilesystemState::Ready {
            return false;
        }
        let Some(index) = self.file_index(handle) else {
            return false;
        };
        let file = &self.files[index];
        if !file.is_open() || file.is_busy() || file.is_directory() {
            return false;
        }
        if file.mode & (mode::WRITE | mode::APPEND) == 0 {
            return false;
        }
        let truncate = {
            let Self { vol, cache, files, .. } = self;
            ops::queue_truncate_state(vol, cache, &mut files[index], callback)
        };
        self.files[index].op = FileOperation::Truncate(truncate);
        self.continue_one(index);
        true
    }

    pub fn fwrite(&mut self, handle: FileHandle, data: &[u8]) -> usize {
        if self.state != FilesystemState::Ready {
            return 0;
        }
        let Some(index) = self.file_index(handle) else {
            return 0;
        };
        let Self {
            vol,
            cache,
            device,
            alloc,
            files,
            freefile,
            ..
        } = self;
        io::fwrite_impl(vol, cache, device, alloc, freefile, &mut files[index], data)
    }

    pub fn fread(&mut self, handle: FileHandle, out: &mut [u8]) -> usize {
        if self.state != FilesystemState::Ready {
            return 0;
        }
        let Some(index) = self.file_index(handle) else {
            return 0;
        };
        let Self {
            vol,
            cache,
            device,
            files,
            ..
        } = self;
        io::fread_impl(vol, cache, device, &mut files[index], out)
    }

    /// Reposition the cursor. `Cur` and `End` are rebased to an absolute
    /// offset; a target past the end of the file parks the cursor at the
    /// end. May queue a chain walk, reported as `InProgress`.
    pub fn fseek(&mut self, handle: FileHandle, offset: i32, whence: SeekWhence) -> OperationStatus {
        if self.state != FilesystemState::Ready {
            return OperationStatus::Failure;
        }
        let Some(index) = self.file_index(handle) else {
            return OperationStatus::Failure;
        };
        if !self.files[index].is_open() || self.files[index].is_busy() {
            return OperationStatus::Failure;
        }
        let file_offset = self.files[index].cursor_offset;
        let logical = self.files[index].logical_size;
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Cur => file_offset as i64,
            SeekWhence::End => logical as i64,
        };
        let target = base + offset as i64;
        if target < 0 {
            return OperationStatus::Failure;
        }
        let Self {
            vol,
            cache,
            device,
            files,
            ..
        } = self;
        io::fseek_impl(vol, cache, device, &mut files[index], target as u32)
    }

    /// Cursor position, available whenever no operation is queued.
    pub fn ftell(&self, handle: FileHandle) -> Option<u32> {
        let index = self.file_index(handle)?;
        let file = &self.files[index];
        (file.is_open() && !file.is_busy()).then_some(file.cursor_offset)
    }

    pub fn feof(&self, handle: FileHandle) -> bool {
        self.file_index(handle)
            .map(|i| {
                let file = &self.files[i];
                file.cursor_offset >= file.logical_size
            })
            .unwrap_or(true)
    }

    // ---- directories ----------------------------------------------------

    /// Make the given open directory handle the working directory, or the
    /// root when `None`. The filesystem keeps a copy; the handle may be
    /// closed afterwards.
    pub fn chdir(&mut self, directory: Option<FileHandle>) -> bool {
        match directory {
            None => {
                if self.state != FilesystemState::Ready {
                    return false;
                }
                self.cwd = Self::root_directory_file(&self.vol);
                true
            }
            Some(handle) => {
                let Some(index) = self.file_index(handle) else {
                    return false;
                };
                let file = &self.files[index];
                if !file.is_directory() || file.is_busy() {
                    return false;
                }
                self.cwd = file.clone_position();
                true
            }
        }
    }

    /// Begin iterating a directory (the working directory when `None`).
    pub fn find_first(&mut self, directory: Option<FileHandle>, finder: &mut DirFinder) -> bool {
        if self.state != FilesystemState::Ready {
            return false;
        }
        let dir = match self.resolve_directory(directory) {
            Some(dir) => dir,
            None => return false,
        };
        if dir.is_busy() {
            return false;
        }
        *finder = DirFinder::begin(dir.first_cluster);
        true
    }

    /// Yield the next live entry, skipping deleted entries and long-name
    /// fragments. Entries are returned by value; nothing borrows the cache
    /// across calls.
    pub fn find_next(
        &mut self,
        directory: Option<FileHandle>,
        finder: &mut DirFinder,
    ) -> FindResult {
        if self.state != FilesystemState::Ready {
            return FindResult::End;
        }
        let Self {
            vol,
            cache,
            device,
            files,
            cwd,
            ..
        } = self;
        let dir: &File = match directory {
            None => cwd,
            Some(handle) => {
                let index = handle.0 as usize;
                if index >= MAX_OPEN_FILES || !files[index].is_directory() {
                    return FindResult::End;
                }
                &files[index]
            }
        };

        loop {
            match next_dir_entry(vol, cache, device, dir.file_type, finder) {
                DirStep::Entry(slot) => {
                    let offset = entry_bytes_offset(finder);
                    let raw = &cache.buffer(slot)[offset..offset + DIR_ENTRY_SIZE];
                    if raw[0] == 0x00 {
                        finder.finished = true;
                        return FindResult::End;
                    }
                    if raw[0] == FAT_DELETED_FILE_MARKER {
                        continue;
                    }
                    let entry = DirEntryData::decode(raw);
                    if entry.attrib == ATTR_LONG_NAME || entry.attrib & ATTR_VOLUME != 0 {
                        continue;
                    }
                    return FindResult::Found(entry);
                }
                DirStep::End => return FindResult::End,
                DirStep::Pending => return FindResult::InProgress,
                DirStep::Fatal => return FindResult::End,
            }
        }
    }

    fn resolve_directory(&self, directory: Option<FileHandle>) -> Option<&File> {
        match directory {
            None => Some(&self.cwd),
            Some(handle) => {
                let index = self.file_index(handle)?;
                let file = &self.files[index];
                file.is_directory().then_some(file)
            }
        }
    }

    /// Push one dirty unlocked sector towards the medium. True only when
    /// none remain; in-flight writes still need polls to land.
    pub fn flush(&mut self) -> bool {
        let Self { device, cache, .. } = self;
        cache.flush(device)
    }
}
