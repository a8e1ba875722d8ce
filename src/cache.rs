use crate::blockdev::{BlockDevice, BlockEvent, SECTOR_SIZE};

pub(crate) const CACHE_SECTORS: usize = 8;

pub(crate) const CACHE_READ: u8 = 1 << 0;
pub(crate) const CACHE_WRITE: u8 = 1 << 1;
pub(crate) const CACHE_LOCK: u8 = 1 << 2;
pub(crate) const CACHE_UNLOCK: u8 = 1 << 3;
pub(crate) const CACHE_DISCARDABLE: u8 = 1 << 4;
pub(crate) const CACHE_RETAIN: u8 = 1 << 5;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SlotState {
    Empty,
    Reading,
    InSync,
    Dirty,
    Writing,
}

#[derive(Clone, Copy)]
struct SlotDescriptor {
    sector: u32,
    state: SlotState,
    last_use: u32,
    locked: bool,
    retain_count: u8,
    discardable: bool,
}

impl SlotDescriptor {
    const EMPTY: Self = Self {
        sector: 0,
        state: SlotState::Empty,
        last_use: 0,
        locked: false,
        retain_count: 0,
        discardable: false,
    };
}

/// Outcome of a cache request. On `Hit` the slot's buffer stays valid until
/// the next call into the cache.
pub(crate) enum SectorAccess {
    Hit(usize),
    Pending,
    Fatal,
}

/// Fixed pool of sector buffers between the filesystem and the block
/// device. Reads populate a slot asynchronously; writes are buffered until
/// `flush` pushes them out, one transfer at a time.
pub(crate) struct SectorCache {
    buffers: [[u8; SECTOR_SIZE]; CACHE_SECTORS],
    slots: [SlotDescriptor; CACHE_SECTORS],
    use_counter: u32,
    dirty_count: u8,
    fatal: bool,
}

impl SectorCache {
    pub fn new() -> Self {
        Self {
            buffers: [[0; SECTOR_SIZE]; CACHE_SECTORS],
            slots: [SlotDescriptor::EMPTY; CACHE_SECTORS],
            use_counter: 0,
            dirty_count: 0,
            fatal: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn fatal(&self) -> bool {
        self.fatal
    }

    pub fn buffer(&self, slot: usize) -> &[u8; SECTOR_SIZE] {
        &self.buffers[slot]
    }

    pub fn buffer_mut(&mut self, slot: usize) -> &mut [u8; SECTOR_SIZE] {
        &mut self.buffers[slot]
    }

    pub fn slot_sector(&self, slot: usize) -> u32 {
        self.slots[slot].sector
    }

    /// Request `sector` with the given flag set. Never blocks: a miss that
    /// cannot be served right now (device busy, read outstanding, or every
    /// slot pinned) reports `Pending` and the caller retries after a poll.
    pub fn get<D: BlockDevice>(&mut self, dev: &mut D, sector: u32, flags: u8) -> SectorAccess {
        if flags & CACHE_WRITE != 0 && sector == 0 {
            // Writing the MBR would brick the volume; treat as a driver bug.
            log::error!("cache: rejected write to sector 0");
            self.fatal = true;
            return SectorAccess::Fatal;
        }

        let slot = match self.find_or_allocate(sector, flags) {
            Some(slot) => slot,
            None => return SectorAccess::Pending,
        };

        self.use_counter += 1;
        self.slots[slot].last_use = self.use_counter;

        match self.slots[slot].state {
            SlotState::Empty => {
                if flags & CACHE_READ != 0 {
                    if dev.start_read(sector, slot as u8) {
                        self.slots[slot].state = SlotState::Reading;
                    }
                    return SectorAccess::Pending;
                }
                // Write without read: the caller supplies the whole sector,
                // whatever was on the medium is irrelevant.
                self.slots[slot].state = SlotState::Dirty;
                self.dirty_count += 1;
                self.apply_pin_flags(slot, flags);
                SectorAccess::Hit(slot)
            }
            SlotState::Reading => SectorAccess::Pending,
            SlotState::InSync | SlotState::Writing => {
                if flags & CACHE_WRITE != 0 {
                    // Dirtying a slot mid-write leaves it Dirty when the
                    // write completes, forcing a second write cycle.
                    self.slots[slot].state = SlotState::Dirty;
                    self.dirty_count += 1;
                }
                self.apply_pin_flags(slot, flags);
                SectorAccess::Hit(slot)
            }
            SlotState::Dirty => {
                self.apply_pin_flags(slot, flags);
                SectorAccess::Hit(slot)
            }
        }
    }

    fn apply_pin_flags(&mut self, slot: usize, flags: u8) {
        if flags & CACHE_LOCK != 0 {
            self.slots[slot].locked = true;
        }
        if flags & CACHE_UNLOCK != 0 {
            self.slots[slot].locked = false;
        }
        if flags & CACHE_RETAIN != 0 {
            self.slots[slot].retain_count = self.slots[slot].retain_count.saturating_add(1);
        }
    }

    /// Locate the slot already holding `sector`, or claim a victim for it.
    /// Victim preference: an empty slot, then a clean discardable slot,
    /// then the oldest in-sync slot that is neither locked nor retained.
    fn find_or_allocate(&mut self, sector: u32, flags: u8) -> Option<usize> {
        let mut empty = None;
        let mut discardable = None;
        let mut oldest = None;
        let mut oldest_age = u32::MAX;

        for (i, slot) in self.slots.iter().enumerate() {
            if slot.state != SlotState::Empty && slot.sector == sector {
                return Some(i);
            }
            match slot.state {
                SlotState::Empty => {
                    if empty.is_none() {
                        empty = Some(i);
                    }
                }
                SlotState::InSync if !slot.locked && slot.retain_count == 0 => {
                    if slot.discardable {
                        discardable = Some(i);
                    } else if slot.last_use < oldest_age {
                        oldest_age = slot.last_use;
                        oldest = Some(i);
                    }
                }
                _ => {}
            }
        }

        let victim = empty.or(discardable).or(oldest)?;
        self.slots[victim] = SlotDescriptor {
            sector,
            state: SlotState::Empty,
            last_use: self.use_counter,
            locked: false,
            retain_count: 0,
            // Honoured only here, on first population.
            discardable: flags & CACHE_DISCARDABLE != 0,
        };
        Some(victim)
    }

    /// Transition an in-sync slot to dirty without going through `get`.
    pub fn mark_dirty(&mut self, slot: usize) {
        match self.slots[slot].state {
            SlotState::InSync | SlotState::Writing => {
                self.slots[slot].state = SlotState::Dirty;
                self.dirty_count += 1;
            }
            SlotState::Dirty => {}
            _ => {
                self.fatal = true;
            }
        }
    }

    pub fn unlock_slot(&mut self, slot: usize) {
        self.slots[slot].locked = false;
    }

    /// Drop one retain on the slot holding `sector`, if it is still
    /// resident. Retained slots cannot be evicted, so a missing slot means
    /// the retain was already released.
    pub fn release_retain(&mut self, sector: u32) {
        for slot in self.slots.iter_mut() {
            if slot.state != SlotState::Empty && slot.sector == sector {
                slot.retain_count = slot.retain_count.saturating_sub(1);
                return;
            }
        }
    }

    /// Start a write for at most one dirty unlocked slot. Returns true only
    /// when no dirty unlocked slot remains.
    pub fn flush<D: BlockDevice>(&mut self, dev: &mut D) -> bool {
        for i in 0..CACHE_SECTORS {
            if self.slots[i].state == SlotState::Dirty && !self.slots[i].locked {
                if dev.start_write(self.slots[i].sector, &self.buffers[i], i as u8) {
                    self.slots[i].state = SlotState::Writing;
                    self.dirty_count -= 1;
                }
                return false;
            }
        }
        true
    }

    pub fn has_dirty(&self) -> bool {
        self.dirty_count > 0 || self.slots.iter().any(|s| s.state == SlotState::Writing)
    }

    /// Feed a device completion back into the owning slot. Completions are
    /// matched by (sector, tag); a mismatch means the slot was recycled
    /// since the transfer was issued and the event is ignored.
    pub fn handle_event(&mut self, event: BlockEvent<'_>) {
        match event {
            BlockEvent::ReadComplete {
                sector,
                tag,
                data,
                success,
            } => {
                let i = tag as usize;
                if i >= CACHE_SECTORS || self.slots[i].sector != sector {
                    return;
                }
                if !success {
                    self.fatal = true;
                    return;
                }
                if self.slots[i].state != SlotState::Reading {
                    // A completion for a slot we never put into Reading
                    // means the descriptors and the device disagree.
                    self.fatal = true;
                    return;
                }
                self.buffers[i] = *data;
                self.slots[i].state = SlotState::InSync;
            }
            BlockEvent::WriteComplete {
                sector,
                tag,
                success,
            } => {
                let i = tag as usize;
                if i >= CACHE_SECTORS || self.slots[i].sector != sector {
                    return;
                }
                if !success {
                    self.fatal = true;
                    return;
                }
                match self.slots[i].state {
                    SlotState::Writing => self.slots[i].state = SlotState::InSync,
                    // Re-dirtied while the write was in flight; the newer
                    // content goes out on a later flush.
                    SlotState::Dirty => {}
                    _ => self.fatal = true,
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot].state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{get_settled, RamDevice};

    fn pump(cache: &mut SectorCache, dev: &mut RamDevice) {
        while let Some(ev) = dev.poll() {
            cache.handle_event(ev);
        }
    }

    #[test]
    fn read_through_and_hit() {
        let mut dev = RamDevice::new(64);
        dev.sectors[5][0] = 0xAB;
        let mut cache = SectorCache::new();

        assert!(matches!(
            cache.get(&mut dev, 5, CACHE_READ),
            SectorAccess::Pending
        ));
        pump(&mut cache, &mut dev);
        let slot = match cache.get(&mut dev, 5, CACHE_READ) {
            SectorAccess::Hit(slot) => slot,
            _ => panic!("expected hit after completion"),
        };
        assert_eq!(cache.buffer(slot)[0], 0xAB);
        assert_eq!(dev.reads, 1);

        // Second access is served without device traffic.
        get_settled(&mut cache, &mut dev, 5, CACHE_READ);
        assert_eq!(dev.reads, 1);
    }

    #[test]
    fn write_only_population_skips_the_read() {
        let mut dev = RamDevice::new(64);
        let mut cache = SectorCache::new();
        let slot = get_settled(&mut cache, &mut dev, 9, CACHE_WRITE);
        cache.buffer_mut(slot).fill(0x77);
        assert_eq!(dev.reads, 0);
        assert_eq!(cache.slot_state(slot), SlotState::Dirty);

        while !cache.flush(&mut dev) {
            pump(&mut cache, &mut dev);
        }
        assert_eq!(dev.sectors[9][511], 0x77);
        assert_eq!(cache.slot_state(slot), SlotState::InSync);
    }

    #[test]
    fn mbr_write_is_fatal() {
        let mut dev = RamDevice::new(64);
        let mut cache = SectorCache::new();
        assert!(matches!(
            cache.get(&mut dev, 0, CACHE_READ | CACHE_WRITE),
            SectorAccess::Fatal
        ));
        assert!(cache.fatal());
    }

    #[test]
    fn redirty_during_write_forces_second_cycle() {
        let mut dev = RamDevice::new(64);
        let mut cache = SectorCache::new();
        let slot = get_settled(&mut cache, &mut dev, 3, CACHE_WRITE);
        cache.buffer_mut(slot).fill(1);

        assert!(!cache.flush(&mut dev));
        assert_eq!(cache.slot_state(slot), SlotState::Writing);

        // New write lands while the first transfer is still in flight.
        let slot2 = get_settled(&mut cache, &mut dev, 3, CACHE_WRITE);
        assert_eq!(slot, slot2);
        cache.buffer_mut(slot2).fill(2);
        assert_eq!(cache.slot_state(slot), SlotState::Dirty);

        pump(&mut cache, &mut dev);
        // Completion of the stale write must not mark the slot clean.
        assert_eq!(cache.slot_state(slot), SlotState::Dirty);
        assert_eq!(dev.sectors[3][0], 1);

        while !cache.flush(&mut dev) {
            pump(&mut cache, &mut dev);
        }
        assert_eq!(dev.sectors[3][0], 2);
    }

    #[test]
    fn eviction_prefers_discardable_then_oldest() {
        let mut dev = RamDevice::new(512);
        let mut cache = SectorCache::new();

        // Fill all slots; sector 20 is discardable, the rest are plain.
        let disc = get_settled(&mut cache, &mut dev, 20, CACHE_READ | CACHE_DISCARDABLE);
        for s in 1..CACHE_SECTORS as u32 {
            get_settled(&mut cache, &mut dev, s, CACHE_READ);
        }

        let newcomer = get_settled(&mut cache, &mut dev, 100, CACHE_READ);
        assert_eq!(newcomer, disc);
        assert_eq!(cache.slot_sector(newcomer), 100);

        // No discardable left: the oldest in-sync slot (sector 1) goes.
        let oldest = get_settled(&mut cache, &mut dev, 101, CACHE_READ);
        assert_eq!(cache.slot_sector(oldest), 101);
        for s in 2..CACHE_SECTORS as u32 {
            // Everything younger must still be resident.
            assert!(matches!(
                cache.get(&mut dev, s, CACHE_READ),
                SectorAccess::Hit(_)
            ));
        }
    }

    #[test]
    fn locked_and_retained_slots_resist_eviction() {
        let mut dev = RamDevice::new(512);
        let mut cache = SectorCache::new();

        get_settled(&mut cache, &mut dev, 10, CACHE_READ | CACHE_LOCK);
        get_settled(&mut cache, &mut dev, 11, CACHE_READ | CACHE_RETAIN);
        for s in 12..18 {
            get_settled(&mut cache, &mut dev, s, CACHE_READ | CACHE_LOCK);
        }

        // Every slot pinned: a new sector cannot be admitted.
        assert!(matches!(
            cache.get(&mut dev, 200, CACHE_READ),
            SectorAccess::Pending
        ));

        cache.release_retain(11);
        let slot = get_settled(&mut cache, &mut dev, 200, CACHE_READ);
        assert_eq!(cache.slot_sector(slot), 200);
    }

    #[test]
    fn locked_slot_is_not_flushed() {
        let mut dev = RamDevice::new(64);
        let mut cache = SectorCache::new();
        let locked = get_settled(&mut cache, &mut dev, 7, CACHE_WRITE | CACHE_LOCK);
        cache.buffer_mut(locked).fill(9);

        // Only the locked slot is dirty, so flush reports quiescence.
        assert!(cache.flush(&mut dev));
        assert_eq!(dev.writes, 0);

        cache.unlock_slot(locked);
        while !cache.flush(&mut dev) {
            pump(&mut cache, &mut dev);
        }
        assert_eq!(dev.sectors[7][0], 9);
    }

    #[test]
    fn flush_starts_one_write_per_call() {
        let mut dev = RamDevice::new(64);
        let mut cache = SectorCache::new();
        for s in 1..4 {
            let slot = get_settled(&mut cache, &mut dev, s, CACHE_WRITE);
            cache.buffer_mut(slot).fill(s as u8);
        }

        let mut rounds = 0;
        while !cache.flush(&mut dev) {
            pump(&mut cache, &mut dev);
            rounds += 1;
            assert!(rounds < 32);
        }
        assert_eq!(dev.writes, 3);
        assert!(!cache.has_dirty());
    }
}
