use asyncfat::{BlockDevice, BlockEvent, SECTOR_SIZE};

enum PendingOp {
    Read { sector: u32, tag: u8 },
    Write { sector: u32, tag: u8, data: Box<[u8; SECTOR_SIZE]> },
}

struct Pending {
    op: PendingOp,
    countdown: u32,
}

/// In-memory SD card with the real device's surface: one transfer in
/// flight, acceptance signalling, and completions delivered a configurable
/// number of polls after the transfer was accepted.
pub struct SimCard {
    data: Vec<u8>,
    latency: u32,
    pending: Option<Pending>,
    staged: [u8; SECTOR_SIZE],
    pub reads: u64,
    pub writes: u64,
    pub write_bursts: u64,
}

impl SimCard {
    pub fn new(data: Vec<u8>, latency: u32) -> Self {
        assert_eq!(data.len() % SECTOR_SIZE, 0);
        Self {
            data,
            latency,
            pending: None,
            staged: [0; SECTOR_SIZE],
            reads: 0,
            writes: 0,
            write_bursts: 0,
        }
    }

    /// True when no transfer is outstanding, like the hardware ready pin.
    pub fn is_ready(&self) -> bool {
        self.pending.is_none()
    }

    pub fn sector(&self, index: u32) -> &[u8] {
        let offset = index as usize * SECTOR_SIZE;
        &self.data[offset..offset + SECTOR_SIZE]
    }
}

impl BlockDevice for SimCard {
    fn start_read(&mut self, sector: u32, tag: u8) -> bool {
        if self.pending.is_some() {
            return false;
        }
        assert!((sector as usize + 1) * SECTOR_SIZE <= self.data.len());
        self.pending = Some(Pending {
            op: PendingOp::Read { sector, tag },
            countdown: self.latency,
        });
        true
    }

    fn start_write(&mut self, sector: u32, data: &[u8; SECTOR_SIZE], tag: u8) -> bool {
        if self.pending.is_some() {
            return false;
        }
        assert!((sector as usize + 1) * SECTOR_SIZE <= self.data.len());
        self.pending = Some(Pending {
            op: PendingOp::Write {
                sector,
                tag,
                data: Box::new(*data),
            },
            countdown: self.latency,
        });
        true
    }

    fn begin_write_burst(&mut self, _first_sector: u32, _count: u32) {
        self.write_bursts += 1;
    }

    fn poll(&mut self) -> Option<BlockEvent<'_>> {
        let pending = self.pending.as_mut()?;
        if pending.countdown > 0 {
            pending.countdown -= 1;
            return None;
        }
        match self.pending.take()?.op {
            PendingOp::Read { sector, tag } => {
                self.reads += 1;
                let offset = sector as usize * SECTOR_SIZE;
                self.staged
                    .copy_from_slice(&self.data[offset..offset + SECTOR_SIZE]);
                Some(BlockEvent::ReadComplete {
                    sector,
                    tag,
                    data: &self.staged,
                    success: true,
                })
            }
            PendingOp::Write { sector, tag, data } => {
                self.writes += 1;
                let offset = sector as usize * SECTOR_SIZE;
                self.data[offset..offset + SECTOR_SIZE].copy_from_slice(&data[..]);
                Some(BlockEvent::WriteComplete {
                    sector,
                    tag,
                    success: true,
                })
            }
        }
    }
}
