//! RAM-backed block device.
//!
//! Serves transfers out of an in-memory sector array.  Requests sit in a
//! FIFO queue until `poll_complete` is called, so a submitted read stays
//! observably in flight until the caller polls — which is exactly what the
//! cache's pending-I/O paths need to be exercised against.  Per-sector
//! error injection makes device failures reproducible.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec;
use alloc::vec::Vec;

use shfs_lib::log_debug;

use crate::blkdev::{BioCompletion, BioRequest, BlkdevError, BlkdevMode, BlockDevice, Sector};

/// Upper bound on queued requests, after which `submit` pushes back.
pub const MEMBLK_MAX_PENDING: usize = 64;

pub struct MemBlkDevice {
    mode: BlkdevMode,
    ssize: u32,
    storage: Vec<u8>,
    pending: VecDeque<BioRequest>,
    /// Injected completion results, keyed by starting sector.
    faults: BTreeMap<Sector, i64>,
}

// SAFETY: the queued `BioRequest` buffer pointers are owned by the
// submitter, which per the `submit` contract keeps them valid and
// unaliased until their completion is polled.
unsafe impl Send for MemBlkDevice {}

impl MemBlkDevice {
    pub fn new(ssize: u32, nb_sectors: Sector, mode: BlkdevMode) -> Self {
        Self {
            mode,
            ssize,
            storage: vec![0u8; (nb_sectors * ssize as u64) as usize],
            pending: VecDeque::new(),
            faults: BTreeMap::new(),
        }
    }

    /// Load `bytes` into the backing store starting at `sector`.
    ///
    /// Bypasses the request queue; intended for preparing test content.
    pub fn fill(&mut self, sector: Sector, bytes: &[u8]) {
        let start = (sector * self.ssize as u64) as usize;
        self.storage[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Make every request starting at `sector` complete with `ret`
    /// (a negative errno) instead of transferring data.
    pub fn inject_fault(&mut self, sector: Sector, ret: i64) {
        self.faults.insert(sector, ret);
    }

    pub fn clear_fault(&mut self, sector: Sector) {
        self.faults.remove(&sector);
    }

    /// Number of submitted transfers not yet completed.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn complete(&mut self, req: BioRequest) -> BioCompletion {
        if let Some(&ret) = self.faults.get(&req.sector) {
            log_debug!("memblk: injected fault at sector {}: {}", req.sector, ret);
            return BioCompletion { tag: req.tag, ret };
        }

        let len = (req.nb_sectors * self.ssize as u64) as usize;
        let start = (req.sector * self.ssize as u64) as usize;
        // SAFETY: `submit` bounds-checked the range; the buffer contract
        // guarantees `req.buf` is valid for `len` bytes until now.
        unsafe {
            if req.write {
                core::ptr::copy_nonoverlapping(req.buf, self.storage.as_mut_ptr().add(start), len);
            } else {
                core::ptr::copy_nonoverlapping(self.storage.as_ptr().add(start), req.buf, len);
            }
        }
        BioCompletion {
            tag: req.tag,
            ret: len as i64,
        }
    }
}

impl BlockDevice for MemBlkDevice {
    fn sector_size(&self) -> u32 {
        self.ssize
    }

    fn size_in_sectors(&self) -> Sector {
        self.storage.len() as u64 / self.ssize as u64
    }

    fn mode(&self) -> BlkdevMode {
        self.mode
    }

    unsafe fn submit(&mut self, req: BioRequest) -> Result<(), BlkdevError> {
        let wanted = if req.write {
            BlkdevMode::WRITE
        } else {
            BlkdevMode::READ
        };
        if !self.mode.contains(wanted) {
            return Err(BlkdevError::Access);
        }
        if req.sector + req.nb_sectors > self.size_in_sectors() {
            return Err(BlkdevError::BadRange);
        }
        if self.pending.len() >= MEMBLK_MAX_PENDING {
            return Err(BlkdevError::QueueFull);
        }
        self.pending.push_back(req);
        Ok(())
    }

    fn poll_complete(&mut self) -> Option<BioCompletion> {
        let req = self.pending.pop_front()?;
        Some(self.complete(req))
    }
}
