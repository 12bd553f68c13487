//! Block device port.
//!
//! The cache talks to storage through this trait only: enqueue an
//! asynchronous sector read or write, then drive the device by polling for
//! completions.  Nothing happens between `submit` and the next
//! `poll_complete`, so completion handling always runs at a well-defined
//! point in the caller's loop — the cooperative-scheduling contract the
//! cache engine is built on.

use bitflags::bitflags;

/// 0-based sector index on a device.
pub type Sector = u64;

bitflags! {
    /// Open mode of a block device handle.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BlkdevMode: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        /// Reject sharing the device with other handles.
        const EXCL  = 1 << 2;

        const RO = Self::READ.bits();
        const WO = Self::WRITE.bits();
        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlkdevError {
    /// Too many requests on the queue; retry after polling.
    QueueFull,
    /// Write on a read-only handle (or read on write-only).
    Access,
    /// Request runs past the end of the device.
    BadRange,
}

/// One queued transfer.
///
/// `buf` must point at `nb_sectors * sector_size` writable bytes and stay
/// valid until the completion carrying `tag` has been returned by
/// `poll_complete`.  The `tag` is opaque to the device and round-trips
/// unchanged.
#[derive(Debug)]
pub struct BioRequest {
    pub sector: Sector,
    pub nb_sectors: Sector,
    pub write: bool,
    pub buf: *mut u8,
    pub tag: u64,
}

/// Completion of one queued transfer: byte count on success, negative
/// errno on failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BioCompletion {
    pub tag: u64,
    pub ret: i64,
}

/// Asynchronous sector device.
///
/// Completions are delivered exactly once each, in submission order.
pub trait BlockDevice: Send {
    fn sector_size(&self) -> u32;
    fn size_in_sectors(&self) -> Sector;
    fn mode(&self) -> BlkdevMode;

    /// Enqueue a transfer.
    ///
    /// # Safety
    ///
    /// `req.buf` must satisfy the [`BioRequest`] buffer contract: valid
    /// for the full transfer length and unaliased until the completion
    /// for `req.tag` is observed.
    unsafe fn submit(&mut self, req: BioRequest) -> Result<(), BlkdevError>;

    /// Advance the device queue; returns the oldest finished transfer, or
    /// `None` when nothing is ready.
    fn poll_complete(&mut self) -> Option<BioCompletion>;

    /// Device capacity in bytes.
    fn size_in_bytes(&self) -> u64 {
        self.size_in_sectors() * self.sector_size() as u64
    }
}
