//! Volume mount state.
//!
//! A [`Volume`] is the explicit handle binding one mounted SHFS volume
//! together: the block device, the AIO token pool, the chunk cache, and
//! the file table.  It is constructed by [`Volume::mount`] and torn down
//! by [`Volume::unmount`] (or drop), which flushes the cache after waiting
//! out any outstanding I/O.
//!
//! # Locking
//!
//! Two locks, always taken in the order *state → device*: engine
//! operations hold the state lock and may submit I/O under it; the poll
//! loop drains the device first, releases it, and only then applies
//! completions to the state.  Waiter callbacks are invoked with no lock
//! held, so a callback may re-enter the engine.

use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

use shfs_blkdev::{BioCompletion, BlkdevMode, BlockDevice};
use shfs_lib::{is_pow2, log_debug, log_info};

use crate::Chunk;
use crate::aio::{AioNotify, TokenId};
use crate::cache::{AreadResult, CacheConfig, CacheInfo, ChunkCache, EntryRef, WaiterCb};
use crate::error::{ShfsError, ShfsResult};
use crate::fio::{FileSpec, FileTable};

// ---------------------------------------------------------------------------
// Free-memory probe
// ---------------------------------------------------------------------------

/// Stored as a raw pointer; `null` means "no probe registered".
static FREE_MEM_PROBE: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Register the process-wide free-memory probe consulted by the cache's
/// growth gate.  Without a probe, growth is ungated.
pub fn register_free_mem_probe(probe: fn() -> usize) {
    FREE_MEM_PROBE.store(probe as *mut (), Ordering::Release);
}

pub(crate) fn free_mem() -> Option<usize> {
    let ptr = FREE_MEM_PROBE.load(Ordering::Acquire);
    if ptr.is_null() {
        return None;
    }
    // SAFETY: `register_free_mem_probe` only stores valid fn pointers,
    // which are the same size as `*mut ()` on all supported targets.
    let probe: fn() -> usize = unsafe { core::mem::transmute(ptr) };
    Some(probe())
}

// ---------------------------------------------------------------------------
// Mount parameters
// ---------------------------------------------------------------------------

/// Geometry and contents of a volume, as the mount procedure hands them
/// over.
#[derive(Clone, Debug, Default)]
pub struct VolumeParams {
    pub name: String,
    /// Chunk size in bytes; a positive multiple of the device sector size.
    pub chunksize: u32,
    /// Buffer alignment for device I/O; a power of two.
    pub ioalign: u32,
    /// Number of addressable chunks; valid addresses are `1..=volsize`.
    pub volsize: Chunk,
    /// Sizing hint for the cache index; 0 derives it from the pool size.
    pub expected_entries: u32,
    /// Name-keyed file extents.
    pub files: Vec<FileSpec>,
}

pub(crate) struct VolState {
    pub(crate) cache: ChunkCache,
    pub(crate) files: FileTable,
    pub(crate) nb_open: u32,
}

/// Per-entry counter snapshot for diagnostics and tests.
#[derive(Clone, Copy, Debug)]
pub struct EntryStats {
    pub addr: Chunk,
    pub refcount: u32,
    pub invalid: bool,
    pub in_flight: bool,
}

pub struct Volume {
    name: String,
    chunksize: u32,
    volsize: Chunk,
    mounted: AtomicBool,
    bd: Mutex<Box<dyn BlockDevice>>,
    pub(crate) state: Mutex<VolState>,
}

impl Volume {
    /// Validate the geometry and bring the cache up over `bd`.
    pub fn mount(
        bd: Box<dyn BlockDevice>,
        params: VolumeParams,
        cfg: CacheConfig,
    ) -> ShfsResult<Volume> {
        let ssize = bd.sector_size();
        if ssize == 0
            || params.chunksize == 0
            || params.chunksize % ssize != 0
            || params.volsize == 0
            || !is_pow2(params.ioalign as usize)
        {
            return Err(ShfsError::Invalid);
        }
        if !bd.mode().contains(BlkdevMode::READ) {
            return Err(ShfsError::Access);
        }

        let sfactor = (params.chunksize / ssize) as u64;
        // Chunk 0 holds the volume metadata; the device must back it plus
        // every addressable chunk.
        if (params.volsize + 1) * sfactor > bd.size_in_sectors() {
            return Err(ShfsError::Invalid);
        }

        let cache = ChunkCache::new(
            cfg,
            params.chunksize,
            params.ioalign,
            params.volsize,
            sfactor,
            params.expected_entries,
        )?;
        let files = FileTable::new(params.files, params.chunksize, params.volsize)?;

        log_info!(
            "vol {}: mounted, chunksize={} volsize={} chunks",
            params.name,
            params.chunksize,
            params.volsize
        );

        Ok(Volume {
            name: params.name,
            chunksize: params.chunksize,
            volsize: params.volsize,
            mounted: AtomicBool::new(true),
            bd: Mutex::new(bd),
            state: Mutex::new(VolState {
                cache,
                files,
                nb_open: 0,
            }),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn chunksize(&self) -> u32 {
        self.chunksize
    }

    #[inline]
    pub fn volsize(&self) -> Chunk {
        self.volsize
    }

    #[inline]
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Number of currently open file handles.
    pub fn nb_open(&self) -> u32 {
        self.state.lock().nb_open
    }

    pub(crate) fn ensure_mounted(&self) -> ShfsResult<()> {
        if self.is_mounted() {
            Ok(())
        } else {
            Err(ShfsError::NoDevice)
        }
    }

    // -----------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------

    /// Drain device completions and run the cache fan-out.  Waiter
    /// callbacks fire after all cache state is consistent, with no lock
    /// held.
    pub fn poll(&self) {
        let mut completions: Vec<BioCompletion> = Vec::new();
        {
            let mut bd = self.bd.lock();
            while let Some(done) = bd.poll_complete() {
                completions.push(done);
            }
        }
        if completions.is_empty() {
            return;
        }

        let mut notify: Vec<WaiterCb> = Vec::new();
        {
            let mut st = self.state.lock();
            for done in completions {
                st.cache
                    .complete_fetch(TokenId::from_tag(done.tag), done.ret, &mut notify);
            }
        }
        for (cb, ret, cookie, argp) in notify {
            cb(ret, cookie, argp);
        }
    }

    // -----------------------------------------------------------------
    // Cache engine surface
    // -----------------------------------------------------------------

    /// Read chunk `addr` through the cache.  `Ready` hands back an entry
    /// whose buffer is valid now; `Pending` additionally hands back a
    /// waiter token whose callback triple fires exactly once on
    /// completion.
    pub fn cache_aread(
        &self,
        addr: Chunk,
        cb: Option<AioNotify>,
        cb_cookie: usize,
        cb_argp: usize,
    ) -> ShfsResult<AreadResult> {
        self.ensure_mounted()?;
        let mut st = self.state.lock();
        let mut bd = self.bd.lock();
        st.cache.aread(addr, cb, cb_cookie, cb_argp, &mut **bd)
    }

    /// Drop a reference obtained from `cache_aread` or `cache_eblank`.
    /// The entry's I/O must have completed.
    pub fn cache_release(&self, entry: EntryRef) {
        self.state.lock().cache.release(entry);
    }

    /// Drop a reference while abandoning a still-pending waiter token.
    pub fn cache_release_ioabort(&self, entry: EntryRef, t: Option<TokenId>) {
        self.state.lock().cache.release_ioabort(entry, t);
    }

    /// Obtain a chunk-sized scratch buffer (blank entry, `addr == 0`,
    /// outside the cache index).
    pub fn cache_eblank(&self) -> ShfsResult<EntryRef> {
        self.ensure_mounted()?;
        self.state.lock().cache.eblank()
    }

    /// Whether the completion for `t` has fired (`None` counts as done).
    pub fn aio_is_done(&self, t: Option<TokenId>) -> bool {
        self.state.lock().cache.tokens.is_done(t)
    }

    /// Read a completed waiter token's result and recycle the token.
    pub fn aio_finalize(&self, t: TokenId) -> i64 {
        let mut st = self.state.lock();
        let ret = st.cache.tokens.finalize(t);
        st.cache.tokens.put(t);
        ret
    }

    /// Run `f` over the entry's chunk data.
    ///
    /// Fails with `Invalid` unless the entry is referenced and valid.
    /// `f` runs under the volume's state lock and must not re-enter the
    /// volume.
    pub fn with_chunk_data<R>(&self, entry: EntryRef, f: impl FnOnce(&[u8]) -> R) -> ShfsResult<R> {
        let st = self.state.lock();
        let cce = st.cache.cce(entry);
        if cce.refcount() == 0 || cce.is_invalid() {
            return Err(ShfsError::Invalid);
        }
        // SAFETY: the entry is referenced, so it cannot be evicted, and it
        // is valid, so no fetch is writing the buffer (an in-flight token
        // implies invalid).  The buffer is chunk-sized by construction.
        let data = unsafe { core::slice::from_raw_parts(cce.buffer(), st.cache.chunk_len()) };
        Ok(f(data))
    }

    /// Synchronously load chunk `addr` into a held blank entry's buffer,
    /// spin-polling the device until the fetch completes.
    pub fn blank_read_chunk(&self, entry: EntryRef, addr: Chunk) -> ShfsResult<()> {
        self.ensure_mounted()?;
        if addr == 0 || addr > self.volsize {
            return Err(ShfsError::Invalid);
        }
        {
            let mut st = self.state.lock();
            let cce = st.cache.cce(entry);
            if cce.refcount() == 0 || cce.in_flight().is_some() {
                return Err(ShfsError::Invalid);
            }
            let mut bd = self.bd.lock();
            st.cache.start_blank_fetch(entry, addr, &mut **bd)?;
        }
        loop {
            {
                let st = self.state.lock();
                let cce = st.cache.cce(entry);
                if cce.in_flight().is_none() {
                    return if cce.is_invalid() {
                        Err(ShfsError::Io)
                    } else {
                        Ok(())
                    };
                }
            }
            self.poll();
        }
    }

    /// Counter snapshot of the cache.
    pub fn cache_info(&self) -> CacheInfo {
        self.state.lock().cache.info()
    }

    /// Per-entry snapshot for diagnostics and tests.
    pub fn entry_stats(&self, entry: EntryRef) -> EntryStats {
        let st = self.state.lock();
        let cce = st.cache.cce(entry);
        EntryStats {
            addr: cce.addr(),
            refcount: cce.refcount(),
            invalid: cce.is_invalid(),
            in_flight: cce.in_flight().is_some(),
        }
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Destroy every unreferenced entry, waiting out in-flight I/O.
    pub fn flush(&self) {
        let mut notify: Vec<WaiterCb> = Vec::new();
        {
            let mut st = self.state.lock();
            let mut bd = self.bd.lock();
            st.cache.flush(&mut **bd, &mut notify);
        }
        for (cb, ret, cookie, argp) in notify {
            cb(ret, cookie, argp);
        }
    }

    /// Flush the cache and mark the volume unmounted.  Further engine
    /// calls fail with `NoDevice`.
    pub fn unmount(&self) {
        if !self.mounted.swap(false, Ordering::AcqRel) {
            return;
        }
        log_debug!("vol {}: unmounting", self.name);
        self.flush();
        log_info!("vol {}: unmounted", self.name);
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        self.unmount();
    }
}
