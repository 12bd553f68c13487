//! Chunk cache.
//!
//! Joins chunk addresses to pooled buffers and de-duplicates concurrent
//! fetches: one device read per address, fanned out to every caller that
//! registered a waiter token while the read was in flight.
//!
//! Bookkeeping lives on two intrusive doubly-linked structures, rendered
//! here as index links in `Cell`s:
//!
//! * the **availability list** — entries with `refcount == 0`, ordered
//!   oldest-first; its head is the eviction candidate, its tail the most
//!   recently used entry;
//! * per-bucket **collision lists** of the address hash table.
//!
//! Entries are born from the buffer pool, or from the heap once the pool
//! runs dry and growth is enabled.  An entry with an in-flight token is
//! never evicted and never handed out as data; an entry whose fetch failed
//! is destroyed instead of recycled.

use core::cell::Cell;

use alloc::vec::Vec;

use shfs_blkdev::{BioRequest, BlockDevice};
use shfs_lib::{floor_log2, log_debug};
use shfs_mm::{AlignedRegion, Mempool, ObjId, PoolLayout};

use crate::Chunk;
use crate::aio::{AioNotify, AioTokenPool, TokenId};
use crate::error::{ShfsError, ShfsResult};
use crate::vol;

/// Buffer count when the mount configuration does not say otherwise.
pub const DEFAULT_NB_BUFFERS: u32 = 64;

/// Target collision-chain length used to size the hash table.
pub const HTABLE_AVG_CHAIN_LEN: u32 = 4;

/// Chunks speculatively fetched after a demand miss.
pub const DEFAULT_READAHEAD: u32 = 4;

/// AIO tokens shared by in-flight fetches and waiters.
pub const DEFAULT_NB_TOKENS: u32 = 128;

/// Runtime cache configuration, fixed at mount.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// Pool buffer count. 0 together with `grow` means heap-only.
    pub nb_buffers: u32,
    /// Target collision-chain length for hash-table sizing.
    pub avg_chain_len: u32,
    /// Read-ahead window; 0 disables.
    pub readahead: u32,
    /// AIO token count.
    pub nb_tokens: u32,
    /// Allow heap-backed entries once the pool is exhausted.
    pub grow: bool,
    /// Minimum free memory (bytes) below which growth is refused; 0 or a
    /// missing free-memory probe leaves growth ungated.
    pub grow_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            nb_buffers: DEFAULT_NB_BUFFERS,
            avg_chain_len: HTABLE_AVG_CHAIN_LEN,
            readahead: DEFAULT_READAHEAD,
            nb_tokens: DEFAULT_NB_TOKENS,
            grow: false,
            grow_threshold: 0,
        }
    }
}

/// Counter snapshot for diagnostics.
#[derive(Clone, Copy, Debug)]
pub struct CacheInfo {
    pub nb_entries: u64,
    pub nb_ref_entries: u32,
    pub htlen: u32,
    pub chunksize: u32,
}

/// Handle to a cache entry, valid from a successful `aread`/`eblank`
/// until the matching release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryRef {
    /// Entry living in a pool slot.
    Pool(ObjId),
    /// Heap-overflow entry (slab index).
    Heap(u32),
}

/// Outcome of a successful `aread`.
#[derive(Clone, Copy, Debug)]
pub enum AreadResult {
    /// Buffer contents are valid now; no token to wait on.
    Ready(EntryRef),
    /// Fetch in progress; the waiter token's callback fires on completion.
    Pending(EntryRef, TokenId),
}

impl AreadResult {
    pub fn entry(&self) -> EntryRef {
        match *self {
            AreadResult::Ready(r) => r,
            AreadResult::Pending(r, _) => r,
        }
    }
}

/// Waiter callback captured during fan-out, invoked once all cache state
/// is consistent: `(cb, ret, cookie, argp)`.
pub(crate) type WaiterCb = (AioNotify, i64, usize, usize);

/// Doubly-linked list links, by index.
struct Links<T: Copy> {
    prev: Cell<Option<T>>,
    next: Cell<Option<T>>,
}

impl<T: Copy> Links<T> {
    const fn new() -> Self {
        Self {
            prev: Cell::new(None),
            next: Cell::new(None),
        }
    }
}

struct ListHead<T: Copy> {
    first: Cell<Option<T>>,
    last: Cell<Option<T>>,
}

impl<T: Copy> ListHead<T> {
    const fn new() -> Self {
        Self {
            first: Cell::new(None),
            last: Cell::new(None),
        }
    }
}

pub(crate) struct CacheEntry {
    /// Backing pool slot; `None` for heap-overflow entries.
    pobj: Option<ObjId>,
    /// Chunk-sized buffer, stable for the entry's whole life.
    buffer: *mut u8,
    addr: Cell<Chunk>,
    refcount: Cell<u32>,
    /// True while the buffer is not a valid copy of the chunk: initial,
    /// in flight, or failed.
    invalid: Cell<bool>,
    /// In-flight fetch token; `None` when no I/O is outstanding.
    t: Cell<Option<TokenId>>,
    /// Waiter tokens, in registration order.
    chain: ListHead<TokenId>,
    alist: Links<EntryRef>,
    clist: Links<EntryRef>,
}

impl CacheEntry {
    fn new(pobj: Option<ObjId>, buffer: *mut u8) -> Self {
        Self {
            pobj,
            buffer,
            addr: Cell::new(0),
            refcount: Cell::new(0),
            invalid: Cell::new(true),
            t: Cell::new(None),
            chain: ListHead::new(),
            alist: Links::new(),
            clist: Links::new(),
        }
    }

    pub(crate) fn buffer(&self) -> *mut u8 {
        self.buffer
    }

    pub(crate) fn addr(&self) -> Chunk {
        self.addr.get()
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.get()
    }

    pub(crate) fn is_invalid(&self) -> bool {
        self.invalid.get()
    }

    pub(crate) fn in_flight(&self) -> Option<TokenId> {
        self.t.get()
    }
}

struct HeapEntry {
    /// Owns the chunk buffer `cce.buffer` points into.
    _region: AlignedRegion,
    cce: CacheEntry,
}

// SAFETY: the entry buffer pointers all target regions owned by this value
// (the pool's slot storage or a heap entry's region); interior mutability is
// `Cell`-based and confined by the volume's state lock.
unsafe impl Send for ChunkCache {}

pub(crate) struct ChunkCache {
    cfg: CacheConfig,
    chunksize: u32,
    ioalign: u32,
    volsize: Chunk,
    /// Sectors per chunk.
    sfactor: u64,
    pool: Mempool<CacheEntry>,
    heap: Vec<Option<HeapEntry>>,
    heap_free: Vec<u32>,
    htable: Vec<ListHead<EntryRef>>,
    htmask: u32,
    alist: ListHead<EntryRef>,
    nb_entries: Cell<u64>,
    nb_ref_entries: Cell<u32>,
    pub(crate) tokens: AioTokenPool,
}

impl ChunkCache {
    pub(crate) fn new(
        cfg: CacheConfig,
        chunksize: u32,
        ioalign: u32,
        volsize: Chunk,
        sfactor: u64,
        expected_entries: u32,
    ) -> ShfsResult<Self> {
        let avg = cfg.avg_chain_len.max(1);
        let expected = expected_entries.max(cfg.nb_buffers).max(1);
        let htlen = 1u32 << floor_log2((expected / avg).max(1));

        let pool = Mempool::new(
            cfg.nb_buffers,
            chunksize as usize,
            ioalign as usize,
            0,
            0,
            PoolLayout::Separated,
            |id, data| CacheEntry::new(Some(id), data),
        )?;
        let tokens = AioTokenPool::new(cfg.nb_tokens.max(1))?;

        log_debug!(
            "cache: {} pool buffers of {} bytes, htlen={}, readahead={}, grow={}",
            cfg.nb_buffers,
            chunksize,
            htlen,
            cfg.readahead,
            cfg.grow
        );

        Ok(Self {
            cfg,
            chunksize,
            ioalign,
            volsize,
            sfactor,
            pool,
            heap: Vec::new(),
            heap_free: Vec::new(),
            htable: (0..htlen).map(|_| ListHead::new()).collect(),
            htmask: htlen - 1,
            alist: ListHead::new(),
            nb_entries: Cell::new(0),
            nb_ref_entries: Cell::new(0),
            tokens,
        })
    }

    #[inline]
    pub(crate) fn chunk_len(&self) -> usize {
        self.chunksize as usize
    }

    pub(crate) fn info(&self) -> CacheInfo {
        CacheInfo {
            nb_entries: self.nb_entries.get(),
            nb_ref_entries: self.nb_ref_entries.get(),
            htlen: self.htmask + 1,
            chunksize: self.chunksize,
        }
    }

    pub(crate) fn cce(&self, r: EntryRef) -> &CacheEntry {
        match r {
            EntryRef::Pool(obj) => self.pool.private(obj),
            EntryRef::Heap(idx) => {
                &self.heap[idx as usize]
                    .as_ref()
                    .expect("dangling heap cache entry reference")
                    .cce
            }
        }
    }

    // -----------------------------------------------------------------
    // Entry allocation
    // -----------------------------------------------------------------

    /// Take a fresh entry from the pool, or from the heap when growth is
    /// enabled and the free-memory gate allows it.
    fn pick_entry(&mut self) -> Option<EntryRef> {
        if let Some(obj) = self.pool.pick() {
            self.nb_entries.set(self.nb_entries.get() + 1);
            let cce = self.pool.private(obj);
            cce.addr.set(0);
            cce.refcount.set(0);
            cce.invalid.set(true);
            cce.t.set(None);
            return Some(EntryRef::Pool(obj));
        }

        if !self.cfg.grow {
            return None;
        }
        if self.cfg.grow_threshold > 0 {
            if let Some(free) = vol::free_mem() {
                if free < self.cfg.grow_threshold {
                    return None;
                }
            }
        }

        let region =
            AlignedRegion::alloc_zeroed(self.chunksize as usize, self.ioalign as usize).ok()?;
        let cce = CacheEntry::new(None, region.as_mut_ptr());
        let entry = HeapEntry {
            _region: region,
            cce,
        };
        let idx = match self.heap_free.pop() {
            Some(idx) => {
                self.heap[idx as usize] = Some(entry);
                idx
            }
            None => {
                self.heap.push(Some(entry));
                (self.heap.len() - 1) as u32
            }
        };
        self.nb_entries.set(self.nb_entries.get() + 1);
        Some(EntryRef::Heap(idx))
    }

    /// Return an entry to its backing store.
    fn put_entry(&mut self, r: EntryRef) {
        let pobj = self.cce(r).pobj;
        match r {
            EntryRef::Pool(obj) => {
                debug_assert!(pobj == Some(obj), "entry backing disagrees with its handle");
                self.pool.put(obj);
            }
            EntryRef::Heap(idx) => {
                debug_assert!(pobj.is_none(), "entry backing disagrees with its handle");
                self.heap[idx as usize] = None;
                self.heap_free.push(idx);
            }
        }
        self.nb_entries.set(self.nb_entries.get() - 1);
    }

    // -----------------------------------------------------------------
    // Hash table and availability list
    // -----------------------------------------------------------------

    #[inline]
    fn bucket(&self, addr: Chunk) -> &ListHead<EntryRef> {
        &self.htable[((addr as u32) & self.htmask) as usize]
    }

    pub(crate) fn find(&self, addr: Chunk) -> Option<EntryRef> {
        let mut cur = self.bucket(addr).first.get();
        while let Some(r) = cur {
            let cce = self.cce(r);
            if cce.addr.get() == addr {
                return Some(r);
            }
            cur = cce.clist.next.get();
        }
        None
    }

    fn clist_append(&self, r: EntryRef) {
        let addr = self.cce(r).addr.get();
        debug_assert!(addr != 0, "blank entries never enter a collision list");
        let head = self.bucket(addr);
        let links = &self.cce(r).clist;
        links.next.set(None);
        links.prev.set(head.last.get());
        match head.last.get() {
            Some(tail) => self.cce(tail).clist.next.set(Some(r)),
            None => head.first.set(Some(r)),
        }
        head.last.set(Some(r));
    }

    fn clist_unlink(&self, r: EntryRef) {
        let addr = self.cce(r).addr.get();
        if addr == 0 {
            return;
        }
        let head = self.bucket(addr);
        let links = &self.cce(r).clist;
        let (prev, next) = (links.prev.get(), links.next.get());
        match prev {
            Some(p) => self.cce(p).clist.next.set(next),
            None => head.first.set(next),
        }
        match next {
            Some(n) => self.cce(n).clist.prev.set(prev),
            None => head.last.set(prev),
        }
        links.prev.set(None);
        links.next.set(None);
    }

    fn alist_append(&self, r: EntryRef) {
        let links = &self.cce(r).alist;
        links.next.set(None);
        links.prev.set(self.alist.last.get());
        match self.alist.last.get() {
            Some(tail) => self.cce(tail).alist.next.set(Some(r)),
            None => self.alist.first.set(Some(r)),
        }
        self.alist.last.set(Some(r));
    }

    /// Detach from the availability list. Tolerates entries that are not
    /// on the list (referenced entries, blanks), like the destroy paths
    /// need.
    fn alist_unlink(&self, r: EntryRef) {
        let links = &self.cce(r).alist;
        let (prev, next) = (links.prev.get(), links.next.get());
        if prev.is_none() && next.is_none() && self.alist.first.get() != Some(r) {
            return;
        }
        match prev {
            Some(p) => self.cce(p).alist.next.set(next),
            None => self.alist.first.set(next),
        }
        match next {
            Some(n) => self.cce(n).alist.prev.set(prev),
            None => self.alist.last.set(prev),
        }
        links.prev.set(None);
        links.next.set(None);
    }

    /// Move an entry to the most-recently-used end of the availability
    /// list.
    fn alist_relink_tail(&self, r: EntryRef) {
        self.alist_unlink(r);
        self.alist_append(r);
    }

    /// Scan the availability list head-first for an entry with no
    /// outstanding I/O.
    fn alist_find_idle(&self) -> Option<EntryRef> {
        let mut cur = self.alist.first.get();
        while let Some(r) = cur {
            let cce = self.cce(r);
            if cce.t.get().is_none() {
                return Some(r);
            }
            cur = cce.alist.next.get();
        }
        None
    }

    /// Detach an entry from every list it may be on. Caller must hold the
    /// entry unreferenced.
    fn unlink_entry(&self, r: EntryRef) {
        debug_assert!(self.cce(r).refcount.get() == 0);
        self.clist_unlink(r);
        self.alist_unlink(r);
    }

    // -----------------------------------------------------------------
    // Waiter chain
    // -----------------------------------------------------------------

    fn chain_append(&self, r: EntryRef, t: TokenId) {
        let chain = &self.cce(r).chain;
        let token = self.tokens.token(t);
        token.next.set(None);
        token.prev.set(chain.last.get());
        match chain.last.get() {
            Some(tail) => self.tokens.token(tail).next.set(Some(t)),
            None => chain.first.set(Some(t)),
        }
        chain.last.set(Some(t));
    }

    fn chain_unlink(&self, r: EntryRef, t: TokenId) {
        let chain = &self.cce(r).chain;
        let token = self.tokens.token(t);
        let (prev, next) = (token.prev.get(), token.next.get());
        match prev {
            Some(p) => self.tokens.token(p).next.set(next),
            None => chain.first.set(next),
        }
        match next {
            Some(n) => self.tokens.token(n).prev.set(prev),
            None => chain.last.set(prev),
        }
        token.prev.set(None);
        token.next.set(None);
    }

    // -----------------------------------------------------------------
    // Fetch submission
    // -----------------------------------------------------------------

    /// Pick an in-flight token and enqueue the device read for `addr`
    /// into the entry's buffer.
    fn submit_fetch(
        &mut self,
        r: EntryRef,
        addr: Chunk,
        bd: &mut dyn BlockDevice,
    ) -> ShfsResult<TokenId> {
        let t = self.tokens.pick().ok_or(ShfsError::Again)?;
        self.tokens.token(t).owner.set(Some(r));
        let req = BioRequest {
            sector: addr * self.sfactor,
            nb_sectors: self.sfactor,
            write: false,
            buf: self.cce(r).buffer,
            tag: t.tag(),
        };
        // SAFETY: the buffer belongs to `r`, which carries an in-flight
        // token from here on and is therefore neither evicted nor read
        // until the completion for `t` has been processed.
        match unsafe { bd.submit(req) } {
            Ok(()) => Ok(t),
            Err(err) => {
                self.tokens.put(t);
                log_debug!("cache: could not start I/O for chunk {}: {:?}", addr, err);
                Err(err.into())
            }
        }
    }

    /// Miss path: obtain an entry for `addr` (pool, heap, or by recycling
    /// the oldest idle entry) and start its fetch.
    fn add(&mut self, addr: Chunk, bd: &mut dyn BlockDevice) -> ShfsResult<EntryRef> {
        let r = match self.pick_entry() {
            Some(r) => {
                // Fresh buffer: joins the availability tail until someone
                // takes a reference.
                self.alist_append(r);
                r
            }
            None => {
                let Some(r) = self.alist_find_idle() else {
                    return Err(ShfsError::Again);
                };
                log_debug!(
                    "cache: recycling chunk {} for chunk {}",
                    self.cce(r).addr.get(),
                    addr
                );
                self.clist_unlink(r);
                self.alist_relink_tail(r);
                r
            }
        };

        {
            let cce = self.cce(r);
            cce.addr.set(addr);
            cce.invalid.set(true);
        }
        match self.submit_fetch(r, addr, bd) {
            Ok(t) => self.cce(r).t.set(Some(t)),
            Err(err) => {
                self.alist_unlink(r);
                self.put_entry(r);
                return Err(err);
            }
        }
        self.clist_append(r);
        Ok(r)
    }

    /// Speculatively fetch the window after `addr`. Failures are silent;
    /// the fetches carry no reference and notify nobody.
    fn readahead(&mut self, addr: Chunk, bd: &mut dyn BlockDevice) {
        for i in 1..=self.cfg.readahead as u64 {
            let ahead = addr + i;
            if ahead > self.volsize {
                return; // end of volume
            }
            if self.find(ahead).is_none() && self.add(ahead, bd).is_err() {
                return; // out of buffers
            }
        }
    }

    // -----------------------------------------------------------------
    // Public engine operations (via the volume)
    // -----------------------------------------------------------------

    pub(crate) fn aread(
        &mut self,
        addr: Chunk,
        cb: Option<AioNotify>,
        cb_cookie: usize,
        cb_argp: usize,
        bd: &mut dyn BlockDevice,
    ) -> ShfsResult<AreadResult> {
        if addr == 0 || addr > self.volsize {
            return Err(ShfsError::Invalid);
        }

        let r = match self.find(addr) {
            Some(r) => r,
            None => {
                log_debug!("cache: adding chunk {}", addr);
                self.add(addr, bd)?
            }
        };

        {
            let cce = self.cce(r);
            if cce.refcount.get() == 0 {
                self.alist_unlink(r);
                self.nb_ref_entries.set(self.nb_ref_entries.get() + 1);
            }
            cce.refcount.set(cce.refcount.get() + 1);
        }

        if self.cfg.readahead > 0 {
            self.readahead(addr, bd);
        }

        if self.tokens.is_done(self.cce(r).t.get()) {
            log_debug!("cache: chunk {} ready", addr);
            return Ok(AreadResult::Ready(r));
        }

        // Fetch still in progress: chain a waiter token for the caller.
        let Some(t) = self.tokens.pick() else {
            log_debug!("cache: out of aio tokens for chunk {}", addr);
            let cce = self.cce(r);
            cce.refcount.set(cce.refcount.get() - 1);
            if cce.refcount.get() == 0 {
                self.nb_ref_entries.set(self.nb_ref_entries.get() - 1);
                self.alist_append(r);
            }
            return Err(ShfsError::Again);
        };
        self.tokens.token(t).set_callback(cb, cb_cookie, cb_argp);
        self.chain_append(r, t);
        log_debug!("cache: chunk {} pending, waiter chained", addr);
        Ok(AreadResult::Pending(r, t))
    }

    /// Drop one reference. Only legal once the entry's I/O has completed;
    /// callers holding a pending waiter token use `release_ioabort`.
    pub(crate) fn release(&mut self, r: EntryRef) {
        let (addr, refcount, t, invalid) = {
            let cce = self.cce(r);
            (
                cce.addr.get(),
                cce.refcount.get(),
                cce.t.get(),
                cce.invalid.get(),
            )
        };
        log_debug!("cache: release chunk {} (refcount={})", addr, refcount);
        assert!(refcount > 0, "release of an unreferenced cache entry");
        assert!(
            self.tokens.is_done(t),
            "release while I/O is pending; use release_ioabort"
        );

        self.cce(r).refcount.set(refcount - 1);
        if refcount == 1 {
            self.nb_ref_entries.set(self.nb_ref_entries.get() - 1);
            if !invalid {
                self.alist_append(r);
            } else {
                log_debug!("cache: destroy invalid chunk {}", addr);
                self.unlink_entry(r);
                self.put_entry(r);
            }
        }
    }

    /// Drop one reference while abandoning a still-pending waiter token.
    /// The device read is not cancelled; remaining waiters are served when
    /// it completes, but `t`'s callback never fires.
    pub(crate) fn release_ioabort(&mut self, r: EntryRef, t: Option<TokenId>) {
        let (addr, refcount, entry_t) = {
            let cce = self.cce(r);
            (cce.addr.get(), cce.refcount.get(), cce.t.get())
        };
        let entry_done = self.tokens.is_done(entry_t);
        assert!(refcount > 0, "release of an unreferenced cache entry");
        assert!(
            entry_done || t.is_some(),
            "abort without a waiter token while I/O is pending"
        );

        if let Some(t) = t {
            if !self.tokens.is_done(Some(t)) {
                log_debug!("cache: abort waiter on chunk {}", addr);
                assert!(
                    !entry_done,
                    "waiter token still pending after entry completion"
                );
                self.chain_unlink(r, t);
            }
            self.tokens.put(t);
        }

        self.cce(r).refcount.set(refcount - 1);
        if refcount == 1 {
            self.nb_ref_entries.set(self.nb_ref_entries.get() - 1);
            if entry_done && self.cce(r).invalid.get() {
                log_debug!("cache: destroy invalid chunk {}", addr);
                self.unlink_entry(r);
                self.put_entry(r);
            } else {
                self.alist_append(r);
            }
        }
    }

    /// Obtain a chunk-sized scratch buffer: a blank entry with `addr == 0`,
    /// outside every list, referenced once from birth. Releasing it later
    /// destroys it (unless a fetch made it valid in the meantime).
    pub(crate) fn eblank(&mut self) -> ShfsResult<EntryRef> {
        let r = match self.pick_entry() {
            Some(r) => r,
            None => {
                let Some(r) = self.alist_find_idle() else {
                    return Err(ShfsError::Again);
                };
                log_debug!("cache: recycling chunk {} as blank", self.cce(r).addr.get());
                self.clist_unlink(r);
                self.alist_unlink(r);
                r
            }
        };

        let cce = self.cce(r);
        cce.refcount.set(1);
        cce.t.set(None);
        cce.addr.set(0);
        cce.invalid.set(true);
        self.nb_ref_entries.set(self.nb_ref_entries.get() + 1);
        Ok(r)
    }

    /// Destroy every entry on the availability list, spin-polling the
    /// device for entries whose fetch is still outstanding. Assumes a
    /// quiescent mount: no concurrent caller holds references.
    pub(crate) fn flush(&mut self, bd: &mut dyn BlockDevice, notify: &mut Vec<WaiterCb>) {
        log_debug!("cache: flushing");
        while let Some(r) = self.alist.first.get() {
            if self.cce(r).t.get().is_some() {
                log_debug!(
                    "cache: chunk {} I/O not done yet, waiting for completion",
                    self.cce(r).addr.get()
                );
                // Hold a reference so the completion cannot destroy the
                // entry under us on failure.
                self.cce(r).refcount.set(1);
                while self.cce(r).t.get().is_some() {
                    if let Some(done) = bd.poll_complete() {
                        self.complete_fetch(TokenId::from_tag(done.tag), done.ret, notify);
                    }
                }
                self.cce(r).refcount.set(0);
            }

            log_debug!("cache: releasing chunk {}", self.cce(r).addr.get());
            self.unlink_entry(r);
            self.put_entry(r);
        }
    }

    /// Start a synchronous-style fetch of `addr` into a held blank entry.
    /// The entry stays outside the index (`addr` remains 0); only its
    /// buffer is loaded.
    pub(crate) fn start_blank_fetch(
        &mut self,
        r: EntryRef,
        addr: Chunk,
        bd: &mut dyn BlockDevice,
    ) -> ShfsResult<()> {
        debug_assert!(self.cce(r).addr.get() == 0, "fetch into a non-blank entry");
        self.cce(r).invalid.set(true);
        let t = self.submit_fetch(r, addr, bd)?;
        self.cce(r).t.set(Some(t));
        Ok(())
    }

    // -----------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------

    /// Handle the device completion of an entry's fetch: flip validity,
    /// then fan the result out to the chained waiters in registration
    /// order. Callbacks are collected into `notify` for the caller to
    /// invoke once the cache lock is dropped.
    pub(crate) fn complete_fetch(&mut self, t: TokenId, ret: i64, notify: &mut Vec<WaiterCb>) {
        let r = self
            .tokens
            .token(t)
            .owner
            .get()
            .expect("completion for a token without an owning entry");

        let addr = {
            let cce = self.cce(r);
            assert!(
                cce.t.get() == Some(t),
                "completion token is not the entry's in-flight token"
            );
            assert!(
                !(cce.refcount.get() == 0 && cce.chain.first.get().is_some()),
                "waiters chained on an unreferenced entry"
            );
            cce.t.set(None);
            cce.invalid.set(ret < 0);
            cce.addr.get()
        };

        // I/O failed and nobody is interested (read-ahead): destroy now.
        if self.cce(r).refcount.get() == 0 && self.cce(r).invalid.get() {
            log_debug!("cache: destroy failed I/O at chunk {}: {}", addr, ret);
            self.unlink_entry(r);
            self.put_entry(r);
            self.tokens.put(t);
            return;
        }

        // Fan out to the waiter chain, clearing it.
        let mut cur = {
            let chain = &self.cce(r).chain;
            let first = chain.first.get();
            chain.first.set(None);
            chain.last.set(None);
            first
        };
        while let Some(w) = cur {
            log_debug!("cache: notify waiter on chunk {}", addr);
            let token = self.tokens.token(w);
            cur = token.next.get();
            token.prev.set(None);
            token.next.set(None);
            token.ret.set(ret);
            token.infly.set(false);
            if let Some(cb) = token.cb.get() {
                notify.push((cb, ret, token.cb_cookie.get(), token.cb_argp.get()));
            }
        }

        self.tokens.put(t);
    }
}
