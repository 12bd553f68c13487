//! Tests for the chunk cache engine: miss/hit lifecycle, waiter fan-out,
//! failure handling, LRU recycling, aborts, blanks, growth, and flush.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use shfs_blkdev::{BlkdevMode, MemBlkDevice};
use shfs_lib::testing::TestResult;
use shfs_lib::{assert_eq_test, assert_ok, assert_test, define_test_suite, fail, pass};

use crate::Chunk;
use crate::cache::{AreadResult, CacheConfig, EntryRef};
use crate::error::ShfsError;
use crate::vol::{Volume, VolumeParams, register_free_mem_probe};

const SSIZE: u32 = 512;
const CHUNKSIZE: u32 = 4096;
const SFACTOR: u64 = (CHUNKSIZE / SSIZE) as u64;

/// Device whose chunk `c` is filled with the byte `c`.
fn patterned_device(volsize: Chunk) -> MemBlkDevice {
    let mut dev = MemBlkDevice::new(SSIZE, (volsize + 1) * SFACTOR, BlkdevMode::RO);
    for c in 1..=volsize {
        let chunk = vec![c as u8; CHUNKSIZE as usize];
        dev.fill(c * SFACTOR, &chunk);
    }
    dev
}

fn params(volsize: Chunk) -> VolumeParams {
    VolumeParams {
        name: String::from("cachetest"),
        chunksize: CHUNKSIZE,
        ioalign: SSIZE,
        volsize,
        expected_entries: 0,
        files: Vec::new(),
    }
}

fn config(nb_buffers: u32, readahead: u32) -> CacheConfig {
    CacheConfig {
        nb_buffers,
        readahead,
        ..CacheConfig::default()
    }
}

fn mount(volsize: Chunk, nb_buffers: u32, readahead: u32) -> Result<Volume, ShfsError> {
    Volume::mount(
        Box::new(patterned_device(volsize)),
        params(volsize),
        config(nb_buffers, readahead),
    )
}

/// Records `(argp, ret)` pairs delivered to waiter callbacks. Passed to
/// the engine by address through the callback cookie word.
struct CallbackLog {
    events: Mutex<Vec<(usize, i64)>>,
}

impl CallbackLog {
    const fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    fn cookie(&self) -> usize {
        self as *const Self as usize
    }

    fn events(&self) -> Vec<(usize, i64)> {
        self.events.lock().clone()
    }
}

fn record_completion(ret: i64, cookie: usize, argp: usize) {
    // SAFETY: the cookie carries the address of the test's CallbackLog,
    // which outlives the volume that delivers the callback.
    let log = unsafe { &*(cookie as *const CallbackLog) };
    log.events.lock().push((argp, ret));
}

// =============================================================================
// Address validation
// =============================================================================

pub fn test_aread_rejects_bad_addresses() -> TestResult {
    let vol = assert_ok!(mount(8, 4, 0));
    assert_test!(
        matches!(vol.cache_aread(0, None, 0, 0), Err(ShfsError::Invalid)),
        "address 0 is reserved"
    );
    assert_test!(
        matches!(vol.cache_aread(9, None, 0, 0), Err(ShfsError::Invalid)),
        "address beyond volsize rejected"
    );
    pass!()
}

pub fn test_engine_requires_mount() -> TestResult {
    let vol = assert_ok!(mount(8, 4, 0));
    vol.unmount();
    assert_test!(matches!(
        vol.cache_aread(1, None, 0, 0),
        Err(ShfsError::NoDevice)
    ));
    assert_test!(matches!(vol.cache_eblank(), Err(ShfsError::NoDevice)));
    pass!()
}

// =============================================================================
// Miss, completion, hit
// =============================================================================

pub fn test_cold_miss_then_ready_hit() -> TestResult {
    let log = CallbackLog::new();
    let vol = assert_ok!(mount(16, 4, 0));

    let first = assert_ok!(vol.cache_aread(7, Some(record_completion), log.cookie(), 0));
    let (entry, token) = match first {
        AreadResult::Pending(e, t) => (e, t),
        AreadResult::Ready(_) => return fail!("cold miss must be pending"),
    };
    let stats = vol.entry_stats(entry);
    assert_eq_test!(stats.addr, 7);
    assert_eq_test!(stats.refcount, 1);
    assert_test!(stats.in_flight, "fetch outstanding before poll");
    assert_test!(stats.invalid, "buffer not valid while in flight");

    vol.poll();
    assert_test!(vol.aio_is_done(Some(token)));
    assert_eq_test!(log.events(), vec![(0usize, CHUNKSIZE as i64)]);
    assert_eq_test!(vol.aio_finalize(token), CHUNKSIZE as i64);

    // Immediate second aread: hit, no I/O, refcount 2.
    let second = assert_ok!(vol.cache_aread(7, None, 0, 0));
    let entry2 = match second {
        AreadResult::Ready(e) => e,
        AreadResult::Pending(..) => return fail!("hit must be ready"),
    };
    assert_eq_test!(entry2, entry, "same entry served");
    assert_eq_test!(vol.entry_stats(entry).refcount, 2);

    let all_sevens = assert_ok!(vol.with_chunk_data(entry, |data| data.iter().all(|&b| b == 7)));
    assert_test!(all_sevens, "chunk content delivered");

    vol.cache_release(entry);
    vol.cache_release(entry);
    assert_eq_test!(vol.entry_stats(entry).refcount, 0);
    pass!()
}

// =============================================================================
// Waiter fan-out
// =============================================================================

pub fn test_fanout_in_registration_order() -> TestResult {
    let log = CallbackLog::new();
    let vol = assert_ok!(mount(16, 4, 0));

    let mut entries = [None; 3];
    let mut tokens = [None; 3];
    for waiter in 0..3usize {
        let result = assert_ok!(vol.cache_aread(9, Some(record_completion), log.cookie(), waiter));
        match result {
            AreadResult::Pending(e, t) => {
                entries[waiter] = Some(e);
                tokens[waiter] = Some(t);
            }
            AreadResult::Ready(_) => return fail!("no completion polled yet"),
        }
    }
    assert_eq_test!(entries[0], entries[1]);
    assert_eq_test!(entries[1], entries[2]);
    assert_test!(tokens[0] != tokens[1] && tokens[1] != tokens[2]);
    let entry = match entries[0] {
        Some(e) => e,
        None => return fail!("missing entry"),
    };
    assert_eq_test!(vol.entry_stats(entry).refcount, 3);
    assert_eq_test!(vol.cache_info().nb_entries, 1, "one entry, one device read");

    vol.poll();
    let expected: Vec<(usize, i64)> = (0..3).map(|w| (w, CHUNKSIZE as i64)).collect();
    assert_eq_test!(log.events(), expected, "waiters notified in call order");

    for t in tokens {
        match t {
            Some(t) => assert_eq_test!(vol.aio_finalize(t), CHUNKSIZE as i64),
            None => return fail!("missing token"),
        }
    }
    for _ in 0..3 {
        vol.cache_release(entry);
    }
    pass!()
}

pub fn test_failure_fanout_destroys_on_final_release() -> TestResult {
    let log = CallbackLog::new();
    let mut dev = patterned_device(16);
    dev.inject_fault(9 * SFACTOR, -5);
    let vol = assert_ok!(Volume::mount(Box::new(dev), params(16), config(4, 0)));

    let mut entry = None;
    let mut tokens = Vec::new();
    for waiter in 0..3usize {
        match assert_ok!(vol.cache_aread(9, Some(record_completion), log.cookie(), waiter)) {
            AreadResult::Pending(e, t) => {
                entry = Some(e);
                tokens.push(t);
            }
            AreadResult::Ready(_) => return fail!("no completion polled yet"),
        }
    }
    let entry = match entry {
        Some(e) => e,
        None => return fail!("missing entry"),
    };

    vol.poll();
    let expected: Vec<(usize, i64)> = (0..3).map(|w| (w, -5i64)).collect();
    assert_eq_test!(log.events(), expected, "all waiters see the error");

    let stats = vol.entry_stats(entry);
    assert_test!(stats.invalid, "entry marked invalid on device error");
    assert_eq_test!(stats.refcount, 3, "entry survives while referenced");

    for t in tokens {
        assert_eq_test!(vol.aio_finalize(t), -5);
    }
    for _ in 0..3 {
        vol.cache_release(entry);
    }
    assert_eq_test!(
        vol.cache_info().nb_entries,
        0,
        "failed entry destroyed on final release"
    );
    pass!()
}

// =============================================================================
// Eviction
// =============================================================================

fn read_and_release(vol: &Volume, addr: Chunk) -> Result<EntryRef, ShfsError> {
    let result = vol.cache_aread(addr, None, 0, 0)?;
    let entry = result.entry();
    if let AreadResult::Pending(_, t) = result {
        vol.poll();
        let ret = vol.aio_finalize(t);
        if ret < 0 {
            vol.cache_release(entry);
            return Err(ShfsError::from_ret(ret));
        }
    }
    vol.cache_release(entry);
    Ok(entry)
}

pub fn test_lru_recycles_oldest_idle_entry() -> TestResult {
    let vol = assert_ok!(mount(8, 2, 0));

    assert_ok!(read_and_release(&vol, 1));
    assert_ok!(read_and_release(&vol, 2));
    assert_eq_test!(vol.cache_info().nb_entries, 2, "pool exhausted");

    // Third address recycles the availability-list head: chunk 1.
    let third = assert_ok!(vol.cache_aread(3, None, 0, 0));
    let entry = third.entry();
    if let AreadResult::Pending(_, t) = third {
        vol.poll();
        assert_eq_test!(vol.aio_finalize(t), CHUNKSIZE as i64);
    }
    assert_eq_test!(vol.entry_stats(entry).addr, 3);
    assert_eq_test!(vol.cache_info().nb_entries, 2);
    vol.cache_release(entry);

    // Chunk 2 must still be cached; chunk 1 was the victim.
    match assert_ok!(vol.cache_aread(2, None, 0, 0)) {
        AreadResult::Ready(e) => vol.cache_release(e),
        AreadResult::Pending(..) => return fail!("chunk 2 should have survived eviction"),
    }
    pass!()
}

pub fn test_eagain_only_while_every_entry_in_flight() -> TestResult {
    let vol = assert_ok!(mount(8, 2, 0));

    // Two fetches started, then abandoned: both entries sit on the
    // availability list with I/O still outstanding.
    for addr in [1u64, 2u64] {
        match assert_ok!(vol.cache_aread(addr, None, 0, 0)) {
            AreadResult::Pending(e, t) => vol.cache_release_ioabort(e, Some(t)),
            AreadResult::Ready(_) => return fail!("cold miss must be pending"),
        }
    }

    // No idle entry to steal: transient exhaustion.
    assert_test!(matches!(
        vol.cache_aread(3, None, 0, 0),
        Err(ShfsError::Again)
    ));

    // Once the fetches complete, the oldest idle entry is recycled.
    vol.poll();
    match assert_ok!(vol.cache_aread(3, None, 0, 0)) {
        AreadResult::Pending(e, t) => {
            vol.poll();
            assert_eq_test!(vol.aio_finalize(t), CHUNKSIZE as i64);
            vol.cache_release(e);
        }
        AreadResult::Ready(_) => return fail!("chunk 3 was never fetched before"),
    }
    pass!()
}

// =============================================================================
// Abort
// =============================================================================

pub fn test_ioabort_suppresses_callback() -> TestResult {
    let log = CallbackLog::new();
    let vol = assert_ok!(mount(16, 4, 0));

    let result = assert_ok!(vol.cache_aread(11, Some(record_completion), log.cookie(), 0));
    let (entry, token) = match result {
        AreadResult::Pending(e, t) => (e, t),
        AreadResult::Ready(_) => return fail!("cold miss must be pending"),
    };

    vol.cache_release_ioabort(entry, Some(token));
    assert_eq_test!(vol.entry_stats(entry).refcount, 0);

    // Completion arrives later; the aborted waiter must not be called.
    vol.poll();
    assert_test!(log.events().is_empty(), "aborted token never fires");
    let stats = vol.entry_stats(entry);
    assert_test!(!stats.in_flight, "fetch completed");
    assert_test!(!stats.invalid, "entry became a valid idle entry");

    // The chunk is now served from cache.
    match assert_ok!(vol.cache_aread(11, None, 0, 0)) {
        AreadResult::Ready(e) => vol.cache_release(e),
        AreadResult::Pending(..) => return fail!("completed fetch should be a hit"),
    }
    pass!()
}

// =============================================================================
// Read-ahead
// =============================================================================

pub fn test_readahead_fills_window() -> TestResult {
    let vol = assert_ok!(mount(16, 8, 4));

    match assert_ok!(vol.cache_aread(1, None, 0, 0)) {
        AreadResult::Pending(e, t) => {
            // Demand chunk 1 plus read-ahead of 2..=5.
            assert_eq_test!(vol.cache_info().nb_entries, 5);
            vol.poll();
            assert_eq_test!(vol.aio_finalize(t), CHUNKSIZE as i64);
            vol.cache_release(e);
        }
        AreadResult::Ready(_) => return fail!("cold miss must be pending"),
    }

    // The read-ahead entries carry no references.
    assert_eq_test!(vol.cache_info().nb_ref_entries, 0);

    // And they are hits now.
    for addr in 2..=5u64 {
        match assert_ok!(vol.cache_aread(addr, None, 0, 0)) {
            AreadResult::Ready(e) => vol.cache_release(e),
            AreadResult::Pending(..) => return fail!("read-ahead chunk should be cached"),
        }
    }
    pass!()
}

pub fn test_readahead_stops_at_end_of_volume() -> TestResult {
    let vol = assert_ok!(mount(8, 8, 4));

    match assert_ok!(vol.cache_aread(7, None, 0, 0)) {
        AreadResult::Pending(e, t) => {
            // Only chunk 8 fits in the window; 9..=11 are past the volume.
            assert_eq_test!(vol.cache_info().nb_entries, 2);
            vol.poll();
            assert_eq_test!(vol.aio_finalize(t), CHUNKSIZE as i64);
            vol.cache_release(e);
        }
        AreadResult::Ready(_) => return fail!("cold miss must be pending"),
    }
    pass!()
}

pub fn test_readahead_failure_is_silent() -> TestResult {
    let log = CallbackLog::new();
    let mut dev = patterned_device(16);
    dev.inject_fault(3 * SFACTOR, -5);
    let vol = assert_ok!(Volume::mount(Box::new(dev), params(16), config(8, 2)));

    match assert_ok!(vol.cache_aread(2, Some(record_completion), log.cookie(), 0)) {
        AreadResult::Pending(e, t) => {
            assert_eq_test!(vol.cache_info().nb_entries, 3, "demand + read-ahead of 3, 4");
            vol.poll();
            assert_eq_test!(vol.aio_finalize(t), CHUNKSIZE as i64);
            vol.cache_release(e);
        }
        AreadResult::Ready(_) => return fail!("cold miss must be pending"),
    }

    // The failed speculative entry was destroyed quietly; only the demand
    // callback fired.
    assert_eq_test!(log.events(), vec![(0usize, CHUNKSIZE as i64)]);
    assert_eq_test!(vol.cache_info().nb_entries, 2, "chunks 2 and 4 remain");
    pass!()
}

// =============================================================================
// Token exhaustion
// =============================================================================

pub fn test_token_exhaustion_undoes_refcount_bump() -> TestResult {
    let cfg = CacheConfig {
        nb_buffers: 4,
        readahead: 0,
        nb_tokens: 2,
        ..CacheConfig::default()
    };
    let vol = assert_ok!(Volume::mount(
        Box::new(patterned_device(8)),
        params(8),
        cfg
    ));

    // The miss consumes one in-flight token and one waiter token.
    let first = assert_ok!(vol.cache_aread(1, None, 0, 0));
    let (entry, token) = match first {
        AreadResult::Pending(e, t) => (e, t),
        AreadResult::Ready(_) => return fail!("cold miss must be pending"),
    };

    // No token left for a second waiter; the refcount bump is undone.
    assert_test!(matches!(
        vol.cache_aread(1, None, 0, 0),
        Err(ShfsError::Again)
    ));
    assert_eq_test!(vol.entry_stats(entry).refcount, 1);

    vol.poll();
    assert_eq_test!(vol.aio_finalize(token), CHUNKSIZE as i64);
    vol.cache_release(entry);
    pass!()
}

// =============================================================================
// Round-trip laws
// =============================================================================

pub fn test_release_restores_refcount() -> TestResult {
    let vol = assert_ok!(mount(8, 4, 0));
    let entry = assert_ok!(read_and_release(&vol, 5));
    let before = vol.entry_stats(entry).refcount;

    match assert_ok!(vol.cache_aread(5, None, 0, 0)) {
        AreadResult::Ready(e) => {
            assert_eq_test!(vol.entry_stats(e).refcount, before + 1);
            vol.cache_release(e);
            assert_eq_test!(vol.entry_stats(e).refcount, before);
        }
        AreadResult::Pending(..) => return fail!("cached chunk should be ready"),
    }
    pass!()
}

pub fn test_eblank_release_restores_counts() -> TestResult {
    let vol = assert_ok!(mount(8, 4, 0));
    let before = vol.cache_info().nb_entries;

    let blank = assert_ok!(vol.cache_eblank());
    let stats = vol.entry_stats(blank);
    assert_eq_test!(stats.addr, 0, "blank entries carry the reserved address");
    assert_eq_test!(stats.refcount, 1, "blank entries are referenced from birth");
    assert_test!(stats.invalid);
    assert_eq_test!(vol.cache_info().nb_entries, before + 1);

    vol.cache_release(blank);
    assert_eq_test!(
        vol.cache_info().nb_entries,
        before,
        "releasing a blank destroys it"
    );
    pass!()
}

pub fn test_eblank_steals_idle_entry_under_pressure() -> TestResult {
    let vol = assert_ok!(mount(8, 1, 0));

    assert_ok!(read_and_release(&vol, 4));
    assert_eq_test!(vol.cache_info().nb_entries, 1);

    // Pool is exhausted; the blank steals the idle cached entry and the
    // chunk drops out of the index.
    let blank = assert_ok!(vol.cache_eblank());
    assert_eq_test!(vol.entry_stats(blank).addr, 0);
    assert_eq_test!(vol.cache_info().nb_entries, 1);

    // Nothing left to steal while the blank is held.
    assert_test!(matches!(vol.cache_eblank(), Err(ShfsError::Again)));

    vol.cache_release(blank);
    pass!()
}

// =============================================================================
// Heap growth
// =============================================================================

pub fn test_grow_serves_heap_entries_when_pool_empty() -> TestResult {
    let cfg = CacheConfig {
        nb_buffers: 0,
        readahead: 0,
        grow: true,
        ..CacheConfig::default()
    };
    let vol = assert_ok!(Volume::mount(
        Box::new(patterned_device(8)),
        params(8),
        cfg
    ));

    let result = assert_ok!(vol.cache_aread(2, None, 0, 0));
    let (entry, token) = match result {
        AreadResult::Pending(e, t) => (e, t),
        AreadResult::Ready(_) => return fail!("cold miss must be pending"),
    };
    assert_test!(
        matches!(entry, EntryRef::Heap(_)),
        "heap-only configuration allocates overflow entries"
    );
    assert_eq_test!(vol.cache_info().nb_entries, 1);

    vol.poll();
    assert_eq_test!(vol.aio_finalize(token), CHUNKSIZE as i64);
    let all_twos = assert_ok!(vol.with_chunk_data(entry, |data| data.iter().all(|&b| b == 2)));
    assert_test!(all_twos);
    vol.cache_release(entry);

    vol.flush();
    assert_eq_test!(vol.cache_info().nb_entries, 0);
    pass!()
}

fn probe_no_memory() -> usize {
    0
}

fn probe_plenty() -> usize {
    usize::MAX
}

pub fn test_grow_respects_free_memory_threshold() -> TestResult {
    let cfg = CacheConfig {
        nb_buffers: 0,
        readahead: 0,
        grow: true,
        grow_threshold: 1 << 20,
        ..CacheConfig::default()
    };
    let vol = assert_ok!(Volume::mount(
        Box::new(patterned_device(8)),
        params(8),
        cfg
    ));

    register_free_mem_probe(probe_no_memory);
    assert_test!(
        matches!(vol.cache_aread(1, None, 0, 0), Err(ShfsError::Again)),
        "growth refused below the threshold"
    );

    register_free_mem_probe(probe_plenty);
    match assert_ok!(vol.cache_aread(1, None, 0, 0)) {
        AreadResult::Pending(e, t) => {
            vol.poll();
            assert_eq_test!(vol.aio_finalize(t), CHUNKSIZE as i64);
            vol.cache_release(e);
        }
        AreadResult::Ready(_) => return fail!("cold miss must be pending"),
    }
    pass!()
}

// =============================================================================
// Flush
// =============================================================================

pub fn test_flush_waits_for_inflight_io() -> TestResult {
    let vol = assert_ok!(mount(8, 4, 0));

    // Abandoned fetch: entry on the availability list, I/O outstanding.
    match assert_ok!(vol.cache_aread(3, None, 0, 0)) {
        AreadResult::Pending(e, t) => vol.cache_release_ioabort(e, Some(t)),
        AreadResult::Ready(_) => return fail!("cold miss must be pending"),
    }
    assert_eq_test!(vol.cache_info().nb_entries, 1);

    vol.flush();
    assert_eq_test!(vol.cache_info().nb_entries, 0, "flush destroyed the entry");
    pass!()
}

define_test_suite!(
    cache,
    [
        test_aread_rejects_bad_addresses,
        test_engine_requires_mount,
        test_cold_miss_then_ready_hit,
        test_fanout_in_registration_order,
        test_failure_fanout_destroys_on_final_release,
        test_lru_recycles_oldest_idle_entry,
        test_eagain_only_while_every_entry_in_flight,
        test_ioabort_suppresses_callback,
        test_readahead_fills_window,
        test_readahead_stops_at_end_of_volume,
        test_readahead_failure_is_silent,
        test_token_exhaustion_undoes_refcount_bump,
        test_release_restores_refcount,
        test_eblank_release_restores_counts,
        test_eblank_steals_idle_entry_under_pressure,
        test_grow_serves_heap_entries_when_pool_empty,
        test_grow_respects_free_memory_threshold,
        test_flush_waits_for_inflight_io,
    ]
);
