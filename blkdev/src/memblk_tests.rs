//! Tests for the RAM-backed block device: queue discipline, transfer
//! correctness, access modes, and fault injection.

use alloc::vec;

use shfs_lib::testing::TestResult;
use shfs_lib::{assert_eq_test, assert_some, assert_test, define_test_suite, pass};

use crate::blkdev::{BioRequest, BlkdevError, BlkdevMode, BlockDevice};
use crate::memblk::{MEMBLK_MAX_PENDING, MemBlkDevice};

const SSIZE: u32 = 512;

fn patterned_device(nb_sectors: u64, mode: BlkdevMode) -> MemBlkDevice {
    let mut dev = MemBlkDevice::new(SSIZE, nb_sectors, mode);
    for s in 0..nb_sectors {
        let sector = vec![s as u8; SSIZE as usize];
        dev.fill(s, &sector);
    }
    dev
}

pub fn test_memblk_read_stays_pending_until_poll() -> TestResult {
    let mut dev = patterned_device(8, BlkdevMode::RO);
    let mut buf = vec![0u8; SSIZE as usize];

    // SAFETY: buf outlives the completion polled below.
    let submitted = unsafe {
        dev.submit(BioRequest {
            sector: 3,
            nb_sectors: 1,
            write: false,
            buf: buf.as_mut_ptr(),
            tag: 7,
        })
    };
    assert_test!(submitted.is_ok());
    assert_eq_test!(dev.pending_count(), 1, "request queued, not yet served");
    assert_test!(buf.iter().all(|&b| b == 0), "no transfer before poll");

    let done = assert_some!(dev.poll_complete());
    assert_eq_test!(done.tag, 7);
    assert_eq_test!(done.ret, SSIZE as i64);
    assert_test!(buf.iter().all(|&b| b == 3), "sector content delivered");
    assert_test!(dev.poll_complete().is_none(), "queue drained");
    pass!()
}

pub fn test_memblk_completions_in_submission_order() -> TestResult {
    let mut dev = patterned_device(8, BlkdevMode::RO);
    let mut bufs = [
        vec![0u8; SSIZE as usize],
        vec![0u8; SSIZE as usize],
        vec![0u8; SSIZE as usize],
    ];

    for (i, buf) in bufs.iter_mut().enumerate() {
        // SAFETY: each buffer outlives its polled completion.
        let submitted = unsafe {
            dev.submit(BioRequest {
                sector: i as u64,
                nb_sectors: 1,
                write: false,
                buf: buf.as_mut_ptr(),
                tag: i as u64,
            })
        };
        assert_test!(submitted.is_ok());
    }

    for expect in 0..3u64 {
        let done = assert_some!(dev.poll_complete());
        assert_eq_test!(done.tag, expect, "FIFO completion order");
    }
    pass!()
}

pub fn test_memblk_write_roundtrip() -> TestResult {
    let mut dev = MemBlkDevice::new(SSIZE, 4, BlkdevMode::RW);
    let mut out = vec![0xabu8; SSIZE as usize];
    let mut back = vec![0u8; SSIZE as usize];

    // SAFETY: buffers outlive their polled completions.
    unsafe {
        assert_test!(
            dev.submit(BioRequest {
                sector: 2,
                nb_sectors: 1,
                write: true,
                buf: out.as_mut_ptr(),
                tag: 0,
            })
            .is_ok()
        );
        assert_some!(dev.poll_complete());
        assert_test!(
            dev.submit(BioRequest {
                sector: 2,
                nb_sectors: 1,
                write: false,
                buf: back.as_mut_ptr(),
                tag: 1,
            })
            .is_ok()
        );
    }
    assert_some!(dev.poll_complete());
    assert_test!(back.iter().all(|&b| b == 0xab), "write visible to read");
    pass!()
}

pub fn test_memblk_rejects_write_on_readonly() -> TestResult {
    let mut dev = MemBlkDevice::new(SSIZE, 4, BlkdevMode::RO);
    let mut buf = vec![0u8; SSIZE as usize];
    // SAFETY: rejected requests are not queued.
    let result = unsafe {
        dev.submit(BioRequest {
            sector: 0,
            nb_sectors: 1,
            write: true,
            buf: buf.as_mut_ptr(),
            tag: 0,
        })
    };
    assert_eq_test!(result, Err(BlkdevError::Access));
    pass!()
}

pub fn test_memblk_rejects_out_of_range() -> TestResult {
    let mut dev = MemBlkDevice::new(SSIZE, 4, BlkdevMode::RO);
    let mut buf = vec![0u8; 2 * SSIZE as usize];
    // SAFETY: rejected requests are not queued.
    let result = unsafe {
        dev.submit(BioRequest {
            sector: 3,
            nb_sectors: 2,
            write: false,
            buf: buf.as_mut_ptr(),
            tag: 0,
        })
    };
    assert_eq_test!(result, Err(BlkdevError::BadRange));
    pass!()
}

pub fn test_memblk_queue_depth_limit() -> TestResult {
    let mut dev = patterned_device(4, BlkdevMode::RO);
    let mut buf = vec![0u8; SSIZE as usize];

    for tag in 0..MEMBLK_MAX_PENDING as u64 {
        // SAFETY: all completions are polled before buf is dropped.
        let submitted = unsafe {
            dev.submit(BioRequest {
                sector: 0,
                nb_sectors: 1,
                write: false,
                buf: buf.as_mut_ptr(),
                tag,
            })
        };
        assert_test!(submitted.is_ok());
    }
    // SAFETY: rejected requests are not queued.
    let overflow = unsafe {
        dev.submit(BioRequest {
            sector: 0,
            nb_sectors: 1,
            write: false,
            buf: buf.as_mut_ptr(),
            tag: 999,
        })
    };
    assert_eq_test!(overflow, Err(BlkdevError::QueueFull));

    while dev.poll_complete().is_some() {}
    assert_eq_test!(dev.pending_count(), 0);
    pass!()
}

pub fn test_memblk_fault_injection() -> TestResult {
    let mut dev = patterned_device(4, BlkdevMode::RO);
    dev.inject_fault(1, -5);
    let mut buf = vec![0u8; SSIZE as usize];

    // SAFETY: buf outlives the polled completion.
    let submitted = unsafe {
        dev.submit(BioRequest {
            sector: 1,
            nb_sectors: 1,
            write: false,
            buf: buf.as_mut_ptr(),
            tag: 0,
        })
    };
    assert_test!(submitted.is_ok());
    let done = assert_some!(dev.poll_complete());
    assert_eq_test!(done.ret, -5, "injected errno surfaces in completion");
    assert_test!(buf.iter().all(|&b| b == 0), "no transfer on fault");

    dev.clear_fault(1);
    pass!()
}

define_test_suite!(
    memblk,
    [
        test_memblk_read_stays_pending_until_poll,
        test_memblk_completions_in_submission_order,
        test_memblk_write_roundtrip,
        test_memblk_rejects_write_on_readonly,
        test_memblk_rejects_out_of_range,
        test_memblk_queue_depth_limit,
        test_memblk_fault_injection,
    ]
);
