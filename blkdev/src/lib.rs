#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod blkdev;
pub mod memblk;

pub mod memblk_tests;

pub use blkdev::{BioCompletion, BioRequest, BlkdevError, BlkdevMode, BlockDevice, Sector};
pub use memblk::MemBlkDevice;
