#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod aio;
pub mod cache;
pub mod error;
pub mod fio;
pub mod vol;

pub mod cache_tests;

/// 1-based chunk address on a volume. Address 0 is reserved: on disk it
/// holds the volume metadata chunk, in cache it marks blank entries.
pub type Chunk = u64;

pub use aio::{AioNotify, AioToken, AioTokenPool, TokenId};
pub use cache::{AreadResult, CacheConfig, CacheInfo, EntryRef};
pub use error::{ShfsError, ShfsResult};
pub use fio::{FileHandle, FileSpec};
pub use vol::{EntryStats, Volume, VolumeParams, register_free_mem_probe};
