#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod mempool;
pub mod region;


pub use mempool::{Mempool, ObjId, PoolError, PoolLayout};
pub use region::AlignedRegion;

/// Minimum alignment of pool-internal structures (64-bit words).
pub const MIN_ALIGN: usize = 8;
