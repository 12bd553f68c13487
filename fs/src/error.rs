//! Error model.
//!
//! Errors cross the public surface as an enum; across the AIO completion
//! path they travel as negative errno values inside a token's `ret`, the
//! only representation that fits a single integer word.  `errno()` and
//! `from_ret()` convert between the two.

pub type ShfsResult<T> = Result<T, ShfsError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShfsError {
    /// No such file.
    NoEntry,
    /// Device-level I/O failure.
    Io,
    /// Transient exhaustion (buffers, tokens, device queue); retry after
    /// yielding or releasing.
    Again,
    /// Allocation failed at construction time.
    NoMemory,
    /// Operation not permitted by the device open mode.
    Access,
    /// Volume is not mounted.
    NoDevice,
    /// Bad address, range, or parameter.
    Invalid,
}

impl ShfsError {
    /// The error as a negative errno value.
    pub const fn errno(self) -> i64 {
        match self {
            ShfsError::NoEntry => -2,
            ShfsError::Io => -5,
            ShfsError::Again => -11,
            ShfsError::NoMemory => -12,
            ShfsError::Access => -13,
            ShfsError::NoDevice => -19,
            ShfsError::Invalid => -22,
        }
    }

    /// Map a completion result back to an error. `ret` must be negative;
    /// unknown errno values collapse to `Io`.
    pub const fn from_ret(ret: i64) -> Self {
        match ret {
            -2 => ShfsError::NoEntry,
            -11 => ShfsError::Again,
            -12 => ShfsError::NoMemory,
            -13 => ShfsError::Access,
            -19 => ShfsError::NoDevice,
            -22 => ShfsError::Invalid,
            _ => ShfsError::Io,
        }
    }
}

impl From<shfs_blkdev::BlkdevError> for ShfsError {
    fn from(err: shfs_blkdev::BlkdevError) -> Self {
        match err {
            shfs_blkdev::BlkdevError::QueueFull => ShfsError::Again,
            shfs_blkdev::BlkdevError::Access => ShfsError::Access,
            shfs_blkdev::BlkdevError::BadRange => ShfsError::Invalid,
        }
    }
}

impl From<shfs_mm::PoolError> for ShfsError {
    fn from(err: shfs_mm::PoolError) -> Self {
        match err {
            shfs_mm::PoolError::NoMemory => ShfsError::NoMemory,
            shfs_mm::PoolError::BadAlign => ShfsError::Invalid,
        }
    }
}
