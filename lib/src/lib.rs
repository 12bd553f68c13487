#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod alignment;
pub mod log;
pub mod ring;
pub mod testing;

#[doc(hidden)]
pub use paste;

pub use alignment::{align_down, align_up, floor_log2, is_pow2};
pub use log::{LogLevel, log_enabled, log_get_level, log_register_sink, log_set_level};
pub use ring::IndexRing;
pub use testing::{SuiteOutcome, TestResult};
