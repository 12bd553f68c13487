//! Logging for the SHFS crates.
//!
//! All log output funnels through a single **sink** function pointer. The
//! default sink drops every line; an embedding environment (kernel serial
//! console, test capture buffer, stderr shim) registers its own sink once
//! during startup and receives every line that passes the level gate.
//!
//! # Sink contract
//!
//! The sink receives the pre-formatted arguments for a **single log line**
//! and is responsible for:
//!
//! 1. Writing the formatted text atomically (no interleaving between
//!    concurrent emitters).
//! 2. Appending a trailing newline after the text.
//!
//! Callers therefore never include a newline in their format string.

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

// ---------------------------------------------------------------------------
// Log levels
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Fixed-width tag used by sinks that want a level prefix.
    pub const fn tag(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN ",
            LogLevel::Info => "INFO ",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[inline(always)]
fn is_enabled(level: LogLevel) -> bool {
    level as u8 <= CURRENT_LEVEL.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Sink dispatch
// ---------------------------------------------------------------------------

/// Signature of a log sink.
pub type LogSink = fn(LogLevel, fmt::Arguments<'_>);

/// Stored as a raw pointer; `null` means "drop the line".
static SINK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

#[inline]
fn dispatch(level: LogLevel, args: fmt::Arguments<'_>) {
    let ptr = SINK.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: `log_register_sink` only stores valid `LogSink` fn pointers,
    // which are the same size as `*mut ()` on all supported targets.
    let sink: LogSink = unsafe { core::mem::transmute(ptr) };
    sink(level, args);
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Register the sink that receives every enabled log line.
pub fn log_register_sink(sink: LogSink) {
    SINK.store(sink as *mut (), Ordering::Release);
}

pub fn log_set_level(level: LogLevel) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn log_get_level() -> LogLevel {
    LogLevel::from_raw(CURRENT_LEVEL.load(Ordering::Relaxed))
}

pub fn log_enabled(level: LogLevel) -> bool {
    is_enabled(level)
}

/// Emit a formatted log line at the given level.
///
/// The sink appends a trailing newline — callers should **not** include
/// one in their format string.
pub fn log_args(level: LogLevel, args: fmt::Arguments<'_>) {
    if !is_enabled(level) {
        return;
    }
    dispatch(level, args);
}

// ---------------------------------------------------------------------------
// Macros
// ---------------------------------------------------------------------------

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log::log_args($crate::log::LogLevel::Error, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log::log_args($crate::log::LogLevel::Warn, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::log::log_args($crate::log::LogLevel::Info, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::log::log_args($crate::log::LogLevel::Debug, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::log::log_args($crate::log::LogLevel::Trace, ::core::format_args!($($arg)*))
    };
}
