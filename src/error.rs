//! Error types and the fatal-report path
//!
//! Design: Two classes of failure.
//! 1. Recoverable request errors (`MemoryError`, `ConfigError`) returned to the caller
//! 2. Programming-error violations, reported through `fatal` and never returned

use std::fmt;
use std::io;

use crate::logging::log_fatal;

/// Request-level allocation failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Requested size is outside the legal range (see `MAX_ALLOC_SIZE`)
    InvalidAllocSize { size: usize },
    /// The backing allocator could not supply memory
    OutOfMemory { context: String, size: usize },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAllocSize { size } => {
                write!(f, "invalid memory alloc request size {}", size)
            }
            Self::OutOfMemory { context, size } => {
                write!(f, "out of memory: failed on request of size {} in context \"{}\"", size, context)
            }
        }
    }
}

impl std::error::Error for MemoryError {}

/// Configuration loading failures
#[derive(Debug)]
pub enum ConfigError {
    Io { path: String, source: io::Error },
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "failed to read config {}: {}", path, source),
            Self::Parse(msg) => write!(f, "failed to parse config: {}", msg),
            Self::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Report a programming-error violation and abort the current unit of work.
///
/// The message is staged in the error context first (when its lock is free),
/// so the report itself is backed by the reserved memory.
#[cold]
#[inline(never)]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    let message = args.to_string();
    let staged = crate::context::stage_in_error_context(&message);

    log_fatal(&message, staged);

    panic!("{}", message);
}

/// Assert a framework invariant, escalating to `fatal` on violation
macro_rules! fatal_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::fatal(format_args!($($arg)+));
        }
    };
}

pub(crate) use fatal_assert;
