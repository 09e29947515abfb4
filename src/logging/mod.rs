//! Logging infrastructure - structured tracing for the context tree
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log level, overridable through `RUST_LOG`
//! - Zero-cost when disabled (allocation events are trace level)
//! - Console or non-blocking file output, plain or JSON

use std::ffi::OsStr;
use std::io;
use std::path::Path;

use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::methods::{ChunkProblem, MemoryContextCounters};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Keeps the non-blocking file writer flushing for the life of the process
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable file logging
    pub file_output: bool,
    /// Log file path (if file_output enabled)
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // MEMCTX_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("MEMCTX_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        // MEMCTX_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("MEMCTX_LOG_FILE") {
            config.file_output = true;
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("MEMCTX_LOG_JSON").is_ok();
        config.show_spans = std::env::var("MEMCTX_LOG_SPANS").is_ok();

        config
    }

    /// Create high-performance config (minimal logging)
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Create debug config (verbose logging)
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            file_output: true,
            log_path: Some("memctx.log".to_string()),
            json_format: false,
            show_spans: true,
        }
    }
}

/// Map a level name to a `Level`, defaulting to INFO
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration.
///
/// Only the first call installs a subscriber. An already installed global
/// subscriber (from a host application) is left in place.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("memctx={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let writer = make_writer(&config);

        let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions))
                .with_filter(env_filter)
                .boxed()
        } else {
            fmt::layer()
                .compact()
                .with_writer(writer)
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions))
                .with_line_number(cfg!(debug_assertions))
                .with_filter(env_filter)
                .boxed()
        };

        if let Err(err) = tracing_subscriber::registry().with(layer).try_init() {
            tracing::debug!(
                event = "logging_init_skipped",
                error = %err,
                "Global subscriber already installed, keeping it"
            );
        }
    });
}

fn make_writer(config: &LogConfig) -> BoxMakeWriter {
    let path = match config.log_path.as_deref() {
        Some(path) if config.file_output => Path::new(path),
        _ => return BoxMakeWriter::new(io::stderr),
    };

    let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().unwrap_or_else(|| OsStr::new("memctx.log"));

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
    let _ = FILE_GUARD.set(guard);

    BoxMakeWriter::new(writer)
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Context-tree logging functions
// ============================================================================

/// Log subsystem bootstrap
pub fn log_subsystem_init(top_most: &str, error: &str, error_reserve: usize) {
    use tracing::info;
    info!(
        event = "subsystem_init",
        top_most = top_most,
        error_context = error,
        error_reserve_bytes = error_reserve,
        "Memory context subsystem initialized"
    );
}

pub fn log_context_created(name: &str, kind: &str, parent: Option<&str>, shared: bool) {
    use tracing::debug;
    debug!(
        event = "context_created",
        context = name,
        kind = kind,
        parent = parent.unwrap_or("<root>"),
        shared = shared,
        "Memory context created"
    );
}

pub fn log_context_deleted(name: &str) {
    use tracing::debug;
    debug!(event = "context_deleted", context = name, "Memory context deleted");
}

pub fn log_context_reset(name: &str, children_only: bool) {
    use tracing::trace;
    trace!(
        event = "context_reset",
        context = name,
        children_only = children_only,
        "Memory context reset"
    );
}

/// Log memory allocation
#[inline]
pub fn log_allocation(context: &str, size: usize, ptr: *const u8) {
    use tracing::trace;
    trace!(
        event = "allocation",
        context = context,
        size_bytes = size,
        address = ?ptr,
        "Memory allocated"
    );
}

/// Log memory deallocation
#[inline]
pub fn log_deallocation(context: &str, ptr: *const u8) {
    use tracing::trace;
    trace!(
        event = "deallocation",
        context = context,
        address = ?ptr,
        "Memory deallocated"
    );
}

pub fn log_invalid_alloc_size(context: &str, size: usize) {
    use tracing::warn;
    warn!(
        event = "invalid_alloc_size",
        context = context,
        size_bytes = size,
        "Invalid memory alloc request size"
    );
}

/// One stats line, indented by tree depth
pub fn log_context_stats(depth: usize, name: &str, counters: &MemoryContextCounters) {
    use tracing::info;
    info!(
        event = "context_stats",
        depth = depth,
        context = name,
        total_bytes = counters.totalspace,
        free_bytes = counters.freespace,
        "{:indent$}{}: {}",
        "",
        name,
        counters,
        indent = depth * 2
    );
}

pub fn log_chunk_problem(problem: &ChunkProblem) {
    use tracing::warn;
    warn!(
        event = "chunk_problem",
        context = %problem.context,
        address = problem.address,
        "{}",
        problem
    );
}

/// Log a fatal violation; `staged` tells whether the error context backed it
pub fn log_fatal(message: &str, staged: bool) {
    use tracing::error;
    error!(
        event = "fatal",
        staged_in_error_context = staged,
        error = message,
        "Fatal memory context violation"
    );
}

/// Performance tracking utilities
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Instant,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            let elapsed = self.start.elapsed();
            debug!(
                operation = self.operation,
                duration_us = elapsed.as_micros() as u64,
                "operation completed"
            );
        }
    }
}
