//! Process-wide context state
//!
//! Design: The top-most and error contexts live in a `OnceCell` written once
//! at subsystem initialization. The current context is per thread; `None`
//! in the thread-local stands for the top-most context, so worker threads
//! start out allocating from the top without any setup.

use core::cell::RefCell;
use core::marker::PhantomData;

use once_cell::sync::OnceCell;

use super::MemoryContext;
use crate::aset::{AllocSet, AllocSetSizes};
use crate::config::MemoryConfig;
use crate::error::{fatal, fatal_assert, ConfigError};
use crate::logging::{self, log_subsystem_init};

struct Subsystem {
    top_most: MemoryContext,
    error: MemoryContext,
    defaults: AllocSetSizes,
}

static SUBSYSTEM: OnceCell<Subsystem> = OnceCell::new();

thread_local! {
    static CURRENT: RefCell<Option<MemoryContext>> = RefCell::new(None);
}

/// Initialize the subsystem from `MEMCTX_CONFIG` and install logging.
///
/// Fatal if the subsystem is already initialized.
pub fn init() -> Result<(), ConfigError> {
    let config = MemoryConfig::from_env();
    logging::init_with_config(config.log_config());
    init_with_config(&config)
}

/// Create the top-most and error contexts.
///
/// Fatal if the subsystem is already initialized.
pub fn init_with_config(config: &MemoryConfig) -> Result<(), ConfigError> {
    config.validate()?;

    let mut created = false;
    SUBSYSTEM.get_or_init(|| {
        created = true;
        bootstrap(config)
    });

    fatal_assert!(created, "memory context subsystem already initialized");
    Ok(())
}

/// Initialize with default sizing unless that already happened
pub fn ensure_initialized() {
    SUBSYSTEM.get_or_init(|| bootstrap(&MemoryConfig::default()));
}

pub fn is_initialized() -> bool {
    SUBSYSTEM.get().is_some()
}

fn bootstrap(config: &MemoryConfig) -> Subsystem {
    let top_most = AllocSet::create(None, "TopMemoryContext", config.top, true)
        .unwrap_or_else(|err| fatal(format_args!("could not create TopMemoryContext: {}", err)));

    // The keeper block of the error context is the reserve: it survives every
    // reset and is what the fatal path stages its report in
    let error = AllocSet::create(Some(&top_most), "ErrorContext", config.error, true)
        .unwrap_or_else(|err| fatal(format_args!("could not create ErrorContext: {}", err)));

    log_subsystem_init(top_most.name(), error.name(), config.error.min_context_size);

    Subsystem {
        top_most,
        error,
        defaults: config.defaults,
    }
}

fn subsystem() -> &'static Subsystem {
    match SUBSYSTEM.get() {
        Some(subsystem) => subsystem,
        None => fatal(format_args!("memory context subsystem is not initialized")),
    }
}

/// The permanent root of the tree
pub fn top_most_memory_context() -> MemoryContext {
    subsystem().top_most.clone()
}

/// The context reserved for error reporting
pub fn error_context() -> MemoryContext {
    subsystem().error.clone()
}

/// Sizing for `AllocSet::create_default`; `DEFAULT` before initialization
pub fn default_alloc_set_sizes() -> AllocSetSizes {
    SUBSYSTEM
        .get()
        .map_or(AllocSetSizes::DEFAULT, |subsystem| subsystem.defaults)
}

/// The context ambient allocations of this thread go to
pub fn current_memory_context() -> MemoryContext {
    CURRENT
        .with(|current| current.borrow().clone())
        .unwrap_or_else(top_most_memory_context)
}

pub(crate) fn switch_to(context: &MemoryContext) -> MemoryContext {
    context.0.assert_valid();

    let previous = CURRENT.with(|current| current.replace(Some(context.clone())));
    previous.unwrap_or_else(top_most_memory_context)
}

pub(crate) fn is_top_most(context: &MemoryContext) -> bool {
    SUBSYSTEM
        .get()
        .map_or(false, |subsystem| subsystem.top_most.ptr_eq(context))
}

pub(crate) fn is_current(context: &MemoryContext) -> bool {
    CURRENT
        .try_with(|current| {
            current
                .borrow()
                .as_ref()
                .map_or(false, |installed| installed.ptr_eq(context))
        })
        .unwrap_or(false)
}

/// Copy a fatal report into the error context without blocking
pub(crate) fn stage_in_error_context(message: &str) -> bool {
    SUBSYSTEM
        .get()
        .map_or(false, |subsystem| subsystem.error.try_stage(message))
}

/// Scoped current-context switch.
///
/// Restores the previous current context on drop, including during unwind.
/// Tied to the thread that created it.
#[must_use = "the previous context is restored when the guard is dropped"]
pub struct CurrentContextGuard {
    previous: Option<MemoryContext>,
    _not_send: PhantomData<*const ()>,
}

impl CurrentContextGuard {
    pub(crate) fn new(context: &MemoryContext) -> Self {
        context.0.assert_valid();

        let previous = CURRENT.with(|current| current.replace(Some(context.clone())));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for CurrentContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CURRENT.try_with(|current| *current.borrow_mut() = previous);
    }
}
