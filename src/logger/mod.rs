use std::sync::atomic::{AtomicUsize, Ordering};

use lazy_static::lazy_static;
pub use slog::Level;
use slog::Drain;

static LOG_LEVEL: AtomicUsize = AtomicUsize::new(usize::MAX);

lazy_static! {
    static ref GLOBAL_LOG_GUARD: (slog_scope::GlobalLoggerGuard, bool) = {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator)
            .use_file_location()
            .build()
            .fuse();
        let drain = drain.filter(level_filter).ignore_res();
        let drain = slog_async::Async::new(drain).build().fuse();
        let logger = slog::Logger::root(drain, slog::slog_o!());

        let scope_guard = slog_scope::set_global_logger(logger);
        // Another `log` implementation may already be installed, e.g. by tests.
        let bridged = slog_stdlog::init().is_ok();
        (scope_guard, bridged)
    };
}

/// Installs the global terminal logger and routes `log` records into it.
///
/// Returns whether the `log` facade is bridged; only the first installed
/// `log` implementation wins.
pub fn init() -> bool {
    GLOBAL_LOG_GUARD.1
}

fn level_filter(record: &slog::Record) -> bool {
    get_log_level().map_or(true, |level| record.level().is_at_least(level))
}

pub fn get_log_level() -> Option<Level> {
    Level::from_usize(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: Level) {
    LOG_LEVEL.store(level.as_usize(), Ordering::SeqCst);
    log::set_max_level(match level {
        Level::Critical | Level::Error => log::LevelFilter::Error,
        Level::Warning => log::LevelFilter::Warn,
        Level::Info => log::LevelFilter::Info,
        Level::Debug => log::LevelFilter::Debug,
        Level::Trace => log::LevelFilter::Trace,
    });
}
