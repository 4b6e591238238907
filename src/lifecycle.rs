//! Library startup and teardown.

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Once, OnceLock};

use tracing::Level;

use crate::config::{self, ConfigOption};

static STARTED: Once = Once::new();
static LOG_SINK: OnceLock<Arc<File>> = OnceLock::new();

/// Load the configuration file and, when a log file is configured, install
/// the log sink. Idempotent; the global dispatcher runs it on first use.
pub fn startup() {
    STARTED.call_once(|| {
        config::load_config_file(Path::new(config::DEFAULT_CONFIG_PATH));

        let path = config::log_file();
        if path.is_empty() {
            return;
        }
        let Ok(file) = File::options().create(true).append(true).open(&path) else {
            return;
        };
        let sink = Arc::new(file);
        let _ = LOG_SINK.set(Arc::clone(&sink));

        let level = match config::get_config(ConfigOption::LogLevel) {
            0 => Level::TRACE,
            1 => Level::DEBUG,
            _ => Level::ERROR,
        };
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(sink)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Flush the log sink. Per-thread accelerator sessions tear themselves down
/// as their threads exit.
pub fn shutdown() {
    if let Some(sink) = LOG_SINK.get() {
        let _ = sink.sync_all();
    }
}
