//! Runtime configuration surface.
//!
//! Options are advisory heuristics read on every dispatch, stored as a flat
//! array of words with relaxed atomic access. The loader runs once at
//! startup; tests flip individual options through [`set_config`].

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tracing::error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/zlib-accel.conf";

const PATH_MAX: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ConfigOption {
    UseQatCompress,
    UseQatUncompress,
    UseIaaCompress,
    UseIaaUncompress,
    UseZlibCompress,
    UseZlibUncompress,
    IaaCompressPercentage,
    IaaUncompressPercentage,
    IaaPrependEmptyBlock,
    QatPeriodicalPolling,
    QatCompressionLevel,
    QatCompressionAllowChunking,
    LogLevel,
    LogStatsSamples,
}

struct Descriptor {
    option: ConfigOption,
    key: &'static str,
    default: u32,
    min: u32,
    max: u32,
}

const fn desc(option: ConfigOption, key: &'static str, default: u32, min: u32, max: u32) -> Descriptor {
    Descriptor { option, key, default, min, max }
}

const DESCRIPTORS: [Descriptor; 14] = [
    desc(ConfigOption::UseQatCompress, "use_qat_compress", 1, 0, 1),
    desc(ConfigOption::UseQatUncompress, "use_qat_uncompress", 1, 0, 1),
    desc(ConfigOption::UseIaaCompress, "use_iaa_compress", 0, 0, 1),
    desc(ConfigOption::UseIaaUncompress, "use_iaa_uncompress", 0, 0, 1),
    desc(ConfigOption::UseZlibCompress, "use_zlib_compress", 1, 0, 1),
    desc(ConfigOption::UseZlibUncompress, "use_zlib_uncompress", 1, 0, 1),
    desc(ConfigOption::IaaCompressPercentage, "iaa_compress_percentage", 50, 0, 100),
    desc(ConfigOption::IaaUncompressPercentage, "iaa_uncompress_percentage", 50, 0, 100),
    desc(ConfigOption::IaaPrependEmptyBlock, "iaa_prepend_empty_block", 0, 0, 1),
    desc(ConfigOption::QatPeriodicalPolling, "qat_periodical_polling", 0, 0, 1),
    desc(ConfigOption::QatCompressionLevel, "qat_compression_level", 1, 1, 9),
    desc(ConfigOption::QatCompressionAllowChunking, "qat_compression_allow_chunking", 0, 0, 1),
    desc(ConfigOption::LogLevel, "log_level", 2, 0, 2),
    desc(ConfigOption::LogStatsSamples, "log_stats_samples", 1000, 0, u32::MAX),
];

const CONFIG_COUNT: usize = DESCRIPTORS.len();

static CONFIGS: [AtomicU32; CONFIG_COUNT] = {
    const INIT: AtomicU32 = AtomicU32::new(0);
    [INIT; CONFIG_COUNT]
};

static DEFAULTS_APPLIED: std::sync::Once = std::sync::Once::new();

static LOG_FILE: Mutex<String> = Mutex::new(String::new());

fn ensure_defaults() {
    DEFAULTS_APPLIED.call_once(|| {
        for d in &DESCRIPTORS {
            CONFIGS[d.option as usize].store(d.default, Ordering::Relaxed);
        }
    });
}

pub fn get_config(option: ConfigOption) -> u32 {
    ensure_defaults();
    CONFIGS[option as usize].load(Ordering::Relaxed)
}

pub fn set_config(option: ConfigOption, value: u32) {
    ensure_defaults();
    CONFIGS[option as usize].store(value, Ordering::Relaxed);
}

pub(crate) fn enabled(option: ConfigOption) -> bool {
    get_config(option) != 0
}

/// Path of the log sink, empty when none is configured.
pub fn log_file() -> String {
    match LOG_FILE.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Load `key = value` options from `path`.
///
/// Missing files and symbolic links are refused outright; no option is
/// mutated in that case. Individual invalid values are logged and skipped,
/// keeping whatever value the option already had.
pub fn load_config_file(path: &Path) -> bool {
    ensure_defaults();

    let Ok(meta) = fs::symlink_metadata(path) else {
        return false;
    };
    if meta.file_type().is_symlink() {
        error!(path = %path.display(), "config file is a symlink, refusing to load");
        return false;
    }
    let Ok(contents) = fs::read_to_string(path) else {
        return false;
    };

    let entries = parse_entries(&contents);
    for d in &DESCRIPTORS {
        if let Some(value) = entries.get(d.key) {
            match parse_bounded(value, d.min, d.max) {
                Some(parsed) => CONFIGS[d.option as usize].store(parsed, Ordering::Relaxed),
                None => error!(key = d.key, value, "invalid config value, keeping current"),
            }
        }
    }

    if let Some(value) = entries.get("log_file") {
        if is_valid_sink_path(value) {
            match LOG_FILE.lock() {
                Ok(mut guard) => *guard = value.clone(),
                Err(poisoned) => *poisoned.into_inner() = value.clone(),
            }
        } else {
            error!(value, "invalid log_file value, keeping current");
        }
    }

    true
}

/// Line-oriented parse: `#` starts a comment, CR is stripped, whitespace is
/// collapsed, the last occurrence of a key wins.
fn parse_entries(contents: &str) -> HashMap<String, String> {
    let mut entries = HashMap::new();
    for line in contents.lines() {
        let data: String = line
            .split('#')
            .next()
            .unwrap_or_default()
            .chars()
            .filter(|c| *c != '\r')
            .collect();
        let Some((tag, value)) = data.split_once('=') else {
            continue;
        };
        let tag = reduce(tag);
        let value = reduce(value);
        if tag.is_empty() || value.is_empty() {
            continue;
        }
        entries.insert(tag, value);
    }
    entries
}

fn reduce(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whole-string, base-10, non-negative, range-checked.
fn parse_bounded(value: &str, min: u32, max: u32) -> Option<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let parsed: u64 = value.parse().ok()?;
    if parsed < u64::from(min) || parsed > u64::from(max) {
        return None;
    }
    Some(parsed as u32)
}

fn is_valid_sink_path(input: &str) -> bool {
    !input.is_empty()
        && input.len() <= PATH_MAX
        && input
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'/' | b'-'))
}
