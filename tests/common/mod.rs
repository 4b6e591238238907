#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, OnceLock};

use zlib_accel::config::{set_config, ConfigOption};
use zlib_accel::ExecutionPath;

/// Tests in one binary share the global config; every test holds this while
/// it runs.
pub fn config_guard() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    match LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub fn set_compress_path(path: ExecutionPath, software_fallback: bool) {
    match path {
        ExecutionPath::Software => {
            set_config(ConfigOption::UseIaaCompress, 0);
            set_config(ConfigOption::UseQatCompress, 0);
            set_config(ConfigOption::UseZlibCompress, 1);
        }
        ExecutionPath::Qat => {
            set_config(ConfigOption::UseIaaCompress, 0);
            set_config(ConfigOption::UseQatCompress, 1);
            set_config(ConfigOption::UseZlibCompress, u32::from(software_fallback));
        }
        ExecutionPath::Iaa => {
            set_config(ConfigOption::UseIaaCompress, 1);
            set_config(ConfigOption::UseQatCompress, 0);
            set_config(ConfigOption::UseZlibCompress, u32::from(software_fallback));
        }
        ExecutionPath::Undefined => {}
    }
}

pub fn set_uncompress_path(path: ExecutionPath, software_fallback: bool) {
    match path {
        ExecutionPath::Software => {
            set_config(ConfigOption::UseIaaUncompress, 0);
            set_config(ConfigOption::UseQatUncompress, 0);
            set_config(ConfigOption::UseZlibUncompress, 1);
        }
        ExecutionPath::Qat => {
            set_config(ConfigOption::UseIaaUncompress, 0);
            set_config(ConfigOption::UseQatUncompress, 1);
            set_config(ConfigOption::UseZlibUncompress, u32::from(software_fallback));
        }
        ExecutionPath::Iaa => {
            set_config(ConfigOption::UseIaaUncompress, 1);
            set_config(ConfigOption::UseQatUncompress, 0);
            set_config(ConfigOption::UseZlibUncompress, u32::from(software_fallback));
        }
        ExecutionPath::Undefined => {}
    }
}

pub fn set_marker(enabled: bool) {
    set_config(ConfigOption::IaaPrependEmptyBlock, u32::from(enabled));
}

pub fn set_chunking(enabled: bool) {
    set_config(ConfigOption::QatCompressionAllowChunking, u32::from(enabled));
}

pub fn patterned_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i as u32 * 31 + 7) % 251) as u8).collect()
}

/// Pseudo-random bytes, incompressible for practical purposes.
pub fn random_data(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut state: u32 = 0x1234_5678;
    while out.len() < len {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        out.push((state >> 24) as u8);
    }
    out
}

/// Zones of text, long runs and noise, like real mixed traffic.
pub fn mixed_data(bytes: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes);
    let mut state: u32 = 0x1234_5678;
    while out.len() < bytes {
        let zone = (out.len() / 4096) % 3;
        match zone {
            0 => out.extend_from_slice(b"zlib-accel-dispatch-segment-"),
            1 => out.extend_from_slice(b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"),
            _ => {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                out.push((state >> 24) as u8);
            }
        }
    }
    out.truncate(bytes);
    out
}

/// Mostly random with one repeated block embedded in the middle.
pub fn random_with_repeated_block(len: usize, block: usize) -> Vec<u8> {
    let mut out = random_data(len);
    let start = len / 2;
    let end = (start + block).min(len);
    for i in start..end {
        out[i] = b'R';
    }
    out
}
