//! Small-random-access accelerator adapter.
//!
//! One reusable job per thread; framing is chosen per call. Both input and
//! output are capped at the 2 MiB device buffer.

use std::cell::RefCell;

use tracing::debug;

use super::driver::Job;
use super::{AccelError, Accelerator, CompressOptions, CompressOutcome, DecompressOutcome};
use crate::config::{self, ConfigOption};
use crate::format::{self, StreamFormat, GZIP_EXT_HDRFTR_SIZE};
use crate::ExecutionPath;

pub const MAX_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// History buffer of the device; emitted zlib headers declare this window
/// and decompression requires the declared window to fit inside it.
const DEVICE_WINDOW_BITS: i32 = 12;

thread_local! {
    static JOB: RefCell<Option<Job>> = const { RefCell::new(None) };
}

pub struct IaaBackend;

impl IaaBackend {
    fn with_job<R>(f: impl FnOnce(&Job) -> Result<R, AccelError>) -> Result<R, AccelError> {
        JOB.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_none() {
                *slot = Job::open(DEVICE_WINDOW_BITS).ok();
            }
            let job = slot.as_ref().ok_or(AccelError::SessionUnavailable)?;
            f(job)
        })
    }

    fn destroy_job() {
        JOB.with(|cell| *cell.borrow_mut() = None);
    }
}

impl Accelerator for IaaBackend {
    fn path(&self) -> ExecutionPath {
        ExecutionPath::Iaa
    }

    fn supports(&self, window_bits: i32, input_len: usize, output_len: usize) -> bool {
        if format::stream_format(window_bits) == StreamFormat::Invalid {
            return false;
        }
        if input_len > MAX_BUFFER_SIZE || output_len > MAX_BUFFER_SIZE {
            debug!(input_len, output_len, "buffer exceeds device limit");
            return false;
        }
        true
    }

    fn supports_decompress(&self, input: &[u8], window_bits: i32) -> bool {
        let format = format::stream_format(window_bits);
        if format == StreamFormat::Zlib {
            return format::zlib_header_window(input) <= DEVICE_WINDOW_BITS;
        }
        // Without the marker there is no way to tell; assume yes and let the
        // call itself fail if it turns out otherwise.
        if !config::enabled(ConfigOption::IaaPrependEmptyBlock) {
            return true;
        }
        format::empty_block_present(input, format)
    }

    fn compress(
        &self,
        input: &[u8],
        output: &mut [u8],
        window_bits: i32,
        options: CompressOptions,
    ) -> Result<CompressOutcome, AccelError> {
        // Job state from a previous zlib-format run is not reset correctly by
        // the device library; force reinitialization.
        if window_bits == 15 {
            Self::destroy_job();
        }

        let format = format::stream_format(window_bits);
        let prepend = config::enabled(ConfigOption::IaaPrependEmptyBlock);
        let outcome = Self::with_job(|job| {
            job.compress(input, output, format, prepend, options.gzip_ext)
        })?;
        // The device sometimes produces more bytes than the classical upper
        // bound; callers sized to that bound cannot accept such output.
        if options.max_compressed_size > 0 && outcome.produced > options.max_compressed_size {
            return Err(AccelError::BoundExceeded);
        }
        Ok(outcome)
    }

    fn decompress(
        &self,
        input: &[u8],
        output: &mut [u8],
        window_bits: i32,
        detect_gzip_ext: bool,
    ) -> Result<DecompressOutcome, AccelError> {
        let mut bounded = input;
        if detect_gzip_ext {
            let Some((_, payload_size)) = format::detect_gzip_ext(input) else {
                return Err(AccelError::MissingGzipExt);
            };
            let declared = payload_size as usize + GZIP_EXT_HDRFTR_SIZE;
            bounded = input.get(..declared).unwrap_or(input);
        }

        let format = format::stream_format(window_bits);
        let outcome = Self::with_job(|job| job.decompress(bounded, output, format))?;
        if !outcome.end_of_stream {
            return Err(AccelError::Execution("output exhausted before stream end"));
        }
        // At end-of-stream the device reports a wrong consumed-byte count;
        // report the whole input instead. Needs a device-library fix.
        Ok(DecompressOutcome {
            consumed: bounded.len(),
            produced: outcome.produced,
            end_of_stream: true,
        })
    }
}
