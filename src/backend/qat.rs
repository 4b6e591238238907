//! Large-bulk accelerator adapter.
//!
//! Sessions are per thread and per (framing, gzip-ext) pair, created lazily
//! and torn down in reverse acquisition order when the thread exits.

use std::cell::RefCell;

use tracing::debug;

use super::driver::Session;
use super::{AccelError, Accelerator, CompressOptions, CompressOutcome, DecompressOutcome};
use crate::config::{self, ConfigOption};
use crate::format::{self, StreamFormat, GZIP_EXT_HDRFTR_SIZE};
use crate::ExecutionPath;

/// One-call hardware buffer; larger non-raw inputs need chunking enabled.
pub const QAT_HW_BUFFER_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SessionKey {
    format: StreamFormat,
    gzip_ext: bool,
}

#[derive(Default)]
struct SessionCache {
    /// Acquisition order; teardown pops from the back.
    sessions: Vec<(SessionKey, Session)>,
}

impl SessionCache {
    fn get_or_open(&mut self, format: StreamFormat, gzip_ext: bool) -> Option<&Session> {
        let key = SessionKey { format, gzip_ext };
        let index = match self.sessions.iter().position(|(k, _)| *k == key) {
            Some(index) => index,
            None => {
                let level = config::get_config(ConfigOption::QatCompressionLevel);
                let session = Session::open(format, gzip_ext, level, 15).ok()?;
                self.sessions.push((key, session));
                self.sessions.len() - 1
            }
        };
        self.sessions.get(index).map(|(_, session)| session)
    }

    fn close(&mut self, format: StreamFormat, gzip_ext: bool) {
        let key = SessionKey { format, gzip_ext };
        if let Some(index) = self.sessions.iter().position(|(k, _)| *k == key) {
            self.sessions.remove(index);
        }
    }
}

impl Drop for SessionCache {
    fn drop(&mut self) {
        // Last acquired, first released.
        while self.sessions.pop().is_some() {}
    }
}

thread_local! {
    static SESSIONS: RefCell<SessionCache> = RefCell::new(SessionCache::default());
}

pub struct QatBackend;

impl QatBackend {
    fn with_session<R>(
        format: StreamFormat,
        gzip_ext: bool,
        f: impl FnOnce(&Session) -> Result<R, AccelError>,
    ) -> Result<R, AccelError> {
        SESSIONS.with(|cell| {
            let mut cache = cell.borrow_mut();
            let session = cache
                .get_or_open(format, gzip_ext)
                .ok_or(AccelError::SessionUnavailable)?;
            f(session)
        })
    }

    fn close_session(format: StreamFormat, gzip_ext: bool) {
        SESSIONS.with(|cell| cell.borrow_mut().close(format, gzip_ext));
    }
}

impl Accelerator for QatBackend {
    fn path(&self) -> ExecutionPath {
        ExecutionPath::Qat
    }

    fn supports(&self, window_bits: i32, input_len: usize, _output_len: usize) -> bool {
        let format = format::stream_format(window_bits);
        if format == StreamFormat::Invalid {
            return false;
        }
        if format != StreamFormat::Raw
            && !config::enabled(ConfigOption::QatCompressionAllowChunking)
            && input_len > QAT_HW_BUFFER_SIZE
        {
            debug!(
                input_len,
                "input exceeds hardware buffer and chunking is not allowed"
            );
            return false;
        }
        true
    }

    fn compress(
        &self,
        input: &[u8],
        output: &mut [u8],
        window_bits: i32,
        options: CompressOptions,
    ) -> Result<CompressOutcome, AccelError> {
        let format = format::stream_format(window_bits);
        let prepend = config::enabled(ConfigOption::IaaPrependEmptyBlock);
        Self::with_session(format, options.gzip_ext, |session| {
            session.compress(input, output, prepend)
        })
    }

    fn decompress(
        &self,
        input: &[u8],
        output: &mut [u8],
        window_bits: i32,
        detect_gzip_ext: bool,
    ) -> Result<DecompressOutcome, AccelError> {
        let format = format::stream_format(window_bits);
        let mut gzip_ext = false;
        let mut bounded = input;
        if detect_gzip_ext {
            let Some((_, payload_size)) = format::detect_gzip_ext(input) else {
                return Err(AccelError::MissingGzipExt);
            };
            gzip_ext = true;
            let declared = payload_size as usize + GZIP_EXT_HDRFTR_SIZE;
            bounded = input.get(..declared).unwrap_or(input);
        }

        let outcome =
            Self::with_session(format, gzip_ext, |session| session.decompress(bounded, output))?;
        if !outcome.end_of_stream {
            // The driver keeps inflate state from the interrupted stream and
            // has no partial reset; recreate the session before its next use.
            Self::close_session(format, gzip_ext);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::compress_bound;

    fn patterned_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i as u32 * 31 + 7) % 251) as u8).collect()
    }

    #[test]
    fn chunking_gate_applies_to_framed_input_only() {
        let _guard = crate::test_support::config_lock();
        let oversized = QAT_HW_BUFFER_SIZE + 1;

        config::set_config(ConfigOption::QatCompressionAllowChunking, 0);
        assert!(!QatBackend.supports(31, oversized, oversized));
        assert!(!QatBackend.supports(15, oversized, oversized));
        assert!(QatBackend.supports(-15, oversized, oversized));
        assert!(QatBackend.supports(31, QAT_HW_BUFFER_SIZE, 0));

        config::set_config(ConfigOption::QatCompressionAllowChunking, 1);
        assert!(QatBackend.supports(31, oversized, oversized));
        config::set_config(ConfigOption::QatCompressionAllowChunking, 0);

        assert!(!QatBackend.supports(0, 1024, 1024));
    }

    #[test]
    fn adapter_roundtrip_reuses_the_thread_session() {
        let _guard = crate::test_support::config_lock();
        config::set_config(ConfigOption::IaaPrependEmptyBlock, 0);

        let input = patterned_data(128 * 1024);
        let mut compressed = vec![0_u8; compress_bound(input.len())];
        let mut restored = vec![0_u8; input.len()];
        for _ in 0..3 {
            let made = QatBackend
                .compress(&input, &mut compressed, 31, CompressOptions::default())
                .expect("compress");
            let outcome = QatBackend
                .decompress(&compressed[..made.produced], &mut restored, 31, false)
                .expect("decompress");
            assert!(outcome.end_of_stream);
            assert_eq!(restored[..outcome.produced], input[..]);
        }
    }

    #[test]
    fn interrupted_decompression_reports_no_end_of_stream() {
        let _guard = crate::test_support::config_lock();
        config::set_config(ConfigOption::IaaPrependEmptyBlock, 0);

        let input = patterned_data(256 * 1024);
        let mut compressed = vec![0_u8; compress_bound(input.len())];
        let made = QatBackend
            .compress(&input, &mut compressed, 31, CompressOptions::default())
            .expect("compress");

        let mut window = vec![0_u8; 4096];
        let outcome = QatBackend
            .decompress(&compressed[..made.produced], &mut window, 31, false)
            .expect("partial decompress");
        assert!(!outcome.end_of_stream);

        // The session was recreated; a full-size retry works.
        let mut restored = vec![0_u8; input.len()];
        let outcome = QatBackend
            .decompress(&compressed[..made.produced], &mut restored, 31, false)
            .expect("full decompress");
        assert!(outcome.end_of_stream);
        assert_eq!(restored[..outcome.produced], input[..]);
    }

    #[test]
    fn declared_sizes_bound_the_decompressed_range() {
        let _guard = crate::test_support::config_lock();
        config::set_config(ConfigOption::IaaPrependEmptyBlock, 0);

        let input = patterned_data(64 * 1024);
        let mut compressed = vec![0_u8; compress_bound(input.len())];
        let made = QatBackend
            .compress(
                &input,
                &mut compressed,
                31,
                CompressOptions {
                    gzip_ext: true,
                    max_compressed_size: 0,
                },
            )
            .expect("compress with size subfield");

        // Trailing garbage past the declared range must not confuse the call.
        let mut padded = compressed[..made.produced].to_vec();
        padded.extend_from_slice(&[0xAB; 64]);
        let mut restored = vec![0_u8; input.len()];
        let outcome = QatBackend
            .decompress(&padded, &mut restored, 31, true)
            .expect("decompress");
        assert!(outcome.end_of_stream);
        assert_eq!(outcome.consumed, made.produced);
        assert_eq!(restored[..outcome.produced], input[..]);
    }
}
