//! Accelerator back-end abstraction.
//!
//! The dispatch core only ever talks to [`Accelerator`] trait objects, so the
//! adapters can be swapped for scripted stubs in tests.

pub(crate) mod driver;
pub mod iaa;
pub mod qat;

use thiserror::Error;

use crate::ExecutionPath;

#[derive(Debug, Error)]
pub enum AccelError {
    #[error("no accelerator session available")]
    SessionUnavailable,
    #[error("output buffer too small for accelerated result")]
    OutputTooSmall,
    #[error("compressed size exceeds declared bound")]
    BoundExceeded,
    #[error("extended gzip header not found")]
    MissingGzipExt,
    #[error("unsupported stream format")]
    UnsupportedFormat,
    #[error("accelerator execution failed: {0}")]
    Execution(&'static str),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompressOptions {
    /// Insert the "QZ" extra subfield between the gzip header and the payload.
    pub gzip_ext: bool,
    /// Reject output larger than this when non-zero.
    pub max_compressed_size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct CompressOutcome {
    pub consumed: usize,
    pub produced: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct DecompressOutcome {
    pub consumed: usize,
    pub produced: usize,
    pub end_of_stream: bool,
}

pub trait Accelerator: Send + Sync {
    fn path(&self) -> ExecutionPath;

    /// Whether this back-end can legally serve a request of this shape.
    fn supports(&self, window_bits: i32, input_len: usize, output_len: usize) -> bool;

    /// Whether the compressed bytes look decompressible by this back-end.
    /// Optimistic by default; the actual call may still fail at runtime.
    fn supports_decompress(&self, _input: &[u8], _window_bits: i32) -> bool {
        true
    }

    fn compress(
        &self,
        input: &[u8],
        output: &mut [u8],
        window_bits: i32,
        options: CompressOptions,
    ) -> Result<CompressOutcome, AccelError>;

    fn decompress(
        &self,
        input: &[u8],
        output: &mut [u8],
        window_bits: i32,
        detect_gzip_ext: bool,
    ) -> Result<DecompressOutcome, AccelError>;
}
