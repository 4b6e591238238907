//! Transparent accelerator dispatch for the deflate/zlib/gzip streaming API.
//!
//! Each call is routed to one of two hardware back-ends (a large-bulk engine
//! and a small random-access engine) or to the software implementation, per
//! stream and per direction, without changing what the bytes mean. Hardware
//! is an optimisation only: any refusal or failure degrades to software for
//! the rest of the stream.

pub mod backend;
pub mod config;
pub mod format;
pub mod lifecycle;

mod gzfile;
mod oneshot;
mod shard_map;
mod software;
mod stream;

pub use gzfile::GzFile;
pub use oneshot::{
    compress, compress2, compress2_on, uncompress, uncompress2, uncompress2_on,
};
pub use stream::{DeflateStream, Dispatcher, InflateStream};

/// zlib-style return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    StreamEnd,
    BufError,
    DataError,
    StreamError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    None,
    Sync,
    Finish,
}

/// Result of one streaming call: status plus how far input and output moved.
#[derive(Debug, Clone, Copy)]
pub struct StreamOutcome {
    pub status: Status,
    pub consumed: usize,
    pub produced: usize,
}

/// Which implementation is serving a stream. `Software` is sticky for the
/// lifetime of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionPath {
    Undefined = 0,
    Software = 1,
    Qat = 2,
    Iaa = 3,
}

impl ExecutionPath {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ExecutionPath::Software,
            2 => ExecutionPath::Qat,
            3 => ExecutionPath::Iaa,
            _ => ExecutionPath::Undefined,
        }
    }
}
