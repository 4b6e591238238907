//! Bounded-buffer compress/uncompress helpers.
//!
//! Same selection logic as the streaming dispatch but with no stream and no
//! sticky path. The software fallback goes through the streaming API under
//! the re-entrancy guard, exactly the nesting the guard exists for.

use std::sync::Arc;

use tracing::debug;

use crate::backend::CompressOptions;
use crate::config::{self, ConfigOption};
use crate::stream::{nested, DeflateStream, Dispatcher, InflateStream};
use crate::{ExecutionPath, Flush, Status};

const ONESHOT_WINDOW_BITS: i32 = 15;

pub fn compress(dest: &mut [u8], source: &[u8]) -> Result<usize, Status> {
    compress2(dest, source, -1)
}

pub fn compress2(dest: &mut [u8], source: &[u8], level: i32) -> Result<usize, Status> {
    compress2_on(Dispatcher::global(), dest, source, level)
}

pub fn compress2_on(
    dispatcher: &Arc<Dispatcher>,
    dest: &mut [u8],
    source: &[u8],
    level: i32,
) -> Result<usize, Status> {
    debug!(source_len = source.len(), dest_len = dest.len(), "compress2");

    let iaa_available = config::enabled(ConfigOption::UseIaaCompress)
        && dispatcher
            .iaa()
            .supports(ONESHOT_WINDOW_BITS, source.len(), dest.len());
    let qat_available = config::enabled(ConfigOption::UseQatCompress)
        && dispatcher
            .qat()
            .supports(ONESHOT_WINDOW_BITS, source.len(), dest.len());

    let selected = dispatcher.select(
        iaa_available,
        qat_available,
        ConfigOption::IaaCompressPercentage,
    );
    if let Some(backend) = selected {
        let result = nested(|| {
            backend.compress(source, &mut *dest, ONESHOT_WINDOW_BITS, CompressOptions::default())
        });
        if let Ok(outcome) = result {
            debug!(produced = outcome.produced, "compress2 served by accelerator");
            return Ok(outcome.produced);
        }
    }

    if !config::enabled(ConfigOption::UseZlibCompress) {
        return Err(Status::DataError);
    }
    nested(|| {
        let mut stream = DeflateStream::create_on(
            Arc::clone(dispatcher),
            level,
            8,
            ONESHOT_WINDOW_BITS,
            8,
            0,
        )?;
        let outcome = stream.deflate(source, dest, Flush::Finish);
        match outcome.status {
            Status::StreamEnd => Ok(outcome.produced),
            Status::Ok | Status::BufError => Err(Status::BufError),
            status => Err(status),
        }
    })
}

pub fn uncompress(dest: &mut [u8], source: &[u8]) -> Result<usize, Status> {
    uncompress2(dest, source).map(|(produced, _)| produced)
}

/// Returns `(produced, consumed)`; a trailing concatenated stream leaves
/// `consumed` short of `source.len()`.
pub fn uncompress2(dest: &mut [u8], source: &[u8]) -> Result<(usize, usize), Status> {
    uncompress2_on(Dispatcher::global(), dest, source)
}

pub fn uncompress2_on(
    dispatcher: &Arc<Dispatcher>,
    dest: &mut [u8],
    source: &[u8],
) -> Result<(usize, usize), Status> {
    debug!(source_len = source.len(), dest_len = dest.len(), "uncompress2");

    let iaa_available = config::enabled(ConfigOption::UseIaaUncompress)
        && dispatcher
            .iaa()
            .supports(ONESHOT_WINDOW_BITS, source.len(), dest.len())
        && dispatcher
            .iaa()
            .supports_decompress(source, ONESHOT_WINDOW_BITS);
    let qat_available = config::enabled(ConfigOption::UseQatUncompress)
        && dispatcher
            .qat()
            .supports(ONESHOT_WINDOW_BITS, source.len(), dest.len());

    let selected = dispatcher.select(
        iaa_available,
        qat_available,
        ConfigOption::IaaUncompressPercentage,
    );
    if let Some(backend) = selected {
        let result =
            nested(|| backend.decompress(source, &mut *dest, ONESHOT_WINDOW_BITS, false));
        match result {
            Ok(outcome)
                if outcome.end_of_stream || backend.path() != ExecutionPath::Qat =>
            {
                debug!(produced = outcome.produced, "uncompress2 served by accelerator");
                return Ok((outcome.produced, outcome.consumed));
            }
            _ => {}
        }
    }

    if !config::enabled(ConfigOption::UseZlibUncompress) {
        return Err(Status::DataError);
    }
    nested(|| {
        let mut stream =
            InflateStream::create_on(Arc::clone(dispatcher), ONESHOT_WINDOW_BITS)?;
        let outcome = stream.inflate(source, dest, Flush::None);
        match outcome.status {
            Status::StreamEnd => Ok((outcome.produced, outcome.consumed)),
            Status::Ok | Status::BufError => {
                if outcome.produced == dest.len() {
                    Err(Status::BufError)
                } else {
                    Err(Status::DataError)
                }
            }
            status => Err(status),
        }
    })
}
