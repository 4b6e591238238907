//! Streaming dispatch core.
//!
//! Every stream records its settings in a global sharded registry and tracks
//! a sticky execution path: accelerator paths may change between calls, but
//! once a direction of a stream lands on software it stays there.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use rand::Rng;
use tracing::{debug, error};

use crate::backend::iaa::IaaBackend;
use crate::backend::qat::QatBackend;
use crate::backend::{Accelerator, CompressOptions};
use crate::config::{self, ConfigOption};
use crate::format::{self, StreamFormat};
use crate::gzfile::GzipFile;
use crate::shard_map::ShardedMap;
use crate::software::{SoftwareDeflate, SoftwareInflate};
use crate::{lifecycle, ExecutionPath, Flush, Status, StreamOutcome};

const METHOD_DEFLATED: i32 = 8;

thread_local! {
    // The software fallback may call back into this library (the one-shot
    // helpers run on the streaming API); nested calls must not touch the
    // accelerators.
    static IN_CALL: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn reentered() -> bool {
    IN_CALL.with(Cell::get)
}

pub(crate) fn nested<R>(f: impl FnOnce() -> R) -> R {
    IN_CALL.with(|cell| {
        let previous = cell.get();
        cell.set(true);
        let result = f();
        cell.set(previous);
        result
    })
}

/// Sticky execution-path cell: transitions into `Software` are irreversible
/// until an explicit reset.
pub(crate) struct PathCell(AtomicU8);

impl PathCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ExecutionPath::Undefined as u8))
    }

    pub(crate) fn get(&self) -> ExecutionPath {
        ExecutionPath::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn set(&self, path: ExecutionPath) {
        let _ = self.0.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            if ExecutionPath::from_u8(current) == ExecutionPath::Software {
                None
            } else {
                Some(path as u8)
            }
        });
    }

    pub(crate) fn clear(&self) {
        self.0
            .store(ExecutionPath::Undefined as u8, Ordering::Relaxed);
    }
}

pub(crate) struct DeflateSettings {
    pub(crate) level: i32,
    pub(crate) method: i32,
    pub(crate) window_bits: i32,
    pub(crate) mem_level: i32,
    pub(crate) strategy: i32,
    pub(crate) path: PathCell,
}

pub(crate) struct InflateSettings {
    pub(crate) window_bits: i32,
    pub(crate) path: PathCell,
}

/// Owns the back-end adapters and the shared stream/file registries.
pub struct Dispatcher {
    qat: Box<dyn Accelerator>,
    iaa: Box<dyn Accelerator>,
    deflate_streams: ShardedMap<u64, Arc<DeflateSettings>>,
    inflate_streams: ShardedMap<u64, Arc<InflateSettings>>,
    pub(crate) files: ShardedMap<u64, Arc<Mutex<GzipFile>>>,
    ids: AtomicU64,
}

static GLOBAL: OnceLock<Arc<Dispatcher>> = OnceLock::new();

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_backends(Box::new(QatBackend), Box::new(IaaBackend))
    }

    pub fn with_backends(qat: Box<dyn Accelerator>, iaa: Box<dyn Accelerator>) -> Self {
        Self {
            qat,
            iaa,
            deflate_streams: ShardedMap::new(),
            inflate_streams: ShardedMap::new(),
            files: ShardedMap::new(),
            ids: AtomicU64::new(1),
        }
    }

    pub fn global() -> &'static Arc<Dispatcher> {
        GLOBAL.get_or_init(|| {
            lifecycle::startup();
            Arc::new(Dispatcher::new())
        })
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn qat(&self) -> &dyn Accelerator {
        self.qat.as_ref()
    }

    pub(crate) fn iaa(&self) -> &dyn Accelerator {
        self.iaa.as_ref()
    }

    /// Pick a back-end: both eligible → weighted draw, one → that one,
    /// none → software.
    pub(crate) fn select(
        &self,
        iaa_available: bool,
        qat_available: bool,
        percentage_option: ConfigOption,
    ) -> Option<&dyn Accelerator> {
        if iaa_available && qat_available {
            let draw = rand::thread_rng().gen_range(0..100_u32);
            if draw < config::get_config(percentage_option) {
                Some(self.iaa.as_ref())
            } else {
                Some(self.qat.as_ref())
            }
        } else if iaa_available {
            Some(self.iaa.as_ref())
        } else if qat_available {
            Some(self.qat.as_ref())
        } else {
            None
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DeflateStream {
    dispatcher: Arc<Dispatcher>,
    id: u64,
    settings: Arc<DeflateSettings>,
    software: SoftwareDeflate,
    total_in: u64,
    total_out: u64,
}

impl DeflateStream {
    pub fn new(level: i32) -> Result<Self, Status> {
        Self::with_options(level, METHOD_DEFLATED, 15, 8, 0)
    }

    pub fn with_options(
        level: i32,
        method: i32,
        window_bits: i32,
        mem_level: i32,
        strategy: i32,
    ) -> Result<Self, Status> {
        Self::create_on(Arc::clone(Dispatcher::global()), level, method, window_bits, mem_level, strategy)
    }

    pub fn create_on(
        dispatcher: Arc<Dispatcher>,
        level: i32,
        method: i32,
        window_bits: i32,
        mem_level: i32,
        strategy: i32,
    ) -> Result<Self, Status> {
        if method != METHOD_DEFLATED
            || !(-1..=9).contains(&level)
            || format::stream_format(window_bits) == StreamFormat::Invalid
        {
            return Err(Status::StreamError);
        }
        let id = dispatcher.next_id();
        let settings = Arc::new(DeflateSettings {
            level,
            method,
            window_bits,
            mem_level,
            strategy,
            path: PathCell::new(),
        });
        dispatcher.deflate_streams.insert(id, Arc::clone(&settings));
        debug!(
            id,
            level = settings.level,
            method = settings.method,
            window_bits = settings.window_bits,
            mem_level = settings.mem_level,
            strategy = settings.strategy,
            "deflate stream init"
        );
        let software = SoftwareDeflate::new(settings.level, settings.window_bits);
        Ok(Self {
            dispatcher,
            id,
            settings,
            software,
            total_in: 0,
            total_out: 0,
        })
    }

    pub fn deflate(&mut self, input: &[u8], output: &mut [u8], flush: Flush) -> StreamOutcome {
        let window_bits = self.settings.window_bits;
        debug!(
            id = self.id,
            avail_in = input.len(),
            avail_out = output.len(),
            ?flush,
            path = ?self.settings.path.get(),
            "deflate"
        );

        if !reentered()
            && flush == Flush::Finish
            && self.settings.path.get() != ExecutionPath::Software
        {
            let iaa_available = config::enabled(ConfigOption::UseIaaCompress)
                && self
                    .dispatcher
                    .iaa()
                    .supports(window_bits, input.len(), output.len());
            let qat_available = config::enabled(ConfigOption::UseQatCompress)
                && self
                    .dispatcher
                    .qat()
                    .supports(window_bits, input.len(), output.len());

            let selected =
                self.dispatcher
                    .select(iaa_available, qat_available, ConfigOption::IaaCompressPercentage);
            if let Some(backend) = selected {
                let options = CompressOptions {
                    gzip_ext: false,
                    max_compressed_size: if backend.path() == ExecutionPath::Iaa {
                        format::compress_bound(input.len())
                    } else {
                        0
                    },
                };
                let result =
                    nested(|| backend.compress(input, &mut *output, window_bits, options));
                self.settings.path.set(backend.path());
                match result {
                    Ok(outcome) => {
                        self.total_in += outcome.consumed as u64;
                        self.total_out += outcome.produced as u64;
                        let status = if outcome.consumed == input.len() {
                            Status::StreamEnd
                        } else {
                            Status::BufError
                        };
                        debug!(id = self.id, ?status, produced = outcome.produced, "deflate served by accelerator");
                        return StreamOutcome {
                            status,
                            consumed: outcome.consumed,
                            produced: outcome.produced,
                        };
                    }
                    Err(err) => {
                        error!(id = self.id, %err, "accelerator compress failed, falling back");
                    }
                }
            }
        }

        if reentered() || config::enabled(ConfigOption::UseZlibCompress) {
            let outcome = self.software.deflate(input, output, flush);
            if !reentered() {
                self.settings.path.set(ExecutionPath::Software);
            }
            self.total_in += outcome.consumed as u64;
            self.total_out += outcome.produced as u64;
            outcome
        } else {
            StreamOutcome {
                status: Status::DataError,
                consumed: 0,
                produced: 0,
            }
        }
    }

    pub fn reset(&mut self) {
        debug!(id = self.id, "deflate stream reset");
        self.settings.path.clear();
        self.software.reset();
        self.total_in = 0;
        self.total_out = 0;
    }

    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    pub fn execution_path(&self) -> ExecutionPath {
        self.settings.path.get()
    }

    pub fn end(self) {}
}

impl Drop for DeflateStream {
    fn drop(&mut self) {
        debug!(id = self.id, "deflate stream end");
        self.dispatcher.deflate_streams.remove(&self.id);
    }
}

pub struct InflateStream {
    dispatcher: Arc<Dispatcher>,
    id: u64,
    settings: Arc<InflateSettings>,
    software: SoftwareInflate,
    total_in: u64,
    total_out: u64,
}

impl InflateStream {
    pub fn new() -> Result<Self, Status> {
        Self::with_window_bits(15)
    }

    pub fn with_window_bits(window_bits: i32) -> Result<Self, Status> {
        Self::create_on(Arc::clone(Dispatcher::global()), window_bits)
    }

    pub fn create_on(dispatcher: Arc<Dispatcher>, window_bits: i32) -> Result<Self, Status> {
        if format::stream_format(window_bits) == StreamFormat::Invalid {
            return Err(Status::StreamError);
        }
        let id = dispatcher.next_id();
        let settings = Arc::new(InflateSettings {
            window_bits,
            path: PathCell::new(),
        });
        dispatcher.inflate_streams.insert(id, Arc::clone(&settings));
        debug!(id, window_bits, "inflate stream init");
        Ok(Self {
            dispatcher,
            id,
            settings,
            software: SoftwareInflate::new(window_bits),
            total_in: 0,
            total_out: 0,
        })
    }

    pub fn inflate(&mut self, input: &[u8], output: &mut [u8], flush: Flush) -> StreamOutcome {
        let window_bits = self.settings.window_bits;
        debug!(
            id = self.id,
            avail_in = input.len(),
            avail_out = output.len(),
            path = ?self.settings.path.get(),
            block_header = ?format::deflate_block_header(input, format::stream_format(window_bits)),
            "inflate"
        );

        if !reentered()
            && !input.is_empty()
            && self.settings.path.get() != ExecutionPath::Software
        {
            let iaa_available = config::enabled(ConfigOption::UseIaaUncompress)
                && self
                    .dispatcher
                    .iaa()
                    .supports(window_bits, input.len(), output.len())
                && self.dispatcher.iaa().supports_decompress(input, window_bits);
            let qat_available = config::enabled(ConfigOption::UseQatUncompress)
                && self
                    .dispatcher
                    .qat()
                    .supports(window_bits, input.len(), output.len());

            let selected = self.dispatcher.select(
                iaa_available,
                qat_available,
                ConfigOption::IaaUncompressPercentage,
            );
            if let Some(backend) = selected {
                let result =
                    nested(|| backend.decompress(input, &mut *output, window_bits, false));
                self.settings.path.set(backend.path());
                match result {
                    // A bulk decompression that stops short of end-of-stream
                    // cannot be resumed; treat it as a failure for this stream.
                    Ok(outcome)
                        if outcome.end_of_stream || backend.path() != ExecutionPath::Qat =>
                    {
                        self.total_in += outcome.consumed as u64;
                        self.total_out += outcome.produced as u64;
                        let status = if outcome.consumed > 0 || outcome.produced > 0 {
                            if outcome.end_of_stream {
                                Status::StreamEnd
                            } else {
                                Status::Ok
                            }
                        } else {
                            Status::BufError
                        };
                        debug!(id = self.id, ?status, produced = outcome.produced, "inflate served by accelerator");
                        return StreamOutcome {
                            status,
                            consumed: outcome.consumed,
                            produced: outcome.produced,
                        };
                    }
                    Ok(_) => {
                        debug!(id = self.id, "accelerator stopped before end of stream, falling back");
                    }
                    Err(err) => {
                        error!(id = self.id, %err, "accelerator decompress failed, falling back");
                    }
                }
            }
        }

        if reentered() || config::enabled(ConfigOption::UseZlibUncompress) {
            let outcome = self.software.inflate(input, output, flush);
            if !reentered() {
                self.settings.path.set(ExecutionPath::Software);
            }
            self.total_in += outcome.consumed as u64;
            self.total_out += outcome.produced as u64;
            outcome
        } else {
            StreamOutcome {
                status: Status::DataError,
                consumed: 0,
                produced: 0,
            }
        }
    }

    pub fn reset(&mut self) {
        debug!(id = self.id, "inflate stream reset");
        self.settings.path.clear();
        self.software.reset();
        self.total_in = 0;
        self.total_out = 0;
    }

    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    pub fn execution_path(&self) -> ExecutionPath {
        self.settings.path.get()
    }

    pub fn end(self) {}
}

impl Drop for InflateStream {
    fn drop(&mut self) {
        debug!(id = self.id, "inflate stream end");
        self.dispatcher.inflate_streams.remove(&self.id);
    }
}
