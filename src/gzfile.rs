//! Buffered gzip file layer.
//!
//! Synthesises the sequential gzip reader/writer on top of one-shot
//! accelerator calls with two buffers per handle:
//!
//! write:  data_buf --(compress)--> io_buf --(write)--> file
//! read:   file --(read)--> io_buf --(uncompress)--> data_buf
//!
//! Decompression switches irrevocably to the preserved software stream on
//! the first condition the accelerators cannot handle mid-file.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error};

use crate::backend::{Accelerator, CompressOptions};
use crate::config::{self, ConfigOption};
use crate::software::{SoftwareDeflate, SoftwareInflate};
use crate::stream::{nested, Dispatcher, PathCell};
use crate::{ExecutionPath, Flush, Status};

const WRITE_DATA_BUF_SIZE: usize = 256 << 10;
const WRITE_IO_BUF_SIZE: usize = 512 << 10;
const READ_BUF_SIZE: usize = 512 << 10;
const GZ_WINDOW_BITS: i32 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileMode {
    Read,
    Write,
    Append,
}

#[derive(Default)]
struct Buffer {
    data: Vec<u8>,
    pos: usize,
    len: usize,
}

impl Buffer {
    fn ensure(&mut self, capacity: usize) {
        if self.data.is_empty() {
            self.data = vec![0_u8; capacity];
            self.pos = 0;
            self.len = 0;
        }
    }

    fn content(&self) -> usize {
        self.len - self.pos
    }

    fn shift_to_front(&mut self) {
        let remaining = self.len - self.pos;
        self.data.copy_within(self.pos..self.len, 0);
        self.len = remaining;
        self.pos = 0;
    }
}

pub(crate) struct GzipFile {
    file: File,
    mode: FileMode,
    path: PathCell,
    software_decompression: bool,
    reached_eof: bool,
    closed: bool,
    wrote_bytes: bool,
    data_buf: Buffer,
    io_buf: Buffer,
    // Fallback streams, kept warm so a mid-file switch picks up exactly
    // where the accelerator left off.
    sw_deflate: SoftwareDeflate,
    sw_inflate: SoftwareInflate,
}

impl GzipFile {
    fn new(file: File, mode: FileMode) -> Self {
        Self {
            file,
            mode,
            path: PathCell::new(),
            software_decompression: false,
            reached_eof: false,
            closed: false,
            wrote_bytes: false,
            data_buf: Buffer::default(),
            io_buf: Buffer::default(),
            sw_deflate: SoftwareDeflate::new(-1, GZ_WINDOW_BITS),
            sw_inflate: SoftwareInflate::new(GZ_WINDOW_BITS),
        }
    }

    /// Compress the buffered segment and drain it to the file. The bulk
    /// back-end is preferred for throughput; refusal falls back to a
    /// software `Finish` so every flushed segment is a complete member.
    fn compress_and_flush(&mut self, dispatcher: &Dispatcher) -> bool {
        let input_len = self.data_buf.len;
        let mut flushed = 0;
        let mut served = false;

        if self.path.get() != ExecutionPath::Software {
            let qat_available = config::enabled(ConfigOption::UseQatCompress)
                && dispatcher
                    .qat()
                    .supports(GZ_WINDOW_BITS, input_len, self.io_buf.data.len());
            let iaa_available = config::enabled(ConfigOption::UseIaaCompress)
                && dispatcher
                    .iaa()
                    .supports(GZ_WINDOW_BITS, input_len, self.io_buf.data.len());
            let backend: Option<&dyn Accelerator> = if qat_available {
                Some(dispatcher.qat())
            } else if iaa_available {
                Some(dispatcher.iaa())
            } else {
                None
            };
            if let Some(backend) = backend {
                let options = CompressOptions {
                    gzip_ext: true,
                    max_compressed_size: 0,
                };
                let result = nested(|| {
                    backend.compress(
                        &self.data_buf.data[..input_len],
                        &mut self.io_buf.data[..],
                        GZ_WINDOW_BITS,
                        options,
                    )
                });
                match result {
                    Ok(outcome) => {
                        self.path.set(backend.path());
                        self.data_buf.pos = outcome.consumed;
                        flushed = outcome.produced;
                        served = true;
                    }
                    Err(err) => {
                        debug!(%err, "accelerator refused segment, using software");
                    }
                }
            }
        }

        if !served {
            let outcome = self.sw_deflate.deflate(
                &self.data_buf.data[..input_len],
                &mut self.io_buf.data[..],
                Flush::Finish,
            );
            if outcome.status != Status::StreamEnd {
                error!(status = ?outcome.status, "software segment compression failed");
                return false;
            }
            self.data_buf.pos = outcome.consumed;
            flushed = outcome.produced;
            self.sw_deflate.reset();
        }

        let mut offset = 0;
        while offset < flushed {
            match self.file.write(&self.io_buf.data[offset..flushed]) {
                Ok(0) => return false,
                Ok(written) => offset += written,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    error!(%err, "file write failed");
                    return false;
                }
            }
        }

        self.wrote_bytes |= flushed > 0;
        self.data_buf.shift_to_front();
        true
    }

    /// Read from the file into io_buf and decompress one cycle into data_buf.
    fn refill(&mut self, dispatcher: &Dispatcher) -> bool {
        loop {
            let space = self.io_buf.data.len() - self.io_buf.len;
            if space == 0 || self.reached_eof {
                break;
            }
            let start = self.io_buf.len;
            match self.file.read(&mut self.io_buf.data[start..]) {
                Ok(0) => self.reached_eof = true,
                Ok(read) => self.io_buf.len += read,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    error!(%err, "file read failed");
                    return false;
                }
            }
        }

        let input_len = self.io_buf.len;
        if input_len == 0 {
            // The fill ran straight into end-of-file with nothing buffered;
            // the caller stops cleanly instead of forcing a decode of nothing.
            return true;
        }
        if !self.software_decompression {
            let qat_available = config::enabled(ConfigOption::UseQatUncompress)
                && dispatcher
                    .qat()
                    .supports(GZ_WINDOW_BITS, input_len, self.data_buf.data.len());
            let iaa_available = config::enabled(ConfigOption::UseIaaUncompress)
                && dispatcher
                    .iaa()
                    .supports(GZ_WINDOW_BITS, input_len, self.data_buf.data.len())
                && dispatcher
                    .iaa()
                    .supports_decompress(&self.io_buf.data[..input_len], GZ_WINDOW_BITS);
            let backend: Option<&dyn Accelerator> = if qat_available {
                Some(dispatcher.qat())
            } else if iaa_available {
                Some(dispatcher.iaa())
            } else {
                None
            };

            let mut served = false;
            if let Some(backend) = backend {
                let result = nested(|| {
                    backend.decompress(
                        &self.io_buf.data[..input_len],
                        &mut self.data_buf.data[..],
                        GZ_WINDOW_BITS,
                        true,
                    )
                });
                match result {
                    Ok(outcome) if outcome.end_of_stream => {
                        self.path.set(backend.path());
                        self.io_buf.pos += outcome.consumed;
                        self.data_buf.len += outcome.produced;
                        served = true;
                    }
                    // Either the segment is not one of ours or it does not
                    // fit the one-shot window; zlib can span calls, so all
                    // data from here on goes through it.
                    Ok(_) | Err(_) => {}
                }
            }
            if !served {
                debug!("switching file decompression to software");
                self.software_decompression = true;
                self.path.set(ExecutionPath::Software);
            }
        }

        if self.software_decompression {
            let outcome = self.sw_inflate.inflate(
                &self.io_buf.data[self.io_buf.pos..self.io_buf.len],
                &mut self.data_buf.data[self.data_buf.len..],
                Flush::Sync,
            );
            match outcome.status {
                Status::StreamEnd => {
                    self.io_buf.pos += outcome.consumed;
                    self.data_buf.len += outcome.produced;
                    // Arm for a following concatenated member.
                    self.sw_inflate.reset();
                }
                Status::Ok => {
                    self.io_buf.pos += outcome.consumed;
                    self.data_buf.len += outcome.produced;
                }
                status => {
                    error!(?status, "software file decompression failed");
                    return false;
                }
            }
        }

        self.io_buf.shift_to_front();
        true
    }
}

fn parse_mode(mode: &str) -> Option<(FileMode, bool)> {
    let mut file_mode = None;
    let mut exclusive = false;
    for flag in mode.chars() {
        match flag {
            'r' => file_mode = Some(FileMode::Read),
            'w' => file_mode = Some(FileMode::Write),
            'a' => file_mode = Some(FileMode::Append),
            // 'b' is meaningless on this platform; 'e' (close-on-exec) is
            // already the standard library's default.
            'b' | 'e' => {}
            'x' => exclusive = true,
            _ => {}
        }
    }
    file_mode.map(|mode| (mode, exclusive))
}

/// Sequential gzip file handle.
pub struct GzFile {
    dispatcher: Arc<Dispatcher>,
    id: u64,
}

impl GzFile {
    pub fn open(path: impl AsRef<Path>, mode: &str) -> std::io::Result<Self> {
        Self::open_on(Arc::clone(Dispatcher::global()), path, mode)
    }

    pub fn open_on(
        dispatcher: Arc<Dispatcher>,
        path: impl AsRef<Path>,
        mode: &str,
    ) -> std::io::Result<Self> {
        let (file_mode, exclusive) = parse_mode(mode).ok_or_else(|| {
            std::io::Error::new(ErrorKind::InvalidInput, "mode needs one of r, w, a")
        })?;

        let mut options = OpenOptions::new();
        match file_mode {
            FileMode::Read => {
                options.read(true);
            }
            FileMode::Write => {
                options.write(true);
                if exclusive {
                    options.create_new(true);
                } else {
                    options.create(true).truncate(true);
                }
            }
            FileMode::Append => {
                options.append(true);
                if exclusive {
                    options.create_new(true);
                } else {
                    options.create(true);
                }
            }
        }
        let file = options.open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), mode, "gz open");

        let id = dispatcher.next_id();
        dispatcher
            .files
            .insert(id, Arc::new(Mutex::new(GzipFile::new(file, file_mode))));
        Ok(Self { dispatcher, id })
    }

    fn lock(entry: &Mutex<GzipFile>) -> MutexGuard<'_, GzipFile> {
        match entry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Bytes accepted into the write buffer; 0 signals an error.
    pub fn write(&self, buf: &[u8]) -> usize {
        let Some(entry) = self.dispatcher.files.get(&self.id) else {
            return 0;
        };
        let mut gz = Self::lock(&entry);
        if gz.closed || gz.mode == FileMode::Read {
            return 0;
        }
        debug!(id = self.id, len = buf.len(), path = ?gz.path.get(), "gz write");

        if !config::enabled(ConfigOption::UseQatCompress)
            && !config::enabled(ConfigOption::UseIaaCompress)
        {
            gz.path.set(ExecutionPath::Software);
        }
        gz.data_buf.ensure(WRITE_DATA_BUF_SIZE);
        gz.io_buf.ensure(WRITE_IO_BUF_SIZE);

        let mut written = 0;
        while written < buf.len() {
            let space = gz.data_buf.data.len() - gz.data_buf.len;
            let to_copy = space.min(buf.len() - written);
            let start = gz.data_buf.len;
            gz.data_buf.data[start..start + to_copy]
                .copy_from_slice(&buf[written..written + to_copy]);
            gz.data_buf.len += to_copy;
            written += to_copy;

            // Keep the final partial segment buffered; it flushes on close
            // or when later writes fill it.
            if written < buf.len() && !gz.compress_and_flush(&self.dispatcher) {
                return 0;
            }
        }
        written
    }

    /// Bytes copied out, or −1 on error.
    pub fn read(&self, buf: &mut [u8]) -> isize {
        let Some(entry) = self.dispatcher.files.get(&self.id) else {
            return -1;
        };
        let mut gz = Self::lock(&entry);
        if gz.closed || gz.mode != FileMode::Read {
            return -1;
        }
        debug!(id = self.id, len = buf.len(), path = ?gz.path.get(), "gz read");

        if !config::enabled(ConfigOption::UseQatUncompress)
            && !config::enabled(ConfigOption::UseIaaUncompress)
        {
            gz.path.set(ExecutionPath::Software);
            gz.software_decompression = true;
        }
        gz.data_buf.ensure(READ_BUF_SIZE);
        gz.io_buf.ensure(READ_BUF_SIZE);

        let mut read_bytes = 0;
        let mut more_data = true;
        while read_bytes < buf.len() && more_data {
            let to_copy = gz.data_buf.content().min(buf.len() - read_bytes);
            let start = gz.data_buf.pos;
            buf[read_bytes..read_bytes + to_copy]
                .copy_from_slice(&gz.data_buf.data[start..start + to_copy]);
            gz.data_buf.pos += to_copy;
            read_bytes += to_copy;

            if read_bytes < buf.len() {
                if !gz.reached_eof || gz.io_buf.content() > 0 {
                    // data_buf is drained at this point
                    gz.data_buf.pos = 0;
                    gz.data_buf.len = 0;
                    if !gz.refill(&self.dispatcher) {
                        return -1;
                    }
                } else {
                    more_data = false;
                }
            }
        }
        read_bytes as isize
    }

    pub fn eof(&self) -> bool {
        match self.dispatcher.files.get(&self.id) {
            Some(entry) => Self::lock(&entry).reached_eof,
            None => true,
        }
    }

    pub fn close(self) -> Status {
        self.close_impl()
    }

    fn close_impl(&self) -> Status {
        let Some(entry) = self.dispatcher.files.get(&self.id) else {
            return Status::Ok;
        };
        let mut status = Status::Ok;
        {
            let mut gz = Self::lock(&entry);
            if gz.closed {
                return Status::Ok;
            }
            gz.closed = true;
            debug!(id = self.id, buffered = gz.data_buf.content(), "gz close");

            if gz.mode != FileMode::Read {
                if gz.data_buf.content() > 0 {
                    gz.io_buf.ensure(WRITE_IO_BUF_SIZE);
                    if !gz.compress_and_flush(&self.dispatcher) {
                        status = Status::StreamError;
                    }
                }
                // Nothing may live past the last flushed byte; a finaliser
                // appending its own trailer would corrupt the member chain.
                // An untouched append handle keeps the prior content.
                if gz.mode == FileMode::Write || gz.wrote_bytes {
                    match gz.file.stream_position() {
                        Ok(position) => {
                            if gz.file.set_len(position).is_err() {
                                status = Status::StreamError;
                            }
                        }
                        Err(_) => status = Status::StreamError,
                    }
                }
            }
        }
        self.dispatcher.files.remove(&self.id);
        status
    }
}

impl Drop for GzFile {
    fn drop(&mut self) {
        let _ = self.close_impl();
    }
}
