//! Software deflate engine, the fallback every dispatch can land on.
//!
//! Raw and zlib framings map directly onto `flate2`; gzip framing is
//! synthesised here (header emission and parsing, CRC-32 + ISIZE trailer,
//! member reset) because the pure-Rust deflate backend only speaks raw and
//! zlib streams.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::format::{self, StreamFormat};
use crate::{Flush, Status, StreamOutcome};

const GZIP_OS_UNIX: u8 = 3;

const FHCRC: u8 = 1 << 1;
const FEXTRA: u8 = 1 << 2;
const FNAME: u8 = 1 << 3;
const FCOMMENT: u8 = 1 << 4;

fn compression_for(level: i32) -> Compression {
    match level {
        0..=9 => Compression::new(level as u32),
        _ => Compression::default(),
    }
}

fn map_compress_flush(flush: Flush) -> FlushCompress {
    match flush {
        Flush::None => FlushCompress::None,
        Flush::Sync => FlushCompress::Sync,
        Flush::Finish => FlushCompress::Finish,
    }
}

pub(crate) struct SoftwareDeflate {
    inner: Compress,
    format: StreamFormat,
    header_written: bool,
    trailer_queued: bool,
    finished: bool,
    crc: crc32fast::Hasher,
    raw_in: u64,
    pending: Vec<u8>,
}

impl SoftwareDeflate {
    pub(crate) fn new(level: i32, window_bits: i32) -> Self {
        let format = format::stream_format(window_bits);
        let zlib_header = format == StreamFormat::Zlib;
        Self {
            inner: Compress::new(compression_for(level), zlib_header),
            format,
            header_written: false,
            trailer_queued: false,
            finished: false,
            crc: crc32fast::Hasher::new(),
            raw_in: 0,
            pending: Vec::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.inner.reset();
        self.header_written = false;
        self.trailer_queued = false;
        self.finished = false;
        self.crc = crc32fast::Hasher::new();
        self.raw_in = 0;
        self.pending.clear();
    }

    pub(crate) fn deflate(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        flush: Flush,
    ) -> StreamOutcome {
        if self.format != StreamFormat::Gzip {
            return self.passthrough(input, output, flush);
        }

        if !self.header_written {
            self.pending
                .extend_from_slice(&[0x1F, 0x8B, 8, 0, 0, 0, 0, 0, 0, GZIP_OS_UNIX]);
            self.header_written = true;
        }

        let mut produced = self.drain_pending(output);
        if self.trailer_queued {
            // Nothing left to compress; only the queued trailer may remain.
            if self.pending.is_empty() {
                self.finished = true;
                return StreamOutcome {
                    status: Status::StreamEnd,
                    consumed: 0,
                    produced,
                };
            }
            let status = if produced > 0 { Status::Ok } else { Status::BufError };
            return StreamOutcome { status, consumed: 0, produced };
        }
        if !self.pending.is_empty() {
            let status = if produced > 0 { Status::Ok } else { Status::BufError };
            return StreamOutcome { status, consumed: 0, produced };
        }

        let before_in = self.inner.total_in();
        let before_out = self.inner.total_out();
        let body = self
            .inner
            .compress(input, &mut output[produced..], map_compress_flush(flush));
        let consumed = (self.inner.total_in() - before_in) as usize;
        produced += (self.inner.total_out() - before_out) as usize;
        self.crc.update(&input[..consumed]);
        self.raw_in += consumed as u64;

        let status = match body {
            Ok(flate2::Status::StreamEnd) => {
                if !self.trailer_queued {
                    let crc = std::mem::replace(&mut self.crc, crc32fast::Hasher::new());
                    self.pending.extend_from_slice(&crc.finalize().to_le_bytes());
                    self.pending
                        .extend_from_slice(&(self.raw_in as u32).to_le_bytes());
                    self.trailer_queued = true;
                }
                produced += self.drain_pending(&mut output[produced..]);
                if self.pending.is_empty() {
                    self.finished = true;
                    Status::StreamEnd
                } else {
                    Status::Ok
                }
            }
            Ok(flate2::Status::Ok) => Status::Ok,
            Ok(flate2::Status::BufError) => {
                if consumed > 0 || produced > 0 {
                    Status::Ok
                } else {
                    Status::BufError
                }
            }
            Err(_) => Status::StreamError,
        };

        StreamOutcome { status, consumed, produced }
    }

    fn passthrough(&mut self, input: &[u8], output: &mut [u8], flush: Flush) -> StreamOutcome {
        let before_in = self.inner.total_in();
        let before_out = self.inner.total_out();
        let result = self
            .inner
            .compress(input, output, map_compress_flush(flush));
        let consumed = (self.inner.total_in() - before_in) as usize;
        let produced = (self.inner.total_out() - before_out) as usize;
        let status = match result {
            Ok(flate2::Status::StreamEnd) => Status::StreamEnd,
            Ok(flate2::Status::Ok) => Status::Ok,
            Ok(flate2::Status::BufError) => {
                if consumed > 0 || produced > 0 {
                    Status::Ok
                } else {
                    Status::BufError
                }
            }
            Err(_) => Status::StreamError,
        };
        StreamOutcome { status, consumed, produced }
    }

    fn drain_pending(&mut self, output: &mut [u8]) -> usize {
        let take = self.pending.len().min(output.len());
        output[..take].copy_from_slice(&self.pending[..take]);
        self.pending.drain(..take);
        take
    }
}

enum InflateStage {
    Header,
    Body,
    Trailer,
    Done,
}

pub(crate) struct SoftwareInflate {
    inner: Decompress,
    format: StreamFormat,
    stage: InflateStage,
    header: Vec<u8>,
    trailer: Vec<u8>,
    crc: crc32fast::Hasher,
    member_out: u64,
}

impl SoftwareInflate {
    pub(crate) fn new(window_bits: i32) -> Self {
        let format = format::stream_format(window_bits);
        let zlib_header = format == StreamFormat::Zlib;
        Self {
            inner: Decompress::new(zlib_header),
            format,
            stage: InflateStage::Header,
            header: Vec::new(),
            trailer: Vec::new(),
            crc: crc32fast::Hasher::new(),
            member_out: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.inner.reset(self.format == StreamFormat::Zlib);
        self.stage = InflateStage::Header;
        self.header.clear();
        self.trailer.clear();
        self.crc = crc32fast::Hasher::new();
        self.member_out = 0;
    }

    pub(crate) fn inflate(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        _flush: Flush,
    ) -> StreamOutcome {
        if self.format != StreamFormat::Gzip {
            return self.passthrough(input, output);
        }

        let mut consumed = 0;
        let mut produced = 0;
        loop {
            match self.stage {
                InflateStage::Header => {
                    while input.len() > consumed {
                        self.header.push(input[consumed]);
                        consumed += 1;
                        match header_complete(&self.header) {
                            HeaderState::Complete => break,
                            HeaderState::Incomplete => {}
                            HeaderState::Invalid => {
                                return StreamOutcome {
                                    status: Status::DataError,
                                    consumed,
                                    produced,
                                };
                            }
                        }
                    }
                    if !matches!(header_complete(&self.header), HeaderState::Complete) {
                        break;
                    }
                    self.stage = InflateStage::Body;
                }
                InflateStage::Body => {
                    let before_in = self.inner.total_in();
                    let before_out = self.inner.total_out();
                    let result = self.inner.decompress(
                        &input[consumed..],
                        &mut output[produced..],
                        FlushDecompress::None,
                    );
                    let step_in = (self.inner.total_in() - before_in) as usize;
                    let step_out = (self.inner.total_out() - before_out) as usize;
                    self.crc.update(&output[produced..produced + step_out]);
                    self.member_out += step_out as u64;
                    consumed += step_in;
                    produced += step_out;
                    match result {
                        Ok(flate2::Status::StreamEnd) => self.stage = InflateStage::Trailer,
                        Ok(_) => {
                            if step_in == 0 && step_out == 0 {
                                break;
                            }
                        }
                        Err(_) => {
                            return StreamOutcome {
                                status: Status::DataError,
                                consumed,
                                produced,
                            };
                        }
                    }
                }
                InflateStage::Trailer => {
                    let take = (8 - self.trailer.len()).min(input.len() - consumed);
                    self.trailer
                        .extend_from_slice(&input[consumed..consumed + take]);
                    consumed += take;
                    if self.trailer.len() < 8 {
                        break;
                    }
                    let crc = u32::from_le_bytes([
                        self.trailer[0],
                        self.trailer[1],
                        self.trailer[2],
                        self.trailer[3],
                    ]);
                    let isize = u32::from_le_bytes([
                        self.trailer[4],
                        self.trailer[5],
                        self.trailer[6],
                        self.trailer[7],
                    ]);
                    let actual = std::mem::replace(&mut self.crc, crc32fast::Hasher::new());
                    if crc != actual.finalize() || isize != self.member_out as u32 {
                        return StreamOutcome {
                            status: Status::DataError,
                            consumed,
                            produced,
                        };
                    }
                    self.stage = InflateStage::Done;
                    return StreamOutcome {
                        status: Status::StreamEnd,
                        consumed,
                        produced,
                    };
                }
                InflateStage::Done => {
                    return StreamOutcome {
                        status: Status::StreamEnd,
                        consumed,
                        produced,
                    };
                }
            }
        }

        let status = if consumed == 0 && produced == 0 {
            Status::BufError
        } else {
            Status::Ok
        };
        StreamOutcome { status, consumed, produced }
    }

    fn passthrough(&mut self, input: &[u8], output: &mut [u8]) -> StreamOutcome {
        let before_in = self.inner.total_in();
        let before_out = self.inner.total_out();
        let result = self
            .inner
            .decompress(input, output, FlushDecompress::None);
        let consumed = (self.inner.total_in() - before_in) as usize;
        let produced = (self.inner.total_out() - before_out) as usize;
        let status = match result {
            Ok(flate2::Status::StreamEnd) => Status::StreamEnd,
            Ok(flate2::Status::Ok) => Status::Ok,
            Ok(flate2::Status::BufError) => {
                if consumed > 0 || produced > 0 {
                    Status::Ok
                } else {
                    Status::BufError
                }
            }
            Err(_) => Status::DataError,
        };
        StreamOutcome { status, consumed, produced }
    }
}

enum HeaderState {
    Complete,
    Incomplete,
    Invalid,
}

/// Incremental check over a growing gzip member header.
fn header_complete(header: &[u8]) -> HeaderState {
    if header.len() < 10 {
        if header.len() >= 1 && header[0] != 0x1F {
            return HeaderState::Invalid;
        }
        if header.len() >= 2 && header[1] != 0x8B {
            return HeaderState::Invalid;
        }
        if header.len() >= 3 && header[2] != 8 {
            return HeaderState::Invalid;
        }
        return HeaderState::Incomplete;
    }
    let flg = header[3];
    let mut pos = 10;
    if flg & FEXTRA != 0 {
        let Some(bytes) = header.get(pos..pos + 2) else {
            return HeaderState::Incomplete;
        };
        pos += 2 + usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    }
    for flag in [FNAME, FCOMMENT] {
        if flg & flag != 0 {
            let Some(tail) = header.get(pos..) else {
                return HeaderState::Incomplete;
            };
            match tail.iter().position(|b| *b == 0) {
                Some(terminator) => pos += terminator + 1,
                None => return HeaderState::Incomplete,
            }
        }
    }
    if flg & FHCRC != 0 {
        pos += 2;
    }
    if header.len() < pos {
        HeaderState::Incomplete
    } else {
        HeaderState::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i as u32 * 31 + 7) % 251) as u8).collect()
    }

    fn deflate_all(stream: &mut SoftwareDeflate, input: &[u8]) -> Vec<u8> {
        let mut out = vec![0_u8; format::compress_bound(input.len())];
        let outcome = stream.deflate(input, &mut out, Flush::Finish);
        assert_eq!(outcome.status, Status::StreamEnd);
        assert_eq!(outcome.consumed, input.len());
        out.truncate(outcome.produced);
        out
    }

    #[test]
    fn gzip_roundtrip_through_synthesised_framing() {
        let input = patterned_data(100_000);
        let mut deflater = SoftwareDeflate::new(6, 31);
        let compressed = deflate_all(&mut deflater, &input);
        assert_eq!(&compressed[..3], &[0x1F, 0x8B, 8]);

        let mut inflater = SoftwareInflate::new(31);
        let mut restored = vec![0_u8; input.len()];
        let outcome = inflater.inflate(&compressed, &mut restored, Flush::Sync);
        assert_eq!(outcome.status, Status::StreamEnd);
        assert_eq!(outcome.consumed, compressed.len());
        assert_eq!(restored[..outcome.produced], input[..]);
    }

    #[test]
    fn gzip_output_dribbles_through_a_tiny_buffer() {
        let input = patterned_data(50_000);
        let mut deflater = SoftwareDeflate::new(6, 31);
        let mut compressed = Vec::new();
        let mut consumed_total = 0;
        let mut chunk = [0_u8; 7];
        loop {
            let outcome =
                deflater.deflate(&input[consumed_total..], &mut chunk, Flush::Finish);
            assert_ne!(outcome.status, Status::StreamError);
            consumed_total += outcome.consumed;
            compressed.extend_from_slice(&chunk[..outcome.produced]);
            if outcome.status == Status::StreamEnd {
                break;
            }
        }
        assert_eq!(consumed_total, input.len());

        let mut inflater = SoftwareInflate::new(31);
        let mut restored = vec![0_u8; input.len()];
        let outcome = inflater.inflate(&compressed, &mut restored, Flush::Sync);
        assert_eq!(outcome.status, Status::StreamEnd);
        assert_eq!(restored[..outcome.produced], input[..]);
    }

    #[test]
    fn gzip_inflate_stops_at_member_end_and_resumes_after_reset() {
        let first = patterned_data(5_000);
        let second = b"second member".to_vec();
        let mut deflater = SoftwareDeflate::new(6, 31);
        let mut concatenated = deflate_all(&mut deflater, &first);
        deflater.reset();
        concatenated.extend_from_slice(&deflate_all(&mut deflater, &second));

        let mut inflater = SoftwareInflate::new(31);
        let mut restored = vec![0_u8; first.len() + second.len()];
        let outcome = inflater.inflate(&concatenated, &mut restored, Flush::Sync);
        assert_eq!(outcome.status, Status::StreamEnd);
        assert_eq!(restored[..outcome.produced], first[..]);

        inflater.reset();
        let remainder = &concatenated[outcome.consumed..];
        let rest = inflater.inflate(remainder, &mut restored, Flush::Sync);
        assert_eq!(rest.status, Status::StreamEnd);
        assert_eq!(&restored[..rest.produced], second.as_slice());
    }

    #[test]
    fn gzip_inflate_accepts_headers_with_optional_fields() {
        let input = b"gzip member with a name";
        let payload = {
            let mut deflater = SoftwareDeflate::new(6, -15);
            let mut out = vec![0_u8; format::compress_bound(input.len())];
            let outcome = deflater.deflate(input, &mut out, Flush::Finish);
            assert_eq!(outcome.status, Status::StreamEnd);
            out.truncate(outcome.produced);
            out
        };
        let mut member = vec![0x1F, 0x8B, 8, FNAME, 0, 0, 0, 0, 0, 3];
        member.extend_from_slice(b"data.bin\0");
        member.extend_from_slice(&payload);
        member.extend_from_slice(&crc32fast::hash(input).to_le_bytes());
        member.extend_from_slice(&(input.len() as u32).to_le_bytes());

        let mut inflater = SoftwareInflate::new(31);
        let mut restored = vec![0_u8; input.len()];
        let outcome = inflater.inflate(&member, &mut restored, Flush::Sync);
        assert_eq!(outcome.status, Status::StreamEnd);
        assert_eq!(&restored[..outcome.produced], input);
    }

    #[test]
    fn gzip_trailer_corruption_is_a_data_error() {
        let input = patterned_data(2_000);
        let mut deflater = SoftwareDeflate::new(6, 31);
        let mut compressed = deflate_all(&mut deflater, &input);
        let last = compressed.len() - 1;
        compressed[last] ^= 0xFF;

        let mut inflater = SoftwareInflate::new(31);
        let mut restored = vec![0_u8; input.len()];
        let outcome = inflater.inflate(&compressed, &mut restored, Flush::Sync);
        assert_eq!(outcome.status, Status::DataError);
    }

    #[test]
    fn zlib_and_raw_passthrough_roundtrip() {
        for window_bits in [15, -15] {
            let input = patterned_data(20_000);
            let mut deflater = SoftwareDeflate::new(6, window_bits);
            let compressed = deflate_all(&mut deflater, &input);

            let mut inflater = SoftwareInflate::new(window_bits);
            let mut restored = vec![0_u8; input.len()];
            let outcome = inflater.inflate(&compressed, &mut restored, Flush::Sync);
            assert_eq!(outcome.status, Status::StreamEnd, "window_bits {window_bits}");
            assert_eq!(restored[..outcome.produced], input[..]);
        }
    }
}
