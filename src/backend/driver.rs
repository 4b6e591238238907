//! Simulated accelerator device.
//!
//! The real hardware SDKs are opaque; this module stands in for them with a
//! one-shot deflate engine so the adapters keep their session lifecycle,
//! framing quirks and failure modes exercisable end to end. Streams are
//! assembled manually (headers, sentinel, extra subfield, trailers) because
//! the device model is "bounded buffer in, framed stream out".

use flate2::{Compression, Decompress, FlushDecompress, Status};
use std::io::Write;
use tracing::debug;

use super::{AccelError, CompressOutcome, DecompressOutcome};
use crate::format::{self, StreamFormat, EMPTY_BLOCK};

const GZIP_OS_UNIX: u8 = 3;
const FLG_FEXTRA: u8 = 1 << 2;

/// One device session, fixed to a framing format at setup time.
pub(crate) struct Session {
    format: StreamFormat,
    gzip_ext: bool,
    level: u32,
    /// Window size declared in emitted zlib headers; the small-buffer device
    /// has a 4 KiB history, the bulk device the full 32 KiB.
    zlib_window: i32,
}

impl Session {
    pub(crate) fn open(
        format: StreamFormat,
        gzip_ext: bool,
        level: u32,
        zlib_window: i32,
    ) -> Result<Self, AccelError> {
        if format == StreamFormat::Invalid {
            return Err(AccelError::UnsupportedFormat);
        }
        debug!(?format, gzip_ext, level, "accelerator session setup");
        Ok(Self {
            format,
            gzip_ext,
            level,
            zlib_window,
        })
    }

    pub(crate) fn compress(
        &self,
        input: &[u8],
        output: &mut [u8],
        prepend_empty_block: bool,
    ) -> Result<CompressOutcome, AccelError> {
        let payload = raw_deflate(input, self.level)?;
        let produced = assemble_stream(
            self.format,
            input,
            &payload,
            self.zlib_window,
            prepend_empty_block,
            self.gzip_ext,
            output,
        )?;
        Ok(CompressOutcome {
            consumed: input.len(),
            produced,
        })
    }

    pub(crate) fn decompress(
        &self,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<DecompressOutcome, AccelError> {
        decode_stream(self.format, input, output)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(format = ?self.format, gzip_ext = self.gzip_ext, "accelerator session teardown");
    }
}

/// The small-buffer device hands out one reusable job per thread; framing is
/// selected per call through job flags rather than at setup time.
pub(crate) struct Job {
    zlib_window: i32,
}

impl Job {
    pub(crate) fn open(zlib_window: i32) -> Result<Self, AccelError> {
        debug!("accelerator job init");
        Ok(Self { zlib_window })
    }

    pub(crate) fn compress(
        &self,
        input: &[u8],
        output: &mut [u8],
        format: StreamFormat,
        prepend_empty_block: bool,
        gzip_ext: bool,
    ) -> Result<CompressOutcome, AccelError> {
        if format == StreamFormat::Invalid {
            return Err(AccelError::UnsupportedFormat);
        }
        let payload = raw_deflate(input, Compression::default().level())?;
        let produced = assemble_stream(
            format,
            input,
            &payload,
            self.zlib_window,
            prepend_empty_block,
            gzip_ext,
            output,
        )?;
        Ok(CompressOutcome {
            consumed: input.len(),
            produced,
        })
    }

    pub(crate) fn decompress(
        &self,
        input: &[u8],
        output: &mut [u8],
        format: StreamFormat,
    ) -> Result<DecompressOutcome, AccelError> {
        if format == StreamFormat::Invalid {
            return Err(AccelError::UnsupportedFormat);
        }
        decode_stream(format, input, output)
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        debug!("accelerator job teardown");
    }
}

fn raw_deflate(input: &[u8], level: u32) -> Result<Vec<u8>, AccelError> {
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), Compression::new(level.clamp(0, 9)));
    encoder
        .write_all(input)
        .map_err(|_| AccelError::Execution("deflate failed"))?;
    encoder
        .finish()
        .map_err(|_| AccelError::Execution("deflate failed"))
}

/// Lay out `[header][extra subfield][empty block][payload][trailer]` into the
/// caller's buffer. The device reports an error rather than a partial stream
/// when the buffer cannot hold the whole result.
fn assemble_stream(
    format: StreamFormat,
    input: &[u8],
    payload: &[u8],
    zlib_window: i32,
    prepend_empty_block: bool,
    gzip_ext: bool,
    output: &mut [u8],
) -> Result<usize, AccelError> {
    let sentinel = prepend_empty_block && format != StreamFormat::Zlib;
    let ext = gzip_ext && format == StreamFormat::Gzip;

    let mut total = format::header_length(format, ext) + payload.len() + format::trailer_length(format);
    if sentinel {
        total += EMPTY_BLOCK.len();
    }
    if output.len() < total {
        return Err(AccelError::OutputTooSmall);
    }

    let mut pos = 0;
    match format {
        StreamFormat::Raw => {}
        StreamFormat::Zlib => {
            let header = zlib_header(zlib_window);
            output[..2].copy_from_slice(&header);
            pos = 2;
        }
        StreamFormat::Gzip => {
            let flg = if ext { FLG_FEXTRA } else { 0 };
            output[..10]
                .copy_from_slice(&[0x1F, 0x8B, 8, flg, 0, 0, 0, 0, 0, GZIP_OS_UNIX]);
            pos = 10;
            if ext {
                let subfield =
                    format::encode_gzip_ext(input.len() as u32, payload.len() as u32);
                output[pos..pos + subfield.len()].copy_from_slice(&subfield);
                pos += subfield.len();
            }
        }
        StreamFormat::Invalid => return Err(AccelError::UnsupportedFormat),
    }

    if sentinel {
        output[pos..pos + EMPTY_BLOCK.len()].copy_from_slice(&EMPTY_BLOCK);
        pos += EMPTY_BLOCK.len();
    }
    output[pos..pos + payload.len()].copy_from_slice(payload);
    pos += payload.len();

    match format {
        StreamFormat::Zlib => {
            output[pos..pos + 4].copy_from_slice(&adler32(input).to_be_bytes());
            pos += 4;
        }
        StreamFormat::Gzip => {
            output[pos..pos + 4].copy_from_slice(&crc32fast::hash(input).to_le_bytes());
            output[pos + 4..pos + 8].copy_from_slice(&(input.len() as u32).to_le_bytes());
            pos += 8;
        }
        _ => {}
    }

    Ok(pos)
}

/// Decode exactly one framed stream. Remaining input past the first stream
/// end is left unconsumed; `end_of_stream` is false when the output window
/// filled (or the input ran out) before the final block.
fn decode_stream(
    format: StreamFormat,
    input: &[u8],
    output: &mut [u8],
) -> Result<DecompressOutcome, AccelError> {
    match format {
        StreamFormat::Raw => inflate_once(input, output, false),
        StreamFormat::Zlib => inflate_once(input, output, true),
        StreamFormat::Gzip => decode_gzip_member(input, output),
        StreamFormat::Invalid => Err(AccelError::UnsupportedFormat),
    }
}

fn inflate_once(
    input: &[u8],
    output: &mut [u8],
    zlib_header: bool,
) -> Result<DecompressOutcome, AccelError> {
    let mut inflater = Decompress::new(zlib_header);
    let mut end_of_stream = false;
    loop {
        let consumed = inflater.total_in() as usize;
        let produced = inflater.total_out() as usize;
        let status = inflater
            .decompress(&input[consumed..], &mut output[produced..], FlushDecompress::None)
            .map_err(|_| AccelError::Execution("inflate failed"))?;
        match status {
            Status::StreamEnd => {
                end_of_stream = true;
                break;
            }
            _ => {
                if inflater.total_in() as usize == consumed
                    && inflater.total_out() as usize == produced
                {
                    break;
                }
            }
        }
    }
    Ok(DecompressOutcome {
        consumed: inflater.total_in() as usize,
        produced: inflater.total_out() as usize,
        end_of_stream,
    })
}

fn decode_gzip_member(input: &[u8], output: &mut [u8]) -> Result<DecompressOutcome, AccelError> {
    let header_len = parse_gzip_header(input)?;
    let body = inflate_once(&input[header_len..], output, false)?;
    if !body.end_of_stream {
        return Ok(DecompressOutcome {
            consumed: header_len + body.consumed,
            produced: body.produced,
            end_of_stream: false,
        });
    }

    let trailer_at = header_len + body.consumed;
    let Some(trailer) = input.get(trailer_at..trailer_at + 8) else {
        return Ok(DecompressOutcome {
            consumed: trailer_at,
            produced: body.produced,
            end_of_stream: false,
        });
    };
    let crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let isize = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
    if crc != crc32fast::hash(&output[..body.produced]) {
        return Err(AccelError::Execution("gzip trailer crc mismatch"));
    }
    if isize != body.produced as u32 {
        return Err(AccelError::Execution("gzip trailer size mismatch"));
    }
    Ok(DecompressOutcome {
        consumed: trailer_at + 8,
        produced: body.produced,
        end_of_stream: true,
    })
}

/// Walk a gzip member header, including the optional fields.
fn parse_gzip_header(data: &[u8]) -> Result<usize, AccelError> {
    const FHCRC: u8 = 1 << 1;
    const FEXTRA: u8 = 1 << 2;
    const FNAME: u8 = 1 << 3;
    const FCOMMENT: u8 = 1 << 4;
    let bad = AccelError::Execution("bad gzip header");

    if data.len() < 10 || data[0] != 0x1F || data[1] != 0x8B || data[2] != 8 {
        return Err(bad);
    }
    let flg = data[3];
    let mut pos = 10;
    if flg & FEXTRA != 0 {
        let xlen = data
            .get(pos..pos + 2)
            .map(|b| usize::from(u16::from_le_bytes([b[0], b[1]])))
            .ok_or(AccelError::Execution("bad gzip header"))?;
        pos += 2 + xlen;
    }
    for flag in [FNAME, FCOMMENT] {
        if flg & flag != 0 {
            let terminator = data
                .get(pos..)
                .and_then(|tail| tail.iter().position(|b| *b == 0))
                .ok_or(AccelError::Execution("bad gzip header"))?;
            pos += terminator + 1;
        }
    }
    if flg & FHCRC != 0 {
        pos += 2;
    }
    if pos > data.len() {
        return Err(bad);
    }
    Ok(pos)
}

fn zlib_header(window_bits: i32) -> [u8; 2] {
    let cmf = (((window_bits - 8) as u8) << 4) | 0x08;
    let base = u16::from(cmf) << 8;
    let fcheck = (31 - base % 31) % 31;
    [cmf, fcheck as u8]
}

fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65_521;
    // Largest run of 0xFF bytes that cannot overflow the accumulators.
    const CHUNK: usize = 5_552;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(CHUNK) {
        for byte in chunk {
            a += u32::from(*byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}
