//! Framing knowledge shared by the dispatch core and the back-end adapters.

/// Size of the custom gzip extra subfield (XLEN through the two lengths).
pub const GZIP_EXT_XHDR_SIZE: usize = 14;
/// Combined header + trailer size of the extended gzip format.
pub const GZIP_EXT_HDRFTR_SIZE: usize = 32;

/// Stored empty deflate block, used as a marker right after the framing header.
pub const EMPTY_BLOCK: [u8; 5] = [0x00, 0x00, 0x00, 0xFF, 0xFF];

const GZIP_ID1: u8 = 0x1F;
const GZIP_ID2: u8 = 0x8B;
const CM_DEFLATE: u8 = 8;
const FLG_FEXTRA: u8 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamFormat {
    Raw,
    Zlib,
    Gzip,
    Invalid,
}

/// Map a zlib-style window-bits parameter onto the outer framing it selects.
pub fn stream_format(window_bits: i32) -> StreamFormat {
    match window_bits {
        -15..=-8 => StreamFormat::Raw,
        8..=15 => StreamFormat::Zlib,
        24..=31 => StreamFormat::Gzip,
        _ => StreamFormat::Invalid,
    }
}

pub fn header_length(format: StreamFormat, gzip_ext: bool) -> usize {
    match format {
        StreamFormat::Zlib => 2,
        StreamFormat::Gzip => {
            if gzip_ext {
                10 + GZIP_EXT_XHDR_SIZE
            } else {
                10
            }
        }
        _ => 0,
    }
}

pub fn trailer_length(format: StreamFormat) -> usize {
    match format {
        StreamFormat::Zlib => 4,
        StreamFormat::Gzip => 8,
        _ => 0,
    }
}

/// Window size (in bits) declared by a zlib header. Falls back to the maximum
/// 32 KiB window when no header byte is available.
pub fn zlib_header_window(data: &[u8]) -> i32 {
    match data.first() {
        Some(cmf) => i32::from(cmf >> 4) + 8,
        None => 15,
    }
}

/// Detect the custom "QZ" extra subfield that pre-declares stream sizes.
///
/// Returns `(source_size, payload_size)` where `payload_size` is the length of
/// the raw deflate payload between the extended header and the trailer.
pub fn detect_gzip_ext(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 24 {
        return None;
    }
    if data[0] != GZIP_ID1 || data[1] != GZIP_ID2 || data[2] != CM_DEFLATE {
        return None;
    }
    if data[3] & FLG_FEXTRA == 0 {
        return None;
    }
    // XLEN = 12, subfield id "QZ", subfield length = 8
    if data[10..16] != [0x0C, 0x00, b'Q', b'Z', 0x08, 0x00] {
        return None;
    }
    let src_size = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);
    let payload_size = u32::from_le_bytes([data[20], data[21], data[22], data[23]]);
    Some((src_size, payload_size))
}

/// The 14 extra-subfield bytes inserted between the base gzip header and the
/// deflate payload. The caller is responsible for setting FLG.FEXTRA.
pub fn encode_gzip_ext(src_size: u32, payload_size: u32) -> [u8; GZIP_EXT_XHDR_SIZE] {
    let mut ext = [0_u8; GZIP_EXT_XHDR_SIZE];
    ext[0] = 0x0C;
    ext[2] = b'Q';
    ext[3] = b'Z';
    ext[4] = 0x08;
    ext[6..10].copy_from_slice(&src_size.to_le_bytes());
    ext[10..14].copy_from_slice(&payload_size.to_le_bytes());
    ext
}

/// Whether the stored-empty-block marker sits right after the framing header.
pub fn empty_block_present(input: &[u8], format: StreamFormat) -> bool {
    let header = header_length(format, false);
    match input.get(header..header + EMPTY_BLOCK.len()) {
        Some(window) => window == EMPTY_BLOCK,
        None => false,
    }
}

/// Worst-case compressed size for `len` input bytes, including framing.
///
/// Mirrors the classical deflateBound arithmetic so adapter output that
/// overshoots it can be rejected before it reaches a caller-sized buffer.
pub fn compress_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13 + GZIP_EXT_HDRFTR_SIZE
}

/// First deflate block header after the framing header, for diagnostics.
pub fn deflate_block_header(data: &[u8], format: StreamFormat) -> Option<(u8, u8)> {
    let first = *data.get(header_length(format, false))?;
    Some((first & 0b0000_0001, (first & 0b0000_0110) >> 1))
}
