mod common;

use common::*;
use zlib_accel::backend::iaa::IaaBackend;
use zlib_accel::backend::Accelerator;
use zlib_accel::format::{compress_bound, EMPTY_BLOCK};
use zlib_accel::{
    compress2, uncompress2, DeflateStream, ExecutionPath, Flush, InflateStream, Status,
};

fn compress_stream(input: &[u8], window_bits: i32) -> (Vec<u8>, ExecutionPath) {
    let mut stream = DeflateStream::with_options(-1, 8, window_bits, 8, 0)
        .expect("deflate init should succeed");
    let mut output = vec![0_u8; compress_bound(input.len())];
    let outcome = stream.deflate(input, &mut output, Flush::Finish);
    assert_eq!(outcome.status, Status::StreamEnd);
    assert_eq!(
        stream.total_in() + (input.len() - outcome.consumed) as u64,
        input.len() as u64,
        "consumed plus remaining input must cover the original"
    );
    assert_eq!(stream.total_out(), outcome.produced as u64);
    output.truncate(outcome.produced);
    (output, stream.execution_path())
}

fn uncompress_stream(
    compressed: &[u8],
    window_bits: i32,
    expected_len: usize,
) -> (Vec<u8>, ExecutionPath, usize) {
    let mut stream =
        InflateStream::with_window_bits(window_bits).expect("inflate init should succeed");
    let mut output = vec![0_u8; expected_len];
    let outcome = stream.inflate(compressed, &mut output, Flush::Sync);
    assert_eq!(outcome.status, Status::StreamEnd);
    output.truncate(outcome.produced);
    (output, stream.execution_path(), outcome.consumed)
}

#[test]
fn software_only_small_string_roundtrip() {
    let _guard = config_guard();
    set_compress_path(ExecutionPath::Software, true);
    set_uncompress_path(ExecutionPath::Software, true);
    set_marker(false);

    let input = b"Hello, world!";
    let (compressed, compress_path) = compress_stream(input, 15);
    assert_eq!(compress_path, ExecutionPath::Software);

    let (restored, uncompress_path, _) = uncompress_stream(&compressed, 15, input.len());
    assert_eq!(uncompress_path, ExecutionPath::Software);
    assert_eq!(restored, input);
}

#[test]
fn bulk_backend_gzip_zeros_roundtrip() {
    let _guard = config_guard();
    set_compress_path(ExecutionPath::Qat, true);
    set_uncompress_path(ExecutionPath::Qat, true);
    set_marker(false);
    set_chunking(false);

    let input = vec![0_u8; 1024 * 1024];
    let (compressed, compress_path) = compress_stream(&input, 31);
    assert_eq!(compress_path, ExecutionPath::Qat);
    assert!(
        compressed.len() < 4096,
        "zero block should compress to almost nothing, got {}",
        compressed.len()
    );

    let (restored, uncompress_path, _) = uncompress_stream(&compressed, 31, input.len());
    assert_eq!(uncompress_path, ExecutionPath::Qat);
    assert_eq!(restored, input);
}

#[test]
fn small_backend_raw_with_marker_roundtrip() {
    let _guard = config_guard();
    set_compress_path(ExecutionPath::Iaa, true);
    set_uncompress_path(ExecutionPath::Iaa, true);
    set_marker(true);

    let input = random_with_repeated_block(16 * 1024, 1024);
    let (compressed, compress_path) = compress_stream(&input, -15);
    assert_eq!(compress_path, ExecutionPath::Iaa);
    assert_eq!(&compressed[..5], &EMPTY_BLOCK, "marker must lead the stream");

    let (restored, uncompress_path, consumed) = uncompress_stream(&compressed, -15, input.len());
    assert_eq!(uncompress_path, ExecutionPath::Iaa);
    assert_eq!(consumed, compressed.len());
    assert_eq!(restored, input);

    set_marker(false);
}

#[test]
fn small_backend_tiny_window_zlib_roundtrip() {
    let _guard = config_guard();
    set_compress_path(ExecutionPath::Iaa, true);
    set_uncompress_path(ExecutionPath::Iaa, true);
    set_marker(false);

    let input = random_data(100 * 1024);
    let (compressed, compress_path) = compress_stream(&input, 8);
    assert_eq!(compress_path, ExecutionPath::Iaa);
    assert!(
        IaaBackend.supports_decompress(&compressed, 8),
        "emitted window must fit the device history buffer"
    );

    let (restored, uncompress_path, _) = uncompress_stream(&compressed, 8, input.len());
    assert_eq!(uncompress_path, ExecutionPath::Iaa);
    assert_eq!(restored, input);
}

#[test]
fn oversized_input_falls_back_unless_chunking_or_raw() {
    let _guard = config_guard();
    set_compress_path(ExecutionPath::Qat, true);
    set_uncompress_path(ExecutionPath::Software, true);
    set_marker(false);

    let input = mixed_data(3 * 1024 * 1024);

    // Non-raw framing past the hardware buffer: software, unless chunking
    // is allowed. Raw framing has no such limit.
    set_chunking(false);
    for window_bits in [15, 31] {
        let (compressed, path) = compress_stream(&input, window_bits);
        assert_eq!(path, ExecutionPath::Software, "window_bits {window_bits}");
        let (restored, _, _) = uncompress_stream(&compressed, window_bits, input.len());
        assert_eq!(restored, input);
    }
    let (_, raw_path) = compress_stream(&input, -15);
    assert_eq!(raw_path, ExecutionPath::Qat);

    set_chunking(true);
    let (compressed, chunked_path) = compress_stream(&input, 31);
    assert_eq!(chunked_path, ExecutionPath::Qat);
    let (restored, _, _) = uncompress_stream(&compressed, 31, input.len());
    assert_eq!(restored, input);
    set_chunking(false);
}

#[test]
fn concatenated_streams_resume_after_reset() {
    let _guard = config_guard();
    set_compress_path(ExecutionPath::Qat, true);
    set_uncompress_path(ExecutionPath::Qat, true);
    set_marker(false);
    set_chunking(false);

    let first = mixed_data(64 * 1024);
    let second = patterned_data(32 * 1024);
    let (mut concatenated, _) = compress_stream(&first, 31);
    let (tail, _) = compress_stream(&second, 31);
    concatenated.extend_from_slice(&tail);

    let mut stream = InflateStream::with_window_bits(31).expect("inflate init");
    let mut output = vec![0_u8; first.len() + second.len()];
    let outcome = stream.inflate(&concatenated, &mut output, Flush::Sync);
    assert_eq!(outcome.status, Status::StreamEnd);
    assert_eq!(&output[..outcome.produced], first.as_slice());
    assert!(
        outcome.consumed < concatenated.len(),
        "second member must stay unconsumed"
    );

    stream.reset();
    let rest = stream.inflate(&concatenated[outcome.consumed..], &mut output, Flush::Sync);
    assert_eq!(rest.status, Status::StreamEnd);
    assert_eq!(&output[..rest.produced], second.as_slice());
}

#[test]
fn small_backend_consumes_through_the_first_stream() {
    let _guard = config_guard();
    set_compress_path(ExecutionPath::Iaa, true);
    set_uncompress_path(ExecutionPath::Iaa, true);
    set_marker(false);

    let first = patterned_data(8 * 1024);
    let second = patterned_data(4 * 1024);
    let (mut concatenated, _) = compress_stream(&first, -15);
    let (tail, _) = compress_stream(&second, -15);
    concatenated.extend_from_slice(&tail);

    // The device reports the whole input consumed at end-of-stream, so a
    // concatenated raw stream stops after the first member.
    let mut stream = InflateStream::with_window_bits(-15).expect("inflate init");
    let mut output = vec![0_u8; first.len() + second.len()];
    let outcome = stream.inflate(&concatenated, &mut output, Flush::Sync);
    assert_eq!(outcome.status, Status::StreamEnd);
    assert_eq!(outcome.consumed, concatenated.len());
    assert_eq!(&output[..outcome.produced], first.as_slice());
}

#[test]
fn oneshot_roundtrip_on_software_and_accelerator() {
    let _guard = config_guard();
    set_marker(false);

    for path in [ExecutionPath::Software, ExecutionPath::Qat, ExecutionPath::Iaa] {
        set_compress_path(path, true);
        set_uncompress_path(path, true);

        let input = mixed_data(256 * 1024);
        let mut compressed = vec![0_u8; compress_bound(input.len())];
        let produced = compress2(&mut compressed, &input, -1).expect("compress2");
        compressed.truncate(produced);

        let mut restored = vec![0_u8; input.len()];
        let (produced, consumed) =
            uncompress2(&mut restored, &compressed).expect("uncompress2");
        assert_eq!(consumed, compressed.len(), "path {path:?}");
        assert_eq!(&restored[..produced], input.as_slice(), "path {path:?}");
    }
}

#[test]
fn oneshot_reports_undersized_output() {
    let _guard = config_guard();
    set_compress_path(ExecutionPath::Software, true);
    set_uncompress_path(ExecutionPath::Software, true);

    let input = random_data(64 * 1024);
    let mut tiny = vec![0_u8; 128];
    assert_eq!(compress2(&mut tiny, &input, -1), Err(Status::BufError));
}

#[test]
fn every_backend_combination_roundtrips_with_fallback_enabled() {
    let _guard = config_guard();
    set_marker(false);
    set_chunking(false);

    let paths = [ExecutionPath::Software, ExecutionPath::Qat, ExecutionPath::Iaa];
    let input = mixed_data(64 * 1024);
    for compress_path in paths {
        for uncompress_path in paths {
            for window_bits in [-15, 15, 31] {
                set_compress_path(compress_path, true);
                set_uncompress_path(uncompress_path, true);

                let (compressed, _) = compress_stream(&input, window_bits);
                let (restored, _, _) =
                    uncompress_stream(&compressed, window_bits, input.len());
                assert_eq!(
                    restored, input,
                    "compress {compress_path:?}, uncompress {uncompress_path:?}, window_bits {window_bits}"
                );
            }
        }
    }
}

#[test]
fn chunked_input_switches_to_software_and_stays_there() {
    let _guard = config_guard();
    set_compress_path(ExecutionPath::Software, true);
    set_uncompress_path(ExecutionPath::Qat, true);
    set_marker(false);

    let input = mixed_data(512 * 1024);
    let (compressed, _) = compress_stream(&input, 31);

    // Feeding one member in small pieces: the bulk engine cannot finish the
    // stream inside the first piece, so the stream latches onto software and
    // the remaining pieces decode statefully.
    let mut stream = InflateStream::with_window_bits(31).expect("inflate init");
    let mut output = vec![0_u8; input.len()];
    let mut consumed_total = 0;
    let mut produced_total = 0;
    let mut status = Status::Ok;
    for piece in compressed.chunks(64 * 1024) {
        let mut fed = 0;
        while fed < piece.len() {
            let outcome = stream.inflate(&piece[fed..], &mut output[produced_total..], Flush::Sync);
            assert_ne!(outcome.status, Status::DataError);
            fed += outcome.consumed;
            produced_total += outcome.produced;
            status = outcome.status;
            if outcome.status == Status::StreamEnd {
                break;
            }
        }
        consumed_total += fed;
    }
    assert_eq!(status, Status::StreamEnd);
    assert_eq!(consumed_total, compressed.len());
    assert_eq!(&output[..produced_total], input.as_slice());
    assert_eq!(stream.execution_path(), ExecutionPath::Software);
}

#[test]
fn invalid_window_bits_is_a_stream_error() {
    let _guard = config_guard();
    assert!(matches!(
        DeflateStream::with_options(-1, 8, 16, 8, 0),
        Err(Status::StreamError)
    ));
    assert!(matches!(
        DeflateStream::with_options(-1, 7, 15, 8, 0),
        Err(Status::StreamError)
    ));
    assert!(matches!(
        InflateStream::with_window_bits(0),
        Err(Status::StreamError)
    ));
}
