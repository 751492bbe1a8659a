mod common;

use common::gunzip;
use fastdeb::compress::{self, CompressionMode, GzipCodec, GzipOptions};
use fastdeb::{DebError, ErrorClass};
use rand::{rngs::StdRng, Rng, SeedableRng};

// ---------- helpers ----------
/// Half random, half repetitive text so both stored and matched deflate blocks appear.
fn mixed_payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = Vec::with_capacity(len);
    while buf.len() < len {
        if rng.gen_bool(0.5) {
            let n = rng.gen_range(1..4096).min(len - buf.len());
            buf.extend((0..n).map(|_| rng.gen::<u8>()));
        } else {
            let line = b"usr/share/doc/package/changelog.Debian.gz 0644 root root\n";
            let n = line.len().min(len - buf.len());
            buf.extend_from_slice(&line[..n]);
        }
    }
    buf
}

#[test]
fn parallel_matches_single_threaded_content() {
    let input = mixed_payload(1_500_000, 7);
    let reference = gunzip(&compress::compress(&input, &GzipOptions::single_threaded(6)).unwrap());
    assert_eq!(reference, input);

    for workers in [1, 2, 8] {
        for block_kb in [1, 64, 128] {
            let gz = compress::compress(&input, &GzipOptions::parallel(6, workers, block_kb)).unwrap();
            assert_eq!(gunzip(&gz), reference, "workers = {workers}, block = {block_kb} KiB");
        }
    }
}

#[test]
fn block_boundaries_at_exact_multiples() {
    for len in [0, 1, 1023, 1024, 1025, 4096, 4097] {
        let input = mixed_payload(len, len as u64);
        let gz = compress::compress(&input, &GzipOptions::parallel(6, 4, 1)).unwrap();
        assert_eq!(gunzip(&gz), input, "len = {len}");
    }
}

#[test]
fn levels_are_honoured_in_both_modes() {
    let input = mixed_payload(400_000, 3);
    let stored_single = compress::compress(&input, &GzipOptions::single_threaded(0)).unwrap();
    let stored_parallel = compress::compress(&input, &GzipOptions::parallel(0, 4, 64)).unwrap();
    let best_single = compress::compress(&input, &GzipOptions::single_threaded(9)).unwrap();
    let best_parallel = compress::compress(&input, &GzipOptions::parallel(9, 4, 64)).unwrap();

    // Level 0 stores, so output is at least as large as the input.
    assert!(stored_single.len() >= input.len());
    assert!(stored_parallel.len() >= input.len());
    assert!(best_single.len() < input.len());
    assert!(best_parallel.len() < input.len());
    // Independent blocks cost a little ratio, not a different order of magnitude.
    assert!(best_parallel.len() < best_single.len() * 2);

    for gz in [&stored_single, &stored_parallel, &best_single, &best_parallel] {
        assert_eq!(&gunzip(gz), &input);
    }
}

#[test]
fn gzip_header_is_standard() {
    let gz = compress::compress(b"abc", &GzipOptions::parallel(6, 2, 1)).unwrap();
    assert_eq!(&gz[..4], &[0x1f, 0x8b, 8, 0]);
}

#[test]
fn invalid_level_is_config_error() {
    let opts = GzipOptions { level: 11, mode: CompressionMode::Parallel, workers: 2, block_size_kb: 64 };
    let err = GzipCodec::from_options(&opts).unwrap_err();
    assert!(matches!(err, DebError::InvalidOption(_)));
    assert_eq!(err.class(), ErrorClass::Config);
}

#[test]
fn compress_file_replaces_previous_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.tar");
    let input = mixed_payload(200_000, 11);
    std::fs::write(&path, &input).unwrap();
    std::fs::write(dir.path().join("data.tar.gz"), b"old").unwrap();

    let gz_path = compress::compress_file(&path, &GzipOptions::default()).unwrap();
    assert_eq!(gunzip(&std::fs::read(gz_path).unwrap()), input);
}
