//! Parallel block compression.
//!
//! The input is split into consecutive blocks. A bounded pool of scoped threads
//! deflates each block with a fresh raw-deflate encoder:
//!
//! - every block but the last ends with a sync flush, which leaves the bit
//!   stream byte-aligned and the deflate stream open;
//! - the last block is finished, setting BFINAL.
//!
//! Blocks share no history, so concatenating them in input order is a valid
//! deflate stream. The collector (the calling thread) reorders finished blocks
//! by index, folds their CRC-32s together and closes the gzip member with one
//! trailer for the whole input.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crc32fast::Hasher as Crc32Hasher;
use crossbeam_channel::bounded;
use flate2::{Compress, Compression, FlushCompress, Status};
use tracing::debug;

use crate::compress::gzip;
use crate::error::{DebError, Result};
use crate::progress::{BuildStage, ProgressTracker};

/// Output of one worker for one block.
struct CompressedBlock {
    index: usize,
    data: Vec<u8>,
    crc: u32,
    len: usize,
}

/// Splits `len` bytes into consecutive ranges of `block_size`; the last one may be shorter.
/// Empty input yields a single empty range so the stream still gets a final block.
pub(crate) fn plan_blocks(len: usize, block_size: usize) -> Vec<Range<usize>> {
    let block_size = block_size.max(1);
    if len == 0 {
        return vec![0..0];
    }
    (0..len)
        .step_by(block_size)
        .map(|start| start..(start + block_size).min(len))
        .collect()
}

/// Deflates one block. Non-final blocks end on a sync flush, the final block
/// terminates the deflate stream.
pub(crate) fn deflate_block(data: &[u8], level: u32, last: bool) -> Result<Vec<u8>> {
    let mut encoder = Compress::new(Compression::new(level), false);
    let flush = if last { FlushCompress::Finish } else { FlushCompress::Sync };
    let mut out = Vec::with_capacity(data.len() + data.len() / 8 + 64);

    loop {
        if out.capacity() - out.len() < 64 {
            out.reserve(out.capacity().max(4096));
        }
        let (in_before, out_before) = (encoder.total_in(), encoder.total_out());
        let consumed = in_before as usize;
        let status = encoder
            .compress_vec(&data[consumed..], &mut out, flush)
            .map_err(|e| DebError::Compression(e.to_string()))?;
        let drained = encoder.total_in() as usize == data.len();
        let has_room = out.len() < out.capacity();

        match status {
            Status::StreamEnd => break,
            // With input drained and room to spare the sync flush has been fully written.
            _ if !last && drained && has_room => break,
            Status::Ok | Status::BufError => {
                let stalled = encoder.total_in() == in_before && encoder.total_out() == out_before;
                if stalled && has_room {
                    return Err(DebError::Compression(format!(
                        "deflate made no progress after {} of {} bytes",
                        consumed,
                        data.len()
                    )));
                }
            }
        }
    }
    Ok(out)
}

/// Compresses `input` into a gzip stream using up to `workers` threads.
pub fn compress_parallel(
    input: &[u8],
    level: u32,
    workers: usize,
    block_size: usize,
    tracker: &ProgressTracker,
) -> Result<Vec<u8>> {
    compress_blocks_with(input, level, workers, block_size, tracker, deflate_block)
}

pub(crate) fn compress_blocks_with<F>(
    input: &[u8],
    level: u32,
    workers: usize,
    block_size: usize,
    tracker: &ProgressTracker,
    encode: F,
) -> Result<Vec<u8>>
where
    F: Fn(&[u8], u32, bool) -> Result<Vec<u8>> + Sync,
{
    let blocks = plan_blocks(input.len(), block_size);
    let block_count = blocks.len();
    let num_workers = workers.clamp(1, block_count);
    tracker.enter_stage(BuildStage::Compress, block_count as u64);
    debug!(blocks = block_count, workers = num_workers, block_size, "Starting block compression");

    let abort = AtomicBool::new(false);
    let abort = &abort;
    let encode = &encode;

    thread::scope(|s| {
        let (job_sender, job_receiver) = bounded::<(usize, Range<usize>)>(num_workers * 2);
        let (block_sender, block_receiver) = bounded::<Result<CompressedBlock>>(num_workers * 2);
        let mut handles = Vec::with_capacity(num_workers + 1);

        // --- Compression Worker Threads ---
        for _ in 0..num_workers {
            let job_receiver = job_receiver.clone();
            let block_sender = block_sender.clone();
            handles.push(s.spawn(move || {
                for (index, range) in job_receiver {
                    if abort.load(Ordering::Relaxed) {
                        break;
                    }
                    let data = &input[range];
                    let last = index + 1 == block_count;
                    let result = encode(data, level, last).map(|compressed| CompressedBlock {
                        index,
                        crc: crc32fast::hash(data),
                        len: data.len(),
                        data: compressed,
                    });
                    if let Ok(block) = &result {
                        debug!(block = index, raw = block.len, compressed = block.data.len(), "Block done");
                        tracker.record_block(block.len as u64, block.data.len() as u64);
                    }
                    if block_sender.send(result).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(job_receiver);
        drop(block_sender);

        // --- Producer Thread (sends block ranges to workers) ---
        handles.push(s.spawn(move || {
            for job in blocks.into_iter().enumerate() {
                if abort.load(Ordering::Relaxed) || job_sender.send(job).is_err() {
                    break;
                }
            }
        }));

        // --- Collector (this thread) ---
        let mut out = Vec::with_capacity(input.len() / 2 + gzip::HEADER_LEN + gzip::TRAILER_LEN);
        gzip::write_header(&mut out, level);
        let mut crc = Crc32Hasher::new();
        let mut pending: BTreeMap<usize, CompressedBlock> = BTreeMap::new();
        let mut next = 0usize;
        let mut failure: Option<DebError> = None;

        for msg in &block_receiver {
            match msg {
                Ok(block) => {
                    pending.insert(block.index, block);
                    while let Some(block) = pending.remove(&next) {
                        crc.combine(&Crc32Hasher::new_with_initial_len(block.crc, block.len as u64));
                        out.extend_from_slice(&block.data);
                        next += 1;
                    }
                }
                Err(e) => {
                    abort.store(true, Ordering::Relaxed);
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(block_receiver);

        for handle in handles {
            if handle.join().is_err() {
                abort.store(true, Ordering::Relaxed);
                failure.get_or_insert_with(|| DebError::Compression("a worker thread panicked".into()));
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if next != block_count {
            return Err(DebError::Compression(format!(
                "only {next} of {block_count} blocks were produced"
            )));
        }

        gzip::write_trailer(&mut out, crc.finalize(), input.len() as u64);
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn decode(gz: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(gz).read_to_end(&mut out).unwrap();
        out
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ (i / 1000) as u8).collect()
    }

    #[test]
    fn plan_covers_input_in_order() {
        let plan = plan_blocks(10, 4);
        assert_eq!(plan, vec![0..4, 4..8, 8..10]);
        assert_eq!(plan_blocks(8, 4), vec![0..4, 4..8]);
        assert_eq!(plan_blocks(0, 4), vec![0..0]);
    }

    #[test]
    fn empty_input_is_a_valid_stream() {
        let gz = compress_parallel(&[], 6, 4, 1024, &ProgressTracker::disabled()).unwrap();
        assert!(decode(&gz).is_empty());
        assert_eq!(&gz[gz.len() - 8..], &[0u8; 8]);
    }

    #[test]
    fn many_small_blocks_round_trip() {
        let input = sample(50_000);
        for workers in [1, 2, 8] {
            let gz = compress_parallel(&input, 6, workers, 1024, &ProgressTracker::disabled()).unwrap();
            assert_eq!(decode(&gz), input, "workers = {workers}");
        }
    }

    #[test]
    fn every_level_round_trips() {
        let input = sample(20_000);
        for level in 0..=9 {
            let gz = compress_parallel(&input, level, 3, 4096, &ProgressTracker::disabled()).unwrap();
            assert_eq!(decode(&gz), input, "level = {level}");
        }
    }

    #[test]
    fn trailer_covers_whole_input() {
        let input = sample(9_000);
        let gz = compress_parallel(&input, 6, 4, 1000, &ProgressTracker::disabled()).unwrap();
        let trailer = &gz[gz.len() - 8..];
        assert_eq!(&trailer[..4], &crc32fast::hash(&input).to_le_bytes());
        assert_eq!(&trailer[4..], &(input.len() as u32).to_le_bytes());
    }

    #[test]
    fn out_of_order_completion_keeps_input_order() {
        let input = sample(8 * 512);
        // Early blocks are slowest so later ones finish first.
        let slow_start = |data: &[u8], level: u32, last: bool| {
            let delay = if data.as_ptr() == input.as_ptr() { 50 } else { 0 };
            std::thread::sleep(std::time::Duration::from_millis(delay));
            deflate_block(data, level, last)
        };
        let gz = compress_blocks_with(&input, 6, 4, 512, &ProgressTracker::disabled(), slow_start).unwrap();
        assert_eq!(decode(&gz), input);
    }

    #[test]
    fn encoder_error_aborts_everything() {
        let input = sample(16 * 256);
        let failing = |data: &[u8], level: u32, last: bool| {
            if last {
                Err(DebError::Compression("out of memory".into()))
            } else {
                deflate_block(data, level, last)
            }
        };
        let err = compress_blocks_with(&input, 6, 4, 256, &ProgressTracker::disabled(), failing).unwrap_err();
        assert!(matches!(err, DebError::Compression(ref m) if m == "out of memory"));
    }

    #[test]
    fn worker_panic_is_reported_as_compression_failure() {
        let input = sample(4 * 256);
        let panicking = |data: &[u8], level: u32, last: bool| {
            if last {
                panic!("worker crashed");
            }
            deflate_block(data, level, last)
        };
        let err = compress_blocks_with(&input, 6, 2, 256, &ProgressTracker::disabled(), panicking).unwrap_err();
        assert!(matches!(err, DebError::Compression(_)));
    }
}
