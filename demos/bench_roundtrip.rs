use std::sync::Arc;
use std::time::{Duration, Instant};

use accel_deflate::{
    AccelEngine, AccelJob, CodecMode, DeflateCodec, Decompression, JobPool, Status, ThreadEngine,
};

// An accelerator that never comes up, so the whole run stays on the software
// path for comparison.
struct OfflineEngine;

impl AccelEngine for OfflineEngine {
    fn init_job(&self) -> Result<Box<dyn AccelJob>, Status> {
        Err(Status::InitFailed)
    }
}

fn build_mixed_dataset(bytes: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes);
    let mut state: u32 = 0x1234_5678;

    while out.len() < bytes {
        let zone = (out.len() / 4096) % 3;
        match zone {
            0 => out.extend_from_slice(b"accel-deflate-job-slot-"),
            1 => out.extend_from_slice(b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"),
            _ => {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                out.push((state >> 24) as u8);
            }
        }
    }

    out.truncate(bytes);
    out
}

fn mib_s(bytes: usize, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return 0.0;
    }
    (bytes as f64 / (1024.0 * 1024.0)) / elapsed.as_secs_f64()
}

fn run(label: &str, codec: &mut DeflateCodec, mode: CodecMode, chunks: &[Vec<u8>]) {
    let input_total: usize = chunks.iter().map(Vec::len).sum();

    let compress_start = Instant::now();
    let compressed: Vec<Vec<u8>> = chunks
        .iter()
        .map(|chunk| codec.compress(chunk).expect("compress should succeed"))
        .collect();
    let compress_elapsed = compress_start.elapsed();
    let compressed_total: usize = compressed.iter().map(Vec::len).sum();

    codec.set_mode(mode);
    let decompress_start = Instant::now();
    let mut restored_total = 0usize;
    let mut pending = 0usize;
    for (chunk, bytes) in chunks.iter().zip(&compressed) {
        match codec
            .decompress(bytes, chunk.len())
            .expect("decompress should succeed")
        {
            Decompression::Completed(data) => restored_total += data.len(),
            Decompression::InFlight(_) => pending += 1,
        }
    }
    for finished in codec.drain() {
        restored_total += finished.data.len();
    }
    let decompress_elapsed = decompress_start.elapsed();
    assert_eq!(restored_total, input_total);

    println!(
        "{label}: ratio {:.4}, compress {:.1} MiB/s, decompress {:.1} MiB/s ({pending} jobs offloaded)",
        compressed_total as f64 / input_total as f64,
        mib_s(input_total, compress_elapsed),
        mib_s(input_total, decompress_elapsed),
    );
}

fn main() {
    let chunks: Vec<Vec<u8>> = (0..64)
        .map(|_| build_mixed_dataset(256 * 1024))
        .collect();

    let pool = Arc::new(JobPool::with_slots(Arc::new(ThreadEngine::new()), 128));
    let mut offload = DeflateCodec::with_pool(Arc::clone(&pool));
    run("offload", &mut offload, CodecMode::Asynchronous, &chunks);

    let offline = Arc::new(JobPool::with_slots(Arc::new(OfflineEngine), 1));
    let mut software = DeflateCodec::with_pool(offline);
    run("software", &mut software, CodecMode::SoftwareFallback, &chunks);
}
