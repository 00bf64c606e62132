use std::collections::HashSet;
use std::sync::Arc;

use crate::engine::{JobRequest, Status};
use crate::max_compressed_size;
use crate::pool::{JobId, JobPool};

#[derive(Debug)]
pub struct DrainedJob {
    pub id: JobId,
    pub status: Status,
    pub data: Vec<u8>,
}

// Offload codec. Not internally synchronized: one instance per thread, or the
// caller serializes access. The pool underneath is shared and thread-safe.
pub struct HardwareCodec {
    pool: Arc<JobPool>,
    in_flight: HashSet<JobId>,
}

impl HardwareCodec {
    pub fn new(pool: Arc<JobPool>) -> Self {
        Self {
            pool,
            in_flight: HashSet::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn compress(&self, input: &[u8], level: u32) -> Option<Vec<u8>> {
        let Some(id) = self.pool.acquire() else {
            log::warn!("hardware deflate refused compress: job pool exhausted, falling back to software codec");
            return None;
        };
        let request = JobRequest::compress(input.to_vec(), max_compressed_size(input.len()), level);
        let status = self.pool.with_job(id, |job| job.execute(request));
        let output = if status == Status::Ok {
            Some(self.pool.with_job(id, |job| job.take_output()))
        } else {
            log::warn!("hardware deflate compress failed with status {status}, falling back to software codec");
            None
        };
        self.pool.release(id);
        output
    }

    pub fn submit_decompress(&mut self, input: &[u8], uncompressed_len: usize) -> Option<JobId> {
        let Some(id) = self.pool.acquire() else {
            log::warn!("hardware deflate refused decompress: job pool exhausted, falling back to software codec");
            return None;
        };
        let request = JobRequest::decompress(input.to_vec(), uncompressed_len);
        let status = self.pool.with_job(id, |job| job.submit(request));
        if status == Status::Ok {
            self.in_flight.insert(id);
            Some(id)
        } else {
            self.pool.release(id);
            log::warn!("hardware deflate submit failed with status {status}, falling back to software codec");
            None
        }
    }

    // Polls every in-flight job to completion and frees its slot. The only
    // path that reclaims slots referenced by submitted decompressions.
    pub fn drain(&mut self) -> Vec<DrainedJob> {
        let mut drained = Vec::with_capacity(self.in_flight.len());
        while !self.in_flight.is_empty() {
            let pending: Vec<JobId> = self.in_flight.iter().copied().collect();
            let drained_before = drained.len();
            for id in pending {
                let status = self.pool.with_job(id, |job| job.poll());
                if status == Status::BeingProcessed {
                    continue;
                }
                let data = self.pool.with_job(id, |job| job.take_output());
                self.pool.release(id);
                self.in_flight.remove(&id);
                drained.push(DrainedJob { id, status, data });
            }
            if drained.len() == drained_before {
                idle_pause();
            }
        }
        drained
    }
}

// Stands in for the driver's low-power pause between polling passes; a few
// thousand spin hints is on the order of microseconds.
fn idle_pause() {
    for _ in 0..4096 {
        std::hint::spin_loop();
    }
}

impl Drop for HardwareCodec {
    fn drop(&mut self) {
        debug_assert!(
            self.in_flight.is_empty(),
            "hardware codec dropped with in-flight decompressions"
        );
        if !self.in_flight.is_empty() {
            log::warn!(
                "hardware codec dropped with {} in-flight decompressions; releasing their slots without waiting",
                self.in_flight.len()
            );
            for id in self.in_flight.drain() {
                self.pool.release(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{inflate_with, AccelEngine, AccelJob, ThreadEngine, DEFAULT_LEVEL};
    use flate2::Decompress;

    fn pool(slots: usize) -> Arc<JobPool> {
        Arc::new(JobPool::with_slots(
            Arc::new(ThreadEngine::with_workers(2)),
            slots,
        ))
    }

    fn patterned_data(len: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(len);
        for i in 0..len {
            data.push(((i as u32 * 31 + 7) % 251) as u8);
        }
        data
    }

    #[test]
    fn compress_output_inflates_with_plain_inflater() {
        let pool = pool(4);
        let codec = HardwareCodec::new(Arc::clone(&pool));
        let input = patterned_data(16 * 1024);

        let compressed = codec.compress(&input, DEFAULT_LEVEL).expect("compress should succeed");
        assert!(compressed.len() <= max_compressed_size(input.len()));
        assert_eq!(pool.held_slots(), 0);

        let mut ctx = Decompress::new(false);
        let (status, restored) = inflate_with(&mut ctx, &compressed, input.len());
        assert_eq!(status, Status::Ok);
        assert_eq!(restored, input);
    }

    #[test]
    fn batch_submit_then_drain_completes_everything() {
        let pool = pool(64);
        let mut codec = HardwareCodec::new(Arc::clone(&pool));

        let plains: Vec<Vec<u8>> = (0..32u8).map(|i| vec![i; 1024 + i as usize]).collect();
        let mut expected = std::collections::HashMap::new();
        for plain in &plains {
            let compressed = codec.compress(plain, DEFAULT_LEVEL).expect("compress should succeed");
            let id = codec
                .submit_decompress(&compressed, plain.len())
                .expect("submit should succeed");
            expected.insert(id, plain.clone());
        }
        assert_eq!(codec.in_flight(), 32);

        let drained = codec.drain();
        assert_eq!(codec.in_flight(), 0);
        assert_eq!(pool.held_slots(), 0);
        assert_eq!(drained.len(), 32);
        for finished in drained {
            assert_eq!(finished.status, Status::Ok);
            assert_eq!(&finished.data, &expected[&finished.id]);
        }
    }

    #[test]
    fn exhausted_pool_refuses_compress() {
        let pool = pool(2);
        let codec = HardwareCodec::new(Arc::clone(&pool));

        let held: Vec<JobId> = (0..2).map(|_| pool.acquire().expect("acquire should succeed")).collect();
        assert!(codec.compress(b"refused", DEFAULT_LEVEL).is_none());
        for id in held {
            pool.release(id);
        }
        assert!(codec.compress(b"accepted", DEFAULT_LEVEL).is_some());
    }

    struct SubmitFailJob;

    impl AccelJob for SubmitFailJob {
        fn execute(&mut self, _request: JobRequest) -> Status {
            Status::InvalidStream
        }

        fn submit(&mut self, _request: JobRequest) -> Status {
            Status::EngineDown
        }

        fn poll(&mut self) -> Status {
            Status::NotSubmitted
        }

        fn total_out(&self) -> usize {
            0
        }

        fn take_output(&mut self) -> Vec<u8> {
            Vec::new()
        }
    }

    struct SubmitFailEngine;

    impl AccelEngine for SubmitFailEngine {
        fn init_job(&self) -> Result<Box<dyn AccelJob>, Status> {
            Ok(Box::new(SubmitFailJob))
        }
    }

    #[test]
    fn submit_failure_releases_the_slot() {
        let pool = Arc::new(JobPool::with_slots(Arc::new(SubmitFailEngine), 4));
        let mut codec = HardwareCodec::new(Arc::clone(&pool));

        assert!(codec.submit_decompress(b"\x03\x00", 0).is_none());
        assert_eq!(codec.in_flight(), 0);
        assert_eq!(pool.held_slots(), 0);
    }
}
