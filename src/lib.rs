use std::sync::Arc;

use flate2::{Compress, Compression, Decompress};
use thiserror::Error;

mod engine;
mod hw;
mod pool;

pub use engine::{
    AccelEngine, AccelJob, JobKind, JobRequest, Status, ThreadEngine, DEFAULT_LEVEL,
    FLAG_DYNAMIC_HUFFMAN, FLAG_FIRST, FLAG_LAST, FLAG_OMIT_VERIFY,
};
pub use hw::{DrainedJob, HardwareCodec};
pub use pool::{JobId, JobPool, DEFAULT_SLOT_COUNT};

pub const CODEC_NAME: &str = "DEFLATE_ACCEL";

// One octet identifying this codec in a compressed block header. The payload
// itself is standard raw DEFLATE.
pub const CODEC_METHOD_BYTE: u8 = 0x96;

// Classic zlib worst-case inflation bound; callers size destination buffers
// with this.
pub fn max_compressed_size(uncompressed_size: usize) -> usize {
    uncompressed_size
        + (uncompressed_size >> 12)
        + (uncompressed_size >> 14)
        + (uncompressed_size >> 25)
        + 13
}

#[derive(Debug, Error)]
pub enum AccelDeflateError {
    #[error("cannot compress: {0}")]
    CannotCompress(Status),
    #[error("cannot decompress: {0}")]
    CannotDecompress(Status),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecMode {
    #[default]
    Synchronous,
    Asynchronous,
    SoftwareFallback,
}

#[derive(Debug)]
pub enum Decompression {
    Completed(Vec<u8>),
    InFlight(JobId),
}

struct SwJob {
    deflate: Compress,
    inflate: Decompress,
}

// Inline fallback path. Failures surface as typed errors; nothing falls back
// behind this codec.
pub struct SoftwareCodec {
    job: Option<SwJob>,
    level: u32,
}

impl SoftwareCodec {
    pub fn new() -> Self {
        Self::with_level(DEFAULT_LEVEL)
    }

    pub fn with_level(level: u32) -> Self {
        Self { job: None, level }
    }

    fn job(&mut self) -> &mut SwJob {
        let level = self.level;
        self.job.get_or_insert_with(|| SwJob {
            deflate: Compress::new(Compression::new(level.min(9)), false),
            inflate: Decompress::new(false),
        })
    }

    fn set_level(&mut self, level: u32) {
        self.level = level;
        self.job = None;
    }

    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, AccelDeflateError> {
        let capacity = max_compressed_size(input.len());
        let job = self.job();
        job.deflate.reset();
        let (status, output) = engine::deflate_with(&mut job.deflate, input, capacity);
        match status {
            Status::Ok => Ok(output),
            other => Err(AccelDeflateError::CannotCompress(other)),
        }
    }

    pub fn decompress(
        &mut self,
        input: &[u8],
        uncompressed_len: usize,
    ) -> Result<Vec<u8>, AccelDeflateError> {
        let job = self.job();
        job.inflate.reset(false);
        let (status, output) = engine::inflate_with(&mut job.inflate, input, uncompressed_len);
        match status {
            Status::Ok => Ok(output),
            other => Err(AccelDeflateError::CannotDecompress(other)),
        }
    }
}

impl Default for SoftwareCodec {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DeflateCodec {
    pool: Arc<JobPool>,
    hw: HardwareCodec,
    sw: SoftwareCodec,
    mode: CodecMode,
    level: u32,
    backlog: Vec<DrainedJob>,
}

impl DeflateCodec {
    pub fn new() -> Self {
        Self::with_pool(JobPool::global())
    }

    pub fn with_level(level: u32) -> Self {
        Self::with_pool_and_level(JobPool::global(), level)
    }

    pub fn with_pool(pool: Arc<JobPool>) -> Self {
        Self::with_pool_and_level(pool, DEFAULT_LEVEL)
    }

    pub fn with_pool_and_level(pool: Arc<JobPool>, level: u32) -> Self {
        Self {
            hw: HardwareCodec::new(Arc::clone(&pool)),
            sw: SoftwareCodec::with_level(level),
            pool,
            mode: CodecMode::Synchronous,
            level,
            backlog: Vec::new(),
        }
    }

    pub fn method_byte(&self) -> u8 {
        CODEC_METHOD_BYTE
    }

    pub fn mode(&self) -> CodecMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: CodecMode) {
        self.mode = mode;
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn set_level(&mut self, level: u32) {
        self.level = level;
        self.sw.set_level(level);
    }

    pub fn in_flight(&self) -> usize {
        self.hw.in_flight()
    }

    // Hardware if the pool came up, software when hardware quietly refuses.
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, AccelDeflateError> {
        if self.pool.is_ready() {
            if let Some(output) = self.hw.compress(input, self.level) {
                return Ok(output);
            }
        }
        self.sw.compress(input)
    }

    pub fn decompress(
        &mut self,
        input: &[u8],
        uncompressed_len: usize,
    ) -> Result<Decompression, AccelDeflateError> {
        match self.mode {
            CodecMode::Synchronous => {
                if self.pool.is_ready() {
                    if let Some(id) = self.hw.submit_decompress(input, uncompressed_len) {
                        let mut own = None;
                        for finished in self.hw.drain() {
                            if finished.id == id {
                                own = Some(finished);
                            } else {
                                self.backlog.push(finished);
                            }
                        }
                        match own {
                            Some(finished) if finished.status == Status::Ok => {
                                return Ok(Decompression::Completed(finished.data));
                            }
                            Some(finished) => {
                                log::warn!(
                                    "hardware deflate decompress finished with status {}, falling back to software codec",
                                    finished.status
                                );
                            }
                            None => {}
                        }
                    }
                }
                self.sw
                    .decompress(input, uncompressed_len)
                    .map(Decompression::Completed)
            }
            CodecMode::Asynchronous => {
                if self.pool.is_ready() {
                    if let Some(id) = self.hw.submit_decompress(input, uncompressed_len) {
                        return Ok(Decompression::InFlight(id));
                    }
                }
                // A software result is already final when handed back, even
                // inside an asynchronous batch.
                self.sw
                    .decompress(input, uncompressed_len)
                    .map(Decompression::Completed)
            }
            CodecMode::SoftwareFallback => self
                .sw
                .decompress(input, uncompressed_len)
                .map(Decompression::Completed),
        }
    }

    // Checkpoint: completes every outstanding decompression and hands back
    // their outputs, then behaves synchronously until the owner opts back in.
    pub fn drain(&mut self) -> Vec<DrainedJob> {
        let mut drained = std::mem::take(&mut self.backlog);
        if self.pool.is_ready() {
            drained.extend(self.hw.drain());
        }
        self.mode = CodecMode::Synchronous;
        drained
    }
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self::new()
    }
}
