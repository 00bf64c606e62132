use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

pub const FLAG_FIRST: u32 = 1 << 0;
pub const FLAG_LAST: u32 = 1 << 1;
pub const FLAG_DYNAMIC_HUFFMAN: u32 = 1 << 2;
pub const FLAG_OMIT_VERIFY: u32 = 1 << 3;

pub const DEFAULT_LEVEL: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Compress,
    Decompress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BeingProcessed,
    InvalidStream,
    OutputOverflow,
    NotSubmitted,
    EngineDown,
    InitFailed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "ok",
            Status::BeingProcessed => "being processed",
            Status::InvalidStream => "invalid deflate stream",
            Status::OutputOverflow => "output overflow",
            Status::NotSubmitted => "not submitted",
            Status::EngineDown => "engine down",
            Status::InitFailed => "init failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    pub input: Vec<u8>,
    pub output_capacity: usize,
    pub flags: u32,
    pub level: u32,
}

impl JobRequest {
    pub fn compress(input: Vec<u8>, output_capacity: usize, level: u32) -> Self {
        Self {
            kind: JobKind::Compress,
            input,
            output_capacity,
            flags: FLAG_FIRST | FLAG_LAST | FLAG_DYNAMIC_HUFFMAN | FLAG_OMIT_VERIFY,
            level,
        }
    }

    pub fn decompress(input: Vec<u8>, output_capacity: usize) -> Self {
        Self {
            kind: JobKind::Decompress,
            input,
            output_capacity,
            flags: FLAG_FIRST | FLAG_LAST,
            level: DEFAULT_LEVEL,
        }
    }
}

pub trait AccelJob: Send {
    fn execute(&mut self, request: JobRequest) -> Status;
    fn submit(&mut self, request: JobRequest) -> Status;
    fn poll(&mut self) -> Status;
    fn total_out(&self) -> usize;
    fn take_output(&mut self) -> Vec<u8>;
    fn finalize(&mut self) {}
}

pub trait AccelEngine: Send + Sync {
    fn init_job(&self) -> Result<Box<dyn AccelJob>, Status>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Whole-buffer raw deflate (RFC 1951, no zlib wrapper). Output never grows
// past the spare capacity reserved up front.
pub(crate) fn deflate_with(ctx: &mut Compress, input: &[u8], capacity: usize) -> (Status, Vec<u8>) {
    let mut out = Vec::with_capacity(capacity);
    loop {
        let before_in = ctx.total_in();
        let before_out = out.len();
        match ctx.compress_vec(&input[before_in as usize..], &mut out, FlushCompress::Finish) {
            Ok(flate2::Status::StreamEnd) => return (Status::Ok, out),
            Ok(_) => {
                if ctx.total_in() == before_in && out.len() == before_out {
                    let status = if out.len() >= capacity {
                        Status::OutputOverflow
                    } else {
                        Status::InvalidStream
                    };
                    return (status, out);
                }
            }
            Err(_) => return (Status::InvalidStream, out),
        }
    }
}

pub(crate) fn inflate_with(ctx: &mut Decompress, input: &[u8], capacity: usize) -> (Status, Vec<u8>) {
    // One spare byte so a zero-length stream can still reach StreamEnd.
    let mut out = Vec::with_capacity(capacity.max(1));
    loop {
        let before_in = ctx.total_in();
        let before_out = out.len();
        match ctx.decompress_vec(&input[before_in as usize..], &mut out, FlushDecompress::Finish) {
            Ok(flate2::Status::StreamEnd) => return (Status::Ok, out),
            Ok(_) => {
                if ctx.total_in() == before_in && out.len() == before_out {
                    let status = if out.len() >= capacity {
                        Status::OutputOverflow
                    } else {
                        Status::InvalidStream
                    };
                    return (status, out);
                }
            }
            Err(_) => return (Status::InvalidStream, out),
        }
    }
}

const JOB_IDLE: u8 = 0;
const JOB_QUEUED: u8 = 1;
const JOB_RUNNING: u8 = 2;
const JOB_DONE: u8 = 3;

struct JobResult {
    status: Status,
    output: Vec<u8>,
}

struct JobCell {
    phase: AtomicU8,
    result: Mutex<Option<JobResult>>,
    done: Condvar,
}

impl JobCell {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(JOB_IDLE),
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn begin(&self) {
        *lock(&self.result) = None;
        self.phase.store(JOB_QUEUED, Ordering::Release);
    }

    fn complete(&self, result: JobResult) {
        *lock(&self.result) = Some(result);
        self.phase.store(JOB_DONE, Ordering::Release);
        self.done.notify_all();
    }

    fn wait_done(&self) -> Status {
        let mut guard = lock(&self.result);
        loop {
            match guard.as_ref() {
                Some(result) => return result.status,
                None => {
                    guard = self
                        .done
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn status(&self) -> Status {
        match lock(&self.result).as_ref() {
            Some(result) => result.status,
            None => Status::NotSubmitted,
        }
    }

    fn total_out(&self) -> usize {
        match lock(&self.result).as_ref() {
            Some(result) => result.output.len(),
            None => 0,
        }
    }

    fn take_output(&self) -> Vec<u8> {
        match lock(&self.result).as_mut() {
            Some(result) => std::mem::take(&mut result.output),
            None => Vec::new(),
        }
    }
}

struct QueuedJob {
    request: JobRequest,
    cell: Arc<JobCell>,
}

struct EngineShared {
    queue: Mutex<VecDeque<QueuedJob>>,
    wake: Condvar,
    shutdown: AtomicBool,
}

// Bundled accelerator backend: a fixed set of worker threads draining a
// shared queue. Real hardware binds by providing another AccelEngine.
pub struct ThreadEngine {
    shared: Arc<EngineShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadEngine {
    pub fn new() -> Self {
        Self::with_workers(num_cpus::get().max(1))
    }

    pub fn with_workers(worker_count: usize) -> Self {
        let shared = Arc::new(EngineShared {
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..worker_count.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_loop(shared))
            })
            .collect();
        Self { shared, workers }
    }
}

impl Default for ThreadEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AccelEngine for ThreadEngine {
    fn init_job(&self) -> Result<Box<dyn AccelJob>, Status> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(Status::EngineDown);
        }
        Ok(Box::new(ThreadJob {
            shared: Arc::clone(&self.shared),
            cell: Arc::new(JobCell::new()),
        }))
    }
}

impl Drop for ThreadEngine {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        // Notify under the queue lock so a worker between its shutdown check
        // and its wait cannot miss the wakeup.
        let guard = lock(&self.shared.queue);
        self.shared.wake.notify_all();
        drop(guard);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<EngineShared>) {
    loop {
        let job = {
            let mut queue = lock(&shared.queue);
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                queue = shared.wake.wait(queue).unwrap_or_else(PoisonError::into_inner);
            }
        };
        job.cell.phase.store(JOB_RUNNING, Ordering::Release);
        let result = run_request(&job.request);
        job.cell.complete(result);
    }
}

fn run_request(request: &JobRequest) -> JobResult {
    let (status, output) = match request.kind {
        JobKind::Compress => {
            let mut ctx = Compress::new(Compression::new(request.level.min(9)), false);
            deflate_with(&mut ctx, &request.input, request.output_capacity)
        }
        JobKind::Decompress => {
            let mut ctx = Decompress::new(false);
            inflate_with(&mut ctx, &request.input, request.output_capacity)
        }
    };
    JobResult { status, output }
}

struct ThreadJob {
    shared: Arc<EngineShared>,
    cell: Arc<JobCell>,
}

impl AccelJob for ThreadJob {
    fn execute(&mut self, request: JobRequest) -> Status {
        match self.submit(request) {
            Status::Ok => self.cell.wait_done(),
            other => other,
        }
    }

    fn submit(&mut self, request: JobRequest) -> Status {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Status::EngineDown;
        }
        self.cell.begin();
        let mut queue = lock(&self.shared.queue);
        queue.push_back(QueuedJob {
            request,
            cell: Arc::clone(&self.cell),
        });
        self.shared.wake.notify_one();
        Status::Ok
    }

    fn poll(&mut self) -> Status {
        match self.cell.phase.load(Ordering::Acquire) {
            JOB_QUEUED | JOB_RUNNING => Status::BeingProcessed,
            JOB_DONE => self.cell.status(),
            _ => Status::NotSubmitted,
        }
    }

    fn total_out(&self) -> usize {
        self.cell.total_out()
    }

    fn take_output(&mut self) -> Vec<u8> {
        self.cell.take_output()
    }
}
