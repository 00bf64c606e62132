use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use rand::Rng;

use crate::engine::{AccelEngine, AccelJob, ThreadEngine};

pub const DEFAULT_SLOT_COUNT: usize = 1024;

// External slot handle, encoded as `slot_count - index` so it is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Slot {
    job: UnsafeCell<Box<dyn AccelJob>>,
    lock: AtomicBool,
}

// The per-slot lock is the sole grant of access to `job`; no thread touches a
// slot it does not hold.
unsafe impl Sync for Slot {}

pub struct JobPool {
    slots: Box<[Slot]>,
    ready: bool,
    // Keeps the driver (and any worker threads it owns) alive as long as the
    // slots that reference it.
    _engine: Arc<dyn AccelEngine>,
}

impl JobPool {
    pub fn new(engine: Arc<dyn AccelEngine>) -> Self {
        Self::with_slots(engine, DEFAULT_SLOT_COUNT)
    }

    pub fn with_slots(engine: Arc<dyn AccelEngine>, slot_count: usize) -> Self {
        assert!(
            u32::try_from(slot_count).is_ok(),
            "slot count must fit in a u32"
        );
        let mut slots = Vec::with_capacity(slot_count);
        for index in 0..slot_count {
            match engine.init_job() {
                Ok(job) => slots.push(Slot {
                    job: UnsafeCell::new(job),
                    lock: AtomicBool::new(false),
                }),
                Err(status) => {
                    log::warn!(
                        "accelerator job pool initialization failed at slot {index} with status {status}; \
                         all work falls back to the software codec"
                    );
                    return Self {
                        slots: slots.into_boxed_slice(),
                        ready: false,
                        _engine: engine,
                    };
                }
            }
        }
        log::debug!("accelerator job pool ready with {slot_count} slots");
        Self {
            slots: slots.into_boxed_slice(),
            ready: true,
            _engine: engine,
        }
    }

    // Process-wide pool, built lazily over the bundled thread engine.
    pub fn global() -> Arc<JobPool> {
        static POOL: OnceLock<Arc<JobPool>> = OnceLock::new();
        Arc::clone(POOL.get_or_init(|| Arc::new(JobPool::new(Arc::new(ThreadEngine::new())))))
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn held_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock.load(Ordering::Relaxed))
            .count()
    }

    // Uniform random probing; gives up after slot_count failed CAS attempts
    // and the caller falls back to software.
    pub fn acquire(&self) -> Option<JobId> {
        if !self.ready || self.slots.is_empty() {
            return None;
        }
        let count = self.slots.len();
        let mut rng = rand::thread_rng();
        for _ in 0..=count {
            let index = rng.gen_range(0..count);
            if self.slots[index]
                .lock
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(JobId((count - index) as u32));
            }
        }
        None
    }

    pub fn release(&self, id: JobId) {
        let index = self.index_of(id);
        self.slots[index].lock.store(false, Ordering::Release);
    }

    // Caller must hold the slot lock for `id`.
    pub(crate) fn with_job<R>(&self, id: JobId, f: impl FnOnce(&mut dyn AccelJob) -> R) -> R {
        let index = self.index_of(id);
        let slot = &self.slots[index];
        debug_assert!(
            slot.lock.load(Ordering::Relaxed),
            "slot accessed without holding its lock"
        );
        let job = unsafe { &mut *slot.job.get() };
        f(job.as_mut())
    }

    fn index_of(&self, id: JobId) -> usize {
        let index = self.slots.len() - id.0 as usize;
        debug_assert!(index < self.slots.len());
        index
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            while slot
                .lock
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                std::hint::spin_loop();
            }
            unsafe { (*slot.job.get()).finalize() };
            slot.lock.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{JobRequest, Status};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::thread;

    struct NullJob {
        finalized: Option<Arc<AtomicUsize>>,
    }

    impl AccelJob for NullJob {
        fn execute(&mut self, _request: JobRequest) -> Status {
            Status::InvalidStream
        }

        fn submit(&mut self, _request: JobRequest) -> Status {
            Status::InvalidStream
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

        fn finalize(&mut self) {
            if let Some(counter) = &self.finalized {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct NullEngine {
        finalized: Option<Arc<AtomicUsize>>,
    }

    impl NullEngine {
        fn plain() -> Self {
            Self { finalized: None }
        }
    }

    impl AccelEngine for NullEngine {
        fn init_job(&self) -> Result<Box<dyn AccelJob>, Status> {
            Ok(Box::new(NullJob {
                finalized: self.finalized.clone(),
            }))
        }
    }

    struct FailingEngine;

    impl AccelEngine for FailingEngine {
        fn init_job(&self) -> Result<Box<dyn AccelJob>, Status> {
            Err(Status::InitFailed)
        }
    }

    struct FlakyEngine {
        remaining: AtomicUsize,
    }

    impl AccelEngine for FlakyEngine {
        fn init_job(&self) -> Result<Box<dyn AccelJob>, Status> {
            if self.remaining.load(Ordering::SeqCst) == 0 {
                return Err(Status::InitFailed);
            }
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            Ok(Box::new(NullJob { finalized: None }))
        }
    }

    #[test]
    fn acquire_assigns_each_slot_once() {
        let pool = JobPool::with_slots(Arc::new(NullEngine::plain()), 8);
        assert!(pool.is_ready());

        let mut ids = HashSet::new();
        for _ in 0..8 {
            let id = pool.acquire().expect("acquire should succeed");
            assert!(ids.insert(id), "pool handed out a held slot");
        }
        assert_eq!(pool.held_slots(), 8);
        assert!(pool.acquire().is_none(), "exhausted pool must refuse");

        for id in ids {
            pool.release(id);
        }
        assert_eq!(pool.held_slots(), 0);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn init_failure_marks_pool_unready() {
        let pool = JobPool::with_slots(Arc::new(FailingEngine), 8);
        assert!(!pool.is_ready());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn partial_init_failure_marks_pool_unready() {
        let engine = FlakyEngine {
            remaining: AtomicUsize::new(3),
        };
        let pool = JobPool::with_slots(Arc::new(engine), 8);
        assert!(!pool.is_ready());
        assert_eq!(pool.slot_count(), 3);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn concurrent_acquire_never_shares_a_slot() {
        let pool = Arc::new(JobPool::with_slots(Arc::new(NullEngine::plain()), 4));
        let held = Arc::new(Mutex::new(HashSet::new()));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let held = Arc::clone(&held);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let Some(id) = pool.acquire() else {
                            thread::yield_now();
                            continue;
                        };
                        {
                            let mut held = held.lock().expect("lock should not be poisoned");
                            assert!(held.insert(id), "two threads hold slot {id}");
                        }
                        thread::yield_now();
                        {
                            let mut held = held.lock().expect("lock should not be poisoned");
                            held.remove(&id);
                        }
                        pool.release(id);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker should not panic");
        }
        assert_eq!(pool.held_slots(), 0);
    }

    #[test]
    fn teardown_finalizes_every_slot() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let engine = NullEngine {
            finalized: Some(Arc::clone(&finalized)),
        };
        let pool = JobPool::with_slots(Arc::new(engine), 16);
        drop(pool);
        assert_eq!(finalized.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn global_pool_is_shared_and_ready() {
        let first = JobPool::global();
        let second = JobPool::global();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_ready());
        assert_eq!(first.slot_count(), DEFAULT_SLOT_COUNT);
    }
}
