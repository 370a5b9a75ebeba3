///
/// Fixed-size worker pool with a single FIFO work queue.
///
/// Work items are closures executed exactly once by some worker. A
/// `submit` followed by a `wait` forms a synchronization window: all
/// writes performed by the submitted items are visible to the caller
/// once `wait` returns. Items that borrow stack-local data go through
/// [`ThreadPool::scope`], which guarantees they have finished before
/// the borrowed data goes out of scope.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use anyhow::Context;

/// Fallback thread count for a thread pool when the number of
/// threads cannot be determined
const DEFAULT_THREAD_COUNT: usize = 2;

type Job = Box<dyn FnOnce(usize) + Send + 'static>;

struct QueueState {
    pending: VecDeque<Job>,
    /// Number of items currently being executed by workers
    in_flight: usize,
    /// Number of items that finished since the last `wait`
    done_count: usize,
    /// Number of finished items required before the next synchronization
    done_target: usize,
    should_stop: bool,
}

impl QueueState {
    /// True while a `wait` call still has to block
    fn waiting_condition(&self) -> bool {
        (self.in_flight > 0 || !self.pending.is_empty())
            && (self.done_target == 0 || self.done_count < self.done_target)
    }
}

struct WorkQueue {
    state: Mutex<QueueState>,
    avail_cond: Condvar,
    done_cond: Condvar,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_flight: 0,
                done_count: 0,
                done_target: 0,
                should_stop: false,
            }),
            avail_cond: Condvar::new(),
            done_cond: Condvar::new(),
        }
    }

    // Workers abort the process on panic, so a poisoned lock can only be
    // observed while the process is already going down.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn worker_loop(queue: &WorkQueue, thread_id: usize) {
    let mut state = queue.lock();
    loop {
        while state.pending.is_empty() {
            if state.should_stop {
                return;
            }
            state = queue
                .avail_cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let job = state.pending.pop_front().unwrap();
        state.in_flight += 1;
        drop(state);

        // Work items must not panic: a panicking item would leave waiters
        // blocked forever, so treat it as fatal.
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job(thread_id))).is_err() {
            log::error!("work item panicked on worker {thread_id}");
            std::process::abort();
        }

        state = queue.lock();
        state.in_flight -= 1;
        state.done_count += 1;
        if !state.waiting_condition() {
            queue.done_cond.notify_one();
        }
    }
}

/// This function tries to detect the number of threads available on the
/// system, honouring the `NPROC` environment variable when set.
/// It always returns a value greater than 0, even if detection fails.
pub fn detect_system_thread_count() -> usize {
    if let Ok(nproc) = std::env::var("NPROC") {
        if let Ok(count) = nproc.trim().parse::<usize>() {
            if count > 0 {
                return count;
            }
        }
    }
    let count = num_cpus::get();
    if count > 0 {
        count
    } else {
        DEFAULT_THREAD_COUNT
    }
}

pub struct ThreadPool {
    queue: Arc<WorkQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Creates a new thread pool with an empty queue and exactly
    /// `thread_count` workers. If a worker fails to spawn, the workers
    /// spawned so far are terminated before the error is returned.
    pub fn new(thread_count: usize) -> anyhow::Result<ThreadPool> {
        assert!(thread_count > 0);
        let queue = Arc::new(WorkQueue::new());
        let mut pool = ThreadPool {
            queue,
            workers: Vec::with_capacity(thread_count),
        };
        for thread_id in 0..thread_count {
            let queue = Arc::clone(&pool.queue);
            let handle = std::thread::Builder::new()
                .name(format!("rt-accel-worker-{thread_id}"))
                .spawn(move || worker_loop(&queue, thread_id))
                .with_context(|| format!("failed to spawn worker thread {thread_id}"))?;
            // On error, dropping `pool` joins the workers spawned so far
            pool.workers.push(handle);
        }
        Ok(pool)
    }

    /// Returns the number of worker threads contained in the pool
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues a single work item that does not borrow local state
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce(usize) + Send + 'static,
    {
        self.push_jobs(std::iter::once(Box::new(job) as Job));
    }

    /// Waits until `target` enqueued work items have finished, or all of
    /// them if `target == 0`. Returns the number of items that completed
    /// since the previous `wait`, and resets that counter.
    ///
    /// Must not be called from a worker thread.
    pub fn wait(&self, target: usize) -> usize {
        let mut state = self.queue.lock();
        state.done_target = target;
        while state.waiting_condition() {
            state = self
                .queue
                .done_cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let done = state.done_count;
        state.done_count = 0;
        state.done_target = 0;
        done
    }

    /// Runs `f` with a [`Scope`] whose work items may borrow anything that
    /// outlives the call. Every item submitted through the scope is
    /// guaranteed to have finished when `scope` returns.
    pub fn scope<'pool, 'scope, F, R>(&'pool self, f: F) -> R
    where
        F: FnOnce(&Scope<'pool, 'scope>) -> R,
    {
        let scope = Scope {
            pool: self,
            _marker: std::marker::PhantomData,
        };
        // Drain the queue even if `f` unwinds, so that no borrowed task
        // outlives its data
        struct Guard<'a>(&'a ThreadPool);
        impl Drop for Guard<'_> {
            fn drop(&mut self) {
                self.0.wait(0);
            }
        }
        let guard = Guard(self);
        let result = f(&scope);
        drop(guard);
        result
    }

    fn push_jobs(&self, jobs: impl Iterator<Item = Job>) {
        let mut state = self.queue.lock();
        let before = state.pending.len();
        state.pending.extend(jobs);
        let count = state.pending.len() - before;
        drop(state);
        if count == 1 {
            self.queue.avail_cond.notify_one();
        } else if count > 1 {
            self.queue.avail_cond.notify_all();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.queue.lock();
            state.should_stop = true;
        }
        self.queue.avail_cond.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Handle for submitting work items that borrow data owned by the
/// caller of [`ThreadPool::scope`]
pub struct Scope<'pool, 'scope> {
    pool: &'pool ThreadPool,
    // Invariant over 'scope, as in `std::thread::scope`
    _marker: std::marker::PhantomData<&'scope mut &'scope ()>,
}

impl<'pool, 'scope> Scope<'pool, 'scope> {
    /// Enqueues a work item. The item runs exactly once on some worker,
    /// receiving the worker's thread id.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce(usize) + Send + 'scope,
    {
        self.submit_batch(std::iter::once(job));
    }

    /// Enqueues several work items in order under a single lock
    /// acquisition, waking all workers
    pub fn submit_batch<F, I>(&self, jobs: I)
    where
        F: FnOnce(usize) + Send + 'scope,
        I: IntoIterator<Item = F>,
    {
        self.pool.push_jobs(jobs.into_iter().map(|job| {
            let job: Box<dyn FnOnce(usize) + Send + 'scope> = Box::new(job);
            // Safety: the scope (and, failing that, its guard) waits for
            // all submitted items before 'scope ends, so the closure never
            // outlives its borrows even though the queue stores it as
            // 'static.
            unsafe {
                std::mem::transmute::<
                    Box<dyn FnOnce(usize) + Send + 'scope>,
                    Box<dyn FnOnce(usize) + Send + 'static>,
                >(job)
            }
        }));
    }

    /// See [`ThreadPool::wait`]
    pub fn wait(&self, target: usize) -> usize {
        self.pool.wait(target)
    }
}
