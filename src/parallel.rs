///
/// Data-parallel driver over 1-D/2-D/3-D index ranges.
///
/// A range is cut into `2 x worker_count` tiles per dimension and the
/// tiles are executed by the pool in whatever order workers pick them
/// up. When a multi-dimensional range produces more tiles than that,
/// the driver keeps at most `2 x worker_count` of them outstanding,
/// waiting for `worker_count` completions before enqueueing more, so
/// task memory stays bounded for arbitrarily large ranges.

use std::marker::PhantomData;
use std::ops::Range;

use crate::thread_pool::ThreadPool;

/// Tasks per worker used by the tiling of `parallel_for` and `reduce`
const TILES_PER_THREAD: usize = 2;

/// Tasks per worker for chunked phases whose output is skewed across
/// the array (merge counting, collapse counting, rewriting). More tasks
/// than workers keeps the load balanced; this is a tunable.
pub const CHUNK_TASKS_PER_THREAD: usize = 4;

pub fn compute_chunk_size(elem_count: usize, chunk_count: usize) -> usize {
    elem_count / chunk_count + usize::from(elem_count % chunk_count != 0)
}

pub fn compute_chunk_begin(chunk_size: usize, chunk_index: usize, count: usize) -> usize {
    usize::min(chunk_size * chunk_index, count)
}

pub fn compute_chunk_end(chunk_size: usize, chunk_index: usize, count: usize) -> usize {
    usize::min(chunk_size * (chunk_index + 1), count)
}

fn run_tiles<const N: usize, F>(pool: &ThreadPool, ranges: [Range<usize>; N], body: F)
where
    F: Fn([Range<usize>; N], usize) + Sync,
{
    if ranges.iter().any(|range| range.is_empty()) {
        return;
    }
    let thread_count = pool.thread_count();
    let task_count = thread_count * TILES_PER_THREAD;
    let mut chunk_size = [0usize; N];
    for d in 0..N {
        chunk_size[d] = compute_chunk_size(ranges[d].end - ranges[d].start, task_count);
    }

    pool.scope(|scope| {
        let body = &body;
        let mut starts: [usize; N] = std::array::from_fn(|d| ranges[d].start);
        let mut outstanding = 0;
        'tiles: loop {
            let tile: [Range<usize>; N] = std::array::from_fn(|d| {
                starts[d]..usize::min(starts[d] + chunk_size[d], ranges[d].end)
            });
            if outstanding == task_count {
                outstanding -= scope.wait(thread_count);
            }
            scope.submit(move |thread_id| body(tile, thread_id));
            outstanding += 1;

            // Advance to the next tile in lexicographic order,
            // innermost dimension first
            let mut d = 0;
            loop {
                starts[d] += chunk_size[d];
                if starts[d] < ranges[d].end {
                    break;
                }
                if d + 1 == N {
                    break 'tiles;
                }
                starts[d] = ranges[d].start;
                d += 1;
            }
        }
        scope.wait(0);
    });
}

/// Runs `body` over every sub-range of a 1-D partition of `range`,
/// in parallel on the given thread pool
pub fn parallel_for<F>(pool: &ThreadPool, range: Range<usize>, body: F)
where
    F: Fn(Range<usize>, usize) + Sync,
{
    run_tiles(pool, [range], |[range], thread_id| body(range, thread_id));
}

/// Same, but in 2D
pub fn parallel_for_2d<F>(pool: &ThreadPool, ranges: [Range<usize>; 2], body: F)
where
    F: Fn([Range<usize>; 2], usize) + Sync,
{
    run_tiles(pool, ranges, body);
}

/// Same, but in 3D
pub fn parallel_for_3d<F>(pool: &ThreadPool, ranges: [Range<usize>; 3], body: F)
where
    F: Fn([Range<usize>; 3], usize) + Sync,
{
    run_tiles(pool, ranges, body);
}

/// Parallel reduction over a contiguous 1-D index range. Every task
/// folds its sub-range into a clone of `init` with `body`; the per-task
/// accumulators are then merged sequentially, left to right, on the
/// calling thread.
pub fn reduce<T, F, M>(pool: &ThreadPool, range: Range<usize>, init: T, body: F, mut merge: M) -> T
where
    T: Clone + Send,
    F: Fn(&mut T, Range<usize>, usize) + Sync,
    M: FnMut(T, T) -> T,
{
    if range.is_empty() {
        return init;
    }
    let task_count = pool.thread_count() * TILES_PER_THREAD;
    let chunk_size = compute_chunk_size(range.end - range.start, task_count);
    let tile_count = compute_chunk_size(range.end - range.start, chunk_size);
    let mut accumulators = vec![init.clone(); tile_count];
    pool.scope(|scope| {
        let body = &body;
        for (k, accumulator) in accumulators.iter_mut().enumerate() {
            let len = range.end - range.start;
            let begin = range.start + compute_chunk_begin(chunk_size, k, len);
            let end = range.start + compute_chunk_end(chunk_size, k, len);
            scope.submit(move |thread_id| body(accumulator, begin..end, thread_id));
        }
        scope.wait(0);
    });
    accumulators.into_iter().fold(init, &mut merge)
}

/// Shared view of a mutable slice for parallel phases that write
/// disjoint elements.
///
/// The driver's tiling guarantees that no element is touched by more
/// than one task, which is what makes the unchecked shared mutation
/// sound; every use site states which partition provides that
/// guarantee.
pub(crate) struct UnsafeSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<T: Send> Send for UnsafeSlice<'_, T> {}
unsafe impl<T: Send> Sync for UnsafeSlice<'_, T> {}

impl<'a, T> UnsafeSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Safety: no other task may access element `index` during the
    /// current submit/wait window.
    #[inline(always)]
    pub unsafe fn write(&self, index: usize, value: T) {
        debug_assert!(index < self.len);
        unsafe { self.ptr.add(index).write(value) }
    }

    /// Safety: no other task may write element `index` during the
    /// current submit/wait window.
    #[inline(always)]
    pub unsafe fn read(&self, index: usize) -> T
    where
        T: Copy,
    {
        debug_assert!(index < self.len);
        unsafe { self.ptr.add(index).read() }
    }
}
