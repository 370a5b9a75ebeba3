///
/// Parallel least-significant-digit radix sort of (key, value) pairs.
///
/// Each pass sorts one 8-bit digit of the key, in three phases driven
/// by the thread pool: per-task histograms over the data, a parallel
/// prefix sum across the per-task bin tables, and a stable parallel
/// scatter into the destination buffers. Buffers are ping-ponged
/// between passes; the sorted data always ends up back in the primary
/// buffers.

use crate::parallel::{compute_chunk_begin, compute_chunk_end, compute_chunk_size, UnsafeSlice};
use crate::thread_pool::ThreadPool;

const RADIX_SORT_BITS: usize = 8;
const BIN_COUNT: usize = 1 << RADIX_SORT_BITS;

/// Sort key made of 8-bit digits, least significant digit first.
/// The shape follows the `rdst` crate's key trait.
pub trait RadixKey: Copy + Send + Sync {
    /// Number of 8-bit digits in the key
    const LEVELS: usize;

    fn get_level(&self, level: usize) -> u8;
}

macro_rules! impl_radix_key {
    ($t:ty) => {
        impl RadixKey for $t {
            const LEVELS: usize = std::mem::size_of::<$t>();

            #[inline(always)]
            fn get_level(&self, level: usize) -> u8 {
                (*self >> (level * 8)) as u8
            }
        }
    };
}

impl_radix_key!(u8);
impl_radix_key!(u16);
impl_radix_key!(u32);
impl_radix_key!(u64);

/// Performs a stable radix sort over the given (key, value) pairs.
/// The scratch buffers must have the same length as the primary
/// buffers; on return the sorted pairs are in `keys`/`values` and the
/// scratch buffers hold unspecified data.
pub fn radix_sort_pairs<K: RadixKey>(
    pool: &ThreadPool,
    keys: &mut Vec<K>,
    values: &mut Vec<usize>,
    keys_scratch: &mut Vec<K>,
    values_scratch: &mut Vec<usize>,
) {
    let count = keys.len();
    assert_eq!(values.len(), count);
    assert_eq!(keys_scratch.len(), count);
    assert_eq!(values_scratch.len(), count);
    if count == 0 {
        return;
    }

    let task_count = pool.thread_count();
    let data_chunk_size = compute_chunk_size(count, task_count);
    let bin_chunk_size = compute_chunk_size(BIN_COUNT, task_count);

    // One 256-entry bin table per task, reused across passes
    let mut bins = vec![0usize; task_count * BIN_COUNT];
    let mut shared_bins = vec![0usize; BIN_COUNT];

    for level in 0..K::LEVELS {
        // Histogram the digit of every key into per-task bin tables
        {
            let keys: &[K] = keys;
            pool.scope(|scope| {
                for (j, bin_table) in bins.chunks_mut(BIN_COUNT).enumerate() {
                    let begin = compute_chunk_begin(data_chunk_size, j, count);
                    let end = compute_chunk_end(data_chunk_size, j, count);
                    scope.submit(move |_| {
                        bin_table.fill(0);
                        for key in &keys[begin..end] {
                            bin_table[key.get_level(level) as usize] += 1;
                        }
                    });
                }
                scope.wait(0);
            });
        }

        // For every bin, turn the per-task counts into a prefix sum over
        // tasks, and record the bin total
        {
            let bins_view = UnsafeSlice::new(&mut bins);
            let shared_view = UnsafeSlice::new(&mut shared_bins);
            pool.scope(|scope| {
                for k in 0..task_count {
                    let begin = compute_chunk_begin(bin_chunk_size, k, BIN_COUNT);
                    let end = compute_chunk_end(bin_chunk_size, k, BIN_COUNT);
                    let bins_view = &bins_view;
                    let shared_view = &shared_view;
                    scope.submit(move |_| {
                        for b in begin..end {
                            let mut sum = 0;
                            for j in 0..task_count {
                                // Safety: bin column `b` and entry
                                // `shared[b]` are owned by this task
                                unsafe {
                                    let index = j * BIN_COUNT + b;
                                    let old_sum = sum;
                                    sum += bins_view.read(index);
                                    bins_view.write(index, old_sum);
                                }
                            }
                            unsafe { shared_view.write(b, sum) };
                        }
                    });
                }
                scope.wait(0);
            });
        }

        // Scatter each pair to its final position for this digit
        {
            let keys_src: &[K] = keys;
            let values_src: &[usize] = values;
            let shared_bins: &[usize] = &shared_bins;
            let keys_dst = UnsafeSlice::new(keys_scratch);
            let values_dst = UnsafeSlice::new(values_scratch);
            pool.scope(|scope| {
                for (j, bin_table) in bins.chunks_mut(BIN_COUNT).enumerate() {
                    let begin = compute_chunk_begin(data_chunk_size, j, count);
                    let end = compute_chunk_end(data_chunk_size, j, count);
                    let keys_dst = &keys_dst;
                    let values_dst = &values_dst;
                    scope.submit(move |_| {
                        // Add the exclusive scan of the bin totals, making
                        // the local offsets global
                        let mut sum = 0;
                        for (offset, &total) in bin_table.iter_mut().zip(shared_bins) {
                            *offset += sum;
                            sum += total;
                        }
                        for i in begin..end {
                            let bin = keys_src[i].get_level(level) as usize;
                            let index = bin_table[bin];
                            bin_table[bin] += 1;
                            // Safety: stability makes every destination
                            // index unique across tasks
                            unsafe {
                                keys_dst.write(index, keys_src[i]);
                                values_dst.write(index, values_src[i]);
                            }
                        }
                    });
                }
                scope.wait(0);
            });
        }

        std::mem::swap(keys, keys_scratch);
        std::mem::swap(values, values_scratch);
    }
}
