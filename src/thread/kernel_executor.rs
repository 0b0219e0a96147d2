//! Data-parallel execution of a kernel over a 1-, 2- or 3-dimensional
//! index space.
//!
//! The executor splits the linearized index space into even shards, one
//! pool task each (the last shard may be short), and joins the shard
//! futures with `when_all`. Each kernel invocation receives a
//! [`WorkItem`] carrying its global indices; decoding is row-major, so
//! dimension 0 varies fastest. Nothing orders one shard against another.

use super::thread_pool::StaticThreadPool;
use crate::future::{when_all, Future};
use std::sync::Arc;

/// One point of the index space, handed to every kernel invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkItem {
    id: [usize; 3],
}

impl WorkItem {
    /// The global index in `dimension` (0, 1 or 2). Dimensions beyond
    /// the grid's rank, and out-of-range dimensions, read as 0.
    pub fn global_id(&self, dimension: usize) -> usize {
        self.id.get(dimension).copied().unwrap_or(0)
    }
}

/// An index-space shape: a size or offset of rank 1, 2 or 3.
pub trait IndexSpace: Copy + Send + 'static {
    /// The all-zero shape of the same rank.
    fn origin() -> Self;
    /// Grid extents, padded with 1 for missing dimensions.
    fn extents(self) -> [usize; 3];
    /// Origin offsets, padded with 0 for missing dimensions.
    fn offsets(self) -> [usize; 3];
}

impl IndexSpace for usize {
    fn origin() -> Self {
        0
    }
    fn extents(self) -> [usize; 3] {
        [self, 1, 1]
    }
    fn offsets(self) -> [usize; 3] {
        [self, 0, 0]
    }
}

impl IndexSpace for (usize, usize) {
    fn origin() -> Self {
        (0, 0)
    }
    fn extents(self) -> [usize; 3] {
        [self.0, self.1, 1]
    }
    fn offsets(self) -> [usize; 3] {
        [self.0, self.1, 0]
    }
}

impl IndexSpace for (usize, usize, usize) {
    fn origin() -> Self {
        (0, 0, 0)
    }
    fn extents(self) -> [usize; 3] {
        [self.0, self.1, self.2]
    }
    fn offsets(self) -> [usize; 3] {
        [self.0, self.1, self.2]
    }
}

/// Distributes kernel invocations over a [`StaticThreadPool`].
///
/// ```
/// use lockstep::{KernelExecutor, StaticThreadPool};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let pool = Arc::new(StaticThreadPool::new(2).unwrap());
/// let executor = KernelExecutor::new(pool);
///
/// let sum = Arc::new(AtomicUsize::new(0));
/// let kernel_sum = Arc::clone(&sum);
/// let done = executor.execute(
///     move |item| {
///         kernel_sum.fetch_add(item.global_id(0), Ordering::SeqCst);
///     },
///     8usize,
/// );
/// done.get().unwrap();
/// assert_eq!(sum.load(Ordering::SeqCst), (0..8usize).sum());
/// ```
pub struct KernelExecutor {
    pool: Arc<StaticThreadPool>,
}

impl KernelExecutor {
    /// Creates an executor dispatching onto `pool`.
    pub fn new(pool: Arc<StaticThreadPool>) -> Self {
        Self { pool }
    }

    /// Runs `kernel` once per point of `global_size`, with a zero origin.
    pub fn execute<K, S>(&self, kernel: K, global_size: S) -> Future<()>
    where
        K: Fn(&WorkItem) + Send + Sync + 'static,
        S: IndexSpace,
    {
        self.execute_with_offset(kernel, global_size, S::origin())
    }

    /// Runs `kernel` once per point of `global_size`, translated by
    /// `global_offset`. Returns a future that is ready once every shard
    /// has run.
    pub fn execute_with_offset<K, S>(
        &self,
        kernel: K,
        global_size: S,
        global_offset: S,
    ) -> Future<()>
    where
        K: Fn(&WorkItem) + Send + Sync + 'static,
        S: IndexSpace,
    {
        let size = global_size.extents();
        let offset = global_offset.offsets();
        let work_items = size[0] * size[1] * size[2];

        let worker_count = self.pool.worker_count().max(1);
        let items_per_shard = ((work_items + worker_count - 1) / worker_count).max(1);

        let kernel = Arc::new(kernel);
        let mut shards = Vec::new();
        let mut start = 0;
        while start < work_items {
            let end = (start + items_per_shard).min(work_items);
            let kernel = Arc::clone(&kernel);
            shards.push(self.pool.execute(move || {
                for linear in start..end {
                    let item = WorkItem {
                        id: [
                            offset[0] + linear % size[0],
                            offset[1] + (linear / size[0]) % size[1],
                            offset[2] + linear / (size[0] * size[1]),
                        ],
                    };
                    kernel(&item);
                }
            }));
            start = end;
        }

        log::debug!(
            "dispatched {} work items in {} shards",
            work_items,
            shards.len()
        );
        when_all(shards.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn executor(workers: usize) -> KernelExecutor {
        KernelExecutor::new(Arc::new(StaticThreadPool::new(workers).unwrap()))
    }

    #[test]
    fn covers_a_one_dimensional_range_exactly_once() {
        let executor = executor(4);
        let hits: Arc<Vec<AtomicUsize>> =
            Arc::new((0..64).map(|_| AtomicUsize::new(0)).collect());

        let kernel_hits = Arc::clone(&hits);
        let done = executor.execute(
            move |item| {
                kernel_hits[item.global_id(0)].fetch_add(1, Ordering::SeqCst);
            },
            64usize,
        );
        done.get().unwrap();

        for cell in hits.iter() {
            assert_eq!(cell.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn one_dimensional_offset_translates_indices() {
        let executor = executor(2);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let kernel_seen = Arc::clone(&seen);
        let done = executor.execute_with_offset(
            move |item: &WorkItem| {
                kernel_seen.lock().unwrap().push(item.global_id(0));
            },
            4usize,
            10usize,
        );
        done.get().unwrap();

        let mut observed = seen.lock().unwrap().clone();
        observed.sort_unstable();
        assert_eq!(observed, vec![10, 11, 12, 13]);
    }

    #[test]
    fn two_dimensional_offset_touches_exactly_the_window() {
        // 4x4 matrix, global size (2, 1), offset (1, 2): only (1,2) and (2,2)
        let executor = executor(2);
        let matrix: Arc<Vec<AtomicUsize>> =
            Arc::new((0..16).map(|_| AtomicUsize::new(0)).collect());

        let kernel_matrix = Arc::clone(&matrix);
        let done = executor.execute_with_offset(
            move |item| {
                let x = item.global_id(0);
                let y = item.global_id(1);
                kernel_matrix[y * 4 + x].fetch_add(1, Ordering::SeqCst);
            },
            (2usize, 1usize),
            (1usize, 2usize),
        );
        done.get().unwrap();

        for (index, cell) in matrix.iter().enumerate() {
            let expected = if index == 2 * 4 + 1 || index == 2 * 4 + 2 {
                1
            } else {
                0
            };
            assert_eq!(cell.load(Ordering::SeqCst), expected, "cell {}", index);
        }
    }

    #[test]
    fn three_dimensional_decode_is_row_major() {
        let executor = executor(3);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let kernel_seen = Arc::clone(&seen);
        let done = executor.execute(
            move |item: &WorkItem| {
                kernel_seen.lock().unwrap().push((
                    item.global_id(0),
                    item.global_id(1),
                    item.global_id(2),
                ));
            },
            (2usize, 3usize, 2usize),
        );
        done.get().unwrap();

        let mut observed = seen.lock().unwrap().clone();
        observed.sort_unstable();
        let mut expected = Vec::new();
        for z in 0..2 {
            for y in 0..3 {
                for x in 0..2 {
                    expected.push((x, y, z));
                }
            }
        }
        expected.sort_unstable();
        assert_eq!(observed, expected);
    }

    #[test]
    fn uneven_split_still_covers_every_item() {
        // 7 items over 3 workers: shards of 3, 3 and 1
        let executor = executor(3);
        let count = Arc::new(AtomicUsize::new(0));

        let kernel_count = Arc::clone(&count);
        let done = executor.execute(
            move |_item: &WorkItem| {
                kernel_count.fetch_add(1, Ordering::SeqCst);
            },
            7usize,
        );
        done.get().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn empty_index_space_is_ready_immediately() {
        let executor = executor(2);
        let done = executor.execute(|_item: &WorkItem| panic!("must not run"), 0usize);
        assert!(done.is_terminal());
        assert!(done.get().is_ok());
    }

    #[test]
    fn out_of_rank_dimension_reads_zero() {
        let item = WorkItem { id: [5, 0, 0] };
        assert_eq!(item.global_id(1), 0);
        assert_eq!(item.global_id(9), 0);
    }
}
