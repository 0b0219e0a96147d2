use lockstep::{KernelExecutor, StaticThreadPool, WorkItem};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const WIDTH: usize = 256;
const HEIGHT: usize = 256;

fn main() {
    env_logger::init();

    let pool = Arc::new(StaticThreadPool::with_default_workers().unwrap());
    println!("Dispatching on {} workers", pool.worker_count());

    let executor = KernelExecutor::new(pool);
    let grid: Arc<Vec<AtomicU64>> = Arc::new((0..WIDTH * HEIGHT).map(|_| AtomicU64::new(0)).collect());

    let kernel_grid = Arc::clone(&grid);
    let done = executor.execute(
        move |item: &WorkItem| {
            let x = item.global_id(0) as u64;
            let y = item.global_id(1) as u64;
            kernel_grid[item.global_id(1) * WIDTH + item.global_id(0)]
                .store(x * y, Ordering::Relaxed);
        },
        (WIDTH, HEIGHT),
    );
    done.get().unwrap();

    let total: u64 = grid.iter().map(|cell| cell.load(Ordering::Relaxed)).sum();
    println!("Sum over the grid: {}", total);
}
