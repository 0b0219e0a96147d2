use lockstep::StaticThreadPool;

fn main() {
    env_logger::init();

    let pool = StaticThreadPool::new(4).unwrap();

    eprintln!("Submitting the fetch stages");
    let left = pool.execute(|| {
        std::thread::sleep(std::time::Duration::from_millis(50));
        21u64
    });
    let right = pool.execute(|| 2u64);

    eprintln!("Submitting the combine stage");
    let inputs = (left.clone(), right.clone());
    let combined = pool.execute_after(inputs, move || {
        left.get().unwrap() * right.get().unwrap()
    });

    let printer = combined.then(|settled| {
        eprintln!("combined = {:?}", settled.get());
    });

    printer.wait();
}
