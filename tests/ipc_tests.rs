#![cfg(unix)]

use lockstep::ipc::sync::{ConditionVariable, RobustMutex};
use lockstep::ipc::{IpcError, RingBuffer, SharedMemory};
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn unique_name(prefix: &str) -> String {
    format!("{}_{:08x}", prefix, rand::random::<u32>())
}

#[test]
#[serial]
pub fn shared_memory_round_trip_between_handles() {
    let name = unique_name("ipc_shm");
    let owner = SharedMemory::create(&name, 1024).unwrap();
    unsafe {
        std::ptr::write_bytes(owner.as_ptr(), 0, owner.len());
        *owner.as_ptr() = 7;
    }

    let reader = SharedMemory::open(&name).unwrap();
    assert_eq!(reader.len(), 1024);
    unsafe {
        assert_eq!(*reader.as_ptr(), 7);
    }
}

#[test]
#[serial]
pub fn opening_an_unknown_region_fails_with_resource_missing() {
    match SharedMemory::open(&unique_name("ipc_shm_missing")) {
        Err(IpcError::ResourceMissing) => {}
        other => panic!("unexpected outcome: {:?}", other.map(|_| ()).err()),
    }
}

#[test]
#[serial]
pub fn ring_buffer_in_shared_memory_is_visible_through_both_mappings() {
    let name = unique_name("ipc_ring");
    let owner = SharedMemory::create(&name, 4096).unwrap();
    let mut writer: RingBuffer<u64> =
        unsafe { RingBuffer::attach(owner.as_ptr(), owner.len(), true) };

    let reader_region = SharedMemory::open(&name).unwrap();
    let mut reader: RingBuffer<u64> =
        unsafe { RingBuffer::attach(reader_region.as_ptr(), reader_region.len(), false) };

    writer.push_back(0xDEAD).unwrap();
    writer.push_back(0xBEEF).unwrap();
    assert_eq!(reader.count(), 2);
    assert_eq!(reader.pop_front(), Some(0xDEAD));
    assert_eq!(reader.pop_front(), Some(0xBEEF));
    assert_eq!(writer.count(), 0);
}

#[test]
#[serial]
pub fn mutex_guards_a_shared_counter_across_threads() {
    let name = unique_name("ipc_mutex_counter");
    let mutex = Arc::new(RobustMutex::create(&name).unwrap());
    let counter = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let mutex = Arc::clone(&mutex);
        let counter = Arc::clone(&counter);
        workers.push(thread::spawn(move || {
            for _ in 0..50 {
                let _guard = mutex.scoped().unwrap();
                let seen = counter.load(Ordering::SeqCst);
                thread::yield_now();
                counter.store(seen + 1, Ordering::SeqCst);
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 200);
}

#[test]
#[serial]
pub fn recursive_lock_and_foreign_unlock_are_rejected() {
    let mutex = RobustMutex::create(&unique_name("ipc_mutex_contract")).unwrap();
    mutex.lock().unwrap();
    assert_eq!(mutex.lock(), Err(IpcError::RecursiveLock));

    mutex.unlock().unwrap();
    assert!(matches!(
        mutex.unlock(),
        Err(IpcError::NotOwner) | Err(IpcError::Os(_))
    ));
}

#[test]
#[serial]
pub fn condvar_notify_one_wakes_a_single_waiter() {
    let name = unique_name("ipc_cond_one");
    let mutex = Arc::new(RobustMutex::create(&name).unwrap());
    let cond = Arc::new(ConditionVariable::create(&name).unwrap());
    let notified = Arc::new(AtomicUsize::new(0));

    let waiter = {
        let mutex = Arc::clone(&mutex);
        let cond = Arc::clone(&cond);
        let notified = Arc::clone(&notified);
        thread::spawn(move || {
            let guard = mutex.scoped().unwrap();
            cond.wait(&guard).unwrap();
            notified.fetch_add(1, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert_eq!(notified.load(Ordering::SeqCst), 0);

    // keep signalling until the waiter reports in; a notification sent
    // before the wait began would otherwise be lost
    while notified.load(Ordering::SeqCst) == 0 {
        cond.notify_one().unwrap();
        thread::sleep(Duration::from_millis(10));
    }
    waiter.join().unwrap();
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
pub fn condvar_wait_bounded_times_out() {
    let name = unique_name("ipc_cond_timeout");
    let mutex = RobustMutex::create(&name).unwrap();
    let cond = ConditionVariable::create(&name).unwrap();

    let guard = mutex.scoped().unwrap();
    let started = Instant::now();
    let notified = cond.wait_bounded(&guard, Duration::from_millis(100)).unwrap();
    assert!(!notified);
    assert!(started.elapsed() >= Duration::from_millis(90));
}

#[test]
#[serial]
pub fn condvar_wait_bounded_observes_a_notification() {
    let name = unique_name("ipc_cond_bounded");
    let mutex = Arc::new(RobustMutex::create(&name).unwrap());
    let cond = Arc::new(ConditionVariable::create(&name).unwrap());

    let waiter = {
        let mutex = Arc::clone(&mutex);
        let cond = Arc::clone(&cond);
        thread::spawn(move || {
            let guard = mutex.scoped().unwrap();
            cond.wait_bounded(&guard, Duration::from_millis(1000)).unwrap()
        })
    };

    thread::sleep(Duration::from_millis(150));
    cond.notify_one().unwrap();
    assert!(waiter.join().unwrap());
}

// Two waiters with a 500 ms bound; a broadcast 100 ms in wakes both.
#[test]
#[serial]
pub fn condvar_notify_all_wakes_every_waiter() {
    let name = unique_name("ipc_cond_broadcast");
    let mutex = Arc::new(RobustMutex::create(&name).unwrap());
    let cond = Arc::new(ConditionVariable::create(&name).unwrap());

    let mut waiters = Vec::new();
    for _ in 0..2 {
        let mutex = Arc::clone(&mutex);
        let cond = Arc::clone(&cond);
        waiters.push(thread::spawn(move || {
            let guard = mutex.scoped().unwrap();
            cond.wait_bounded(&guard, Duration::from_millis(500)).unwrap()
        }));
    }

    thread::sleep(Duration::from_millis(100));
    cond.notify_all().unwrap();

    for waiter in waiters {
        assert!(waiter.join().unwrap(), "a waiter timed out");
    }
}

#[test]
#[serial]
pub fn notify_without_waiters_is_harmless() {
    let name = unique_name("ipc_cond_idle");
    let _mutex = RobustMutex::create(&name).unwrap();
    let cond = ConditionVariable::create(&name).unwrap();
    cond.notify_one().unwrap();
    cond.notify_all().unwrap();
}
