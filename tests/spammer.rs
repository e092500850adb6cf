use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use namedlock::action::action_once;
use namedlock::clock::SystemClock;
use namedlock::lock::NamedLock;
use namedlock::scheduled::ScheduledLockManager;
use namedlock::scheduler::Scheduler;

const THREADS: usize = 4;
const ITERS: usize = 200;
const NAMES: [&str; 3] = ["a", "b", "c"];

/// Hammers a few names from several threads on the real clock, checking that
/// no two handles ever hold the same name and that every request is answered.
#[test]
fn spam_named_locks() {
    let _ = env_logger::builder().is_test(true).try_init();
    let scheduler = Arc::new(Scheduler::new(Arc::new(SystemClock::new())));
    let manager = Arc::new(ScheduledLockManager::new(Arc::clone(&scheduler)));
    let in_use: Arc<[AtomicBool; 3]> = Arc::new(Default::default());
    let (granted, denied) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));

    let stop = Arc::new(AtomicBool::new(false));
    let driver = {
        let (scheduler, stop) = (Arc::clone(&scheduler), Arc::clone(&stop));
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                scheduler.process_alarms(1_000);
            }
        })
    };

    let workers: Vec<_> = (0..THREADS)
        .map(|thread| {
            let (manager, in_use) = (Arc::clone(&manager), Arc::clone(&in_use));
            let (granted, denied) = (Arc::clone(&granted), Arc::clone(&denied));
            thread::spawn(move || {
                let locks: Vec<_> =
                    NAMES.iter().map(|name| manager.create_named_lock(name)).collect();
                for iter in 0..ITERS {
                    let index = (thread + iter) % NAMES.len();
                    let (tx, rx) = channel();
                    locks[index].lock_timed_wait(20, action_once(move |ok| tx.send(ok).unwrap()));
                    let ok =
                        rx.recv_timeout(Duration::from_secs(5)).expect("request never answered");
                    if !ok {
                        denied.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    let was_held = in_use[index].swap(true, Ordering::AcqRel);
                    assert!(!was_held, "{} held twice", NAMES[index]);
                    thread::yield_now();
                    in_use[index].store(false, Ordering::Release);
                    locks[index].unlock();
                    granted.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    stop.store(true, Ordering::Release);
    scheduler.wakeup();
    driver.join().unwrap();

    assert_eq!(granted.load(Ordering::Relaxed) + denied.load(Ordering::Relaxed), THREADS * ITERS);
    assert!(granted.load(Ordering::Relaxed) > 0);
    assert_eq!(manager.armed_wakeup_ms(), None);
}
