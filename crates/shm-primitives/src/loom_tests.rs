#![cfg(all(test, feature = "loom"))]

use crate::Semaphore;
use crate::sync::{AtomicU32, Ordering, thread};
use loom::sync::Arc;

#[test]
fn single_post_single_wait() {
    loom::model(|| {
        let sem = Arc::new(Semaphore::new(0));

        let poster = {
            let sem = sem.clone();
            thread::spawn(move || sem.post())
        };

        sem.wait();
        poster.join().unwrap();
        assert_eq!(sem.value(), 0);
    });
}

#[test]
fn post_is_consumed_exactly_once() {
    loom::model(|| {
        let sem = Arc::new(Semaphore::new(0));
        let consumed = Arc::new(AtomicU32::new(0));

        sem.post();

        let racers: Vec<_> = (0..2)
            .map(|_| {
                let sem = sem.clone();
                let consumed = consumed.clone();
                thread::spawn(move || {
                    if sem.try_wait() {
                        consumed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for racer in racers {
            racer.join().unwrap();
        }
        assert_eq!(consumed.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn request_response_alternation() {
    loom::model(|| {
        let request = Arc::new(Semaphore::new(0));
        let response = Arc::new(Semaphore::new(0));
        let payload = Arc::new(AtomicU32::new(0));

        let server = {
            let request = request.clone();
            let response = response.clone();
            let payload = payload.clone();
            thread::spawn(move || {
                request.wait();
                let value = payload.load(Ordering::Relaxed);
                payload.store(value + 100, Ordering::Relaxed);
                response.post();
            })
        };

        payload.store(1, Ordering::Relaxed);
        request.post();
        response.wait();
        assert_eq!(payload.load(Ordering::Relaxed), 101);

        server.join().unwrap();
        assert_eq!(request.value(), 0);
        assert_eq!(response.value(), 0);
    });
}

#[test]
fn futex_stays_available() {
    let word = std::sync::atomic::AtomicU32::new(3);
    // Value mismatch returns at once.
    crate::futex::futex_wait(&word, 4, Some(std::time::Duration::from_secs(5))).unwrap();
    assert_eq!(crate::futex::futex_wake(&word, 1), 0);
}
