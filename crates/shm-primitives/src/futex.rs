//! Thin wrappers over `futex(2)` for words living in process-shared memory.
//!
//! The private futex flag is deliberately not used: waiters and wakers are in
//! different processes that map the same pages at different addresses.

use std::io;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Block while `*word == expected`, for at most `timeout`.
///
/// Returns `Ok(())` on wake, on value mismatch, on interruption and on
/// timeout alike. Callers re-check their condition and their own deadline.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> io::Result<()> {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: `word` is a live, 4-byte aligned u32 for the whole call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if ret == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) | Some(libc::ETIMEDOUT) => Ok(()),
        _ => Err(err),
    }
}

/// Wake up to `count` waiters blocked on `word`. Returns how many woke.
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32, count: u32) -> usize {
    let count = count.min(i32::MAX as u32) as libc::c_int;

    // SAFETY: `word` is a live, 4-byte aligned u32 for the whole call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if ret < 0 { 0 } else { ret as usize }
}

/// Polling fallback for platforms without futexes.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> io::Result<()> {
    const NAP: Duration = Duration::from_micros(200);

    if word.load(std::sync::atomic::Ordering::Acquire) == expected {
        std::thread::sleep(timeout.map_or(NAP, |t| t.min(NAP)));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_word: &AtomicU32, _count: u32) -> usize {
    0
}
