// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Cross-process futex shim.
//!
//! Uses the SHARED futex operations, not the `_PRIVATE` variants: private
//! futexes never wake waiters in other processes, which turns every
//! blocking read into a silent timeout. The words being waited on live
//! inside mapped segments.

use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[cfg(target_os = "linux")]
const FUTEX_WAIT: i32 = 0;
#[cfg(target_os = "linux")]
const FUTEX_WAKE: i32 = 1;

/// Why a [`wait`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by a waker (or spuriously); re-check the condition
    Woken,
    /// The word no longer held `expected` when the wait was issued
    ValueChanged,
    /// Timeout expired
    TimedOut,
}

/// Block until `word` changes away from `expected`, a wake arrives, or
/// `timeout` expires. `EINTR` is retried internally.
///
/// For cross-process use the word must live in a `MAP_SHARED` mapping.
#[cfg(target_os = "linux")]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    loop {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(d.subsec_nanos()),
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(ptr::null(), |t| t as *const libc::timespec);

        // SAFETY: the word reference guarantees a valid, aligned u32; the
        // remaining arguments follow the futex(2) calling convention.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32 as *const u32,
                FUTEX_WAIT,
                expected,
                ts_ptr,
                ptr::null::<u32>(),
                0i32,
            )
        };

        if rc == 0 {
            return WaitOutcome::Woken;
        }
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or_default();
        match errno {
            libc::EAGAIN => return WaitOutcome::ValueChanged,
            libc::ETIMEDOUT => return WaitOutcome::TimedOut,
            libc::EINTR => continue,
            _ => return WaitOutcome::Woken,
        }
    }
}

/// Wake every process blocked on `word`. Returns the number woken.
#[cfg(target_os = "linux")]
pub fn wake_all(word: &AtomicU32) -> i32 {
    // SAFETY: same contract as `wait`; FUTEX_WAKE ignores the timeout and
    // secondary address arguments.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            i32::MAX,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

// Non-Linux fallback: bounded sleep. Keeps unit tests runnable on other
// hosts; production targets are Linux.
#[cfg(not(target_os = "linux"))]
pub fn wait(_word: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    let nap = timeout
        .unwrap_or(Duration::from_millis(1))
        .min(Duration::from_millis(10));
    std::thread::sleep(nap);
    WaitOutcome::Woken
}

#[cfg(not(target_os = "linux"))]
pub fn wake_all(_word: &AtomicU32) -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wake_without_waiters() {
        let word = AtomicU32::new(0);
        assert!(wake_all(&word) >= 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_wait_detects_changed_value() {
        let word = AtomicU32::new(7);
        let outcome = wait(&word, 0, Some(Duration::from_millis(100)));
        assert_eq!(outcome, WaitOutcome::ValueChanged);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_wait_times_out() {
        let word = AtomicU32::new(7);
        let start = std::time::Instant::now();
        let outcome = wait(&word, 7, Some(Duration::from_millis(50)));
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    wait(&word, 0, Some(Duration::from_secs(1)));
                }
                word.load(Ordering::Acquire)
            })
        };

        thread::sleep(Duration::from_millis(20));
        word.store(9, Ordering::Release);
        wake_all(&word);
        assert_eq!(waiter.join().expect("waiter thread"), 9);
    }
}
