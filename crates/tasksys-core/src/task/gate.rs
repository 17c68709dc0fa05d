//! PauseGate - Mutex + Condvar による協調的な一時停止
//!
//! - `arm()` でゲートを閉じ、`open()` で開いて待機中のスレッドを全て起こす
//! - 待機は常に有限の poll 間隔で行う（wake を取りこぼしても永久に止まらない）
//! - `stop` 判定（キャンセル）でも待機を抜ける

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::sync::lock;

pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub(crate) struct PauseGate {
    paused: Mutex<bool>,
    condvar: Condvar,
    poll_interval: Mutex<Duration>,
    waiters: AtomicUsize,
}

impl PauseGate {
    pub(crate) fn new() -> Self {
        Self {
            paused: Mutex::new(false),
            condvar: Condvar::new(),
            poll_interval: Mutex::new(DEFAULT_POLL_INTERVAL),
            waiters: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_poll_interval(&self, interval: Duration) {
        *lock(&self.poll_interval) = interval.max(Duration::from_millis(1));
    }

    pub(crate) fn arm(&self) {
        *lock(&self.paused) = true;
    }

    pub(crate) fn open(&self) {
        *lock(&self.paused) = false;
        self.condvar.notify_all();
    }

    /// Wake sleepers without changing the paused flag.
    pub(crate) fn wake(&self) {
        self.condvar.notify_all();
    }

    pub(crate) fn is_armed(&self) -> bool {
        *lock(&self.paused)
    }

    pub(crate) fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Block while the gate is armed and `stop()` is false.
    pub(crate) fn wait(&self, stop: impl Fn() -> bool) {
        let poll = *lock(&self.poll_interval);
        let mut paused = lock(&self.paused);
        if !*paused || stop() {
            return;
        }
        self.waiters.fetch_add(1, Ordering::SeqCst);
        while *paused && !stop() {
            paused = match self.condvar.wait_timeout(paused, poll) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Sleep for `duration` unless `stop()` turns true first.
    ///
    /// Returns `false` when interrupted.
    pub(crate) fn sleep(&self, duration: Duration, stop: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + duration;
        let poll = *lock(&self.poll_interval);
        let mut guard = lock(&self.paused);
        loop {
            if stop() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let step = (deadline - now).min(poll);
            guard = match self.condvar.wait_timeout(guard, step) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn wait_returns_immediately_when_open() {
        let gate = PauseGate::new();
        let start = Instant::now();
        gate.wait(|| false);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn open_releases_a_blocked_waiter() {
        let gate = Arc::new(PauseGate::new());
        gate.arm();

        let g = Arc::clone(&gate);
        let waiter = thread::spawn(move || g.wait(|| false));

        let deadline = Instant::now() + Duration::from_secs(2);
        while gate.waiters() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(gate.waiters(), 1);

        gate.open();
        waiter.join().unwrap();
        assert_eq!(gate.waiters(), 0);
    }

    #[test]
    fn stop_flag_releases_within_one_poll_interval() {
        let gate = Arc::new(PauseGate::new());
        gate.set_poll_interval(Duration::from_millis(20));
        gate.arm();
        let stop = Arc::new(AtomicBool::new(false));

        let (g, s) = (Arc::clone(&gate), Arc::clone(&stop));
        let waiter = thread::spawn(move || g.wait(|| s.load(Ordering::SeqCst)));

        thread::sleep(Duration::from_millis(50));
        // No notify: the bounded poll alone must observe the flag.
        stop.store(true, Ordering::SeqCst);
        let start = Instant::now();
        waiter.join().unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(gate.is_armed());
    }

    #[test]
    fn sleep_is_interruptible() {
        let gate = Arc::new(PauseGate::new());
        let stop = Arc::new(AtomicBool::new(false));

        let (g, s) = (Arc::clone(&gate), Arc::clone(&stop));
        let sleeper = thread::spawn(move || g.sleep(Duration::from_secs(30), || s.load(Ordering::SeqCst)));

        thread::sleep(Duration::from_millis(30));
        stop.store(true, Ordering::SeqCst);
        gate.wake();
        assert!(!sleeper.join().unwrap());

        assert!(gate.sleep(Duration::from_millis(10), || false));
    }
}
