//! A fair, recursive readers-writer lock.
//!
//! Waiters are granted in strict arrival order: a blocked writer is never jumped by a
//! reader that arrived later, even though readers could otherwise run concurrently
//! with whoever is currently holding the lock. The same thread may re-enter the lock
//! it already holds without blocking, and a thread holding the exclusive lock may
//! additionally take the shared lock before releasing exclusive access, a controlled
//! demotion path. Promoting a shared hold to exclusive on the same thread is refused
//! rather than risking deadlock against other shared holders.
//!
//! This is a blocking, in-process primitive built on [`Mutex`] and [`Condvar`], the
//! same pairing the rest of this crate uses for interior mutability
//! (`Session`-style state in the reactor's connection handles). It does not protect
//! any data of its own; callers guard their own resource and use `with_shared` /
//! `with_exclusive` to make sure it's released on every exit path, including panics.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::error::RwLockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct Waiter {
    thread: ThreadId,
    mode: Mode,
}

#[derive(Debug, Default)]
struct State {
    /// `None` when idle; `Some((thread, count))` while one thread holds the
    /// exclusive lock, possibly with recursive re-entries.
    exclusive_holder: Option<(ThreadId, usize)>,
    /// Recursion count per thread currently holding the shared lock. A thread that
    /// demoted from exclusive has an entry here *and* in `exclusive_holder` until its
    /// exclusive count drops to zero.
    shared_holders: HashMap<ThreadId, usize>,
    /// FIFO queue of blocked acquisitions. Order is the fairness contract.
    wait_queue: VecDeque<Waiter>,
}

impl State {
    /// Grants waiters from the head of the queue per the fairness rule: an exclusive
    /// waiter is granted only once the lock is fully idle; shared waiters are granted
    /// in a contiguous run from the head, stopping at the first exclusive waiter.
    fn grant_waiting(&mut self) {
        loop {
            match self.wait_queue.front() {
                None => break,
                Some(waiter) => match waiter.mode {
                    Mode::Exclusive => {
                        if self.exclusive_holder.is_none() && self.shared_holders.is_empty() {
                            let waiter = self.wait_queue.pop_front().unwrap();
                            self.exclusive_holder = Some((waiter.thread, 1));
                        }
                        break;
                    }
                    Mode::Shared => {
                        if self.exclusive_holder.is_none() {
                            let waiter = self.wait_queue.pop_front().unwrap();
                            *self.shared_holders.entry(waiter.thread).or_insert(0) += 1;
                        } else {
                            break;
                        }
                    }
                },
            }
        }
    }
}

/// A fair, recursive readers-writer lock.
///
/// See the module documentation for the fairness and recursion contract.
#[derive(Debug, Default)]
pub struct RwLock {
    state: Mutex<State>,
    condvar: Condvar,
}

impl RwLock {
    /// Creates a new, idle lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the shared lock can be granted without violating fairness, then
    /// registers the calling thread as a shared holder.
    ///
    /// If the calling thread already holds the exclusive lock, this is the demotion
    /// preparation path: it grants immediately and records a distinct shared entry
    /// alongside the still-held exclusive entry.
    pub fn acquire_shared(&self) {
        let tid = thread::current().id();
        let mut state = self.state.lock().unwrap();

        if let Some((owner, _)) = state.exclusive_holder {
            if owner == tid {
                *state.shared_holders.entry(tid).or_insert(0) += 1;
                return;
            }
        }

        if let Some(count) = state.shared_holders.get_mut(&tid) {
            *count += 1;
            return;
        }

        let must_wait = state.exclusive_holder.is_some()
            || state.wait_queue.iter().any(|w| w.mode == Mode::Exclusive);

        if !must_wait {
            state.shared_holders.insert(tid, 1);
            return;
        }

        state.wait_queue.push_back(Waiter {
            thread: tid,
            mode: Mode::Shared,
        });

        loop {
            state = self.condvar.wait(state).unwrap();
            if state.shared_holders.contains_key(&tid) {
                return;
            }
        }
    }

    /// Blocks until the lock is idle and no earlier waiter remains ahead in the
    /// queue, then registers the calling thread as the sole exclusive holder.
    ///
    /// Fails with [`RwLockError::PromotionForbidden`] if the calling thread already
    /// holds the shared lock: promoting could deadlock against other shared holders
    /// and is refused rather than attempted.
    pub fn acquire_exclusive(&self) -> Result<(), RwLockError> {
        let tid = thread::current().id();
        let mut state = self.state.lock().unwrap();

        if let Some((owner, count)) = state.exclusive_holder {
            if owner == tid {
                state.exclusive_holder = Some((owner, count + 1));
                return Ok(());
            }
        }

        if state.shared_holders.contains_key(&tid) {
            return Err(RwLockError::PromotionForbidden);
        }

        let must_wait = state.exclusive_holder.is_some()
            || !state.shared_holders.is_empty()
            || !state.wait_queue.is_empty();

        if !must_wait {
            state.exclusive_holder = Some((tid, 1));
            return Ok(());
        }

        state.wait_queue.push_back(Waiter {
            thread: tid,
            mode: Mode::Exclusive,
        });

        loop {
            state = self.condvar.wait(state).unwrap();
            if matches!(state.exclusive_holder, Some((owner, _)) if owner == tid) {
                return Ok(());
            }
        }
    }

    /// Releases one level of recursion for the calling thread.
    ///
    /// If the calling thread holds the exclusive lock (with or without an
    /// accompanying demoted shared hold), the exclusive count is the one
    /// decremented, which is what makes demotion work: acquiring shared while
    /// holding exclusive, then releasing, drops only the exclusive hold and leaves
    /// the thread as a shared holder. Otherwise the thread's shared count is
    /// decremented.
    ///
    /// Fails with [`RwLockError::NotHeld`] if the calling thread holds neither.
    pub fn release(&self) -> Result<(), RwLockError> {
        let tid = thread::current().id();
        let mut state = self.state.lock().unwrap();

        if let Some((owner, count)) = state.exclusive_holder {
            if owner == tid {
                if count > 1 {
                    state.exclusive_holder = Some((owner, count - 1));
                } else {
                    state.exclusive_holder = None;
                    state.grant_waiting();
                    self.condvar.notify_all();
                }
                return Ok(());
            }
        }

        if let Some(count) = state.shared_holders.get(&tid).copied() {
            if count > 1 {
                state.shared_holders.insert(tid, count - 1);
            } else {
                state.shared_holders.remove(&tid);
                state.grant_waiting();
                self.condvar.notify_all();
            }
            return Ok(());
        }

        Err(RwLockError::NotHeld)
    }

    /// Runs `f` while holding the shared lock, releasing it on every exit path,
    /// including a panic inside `f`.
    pub fn with_shared<R>(&self, f: impl FnOnce() -> R) -> R {
        self.acquire_shared();
        let result = catch_unwind(AssertUnwindSafe(f));
        self.release().expect("shared lock held by this thread");
        match result {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Runs `f` while holding the exclusive lock, releasing it on every exit path,
    /// including a panic inside `f`.
    ///
    /// # Errors
    ///
    /// Returns [`RwLockError::PromotionForbidden`] without calling `f` if the calling
    /// thread already holds the shared lock.
    pub fn with_exclusive<R>(&self, f: impl FnOnce() -> R) -> Result<R, RwLockError> {
        self.acquire_exclusive()?;
        let result = catch_unwind(AssertUnwindSafe(f));
        self.release().expect("exclusive lock held by this thread");
        match result {
            Ok(value) => Ok(value),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier,
    };
    use std::thread;
    use std::time::Duration;

    /// A small wait to give a spawned thread a chance to reach `acquire_*` and block.
    /// Flaky in the sense any fixed sleep is, but generous enough in practice; the
    /// assertions that follow don't depend on exact timing, only on "has not yet
    /// returned" vs. "has returned".
    fn settle() {
        thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn concurrent_readers_do_not_block_each_other() {
        let lock = Arc::new(RwLock::new());
        let barrier = Arc::new(Barrier::new(5));
        let mut handles = Vec::new();

        for _ in 0..5 {
            let lock = lock.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                lock.acquire_shared();
                barrier.wait(); // all 5 must be holding shared simultaneously
                lock.release().unwrap();
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn s1_fifo_fairness_writer_then_reader() {
        let lock = Arc::new(RwLock::new());
        lock.acquire_shared(); // T1 (this thread) holds shared

        let order = Arc::new(Mutex::new(Vec::new()));

        let t2 = {
            let lock = lock.clone();
            let order = order.clone();
            thread::spawn(move || {
                lock.acquire_exclusive().unwrap();
                order.lock().unwrap().push("writer");
                lock.release().unwrap();
            })
        };
        settle();

        let t3 = {
            let lock = lock.clone();
            let order = order.clone();
            thread::spawn(move || {
                lock.acquire_shared();
                order.lock().unwrap().push("reader");
                lock.release().unwrap();
            })
        };
        settle();

        // Neither should have acquired yet: T1 still holds shared.
        assert!(order.lock().unwrap().is_empty());

        lock.release().unwrap(); // T1 releases shared
        t2.join().unwrap();
        t3.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["writer", "reader"]);
    }

    #[test]
    fn s2_demotion_wakes_blocked_readers() {
        let lock = Arc::new(RwLock::new());
        lock.acquire_exclusive().unwrap(); // T1 holds exclusive

        let reader_acquired = Arc::new(AtomicUsize::new(0));
        let t2 = {
            let lock = lock.clone();
            let reader_acquired = reader_acquired.clone();
            thread::spawn(move || {
                lock.acquire_shared();
                reader_acquired.fetch_add(1, Ordering::SeqCst);
                lock.release().unwrap();
            })
        };
        settle();
        assert_eq!(reader_acquired.load(Ordering::SeqCst), 0);

        lock.acquire_shared(); // T1 demotes: exclusive + shared both held
        lock.release().unwrap(); // releases the exclusive entry only

        t2.join().unwrap();
        assert_eq!(reader_acquired.load(Ordering::SeqCst), 1);

        lock.release().unwrap(); // T1 releases its remaining shared hold
    }

    #[test]
    fn s3_recursive_exclusive_becomes_idle() {
        let lock = RwLock::new();
        lock.acquire_exclusive().unwrap();
        lock.acquire_exclusive().unwrap();
        lock.release().unwrap();
        lock.release().unwrap();

        // Lock is idle again: a fresh exclusive acquire must not block.
        lock.acquire_exclusive().unwrap();
        lock.release().unwrap();
    }

    #[test]
    fn s4_promotion_is_refused() {
        let lock = RwLock::new();
        lock.acquire_shared();
        assert_eq!(
            lock.acquire_exclusive(),
            Err(RwLockError::PromotionForbidden)
        );
        // The shared acquisition is unaffected.
        lock.release().unwrap();
    }

    #[test]
    fn release_without_holding_fails() {
        let lock = RwLock::new();
        assert_eq!(lock.release(), Err(RwLockError::NotHeld));
    }

    #[test]
    fn recursive_shared_requires_matching_releases() {
        let lock = RwLock::new();
        lock.acquire_shared();
        lock.acquire_shared();
        lock.acquire_shared();
        lock.release().unwrap();
        lock.release().unwrap();
        // Still held once.
        assert_eq!(lock.release(), Ok(()));
        assert_eq!(lock.release(), Err(RwLockError::NotHeld));
    }

    #[test]
    fn with_shared_releases_on_panic() {
        let lock = Arc::new(RwLock::new());
        let result = std::panic::catch_unwind({
            let lock = lock.clone();
            move || {
                lock.with_shared(|| panic!("boom"));
            }
        });
        assert!(result.is_err());

        // The lock must be released despite the panic: a fresh exclusive acquire
        // must not block.
        lock.acquire_exclusive().unwrap();
        lock.release().unwrap();
    }

    #[test]
    fn writer_blocks_behind_existing_writer_queue() {
        // Exercises rule 3's statement for writer/writer ordering too: a later
        // exclusive waiter may not jump an earlier one.
        let lock = Arc::new(RwLock::new());
        lock.acquire_exclusive().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let lock = lock.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                lock.acquire_exclusive().unwrap();
                order.lock().unwrap().push(i);
                lock.release().unwrap();
            }));
            settle(); // keep enqueue order deterministic
        }

        lock.release().unwrap();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    #[ignore = "statistical fairness check; run with --ignored for a longer soak"]
    fn steady_state_fairness_is_bounded() {
        const READERS: usize = 4;
        const WRITERS: usize = 4;
        const DURATION: Duration = Duration::from_millis(500);

        let lock = Arc::new(RwLock::new());
        let counts: Arc<Vec<AtomicUsize>> =
            Arc::new((0..READERS + WRITERS).map(|_| AtomicUsize::new(0)).collect());
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut handles = Vec::new();
        for i in 0..READERS {
            let lock = lock.clone();
            let counts = counts.clone();
            let stop = stop.clone();
            handles.push(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    lock.acquire_shared();
                    counts[i].fetch_add(1, Ordering::Relaxed);
                    lock.release().unwrap();
                }
            }));
        }
        for i in 0..WRITERS {
            let lock = lock.clone();
            let counts = counts.clone();
            let stop = stop.clone();
            handles.push(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    lock.acquire_exclusive().unwrap();
                    counts[READERS + i].fetch_add(1, Ordering::Relaxed);
                    lock.release().unwrap();
                }
            }));
        }

        thread::sleep(DURATION);
        stop.store(true, Ordering::Relaxed);
        for h in handles {
            h.join().unwrap();
        }

        let values: Vec<usize> = counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        let mean = values.iter().sum::<usize>() as f64 / values.len() as f64;
        for v in values {
            assert!(
                (v as f64 - mean).abs() <= mean * 0.5,
                "acquisition counts not within bound: {v} vs mean {mean}"
            );
        }
    }
}
