//! Component H — synchronization primitives built directly on the
//! scheduler's block/wake machinery.
//!
//! Field shapes and algorithms are ported from `scheduler.h`/
//! `scheduler.c`'s `SchSemaphore`/`SchMutex`/`SchEvent`/`SchQueue`/
//! `SchSpinlock`. Every primitive but `Spinlock` stores its state
//! behind an `UnsafeCell`, not a `Locked<T>` — the same reasoning as
//! `scheduler::SchedulerCell`: `wait`/`lock`/`pop` call into
//! `scheduler::block_on`, which suspends the calling stack frame
//! across a context switch, so a `MutexGuard` held across that call
//! would never see its `drop` run until the blocked task is scheduled
//! again. `IrqGuard` is this module's only exclusion mechanism, same
//! as the scheduler itself.

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::TIMEOUT_NONE;
use crate::error::{KResult, KernelError};
use crate::sched::scheduler;
use crate::sched::task::WaitList;
use crate::util::IrqGuard;

fn block_result(woke: bool) -> KResult<()> {
    if woke {
        Ok(())
    } else {
        Err(KernelError::TimedOut)
    }
}

/// A classic counting semaphore: `count` is the number of available
/// resources when non-negative, or the (negated) number of blocked
/// waiters when negative. `max` caps how high a signal with no
/// waiters can push it.
pub struct Semaphore {
    state: UnsafeCell<SemaphoreState>,
}

struct SemaphoreState {
    count: i32,
    max: i32,
    waiters: WaitList,
}

unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub const fn new(initial: i32, max: i32) -> Self {
        Self {
            state: UnsafeCell::new(SemaphoreState {
                count: initial,
                max,
                waiters: WaitList::new(),
            }),
        }
    }

    /// Returns `Ok(())` if a unit was available (or became available
    /// before `timeout_ms` elapsed), `Err(TimedOut)` otherwise. Pass
    /// `TIMEOUT_INFINITE` to block forever, `TIMEOUT_NONE` to poll.
    pub fn wait(&self, timeout_ms: u32) -> KResult<()> {
        let _guard = IrqGuard::acquire();
        let state = unsafe { &mut *self.state.get() };
        state.count -= 1;
        if state.count < 0 {
            if timeout_ms == TIMEOUT_NONE {
                state.count += 1;
                return Err(KernelError::TimedOut);
            }
            let woke = scheduler::block_on(&mut state.waiters, timeout_ms);
            if !woke {
                state.count += 1;
            }
            return block_result(woke);
        }
        Ok(())
    }

    /// Releases `n` units, waking one FIFO waiter for each increment
    /// that crosses zero, and stopping early once `count` reaches
    /// `max` — mirrors the original's `SchSemaphoreSignal(semaphore,
    /// count)` loop (`while (count-- && semaphore->count !=
    /// semaphore->max)`) rather than a single fixed increment.
    pub fn signal(&self, n: i32) {
        let _guard = IrqGuard::acquire();
        let state = unsafe { &mut *self.state.get() };
        for _ in 0..n {
            if state.count == state.max {
                break;
            }
            state.count += 1;
            if state.count <= 0 {
                scheduler::wake_one(&mut state.waiters);
            }
        }
    }
}

/// Non-recursive mutex. Unlock hands ownership directly to the head
/// waiter rather than clearing `held` and letting every task race the
/// next acquire — the same direct-handoff `scheduler::wake_one`
/// already performs for `Queue::push`.
pub struct Mutex {
    state: UnsafeCell<MutexState>,
}

struct MutexState {
    held: bool,
    waiters: WaitList,
}

unsafe impl Sync for Mutex {}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            state: UnsafeCell::new(MutexState {
                held: false,
                waiters: WaitList::new(),
            }),
        }
    }

    pub fn lock(&self, timeout_ms: u32) -> KResult<()> {
        let _guard = IrqGuard::acquire();
        let state = unsafe { &mut *self.state.get() };
        if !state.held {
            state.held = true;
            return Ok(());
        }
        if timeout_ms == TIMEOUT_NONE {
            return Err(KernelError::TimedOut);
        }
        block_result(scheduler::block_on(&mut state.waiters, timeout_ms))
    }

    /// Fatal if the calling task does not actually hold the mutex —
    /// matches the original's unconditional assertion rather than a
    /// silently ignored no-op.
    pub fn unlock(&self) {
        let _guard = IrqGuard::acquire();
        let state = unsafe { &mut *self.state.get() };
        assert!(state.held, "mutex unlock while not held");
        if !scheduler::wake_one(&mut state.waiters) {
            state.held = false;
        }
    }
}

/// Level-triggered, sticky event: once signaled it stays signaled,
/// waking every waiter, current and future, with no reset primitive.
pub struct Event {
    state: UnsafeCell<EventState>,
}

struct EventState {
    signaled: bool,
    waiters: WaitList,
}

unsafe impl Sync for Event {}

impl Event {
    pub const fn new() -> Self {
        Self {
            state: UnsafeCell::new(EventState {
                signaled: false,
                waiters: WaitList::new(),
            }),
        }
    }

    pub fn wait(&self, timeout_ms: u32) -> KResult<()> {
        let _guard = IrqGuard::acquire();
        let state = unsafe { &mut *self.state.get() };
        if state.signaled {
            return Ok(());
        }
        if timeout_ms == TIMEOUT_NONE {
            return Err(KernelError::TimedOut);
        }
        block_result(scheduler::block_on(&mut state.waiters, timeout_ms))
    }

    pub fn signal(&self) {
        let _guard = IrqGuard::acquire();
        let state = unsafe { &mut *self.state.get() };
        state.signaled = true;
        scheduler::wake_all(&mut state.waiters);
    }

    pub fn is_signaled(&self) -> bool {
        let _guard = IrqGuard::acquire();
        unsafe { (*self.state.get()).signaled }
    }
}

/// A FIFO of `usize`-sized items. `push` hands a value directly to the
/// oldest blocked waiter when one exists, bypassing the backing
/// deque entirely, exactly as `scheduler::wake_one_with_return`
/// implements it.
pub struct Queue {
    state: UnsafeCell<QueueState>,
}

struct QueueState {
    items: VecDeque<usize>,
    waiters: WaitList,
}

unsafe impl Sync for Queue {}

impl Queue {
    pub fn new() -> Self {
        Self {
            state: UnsafeCell::new(QueueState {
                items: VecDeque::new(),
                waiters: WaitList::new(),
            }),
        }
    }

    pub fn push(&self, value: usize) {
        let _guard = IrqGuard::acquire();
        let state = unsafe { &mut *self.state.get() };
        if !scheduler::wake_one_with_return(&mut state.waiters, value) {
            state.items.push_back(value);
        }
    }

    pub fn pop(&self, timeout_ms: u32) -> KResult<usize> {
        let _guard = IrqGuard::acquire();
        let state = unsafe { &mut *self.state.get() };
        if let Some(value) = state.items.pop_front() {
            return Ok(value);
        }
        if timeout_ms == TIMEOUT_NONE {
            return Err(KernelError::TimedOut);
        }
        if scheduler::block_on(&mut state.waiters, timeout_ms) {
            Ok(scheduler::take_wait_return())
        } else {
            Err(KernelError::TimedOut)
        }
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

/// A true busy-wait lock: never suspends the calling task, so it must
/// never be held across a call that can block (`Semaphore::wait`,
/// `Mutex::lock`, `Event::wait`, `Queue::pop`, `scheduler::sleep`).
/// Unlock while not held is fatal, matching every other primitive
/// here.
pub struct Spinlock {
    held: AtomicBool,
}

impl Spinlock {
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        let was_held = self.held.swap(false, Ordering::Release);
        assert!(was_held, "spinlock unlock while not held");
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_nonzero_wait_succeeds_without_blocking() {
        let sem = Semaphore::new(1, 1);
        assert!(sem.wait(TIMEOUT_NONE).is_ok());
    }

    #[test]
    fn semaphore_zero_wait_with_no_timeout_fails_immediately() {
        let sem = Semaphore::new(0, 1);
        assert_eq!(sem.wait(TIMEOUT_NONE), Err(KernelError::TimedOut));
    }

    #[test]
    fn semaphore_signal_clamps_at_max() {
        let sem = Semaphore::new(0, 2);
        sem.signal(1);
        sem.signal(1);
        sem.signal(1);
        let state = unsafe { &*sem.state.get() };
        assert_eq!(state.count, 2);
    }

    #[test]
    fn semaphore_signal_n_increments_in_one_call_and_stops_at_max() {
        let sem = Semaphore::new(0, 2);
        sem.signal(5);
        let state = unsafe { &*sem.state.get() };
        assert_eq!(state.count, 2);
    }

    #[test]
    fn mutex_second_uncontended_lock_attempt_with_no_timeout_fails() {
        let mutex = Mutex::new();
        assert!(mutex.lock(TIMEOUT_NONE).is_ok());
        assert_eq!(mutex.lock(TIMEOUT_NONE), Err(KernelError::TimedOut));
    }

    #[test]
    #[should_panic]
    fn mutex_unlock_while_not_held_is_fatal() {
        let mutex = Mutex::new();
        mutex.unlock();
    }

    #[test]
    fn event_wait_after_signal_succeeds_even_with_no_timeout() {
        let event = Event::new();
        event.signal();
        assert!(event.wait(TIMEOUT_NONE).is_ok());
    }

    #[test]
    fn queue_push_then_pop_is_fifo() {
        let queue = Queue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(TIMEOUT_NONE), Ok(1));
        assert_eq!(queue.pop(TIMEOUT_NONE), Ok(2));
    }

    #[test]
    fn queue_pop_on_empty_with_no_timeout_fails_immediately() {
        let queue = Queue::new();
        assert_eq!(queue.pop(TIMEOUT_NONE), Err(KernelError::TimedOut));
    }

    #[test]
    fn spinlock_round_trips() {
        let lock = Spinlock::new();
        lock.lock();
        lock.unlock();
    }

    #[test]
    #[should_panic]
    fn spinlock_unlock_while_not_held_is_fatal() {
        let lock = Spinlock::new();
        lock.unlock();
    }
}
