//! The cooperative scheduler: run list, sorted sleep list, dead-list
//! drain and task creation/retirement. Ported from the original
//! kernel's `scheduler.c` (`SchYield`, `SchSleep`, `SchCreateTask`,
//! the run/sleep/wait list helpers).
//!
//! State lives behind a raw cell, not the `Locked<T>` (`spin::Mutex`)
//! wrapper every other subsystem singleton uses: a context switch
//! suspends the calling stack frame mid-function and resumes it later
//! through a *different* call into this module, so a `MutexGuard`
//! taken before [`switch_to`] would never see its `drop` run until the
//! original task is scheduled again — deadlocking every other task
//! that touches scheduler state meanwhile. Every entry point here is
//! instead IRQ-off for its entire body (`IrqGuard`), the kernel's only
//! concurrency actor on a single CPU, so the raw access is sound
//! without a second lock layered on top.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use core::cell::UnsafeCell;
use core::ptr::NonNull;

use crate::config::TASK_STACK_PAGES;
use crate::memory::frame_allocator::{self, RegionTag};
use crate::memory::vspace::{self, Protection, RegionType};
use crate::sched::switch::{switch_to, task_wrapper};
use crate::sched::task::{Task, TaskFn, TaskId, TaskStatus, WaitList};
use crate::util::IrqGuard;

struct SchedulerState {
    kernel_task: Task,
    current: Option<NonNull<Task>>,
    first_sleep: Option<NonNull<Task>>,
    dead_list: Option<NonNull<Task>>,
    next_task_id: TaskId,
}

struct SchedulerCell(UnsafeCell<SchedulerState>);
unsafe impl Sync for SchedulerCell {}

static SCHEDULER: SchedulerCell = SchedulerCell(UnsafeCell::new(SchedulerState {
    kernel_task: Task::new(0, String::new(), 0, 0, 0),
    current: None,
    first_sleep: None,
    dead_list: None,
    next_task_id: 1,
}));

/// # Safety
/// Caller must hold an `IrqGuard` (or already be running with
/// interrupts disabled, as the timer ISR does) for the duration any
/// reference returned from here is alive.
#[inline]
unsafe fn state() -> &'static mut SchedulerState {
    unsafe { &mut *SCHEDULER.0.get() }
}

unsafe fn kernel_task_ptr() -> NonNull<Task> {
    unsafe { NonNull::new_unchecked(&mut state().kernel_task as *mut Task) }
}

/// Brings up the scheduler with the calling context as the boot/idle
/// task: the anchor of the circular run list, never destroyed.
pub fn init(name: &str) {
    let _guard = IrqGuard::acquire();
    unsafe {
        let s = state();
        s.kernel_task.id = s.next_task_id;
        s.next_task_id += 1;
        s.kernel_task.name = name.to_string();
        s.kernel_task.status = TaskStatus::Running;
        s.kernel_task.next_run = Some(kernel_task_ptr());
        s.current = Some(kernel_task_ptr());
    }
}

fn run_list_insert(task: NonNull<Task>) {
    unsafe {
        let anchor = kernel_task_ptr();
        (*task.as_ptr()).next_run = (*anchor.as_ptr()).next_run;
        (*anchor.as_ptr()).next_run = Some(task);
    }
}

/// Unlinks `task` from the run list, returning the task that was
/// after it (the task `switch_to` should move on to if `task` was
/// current).
fn run_list_remove(task: NonNull<Task>) -> NonNull<Task> {
    unsafe {
        let next = (*task.as_ptr()).next_run.expect("task not on run list");
        let mut prev = kernel_task_ptr();
        while (*prev.as_ptr()).next_run != Some(task) {
            prev = (*prev.as_ptr()).next_run.expect("task not found on run list");
        }
        (*prev.as_ptr()).next_run = Some(next);
        (*task.as_ptr()).next_run = None;
        next
    }
}

fn sleep_list_insert(task: NonNull<Task>, sleep_until: u64) {
    unsafe {
        (*task.as_ptr()).sleep_until = sleep_until;
        let s = state();
        let mut prev_next = &mut s.first_sleep as *mut Option<NonNull<Task>>;
        let mut entry = s.first_sleep;
        while let Some(e) = entry {
            if sleep_until < (*e.as_ptr()).sleep_until {
                break;
            }
            prev_next = &mut (*e.as_ptr()).sleep_next as *mut Option<NonNull<Task>>;
            entry = (*e.as_ptr()).sleep_next;
        }
        (*task.as_ptr()).sleep_next = entry;
        *prev_next = Some(task);
    }
}

fn sleep_list_remove(task: NonNull<Task>) {
    unsafe {
        let s = state();
        let mut prev_next = &mut s.first_sleep as *mut Option<NonNull<Task>>;
        while let Some(e) = *prev_next {
            if e == task {
                *prev_next = (*task.as_ptr()).sleep_next;
                break;
            }
            prev_next = &mut (*e.as_ptr()).sleep_next as *mut Option<NonNull<Task>>;
        }
        (*task.as_ptr()).sleep_next = None;
        (*task.as_ptr()).sleep_until = 0;
    }
}

fn sleep_list_pop() -> NonNull<Task> {
    unsafe {
        let s = state();
        let sleeper = s.first_sleep.expect("sleep list empty");
        s.first_sleep = (*sleeper.as_ptr()).sleep_next;
        (*sleeper.as_ptr()).sleep_next = None;
        (*sleeper.as_ptr()).sleep_until = 0;
        sleeper
    }
}

pub(crate) fn wait_list_append(list: &mut WaitList, task: NonNull<Task>) {
    unsafe {
        (*task.as_ptr()).wait_list = Some(NonNull::from(&mut *list));
        (*task.as_ptr()).wait_next = None;
        match list.last {
            Some(tail) => (*tail.as_ptr()).wait_next = Some(task),
            None => list.first = Some(task),
        }
        list.last = Some(task);
    }
}

pub(crate) fn wait_list_remove(task: NonNull<Task>, timeout: bool) {
    unsafe {
        let list_ptr = (*task.as_ptr()).wait_list.expect("task has no wait list");
        let list = &mut *list_ptr.as_ptr();
        let mut prev: Option<NonNull<Task>> = None;
        let mut cur = list.first;
        while let Some(c) = cur {
            if c == task {
                let next = (*c.as_ptr()).wait_next;
                match prev {
                    Some(p) => (*p.as_ptr()).wait_next = next,
                    None => list.first = next,
                }
                if list.last == Some(c) {
                    list.last = prev;
                }
                break;
            }
            prev = cur;
            cur = (*c.as_ptr()).wait_next;
        }
        (*task.as_ptr()).wait_next = None;
        (*task.as_ptr()).wait_list = None;
        (*task.as_ptr()).wait_timed_out = timeout;
    }
}

pub(crate) fn wait_list_pop(list: &mut WaitList, timeout: bool) -> NonNull<Task> {
    unsafe {
        let waiter = list.first.expect("wait list empty");
        list.first = (*waiter.as_ptr()).wait_next;
        if list.first.is_none() {
            list.last = None;
        }
        (*waiter.as_ptr()).wait_next = None;
        (*waiter.as_ptr()).wait_list = None;
        (*waiter.as_ptr()).wait_timed_out = timeout;
        waiter
    }
}

/// Moves a woken task (from a sleep timeout or a primitive signal)
/// back onto the run list, detaching it from whichever lists it was
/// on first.
fn wake_and_run(task: NonNull<Task>) {
    unsafe {
        if (*task.as_ptr()).sleep_until != 0 {
            sleep_list_remove(task);
        }
        (*task.as_ptr()).status = TaskStatus::Running;
        run_list_insert(task);
    }
}

fn ms_to_ticks(ms: u32) -> u64 {
    (ms as u64 * crate::config::TIMER_HZ as u64) / 1000
}

pub fn current_task_id() -> TaskId {
    let _guard = IrqGuard::acquire();
    unsafe { (*state().current.expect("scheduler not initialized").as_ptr()).id }
}

/// Read-only walk of the run list starting at the current task,
/// grounded on `kmonitor`'s task-listing loop in the original kernel
/// (`do { ... task = task->next; } while (task != SchCurrentTask)`).
/// `f` must not create or destroy tasks, or block.
pub fn for_each(mut f: impl FnMut(&Task)) {
    let _guard = IrqGuard::acquire();
    unsafe {
        let start = state().current.expect("scheduler not initialized");
        let mut task = start;
        loop {
            f(task.as_ref());
            task = (*task.as_ptr()).next_run.expect("task not on run list");
            if task == start {
                break;
            }
        }
    }
}

/// Allocates a stack, builds the initial frame `switch_to` expects,
/// and inserts the new task at the head of the run list. Allocation
/// failure is fatal — spec.md treats task creation as an operation
/// with no graceful OOM path.
pub fn create_task(name: &str, entry: TaskFn, ctx: usize) -> TaskId {
    let stack_pages = TASK_STACK_PAGES;
    let stack_phys = frame_allocator::alloc(stack_pages, RegionTag::KernelTaskStack, "task stack");
    if stack_phys == 0 {
        crate::util::halt_fatal("out of memory creating task stack");
    }
    let stack_base = vspace::kernel_space()
        .lock()
        .as_mut()
        .unwrap()
        .alloc(stack_phys, stack_pages, Protection::READWRITE, RegionType::KernelTaskStack, "task stack")
        .unwrap_or_else(|_| crate::util::halt_fatal("out of virtual address space creating task stack"));

    let stack_top = stack_base + stack_pages * crate::config::PAGE_SIZE;
    let frame_words: [usize; 8] = [
        0xDEAD_0001,              // edi (restored first, discarded)
        0xDEAD_0002,              // esi
        0xDEAD_0003,              // ebx
        0xDEAD_0004,              // ebp
        task_wrapper as usize,    // "return address" switch_to's ret jumps to
        0xDEAD_0005,              // task_wrapper's own return address, never used
        entry as usize,           // task_wrapper's first cdecl argument
        ctx,                      // task_wrapper's second cdecl argument
    ];
    let frame_base = stack_top - core::mem::size_of_val(&frame_words);
    unsafe {
        core::ptr::copy_nonoverlapping(frame_words.as_ptr(), frame_base as *mut usize, frame_words.len());
    }

    let _guard = IrqGuard::acquire();
    let id = unsafe {
        let s = state();
        let id = s.next_task_id;
        s.next_task_id += 1;
        id
    };
    let task = Box::new(Task::new(id, name.to_string(), frame_base, stack_base, stack_pages));
    let task_ptr = unsafe { NonNull::new_unchecked(Box::into_raw(task)) };
    run_list_insert(task_ptr);
    id
}

/// Frees a dead task's stack and record. Called only from `yield_now`
/// by a *different* task than the one being freed (a task can never
/// free its own stack out from under itself).
fn reap(task: NonNull<Task>) {
    unsafe {
        let boxed = Box::from_raw(task.as_ptr());
        crate::logln!(
            "task #{} - {} deleted ({} KiB stack freed)",
            boxed.id,
            boxed.name,
            boxed.stack_pages * crate::config::PAGE_SIZE / 1024
        );
        let mut guard = vspace::kernel_space().lock();
        let space = guard.as_mut().unwrap();
        let phys = space.virt_to_phys(boxed.stack_base).expect("dead task stack not mapped");
        space.free(boxed.stack_base).ok();
        drop(guard);
        frame_allocator::free(phys);
    }
}

/// Runs on the current task. Drains tasks from the dead list (up to
/// but not including the current task), wakes any sleepers whose time
/// has come, and switches to the next run-list task if one exists.
pub fn yield_now() {
    let _guard = IrqGuard::acquire();
    unsafe {
        let s = state();
        let current = s.current.expect("scheduler not initialized");

        while let Some(dead) = s.dead_list {
            if dead == current {
                break;
            }
            s.dead_list = (*dead.as_ptr()).dead_link;
            (*dead.as_ptr()).dead_link = None;
            reap(dead);
        }

        let now = crate::interrupts::tick_count();
        while let Some(head) = s.first_sleep {
            if (*head.as_ptr()).sleep_until > now {
                break;
            }
            let sleeper = sleep_list_pop();
            if (*sleeper.as_ptr()).wait_list.is_some() {
                wait_list_remove(sleeper, true);
            }
            (*sleeper.as_ptr()).status = TaskStatus::Running;
            run_list_insert(sleeper);
        }

        let next = (*current.as_ptr()).next_run.expect("current task not on run list");
        if next != current {
            switch_current(current, next);
        }
    }
}

/// Performs the actual `switch_to` call and updates `current`. Safe to
/// call only while IRQs are already disabled.
unsafe fn switch_current(from: NonNull<Task>, to: NonNull<Task>) {
    unsafe {
        state().current = Some(to);
        switch_to(&mut (*from.as_ptr()).saved_sp as *mut usize, (*to.as_ptr()).saved_sp);
    }
}

/// Blocks the current task for `ms` milliseconds. `0` degrades to a
/// plain yield.
pub fn sleep(ms: u32) {
    if ms == 0 {
        return yield_now();
    }
    let _guard = IrqGuard::acquire();
    unsafe {
        let s = state();
        let current = s.current.expect("scheduler not initialized");
        (*current.as_ptr()).status = TaskStatus::Sleeping;
        sleep_list_insert(current, crate::interrupts::tick_count() + ms_to_ticks(ms));
        let next = run_list_remove(current);
        switch_current(current, next);
    }
}

/// Busy-waits on the TSC; never suspends the calling task.
pub fn stall(microsecs: u32) {
    crate::interrupts::tsc::stall_microseconds(microsecs);
}

/// Common "block the current task on a wait list, optionally with a
/// timeout" sequence every sync primitive in [`crate::sched::sync`]
/// shares. Must be called with IRQs already disabled. Returns `true`
/// on normal wakeup, `false` on timeout.
pub(crate) fn block_on(list: &mut WaitList, timeout_ms: u32) -> bool {
    unsafe {
        let s = state();
        let current = s.current.expect("scheduler not initialized");
        (*current.as_ptr()).status = TaskStatus::Waiting;
        if timeout_ms != crate::config::TIMEOUT_INFINITE {
            sleep_list_insert(current, crate::interrupts::tick_count() + ms_to_ticks(timeout_ms));
        }
        wait_list_append(list, current);
        let next = run_list_remove(current);
        switch_current(current, next);

        let timed_out = (*current.as_ptr()).wait_timed_out;
        (*current.as_ptr()).wait_timed_out = false;
        !timed_out
    }
}

/// Wakes the head waiter on `list`, detaching it from the sleep list
/// if it had a timeout pending, and moves it back onto the run list.
pub(crate) fn wake_one(list: &mut WaitList) -> bool {
    if list.is_empty() {
        return false;
    }
    let waiter = wait_list_pop(list, false);
    wake_and_run(waiter);
    true
}

/// Wakes every waiter currently on `list` (the `Event` broadcast
/// case).
pub(crate) fn wake_all(list: &mut WaitList) {
    while wake_one(list) {}
}

/// Hands `value` directly to the head waiter instead of waking it
/// onto an empty queue pop — the `Queue::push`-with-a-ready-waiter
/// fast path.
pub(crate) fn wake_one_with_return(list: &mut WaitList, value: usize) -> bool {
    if list.is_empty() {
        return false;
    }
    let waiter = wait_list_pop(list, false);
    unsafe {
        (*waiter.as_ptr()).wait_return = value;
    }
    wake_and_run(waiter);
    true
}

pub(crate) fn take_wait_return() -> usize {
    unsafe { (*state().current.expect("scheduler not initialized").as_ptr()).wait_return }
}

/// Called from `task_wrapper` once the entry function returns: removes
/// the current task from the run list, marks it dead, pushes it onto
/// the dead list for a *different* task to reap, and switches away
/// for good.
pub fn retire_current_task() -> ! {
    let _guard = IrqGuard::acquire();
    unsafe {
        let s = state();
        let current = s.current.expect("scheduler not initialized");
        let next = run_list_remove(current);
        (*current.as_ptr()).status = TaskStatus::Dead;
        (*current.as_ptr()).dead_link = s.dead_list;
        s.dead_list = Some(current);
        switch_current(current, next);
    }
    unreachable!("a dead task was resumed");
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;
    use alloc::vec::Vec;

    use super::*;

    /// Every test here pokes the single process-wide `SCHEDULER`
    /// static directly (the list-bookkeeping helpers, not
    /// `create_task`/`yield_now`, since those need a working
    /// `switch_to` no host stack can resume into). Unlike every other
    /// kernel singleton it is a raw `UnsafeCell`, not a `spin::Mutex`
    /// (see the module doc comment), so it has no mutual exclusion of
    /// its own; `cargo test` runs test functions on separate OS
    /// threads, which a real single-core kernel never does to this
    /// state, so this lock stands in for the "only one flow of control
    /// touches kernel state at a time" fact that interrupts-disabled
    /// gives for free on real hardware.
    static TEST_LOCK: spin::Mutex<()> = spin::Mutex::new(());

    fn boxed_task(id: TaskId) -> NonNull<Task> {
        let task = Box::new(Task::new(id, id.to_string(), 0, 0, 0));
        unsafe { NonNull::new_unchecked(Box::into_raw(task)) }
    }

    unsafe fn free_task(task: NonNull<Task>) {
        unsafe {
            drop(Box::from_raw(task.as_ptr()));
        }
    }

    #[test]
    fn run_list_insert_and_remove_preserve_circularity() {
        let _lock = TEST_LOCK.lock();
        init("boot");
        let a = boxed_task(100);
        let b = boxed_task(101);
        run_list_insert(a);
        run_list_insert(b);

        let anchor = unsafe { kernel_task_ptr() };
        let mut ids = Vec::new();
        let mut cur = anchor;
        loop {
            cur = unsafe { (*cur.as_ptr()).next_run.unwrap() };
            if cur == anchor {
                break;
            }
            ids.push(unsafe { (*cur.as_ptr()).id });
        }
        // Each insert lands right after the anchor, so the later
        // insert is seen first walking from the anchor.
        assert_eq!(ids, alloc::vec![101, 100]);

        run_list_remove(a);
        run_list_remove(b);
        assert_eq!(unsafe { (*anchor.as_ptr()).next_run }, Some(anchor));

        unsafe {
            free_task(a);
            free_task(b);
        }
    }

    #[test]
    fn sleep_list_wakes_in_ascending_deadline_order() {
        // Scenario from spec.md §8: tasks sleeping 50ms, 10ms, 30ms
        // (issued in that order) must wake T2, T3, T1.
        let _lock = TEST_LOCK.lock();
        init("boot");
        unsafe {
            state().first_sleep = None;
        }

        let t1 = boxed_task(1);
        let t2 = boxed_task(2);
        let t3 = boxed_task(3);
        sleep_list_insert(t1, 50);
        sleep_list_insert(t2, 10);
        sleep_list_insert(t3, 30);

        let first = sleep_list_pop();
        let second = sleep_list_pop();
        let third = sleep_list_pop();
        assert_eq!(unsafe { (*first.as_ptr()).id }, 2);
        assert_eq!(unsafe { (*second.as_ptr()).id }, 3);
        assert_eq!(unsafe { (*third.as_ptr()).id }, 1);
        assert!(unsafe { state().first_sleep.is_none() });

        unsafe {
            free_task(t1);
            free_task(t2);
            free_task(t3);
        }
    }

    #[test]
    fn sleep_list_remove_detaches_from_the_middle_without_disturbing_order() {
        let _lock = TEST_LOCK.lock();
        init("boot");
        unsafe {
            state().first_sleep = None;
        }

        let t1 = boxed_task(1);
        let t2 = boxed_task(2);
        let t3 = boxed_task(3);
        sleep_list_insert(t1, 10);
        sleep_list_insert(t2, 20);
        sleep_list_insert(t3, 30);

        sleep_list_remove(t2);
        let first = sleep_list_pop();
        let second = sleep_list_pop();
        assert_eq!(unsafe { (*first.as_ptr()).id }, 1);
        assert_eq!(unsafe { (*second.as_ptr()).id }, 3);
        assert!(unsafe { state().first_sleep.is_none() });

        unsafe {
            free_task(t1);
            free_task(t2);
            free_task(t3);
        }
    }

    #[test]
    fn wait_list_is_strict_fifo_and_timeout_detaches_only_the_target() {
        // No global scheduler state touched here (wait_list_* takes an
        // explicit &mut WaitList), so this one doesn't need TEST_LOCK.
        let t1 = boxed_task(1);
        let t2 = boxed_task(2);
        let t3 = boxed_task(3);
        let mut list = WaitList::new();
        wait_list_append(&mut list, t1);
        wait_list_append(&mut list, t2);
        wait_list_append(&mut list, t3);

        wait_list_remove(t2, true);
        assert!(unsafe { (*t2.as_ptr()).wait_timed_out });
        assert!(unsafe { (*t2.as_ptr()).wait_list.is_none() });

        let first = wait_list_pop(&mut list, false);
        let second = wait_list_pop(&mut list, false);
        assert_eq!(first, t1);
        assert_eq!(second, t3);
        assert!(list.is_empty());
        assert!(!unsafe { (*first.as_ptr()).wait_timed_out });

        unsafe {
            free_task(t1);
            free_task(t2);
            free_task(t3);
        }
    }

    #[test]
    fn wait_list_pop_on_single_waiter_empties_the_list() {
        let t1 = boxed_task(1);
        let mut list = WaitList::new();
        wait_list_append(&mut list, t1);
        let popped = wait_list_pop(&mut list, false);
        assert_eq!(popped, t1);
        assert!(list.is_empty());
        assert!(list.last.is_none());

        unsafe {
            free_task(t1);
        }
    }
}
