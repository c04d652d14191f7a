//! The context switch itself: save four callee-saved registers and
//! the stack pointer, load the next task's, return into whatever
//! address is sitting on top of its stack.
//!
//! Ported from the teacher's `arch/x86_64/threading/mod.rs`
//! `global_asm!` switch stub, narrowed to 32-bit and to the four
//! registers cdecl leaves callee-saved on i386 (`ebp`, `ebx`, `esi`,
//! `edi`) instead of the System V AMD64 set. A freshly created task's
//! stack is built by [`crate::sched::scheduler::create_task`] to look
//! exactly like one `switch_to` just saved, with the return address
//! pointing at [`task_wrapper`] instead of a suspended caller.

use crate::sched::task::TaskFn;

#[cfg(not(test))]
core::arch::global_asm!(
    ".global switch_to",
    "switch_to:",
    "push ebp",
    "push ebx",
    "push esi",
    "push edi",
    "mov eax, [esp + 20]", // old_sp_slot: *mut usize
    "mov edx, [esp + 24]", // new_sp: usize
    "mov [eax], esp",
    "mov esp, edx",
    "pop edi",
    "pop esi",
    "pop ebx",
    "pop ebp",
    "ret",
);

#[cfg(not(test))]
extern "C" {
    /// Saves the current stack pointer to `*old_sp_slot`, switches to
    /// `new_sp`, and returns into whatever that stack resumes at.
    pub fn switch_to(old_sp_slot: *mut usize, new_sp: usize);
}

/// No host process can actually resume execution on a stack frame
/// built for the real i386 cdecl switch stub above, so `cargo test`
/// never calls this — no scheduler test exercises a real context
/// switch, only the run/sleep/wait-list bookkeeping around it. Stands
/// in only so the crate links against a host target.
#[cfg(test)]
pub unsafe extern "C" fn switch_to(_old_sp_slot: *mut usize, _new_sp: usize) {
    unimplemented!("switch_to has no host stand-in; no test should reach a real context switch")
}

/// First thing a freshly created task's constructed stack "returns"
/// into. Runs the task's entry point, then retires the task the same
/// way the original `SchTaskFnWrapper` does: disable interrupts,
/// unlink from the run list, mark dead, push the dead list, switch
/// away for good.
#[no_mangle]
pub extern "C" fn task_wrapper(entry: TaskFn, ctx: usize) -> ! {
    let id = crate::sched::scheduler::current_task_id();
    crate::logln!("task #{} started", id);
    let ret = entry(ctx);
    crate::logln!("task #{} finished with return code {} ({:#x})", id, ret, ret);
    crate::sched::scheduler::retire_current_task();
}
