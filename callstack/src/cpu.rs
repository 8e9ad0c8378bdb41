//! Execution state for hosted tracing.
//!
//! In a process there are no real CPUs or interrupt levels to query, so each simulated CPU is an OS
//! thread that binds itself to a CPU id, and interrupt entry is modelled with a guard that bumps a
//! per-thread nesting counter for as long as the "handler" runs. A thread never migrates, which
//! gives the same guarantee as running with preemption disabled.

use std::{cell::Cell, marker::PhantomData};

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
    static NESTING: Cell<usize> = const { Cell::new(0) };
}

/// Binds the calling thread to `cpu`. Unbound threads run on CPU 0.
pub fn bind_cpu(cpu: usize) {
    CPU.with(|c| c.set(cpu));
}

/// CPU the calling thread is bound to.
pub fn current_cpu() -> usize {
    CPU.with(Cell::get)
}

/// Number of interrupt contexts stacked on top of the thread's base context.
pub fn nesting_depth() -> usize {
    NESTING.with(Cell::get)
}

/// Enters a simulated interrupt context until the returned guard is dropped.
pub fn enter_interrupt() -> InterruptGuard {
    NESTING.with(|n| n.set(n.get() + 1));
    InterruptGuard { _not_send: PhantomData }
}

/// Leaves the interrupt context on drop. Bound to the thread that entered it.
#[must_use = "the interrupt context ends when the guard is dropped"]
pub struct InterruptGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        NESTING.with(|n| n.set(n.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_follows_guards() {
        assert_eq!(nesting_depth(), 0);
        {
            let _irq = enter_interrupt();
            assert_eq!(nesting_depth(), 1);
            {
                let _nmi = enter_interrupt();
                assert_eq!(nesting_depth(), 2);
            }
            assert_eq!(nesting_depth(), 1);
        }
        assert_eq!(nesting_depth(), 0);
    }

    #[test]
    fn binding_is_per_thread() {
        bind_cpu(3);
        assert_eq!(current_cpu(), 3);
        std::thread::spawn(|| assert_eq!(current_cpu(), 0)).join().unwrap();
    }
}
