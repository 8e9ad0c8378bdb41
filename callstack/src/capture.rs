use crate::{FrameBuffer, Mode, PerCpuStackSet, Platform};

/// Fills `slot` with the `mode` callstack of the current context and returns the number of
/// addresses stored. Never allocates; a stack that cannot be unwound yields 0.
pub(crate) fn capture(
    mode: Mode,
    platform: &dyn Platform,
    set: &PerCpuStackSet,
    slot: &FrameBuffer,
) -> usize {
    let mut frames = slot.frames();
    match mode {
        Mode::Kernel => platform.unwind_kernel_stack(&mut frames),
        // Events fired while this CPU reads a user stack get an empty one.
        Mode::User if set.in_user_unwind() => {}
        Mode::User => {
            set.enter_user_unwind();
            platform.unwind_user_stack(&mut frames);
            set.exit_user_unwind();
        }
    }
    let len = frames.len();
    slot.set_len(len);
    len
}
