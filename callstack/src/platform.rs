//! Unwind primitives and execution state the callstack context runs on.

use std::{fmt, thread};

use crate::{cpu, Frames};

/// What a platform can unwind.
///
/// Resolved once, when a [`CallstackProvider`](crate::CallstackProvider) is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Whether user stacks can be captured at all.
    pub user_unwind: bool,
}

/// The execution environment: CPU topology, interrupt nesting and stack unwinding.
///
/// Every method may run in interrupt context. Implementations must not block or allocate.
pub trait Platform: Send + Sync {
    /// Number of CPUs events may fire on. Ids run from 0 to `nr_cpus() - 1`.
    fn nr_cpus(&self) -> usize;

    /// CPU the caller runs on.
    fn current_cpu(&self) -> usize;

    /// Interrupt contexts stacked on top of the base context of the current CPU.
    fn nesting_depth(&self) -> usize;

    /// Pushes the return addresses of the kernel stack, innermost first. Pushes nothing when the
    /// stack cannot be walked.
    fn unwind_kernel_stack(&self, frames: &mut Frames<'_>);

    /// Pushes the return addresses of the interrupted user stack, innermost first.
    fn unwind_user_stack(&self, _frames: &mut Frames<'_>) {}

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

/// Unwinds the stack of the current process by walking frame pointers.
///
/// There is no kernel stack to see from a process, so kernel callstacks are always empty. User
/// callstacks need frame pointers (`-C force-frame-pointers=yes`); without them the walk stops at
/// the first frame that leaves the thread's stack and the callstack is short or empty.
///
/// Threads must call [`HostPlatform::bind_current_thread`] before firing events: it records the
/// thread's stack bounds so that unwinding never dereferences memory outside of them.
#[derive(Debug, Clone)]
pub struct HostPlatform {
    nr_cpus: usize,
}

impl HostPlatform {
    pub fn new(nr_cpus: usize) -> Self {
        Self { nr_cpus }
    }

    /// One CPU per available hardware thread.
    pub fn from_available_parallelism() -> Self {
        Self::new(thread::available_parallelism().map_or(1, |n| n.get()))
    }

    /// Binds the calling thread to `cpu` and records its stack bounds.
    pub fn bind_current_thread(&self, cpu: usize) {
        cpu::bind_cpu(cpu);
        walk::bind_stack_bounds();
    }
}

impl Platform for HostPlatform {
    fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    fn current_cpu(&self) -> usize {
        cpu::current_cpu()
    }

    fn nesting_depth(&self) -> usize {
        cpu::nesting_depth()
    }

    fn unwind_kernel_stack(&self, _frames: &mut Frames<'_>) {}

    fn unwind_user_stack(&self, frames: &mut Frames<'_>) {
        walk::frame_pointers(frames);
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { user_unwind: walk::SUPPORTED }
    }
}

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
mod walk {
    use std::{
        cell::Cell,
        mem::{self, MaybeUninit},
        ptr,
    };

    use crate::Frames;

    pub const SUPPORTED: bool = true;

    thread_local! {
        static STACK_BOUNDS: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
    }

    pub fn bind_stack_bounds() {
        STACK_BOUNDS.with(|b| b.set(current_stack_bounds()));
    }

    fn current_stack_bounds() -> Option<(usize, usize)> {
        let mut attr = MaybeUninit::<libc::pthread_attr_t>::zeroed();
        // SAFETY: `attr` is initialized by pthread_getattr_np and destroyed before returning.
        unsafe {
            if libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) != 0 {
                return None;
            }
            let mut addr = ptr::null_mut();
            let mut size = 0;
            let ret = libc::pthread_attr_getstack(attr.as_ptr(), &mut addr, &mut size);
            libc::pthread_attr_destroy(attr.as_mut_ptr());
            if ret != 0 || addr.is_null() {
                return None;
            }
            Some((addr as usize, addr as usize + size))
        }
    }

    #[inline(never)]
    pub fn frame_pointers(frames: &mut Frames<'_>) {
        let Some((low, high)) = STACK_BOUNDS.with(Cell::get) else { return };
        let mut fp = read_frame_pointer();

        while frames.remaining() > 0 {
            // A frame record is [saved fp, return address].
            let in_stack = fp >= low && fp <= high.saturating_sub(2 * mem::size_of::<usize>());
            if !in_stack || fp % mem::align_of::<usize>() != 0 {
                break;
            }

            // SAFETY: both words lie inside this thread's stack mapping.
            let (next, ret) = unsafe {
                let record = fp as *const usize;
                (record.read(), record.add(1).read())
            };
            if ret == 0 || !frames.push(ret) {
                break;
            }
            // The stack grows down, so callers' frames are always higher.
            if next <= fp {
                break;
            }
            fp = next;
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    fn read_frame_pointer() -> usize {
        let fp: usize;
        unsafe {
            core::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
        }
        fp
    }

    #[cfg(target_arch = "aarch64")]
    #[inline(always)]
    fn read_frame_pointer() -> usize {
        let fp: usize;
        unsafe {
            core::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
        }
        fp
    }
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
mod walk {
    use crate::Frames;

    pub const SUPPORTED: bool = false;

    pub fn bind_stack_bounds() {}

    pub fn frame_pointers(_frames: &mut Frames<'_>) {}
}

type Unwinder = dyn Fn(&mut Frames<'_>) + Send + Sync;

/// Platform whose stacks are produced by closures, for tests and demos.
///
/// CPU and nesting come from the [`cpu`] module, so unwinders can vary their output with
/// [`cpu::current_cpu`] and [`cpu::nesting_depth`].
pub struct SyntheticPlatform {
    nr_cpus: usize,
    kernel: Box<Unwinder>,
    user: Option<Box<Unwinder>>,
}

impl SyntheticPlatform {
    pub fn new(nr_cpus: usize, kernel: impl Fn(&mut Frames<'_>) + Send + Sync + 'static) -> Self {
        Self { nr_cpus, kernel: Box::new(kernel), user: None }
    }

    /// Enables user callstacks, unwound by `user`.
    pub fn with_user_unwinder(
        self,
        user: impl Fn(&mut Frames<'_>) + Send + Sync + 'static,
    ) -> Self {
        Self { user: Some(Box::new(user)), ..self }
    }

    /// A platform that always returns the same kernel and user stack.
    pub fn fixed(nr_cpus: usize, stack: &[usize]) -> Self {
        let kernel = stack.to_vec();
        let user = stack.to_vec();
        Self::new(nr_cpus, move |frames| {
            frames.extend_from_slice(&kernel);
        })
        .with_user_unwinder(move |frames| {
            frames.extend_from_slice(&user);
        })
    }
}

impl fmt::Debug for SyntheticPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntheticPlatform")
            .field("nr_cpus", &self.nr_cpus)
            .field("user", &self.user.is_some())
            .finish()
    }
}

impl Platform for SyntheticPlatform {
    fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    fn current_cpu(&self) -> usize {
        cpu::current_cpu()
    }

    fn nesting_depth(&self) -> usize {
        cpu::nesting_depth()
    }

    fn unwind_kernel_stack(&self, frames: &mut Frames<'_>) {
        (self.kernel)(frames);
    }

    fn unwind_user_stack(&self, frames: &mut Frames<'_>) {
        if let Some(user) = &self.user {
            user(frames);
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { user_unwind: self.user.is_some() }
    }
}
