//! Callstack event context.
//!
//! The callstack context can be attached to any traced event. It records either the kernel or the
//! userspace callstack, up to a max depth, as a length-prefixed sequence so that each record only
//! uses the space required for the captured entries.
//!
//! Buffers are allocated per CPU for up to [`MAX_NEST`] levels of interrupt nesting when the
//! context is enabled, so tracing never allocates. The memory used is fixed and proportional to the
//! number of CPUs:
//!
//! ```text
//! size = cpus * nest * depth * size_of::<usize>()
//! ```
//!
//! Which is 4096 bytes per CPU on a 64-bit host and the default depth of 128.
//!
//! Unwinding is delegated to a [`Platform`]. When a platform cannot unwind (missing frame pointers,
//! no access to the requested stack) the callstack is simply empty. Symbol resolution is left to
//! the trace reader.

mod callstack;
mod capture;
pub mod cpu;
mod error;
mod field;
mod frames;
mod mode;
mod platform;
mod record;
mod table;

pub use callstack::{CallstackConfig, CallstackProvider, DEFAULT_MAX_DEPTH};
pub use error::{DecodeError, Error};
pub use field::{Base, EventField, FieldOps, FieldType, IntegerType};
pub use frames::{FrameBuffer, Frames, PerCpuStackSet, StackPool, MAX_NEST};
pub use mode::Mode;
pub use platform::{Capabilities, HostPlatform, Platform, SyntheticPlatform};
pub use record::{align_padding, ByteOrder, RecordBuffer, RecordReader, RecordWriter};
pub use table::{ContextField, ContextTable};

/// Width in bytes of one captured address.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();
