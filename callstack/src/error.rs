use crate::Mode;

/// Errors reported when adding a callstack context.
///
/// Nothing on the capture path fails: a stack that cannot be unwound is recorded as empty.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("context {0} already exists")]
    AlreadyExists(&'static str),

    #[error("{0} callstacks are not supported on this platform")]
    Unsupported(Mode),

    #[error("out of memory")]
    OutOfMemory,
}

/// Errors reading a record back.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record truncated: need {need} bytes at offset {offset}, {have} available")]
    Truncated { offset: usize, need: usize, have: usize },
}
