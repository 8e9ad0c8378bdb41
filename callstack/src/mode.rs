use std::fmt;

/// Which stack a callstack context records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// The kernel callstack at the point the event fired.
    Kernel,
    /// The callstack of the interrupted userspace program.
    User,
}

impl Mode {
    /// Name of the sequence field.
    pub const fn name(self) -> &'static str {
        match self {
            Mode::Kernel => "callstack_kernel",
            Mode::User => "callstack_user",
        }
    }

    /// Name of the length field the sequence refers to.
    pub const fn length_name(self) -> &'static str {
        match self {
            Mode::Kernel => "_callstack_kernel_length",
            Mode::User => "_callstack_user_length",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Kernel => f.write_str("kernel"),
            Mode::User => f.write_str("user"),
        }
    }
}
