//! Context field descriptors and the callbacks a field provides to the context table.

use std::fmt;

use crate::{ByteOrder, RecordWriter};

/// Display base of an integer, a hint for trace readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    Decimal,
    Hexadecimal,
}

impl Base {
    fn radix(self) -> u8 {
        match self {
            Base::Decimal => 10,
            Base::Hexadecimal => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerType {
    pub size_bits: u32,
    pub alignment_bits: u32,
    pub signed: bool,
    /// `Native` leaves the order to the trace default.
    pub byte_order: ByteOrder,
    pub base: Base,
}

impl IntegerType {
    /// Unsigned integer of the same layout as `T`.
    pub fn unsigned<T>(byte_order: ByteOrder, base: Base) -> Self {
        Self {
            size_bits: (std::mem::size_of::<T>() * 8) as u32,
            alignment_bits: (std::mem::align_of::<T>() * 8) as u32,
            signed: false,
            byte_order,
            base,
        }
    }
}

impl fmt::Display for IntegerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let IntegerType { size_bits, alignment_bits, signed, byte_order, base } = self;
        write!(f, "integer {{ size = {size_bits}; align = {alignment_bits}; signed = {signed}; ")?;
        match byte_order {
            ByteOrder::Native => (),
            ByteOrder::Little => write!(f, "byte_order = le; ")?,
            ByteOrder::Big => write!(f, "byte_order = be; ")?,
        }
        write!(f, "encoding = none; base = {}; }}", base.radix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer(IntegerType),
    /// Elements whose count is the value of the field named `length_name`.
    Sequence { length_name: &'static str, elem: IntegerType },
}

/// Name and type of a context field as declared in the trace schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventField {
    pub name: &'static str,
    pub ty: FieldType,
}

impl fmt::Display for EventField {
    /// Renders the field as a TSDL declaration.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ty {
            FieldType::Integer(int) => write!(f, "{int} {};", self.name),
            FieldType::Sequence { length_name, elem } => {
                write!(f, "{elem} {}[ {length_name} ];", self.name)
            }
        }
    }
}

/// Per-event callbacks of a context field.
///
/// For each event, the table calls `get_size` on every field, then `record` on every field, in
/// table order and on the same CPU. Both run in the context the event fired in, which may be an
/// interrupt: they must not block or allocate. Field teardown is `Drop`.
pub trait FieldOps: Send + Sync {
    /// Bytes the field occupies when written at `offset`, alignment padding included.
    fn get_size(&self, offset: usize) -> usize;

    /// Writes the field payload.
    fn record(&self, writer: &mut dyn RecordWriter);

    /// Bytes of memory the field keeps allocated.
    fn footprint(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsdl() {
        let length = EventField {
            name: "_callstack_kernel_length",
            ty: FieldType::Integer(IntegerType::unsigned::<u32>(ByteOrder::Native, Base::Decimal)),
        };
        assert_eq!(
            length.to_string(),
            "integer { size = 32; align = 32; signed = false; encoding = none; base = 10; } \
             _callstack_kernel_length;"
        );

        let sequence = EventField {
            name: "callstack_kernel",
            ty: FieldType::Sequence {
                length_name: "_callstack_kernel_length",
                elem: IntegerType::unsigned::<u64>(ByteOrder::Big, Base::Hexadecimal),
            },
        };
        assert_eq!(
            sequence.to_string(),
            "integer { size = 64; align = 64; signed = false; byte_order = be; encoding = none; \
             base = 16; } callstack_kernel[ _callstack_kernel_length ];"
        );
    }
}
