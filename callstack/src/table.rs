//! The context table: the ordered set of context fields attached to every event of a session.

use tracing::debug;

use crate::{Error, EventField, FieldOps, FieldType, IntegerType, RecordWriter};

/// One slot of the context table.
///
/// Slots are appended blank and filled in once the context that owns them is set up.
pub struct ContextField {
    pub event_field: EventField,
    ops: Option<Box<dyn FieldOps>>,
}

impl ContextField {
    fn blank() -> Self {
        Self {
            event_field: EventField { name: "", ty: FieldType::Integer(BLANK_TYPE) },
            ops: None,
        }
    }

    /// Installs the descriptor and callbacks of the field.
    pub fn set(&mut self, event_field: EventField, ops: Box<dyn FieldOps>) {
        self.event_field = event_field;
        self.ops = Some(ops);
    }

    pub fn name(&self) -> &'static str {
        self.event_field.name
    }

    pub fn footprint(&self) -> usize {
        self.ops.as_ref().map_or(0, |ops| ops.footprint())
    }
}

const BLANK_TYPE: IntegerType = IntegerType {
    size_bits: 0,
    alignment_bits: 8,
    signed: false,
    byte_order: crate::ByteOrder::Native,
    base: crate::Base::Decimal,
};

/// Ordered context fields. Shared read-only by every CPU while tracing.
pub struct ContextTable {
    fields: Vec<ContextField>,
    max_fields: usize,
}

impl Default for ContextTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextTable {
    pub fn new() -> Self {
        Self::with_max_fields(usize::MAX)
    }

    /// A table that refuses to grow past `max_fields` fields.
    pub fn with_max_fields(max_fields: usize) -> Self {
        Self { fields: Vec::new(), max_fields }
    }

    /// Appends a blank field and returns its index.
    pub fn append_field(&mut self) -> Result<usize, Error> {
        if self.fields.len() >= self.max_fields {
            return Err(Error::OutOfMemory);
        }
        self.fields.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        self.fields.push(ContextField::blank());
        Ok(self.fields.len() - 1)
    }

    pub fn field(&self, index: usize) -> Option<&ContextField> {
        self.fields.get(index)
    }

    pub fn field_mut(&mut self, index: usize) -> Option<&mut ContextField> {
        self.fields.get_mut(index)
    }

    /// Removes the field at `index`, releasing its callbacks.
    pub fn remove_field(&mut self, index: usize) {
        if index < self.fields.len() {
            self.fields.remove(index);
        }
    }

    /// Whether a field called `name` is present.
    pub fn find(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name() == name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &ContextField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Bytes of memory kept allocated by the fields.
    pub fn footprint(&self) -> usize {
        self.fields.iter().map(ContextField::footprint).sum()
    }

    /// Size of the context of the event being fired, if written at `offset`.
    ///
    /// Must be followed by [`ContextTable::record`] on the same CPU before any other event of the
    /// same interrupt level.
    pub fn get_size(&self, offset: usize) -> usize {
        let mut end = offset;
        for ops in self.fields.iter().filter_map(|f| f.ops.as_deref()) {
            end += ops.get_size(end);
        }
        end - offset
    }

    /// Writes the context of the event being fired.
    pub fn record(&self, writer: &mut dyn RecordWriter) {
        for ops in self.fields.iter().filter_map(|f| f.ops.as_deref()) {
            ops.record(writer);
        }
    }

    /// Releases every field. Calling it again does nothing.
    pub fn destroy(&mut self) {
        if !self.fields.is_empty() {
            debug!("Destroying {} context fields", self.fields.len());
        }
        self.fields.clear();
    }
}

impl Drop for ContextTable {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    };

    use super::*;
    use crate::{Base, ByteOrder, RecordBuffer};

    struct Constant {
        value: u32,
        drops: Arc<AtomicUsize>,
    }

    impl FieldOps for Constant {
        fn get_size(&self, offset: usize) -> usize {
            crate::align_padding(offset, 4) + 4
        }

        fn record(&self, writer: &mut dyn RecordWriter) {
            writer.align(4);
            writer.write_u32(self.value);
        }
    }

    impl Drop for Constant {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Relaxed);
        }
    }

    fn add(table: &mut ContextTable, name: &'static str, value: u32, drops: &Arc<AtomicUsize>) {
        let index = table.append_field().unwrap();
        let field = EventField {
            name,
            ty: FieldType::Integer(IntegerType::unsigned::<u32>(ByteOrder::Native, Base::Decimal)),
        };
        let ops = Constant { value, drops: drops.clone() };
        table.field_mut(index).unwrap().set(field, Box::new(ops));
    }

    #[test]
    fn fields_are_sized_and_recorded_in_order() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut table = ContextTable::new();
        add(&mut table, "a", 1, &drops);
        add(&mut table, "b", 2, &drops);

        assert!(table.find("b"));
        assert!(!table.find("c"));
        assert_eq!(table.get_size(1), 3 + 4 + 4);

        let mut buf = RecordBuffer::new(ByteOrder::Little);
        table.record(&mut buf);
        assert_eq!(buf.as_bytes(), [1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn blank_fields_are_skipped() {
        let mut table = ContextTable::new();
        table.append_field().unwrap();
        assert_eq!(table.get_size(0), 0);
        let mut buf = RecordBuffer::new(ByteOrder::Native);
        table.record(&mut buf);
        assert!(buf.as_bytes().is_empty());
    }

    #[test]
    fn field_limit() {
        let mut table = ContextTable::with_max_fields(1);
        assert_eq!(table.append_field(), Ok(0));
        assert_eq!(table.append_field(), Err(Error::OutOfMemory));
        table.remove_field(0);
        assert!(table.is_empty());
    }

    #[test]
    fn destroy_releases_fields_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut table = ContextTable::new();
        add(&mut table, "a", 1, &drops);
        add(&mut table, "b", 2, &drops);

        table.destroy();
        assert_eq!(drops.load(Relaxed), 2);
        table.destroy();
        drop(table);
        assert_eq!(drops.load(Relaxed), 2);
    }
}
