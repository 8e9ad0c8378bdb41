//! The callstack context: a length field and a sequence field sharing per-CPU frame buffers.

use std::{num::NonZeroUsize, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    align_padding, capture::capture, Base, ByteOrder, Capabilities, ContextTable, Error,
    EventField, FieldOps, FieldType, FrameBuffer, IntegerType, Mode, Platform, RecordWriter,
    StackPool, WORD_SIZE,
};

/// Default number of entries recorded per callstack.
pub const DEFAULT_MAX_DEPTH: NonZeroUsize = match NonZeroUsize::new(128) {
    Some(depth) => depth,
    None => unreachable!(),
};

/// Marks a callstack that filled every entry and may have been cut short.
const TRUNCATION_MARKER: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallstackConfig {
    /// Entries per captured callstack.
    pub max_depth: NonZeroUsize,
    /// Append [`usize::MAX`] to callstacks that fill `max_depth` entries, so readers can tell
    /// them from stacks that happened to fit.
    pub mark_truncated: bool,
}

impl Default for CallstackConfig {
    fn default() -> Self {
        Self { max_depth: DEFAULT_MAX_DEPTH, mark_truncated: false }
    }
}

/// State shared by the two fields of one callstack context.
struct CallstackData {
    mode: Mode,
    mark_truncated: bool,
    pool: StackPool,
    platform: Arc<dyn Platform>,
}

impl CallstackData {
    /// Buffer of the capture running in the current context.
    fn slot(&self) -> Option<(&crate::PerCpuStackSet, &FrameBuffer)> {
        self.pool.select(self.platform.current_cpu(), self.platform.nesting_depth())
    }

    /// Entries written for `slot`, including the truncation marker.
    fn recorded_len(&self, slot: &FrameBuffer) -> usize {
        slot.len() + usize::from(self.mark_truncated && slot.is_full())
    }
}

impl Drop for CallstackData {
    fn drop(&mut self) {
        debug!(
            "Releasing {} callstack buffers ({} CPUs, {} bytes)",
            self.mode,
            self.pool.nr_cpus(),
            self.pool.footprint()
        );
    }
}

/// Length of the callstack, written before the sequence.
struct LengthField(Arc<CallstackData>);

impl FieldOps for LengthField {
    fn get_size(&self, offset: usize) -> usize {
        align_padding(offset, 4) + 4
    }

    fn record(&self, writer: &mut dyn RecordWriter) {
        let data = &self.0;
        let len = data.slot().map_or(0, |(_, slot)| data.recorded_len(slot));
        writer.align(4);
        writer.write_u32(len as u32);
    }
}

/// Captured addresses. Owns the frame buffers: they are released when this field is torn down.
struct SequenceField(Arc<CallstackData>);

impl FieldOps for SequenceField {
    /// Captures the callstack. The stored count is what both `record` calls write out.
    fn get_size(&self, offset: usize) -> usize {
        let data = &self.0;
        let pad = align_padding(offset, WORD_SIZE);
        let Some((set, slot)) = data.slot() else { return pad };
        capture(data.mode, &*data.platform, set, slot);
        pad + data.recorded_len(slot) * WORD_SIZE
    }

    fn record(&self, writer: &mut dyn RecordWriter) {
        let data = &self.0;
        writer.align(WORD_SIZE);
        let Some((_, slot)) = data.slot() else { return };
        for addr in slot.iter() {
            writer.write_word(addr);
        }
        if data.mark_truncated && slot.is_full() {
            writer.write_word(TRUNCATION_MARKER);
        }
    }

    fn footprint(&self) -> usize {
        self.0.pool.footprint()
    }
}

/// Adds callstack contexts to context tables.
pub struct CallstackProvider {
    platform: Arc<dyn Platform>,
    capabilities: Capabilities,
    config: CallstackConfig,
}

impl CallstackProvider {
    pub fn new(platform: Arc<dyn Platform>, config: CallstackConfig) -> Self {
        let capabilities = platform.capabilities();
        debug!("Platform capabilities: {capabilities:?}");
        Self { platform, capabilities, config }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn config(&self) -> &CallstackConfig {
        &self.config
    }

    /// Bytes of frame buffers one context allocates.
    pub fn footprint(&self) -> usize {
        [crate::MAX_NEST, self.config.max_depth.get(), WORD_SIZE]
            .into_iter()
            .fold(self.platform.nr_cpus(), usize::saturating_mul)
    }

    /// Adds the `mode` callstack context to `table`.
    ///
    /// Either both fields are added and wired to freshly allocated per-CPU buffers, or `table` is
    /// left as it was.
    pub fn add_callstack_context(&self, table: &mut ContextTable, mode: Mode) -> Result<(), Error> {
        if mode == Mode::User && !self.capabilities.user_unwind {
            warn!("Cannot record {mode} callstacks on this platform");
            return Err(Error::Unsupported(mode));
        }
        if table.find(mode.name()) {
            return Err(Error::AlreadyExists(mode.name()));
        }

        let length_index = table.append_field()?;
        let sequence_index = match table.append_field() {
            Ok(index) => index,
            Err(e) => {
                table.remove_field(length_index);
                return Err(e);
            }
        };
        let pool = match StackPool::try_new(self.platform.nr_cpus(), self.config.max_depth.get()) {
            Ok(pool) => pool,
            Err(e) => {
                warn!("Failed to allocate {mode} callstack buffers");
                table.remove_field(sequence_index);
                table.remove_field(length_index);
                return Err(e);
            }
        };
        let footprint = pool.footprint();
        let data = Arc::new(CallstackData {
            mode,
            mark_truncated: self.config.mark_truncated,
            pool,
            platform: self.platform.clone(),
        });

        let (length, sequence) = fields(mode);
        if let Some(field) = table.field_mut(length_index) {
            field.set(length, Box::new(LengthField(data.clone())));
        }
        if let Some(field) = table.field_mut(sequence_index) {
            field.set(sequence, Box::new(SequenceField(data)));
        }

        info!(
            "Added {} context (depth {}, {} CPUs, {footprint} bytes)",
            mode.name(),
            self.config.max_depth,
            self.platform.nr_cpus()
        );
        Ok(())
    }
}

/// Descriptors of the length and sequence fields of `mode`.
fn fields(mode: Mode) -> (EventField, EventField) {
    let length = EventField {
        name: mode.length_name(),
        ty: FieldType::Integer(IntegerType::unsigned::<u32>(ByteOrder::Native, Base::Decimal)),
    };
    let sequence = EventField {
        name: mode.name(),
        ty: FieldType::Sequence {
            length_name: mode.length_name(),
            elem: IntegerType::unsigned::<usize>(ByteOrder::Native, Base::Hexadecimal),
        },
    };
    (length, sequence)
}
