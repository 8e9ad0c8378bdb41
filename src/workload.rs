//! Simulated CPUs firing events.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::SyncSender,
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};
use stackctx_callstack::{
    cpu, ByteOrder, ContextTable, Frames, HostPlatform, RecordBuffer, SyntheticPlatform,
};

/// Every Nth event is interrupted between sizing and recording by another event.
const INTERRUPT_EVERY: u64 = 7;

/// Platform with made-up but stable kernel and user stacks. The stack shape depends on the CPU,
/// the interrupt level and nothing else.
pub fn synthetic_platform(nr_cpus: usize) -> SyntheticPlatform {
    fn fill(frames: &mut Frames<'_>, base: usize) {
        let nesting = cpu::nesting_depth();
        let len = 3 + cpu::current_cpu() % 4 + nesting;
        for i in 0..len {
            if !frames.push(base + nesting * 0x10_0000 + i * 0x40) {
                break;
            }
        }
    }

    SyntheticPlatform::new(nr_cpus, |frames| fill(frames, 0xc100_0000))
        .with_user_unwinder(|frames| fill(frames, 0x0040_0000))
}

/// One simulated CPU: a thread bound to `cpu` firing events until `stop` is set.
pub struct Worker {
    pub cpu: usize,
    pub host: Arc<HostPlatform>,
    pub table: Arc<ContextTable>,
    pub byte_order: ByteOrder,
    pub stop: Arc<AtomicBool>,
    pub events: SyncSender<Vec<u8>>,
}

impl Worker {
    /// Starts the CPU thread. It returns the number of events the report could not keep up with.
    pub fn spawn(self) -> Result<JoinHandle<u64>> {
        let name = format!("cpu{}", self.cpu);
        thread::Builder::new().name(name.clone()).spawn(move || self.run()).context(name)
    }

    fn run(self) -> u64 {
        self.host.bind_current_thread(self.cpu);

        let mut lost = 0;
        let mut seq = 0u64;
        while !self.stop.load(Ordering::Relaxed) {
            seq += 1;
            // Vary how deep the event fires so callstacks differ.
            let depth = (seq % 5) as usize;
            let interrupted = seq % INTERRUPT_EVERY == 0;
            let records = descend(depth, &|| self.fire(interrupted));
            for record in records.into_iter().flatten() {
                if self.events.try_send(record).is_err() {
                    lost += 1;
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
        lost
    }

    /// Fires one event, optionally letting an interrupt fire its own event between the two
    /// phases. Returns the event record and the interrupt's, if any.
    fn fire(&self, interrupted: bool) -> [Option<Vec<u8>>; 2] {
        let size = self.table.get_size(0);
        let nested = interrupted.then(|| {
            let _irq = cpu::enter_interrupt();
            self.record_now()
        });
        let mut buf = RecordBuffer::with_capacity(self.byte_order, size);
        self.table.record(&mut buf);
        [Some(buf.into_inner()), nested]
    }

    fn record_now(&self) -> Vec<u8> {
        let size = self.table.get_size(0);
        let mut buf = RecordBuffer::with_capacity(self.byte_order, size);
        self.table.record(&mut buf);
        buf.into_inner()
    }
}

/// Calls `f` `depth` frames further down the stack.
#[inline(never)]
fn descend<T>(depth: usize, f: &dyn Fn() -> T) -> T {
    if depth == 0 {
        f()
    } else {
        std::hint::black_box(descend(depth - 1, f))
    }
}
