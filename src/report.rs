//! Reads recorded events back and tallies their callstacks.

use std::collections::HashMap;

use stackctx_callstack::{ByteOrder, DecodeError, Mode, RecordReader};
use tracing::error;

/// Callstacks of one event, one per enabled context.
type Stacks = Vec<Vec<usize>>;

pub struct Report {
    modes: Vec<Mode>,
    byte_order: ByteOrder,
    stacks: HashMap<Stacks, u64>,
    events: u64,
}

impl Report {
    pub fn new(modes: Vec<Mode>, byte_order: ByteOrder) -> Self {
        Self { modes, byte_order, stacks: HashMap::new(), events: 0 }
    }

    pub fn add(&mut self, record: &[u8]) {
        match self.decode(record) {
            Ok(stacks) => {
                *self.stacks.entry(stacks).or_default() += 1;
                self.events += 1;
            }
            Err(e) => error!("Failed to decode event: {e}"),
        }
    }

    fn decode(&self, record: &[u8]) -> Result<Stacks, DecodeError> {
        let mut reader = RecordReader::new(record, self.byte_order);
        self.modes.iter().map(|_| reader.read_callstack()).collect()
    }

    pub fn print(&self, top: usize) {
        let mut stacks = self.stacks.iter().collect::<Vec<_>>();
        stacks.sort_by_key(|(_stacks, count)| **count);
        stacks.reverse();

        println!(
            "==> {top} top callstacks out of {} over {} events:",
            stacks.len(),
            self.events
        );
        for (event_stacks, count) in stacks.into_iter().take(top) {
            println!("    {count:>8} events");
            for (mode, frames) in self.modes.iter().zip(event_stacks) {
                println!("        {mode}: {} frames", frames.len());
                for &ip in frames {
                    if ip == usize::MAX {
                        println!("                (truncated)");
                    } else {
                        println!("                0x{ip:016x}");
                    }
                }
            }
        }

        println!("");
    }
}

#[cfg(test)]
mod tests {
    use stackctx_callstack::{RecordBuffer, RecordWriter};

    use super::*;

    fn record(order: ByteOrder, stacks: &[&[usize]]) -> Vec<u8> {
        let mut buf = RecordBuffer::new(order);
        for stack in stacks {
            buf.align(4);
            buf.write_u32(stack.len() as u32);
            buf.align(std::mem::size_of::<usize>());
            for &ip in *stack {
                buf.write_word(ip);
            }
        }
        buf.into_inner()
    }

    #[test]
    fn tallies_identical_stacks() {
        let mut report = Report::new(vec![Mode::Kernel, Mode::User], ByteOrder::Big);
        let event = record(ByteOrder::Big, &[&[0xc100_0000], &[0x40_0000, 0x40_0040]]);
        report.add(&event);
        report.add(&event);
        report.add(&record(ByteOrder::Big, &[&[], &[0x40_0000]]));

        assert_eq!(report.events, 3);
        assert_eq!(report.stacks.len(), 2);
        assert_eq!(report.stacks[&vec![vec![0xc100_0000], vec![0x40_0000, 0x40_0040]]], 2);
    }

    #[test]
    fn skips_garbage() {
        let mut report = Report::new(vec![Mode::User], ByteOrder::Native);
        report.add(&[1, 2]);
        assert_eq!(report.events, 0);
        assert!(report.stacks.is_empty());
    }
}
