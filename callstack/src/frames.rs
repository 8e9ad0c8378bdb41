//! Pre-allocated frame storage, one buffer per CPU and nesting level.
//!
//! Every capture on a CPU picks its buffer from the interrupt nesting depth it runs at, so an
//! interrupt that fires in the middle of a capture (and records its own callstack) never writes
//! into the buffer of the context it interrupted. No lock is taken: a lock would deadlock against
//! the very interrupt nesting being captured.

use std::{
    mem,
    sync::atomic::{AtomicUsize, Ordering::Relaxed},
};

use crate::Error;

/// Maximum interrupt nesting handled per CPU, mirroring the ring buffer nesting limit.
pub const MAX_NEST: usize = 4;

/// Fixed-capacity storage for one captured callstack.
///
/// Entries are word-sized atomics used with relaxed ordering. They compile to plain loads and
/// stores; two captures that end up sharing a slot (nesting deeper than [`MAX_NEST`]) can only
/// observe stale addresses.
#[derive(Debug)]
pub struct FrameBuffer {
    entries: Box<[AtomicUsize]>,
    len: AtomicUsize,
}

impl FrameBuffer {
    fn try_new(depth: usize) -> Result<Self, Error> {
        let mut entries = Vec::new();
        entries.try_reserve_exact(depth).map_err(|_| Error::OutOfMemory)?;
        entries.extend((0..depth).map(|_| AtomicUsize::new(0)));
        Ok(Self { entries: entries.into_boxed_slice(), len: AtomicUsize::new(0) })
    }

    /// Number of addresses the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of addresses stored by the last capture.
    pub fn len(&self) -> usize {
        self.len.load(Relaxed).min(self.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Addresses stored by the last capture, innermost frame first.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries[..self.len()].iter().map(|e| e.load(Relaxed))
    }

    /// Starts a new capture: the returned sink writes from the first entry on.
    pub(crate) fn frames(&self) -> Frames<'_> {
        Frames { entries: &self.entries, len: 0 }
    }

    pub(crate) fn set_len(&self, len: usize) {
        self.len.store(len.min(self.entries.len()), Relaxed);
    }
}

/// Bounded sink an unwinder pushes return addresses into.
///
/// It never holds more than the capacity of the buffer it writes to; extra frames are dropped.
pub struct Frames<'a> {
    entries: &'a [AtomicUsize],
    len: usize,
}

impl Frames<'_> {
    /// Appends an address. Returns `false` once the sink is full and the address was dropped.
    pub fn push(&mut self, addr: usize) -> bool {
        let Some(entry) = self.entries.get(self.len) else { return false };
        entry.store(addr, Relaxed);
        self.len += 1;
        true
    }

    /// Appends as many of `addrs` as fit, returning how many were stored.
    pub fn extend_from_slice(&mut self, addrs: &[usize]) -> usize {
        let n = addrs.len().min(self.remaining());
        for &addr in &addrs[..n] {
            self.push(addr);
        }
        n
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }
}

/// All frame buffers of one CPU.
#[derive(Debug)]
pub struct PerCpuStackSet {
    slots: Box<[FrameBuffer]>,
    /// Set while this CPU is unwinding a user stack. An event fired from within that unwind (e.g.
    /// a fault on a user page) must not recurse into it.
    user_nesting: AtomicUsize,
}

impl PerCpuStackSet {
    fn try_new(depth: usize) -> Result<Self, Error> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(MAX_NEST).map_err(|_| Error::OutOfMemory)?;
        for _ in 0..MAX_NEST {
            slots.push(FrameBuffer::try_new(depth)?);
        }
        Ok(Self { slots: slots.into_boxed_slice(), user_nesting: AtomicUsize::new(0) })
    }

    /// Buffer used at `nesting`. Depths past the last level share the deepest buffer.
    pub fn slot(&self, nesting: usize) -> &FrameBuffer {
        &self.slots[nesting.min(MAX_NEST - 1)]
    }

    pub(crate) fn in_user_unwind(&self) -> bool {
        self.user_nesting.load(Relaxed) > 0
    }

    pub(crate) fn enter_user_unwind(&self) {
        self.user_nesting.fetch_add(1, Relaxed);
    }

    pub(crate) fn exit_user_unwind(&self) {
        self.user_nesting.fetch_sub(1, Relaxed);
    }
}

/// Frame buffers for every CPU, allocated once when a context is enabled.
#[derive(Debug)]
pub struct StackPool {
    cpus: Box<[PerCpuStackSet]>,
    depth: usize,
}

impl StackPool {
    /// Allocates `MAX_NEST` buffers of `depth` entries for each of `nr_cpus` CPUs.
    pub fn try_new(nr_cpus: usize, depth: usize) -> Result<Self, Error> {
        // Reject budgets that cannot be addressed before touching the allocator.
        nr_cpus
            .checked_mul(MAX_NEST)
            .and_then(|n| n.checked_mul(depth))
            .and_then(|n| n.checked_mul(mem::size_of::<usize>()))
            .filter(|&bytes| bytes <= isize::MAX as usize)
            .ok_or(Error::OutOfMemory)?;

        let mut cpus = Vec::new();
        cpus.try_reserve_exact(nr_cpus).map_err(|_| Error::OutOfMemory)?;
        for _ in 0..nr_cpus {
            cpus.push(PerCpuStackSet::try_new(depth)?);
        }
        Ok(Self { cpus: cpus.into_boxed_slice(), depth })
    }

    /// Picks the buffer for a capture running on `cpu` at interrupt depth `nesting`.
    ///
    /// The caller must stay on `cpu` until the buffer has been copied out. A CPU outside the pool
    /// yields `None`.
    pub fn select(&self, cpu: usize, nesting: usize) -> Option<(&PerCpuStackSet, &FrameBuffer)> {
        let set = self.cpus.get(cpu)?;
        Some((set, set.slot(nesting)))
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Entries per buffer.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Bytes of frame storage owned by the pool.
    pub fn footprint(&self) -> usize {
        self.cpus.len() * MAX_NEST * self.depth * mem::size_of::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_is_bounded() {
        let buf = FrameBuffer::try_new(3).unwrap();
        let mut frames = buf.frames();
        assert!(frames.push(1));
        assert_eq!(frames.extend_from_slice(&[2, 3, 4, 5]), 2);
        assert!(!frames.push(6));
        assert_eq!(frames.remaining(), 0);
        buf.set_len(frames.len());

        assert!(buf.is_full());
        assert_eq!(buf.iter().collect::<Vec<_>>(), [1, 2, 3]);
    }

    #[test]
    fn new_capture_overwrites_from_start() {
        let buf = FrameBuffer::try_new(4).unwrap();
        let mut frames = buf.frames();
        frames.extend_from_slice(&[1, 2, 3, 4]);
        buf.set_len(frames.len());

        let mut frames = buf.frames();
        frames.push(9);
        buf.set_len(frames.len());

        assert_eq!(buf.iter().collect::<Vec<_>>(), [9]);
    }

    #[test]
    fn nesting_levels_get_distinct_slots() {
        let pool = StackPool::try_new(2, 8).unwrap();
        let slots = (0..MAX_NEST)
            .map(|n| pool.select(1, n).unwrap().1 as *const FrameBuffer)
            .collect::<Vec<_>>();
        for (i, a) in slots.iter().enumerate() {
            for b in &slots[i + 1..] {
                assert_ne!(a, b);
            }
        }

        let other_cpu = pool.select(0, 0).unwrap().1 as *const FrameBuffer;
        assert!(!slots.contains(&other_cpu));
    }

    #[test]
    fn deep_nesting_shares_last_slot() {
        let pool = StackPool::try_new(1, 8).unwrap();
        let last = pool.select(0, MAX_NEST - 1).unwrap().1 as *const FrameBuffer;
        assert_eq!(pool.select(0, MAX_NEST).unwrap().1 as *const _, last);
        assert_eq!(pool.select(0, 100).unwrap().1 as *const _, last);
    }

    #[test]
    fn unknown_cpu() {
        let pool = StackPool::try_new(2, 8).unwrap();
        assert!(pool.select(2, 0).is_none());
    }

    #[test]
    fn footprint() {
        let pool = StackPool::try_new(2, 128).unwrap();
        assert_eq!(pool.footprint(), 2 * 4096 * mem::size_of::<usize>() / 8);
        assert_eq!(pool.nr_cpus(), 2);
        assert_eq!(pool.depth(), 128);
    }

    #[test]
    fn oversized_pool_is_out_of_memory() {
        assert_eq!(StackPool::try_new(4, usize::MAX / 4).unwrap_err(), Error::OutOfMemory);
    }
}
