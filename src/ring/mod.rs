//! Bounded circular log of sample entries.
//!
//! One writer (the sampler) and any number of readers (query handlers) share
//! the ring through a single reader/writer lock. The writer mutates the
//! current slot in place under the exclusive lock, so a reader can never
//! observe a torn entry; readers copy the entries they want while holding the
//! shared lock because the slots may be overwritten the moment it is
//! released. Slots are fully allocated at construction; steady-state writes
//! allocate nothing.

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::model::RingEntry;

struct RingState {
    entries: Vec<RingEntry>,
    write_pos: usize,
    count: usize,
}

pub struct SampleRing {
    state: RwLock<RingState>,
}

impl SampleRing {
    /// A ring of `capacity` entries, each pre-sized for `max_procs`
    /// process samples.
    ///
    /// # Panics
    /// Panics when `capacity` is zero.
    pub fn new(capacity: usize, max_procs: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be at least 1");

        let entries = (0..capacity)
            .map(|_| RingEntry::with_capacity(max_procs))
            .collect();

        Self {
            state: RwLock::new(RingState {
                entries,
                write_pos: 0,
                count: 0,
            }),
        }
    }

    /// Takes the exclusive lock and hands out the current write slot.
    /// Dropping the [`WriteSlot`] without calling [`WriteSlot::commit`]
    /// abandons the write; the slot is reused next cycle.
    pub fn reserve_write(&self) -> WriteSlot<'_> {
        WriteSlot {
            guard: self.state.write(),
        }
    }

    /// Number of committed entries, at most the capacity.
    pub fn len(&self) -> usize {
        self.state.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Copies out the `min(k, len)` most recent entries in chronological
    /// order, oldest first. Each copy holds only the committed process
    /// prefix.
    pub fn snapshot_last(&self, k: u32) -> Vec<RingEntry> {
        let state = self.state.read();
        let n = (k as usize).min(state.count);
        let capacity = state.entries.len();

        let mut out = Vec::with_capacity(n);
        let start = (state.write_pos + capacity - n) % capacity;
        for i in 0..n {
            out.push(state.entries[(start + i) % capacity].trimmed());
        }
        out
    }
}

/// Exclusive access to the slot being written. Holding this blocks readers,
/// which is the invariant that makes entries untearable.
pub struct WriteSlot<'a> {
    guard: RwLockWriteGuard<'a, RingState>,
}

impl WriteSlot<'_> {
    /// The entry under construction, for in-place mutation.
    pub fn entry(&mut self) -> &mut RingEntry {
        let pos = self.guard.write_pos;
        &mut self.guard.entries[pos]
    }

    /// Publishes the entry: advances the write position and grows the count
    /// up to capacity. Releases the lock.
    pub fn commit(mut self) {
        let capacity = self.guard.entries.len();
        self.guard.write_pos = (self.guard.write_pos + 1) % capacity;
        self.guard.count = (self.guard.count + 1).min(capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SystemSample;

    fn write_marker(ring: &SampleRing, marker: i64) {
        let mut slot = ring.reserve_write();
        let entry = slot.entry();
        entry.procs.clear();
        entry.sys = SystemSample {
            capture_time_ns: marker,
            ..SystemSample::default()
        };
        slot.commit();
    }

    fn markers(entries: &[RingEntry]) -> Vec<i64> {
        entries.iter().map(|e| e.sys.capture_time_ns).collect()
    }

    #[test]
    fn test_count_grows_to_capacity() {
        let ring = SampleRing::new(3, 4);
        assert!(ring.is_empty());

        for i in 1..=5 {
            write_marker(&ring, i);
            assert_eq!(ring.len(), (i as usize).min(3));
        }
    }

    #[test]
    fn test_snapshot_wraps_oldest_first() {
        let ring = SampleRing::new(3, 4);
        // Writes A..E into capacity 3: the survivors are C, D, E.
        for marker in [1, 2, 3, 4, 5] {
            write_marker(&ring, marker);
        }

        let snap = ring.snapshot_last(10);
        assert_eq!(markers(&snap), vec![3, 4, 5]);
    }

    #[test]
    fn test_snapshot_clamps_to_held() {
        let ring = SampleRing::new(8, 4);
        write_marker(&ring, 1);
        write_marker(&ring, 2);

        assert_eq!(ring.snapshot_last(100).len(), 2);
        assert_eq!(markers(&ring.snapshot_last(1)), vec![2]);
        assert!(ring.snapshot_last(0).is_empty());
    }

    #[test]
    fn test_abandoned_write_is_invisible() {
        let ring = SampleRing::new(2, 4);
        {
            let mut slot = ring.reserve_write();
            slot.entry().sys.capture_time_ns = 42;
            // Dropped without commit.
        }
        assert!(ring.is_empty());
        assert!(ring.snapshot_last(10).is_empty());
    }

    #[test]
    fn test_snapshot_trims_process_prefix() {
        let ring = SampleRing::new(2, 8);
        {
            let mut slot = ring.reserve_write();
            let entry = slot.entry();
            entry.procs.clear();
            entry.procs.slot().expect("slot").pid = 7;
            entry.procs.commit_slot();
            slot.commit();
        }

        let snap = ring.snapshot_last(1);
        assert_eq!(snap[0].procs.samples.len(), 1);
        assert_eq!(snap[0].procs.as_slice()[0].pid, 7);
    }

    #[test]
    fn test_concurrent_reader_never_sees_torn_entry() {
        use std::sync::Arc;

        let ring = Arc::new(SampleRing::new(4, 2));
        let writer_ring = Arc::clone(&ring);

        let writer = std::thread::spawn(move || {
            for i in 0..500i64 {
                let mut slot = writer_ring.reserve_write();
                let entry = slot.entry();
                entry.procs.clear();
                // Both fields carry the marker; a torn entry would disagree.
                entry.sys.capture_time_ns = i;
                entry.sys.ctxt = i as u64;
                slot.commit();
            }
        });

        let reader = std::thread::spawn(move || {
            for _ in 0..200 {
                for entry in ring.snapshot_last(4) {
                    assert_eq!(entry.sys.capture_time_ns as u64, entry.sys.ctxt);
                }
            }
        });

        writer.join().expect("writer");
        reader.join().expect("reader");
    }
}
