//! Shared sample layouts.
//!
//! Counter records are fixed-schema value types: one [`ProcessSample`] per PID
//! per interval, one [`SystemSample`] per interval, bundled into a
//! [`RingEntry`]. The sampler mutates pre-allocated entries in place, so every
//! type here is `Copy` except the list wrapper that owns the backing storage.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Fast-changing per-PID counters from `/proc/[pid]/stat`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcCounters {
    /// Instant at which `/proc/[pid]/stat` was read.
    pub capture_time_ns: i64,
    /// User-mode CPU ticks.
    pub utime: u64,
    /// Kernel-mode CPU ticks.
    pub stime: u64,
    /// User-mode ticks of waited-for children.
    pub cutime: u64,
    /// Kernel-mode ticks of waited-for children.
    pub cstime: u64,
    /// Thread count (instantaneous).
    pub num_threads: u64,
    /// Resident set size in pages (instantaneous).
    pub rss: u64,
    /// Guest-time ticks.
    pub guest_time: u64,
    /// Guest-time ticks of waited-for children.
    pub cguest_time: u64,
}

/// Per-PID delay-accounting counters from taskstats.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DelayCounters {
    /// Instant at which the taskstats reply was parsed.
    pub capture_time_ns: i64,
    /// Delay count waiting for CPU while runnable.
    pub cpu_delay_count: u64,
    /// Delay total waiting for CPU while runnable, in ns.
    pub cpu_delay_total_ns: u64,
    /// Delay count waiting for block I/O.
    pub blkio_delay_count: u64,
    /// Delay total waiting for block I/O, in ns.
    pub blkio_delay_total_ns: u64,
    /// Delay count waiting for swap-in.
    pub swapin_delay_count: u64,
    /// Delay total waiting for swap-in, in ns.
    pub swapin_delay_total_ns: u64,
    /// Voluntary context switches.
    pub nvcsw: u64,
    /// Involuntary context switches.
    pub nivcsw: u64,
    /// Delay count waiting for free-page reclaim.
    pub freepages_delay_count: u64,
    /// Delay total waiting for free-page reclaim.
    pub freepages_delay_total_ns: u64,
}

/// One PID's observation for one interval.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSample {
    pub pid: u32,
    pub stat: ProcCounters,
    pub delays: DelayCounters,
}

/// System-wide counters from `/proc/stat`, cumulative since boot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SystemSample {
    pub capture_time_ns: i64,
    pub usr: u64,
    pub nice: u64,
    pub sys: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
    /// Context switches since boot.
    pub ctxt: u64,
    /// Processes started since boot.
    pub procs_total: u64,
    /// Currently runnable (instantaneous).
    pub procs_running: u64,
    /// Currently blocked on I/O (instantaneous).
    pub procs_blocked: u64,
}

/// Ordered sequence of [`ProcessSample`], sorted by PID ascending.
///
/// The backing vector is sized once at startup and reused every cycle; `len`
/// tracks the effective prefix. PID ordering comes from `/proc` directory
/// enumeration order and is what makes the O(n+m) cursor merge in the
/// aggregation layer valid.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessSampleList {
    pub samples: Vec<ProcessSample>,
    pub len: u32,
}

impl ProcessSampleList {
    /// A list whose backing storage holds `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: vec![ProcessSample::default(); capacity],
            len: 0,
        }
    }

    /// Resets the effective length without touching the backing storage.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// The next writable slot, or `None` when the backing storage is full.
    ///
    /// The slot stays outside the effective prefix until [`commit_slot`]
    /// runs, so a caller that bails out mid-fill leaves no partial sample
    /// visible.
    ///
    /// [`commit_slot`]: ProcessSampleList::commit_slot
    pub fn slot(&mut self) -> Option<&mut ProcessSample> {
        self.samples.get_mut(self.len as usize)
    }

    /// Extends the effective prefix over the last slot handed out.
    pub fn commit_slot(&mut self) {
        debug_assert!((self.len as usize) < self.samples.len());
        self.len += 1;
    }

    /// The committed samples.
    pub fn as_slice(&self) -> &[ProcessSample] {
        &self.samples[..self.len as usize]
    }

    /// A copy holding only the committed prefix.
    pub fn trimmed(&self) -> Self {
        Self {
            samples: self.as_slice().to_vec(),
            len: self.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl From<Vec<ProcessSample>> for ProcessSampleList {
    fn from(samples: Vec<ProcessSample>) -> Self {
        let len = samples.len() as u32;
        Self { samples, len }
    }
}

/// One sampler interval: the per-process list plus the system counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RingEntry {
    pub procs: ProcessSampleList,
    pub sys: SystemSample,
}

impl RingEntry {
    /// An entry whose process list is pre-sized for `max_procs` PIDs.
    pub fn with_capacity(max_procs: usize) -> Self {
        Self {
            procs: ProcessSampleList::with_capacity(max_procs),
            sys: SystemSample::default(),
        }
    }

    /// A copy holding only the committed process prefix.
    pub fn trimmed(&self) -> Self {
        Self {
            procs: self.procs.trimmed(),
            sys: self.sys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_list_slot_commit() {
        let mut list = ProcessSampleList::with_capacity(2);
        assert!(list.is_empty());

        let slot = list.slot().expect("slot available");
        slot.pid = 10;
        list.commit_slot();

        let slot = list.slot().expect("slot available");
        slot.pid = 20;
        list.commit_slot();

        assert!(list.slot().is_none());
        assert_eq!(list.len, 2);
        assert_eq!(list.as_slice()[0].pid, 10);
        assert_eq!(list.as_slice()[1].pid, 20);
    }

    #[test]
    fn test_sample_list_abandoned_slot_not_visible() {
        let mut list = ProcessSampleList::with_capacity(4);
        let slot = list.slot().expect("slot available");
        slot.pid = 99;
        // No commit: the write must not appear in the effective prefix.
        assert!(list.as_slice().is_empty());
    }

    #[test]
    fn test_sample_list_clear_keeps_capacity() {
        let mut list = ProcessSampleList::with_capacity(8);
        list.slot().expect("slot").pid = 1;
        list.commit_slot();
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.samples.len(), 8);
    }

    #[test]
    fn test_trimmed_drops_uncommitted_tail() {
        let mut list = ProcessSampleList::with_capacity(16);
        for pid in [3u32, 7, 9] {
            list.slot().expect("slot").pid = pid;
            list.commit_slot();
        }

        let copy = list.trimmed();
        assert_eq!(copy.samples.len(), 3);
        assert_eq!(copy.len, 3);
        assert_eq!(copy.as_slice()[2].pid, 9);
    }

    #[test]
    fn test_now_ns_is_positive() {
        assert!(now_ns() > 0);
    }
}
