//! Aggregation algebra over sample windows.
//!
//! Readers replay consecutive ring entries through an [`Aggregator`]: each
//! counter yields a scaled per-interval delta (normalized to the nominal
//! sampling interval so scheduling jitter does not distort rates), a running
//! sum of raw deltas, and a histogram update. Instantaneous fields (thread
//! count, rss, runnable/blocked process counts) carry the latest value
//! instead of accumulating.
//!
//! The per-PID merge walks two PID-sorted lists with a cursor each and emits
//! only PIDs present in both snapshots; births and deaths are silently
//! skipped. This keeps the merge O(n+m) without hashing.

pub mod histogram;

use std::collections::HashMap;

use crate::model::{ProcessSample, RingEntry, SystemSample};

use self::histogram::Histogram;

/// Rollover guard: any apparent decrease reads as zero.
pub fn safe_sub(cur: u64, prev: u64) -> u64 {
    cur.saturating_sub(prev)
}

/// Raw delta rescaled to the nominal interval and rounded to nearest.
pub fn scaled_sub(cur: u64, prev: u64, scale: f64) -> u64 {
    (safe_sub(cur, prev) as f64 * scale + 0.5) as u64
}

/// Ratio of the nominal interval to the observed capture gap. A non-positive
/// gap (clock warp, duplicated entry) falls back to 1.0.
fn scale_for(interval_ms: u32, cur_ns: i64, prev_ns: i64) -> f64 {
    let duration_ms = (cur_ns - prev_ns) as f64 / 1_000_000.0;
    if duration_ms <= 0.0 {
        1.0
    } else {
        f64::from(interval_ms) / duration_ms
    }
}

/// Per-PID histograms over scaled CPU-tick deltas. Only the families that are
/// actually consumed get a histogram; they are not free.
#[derive(Debug, Default)]
pub struct ProcHists {
    pub utime: Histogram,
    pub stime: Histogram,
    /// utime + stime combined.
    pub ustime: Histogram,
    pub cutime: Histogram,
    pub cstime: Histogram,
    /// cutime + cstime combined.
    pub custime: Histogram,
}

/// Per-PID histograms over scaled delay-total deltas.
#[derive(Debug, Default)]
pub struct DelayHists {
    pub cpu_delay: Histogram,
    pub blkio_delay: Histogram,
    pub swapin_delay: Histogram,
}

/// Global histograms over scaled system counter deltas.
#[derive(Debug, Default)]
pub struct SystemHists {
    pub usr: Histogram,
    pub nice: Histogram,
    pub sys: Histogram,
    pub idle: Histogram,
    pub iowait: Histogram,
    pub procs_total: Histogram,
    pub procs_running: Histogram,
    pub procs_blocked: Histogram,
}

/// Accumulated state for one reader: running sums, histograms, and the merge
/// machinery to advance them one entry pair at a time.
pub struct Aggregator {
    interval_ms: u32,
    pub proc_sums: HashMap<u32, ProcessSample>,
    pub proc_hists: HashMap<u32, ProcHists>,
    pub delay_hists: HashMap<u32, DelayHists>,
    pub sys_sum: SystemSample,
    pub sys_hists: SystemHists,
}

impl Aggregator {
    pub fn new(interval_ms: u32) -> Self {
        Self {
            interval_ms,
            proc_sums: HashMap::new(),
            proc_hists: HashMap::new(),
            delay_hists: HashMap::new(),
            sys_sum: SystemSample::default(),
            sys_hists: SystemHists::default(),
        }
    }

    /// Advances the aggregation over one consecutive entry pair. Per-PID
    /// deltas land in `proc_deltas` (cleared first, PID order preserved);
    /// the system delta is returned.
    pub fn record(
        &mut self,
        prev: &RingEntry,
        cur: &RingEntry,
        proc_deltas: &mut Vec<ProcessSample>,
    ) -> SystemSample {
        proc_deltas.clear();

        let cur_samples = cur.procs.as_slice();
        let prev_samples = prev.procs.as_slice();
        let mut cur_pos = 0;
        let mut prev_pos = 0;

        while cur_pos < cur_samples.len() && prev_pos < prev_samples.len() {
            let c = &cur_samples[cur_pos];
            let p = &prev_samples[prev_pos];

            if c.pid == p.pid {
                let delta = self.record_process(c, p);
                proc_deltas.push(delta);
                cur_pos += 1;
                prev_pos += 1;
            } else if c.pid < p.pid {
                cur_pos += 1;
            } else {
                prev_pos += 1;
            }
        }

        self.record_system(&cur.sys, &prev.sys)
    }

    fn record_process(&mut self, cur: &ProcessSample, prev: &ProcessSample) -> ProcessSample {
        let mut delta = ProcessSample {
            pid: cur.pid,
            ..ProcessSample::default()
        };

        let sum = self.proc_sums.entry(cur.pid).or_default();
        sum.pid = cur.pid;

        let scale = scale_for(
            self.interval_ms,
            cur.stat.capture_time_ns,
            prev.stat.capture_time_ns,
        );
        delta.stat.capture_time_ns = cur.stat.capture_time_ns;
        sum.stat.capture_time_ns = cur.stat.capture_time_ns;

        delta.stat.utime = scaled_sub(cur.stat.utime, prev.stat.utime, scale);
        sum.stat.utime += safe_sub(cur.stat.utime, prev.stat.utime);
        delta.stat.stime = scaled_sub(cur.stat.stime, prev.stat.stime, scale);
        sum.stat.stime += safe_sub(cur.stat.stime, prev.stat.stime);
        delta.stat.cutime = scaled_sub(cur.stat.cutime, prev.stat.cutime, scale);
        sum.stat.cutime += safe_sub(cur.stat.cutime, prev.stat.cutime);
        delta.stat.cstime = scaled_sub(cur.stat.cstime, prev.stat.cstime, scale);
        sum.stat.cstime += safe_sub(cur.stat.cstime, prev.stat.cstime);
        delta.stat.guest_time = scaled_sub(cur.stat.guest_time, prev.stat.guest_time, scale);
        sum.stat.guest_time += safe_sub(cur.stat.guest_time, prev.stat.guest_time);
        delta.stat.cguest_time = scaled_sub(cur.stat.cguest_time, prev.stat.cguest_time, scale);
        sum.stat.cguest_time += safe_sub(cur.stat.cguest_time, prev.stat.cguest_time);

        // Instantaneous fields: latest value, not a sum.
        delta.stat.num_threads = cur.stat.num_threads;
        sum.stat.num_threads = cur.stat.num_threads;
        delta.stat.rss = cur.stat.rss;
        sum.stat.rss = cur.stat.rss;

        let dscale = scale_for(
            self.interval_ms,
            cur.delays.capture_time_ns,
            prev.delays.capture_time_ns,
        );
        delta.delays.capture_time_ns = cur.delays.capture_time_ns;
        sum.delays.capture_time_ns = cur.delays.capture_time_ns;

        macro_rules! delay_field {
            ($field:ident) => {
                delta.delays.$field = scaled_sub(cur.delays.$field, prev.delays.$field, dscale);
                sum.delays.$field += safe_sub(cur.delays.$field, prev.delays.$field);
            };
        }
        delay_field!(cpu_delay_count);
        delay_field!(cpu_delay_total_ns);
        delay_field!(blkio_delay_count);
        delay_field!(blkio_delay_total_ns);
        delay_field!(swapin_delay_count);
        delay_field!(swapin_delay_total_ns);
        delay_field!(nvcsw);
        delay_field!(nivcsw);
        delay_field!(freepages_delay_count);
        delay_field!(freepages_delay_total_ns);

        let ph = self.proc_hists.entry(cur.pid).or_default();
        ph.utime.record(delta.stat.utime);
        ph.stime.record(delta.stat.stime);
        ph.ustime.record(delta.stat.utime + delta.stat.stime);
        ph.cutime.record(delta.stat.cutime);
        ph.cstime.record(delta.stat.cstime);
        ph.custime.record(delta.stat.cutime + delta.stat.cstime);

        let dh = self.delay_hists.entry(cur.pid).or_default();
        dh.cpu_delay.record(delta.delays.cpu_delay_total_ns);
        dh.blkio_delay.record(delta.delays.blkio_delay_total_ns);
        dh.swapin_delay.record(delta.delays.swapin_delay_total_ns);

        delta
    }

    fn record_system(&mut self, cur: &SystemSample, prev: &SystemSample) -> SystemSample {
        let mut delta = SystemSample {
            capture_time_ns: cur.capture_time_ns,
            ..SystemSample::default()
        };

        let scale = scale_for(self.interval_ms, cur.capture_time_ns, prev.capture_time_ns);
        let sum = &mut self.sys_sum;
        sum.capture_time_ns = cur.capture_time_ns;

        macro_rules! sys_field {
            ($field:ident) => {
                delta.$field = scaled_sub(cur.$field, prev.$field, scale);
                sum.$field += safe_sub(cur.$field, prev.$field);
            };
        }
        sys_field!(usr);
        sys_field!(nice);
        sys_field!(sys);
        sys_field!(idle);
        sys_field!(iowait);
        sys_field!(irq);
        sys_field!(softirq);
        sys_field!(steal);
        sys_field!(guest);
        sys_field!(guest_nice);
        sys_field!(ctxt);
        sys_field!(procs_total);

        // Instantaneous gauges.
        delta.procs_running = cur.procs_running;
        sum.procs_running = cur.procs_running;
        delta.procs_blocked = cur.procs_blocked;
        sum.procs_blocked = cur.procs_blocked;

        let h = &mut self.sys_hists;
        h.usr.record(delta.usr);
        h.nice.record(delta.nice);
        h.sys.record(delta.sys);
        h.idle.record(delta.idle);
        h.iowait.record(delta.iowait);
        h.procs_total.record(delta.procs_total);
        h.procs_running.record(delta.procs_running);
        h.procs_blocked.record(delta.procs_blocked);

        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessSampleList;

    const MS: i64 = 1_000_000;

    fn sample(pid: u32, t_ns: i64, utime: u64) -> ProcessSample {
        let mut s = ProcessSample {
            pid,
            ..ProcessSample::default()
        };
        s.stat.capture_time_ns = t_ns;
        s.stat.utime = utime;
        s.delays.capture_time_ns = t_ns;
        s
    }

    fn entry(samples: Vec<ProcessSample>, sys_t_ns: i64) -> RingEntry {
        RingEntry {
            procs: ProcessSampleList::from(samples),
            sys: SystemSample {
                capture_time_ns: sys_t_ns,
                ..SystemSample::default()
            },
        }
    }

    #[test]
    fn test_safe_sub_rollover_guard() {
        assert_eq!(safe_sub(10, 4), 6);
        assert_eq!(safe_sub(4, 10), 0);
        assert_eq!(safe_sub(7, 7), 0);
    }

    #[test]
    fn test_scaled_sub_rounds_to_nearest() {
        assert_eq!(scaled_sub(1000, 400, 0.5), 300);
        assert_eq!(scaled_sub(3, 0, 0.5), 2); // 1.5 rounds up
        assert_eq!(scaled_sub(100, 0, 1.0), 100);
    }

    #[test]
    fn test_scaled_delta_normalization() {
        // Captured over 400 ms at a 200 ms nominal interval: the scaled delta
        // halves, the running sum takes the raw delta.
        let mut agg = Aggregator::new(200);
        let prev = entry(vec![sample(1, 0, 400)], 0);
        let cur = entry(vec![sample(1, 400 * MS, 1000)], 400 * MS);

        let mut deltas = Vec::new();
        agg.record(&prev, &cur, &mut deltas);

        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].stat.utime, 300);
        assert_eq!(agg.proc_sums[&1].stat.utime, 600);
    }

    #[test]
    fn test_exact_interval_keeps_raw_delta() {
        let mut agg = Aggregator::new(200);
        let prev = entry(vec![sample(1, 0, 100)], 0);
        let cur = entry(vec![sample(1, 200 * MS, 175)], 200 * MS);

        let mut deltas = Vec::new();
        agg.record(&prev, &cur, &mut deltas);
        assert_eq!(deltas[0].stat.utime, 75);
        assert_eq!(agg.proc_sums[&1].stat.utime, 75);
    }

    #[test]
    fn test_double_interval_halves_delta() {
        let mut agg = Aggregator::new(200);
        let prev = entry(vec![sample(1, 0, 0)], 0);
        let cur = entry(vec![sample(1, 400 * MS, 101)], 400 * MS);

        let mut deltas = Vec::new();
        agg.record(&prev, &cur, &mut deltas);
        // round(101 / 2) = 51
        assert_eq!(deltas[0].stat.utime, 51);
    }

    #[test]
    fn test_merge_emits_intersection_only() {
        let mut agg = Aggregator::new(200);
        let prev = entry(
            vec![
                sample(1, 0, 0),
                sample(2, 0, 0),
                sample(5, 0, 0),
                sample(8, 0, 0),
            ],
            0,
        );
        let cur = entry(
            vec![
                sample(2, 200 * MS, 10),
                sample(5, 200 * MS, 10),
                sample(7, 200 * MS, 10),
                sample(8, 200 * MS, 10),
            ],
            200 * MS,
        );

        let mut deltas = Vec::new();
        agg.record(&prev, &cur, &mut deltas);

        let pids: Vec<u32> = deltas.iter().map(|d| d.pid).collect();
        assert_eq!(pids, vec![2, 5, 8]);
        assert!(!agg.proc_sums.contains_key(&1));
        assert!(!agg.proc_sums.contains_key(&7));
    }

    #[test]
    fn test_counter_rollover_reads_as_zero() {
        let mut agg = Aggregator::new(200);
        let prev = entry(vec![sample(1, 0, 5000)], 0);
        let cur = entry(vec![sample(1, 200 * MS, 10)], 200 * MS); // restarted

        let mut deltas = Vec::new();
        agg.record(&prev, &cur, &mut deltas);
        assert_eq!(deltas[0].stat.utime, 0);
        assert_eq!(agg.proc_sums[&1].stat.utime, 0);
    }

    #[test]
    fn test_instantaneous_fields_keep_latest() {
        let mut agg = Aggregator::new(200);
        let mut p = sample(1, 0, 0);
        p.stat.num_threads = 8;
        p.stat.rss = 5000;
        let mut c = sample(1, 200 * MS, 0);
        c.stat.num_threads = 3;
        c.stat.rss = 4000;

        let prev = entry(vec![p], 0);
        let cur = entry(vec![c], 200 * MS);

        let mut deltas = Vec::new();
        agg.record(&prev, &cur, &mut deltas);

        assert_eq!(agg.proc_sums[&1].stat.num_threads, 3);
        assert_eq!(agg.proc_sums[&1].stat.rss, 4000);
        assert_eq!(deltas[0].stat.rss, 4000);
    }

    #[test]
    fn test_delay_deltas_feed_histograms() {
        let mut agg = Aggregator::new(200);
        let mut p = sample(1, 0, 0);
        p.delays.cpu_delay_total_ns = 1_000_000;
        let mut c = sample(1, 200 * MS, 0);
        c.delays.cpu_delay_total_ns = 3_000_000;

        let prev = entry(vec![p], 0);
        let cur = entry(vec![c], 200 * MS);

        let mut deltas = Vec::new();
        agg.record(&prev, &cur, &mut deltas);

        assert_eq!(deltas[0].delays.cpu_delay_total_ns, 2_000_000);
        let hist = &agg.delay_hists[&1].cpu_delay;
        assert_eq!(hist.total_count(), 1);
        // Within the histogram's 1% resolution of the recorded delta.
        let recorded = hist.max() as f64;
        assert!((recorded - 2_000_000.0).abs() <= 2_000_000.0 * 0.01);
    }

    #[test]
    fn test_system_delta_and_gauges() {
        let mut agg = Aggregator::new(200);
        let prev_sys = SystemSample {
            capture_time_ns: 0,
            usr: 100,
            idle: 1000,
            ctxt: 50_000,
            procs_running: 4,
            procs_blocked: 1,
            ..SystemSample::default()
        };
        let cur_sys = SystemSample {
            capture_time_ns: 200 * MS,
            usr: 140,
            idle: 1160,
            ctxt: 51_000,
            procs_running: 2,
            procs_blocked: 0,
            ..SystemSample::default()
        };

        let prev = RingEntry {
            procs: ProcessSampleList::default(),
            sys: prev_sys,
        };
        let cur = RingEntry {
            procs: ProcessSampleList::default(),
            sys: cur_sys,
        };

        let mut deltas = Vec::new();
        let sys_delta = agg.record(&prev, &cur, &mut deltas);

        assert_eq!(sys_delta.usr, 40);
        assert_eq!(sys_delta.idle, 160);
        assert_eq!(sys_delta.ctxt, 1000);
        assert_eq!(sys_delta.procs_running, 2);
        assert_eq!(agg.sys_sum.usr, 40);
        assert_eq!(agg.sys_sum.procs_running, 2);
        assert_eq!(agg.sys_hists.usr.total_count(), 1);
    }

    #[test]
    fn test_zero_duration_falls_back_to_raw() {
        let mut agg = Aggregator::new(200);
        let prev = entry(vec![sample(1, 500, 10)], 500);
        let cur = entry(vec![sample(1, 500, 30)], 500);

        let mut deltas = Vec::new();
        agg.record(&prev, &cur, &mut deltas);
        assert_eq!(deltas[0].stat.utime, 20);
    }
}
