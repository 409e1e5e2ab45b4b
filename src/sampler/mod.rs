//! Drift-corrected sampling loop.
//!
//! Runs on its own OS thread: the taskstats socket blocks and the sleep
//! arithmetic wants a plain thread rather than a runtime timer. Each cycle
//! enumerates `/proc`, fills the ring's current write slot in place, and
//! sleeps for whatever remains of the interval. A cycle that overruns sheds
//! load by sleeping one interval plus 100 ms before trying again.
//!
//! Steady state performs no heap allocation: the PID list, the path scratch
//! string, the procfs read buffer, the netlink scratch, and the sample-list
//! backing arrays in every ring slot are all allocated up front and reused.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Config, Filters};
use crate::error::CollectError;
use crate::export::health::HealthMetrics;
use crate::identity::IdentityCache;
use crate::model::{now_ns, ProcessSample};
use crate::proc::pidstat::parse_pid_stat;
use crate::proc::system::read_system_stats;
use crate::proc::{pid_list, ProcReader};
use crate::ring::SampleRing;
use crate::taskstats::TaskstatsConn;

/// What one cycle observed, for metrics and periodic reporting.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub procs: usize,
    pub tasks: usize,
    pub task_errors: usize,
}

pub struct Sampler {
    interval: Duration,
    max_procs: usize,
    prune_chance: f64,
    expiry_ns: i64,
    ring: Arc<SampleRing>,
    identities: Arc<IdentityCache>,
    filters: Filters,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    conn: TaskstatsConn,
    reader: ProcReader,
    pids: Vec<u32>,
    path: String,
    truncation_logged: bool,
}

/// Remaining sleep after a cycle took `elapsed`, or `None` on overrun.
fn adjusted_sleep(interval: Duration, elapsed: Duration) -> Option<Duration> {
    let remaining = interval.checked_sub(elapsed)?;
    if remaining.is_zero() {
        None
    } else {
        Some(remaining)
    }
}

impl Sampler {
    pub fn new(
        cfg: &Config,
        filters: Filters,
        conn: TaskstatsConn,
        ring: Arc<SampleRing>,
        identities: Arc<IdentityCache>,
        health: Arc<HealthMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            interval: cfg.sampling_interval,
            max_procs: cfg.max_procs,
            prune_chance: cfg.prune_chance,
            expiry_ns: cfg.identity_expiry().as_nanos() as i64,
            ring,
            identities,
            filters,
            health,
            cancel,
            conn,
            reader: ProcReader::new(),
            pids: Vec::with_capacity(cfg.max_procs),
            path: String::with_capacity(32),
            truncation_logged: false,
        }
    }

    /// Runs cycles until cancellation. Only fatal errors return.
    pub fn run(mut self) -> Result<(), CollectError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let started = Instant::now();

            match self.cycle() {
                Ok(stats) => {
                    self.health.samples_written.inc();
                    self.health.pids_sampled.set(stats.procs as f64);
                    self.health.ring_entries.set(self.ring.len() as f64);
                    self.health
                        .identity_cache_size
                        .set(self.identities.len() as f64);
                    if stats.task_errors > 0 {
                        self.health.taskstats_errors.inc_by(stats.task_errors as f64);
                    }
                    debug!(
                        procs = stats.procs,
                        tasks = stats.tasks,
                        task_errors = stats.task_errors,
                        "sample cycle complete",
                    );
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "sample cycle failed, retrying next tick");
                }
            }

            let elapsed = started.elapsed();
            self.health.cycle_duration.observe(elapsed.as_secs_f64());

            match adjusted_sleep(self.interval, elapsed) {
                Some(remaining) => std::thread::sleep(remaining),
                None => {
                    // Overload policy: shed load for one interval.
                    warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        interval_ms = self.interval.as_millis() as u64,
                        "sample cycle overran the interval",
                    );
                    self.health.cycle_overruns.inc();
                    std::thread::sleep(self.interval + Duration::from_millis(100));
                }
            }
        }
    }

    /// One collection pass. The write slot is reserved up front and committed
    /// only when the whole cycle succeeds; an error abandons the slot.
    fn cycle(&mut self) -> Result<CycleStats, CollectError> {
        let max_procs = self.max_procs;
        let prune_chance = self.prune_chance;
        let expiry_ns = self.expiry_ns;

        let Self {
            ring,
            identities,
            filters,
            conn,
            reader,
            pids,
            path,
            health,
            truncation_logged,
            ..
        } = self;

        let truncated = pid_list(pids, max_procs)?;
        if truncated && !*truncation_logged {
            warn!(
                max_procs,
                "process table truncated; raise max_procs to see everything",
            );
            *truncation_logged = true;
        }

        let mut stats = CycleStats::default();
        let mut slot = ring.reserve_write();
        let entry = slot.entry();
        entry.procs.clear();

        for &pid in pids.iter() {
            if !filters.pid_match(pid) {
                continue;
            }

            path.clear();
            let _ = write!(path, "/proc/{pid}/stat");

            // A PID that vanished between enumeration and read is normal
            // churn, not an error.
            let (pid_stat, uid) = {
                let (data, uid) = match reader.read_with_uid(path.as_str()) {
                    Ok(x) => x,
                    Err(_) => continue,
                };
                let content = String::from_utf8_lossy(data);
                let line = content.lines().next().unwrap_or("");
                match parse_pid_stat(line) {
                    Ok(s) => (s, uid),
                    Err(_) => continue,
                }
            };

            identities.ensure(&pid_stat, uid, reader);

            if !filters.user_match(uid) {
                continue;
            }

            // Stop filling once the pre-sized list is full; enumeration was
            // already capped at max_procs, so this only trips when filters
            // are disabled and the table is at the cap.
            let Some(sample) = entry.procs.slot() else {
                break;
            };

            *sample = ProcessSample::default();
            sample.pid = pid;
            sample.stat.capture_time_ns = now_ns();
            sample.stat.utime = pid_stat.utime;
            sample.stat.stime = pid_stat.stime;
            sample.stat.cutime = pid_stat.cutime;
            sample.stat.cstime = pid_stat.cstime;
            sample.stat.num_threads = pid_stat.num_threads;
            sample.stat.rss = pid_stat.rss;
            sample.stat.guest_time = pid_stat.guest_time;
            sample.stat.cguest_time = pid_stat.cguest_time;

            match conn.lookup(pid, &mut sample.delays) {
                Ok(()) => stats.tasks += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(CollectError::TaskstatsUnavailable { errno, .. }) => {
                    // Usually -ESRCH from exit churn; the delay block stays
                    // zeroed for this interval.
                    debug!(pid, errno, "taskstats observation absent");
                    sample.delays.capture_time_ns = sample.stat.capture_time_ns;
                    stats.task_errors += 1;
                }
                Err(e) => {
                    debug!(pid, error = %e, "taskstats observation absent");
                    sample.delays.capture_time_ns = sample.stat.capture_time_ns;
                    stats.task_errors += 1;
                }
            }

            entry.procs.commit_slot();
            stats.procs += 1;
        }

        entry.sys = read_system_stats(reader)?;
        slot.commit();

        let pruned = identities.maybe_prune(prune_chance, pids, expiry_ns);
        if pruned > 0 {
            health.identities_pruned.inc_by(pruned as f64);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjusted_sleep_remaining() {
        let interval = Duration::from_millis(200);
        assert_eq!(
            adjusted_sleep(interval, Duration::from_millis(50)),
            Some(Duration::from_millis(150)),
        );
    }

    #[test]
    fn test_adjusted_sleep_overrun() {
        let interval = Duration::from_millis(200);
        assert_eq!(adjusted_sleep(interval, Duration::from_millis(200)), None);
        assert_eq!(adjusted_sleep(interval, Duration::from_millis(350)), None);
    }
}
