//! Process identity cache.
//!
//! Maps PID to the stable-ish attributes of a process: lineage, command name,
//! argument vector, derived friendly name, scheduling attributes, and owner.
//! Entries are created the first time a PID is observed, get `last_seen`
//! refreshed on every observation, and are otherwise immutable. Growth is
//! bounded by probabilistic pruning rather than a full scan every interval.

pub mod friendly;

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use crate::model::now_ns;
use crate::proc::pidstat::PidStat;
use crate::proc::ProcReader;

use self::friendly::{friendly_name, split_cmdline, strip_special};

/// Stable process metadata, captured once per PID lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub ppid: u32,
    pub pgrp: i64,
    pub session: i64,
    pub tty_nr: i64,
    pub tpgid: i64,
    pub flags: u64,
    /// Short command name from `/proc/[pid]/stat`, special characters
    /// stripped.
    pub comm: String,
    /// Raw argument vector from `/proc/[pid]/cmdline`.
    pub cmdline: Vec<String>,
    /// Heuristic short name grouping interpreter-launched workloads.
    pub friendly: String,
    pub nice: i64,
    pub rt_priority: u64,
    pub policy: u64,
    pub starttime: u64,
    pub uid: u32,
    pub first_seen_ns: i64,
    pub last_seen_ns: i64,
}

/// PID -> identity map shared between the sampler and response encoding.
pub struct IdentityCache {
    inner: Mutex<HashMap<u32, ProcessIdentity>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the entry for `stat.pid` if absent (reading the argument
    /// vector once) and refreshes `last_seen`.
    pub fn ensure(&self, stat: &PidStat, uid: u32, reader: &mut ProcReader) {
        let now = now_ns();

        {
            let mut map = self.inner.lock();
            if let Some(entry) = map.get_mut(&stat.pid) {
                entry.last_seen_ns = now;
                return;
            }
        }

        // Build outside the lock; cmdline is one extra read per new PID.
        let comm = strip_special(&stat.comm);
        let path = format!("/proc/{}/cmdline", stat.pid);
        let cmdline = match reader.read(&path) {
            Ok(raw) => split_cmdline(raw),
            // Exited before we looked, or unreadable: the comm still names it.
            Err(_) => Vec::new(),
        };
        let friendly = friendly_name(&cmdline, &comm);

        let identity = ProcessIdentity {
            pid: stat.pid,
            ppid: stat.ppid,
            pgrp: stat.pgrp,
            session: stat.session,
            tty_nr: stat.tty_nr,
            tpgid: stat.tpgid,
            flags: stat.flags,
            comm,
            cmdline,
            friendly,
            nice: stat.nice,
            rt_priority: stat.rt_priority,
            policy: stat.policy,
            starttime: stat.starttime,
            uid,
            first_seen_ns: now,
            last_seen_ns: now,
        };

        self.inner.lock().entry(stat.pid).or_insert(identity);
    }

    /// With probability `chance`, removes every entry that is absent from
    /// `live_pids` and was last seen more than `expiry_ns` ago. Returns the
    /// number of removed entries (0 when the draw skips the scan).
    pub fn maybe_prune(&self, chance: f64, live_pids: &[u32], expiry_ns: i64) -> usize {
        if rand::random::<f64>() >= chance {
            return 0;
        }
        self.prune(live_pids, expiry_ns)
    }

    /// Unconditional prune pass; see [`maybe_prune`].
    ///
    /// [`maybe_prune`]: IdentityCache::maybe_prune
    pub fn prune(&self, live_pids: &[u32], expiry_ns: i64) -> usize {
        let live: HashSet<u32> = live_pids.iter().copied().collect();
        let oldest = now_ns().saturating_sub(expiry_ns);

        let mut map = self.inner.lock();
        let before = map.len();
        map.retain(|pid, info| live.contains(pid) || info.last_seen_ns >= oldest);
        let removed = before - map.len();

        if removed > 0 {
            debug!(removed, "pruned identity cache");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn get(&self, pid: u32) -> Option<ProcessIdentity> {
        self.inner.lock().get(&pid).cloned()
    }

    /// Clones the full table, e.g. for response encoding.
    pub fn snapshot(&self) -> Vec<ProcessIdentity> {
        self.inner.lock().values().cloned().collect()
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}
