//! `/proc/stat` parser.

use crate::error::CollectError;
use crate::model::{now_ns, SystemSample};

use super::ProcReader;

fn val(parts: &[&str], idx: usize) -> u64 {
    parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// Parses the content of `/proc/stat`.
///
/// The aggregate `cpu` line carries ten cumulative tick counters; kernels
/// older than 2.6.33 emit only nine, in which case guest-nice stays zero.
/// The caller stamps `capture_time_ns`.
pub fn parse_system_stat(content: &str) -> Result<SystemSample, CollectError> {
    let mut sample = SystemSample::default();
    let mut saw_cpu = false;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let Some(tag) = parts.next() else { continue };
        let rest: Vec<&str> = parts.collect();

        match tag {
            "cpu" => {
                saw_cpu = true;
                sample.usr = val(&rest, 0);
                sample.nice = val(&rest, 1);
                sample.sys = val(&rest, 2);
                sample.idle = val(&rest, 3);
                sample.iowait = val(&rest, 4);
                sample.irq = val(&rest, 5);
                sample.softirq = val(&rest, 6);
                sample.steal = val(&rest, 7);
                sample.guest = val(&rest, 8);
                sample.guest_nice = val(&rest, 9);
            }
            "ctxt" => sample.ctxt = val(&rest, 0),
            "processes" => sample.procs_total = val(&rest, 0),
            "procs_running" => sample.procs_running = val(&rest, 0),
            "procs_blocked" => sample.procs_blocked = val(&rest, 0),
            _ => {}
        }
    }

    if !saw_cpu {
        return Err(CollectError::Malformed { what: "/proc/stat" });
    }

    Ok(sample)
}

/// Reads and parses `/proc/stat`, stamping the capture time immediately after
/// a successful read.
pub fn read_system_stats(reader: &mut ProcReader) -> Result<SystemSample, CollectError> {
    let data = reader
        .read("/proc/stat")
        .map_err(|source| CollectError::SystemRead {
            path: "/proc/stat",
            source,
        })?;

    if data.is_empty() {
        return Err(CollectError::Malformed { what: "/proc/stat" });
    }

    let content = String::from_utf8_lossy(data);
    let mut sample = parse_system_stat(&content)?;
    sample.capture_time_ns = now_ns();
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "\
cpu  10000 500 3000 80000 1000 200 100 7 3 1
cpu0 2500 125 750 20000 250 50 25 0 0 0
intr 123456 0 9
ctxt 500000
btime 1700000000
processes 10000
procs_running 2
procs_blocked 1
softirq 999 0 1
";

    #[test]
    fn test_parse_full_kernel_line() {
        let s = parse_system_stat(FULL).expect("parse");
        assert_eq!(s.usr, 10000);
        assert_eq!(s.nice, 500);
        assert_eq!(s.sys, 3000);
        assert_eq!(s.idle, 80000);
        assert_eq!(s.iowait, 1000);
        assert_eq!(s.irq, 200);
        assert_eq!(s.softirq, 100);
        assert_eq!(s.steal, 7);
        assert_eq!(s.guest, 3);
        assert_eq!(s.guest_nice, 1);
        assert_eq!(s.ctxt, 500000);
        assert_eq!(s.procs_total, 10000);
        assert_eq!(s.procs_running, 2);
        assert_eq!(s.procs_blocked, 1);
    }

    #[test]
    fn test_parse_nine_field_kernel() {
        // Pre-2.6.33 kernels have no guest-nice column.
        let content = "cpu  130 1 493 10614 387 20 13 2 3\nctxt 12\n";
        let s = parse_system_stat(content).expect("parse");
        assert_eq!(s.usr, 130);
        assert_eq!(s.nice, 1);
        assert_eq!(s.sys, 493);
        assert_eq!(s.idle, 10614);
        assert_eq!(s.iowait, 387);
        assert_eq!(s.irq, 20);
        assert_eq!(s.softirq, 13);
        assert_eq!(s.steal, 2);
        assert_eq!(s.guest, 3);
        assert_eq!(s.guest_nice, 0);
    }

    #[test]
    fn test_parse_ignores_per_cpu_lines() {
        let content = "cpu0 99 99 99 99 99 99 99 99 99 99\ncpu  1 2 3 4 5 6 7 8 9 10\n";
        let s = parse_system_stat(content).expect("parse");
        assert_eq!(s.usr, 1);
        assert_eq!(s.guest_nice, 10);
    }

    #[test]
    fn test_parse_missing_cpu_line_fails() {
        assert!(parse_system_stat("ctxt 5\nprocesses 1\n").is_err());
        assert!(parse_system_stat("").is_err());
    }

    #[test]
    fn test_read_live_system_stats() {
        let mut reader = ProcReader::new();
        let s = read_system_stats(&mut reader).expect("read /proc/stat");
        assert!(s.capture_time_ns > 0);
        assert!(s.ctxt > 0);
    }
}
