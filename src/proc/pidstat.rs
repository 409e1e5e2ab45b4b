//! `/proc/[pid]/stat` tokenizer and parser.
//!
//! The file is one logical line whose second field, `comm`, is parenthesized
//! and may itself contain spaces and parentheses, so a whitespace split is
//! wrong. The tokenizer is a small state machine that treats everything from
//! an opening `(` through the *last* `)` on the line as one token, which
//! copes with commands such as `((sd-pam))` and `[celeryd: celer)`. An
//! unterminated `(` skips to end of line, leaving the remaining slots empty.

use crate::error::CollectError;

/// Logical slot count per proc(5). The tokenizer always produces exactly this
/// many slots, filling the tail with empty strings, so positional indexing is
/// total.
pub const STAT_FIELDS: usize = 52;

/// Splits one `/proc/[pid]/stat` line into its 52 positional slots.
pub fn split_stat_line(line: &str) -> [&str; STAT_FIELDS] {
    let line = line.trim();
    let bytes = line.as_bytes();
    let mut parts = [""; STAT_FIELDS];

    let mut partnum = 0;
    let mut start = 0;
    let mut inword = false;
    let mut groupchar = b' ';
    let mut strpos = 0;

    while strpos < bytes.len() && partnum < STAT_FIELDS {
        if inword {
            if bytes[strpos] == b' ' && (groupchar == b' ' || bytes[strpos - 1] == groupchar) {
                parts[partnum] = &line[start..strpos];
                partnum += 1;
                start = strpos;
                inword = false;
            }
        } else if bytes[strpos] == b'(' {
            groupchar = b')';
            inword = true;
            start = strpos;
            // Jump to just before the last ')' so the whole grouped field is
            // one token. If that position is not ahead of us the field is
            // unparseable; skip to end of line.
            match line.rfind(')') {
                Some(close) if close >= start + 2 => strpos = close - 1,
                _ => {
                    strpos = bytes.len();
                    inword = false;
                }
            }
        } else if bytes[strpos] != b' ' {
            groupchar = b' ';
            inword = true;
            start = strpos;
        }
        strpos += 1;
    }

    if inword && partnum < STAT_FIELDS {
        parts[partnum] = &line[start..bytes.len()];
    }

    parts
}

/// Everything the agent consumes from one `/proc/[pid]/stat` line.
///
/// Holds both the fast-changing counters and the stable fields the identity
/// cache wants, so one read serves both.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PidStat {
    pub pid: u32,
    /// Short command name, outer parentheses removed.
    pub comm: String,
    pub ppid: u32,
    pub pgrp: i64,
    pub session: i64,
    pub tty_nr: i64,
    pub tpgid: i64,
    pub flags: u64,
    pub utime: u64,
    pub stime: u64,
    pub cutime: u64,
    pub cstime: u64,
    pub nice: i64,
    pub num_threads: u64,
    pub starttime: u64,
    pub rss: u64,
    pub rt_priority: u64,
    pub policy: u64,
    pub guest_time: u64,
    pub cguest_time: u64,
}

fn read_u64(s: &str) -> Result<u64, CollectError> {
    s.parse()
        .map_err(|_| CollectError::Malformed { what: "pid stat field" })
}

fn read_i64(s: &str) -> Result<i64, CollectError> {
    s.parse()
        .map_err(|_| CollectError::Malformed { what: "pid stat field" })
}

/// Signed kernel fields that are never meaningfully negative for us.
fn read_clamped(s: &str) -> Result<u64, CollectError> {
    Ok(read_i64(s)?.max(0) as u64)
}

/// Loosely-parsed tail field: kernels differ in how many trailing fields they
/// emit, so absence reads as zero.
fn read_tail(s: &str) -> u64 {
    s.parse().unwrap_or(0)
}

/// Parses one `/proc/[pid]/stat` line. Field positions follow proc(5) with
/// `comm` at slot 1.
pub fn parse_pid_stat(line: &str) -> Result<PidStat, CollectError> {
    let parts = split_stat_line(line);

    let comm = parts[1]
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(parts[1]);

    Ok(PidStat {
        pid: read_u64(parts[0])? as u32,
        comm: comm.to_string(),
        ppid: read_u64(parts[3])? as u32,
        pgrp: read_i64(parts[4])?,
        session: read_i64(parts[5])?,
        tty_nr: read_i64(parts[6])?,
        tpgid: read_i64(parts[7])?,
        flags: read_u64(parts[8])?,
        utime: read_u64(parts[13])?,
        stime: read_u64(parts[14])?,
        cutime: read_clamped(parts[15])?,
        cstime: read_clamped(parts[16])?,
        nice: read_i64(parts[18])?,
        num_threads: read_u64(parts[19])?,
        starttime: read_u64(parts[21])?,
        rss: read_clamped(parts[23])?,
        rt_priority: read_tail(parts[39]),
        policy: read_tail(parts[40]),
        guest_time: read_tail(parts[42]),
        cguest_time: read_tail(parts[43]),
    })
}
