//! Binary payload codec for the query endpoint.
//!
//! Responses are self-describing: the identity table, the nominal sampling
//! interval, and the sample count travel with the samples, so a client needs
//! no out-of-band schema. All integers are little-endian; strings and
//! sequences are length-prefixed. Length checks happen through a cursor so a
//! truncated or hostile payload fails cleanly instead of panicking.

use thiserror::Error;

use crate::identity::ProcessIdentity;
use crate::model::{
    DelayCounters, ProcCounters, ProcessSample, ProcessSampleList, RingEntry, SystemSample,
};

/// Errors that can occur while decoding a payload.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("payload truncated reading {what}")]
    Truncated { what: &'static str },

    #[error("{what} length {len} exceeds the payload")]
    LengthOverrun { what: &'static str, len: usize },

    #[error("invalid utf-8 in {what}")]
    InvalidString { what: &'static str },
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn put_identity(out: &mut Vec<u8>, id: &ProcessIdentity) {
    put_u32(out, id.pid);
    put_u32(out, id.ppid);
    put_i64(out, id.pgrp);
    put_i64(out, id.session);
    put_i64(out, id.tty_nr);
    put_i64(out, id.tpgid);
    put_u64(out, id.flags);
    put_str(out, &id.comm);
    put_u32(out, id.cmdline.len() as u32);
    for arg in &id.cmdline {
        put_str(out, arg);
    }
    put_str(out, &id.friendly);
    put_i64(out, id.nice);
    put_u64(out, id.rt_priority);
    put_u64(out, id.policy);
    put_u64(out, id.starttime);
    put_u32(out, id.uid);
    put_i64(out, id.first_seen_ns);
    put_i64(out, id.last_seen_ns);
}

fn put_process_sample(out: &mut Vec<u8>, s: &ProcessSample) {
    put_u32(out, s.pid);
    put_i64(out, s.stat.capture_time_ns);
    put_u64(out, s.stat.utime);
    put_u64(out, s.stat.stime);
    put_u64(out, s.stat.cutime);
    put_u64(out, s.stat.cstime);
    put_u64(out, s.stat.num_threads);
    put_u64(out, s.stat.rss);
    put_u64(out, s.stat.guest_time);
    put_u64(out, s.stat.cguest_time);
    put_i64(out, s.delays.capture_time_ns);
    put_u64(out, s.delays.cpu_delay_count);
    put_u64(out, s.delays.cpu_delay_total_ns);
    put_u64(out, s.delays.blkio_delay_count);
    put_u64(out, s.delays.blkio_delay_total_ns);
    put_u64(out, s.delays.swapin_delay_count);
    put_u64(out, s.delays.swapin_delay_total_ns);
    put_u64(out, s.delays.nvcsw);
    put_u64(out, s.delays.nivcsw);
    put_u64(out, s.delays.freepages_delay_count);
    put_u64(out, s.delays.freepages_delay_total_ns);
}

fn put_system_sample(out: &mut Vec<u8>, s: &SystemSample) {
    put_i64(out, s.capture_time_ns);
    put_u64(out, s.usr);
    put_u64(out, s.nice);
    put_u64(out, s.sys);
    put_u64(out, s.idle);
    put_u64(out, s.iowait);
    put_u64(out, s.irq);
    put_u64(out, s.softirq);
    put_u64(out, s.steal);
    put_u64(out, s.guest);
    put_u64(out, s.guest_nice);
    put_u64(out, s.ctxt);
    put_u64(out, s.procs_total);
    put_u64(out, s.procs_running);
    put_u64(out, s.procs_blocked);
}

/// Encodes a `readSamples` response payload.
pub fn encode_samples(
    out: &mut Vec<u8>,
    server_time_ns: i64,
    identities: &[ProcessIdentity],
    interval_ms: u32,
    entries: &[RingEntry],
) {
    put_i64(out, server_time_ns);
    put_u32(out, identities.len() as u32);
    for id in identities {
        put_identity(out, id);
    }
    put_u32(out, interval_ms);
    put_u32(out, entries.len() as u32);
    for entry in entries {
        let samples = entry.procs.as_slice();
        put_u32(out, samples.len() as u32);
        for s in samples {
            put_process_sample(out, s);
        }
        put_system_sample(out, &entry.sys);
    }
}

/// Encodes a `readSys` response payload: no identity table, no per-process
/// arrays.
pub fn encode_sys(out: &mut Vec<u8>, server_time_ns: i64, entries: &[RingEntry]) {
    put_i64(out, server_time_ns);
    put_u32(out, entries.len() as u32);
    for entry in entries {
        put_system_sample(out, &entry.sys);
    }
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], WireError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.data.len())
            .ok_or(WireError::Truncated { what })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, WireError> {
        let raw = self.take(4, what)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, WireError> {
        let raw = self.take(8, what)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_le_bytes(bytes))
    }

    fn i64(&mut self, what: &'static str) -> Result<i64, WireError> {
        Ok(self.u64(what)? as i64)
    }

    fn string(&mut self, what: &'static str) -> Result<String, WireError> {
        let len = self.u32(what)? as usize;
        if len > self.remaining() {
            return Err(WireError::LengthOverrun { what, len });
        }
        let raw = self.take(len, what)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidString { what })
    }

    /// Guards a count prefix against absurd allocations: each element needs
    /// at least `min_size` bytes of remaining payload.
    fn count(&mut self, min_size: usize, what: &'static str) -> Result<usize, WireError> {
        let n = self.u32(what)? as usize;
        if n.saturating_mul(min_size) > self.remaining() {
            return Err(WireError::LengthOverrun { what, len: n });
        }
        Ok(n)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

fn get_identity(r: &mut Reader<'_>) -> Result<ProcessIdentity, WireError> {
    let mut id = ProcessIdentity {
        pid: r.u32("identity pid")?,
        ppid: r.u32("identity ppid")?,
        pgrp: r.i64("identity pgrp")?,
        session: r.i64("identity session")?,
        tty_nr: r.i64("identity tty_nr")?,
        tpgid: r.i64("identity tpgid")?,
        flags: r.u64("identity flags")?,
        comm: r.string("identity comm")?,
        ..ProcessIdentity::default()
    };

    let args = r.count(4, "identity cmdline")?;
    id.cmdline = Vec::with_capacity(args);
    for _ in 0..args {
        id.cmdline.push(r.string("identity cmdline arg")?);
    }

    id.friendly = r.string("identity friendly")?;
    id.nice = r.i64("identity nice")?;
    id.rt_priority = r.u64("identity rt_priority")?;
    id.policy = r.u64("identity policy")?;
    id.starttime = r.u64("identity starttime")?;
    id.uid = r.u32("identity uid")?;
    id.first_seen_ns = r.i64("identity first_seen")?;
    id.last_seen_ns = r.i64("identity last_seen")?;
    Ok(id)
}

/// Serialized size of one process sample: pid + 9 stat words + 11 delay words.
const PROCESS_SAMPLE_SIZE: usize = 4 + 9 * 8 + 11 * 8;
const SYSTEM_SAMPLE_SIZE: usize = 15 * 8;

fn get_process_sample(r: &mut Reader<'_>) -> Result<ProcessSample, WireError> {
    Ok(ProcessSample {
        pid: r.u32("sample pid")?,
        stat: ProcCounters {
            capture_time_ns: r.i64("sample capture time")?,
            utime: r.u64("sample utime")?,
            stime: r.u64("sample stime")?,
            cutime: r.u64("sample cutime")?,
            cstime: r.u64("sample cstime")?,
            num_threads: r.u64("sample num_threads")?,
            rss: r.u64("sample rss")?,
            guest_time: r.u64("sample guest_time")?,
            cguest_time: r.u64("sample cguest_time")?,
        },
        delays: DelayCounters {
            capture_time_ns: r.i64("delay capture time")?,
            cpu_delay_count: r.u64("delay cpu count")?,
            cpu_delay_total_ns: r.u64("delay cpu total")?,
            blkio_delay_count: r.u64("delay blkio count")?,
            blkio_delay_total_ns: r.u64("delay blkio total")?,
            swapin_delay_count: r.u64("delay swapin count")?,
            swapin_delay_total_ns: r.u64("delay swapin total")?,
            nvcsw: r.u64("delay nvcsw")?,
            nivcsw: r.u64("delay nivcsw")?,
            freepages_delay_count: r.u64("delay freepages count")?,
            freepages_delay_total_ns: r.u64("delay freepages total")?,
        },
    })
}

fn get_system_sample(r: &mut Reader<'_>) -> Result<SystemSample, WireError> {
    Ok(SystemSample {
        capture_time_ns: r.i64("system capture time")?,
        usr: r.u64("system usr")?,
        nice: r.u64("system nice")?,
        sys: r.u64("system sys")?,
        idle: r.u64("system idle")?,
        iowait: r.u64("system iowait")?,
        irq: r.u64("system irq")?,
        softirq: r.u64("system softirq")?,
        steal: r.u64("system steal")?,
        guest: r.u64("system guest")?,
        guest_nice: r.u64("system guest_nice")?,
        ctxt: r.u64("system ctxt")?,
        procs_total: r.u64("system procs_total")?,
        procs_running: r.u64("system procs_running")?,
        procs_blocked: r.u64("system procs_blocked")?,
    })
}

/// Decoded `readSamples` payload.
#[derive(Debug)]
pub struct SamplesPayload {
    pub server_time_ns: i64,
    pub identities: Vec<ProcessIdentity>,
    pub interval_ms: u32,
    pub entries: Vec<RingEntry>,
}

pub fn decode_samples(data: &[u8]) -> Result<SamplesPayload, WireError> {
    let mut r = Reader::new(data);

    let server_time_ns = r.i64("server time")?;

    let id_count = r.count(4, "identity table")?;
    let mut identities = Vec::with_capacity(id_count);
    for _ in 0..id_count {
        identities.push(get_identity(&mut r)?);
    }

    let interval_ms = r.u32("interval")?;

    let entry_count = r.count(SYSTEM_SAMPLE_SIZE + 4, "entry table")?;
    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let sample_count = r.count(PROCESS_SAMPLE_SIZE, "process samples")?;
        let mut samples = Vec::with_capacity(sample_count);
        for _ in 0..sample_count {
            samples.push(get_process_sample(&mut r)?);
        }
        entries.push(RingEntry {
            procs: ProcessSampleList::from(samples),
            sys: get_system_sample(&mut r)?,
        });
    }

    Ok(SamplesPayload {
        server_time_ns,
        identities,
        interval_ms,
        entries,
    })
}

/// Decoded `readSys` payload.
#[derive(Debug)]
pub struct SysPayload {
    pub server_time_ns: i64,
    pub samples: Vec<SystemSample>,
}

pub fn decode_sys(data: &[u8]) -> Result<SysPayload, WireError> {
    let mut r = Reader::new(data);

    let server_time_ns = r.i64("server time")?;
    let count = r.count(SYSTEM_SAMPLE_SIZE, "system samples")?;
    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        samples.push(get_system_sample(&mut r)?);
    }

    Ok(SysPayload {
        server_time_ns,
        samples,
    })
}
