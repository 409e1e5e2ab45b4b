//! Query client and summarizer.
//!
//! Fetches a window of samples from a running agent, replays the aggregation
//! algebra over consecutive sample pairs, and emits a JSON summary on stdout:
//! system-wide CPU histograms plus one row per process, ordered by combined
//! CPU time. Tick counters are converted to milliseconds with the supplied
//! jiffy rate; that conversion is display-only.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::identity::ProcessIdentity;
use crate::model::{ProcessSampleList, RingEntry};
use crate::server::wire::{decode_samples, decode_sys};
use crate::server::{METHOD_READ_SAMPLES, METHOD_READ_SYS};
use crate::stats::histogram::Histogram;
use crate::stats::Aggregator;

/// Protects the client from a runaway length prefix.
const MAX_RESPONSE_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Agent endpoint, host:port.
    pub addr: String,
    /// Samples to fetch and summarize.
    pub samples: u32,
    /// Fetch only system-wide samples.
    pub sys_only: bool,
    /// Nominal kernel tick rate, for tick -> millisecond display scaling.
    pub jiffy_hz: u64,
    /// Nominal sampling interval assumed when the payload does not carry one
    /// (`readSys` responses).
    pub fallback_interval_ms: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:1971".to_string(),
            samples: 300,
            sys_only: false,
            jiffy_hz: 100,
            fallback_interval_ms: 200,
        }
    }
}

/// min/max/mean/p95 of one counter family, display-scaled.
#[derive(Debug, Serialize)]
pub struct StatLine {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p95: f64,
}

fn stat_line(h: &Histogram, scale: f64) -> StatLine {
    StatLine {
        min: h.min() as f64 * scale,
        max: h.max() as f64 * scale,
        mean: h.mean() * scale,
        p95: h.value_at_quantile(95.0) as f64 * scale,
    }
}

/// System-wide summary: CPU families in milliseconds per interval, process
/// gauges as counts.
#[derive(Debug, Serialize)]
pub struct SystemSummary {
    pub usr_ms: StatLine,
    pub nice_ms: StatLine,
    pub sys_ms: StatLine,
    pub idle_ms: StatLine,
    pub iowait_ms: StatLine,
    pub procs_total: StatLine,
    pub procs_running: StatLine,
    pub procs_blocked: StatLine,
}

/// One process row.
#[derive(Debug, Serialize)]
pub struct ProcessSummary {
    pub pid: u32,
    pub name: String,
    pub usr_ms: StatLine,
    pub sys_ms: StatLine,
    pub combined_ms: StatLine,
    pub cpu_delay_ms: StatLine,
    pub blkio_delay_ms: StatLine,
    pub swapin_delay_ms: StatLine,
    pub threads: u64,
    pub rss_pages: u64,
}

#[derive(Debug, Serialize)]
pub struct Summary {
    pub server_time_ns: i64,
    pub interval_ms: u32,
    pub samples: usize,
    pub system: SystemSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<ProcessSummary>,
}

/// Fetches one window and prints the JSON summary to stdout.
pub async fn run(opts: &ClientOptions) -> Result<()> {
    let summary = fetch_summary(opts).await?;
    let json = serde_json::to_string_pretty(&summary).context("serializing summary")?;
    println!("{json}");
    Ok(())
}

/// Fetches one window and summarizes it.
pub async fn fetch_summary(opts: &ClientOptions) -> Result<Summary> {
    let method = if opts.sys_only {
        METHOD_READ_SYS
    } else {
        METHOD_READ_SAMPLES
    };

    let payload = fetch(&opts.addr, method, opts.samples).await?;

    if opts.sys_only {
        let decoded = decode_sys(&payload).context("decoding readSys payload")?;
        let entries: Vec<RingEntry> = decoded
            .samples
            .into_iter()
            .map(|sys| RingEntry {
                procs: ProcessSampleList::default(),
                sys,
            })
            .collect();
        Ok(summarize(
            decoded.server_time_ns,
            opts.fallback_interval_ms,
            &[],
            &entries,
            opts.jiffy_hz,
        ))
    } else {
        let decoded = decode_samples(&payload).context("decoding readSamples payload")?;
        Ok(summarize(
            decoded.server_time_ns,
            decoded.interval_ms,
            &decoded.identities,
            &decoded.entries,
            opts.jiffy_hz,
        ))
    }
}

async fn fetch(addr: &str, method: u8, count: u32) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to agent at {addr}"))?;

    let mut request = [0u8; 5];
    request[0] = method;
    request[1..5].copy_from_slice(&count.to_le_bytes());
    stream.write_all(&request).await.context("sending request")?;

    let mut len_raw = [0u8; 4];
    stream
        .read_exact(&mut len_raw)
        .await
        .context("reading response length")?;
    let len = u32::from_le_bytes(len_raw) as usize;
    if len > MAX_RESPONSE_LEN {
        bail!("response length {len} exceeds the sanity limit");
    }

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .context("reading response payload")?;
    Ok(payload)
}

/// Replays the aggregation algebra across the window and shapes the result.
pub fn summarize(
    server_time_ns: i64,
    interval_ms: u32,
    identities: &[ProcessIdentity],
    entries: &[RingEntry],
    jiffy_hz: u64,
) -> Summary {
    let mut agg = Aggregator::new(interval_ms);
    let mut deltas = Vec::new();
    for pair in entries.windows(2) {
        agg.record(&pair[0], &pair[1], &mut deltas);
    }

    // Display scales: kernel ticks and delay nanoseconds both render as ms.
    let tick_ms = 1000.0 / jiffy_hz.max(1) as f64;
    let ns_ms = 1.0 / 1_000_000.0;

    let system = SystemSummary {
        usr_ms: stat_line(&agg.sys_hists.usr, tick_ms),
        nice_ms: stat_line(&agg.sys_hists.nice, tick_ms),
        sys_ms: stat_line(&agg.sys_hists.sys, tick_ms),
        idle_ms: stat_line(&agg.sys_hists.idle, tick_ms),
        iowait_ms: stat_line(&agg.sys_hists.iowait, tick_ms),
        procs_total: stat_line(&agg.sys_hists.procs_total, 1.0),
        procs_running: stat_line(&agg.sys_hists.procs_running, 1.0),
        procs_blocked: stat_line(&agg.sys_hists.procs_blocked, 1.0),
    };

    let mut processes: Vec<ProcessSummary> = agg
        .proc_hists
        .iter()
        .map(|(&pid, hists)| {
            let name = identities
                .iter()
                .find(|id| id.pid == pid)
                .map(|id| {
                    if id.friendly.is_empty() {
                        id.comm.clone()
                    } else {
                        id.friendly.clone()
                    }
                })
                .unwrap_or_else(|| pid.to_string());

            let delays = &agg.delay_hists[&pid];
            let sum = &agg.proc_sums[&pid];

            ProcessSummary {
                pid,
                name,
                usr_ms: stat_line(&hists.utime, tick_ms),
                sys_ms: stat_line(&hists.stime, tick_ms),
                combined_ms: stat_line(&hists.ustime, tick_ms),
                cpu_delay_ms: stat_line(&delays.cpu_delay, ns_ms),
                blkio_delay_ms: stat_line(&delays.blkio_delay, ns_ms),
                swapin_delay_ms: stat_line(&delays.swapin_delay, ns_ms),
                threads: sum.stat.num_threads,
                rss_pages: sum.stat.rss,
            }
        })
        .collect();

    // Busiest first; PID breaks ties so the order is stable.
    processes.sort_by(|a, b| {
        b.combined_ms
            .mean
            .partial_cmp(&a.combined_ms.mean)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.pid.cmp(&b.pid))
    });

    Summary {
        server_time_ns,
        interval_ms,
        samples: entries.len(),
        system,
        processes,
    }
}
