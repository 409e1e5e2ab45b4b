use criterion::{black_box, criterion_group, criterion_main, Criterion};

use schedscope::model::{ProcessSample, ProcessSampleList, RingEntry, SystemSample};
use schedscope::proc::pidstat::{parse_pid_stat, split_stat_line};
use schedscope::stats::histogram::Histogram;
use schedscope::stats::Aggregator;
use schedscope::taskstats::build_pid_request;

const STAT_LINE: &str = "17974 ([celeryd: celer) S 44582 44581 44581 0 -1 4202560 10130 0 0 0 59 13 0 0 20 0 3 0 317969348 965685248 19771 18446744073709551615 1 1 0 0 0 0 0 16781314 18949 18446744073709551615 0 0 17 2 0 0 0 0 0 0 0 0 0 0 0 0 0";

const MS: i64 = 1_000_000;

fn build_entry(t_ms: i64, pid_count: u32) -> RingEntry {
    let samples: Vec<ProcessSample> = (0..pid_count)
        .map(|i| {
            let mut s = ProcessSample {
                pid: i * 3 + 1,
                ..ProcessSample::default()
            };
            s.stat.capture_time_ns = t_ms * MS;
            s.stat.utime = (t_ms as u64) + u64::from(i);
            s.stat.stime = (t_ms as u64) / 2;
            s.delays.capture_time_ns = t_ms * MS;
            s.delays.cpu_delay_total_ns = (t_ms as u64) * 1_000 + u64::from(i);
            s
        })
        .collect();

    RingEntry {
        procs: ProcessSampleList::from(samples),
        sys: SystemSample {
            capture_time_ns: t_ms * MS,
            usr: t_ms as u64,
            ..SystemSample::default()
        },
    }
}

fn bench_stat_tokenizer(c: &mut Criterion) {
    c.bench_function("split_stat_line", |b| {
        b.iter(|| split_stat_line(black_box(STAT_LINE)));
    });

    c.bench_function("parse_pid_stat", |b| {
        b.iter(|| parse_pid_stat(black_box(STAT_LINE)).expect("parse"));
    });
}

fn bench_merge(c: &mut Criterion) {
    let prev = build_entry(0, 1000);
    let cur = build_entry(200, 1000);

    c.bench_function("merge_1000_pids", |b| {
        let mut agg = Aggregator::new(200);
        let mut deltas = Vec::with_capacity(1000);
        b.iter(|| {
            agg.record(black_box(&prev), black_box(&cur), &mut deltas);
            black_box(deltas.len());
        });
    });
}

fn bench_histogram(c: &mut Criterion) {
    c.bench_function("histogram_record", |b| {
        let mut h = Histogram::new();
        let mut v = 1u64;
        b.iter(|| {
            v = (v.wrapping_mul(2862933555777941757).wrapping_add(3037000493)) % 100_000_000;
            h.record(black_box(v));
        });
    });

    c.bench_function("histogram_p95", |b| {
        let mut h = Histogram::new();
        for i in 0..100_000u64 {
            h.record(i % 10_000_000);
        }
        b.iter(|| black_box(h.value_at_quantile(95.0)));
    });
}

fn bench_netlink_request(c: &mut Criterion) {
    c.bench_function("build_pid_request", |b| {
        b.iter(|| build_pid_request(black_box(0x19), 1, 42, black_box(1337)));
    });
}

criterion_group!(
    benches,
    bench_stat_tokenizer,
    bench_merge,
    bench_histogram,
    bench_netlink_request,
);
criterion_main!(benches);
