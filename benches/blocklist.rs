//! Benchmarks for blocklist domain lookup.
//!
//! Measures the hot path: one membership check per DNS query.

use std::io::Write;

use criterion::{black_box, BenchmarkId, Criterion, Throughput};

use waylay::filter::Blocklist;

fn synthetic_blocklist(domains: usize) -> Blocklist {
    let mut entries: Vec<String> = (0..domains)
        .map(|i| format!("tracker-{i}.example-ads.net"))
        .collect();
    entries.push("doubleclick.example".to_string());

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(serde_json::to_string(&entries).unwrap().as_bytes())
        .unwrap();
    Blocklist::load(file.path()).unwrap()
}

fn bench_is_blocked(c: &mut Criterion) {
    let blocklist = synthetic_blocklist(100_000);

    let mut group = c.benchmark_group("blocklist");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::new("is_blocked", "exact_match"), |b| {
        b.iter(|| blocklist.is_blocked(black_box("doubleclick.example")))
    });

    group.bench_function(BenchmarkId::new("is_blocked", "subdomain_match"), |b| {
        b.iter(|| blocklist.is_blocked(black_box("ads.tracking.doubleclick.example")))
    });

    group.bench_function(BenchmarkId::new("is_blocked", "miss"), |b| {
        b.iter(|| blocklist.is_blocked(black_box("www.google.com")))
    });

    group.bench_function(BenchmarkId::new("is_blocked", "deep_miss"), |b| {
        b.iter(|| blocklist.is_blocked(black_box("a.b.c.d.e.f.example.org")))
    });

    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_is_blocked(&mut criterion);
    criterion.final_summary();
}
