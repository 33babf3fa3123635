//! Benchmark suite for ci-autorepair.
//!
//! Measures the hot paths of an iteration that do not touch the network:
//! - Failure classification against the ordered rule set
//! - State serialization for the atomic store
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench
//! cargo bench -- --save-baseline main
//! cargo bench -- --baseline main
//! ```

use ci_autorepair::ci::{Run, RunStatus};
use ci_autorepair::testing::fixtures;
use ci_autorepair::{ErrorCategory, ErrorClassifier, LoopState, StateStore};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

// ============================================================================
// Classification Benchmarks
// ============================================================================

/// Classify each fixture. Unknown failures walk the whole rule list.
fn bench_classify_fixtures(c: &mut Criterion) {
    let classifier = ErrorClassifier::with_defaults();
    let mut group = c.benchmark_group("classify");

    let cases = [
        ("success", fixtures::success_run("1")),
        ("permission", fixtures::permission_denied_run("2")),
        ("dependency", fixtures::dependency_failure_run("3")),
        ("network", fixtures::network_failure_run("4")),
        ("unknown", fixtures::unknown_failure_run("5")),
    ];

    for (name, run) in &cases {
        group.bench_with_input(BenchmarkId::from_parameter(name), run, |b, run| {
            b.iter(|| classifier.classify(black_box(run)));
        });
    }

    group.finish();
}

/// Classification cost as the captured log grows.
fn bench_classify_log_size(c: &mut Criterion) {
    let classifier = ErrorClassifier::with_defaults();
    let mut group = c.benchmark_group("classify_log_size");

    for lines in [10, 100, 200] {
        let mut log = String::new();
        for i in 0..lines {
            log.push_str(&format!("[{i:04}] vite v5.4.2 building for production...\n"));
        }
        log.push_str("FAIL src/views/Dashboard.spec.js > renders KPI cards\n");
        let run = Run::new("bench", RunStatus::Failed)
            .with_failed_step("Verify")
            .with_log(log);

        group.throughput(Throughput::Elements(lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &run, |b, run| {
            b.iter(|| {
                let record = classifier.classify(black_box(run));
                debug_assert_eq!(record.map(|r| r.category), Some(ErrorCategory::Test));
            });
        });
    }

    group.finish();
}

// ============================================================================
// State Store Benchmarks
// ============================================================================

/// Full atomic save: lock, write tmp, fsync, rename.
fn bench_state_save(c: &mut Criterion) {
    let temp = TempDir::new().expect("temp dir");
    let store = StateStore::new(temp.path());
    let mut state = LoopState::new();
    for _ in 0..8 {
        state.next_iteration();
        state.consume_retry(ErrorCategory::Lint);
    }

    c.bench_function("state_save", |b| {
        b.iter(|| store.save(black_box(&state)).expect("save"));
    });
}

criterion_group!(
    benches,
    bench_classify_fixtures,
    bench_classify_log_size,
    bench_state_save
);
criterion_main!(benches);
