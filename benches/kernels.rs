//! Criterion benchmarks for the stepping loop and synapse creation.
//!
//! Run with:
//!   cargo bench
//!   cargo bench --features parallel
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use spikegen::experiments::{lif_network, LifParams};
use spikegen::prelude::*;

fn make_sim(n_a: usize, tier: ExecutionTier) -> Simulation {
    // Long horizon so `step()` never reaches the end while benchmarking.
    let config = SimulationConfig::new(1e-4, 1e6).with_seed(42).with_tier(tier);
    let params = LifParams {
        n_a,
        n_b: n_a / 10,
        ..LifParams::default()
    };
    let mut sim = lif_network(config, &params).expect("valid network");
    sim.setup().expect("setup");
    sim
}

/// Benchmark step() with varying network sizes.
fn bench_step_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_size");

    for size in [100, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("scalar", size), size, |b, &size| {
            let mut sim = make_sim(size, ExecutionTier::Scalar);
            b.iter(|| {
                sim.step().expect("step");
                black_box(sim.time())
            });
        });
    }

    group.finish();
}

/// Benchmark step() comparing execution tiers at a fixed size.
fn bench_step_tiers(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_tier");

    let size = 10_000;
    group.throughput(Throughput::Elements(size as u64));

    for tier in [ExecutionTier::Scalar, ExecutionTier::Parallel, ExecutionTier::Gpu] {
        // Requested tier; without the matching feature it falls back.
        let label = format!("{tier:?}").to_lowercase();
        group.bench_function(BenchmarkId::new(label, size), |b| {
            let mut sim = make_sim(size, tier);
            b.iter(|| {
                sim.step().expect("step");
                black_box(sim.time())
            });
        });
    }

    group.finish();
}

/// Benchmark setup(), dominated by random synapse creation.
fn bench_synapse_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("synapse_create");

    for size in [100, 1_000].iter() {
        let pairs = (*size as u64) * (*size as u64 / 10);
        group.throughput(Throughput::Elements(pairs));

        group.bench_with_input(BenchmarkId::new("setup", size), size, |b, &size| {
            let mut sim = make_sim(size, ExecutionTier::Scalar);
            b.iter(|| {
                sim.setup().expect("setup");
                black_box(sim.registry().count(
                    sim.registry().entity_set("syn").expect("synapses declared"),
                ))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_step_sizes,
    bench_step_tiers,
    bench_synapse_creation
);
criterion_main!(benches);
