// Throughput of the virtual PMU's hot path.
//
// A simulator step arrives as one `pmudata` vector; the PMU selects its nodes' values
// into the live buffer (and the record buffer while recording), and the output cadence
// de-normalizes the latest row. Both have to keep up with simulators running well above
// real time, for PMUs monitoring anything from one bus to a few hundred.
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ltbnet_core::bus::{Idxvgs, PmuCommand, SysParam, WorkspaceVar};
use ltbnet_core::error::FrameError;
use ltbnet_core::frame::{DataRecord, FrameSink};
use ltbnet_core::ieee_c37_118::config::ConfigurationFrame;
use ltbnet_core::ieee_c37_118::header::HeaderFrame;
use ltbnet_core::{PmuConfig, VirtualPmu};
use std::hint::black_box;
use std::time::Duration;

const BUSES: usize = 2000;

struct NullSink;

impl FrameSink for NullSink {
    fn configure(&mut self, _: HeaderFrame, _: ConfigurationFrame) -> Result<(), FrameError> {
        Ok(())
    }

    fn has_consumers(&self) -> bool {
        true
    }

    fn send(&mut self, record: &DataRecord) -> Result<(), FrameError> {
        black_box(record);
        Ok(())
    }
}

fn streaming_pmu(nodes: usize, noise_level: f64) -> VirtualPmu<NullSink> {
    let config = PmuConfig {
        nodes: (1..=nodes as u32).collect(),
        noise_level,
        ..Default::default()
    };
    let mut pmu = VirtualPmu::with_seed(config, NullSink, 42).unwrap();
    pmu.observe(WorkspaceVar::SysParam(SysParam::default()));
    // The default interleaved layout does not read the table.
    pmu.observe(WorkspaceVar::Idxvgs(Idxvgs::default()));
    pmu.observe(WorkspaceVar::Varheader(Vec::new()));
    pmu
}

fn test_vector() -> Vec<f64> {
    (0..3 * BUSES).map(|i| 1.0 + (i % 7) as f64 * 1e-3).collect()
}

fn bench_handle_measurement(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle_measurement");
    group.measurement_time(Duration::from_secs(5));
    let vars = test_vector();

    for &nodes in &[1, 10, 100, 500] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("live", nodes), &nodes, |b, &nodes| {
            let mut pmu = streaming_pmu(nodes, 0.0);
            let mut t = 0.0;
            b.iter(|| {
                t += 1.0 / 30.0;
                pmu.handle_measurement(black_box(&vars), t).unwrap();
            });
        });
        group.bench_with_input(BenchmarkId::new("recording", nodes), &nodes, |b, &nodes| {
            let mut pmu = streaming_pmu(nodes, 0.0);
            pmu.apply_command(PmuCommand {
                record: 1,
                ..Default::default()
            })
            .unwrap();
            let mut t = 0.0;
            b.iter(|| {
                t += 1.0 / 30.0;
                pmu.handle_measurement(black_box(&vars), t).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_output(c: &mut Criterion) {
    let mut group = c.benchmark_group("next_output");
    group.measurement_time(Duration::from_secs(5));
    let vars = test_vector();

    for &nodes in &[1, 10, 100, 500] {
        for &noise_level in &[0.0, 0.01] {
            let id = format!("nodes_{}_noise_{}", nodes, noise_level);
            group.bench_function(BenchmarkId::new("tick", id), |b| {
                let mut pmu = streaming_pmu(nodes, noise_level);
                pmu.handle_measurement(&vars, 0.0).unwrap();
                b.iter(|| black_box(pmu.tick()));
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_handle_measurement, bench_output);
criterion_main!(benches);
