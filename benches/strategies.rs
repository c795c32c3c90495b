//! Benchmarks for the optimizer strategies and evaluation transports.
//!
//! Every strategy runs a short seeded campaign on the Rastrigin function;
//! the transport group compares the serial mapper with worker pools on an
//! objective with an artificial cost per evaluation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array1;
use reflfit::{FitConfig, FitDriver, FitProblem, Parameters, Result, StrategyKind, Transport};
use std::f64::consts::PI;

/// Rastrigin function: f(x) = 10n + sum[x_i^2 - 10cos(2πx_i)]
#[derive(Clone)]
struct Rastrigin {
    params: Parameters,
    /// Extra inner iterations per evaluation
    cost: usize,
}

impl Rastrigin {
    fn new(dimension: usize, cost: usize) -> Self {
        let mut params = Parameters::new();
        for i in 0..dimension {
            params
                .add_param_with_bounds(&format!("x{}", i), 1.0, -5.12, 5.12)
                .unwrap();
        }
        Self { params, cost }
    }
}

impl FitProblem for Rastrigin {
    fn parameters(&self) -> &Parameters {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    fn nllf(&self, values: &Array1<f64>) -> Result<f64> {
        let mut sum = 10.0 * values.len() as f64;
        for x in values.iter() {
            sum += x.powi(2) - 10.0 * (2.0 * PI * x).cos();
        }
        let mut burn = 0.0;
        for k in 0..self.cost {
            burn += (k as f64).sqrt();
        }
        Ok(sum + black_box(burn) * 0.0)
    }

    fn degrees_of_freedom(&self) -> usize {
        1
    }
}

fn bench_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("rastrigin_4d");
    group.sample_size(10);

    for kind in StrategyKind::ALL {
        let config = FitConfig::new()
            .with_strategy(kind)
            .with_pop(16)
            .with_burn(20)
            .with_steps(50)
            .with_temperatures(6, 0.5, 20.0)
            .with_seed(42);
        group.bench_function(kind.name(), |b| {
            b.iter(|| {
                let mut driver =
                    FitDriver::new(Rastrigin::new(4, 0), config.clone(), Transport::serial())
                        .unwrap();
                black_box(driver.fit().unwrap())
            })
        });
    }

    group.finish();
}

fn bench_transports(c: &mut Criterion) {
    let mut group = c.benchmark_group("transport");
    group.sample_size(10);

    let config = FitConfig::new().with_pop(32).with_steps(10).with_seed(7);
    let transports = [
        ("serial", Transport::serial()),
        ("pool_2", Transport::pool(2)),
        ("pool_4", Transport::pool(4)),
    ];
    for (name, transport) in transports {
        group.bench_with_input(BenchmarkId::new("de", name), &transport, |b, transport| {
            b.iter(|| {
                let mut driver =
                    FitDriver::new(Rastrigin::new(4, 20_000), config.clone(), transport.clone())
                        .unwrap();
                black_box(driver.fit().unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_strategies, bench_transports);
criterion_main!(benches);
