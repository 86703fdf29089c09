use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use mj_core::{Columns, Variable};
use mj_hist::{JsonEventSource, WeightExpr};
use mj_regularization::{SplineRegressor, TriggerBin, TriggerBinSet, WeightedProfileBuilder, lowess};
use std::collections::BTreeMap;
use std::hint::black_box;

fn make_points(n: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    // Deterministic curve in log(pt) with a small alternating offset.
    let x: Vec<f64> = (0..n).map(|i| (100.0f64).ln() + 3.0 * i as f64 / n as f64).collect();
    let y = x
        .iter()
        .enumerate()
        .map(|(i, xi)| 1.0 + 0.02 * xi + if i % 2 == 0 { 0.003 } else { -0.003 })
        .collect();
    let w = vec![300.0; n];
    (x, y, w)
}

fn bench_spline_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("spline_fit");
    let regressor = SplineRegressor::new();

    for n in [20usize, 100, 500] {
        let (x, y, w) = make_points(n);
        group.bench_with_input(BenchmarkId::new("default_smoothing", n), &n, |b, _| {
            b.iter(|| black_box(regressor.fit(black_box(&x), black_box(&y), black_box(&w)).unwrap()))
        });
    }

    group.finish();
}

fn bench_lowess(c: &mut Criterion) {
    let mut group = c.benchmark_group("lowess");

    for n in [50usize, 200, 1000] {
        let (_, y, w) = make_points(n);
        let bandwidth = 0.1 * n as f64;
        group.bench_with_input(BenchmarkId::new("bandwidth_10pct", n), &n, |b, _| {
            b.iter(|| black_box(lowess(black_box(&y), black_box(&w), bandwidth).unwrap()))
        });
    }

    group.finish();
}

fn make_source(n_per_trigger: usize) -> (TriggerBinSet, JsonEventSource) {
    let bins = TriggerBinSet::from_bins([
        TriggerBin::new("PFJet60", "HLT_PFJet60", (100.0, 200.0), (90.0, 220.0)).unwrap(),
        TriggerBin::new("PFJet140", "HLT_PFJet140", (200.0, 500.0), (180.0, 520.0)).unwrap(),
        TriggerBin::new("PFJet320", "HLT_PFJet320", (500.0, f64::INFINITY), (480.0, f64::INFINITY)).unwrap(),
    ]);
    let mut triggers = BTreeMap::new();
    for (name, lo, hi) in [("PFJet60", 90.0, 220.0), ("PFJet140", 180.0, 520.0), ("PFJet320", 480.0, 2000.0)] {
        let pt: Vec<f64> = (0..n_per_trigger)
            .map(|i| lo * f64::powf(hi / lo, (i as f64 + 0.5) / n_per_trigger as f64))
            .collect();
        let mpf = pt.iter().map(|p| 0.95 + 0.01 * p.ln()).collect();
        let mut cols = Columns::new();
        cols.insert("PtJ1", pt).unwrap();
        cols.insert("MPF", mpf).unwrap();
        cols.insert("WeightGen", vec![1.0; n_per_trigger]).unwrap();
        cols.insert("Weight_2018A", vec![0.5; n_per_trigger]).unwrap();
        triggers.insert(name.to_string(), cols);
    }
    (bins, JsonEventSource::from_map("bench", triggers))
}

fn bench_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted_profile_fill");
    let weight = WeightExpr::simulation("2018A", None);

    for n in [10_000usize, 100_000] {
        let (bins, source) = make_source(n);
        let mut builder = WeightedProfileBuilder::new(&bins, f64::INFINITY).unwrap();
        builder.construct_binning(1700.0, 100).unwrap();
        group.bench_with_input(BenchmarkId::new("three_triggers", n), &n, |b, _| {
            b.iter(|| {
                black_box(builder.fill(&source, &weight, &[Variable::PtLead, Variable::Mpf]).unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_spline_fit, bench_lowess, bench_fill);
criterion_main!(benches);
