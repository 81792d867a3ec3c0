// Benchmark for print time estimation and project loading
// Run with: cargo bench

use criterion::{Criterion, criterion_group, criterion_main};
use resin_rs::config::Config;
use resin_rs::exposure::estimate::TimingModel;
use resin_rs::project::{ExposureProfile, ManifestLayer, Project, ProjectManifest};
use std::hint::black_box;

fn manifest(layers: usize) -> ProjectManifest {
    ProjectManifest {
        name: "bench".to_string(),
        exposure_time_ms: 2000,
        exposure_time_first_ms: 35_000,
        calibrate_time_ms: 0,
        calibrate_regions: 0,
        calibrate_time_ms_exact: Vec::new(),
        fade_layers: 10,
        layers_slow: layers / 4,
        layers_fast: layers - layers / 4,
        used_material_ml: 40.0,
        printer_model: None,
        exposure_profile: ExposureProfile::default(),
        layers: (0..layers)
            .map(|i| ManifestLayer { image: format!("bench{:05}.png", i), height_nm: 50_000 })
            .collect(),
    }
}

fn bench_estimate(c: &mut Criterion) {
    let project = Project::from_manifest(manifest(5_000), "bench.toml").unwrap();
    let timing = TimingModel::from_config(&Config::default());
    c.bench_function("estimate 5k layers", |b| {
        b.iter(|| timing.estimate_total_ms(black_box(&project)).unwrap());
    });
    c.bench_function("remaining time mid print", |b| {
        b.iter(|| timing.count_remain_time(black_box(&project), 2_500, 600).unwrap());
    });
}

fn bench_project_load(c: &mut Criterion) {
    let m = manifest(5_000);
    c.bench_function("load 5k layer manifest", |b| {
        b.iter(|| {
            let project = Project::from_manifest(black_box(m.clone()), "bench.toml").unwrap();
            assert_eq!(project.total_layers(), 5_000);
        });
    });
}

criterion_group!(benches, bench_estimate, bench_project_load);
criterion_main!(benches);
