use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::collections::BTreeMap;

use poptune_core::{
    CheckpointRef, Configuration, Domain, Mode, MutationSpec, PerturbationConfig,
    PerturbationEngine, PopulationRegistry, PopulationSnapshot, TimeAttr, Trial, TrialId,
    TrialStatus,
};

fn population(n: u32) -> PopulationSnapshot {
    let trials = (0..n)
        .map(|i| {
            let config = Configuration::new()
                .with("lr", 0.001 + f64::from(i) * 1e-4)
                .with("momentum", 0.9);
            let mut trial = Trial::new(TrialId::new(i), config);
            let metric = f64::from((i * 37) % 101) / 100.0;
            trial.status = TrialStatus::Running;
            trial.iterations = 5;
            trial.step = 5;
            trial.last_metric = Some(metric);
            trial.last_checkpoint = Some(CheckpointRef::new(trial.id, 5, metric, format!("mem://{i}")));
            trial
        })
        .collect();
    PopulationSnapshot {
        generation: 1,
        trials,
    }
}

fn engine() -> PerturbationEngine {
    let mut mutations = BTreeMap::new();
    mutations.insert(
        "lr".to_string(),
        MutationSpec::continuous(Domain::LogUniform {
            min: 1e-4,
            max: 1.0,
        }),
    );
    mutations.insert(
        "momentum".to_string(),
        MutationSpec::discrete([0.8, 0.9, 0.99]),
    );
    PerturbationEngine::new(
        PerturbationConfig {
            mode: Mode::Max,
            time_attr: TimeAttr::TrainingIteration,
            interval: 5,
            quantile_fraction: 0.25,
            resample_probability: 0.25,
            perturbation_factors: vec![0.8, 1.2],
            mutations,
        },
        Some(0),
    )
}

fn bench_perturbation(c: &mut Criterion) {
    let small = population(16);
    let large = population(1024);

    c.bench_function("partition_16", |b| {
        let engine = engine();
        b.iter(|| engine.partition(black_box(&small)))
    });

    c.bench_function("plan_round_1024", |b| {
        let mut engine = engine();
        b.iter(|| engine.plan(black_box(&large)))
    });

    c.bench_function("explore_config", |b| {
        let mut engine = engine();
        let config = small.trials[0].config.clone();
        b.iter(|| engine.explore(black_box(&config)))
    });
}

fn bench_registry(c: &mut Criterion) {
    c.bench_function("registry_report_and_snapshot_64", |b| {
        b.iter_batched(
            || {
                let registry = PopulationRegistry::new(64);
                for i in 0..64 {
                    let _ = registry.register(Trial::new(TrialId::new(i), Configuration::new()));
                }
                registry
            },
            |registry| {
                for step in 1..=5u64 {
                    for i in 0..64 {
                        let _ = registry.report(TrialId::new(i), step, black_box(0.5));
                    }
                }
                registry.snapshot()
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_perturbation, bench_registry);
criterion_main!(benches);
