use bitflip_injector::prelude::*;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::path::Path;

const ARRAY: u64 = 0x10000;
const WIDTH: usize = 8;

/// Scripted victim running one full sweep over `WIDTH` words
fn victim(handoff: &Path) -> ScriptedBackend {
    let mut program = vec![
        Step::Export {
            path: handoff.to_path_buf(),
            record: HandoffRecord {
                object_address: None,
                base_address: ARRAY,
            },
        },
        Step::Call("addr_label".into()),
    ];
    for _ in 0..WIDTH * WORD_BITS as usize {
        program.push(Step::Call("foo".into()));
        program.push(Step::Call("sync_marker".into()));
    }
    ScriptedBackend::new()
        .routine("addr_label", 0x1000, &["ret"])
        .routine("sync_marker", 0x1100, &["ret"])
        .routine("foo", 0x2000, &["mov", "add", "ret"])
        .region(ARRAY, WIDTH * 8)
        .program(program)
}

fn sweep(handoff: &Path, policy: RestorePolicy) -> InjectionConfig {
    let plan = SweepPlan::Sweep { width: WIDTH };
    InjectionConfig {
        variant: Variant::Memory { plan, policy },
        ..InjectionConfig::memory(plan, handoff)
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let handoff = dir.path().join("addr.txt");

    let mut group = c.benchmark_group("sweep_restore");
    group.warm_up_time(std::time::Duration::from_secs(1));
    group.measurement_time(std::time::Duration::from_secs(10));
    group.sample_size(10);
    group.bench_function("full restore", |b| {
        b.iter_batched(
            || victim(&handoff),
            |mut backend| {
                Injector::new(sweep(&handoff, RestorePolicy::Full))
                    .unwrap()
                    .run(&mut backend)
                    .unwrap()
            },
            BatchSize::SmallInput,
        )
    });
    group.bench_function("selective restore", |b| {
        b.iter_batched(
            || victim(&handoff),
            |mut backend| {
                Injector::new(sweep(&handoff, RestorePolicy::Selective))
                    .unwrap()
                    .run(&mut backend)
                    .unwrap()
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
