//! Exploration benchmarks: a racy two-writer program, systematically and
//! under the seed-driven scheduler.

use criterion::{criterion_group, criterion_main, Criterion};
use weft::exec::{MemoryModel, DEFAULT_CAPABILITIES};
use weft::explore::{sct_bounded, Bounds};
use weft::program::{self, Program};
use weft::RandomScheduler;

fn two_writer_program() -> Program<u32> {
    program::new_cref(0_u32).and_then(|cell| {
        program::new_mvar::<()>().and_then(move |done1| {
            program::new_mvar::<()>().and_then(move |done2| {
                program::fork(program::write_cref(cell, 1).then(program::put_mvar(done1, ())))
                    .then(program::fork(
                        program::write_cref(cell, 2).then(program::put_mvar(done2, ())),
                    ))
                    .then(program::take_mvar(done1))
                    .then(program::take_mvar(done2))
                    .then(program::read_cref(cell))
            })
        })
    })
}

fn bench_systematic(c: &mut Criterion) {
    c.bench_function("sct_two_writers_sc", |b| {
        b.iter(|| {
            sct_bounded(
                MemoryModel::SequentialConsistency,
                Bounds::default(),
                two_writer_program,
            )
        });
    });

    c.bench_function("sct_two_writers_tso", |b| {
        b.iter(|| {
            sct_bounded(
                MemoryModel::TotalStoreOrder,
                Bounds::default(),
                two_writer_program,
            )
        });
    });
}

fn bench_single_run(c: &mut Criterion) {
    c.bench_function("random_scheduler_run", |b| {
        b.iter(|| {
            let mut sched = RandomScheduler::new(0xDEAD_BEEF);
            weft::run_concurrency(
                &mut sched,
                MemoryModel::SequentialConsistency,
                DEFAULT_CAPABILITIES,
                two_writer_program(),
            )
        });
    });
}

criterion_group!(benches, bench_systematic, bench_single_run);
criterion_main!(benches);
