// Scheduler Performance Benchmarks
// Measures task construction, the serial round-trip path, and fan-out
// completion through the work-stealing deques.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rusty_sched::{make_task, make_task_with_parent, SerialTaskScheduler, TaskScheduler};

fn bench_make_and_execute(c: &mut Criterion) {
    c.bench_function("task_make_execute", |b| {
        b.iter(|| {
            let task = make_task(|| {
                black_box(21u64 * 2);
            });
            task.execute();
        });
    });
}

fn bench_serial_post_and_wait(c: &mut Criterion) {
    let scheduler = SerialTaskScheduler::new();

    c.bench_function("serial_post_and_wait", |b| {
        b.iter(|| {
            let value = scheduler.post_and_wait(|| black_box(6u64 * 7));
            black_box(value);
        });
    });
}

fn bench_fanout_wait(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for children in [64usize, 512] {
        group.bench_function(format!("children_{children}"), |b| {
            let scheduler = rusty_sched::ConcurrentTaskScheduler::with_workers(4);
            let sum = Arc::new(AtomicU64::new(0));

            b.iter(|| {
                let parent = make_task(|| {});
                let handle = parent.handle();
                for i in 0..children as u64 {
                    let sum = Arc::clone(&sum);
                    let child = make_task_with_parent(&handle, move || {
                        sum.fetch_add(i, Ordering::Relaxed);
                    })
                    .unwrap();
                    scheduler.post_task(child);
                }
                scheduler.post_task(parent);
                scheduler.wait(&handle);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_make_and_execute,
    bench_serial_post_and_wait,
    bench_fanout_wait
);
criterion_main!(benches);
