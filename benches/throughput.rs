use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stage_dispatch::{
    DispatchConfig, EventContext, FnHandler, QueueFlavor, Scheduling, Sink, StageManager,
    ThreadGroup,
};
use std::sync::Arc;

#[derive(Clone, Copy)]
struct Job {
    key: Option<u64>,
}

impl EventContext for Job {
    fn scheduling(&self) -> Option<Scheduling> {
        Some(match self.key {
            Some(key) => Scheduling::keyed(key),
            None => Scheduling::any(),
        })
    }
}

fn run_stage(flavor: QueueFlavor, threads: usize, jobs: u64, keyed: bool) {
    let manager = StageManager::with_options(
        DispatchConfig::default(),
        flavor,
        Arc::new(stage_dispatch::DefaultThreadGroup) as Arc<dyn ThreadGroup>,
    );
    let stage = manager
        .create_stage::<Job, _>(
            "bench",
            FnHandler::new(|job: Job| {
                black_box(job.key);
                Ok(())
            }),
            threads,
            1024,
        )
        .expect("Create failed");
    manager
        .start_all(&manager.context(), &[], &[])
        .expect("Start failed");

    for i in 0..jobs {
        let job = Job {
            key: keyed.then_some(i % 64),
        };
        stage.add_multi_threaded(black_box(job)).expect("Add failed");
    }
    manager.stop_all().expect("Stop failed");
}

fn benchmark_single_thread(c: &mut Criterion) {
    c.bench_function("single_thread_10000_jobs", |b| {
        b.iter(|| run_stage(QueueFlavor::Channel, 1, 10_000, false));
    });
}

fn benchmark_keyed_fan_out(c: &mut Criterion) {
    c.bench_function("keyed_4_threads_10000_jobs", |b| {
        b.iter(|| run_stage(QueueFlavor::Channel, 4, 10_000, true));
    });
}

fn benchmark_shortest_queue(c: &mut Criterion) {
    c.bench_function("unkeyed_4_threads_10000_jobs", |b| {
        b.iter(|| run_stage(QueueFlavor::Channel, 4, 10_000, false));
    });
}

fn benchmark_ring_buffer(c: &mut Criterion) {
    c.bench_function("ring_buffer_4_threads_10000_jobs", |b| {
        b.iter(|| run_stage(QueueFlavor::RingBuffer { spin: 64 }, 4, 10_000, false));
    });
}

criterion_group!(
    benches,
    benchmark_single_thread,
    benchmark_keyed_fan_out,
    benchmark_shortest_queue,
    benchmark_ring_buffer
);
criterion_main!(benches);
