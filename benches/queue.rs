//! Throughput of the render-side adjustment queue
//!
//! One iteration pushes and reads a 10ms block of 48 kHz stereo S16,
//! optionally with a latency correction seek in between.

use audioloop::audio::queue::AdjustmentQueue;
use audioloop::audio::spec::{SampleFormat, SampleSpec};
use audioloop::QUEUE_MAX_LENGTH;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn bench_push_read(c: &mut Criterion) {
    let spec = SampleSpec::new(SampleFormat::S16Le, 48000, 2);
    let block = vec![0x11u8; spec.usec_to_bytes(10_000)];
    let mut out = vec![0u8; block.len()];

    let mut group = c.benchmark_group("adjustment_queue");
    group.throughput(Throughput::Bytes(block.len() as u64));

    group.bench_function("push_read_10ms", |b| {
        let mut queue = AdjustmentQueue::new(&spec, QUEUE_MAX_LENGTH);
        queue.push(&block);
        b.iter(|| {
            queue.push(black_box(&block));
            black_box(queue.read_into(&mut out));
        });
    });

    group.bench_function("push_seek_read_10ms", |b| {
        let mut queue = AdjustmentQueue::new(&spec, QUEUE_MAX_LENGTH);
        queue.push(&block);
        let frame = spec.frame_size() as i64;
        let mut forward = true;
        b.iter(|| {
            queue.push(black_box(&block));
            queue.seek_relative(if forward { 4 * frame } else { -4 * frame });
            forward = !forward;
            black_box(queue.read_into(&mut out));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_push_read);
criterion_main!(benches);
