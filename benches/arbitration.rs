//! Benchmarks for the arbitration hot paths
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use edge_arbiter::clock::ManualClock;
use edge_arbiter::config::SceneSettings;
use edge_arbiter::coordinator::{SceneMemory, SceneMemoryEntry};
use edge_arbiter::pipeline::PipelineRecord;
use edge_arbiter::publisher::{OutboundMessage, RetryEntry, RetryQueue};
use edge_arbiter::scheduler::ScheduleCycle;
use edge_arbiter::types::{GuaranteeTier, SourceId};
use std::sync::Arc;

fn message(sequence: u32, tier: GuaranteeTier) -> OutboundMessage {
    let source = SourceId::new("cam0");
    let record = PipelineRecord::new(source.clone(), sequence as u64, sequence as u64 * 1000);
    OutboundMessage::data(source, sequence, tier, record, 0)
}

fn bench_slot_wait(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_wait");
    let cycle = ScheduleCycle::new(1000, 200, 5).unwrap();

    group.bench_function("wait_ms", |b| {
        let mut now = 1_700_000_000_000u64;
        b.iter(|| {
            let wait = cycle.wait_ms(black_box(600), now);
            now = now.wrapping_add(37);
            black_box(wait)
        });
    });

    group.bench_function("active_index", |b| {
        let mut now = 1_700_000_000_000u64;
        b.iter(|| {
            let index = cycle.active_index(now);
            now = now.wrapping_add(37);
            black_box(index)
        });
    });

    group.finish();
}

fn bench_retry_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_queue");

    for depth in [100, 1000, 10_000].iter() {
        group.throughput(Throughput::Elements(1));

        // Full ring of one tier: every push evicts the oldest
        group.bench_with_input(BenchmarkId::new("push_evict_same_tier", depth), depth, |b, &depth| {
            let mut queue = RetryQueue::new(depth);
            for seq in 0..depth as u32 {
                queue.push(RetryEntry::new(message(seq, GuaranteeTier::AtLeastOnce), 0, 0));
            }
            let mut seq = depth as u32;
            b.iter(|| {
                let evicted = queue.push(RetryEntry::new(message(seq, GuaranteeTier::AtLeastOnce), 0, 0));
                seq = seq.wrapping_add(1);
                black_box(evicted)
            });
        });

        // Mixed ring: the weakest tier has to be found first
        group.bench_with_input(BenchmarkId::new("push_evict_mixed", depth), depth, |b, &depth| {
            let mut queue = RetryQueue::new(depth);
            for seq in 0..depth as u32 {
                let tier = if seq % 4 == 0 {
                    GuaranteeTier::AtMostOnce
                } else {
                    GuaranteeTier::ExactlyOnce
                };
                queue.push(RetryEntry::new(message(seq, tier), 0, 0));
            }
            let mut seq = depth as u32;
            b.iter(|| {
                let tier = GuaranteeTier::ALL[seq as usize % 3];
                let evicted = queue.push(RetryEntry::new(message(seq, tier), 0, 0));
                seq = seq.wrapping_add(1);
                black_box(evicted)
            });
        });
    }

    group.finish();
}

fn bench_scene_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("scene_memory");

    for depth in [30, 300].iter() {
        let settings = SceneSettings {
            scene_memory_depth: *depth,
            ..SceneSettings::default()
        };
        let memory = SceneMemory::new(&settings, Arc::new(ManualClock::new(0)));
        let source = SourceId::new("cam0");

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("ingest", depth), depth, |b, _| {
            let mut tick = 0u64;
            b.iter(|| {
                let entry = SceneMemoryEntry::new(source.clone(), tick, tick * 1000)
                    .with_motion((tick % 10) as f64 / 10.0)
                    .with_scene_hash(tick as u32);
                memory.ingest(black_box(entry));
                tick += 1;
            });
        });

        group.bench_with_input(BenchmarkId::new("observe", depth), depth, |b, _| {
            let mut tick = 0u64;
            b.iter(|| {
                let entry = SceneMemoryEntry::new(source.clone(), tick, tick * 1000)
                    .with_motion(0.1)
                    .with_scene_hash(0xdead_beef);
                let decision = memory.observe(entry);
                tick += 1;
                black_box(decision)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_slot_wait, bench_retry_queue, bench_scene_memory);
criterion_main!(benches);
