use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use telemetry_pipeline::{
    BatchConfig, BoundedBuffer, BufferConfig, LogRecord, NullExporter, OverflowPolicy, Provider,
    Severity, SignalKind, SignalRecord,
};

const RECORDS: u64 = 100_000;
const CAPACITY: usize = 4096;

fn record(i: u64) -> SignalRecord {
    SignalRecord::Log(
        LogRecord::new(Severity::Info, "request handled").with_attribute("request.seq", i as i64),
    )
}

fn bench_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer");
    group.throughput(Throughput::Elements(RECORDS));

    for policy in [OverflowPolicy::DropOldest, OverflowPolicy::DropNewest] {
        group.bench_with_input(BenchmarkId::new("enqueue_drain", policy), &policy, |b, &policy| {
            b.iter(|| {
                let buffer = BoundedBuffer::new(
                    SignalKind::Log,
                    BufferConfig {
                        capacity: CAPACITY,
                        overflow_policy: policy,
                        high_watermark: CAPACITY,
                        ..BufferConfig::default()
                    },
                );
                for i in 0..RECORDS {
                    let _ = black_box(buffer.try_enqueue(record(i)));
                    if i % 1024 == 1023 {
                        black_box(buffer.drain(512));
                    }
                }
                black_box(buffer.drain(usize::MAX));
            });
        });
    }

    group.finish();
}

fn bench_provider(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("provider");
    group.sample_size(20);

    for producers in [1_u64, 2, 4] {
        group.throughput(Throughput::Elements(RECORDS * producers));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}P_try_emit", producers)),
            &producers,
            |b, &n| {
                b.iter(|| {
                    let provider = {
                        let _guard = runtime.enter();
                        Arc::new(Provider::new(
                            SignalKind::Log,
                            BufferConfig {
                                capacity: CAPACITY,
                                ..BufferConfig::default()
                            },
                            BatchConfig {
                                export_interval: Duration::from_millis(50),
                                max_export_batch_size: 512,
                            },
                            Arc::new(NullExporter::new()),
                        ))
                    };

                    let handles: Vec<_> = (0..n)
                        .map(|_| {
                            let provider = Arc::clone(&provider);
                            thread::spawn(move || {
                                for i in 0..RECORDS {
                                    black_box(provider.try_emit(record(i)));
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }

                    runtime
                        .block_on(provider.shutdown(Duration::from_secs(10)))
                        .unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_buffer, bench_provider);
criterion_main!(benches);
