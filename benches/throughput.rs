//! Throughput Benchmark for SparkKV
//!
//! Measures the request path without sockets: framing pipelined input with
//! the resumable decoder, and running decoded batches through the
//! dispatcher.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use sparkkv::config::Config;
use sparkkv::connection::{Dispatcher, Session};
use sparkkv::protocol::RequestDecoder;
use sparkkv::server::{ServerContext, ServerStats};
use sparkkv::storage::{SetCondition, StorageEngine};
use std::sync::Arc;

fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// `count` pipelined `SET key:i value` commands.
fn pipelined_sets(count: usize, value: &[u8]) -> Vec<u8> {
    (0..count)
        .flat_map(|i| encode_command(&[b"SET", format!("key:{}", i).as_bytes(), value]))
        .collect()
}

fn create_context() -> Arc<ServerContext> {
    Arc::new(ServerContext::new(
        Config::default(),
        Arc::new(StorageEngine::new()),
    ))
}

/// Benchmark decoding of pipelined input
fn bench_decode(c: &mut Criterion) {
    let stats = ServerStats::new();

    let mut group = c.benchmark_group("decode");

    for (name, value_len) in [("small", 16), ("medium", 1024), ("large", 64 * 1024)] {
        let input = pipelined_sets(100, &vec![b'x'; value_len]);
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_function(format!("pipeline_100_{}", name), |b| {
            b.iter_batched(
                || BytesMut::from(&input[..]),
                |mut buf| {
                    let mut decoder = RequestDecoder::default();
                    decoder.decode(&mut buf, &stats).unwrap();
                    black_box(decoder.take_batch())
                },
                BatchSize::SmallInput,
            );
        });
    }

    // Same input delivered in 7-byte reads: exercises suspension and resume
    let input = pipelined_sets(100, b"value");
    group.throughput(Throughput::Bytes(input.len() as u64));
    group.bench_function("fragmented_7_byte_reads", |b| {
        b.iter(|| {
            let mut decoder = RequestDecoder::default();
            let mut buf = BytesMut::new();
            for chunk in input.chunks(7) {
                buf.extend_from_slice(chunk);
                decoder.decode(&mut buf, &stats).unwrap();
            }
            black_box(decoder.take_batch())
        });
    });

    group.finish();
}

/// Benchmark batch execution through the dispatcher
fn bench_dispatch(c: &mut Criterion) {
    let ctx = create_context();
    for i in 0..10_000 {
        ctx.storage.set(
            Bytes::from(format!("key:{}", i)),
            Bytes::from("value"),
            None,
            SetCondition::Always,
        );
    }
    let (mut session, _mailbox) =
        Session::new(ctx.next_session_id(), "127.0.0.1:1".parse().unwrap(), Arc::clone(&ctx));
    let dispatcher = Dispatcher::new(&ctx);

    let gets: Vec<u8> = (0..100)
        .flat_map(|i| encode_command(&[b"GET", format!("key:{}", i * 97).as_bytes()]))
        .collect();
    let sets = pipelined_sets(100, b"value");
    let mixed: Vec<u8> = (0..100)
        .flat_map(|i| {
            if i % 5 == 0 {
                encode_command(&[b"INCR", b"counter"])
            } else {
                encode_command(&[b"GET", format!("key:{}", i).as_bytes()])
            }
        })
        .collect();

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(100));

    for (name, input) in [("get_100", &gets), ("set_100", &sets), ("mixed_80_20", &mixed)] {
        group.bench_function(name, |b| {
            b.iter(|| {
                session.feed(input).unwrap();
                dispatcher.run_batch(&mut session);
                black_box(session.take_outbound())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode, bench_dispatch);

criterion_main!(benches);
