//! Hub merge and fan-out benchmarks.
//!
//! Measures the cost of one inbound update frame going through a hub:
//! decode, CRDT merge and broadcast to every other attached connection.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Instant;
use tandem_core::{ClientConnection, DetachReason, DocumentId, HubRegistry};
use tandem_protocol::{codec, Message};
use yrs::{Doc, ReadTxn, Text, Transact};

/// Typing one character at a time from a single client.
fn keystrokes(count: usize) -> Vec<bytes::Bytes> {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("content");
    (0..count)
        .map(|i| {
            let before = doc.transact().state_vector();
            {
                let mut txn = doc.transact_mut();
                text.insert(&mut txn, i as u32, "x");
            }
            let update = doc.transact().encode_diff_v1(&before);
            codec::encode(&Message::update(update)).unwrap()
        })
        .collect()
}

fn bench_update_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_fanout");

    for peers in [1usize, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(peers), &peers, |b, &peers| {
            b.iter_custom(|iters| {
                let frames = keystrokes(iters as usize);
                let registry = HubRegistry::new();

                let (writer, _writer_rx) = ClientConnection::new("writer", 16);
                let writer = registry.attach(DocumentId::from("bench"), writer).unwrap();
                let mut readers: Vec<_> = (0..peers)
                    .map(|i| {
                        let (conn, rx) = ClientConnection::new(format!("reader-{i}"), 16);
                        let state = registry.attach(DocumentId::from("bench"), conn).unwrap();
                        (state, rx)
                    })
                    .collect();

                let start = Instant::now();
                for frame in &frames {
                    writer.handle_frame(black_box(frame)).unwrap();
                    for (_, rx) in &mut readers {
                        let _ = rx.try_recv();
                    }
                }
                let elapsed = start.elapsed();

                for (state, _) in readers {
                    state.detach(DetachReason::CloseFrame);
                }
                writer.detach(DetachReason::CloseFrame);
                elapsed
            });
        });
    }

    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    let registry = HubRegistry::new();
    let (writer, _rx) = ClientConnection::new("writer", 4096);
    let writer = registry.attach(DocumentId::from("bench"), writer).unwrap();
    for frame in keystrokes(1000) {
        writer.handle_frame(&frame).unwrap();
    }

    let query = codec::encode(&Message::query_state_vector(Vec::new())).unwrap();

    c.bench_function("handshake_1000_edits", |b| {
        b.iter(|| writer.handle_frame(black_box(&query)).unwrap())
    });
}

criterion_group!(benches, bench_update_fanout, bench_handshake);
criterion_main!(benches);
