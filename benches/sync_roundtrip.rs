//! Sync handshake round-trip benchmarks.
//!
//! Measures the cost of the one primitive every server-to-server
//! interaction funnels through: a `do_sync` rendezvous over the in-memory
//! `ChannelTransport`, plus the cheaper fire-and-forget `send_oneshot` path.

use adlb_rt::data::RefDelta;
use adlb_rt::sync::{SyncEngine, SyncMode};
use adlb_rt::transport::ChannelMesh;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::thread;

fn bench_send_oneshot(c: &mut Criterion) {
    let (_mesh, mut transports) = ChannelMesh::new(&[0, 1]);
    let t1 = transports.pop().unwrap();
    let t0 = transports.pop().unwrap();
    let engine = SyncEngine::new(0, 64);

    // Drain the peer's inbox as fast as it fills so the bench measures
    // send throughput, not channel backpressure.
    let drain = thread::spawn(move || loop {
        if t1.try_recv(None).is_none() {
            thread::yield_now();
        }
    });

    c.bench_function("sync_send_oneshot", |b| {
        b.iter(|| {
            black_box(engine.send_oneshot(&t0, 1, SyncMode::Refcount { id: 1, delta: RefDelta { read: 0, write: -1 } }).unwrap());
        });
    });

    drop(drain);
}

fn bench_do_sync_rendezvous(c: &mut Criterion) {
    let (_mesh, mut transports) = ChannelMesh::new(&[0, 1]);
    let t1 = transports.pop().unwrap();
    let t0 = transports.pop().unwrap();

    let responder = thread::spawn(move || {
        let mut engine = SyncEngine::new(1, 64);
        while !engine.shutdown_seen() {
            let _ = engine.poll_incoming(&t1, |_from, mode| match mode {
                SyncMode::Request => Some(SyncMode::Request),
                _ => None,
            });
            thread::yield_now();
        }
    });

    let mut engine0 = SyncEngine::new(0, 64);
    c.bench_function("sync_do_sync_rendezvous", |b| {
        b.iter(|| {
            let reply = engine0.do_sync(&t0, 1, SyncMode::Request, &mut |_from, _mode| None).unwrap();
            black_box(reply);
        });
    });

    let _ = engine0.send_oneshot(&t0, 1, SyncMode::Shutdown);
    responder.join().unwrap();
}

criterion_group!(benches, bench_send_oneshot, bench_do_sync_rendezvous);
criterion_main!(benches);
