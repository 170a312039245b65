use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use msgboard_core::{BusConfig, DomainEvent, EventBus, Message, MessageStore, Topic};
use tokio::runtime::Runtime;

fn bench_publish_fan_out(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let bus = EventBus::new(BusConfig { session_capacity: 2048 });

    // 100 observers on the same topic
    let mut sessions = Vec::new();
    rt.block_on(async {
        for _ in 0..100 {
            let session = bus.open_session();
            session.subscribe(Topic::MessageAdded).await.unwrap();
            sessions.push(session);
        }
    });

    let event = DomainEvent::Added(Message::new("1", "hello"));
    c.bench_function("publish_100_sessions", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(bus.publish(black_box(event.clone())).await);
            });
            for session in &mut sessions {
                black_box(session.drain(16).unwrap());
            }
        })
    });
}

fn bench_store_add(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = MessageStore::default();
    let mut session = store.bus().open_session();
    rt.block_on(async {
        session.subscribe(Topic::MessageAdded).await.unwrap();
    });

    c.bench_function("store_add_with_observer", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(store.add(black_box("benchmark message")).await.unwrap());
            });
            black_box(session.drain(16).unwrap());
        })
    });
}

fn bench_list_snapshot(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = MessageStore::default();
    rt.block_on(async {
        for i in 0..1000 {
            store.add(format!("message {i}")).await.unwrap();
        }
    });

    c.bench_function("list_1000_messages", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(store.list().await);
            });
        })
    });
}

criterion_group!(benches, bench_publish_fan_out, bench_store_add, bench_list_snapshot);
criterion_main!(benches);
