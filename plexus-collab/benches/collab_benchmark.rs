use criterion::{black_box, criterion_group, criterion_main, Criterion};
use plexus_collab::broadcast::BroadcastGroup;
use plexus_collab::client::OfflineQueue;
use plexus_collab::presence::PresenceState;
use plexus_collab::protocol::{AwarenessEntry, AwarenessUpdate, Frame, SyncMessage};
use plexus_collab::storage::{
    DocumentStore, PendingUpdate, PersistenceConfig, PersistenceEngine, StoreConfig,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;
use yrs::{Doc, Map, ReadTxn, StateVector, Transact};

fn element_update(client_id: u64, key: &str) -> Vec<u8> {
    let doc = Doc::with_client_id(client_id);
    let map = doc.get_or_insert_map("elements");
    map.insert(&mut doc.transact_mut(), key, "shape");
    let update = doc.transact().encode_state_as_update_v1(&StateVector::default());
    update
}

fn bench_frame_encode(c: &mut Criterion) {
    let message = SyncMessage::Update(vec![0u8; 64]);

    c.bench_function("sync_frame_encode_64B", |b| {
        b.iter(|| black_box(Frame::sync(black_box(&message)).encode()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = Frame::sync(&SyncMessage::Update(vec![0u8; 64])).encode();

    c.bench_function("sync_frame_decode_64B", |b| {
        b.iter(|| {
            let frame = Frame::decode(black_box(&encoded), usize::MAX).unwrap();
            black_box(frame.as_sync().unwrap());
        })
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let update = AwarenessUpdate {
        entries: (0..20)
            .map(|i| AwarenessEntry {
                client_id: i,
                clock: 3,
                state: Some(format!(r#"{{"cursor":{{"x":{i},"y":40}},"name":"user{i}"}}"#)),
            })
            .collect(),
    };

    c.bench_function("awareness_encode_20_clients", |b| {
        b.iter(|| black_box(Frame::awareness(black_box(&update)).unwrap().encode()))
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let mut group = BroadcastGroup::new(u32::MAX);
    let mut receivers = Vec::new();
    for _ in 0..100 {
        let (tx, rx) = mpsc::channel(1024);
        group.add_member(Uuid::new_v4(), tx);
        receivers.push(rx);
    }
    let frame = Arc::new(Frame::sync(&SyncMessage::Update(vec![0u8; 64])).encode());

    c.bench_function("broadcast_100_members", |b| {
        b.iter(|| {
            black_box(group.broadcast(frame.clone()));
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_presence_apply(c: &mut Criterion) {
    let mut clock = 0u32;
    let mut presence = PresenceState::new();

    c.bench_function("presence_apply_50_clients", |b| {
        b.iter(|| {
            clock += 1;
            let update = AwarenessUpdate {
                entries: (0..50)
                    .map(|i| AwarenessEntry { client_id: i, clock, state: Some("{}".into()) })
                    .collect(),
            };
            black_box(presence.apply(&update, Instant::now()));
        })
    });
}

fn bench_offline_replay(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_replay", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(1000);
            for i in 0..1000u32 {
                queue.enqueue(i.to_le_bytes().to_vec());
            }
            black_box(queue.drain());
        })
    });
}

fn bench_persist_and_load(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let engine = PersistenceEngine::new(store, PersistenceConfig::default());
    let updates: Vec<PendingUpdate> = (0..50)
        .map(|i| PendingUpdate::new(element_update(i, &format!("S{i}")), Some("bench".into()), "remote"))
        .collect();

    c.bench_function("persist_50_updates_and_load", |b| {
        b.iter(|| {
            let doc = Uuid::new_v4();
            engine.append_updates(doc, &updates).unwrap();
            black_box(engine.load_state(doc).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_awareness_encode,
    bench_broadcast_fanout,
    bench_presence_apply,
    bench_offline_replay,
    bench_persist_and_load,
);
criterion_main!(benches);
