use criterion::{criterion_group, criterion_main, Criterion};
use sketchsync_collab::broadcast::BroadcastGroup;
use sketchsync_collab::presence::{CursorColor, Point, PresenceState};
use sketchsync_collab::protocol::{PeerInfo, SyncMessage};
use sketchsync_collab::room_id::RoomId;
use sketchsync_collab::storage::{DocumentStore, StoreConfig};
use sketchsync_core::{ClientId, DocumentEngine, Operation, PropValue, StateVector};
use std::collections::BTreeMap;
use std::hint::black_box;
use std::sync::Arc;

fn room() -> RoomId {
    RoomId::parse("bench-room").unwrap()
}

fn edits(client: ClientId, shapes: usize) -> (DocumentEngine, Vec<Operation>) {
    let mut engine = DocumentEngine::new(client);
    let mut ops = Vec::new();
    for i in 0..shapes {
        let props = BTreeMap::from([
            ("kind".to_string(), PropValue::from("rect")),
            ("x".to_string(), PropValue::from(i as f64)),
        ]);
        let create = engine.create_shape(props).unwrap();
        let set = engine.set_property(create.shape(), "fill", "#ff0000").unwrap();
        ops.push(create);
        ops.push(set);
    }
    (engine, ops)
}

fn bench_delta_encode(c: &mut Criterion) {
    let peer = ClientId::new();
    let (_, ops) = edits(peer, 1);
    let op = &ops[..1];

    c.bench_function("delta_encode_1_op", |b| {
        b.iter(|| {
            let msg = SyncMessage::delta(black_box(peer), &room(), black_box(op)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_delta_decode(c: &mut Criterion) {
    let peer = ClientId::new();
    let (_, ops) = edits(peer, 1);
    let encoded = SyncMessage::delta(peer, &room(), &ops[..1])
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("delta_decode_validate_1_op", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.operations().unwrap());
        })
    });
}

fn bench_catch_up_10k(c: &mut Criterion) {
    let peer = ClientId::new();
    let (engine, _) = edits(peer, 5_000);

    c.bench_function("catch_up_encode_10k_ops", |b| {
        b.iter(|| {
            let ops = engine.diff(black_box(&StateVector::new())).into_ops();
            let msg = SyncMessage::sync_step2(ClientId::nil(), &room(), ops, engine.state_vector())
                .unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_presence_encode(c: &mut Criterion) {
    let peer = ClientId::new();
    let state = PresenceState {
        name: "Alice".to_string(),
        color: Some(CursorColor::from_client(peer)),
        cursor: Some(Point::new(100.0, 200.0)),
        ..PresenceState::default()
    };

    c.bench_function("presence_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::presence(black_box(peer), &room(), black_box(&state)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_broadcast_1000_frames(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_frames_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let peer = PeerInfo::new(format!("Peer{i}"));
                    receivers.push(group.add_peer(peer).await.unwrap());
                }

                let origin = ClientId::new();
                for i in 0..1000u64 {
                    let data = Arc::new(vec![i as u8; 64]);
                    black_box(group.broadcast_raw(origin, black_box(data)));
                }
            });
        })
    });
}

fn bench_snapshot_store(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let (engine, _) = edits(ClientId::new(), 500);
    let snapshot = engine.encode_state().encode().unwrap();
    let room = room();

    c.bench_function("save_snapshot_1k_ops", |b| {
        b.iter(|| {
            store.save_snapshot(&room, black_box(&snapshot)).unwrap();
        })
    });

    c.bench_function("load_snapshot_1k_ops", |b| {
        b.iter(|| {
            black_box(store.load_snapshot(black_box(&room)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_delta_encode,
    bench_delta_decode,
    bench_catch_up_10k,
    bench_presence_encode,
    bench_broadcast_1000_frames,
    bench_snapshot_store,
);
criterion_main!(benches);
