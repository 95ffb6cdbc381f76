use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use parley_relay::protocol::{ChatMessage, Envelope, Modality, RoomId, UserName};
use parley_relay::registry::RoomRegistry;
use parley_relay::room::{ConnectionId, Peer, Room};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

fn sample_chat() -> Envelope {
    Envelope::Chat(ChatMessage::new(
        "Alice",
        "The quick brown fox jumps over the lazy dog",
        Modality::Speech,
    ))
}

fn bench_chat_encode(c: &mut Criterion) {
    let envelope = sample_chat();

    c.bench_function("chat_encode", |b| {
        b.iter(|| black_box(black_box(&envelope).encode().unwrap()))
    });
}

fn bench_chat_decode(c: &mut Criterion) {
    let frame = sample_chat().encode().unwrap();

    c.bench_function("chat_decode", |b| {
        b.iter(|| black_box(Envelope::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_broadcast_100_peers(c: &mut Criterion) {
    let room = Room::new(RoomId::resolve(Some("bench")));
    let mut receivers = Vec::with_capacity(100);
    for i in 0..100 {
        let (tx, rx) = mpsc::channel(16);
        room.join(Peer::new(
            ConnectionId::new(),
            UserName::resolve(Some(&format!("Peer{i}"))),
            tx,
        ));
        receivers.push(rx);
    }
    let envelope = sample_chat();

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            room.broadcast(black_box(&envelope));
            for rx in receivers.iter_mut() {
                while let Ok(frame) = rx.try_recv() {
                    black_box(frame);
                }
            }
        })
    });
}

fn bench_join_leave(c: &mut Criterion) {
    let registry = RoomRegistry::new();
    let room_id = RoomId::resolve(Some("churn"));
    // Keep one resident so the room is not recreated every iteration
    let (resident_tx, _resident_rx) = mpsc::channel::<Message>(1);
    registry.join_room(
        &room_id,
        Peer::new(ConnectionId::new(), UserName::resolve(None), resident_tx),
    );

    c.bench_function("registry_join_leave", |b| {
        b.iter(|| {
            let (tx, _rx) = mpsc::channel::<Message>(1);
            let id = ConnectionId::new();
            registry.join_room(&room_id, Peer::new(id, UserName::resolve(None), tx));
            black_box(registry.leave_room(&room_id, &id));
        })
    });
}

criterion_group!(
    benches,
    bench_chat_encode,
    bench_chat_decode,
    bench_broadcast_100_peers,
    bench_join_leave,
);
criterion_main!(benches);
