use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use radio_protocol::control::{ControlMessage, RexmitRequest, MAX_REXMIT_MSG_LEN};
use radio_protocol::packet::AudioPacket;
use radio_protocol::playback::{Playback, PlaybackPolicy};

fn bench_audio_packet_serialize(c: &mut Criterion) {
    let payload = Bytes::from(vec![0u8; 512]); // Default payload size
    let packet = AudioPacket::new(1_700_000_000, 512 * 1000, payload);

    let mut group = c.benchmark_group("audio_packet");
    group.throughput(Throughput::Bytes(packet.size() as u64));

    group.bench_function("serialize", |b| {
        b.iter(|| {
            let bytes = black_box(&packet).to_bytes();
            black_box(bytes);
        });
    });

    let bytes = packet.to_bytes();
    group.bench_function("deserialize", |b| {
        b.iter(|| {
            let packet = AudioPacket::from_bytes(black_box(&bytes)).unwrap();
            black_box(packet);
        });
    });

    group.finish();
}

fn bench_control_messages(c: &mut Criterion) {
    let reply = b"BOREWICZ_HERE 239.10.11.12 25826 Radio Jazz\n";
    c.bench_function("control_parse_reply", |b| {
        b.iter(|| {
            let msg = ControlMessage::parse(black_box(reply)).unwrap();
            black_box(msg);
        });
    });

    let ids: Vec<u64> = (0..2000).map(|i| i * 512).collect();
    c.bench_function("rexmit_encode_2000_ids", |b| {
        b.iter(|| {
            let datagrams = RexmitRequest::encode_batched(black_box(&ids), MAX_REXMIT_MSG_LEN);
            black_box(datagrams);
        });
    });

    let encoded = RexmitRequest::encode_batched(&ids, MAX_REXMIT_MSG_LEN);
    c.bench_function("rexmit_parse_2000_ids", |b| {
        b.iter(|| {
            let msg = ControlMessage::parse(black_box(&encoded[0])).unwrap();
            black_box(msg);
        });
    });
}

fn bench_playback_ingest(c: &mut Criterion) {
    let datagrams: Vec<_> = (0..128u64)
        .map(|i| AudioPacket::new(1, i * 512, Bytes::from(vec![0u8; 512])).to_bytes())
        .collect();

    c.bench_function("playback_ingest_and_drain_128", |b| {
        b.iter(|| {
            let mut playback = Playback::new(PlaybackPolicy::default());
            for datagram in &datagrams {
                let _ = playback.on_datagram(black_box(datagram));
            }
            while let Ok(Some(frame)) = playback.next_frame() {
                black_box(frame);
            }
        });
    });
}

criterion_group!(
    benches,
    bench_audio_packet_serialize,
    bench_control_messages,
    bench_playback_ingest
);
criterion_main!(benches);
