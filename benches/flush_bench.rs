//! Serializer and flush-path benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use plexus_engine::{
    serialize_batch, Client, Clock, Hal, Measurement, OutcomeClass, PlexusConfig, PlexusResult,
    Transport, WireBatch, DEFAULT_JSON_BUFFER_SIZE, DEFAULT_MAX_METRICS,
};

/// Accepts every payload without touching the network
struct NullTransport;

impl Transport for NullTransport {
    fn send(&mut self, _endpoint: &str, _api_key: &str, _user_agent: &str, body: &[u8]) -> OutcomeClass {
        black_box(body);
        OutcomeClass::Success
    }
}

/// Frozen clock; delays return immediately
struct FrozenClock;

impl Clock for FrozenClock {
    fn tick_ms(&self) -> u32 {
        0
    }

    fn epoch_ms(&self) -> u64 {
        1_700_000_000_000
    }

    fn delay_ms(&self, _ms: u32) {}
}

fn full_queue() -> PlexusResult<Vec<Measurement>> {
    (0..DEFAULT_MAX_METRICS)
        .map(|i| -> PlexusResult<Measurement> {
            match i % 3 {
                0 => Ok(Measurement::new(format!("sensor.{}", i), i as f64 * 0.5)?
                    .at(1_700_000_000_000 + i as u64)),
                1 => Measurement::new(format!("flag.{}", i), i % 2 == 0),
                _ => Measurement::new(format!("state.{}", i), "nominal")?.with_tag("zone", "a"),
            }
        })
        .collect()
}

fn bench_serialize(c: &mut Criterion) {
    let points = match full_queue() {
        Ok(points) => points,
        Err(e) => panic!("bench queue build failed: {}", e),
    };
    let mut buf = vec![0u8; DEFAULT_JSON_BUFFER_SIZE * 2];
    c.bench_function("serialize_full_queue", |b| {
        b.iter(|| {
            let batch = WireBatch {
                points: black_box(&points),
                source_id: "bench-device",
                session_id: Some("bench-session"),
            };
            serialize_batch(&batch, &mut buf)
        })
    });
}

fn bench_enqueue_flush(c: &mut Criterion) {
    let mut config = PlexusConfig::default();
    config.client.json_buffer_size = DEFAULT_JSON_BUFFER_SIZE * 2;
    config.flush.auto_flush_count = 0;
    config.flush.auto_flush_interval_ms = 0;
    let mut client = match Client::init_with_config(
        "bench_key",
        "bench-device",
        &config,
        Hal::new(NullTransport, FrozenClock),
    ) {
        Ok(client) => client,
        Err(e) => panic!("bench client init failed: {}", e),
    };

    c.bench_function("enqueue_16_then_flush", |b| {
        b.iter(|| {
            for i in 0..16 {
                let _ = client.send_number("bench.value", black_box(i as f64));
            }
            client.flush()
        })
    });
}

criterion_group!(benches, bench_serialize, bench_enqueue_flush);
criterion_main!(benches);
