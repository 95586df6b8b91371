use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use paddock_events::{CarTelemetry, TrackInfo};
use paddock_perf::{sample_telemetry, temp_region_name};
use paddock_shm::{ShmConfig, remove_region};
use paddock_topics::{Topic, TopicDispatcher, TopicWriter};

fn track() -> TrackInfo {
    TrackInfo {
        name: "Autódromo José Carlos Pace".into(),
        length_m: 4_309.0,
        country: Some("Brazil".into()),
    }
}

fn bench_tick(c: &mut Criterion) {
    let cfg = ShmConfig::new(temp_region_name("crit_tick")).with_max_msg_size(64 * 1024);
    let mut writer = TopicWriter::create(&cfg).expect("failed to create writer");
    let track = track();

    let mut group = c.benchmark_group("topics");
    group.throughput(Throughput::Elements(1));
    let mut tick = 0u32;
    group.bench_function("tick_two_topics", |b| {
        b.iter(|| {
            tick = tick.wrapping_add(1);
            writer.add_typed(&sample_telemetry(tick));
            writer.add_typed(&track);
            black_box(writer.write().expect("write failed"));
        });
    });
    group.finish();

    drop(writer);
    let _ = remove_region(&cfg.name);
}

fn bench_dispatch(c: &mut Criterion) {
    let mut frame = serde_json::Map::new();
    frame.insert(
        CarTelemetry::NAME.into(),
        serde_json::to_value(sample_telemetry(42)).expect("serialize"),
    );
    frame.insert(
        TrackInfo::NAME.into(),
        serde_json::to_value(track()).expect("serialize"),
    );
    let raw = serde_json::to_vec(&frame).expect("serialize");

    let mut dispatcher = TopicDispatcher::new();
    dispatcher
        .on_typed(|t: CarTelemetry| {
            black_box(t.speed_kph);
            Ok(())
        })
        .expect("register");
    dispatcher
        .on_typed(|t: TrackInfo| {
            black_box(t.length_m);
            Ok(())
        })
        .expect("register");

    let mut group = c.benchmark_group("topics");
    group.throughput(Throughput::Bytes(raw.len() as u64));
    group.bench_function("dispatch_two_topics", |b| {
        b.iter(|| black_box(dispatcher.on_payload(black_box(&raw))));
    });
    group.finish();
}

criterion_group!(benches, bench_tick, bench_dispatch);
criterion_main!(benches);
