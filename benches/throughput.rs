//! Throughput benchmarks

use buslink_core::core::protocol::checksum::{crc16_modbus, verify_trailing, ChecksumType};
use buslink_core::core::protocol::modbus::{self, FunctionCode};
use buslink_core::core::timing::inter_frame_silence_us;
use buslink_core::{Bus, BusOptions, ChannelConfig, DeviceTemplates, FrameProfile, SimulatedBus};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn checksum_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..256).map(|i| (i % 256) as u8).collect();

    let mut group = c.benchmark_group("checksum");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("crc16_modbus", |b| {
        b.iter(|| black_box(crc16_modbus(black_box(&data))))
    });

    group.bench_function("verify_trailing", |b| {
        let frame = modbus::with_crc(&data);
        b.iter(|| black_box(verify_trailing(black_box(&frame), ChecksumType::Crc16Modbus).is_ok()))
    });

    group.finish();
}

fn framing_benchmark(c: &mut Criterion) {
    let response = modbus::build_read_response(1, 0x03, &[1, 2, 3, 4, 5, 6, 7, 8]);
    let profile = FrameProfile::modbus_rtu();

    let mut group = c.benchmark_group("framing");

    group.bench_function("expected_response_len", |b| {
        b.iter(|| black_box(modbus::expected_response_len(black_box(&response))))
    });

    group.bench_function("validate_modbus", |b| {
        b.iter(|| black_box(profile.validate(black_box(&response)).is_ok()))
    });

    group.bench_function("inter_frame_silence", |b| {
        b.iter(|| black_box(inter_frame_silence_us(black_box(9600), 8, 1)))
    });

    group.finish();
}

fn transaction_benchmark(c: &mut Criterion) {
    let Ok(runtime) = tokio::runtime::Runtime::new() else {
        return;
    };

    let channel = ChannelConfig::new("bench", 115_200);
    let sim = SimulatedBus::new(channel, DeviceTemplates::modbus_slave(1, vec![0; 16]));
    let options = BusOptions::default().frame(FrameProfile::modbus_rtu());
    let bus = runtime
        .block_on(async { Bus::new(sim, options) })
        .expect("simulated bus");
    let request = modbus::build_rtu_request(1, FunctionCode::ReadHoldingRegisters, 0, 4);

    let mut group = c.benchmark_group("transaction");
    group.sample_size(20);

    group.bench_function("simulated_send_receive", |b| {
        b.to_async(&runtime).iter(|| async {
            let response = bus.send_receive(request.clone()).await.expect("response");
            black_box(response)
        })
    });

    group.finish();
}

criterion_group!(benches, checksum_benchmark, framing_benchmark, transaction_benchmark);
criterion_main!(benches);
