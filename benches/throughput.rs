use criterion::{black_box, criterion_group, criterion_main, Criterion};
use modbus_link::{MbapHeader, PduBuilder, Request};

fn bench_mbap(c: &mut Criterion) {
    let request = Request::read_holding_registers(1, 0x006B, 3)
        .unwrap()
        .with_transaction_id(0x1234);
    let encoded = MbapHeader::create(&request).unwrap().encode();

    c.bench_function("mbap_create_encode", |b| {
        b.iter(|| MbapHeader::create(black_box(&request)).unwrap().encode())
    });
    c.bench_function("mbap_decode", |b| {
        b.iter(|| MbapHeader::decode(black_box(&encoded)).unwrap())
    });
}

fn bench_requests(c: &mut Criterion) {
    let registers: Vec<u16> = (0..100).collect();
    let coils: Vec<bool> = (0..1000).map(|i| i % 3 == 0).collect();

    c.bench_function("pdu_builder_read", |b| {
        b.iter(|| {
            PduBuilder::new()
                .function_code(0x03)
                .unwrap()
                .address(black_box(0x0100))
                .unwrap()
                .quantity(black_box(10))
                .unwrap()
                .build()
        })
    });
    c.bench_function("write_multiple_registers_100", |b| {
        b.iter(|| Request::write_multiple_registers(1, 0, black_box(&registers)).unwrap())
    });
    c.bench_function("write_multiple_coils_1000", |b| {
        b.iter(|| Request::write_multiple_coils(1, 0, black_box(&coils)).unwrap())
    });
}

criterion_group!(benches, bench_mbap, bench_requests);
criterion_main!(benches);
