//! End-to-end benchmarks: connection setup, data throughput and money
//! throughput between a client and server over an in-memory plugin pair.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use paystream_integration_tests::fixtures::ServerClientFixture;

/// Handshake plus the server announcing the connection
fn bench_connection_setup(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("connection_setup");

    group.bench_function("handshake", |b| {
        b.iter(|| {
            rt.block_on(async {
                let fx = ServerClientFixture::new().await;
                let (client, server_side) = fx.connect(None).await;
                black_box(server_side.id().len());
                client.close().await.unwrap();
            })
        });
    });

    group.finish();
}

/// Bytes written on one stream until the reader has all of them
fn bench_data_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("data_throughput");
    group.sample_size(10);

    for size in [16 * 1024, 256 * 1024, 1024 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let payload = vec![0xAA; size];
            b.iter(|| {
                rt.block_on(async {
                    let fx = ServerClientFixture::new().await;
                    let (client, server_side) = fx.connect(None).await;
                    let stream = client.create_stream().await.unwrap();
                    let writer = {
                        let payload = payload.clone();
                        tokio::spawn(async move {
                            stream.write(&payload).await.unwrap();
                            stream.close().await.unwrap();
                        })
                    };

                    let incoming = server_side.accept_stream().await.unwrap();
                    let mut total = 0;
                    while let Some(chunk) = incoming.read().await.unwrap() {
                        total += chunk.len();
                    }
                    writer.await.unwrap();
                    assert_eq!(total, size);
                    client.close().await.unwrap();
                })
            });
        });
    }

    group.finish();
}

/// Money sent under a path limit that forces the payment into many packets
fn bench_money_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("money_throughput");
    group.sample_size(10);

    for packets in [10u64, 100, 1000] {
        group.throughput(Throughput::Elements(packets));
        group.bench_with_input(BenchmarkId::from_parameter(packets), &packets, |b, &packets| {
            b.iter(|| {
                rt.block_on(async {
                    let fx = ServerClientFixture::new().await;
                    let (client, _server_side) = fx.connect(None).await;
                    fx.client_plugin.set_max_packet_amount(100);
                    let stream = client.create_stream().await.unwrap();
                    stream.send_money(packets * 100).await.unwrap();
                    black_box(stream.total_sent());
                    client.close().await.unwrap();
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_connection_setup,
    bench_data_throughput,
    bench_money_throughput,
);
criterion_main!(benches);
