//! Performance benchmarks for paystream-crypto.
//!
//! Run with: `cargo bench -p paystream-crypto`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use paystream_crypto::aead::PacketCipher;
use paystream_crypto::token::Token;
use paystream_crypto::{ServerSecret, SharedSecret};

// ============================================================================
// AEAD Benchmarks
// ============================================================================

fn bench_packet_encrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encrypt");
    let cipher = PacketCipher::new(&SharedSecret::from_bytes([0x42; 32]));

    for size in [64, 256, 1024, 4096, 16384, 32767] {
        let plaintext = vec![0xAA; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| cipher.encrypt(black_box(&plaintext)))
        });
    }

    group.finish();
}

fn bench_packet_decrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_decrypt");
    let cipher = PacketCipher::new(&SharedSecret::from_bytes([0x42; 32]));

    for size in [64, 256, 1024, 4096, 16384, 32767] {
        let sealed = cipher.encrypt(&vec![0xAA; size]).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| cipher.decrypt(black_box(&sealed)))
        });
    }

    group.finish();
}

// ============================================================================
// Derivation Benchmarks
// ============================================================================

fn bench_first_contact(c: &mut Criterion) {
    // Server-side cost of authenticating an unseen token: derive + trial decrypt.
    let server = ServerSecret::from_bytes([7; 32]);
    let token = Token::from_bytes([3; 18]);
    let sealed = PacketCipher::new(&token.shared_secret(&server))
        .encrypt(&[0u8; 256])
        .unwrap();

    c.bench_function("first_contact_probe", |b| {
        b.iter(|| {
            let secret = black_box(token).shared_secret(&server);
            PacketCipher::new(&secret).decrypt(black_box(&sealed))
        })
    });
}

fn bench_fulfillment(c: &mut Criterion) {
    let cipher = PacketCipher::new(&SharedSecret::from_bytes([0x11; 32]));
    let data = vec![0x55; 1024];

    c.bench_function("condition_1k", |b| {
        b.iter(|| cipher.condition(black_box(&data)))
    });
}

criterion_group!(
    benches,
    bench_packet_encrypt,
    bench_packet_decrypt,
    bench_first_contact,
    bench_fulfillment
);
criterion_main!(benches);
