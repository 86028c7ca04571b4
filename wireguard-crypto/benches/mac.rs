//! Throughput of the two hot primitives the handshake leans on most:
//! plain BLAKE2s hashing and the truncated BLAKE2s-MAC used for mac1/mac2.
fn main() {
    divan::main();
}

#[divan::bench(consts = [16, 148, 1024])]
fn hash<const N: usize>(bencher: divan::Bencher) {
    let msg = vec![0xabu8; N];
    bencher.bench_local(|| wireguard_crypto::hash(&[divan::black_box(&msg)]));
}

#[divan::bench]
fn mac1(bencher: divan::Bencher) {
    let key = [0x11u8; 32];
    let msg = [0x22u8; 116];
    bencher.bench_local(|| wireguard_crypto::mac(divan::black_box(&key), divan::black_box(&msg)));
}
