//! Cost of sealing and opening a cookie reply payload (XChaCha20-Poly1305,
//! a different AEAD instance than the transport data path).
use wireguard_crypto::{decrypt_cookie, encrypt_cookie, Cookie, Key};

fn main() {
    divan::main();
}

#[divan::bench]
fn seal(bencher: divan::Bencher) {
    let key = Key::from([0x33u8; 32]);
    let nonce = [0x44u8; 24];
    let aad = [0x55u8; 16];

    bencher
        .with_inputs(|| Cookie([0x66u8; 16]))
        .bench_values(|cookie| encrypt_cookie(cookie, &key, &nonce, divan::black_box(&aad)));
}

#[divan::bench]
fn open(bencher: divan::Bencher) {
    let key = Key::from([0x33u8; 32]);
    let nonce = [0x44u8; 24];
    let aad = [0x55u8; 16];

    bencher
        .with_inputs(|| encrypt_cookie(Cookie([0x66u8; 16]), &key, &nonce, &aad))
        .bench_values(|mut enc| decrypt_cookie(&mut enc, &key, &nonce, divan::black_box(&aad)));
}
