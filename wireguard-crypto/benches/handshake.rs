//! End-to-end cost of each side of a Noise_IKpsk2 handshake: building and
//! opening the initiation, building and opening the response.
use rand::rngs::StdRng;
use rand::SeedableRng;
use tai64::Tai64N;
use wireguard_crypto::{
    consume_initiation, consume_response, create_initiation, create_response, split_transport_keys, HandshakeState,
    LocalIdentity, RemoteIdentity, X25519StaticSecret as StaticSecret,
};

fn main() {
    divan::main();
}

struct Identities {
    local_i: LocalIdentity,
    local_r: LocalIdentity,
    remote_of_i: RemoteIdentity,
    remote_of_r: RemoteIdentity,
    esk_i: StaticSecret,
    esk_r: StaticSecret,
}

fn identities() -> Identities {
    let mut rng = StdRng::seed_from_u64(1234);
    let sk_i = StaticSecret::random_from_rng(&mut rng);
    let sk_r = StaticSecret::random_from_rng(&mut rng);
    let psk = [9u8; 32];

    let local_i = LocalIdentity::new(sk_i);
    let local_r = LocalIdentity::new(sk_r);
    let remote_of_i = RemoteIdentity::new(local_r.public_key, psk);
    let remote_of_r = RemoteIdentity::new(local_i.public_key, psk);

    Identities {
        local_i,
        local_r,
        remote_of_i,
        remote_of_r,
        esk_i: StaticSecret::random_from_rng(&mut rng),
        esk_r: StaticSecret::random_from_rng(&mut rng),
    }
}

#[divan::bench]
fn build_initiation(bencher: divan::Bencher) {
    let ids = identities();
    let now = Tai64N::from_slice(&[0u8; 12]).unwrap();

    bencher.bench_local(|| {
        let mut hs = HandshakeState::default();
        create_initiation(&mut hs, &ids.local_i, &ids.remote_of_i, &ids.esk_i, now, 1, None).unwrap()
    });
}

#[divan::bench]
fn open_initiation_and_build_response(bencher: divan::Bencher) {
    let ids = identities();
    let now = Tai64N::from_slice(&[0u8; 12]).unwrap();

    bencher
        .with_inputs(|| {
            let mut hs_i = HandshakeState::default();
            create_initiation(&mut hs_i, &ids.local_i, &ids.remote_of_i, &ids.esk_i, now, 1, None).unwrap()
        })
        .bench_values(|mut init| {
            let mut hs_r = HandshakeState::default();
            let decrypted = consume_initiation(&mut init, &mut hs_r, &ids.local_r).unwrap();
            create_response(&mut hs_r, decrypted, &ids.esk_r, &ids.remote_of_r, 2, None).unwrap()
        });
}

#[divan::bench]
fn full_handshake_both_sides(bencher: divan::Bencher) {
    let ids = identities();
    let now = Tai64N::from_slice(&[0u8; 12]).unwrap();

    bencher.bench_local(|| {
        let mut hs_i = HandshakeState::default();
        let mut init = create_initiation(&mut hs_i, &ids.local_i, &ids.remote_of_i, &ids.esk_i, now, 1, None).unwrap();

        let mut hs_r = HandshakeState::default();
        let decrypted = consume_initiation(&mut init, &mut hs_r, &ids.local_r).unwrap();

        let mut resp = create_response(&mut hs_r, decrypted, &ids.esk_r, &ids.remote_of_r, 2, None).unwrap();
        consume_response(&mut resp, &mut hs_i, &ids.local_i, &ids.remote_of_i, &ids.esk_i).unwrap();

        (split_transport_keys(&mut hs_i, true), split_transport_keys(&mut hs_r, false))
    });
}
