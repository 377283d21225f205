//! Timing for the protocol's hot primitives.
//!
//! The password derivation bench exists to justify the bcrypt cost
//! choice: the derivation should sit near the per-message read deadline
//! so a cheating consumer cannot brute-force bundles faster than the
//! exchange produces them.

use divan::Bencher;
use p3::keys::PrivateKey;
use p3::{aead, password};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;

fn main() {
    divan::main();
}

#[divan::bench]
fn aead_encrypt(bencher: Bencher) {
    let mut rng = ChaChaRng::seed_from_u64(0xB0B);
    let key = rng.gen::<[u8; 32]>();
    let nonce = rng.gen::<[u8; 12]>();
    let mut plaintext = vec![0u8; 1024];
    rng.fill(plaintext.as_mut_slice());

    bencher.bench(|| aead::encrypt(&key, &nonce, &plaintext).unwrap());
}

#[divan::bench]
fn aead_decrypt(bencher: Bencher) {
    let mut rng = ChaChaRng::seed_from_u64(0xB0B);
    let key = rng.gen::<[u8; 32]>();
    let nonce = rng.gen::<[u8; 12]>();
    let mut plaintext = vec![0u8; 1024];
    rng.fill(plaintext.as_mut_slice());
    let ciphertext = aead::encrypt(&key, &nonce, &plaintext).unwrap();

    bencher.bench(|| aead::decrypt(&key, &nonce, &ciphertext).unwrap());
}

#[divan::bench(sample_count = 1, sample_size = 1)]
fn password_derivation(bencher: Bencher) {
    let password = password::generate_plain_password();
    let salt = password::generate_salt();

    bencher.bench(|| password::derive_key(&password, &salt).unwrap());
}

#[divan::bench(sample_count = 3, sample_size = 1)]
fn ephemeral_keygen(bencher: Bencher) {
    bencher.bench(|| PrivateKey::generate().unwrap());
}

#[divan::bench]
fn sign_and_verify(bencher: Bencher) {
    let mut rng = ChaChaRng::seed_from_u64(0xB0B);
    let key = PrivateKey::generate_with(&mut rng).unwrap();
    let public = key.public();

    bencher.bench(|| {
        let signature = key.sign(b"envelope content").unwrap();
        public.verify(b"envelope content", &signature).unwrap();
    });
}

#[divan::bench]
fn pseudonym(bencher: Bencher) {
    let mut rng = ChaChaRng::seed_from_u64(0xB0B);
    let key = PrivateKey::generate_with(&mut rng).unwrap().public();

    bencher.bench(|| key.pseudonym().unwrap());
}
