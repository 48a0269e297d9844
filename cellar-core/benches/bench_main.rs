use cellar_core::crypto::{DataKey, KeyEncryptionKey};
use cellar_core::error::CResult;
use cellar_core::store::Store;
use criterion::{criterion_group, criterion_main, Criterion};

/// A local stand-in KEK, just enough to open a store for benchmarking --
/// mirrors the in-crate test fake, but benches are their own compilation
/// unit and can't reach a `#[cfg(test)]` item.
struct LocalKek(DataKey);

impl KeyEncryptionKey for LocalKek {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
        self.0.seal(plaintext, aad)
    }
    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
        self.0.open(ciphertext, aad)
    }
}

fn bench_put(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let kek = LocalKek(DataKey::generate());
    let mut store = Store::open(dir.path().join("db.json"), &kek).unwrap();

    c.bench_function("put_1kb", |b| {
        b.iter(|| {
            store.put("bench/secret", vec![0u8; 1024]).unwrap();
        })
    });
}

fn bench_get(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let kek = LocalKek(DataKey::generate());
    let mut store = Store::open(dir.path().join("db.json"), &kek).unwrap();
    store.put("bench/secret", vec![0u8; 1024]).unwrap();

    c.bench_function("get_1kb", |b| {
        b.iter(|| store.get("bench/secret").unwrap())
    });
}

criterion_group!(benches, bench_put, bench_get);
criterion_main!(benches);
