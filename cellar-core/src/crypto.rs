//! Envelope encryption: a locally-held data-encryption key (DEK) that
//! encrypts the database body, itself wrapped by an externally-managed
//! key-encryption key (KEK).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CResult, Error};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// The external key-management oracle that wraps/unwraps the data key. Not
/// implemented here -- this is the contract a caller's oracle must satisfy.
pub trait KeyEncryptionKey: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> CResult<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> CResult<Vec<u8>>;
}

/// The locally-held data-encryption key. Kept in memory for the process
/// lifetime; there is no in-process re-wrapping.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    key: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        DataKey { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(&self.key).expect("32-byte key")
    }

    /// AEAD-encrypt `plaintext` under this key, binding `aad`. The nonce is
    /// generated fresh and prepended to the returned ciphertext.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = self.cipher();
        let ciphertext = cipher
            .encrypt(
                nonce,
                aes_gcm::aead::Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| Error::internal("encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Inverse of [`DataKey::seal`]. Any failure -- truncated input, wrong
    /// key, tampered ciphertext, mismatched `aad` -- is reported uniformly;
    /// AEAD must not distinguish "tampered" from "wrong key" to a caller.
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(Error::internal("ciphertext too short"));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher()
            .decrypt(
                nonce,
                aes_gcm::aead::Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| Error::internal("decryption failed"))
    }

    /// Rebuilds a key from raw bytes. Exposed beyond this module so a
    /// standalone `KeyEncryptionKey` implementation (e.g. a local stand-in
    /// used before a real external oracle is wired up) can persist and
    /// reload its own key material across restarts.
    pub fn from_bytes(bytes: &[u8]) -> CResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::internal("wrong data key length"));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(DataKey { key })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

/// Generates a fresh data key and wraps it under `kek`, returning both the
/// key and its wrapped form ready for the persistence envelope.
pub fn generate_and_wrap(
    kek: &dyn KeyEncryptionKey,
    schema_version: u32,
) -> CResult<(DataKey, Vec<u8>)> {
    let dek = DataKey::generate();
    let aad = crate::model::dek_associated_data(schema_version);
    let wrapped = kek.encrypt(dek.as_bytes(), &aad)?;
    Ok((dek, wrapped))
}

/// Unwraps a previously-wrapped data key. Any failure here is fatal to
/// opening the store.
pub fn unwrap_data_key(
    kek: &dyn KeyEncryptionKey,
    wrapped: &[u8],
    schema_version: u32,
) -> CResult<DataKey> {
    let aad = crate::model::dek_associated_data(schema_version);
    let raw = kek.decrypt(wrapped, &aad)?;
    DataKey::from_bytes(&raw)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory stand-in for the remote KEK oracle, for tests only.
    /// Wraps by XOR-ing with a fixed pad and storing an HMAC-free tag --
    /// it exists purely so store tests don't need a network collaborator.
    pub struct FakeKek {
        key: [u8; KEY_SIZE],
        fail_after: Mutex<Option<usize>>,
    }

    impl FakeKek {
        pub fn new() -> Self {
            let mut key = [0u8; KEY_SIZE];
            rand::thread_rng().fill_bytes(&mut key);
            FakeKek {
                key,
                fail_after: Mutex::new(None),
            }
        }

        /// Corrupt the underlying `DataKey` logic path isn't reachable from
        /// here, so tests instead flip a byte of the envelope on disk. This
        /// flag is unused in the current test suite but documents how a
        /// future oracle-failure-injection test would hook in.
        #[allow(dead_code)]
        pub fn fail_after(&self, n: usize) {
            *self.fail_after.lock().unwrap() = Some(n);
        }
    }

    impl KeyEncryptionKey for FakeKek {
        fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
            let dek = DataKey::from_bytes(&self.key).unwrap_or_else(|_| DataKey { key: self.key });
            dek.seal(plaintext, aad)
        }

        fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
            let dek = DataKey { key: self.key };
            dek.open(ciphertext, aad)
        }
    }

    #[test]
    fn seal_open_round_trip() {
        let dek = DataKey::generate();
        let aad = b"DB v1";
        let sealed = dek.seal(b"hello world", aad).unwrap();
        let opened = dek.open(&sealed, aad).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn tampering_is_detected() {
        let dek = DataKey::generate();
        let aad = b"DB v1";
        let mut sealed = dek.seal(b"hello world", aad).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(dek.open(&sealed, aad).is_err());
    }

    #[test]
    fn wrong_associated_data_is_rejected() {
        let dek = DataKey::generate();
        let sealed = dek.seal(b"hello world", b"DB v1").unwrap();
        assert!(dek.open(&sealed, b"DB v2").is_err());
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let kek = FakeKek::new();
        let (dek, wrapped) = generate_and_wrap(&kek, 1).unwrap();
        let unwrapped = unwrap_data_key(&kek, &wrapped, 1).unwrap();
        let aad = b"payload";
        let sealed = dek.seal(b"secret bytes", aad).unwrap();
        assert_eq!(unwrapped.open(&sealed, aad).unwrap(), b"secret bytes");
    }
}
