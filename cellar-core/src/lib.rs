//! `cellar-core` is the encrypted, versioned, access-controlled secrets
//! store at the heart of the cellar secrets-management service. It keeps a
//! single process's worth of named secret blobs in a file encrypted with a
//! locally-held data key, itself wrapped by an externally-managed
//! key-encryption key, and arbitrates every read/write through a compiled
//! ACL policy with an audit trail.
//!
//! ## Getting started
//!
//! ```
//! use cellar_core::crypto::{DataKey, KeyEncryptionKey};
//! use cellar_core::error::CResult;
//! use cellar_core::store::Store;
//!
//! struct LocalKek(DataKey);
//!
//! impl KeyEncryptionKey for LocalKek {
//!     fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
//!         self.0.seal(plaintext, aad)
//!     }
//!     fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
//!         self.0.open(ciphertext, aad)
//!     }
//! }
//!
//! fn run() -> CResult<()> {
//!     let dir = tempfile::tempdir().unwrap();
//!     let kek = LocalKek(DataKey::generate());
//!
//!     let mut store = Store::open(dir.path().join("db.json"), &kek)?;
//!     store.put("db/password", b"hunter2".to_vec())?;
//!     let value = store.get("db/password")?;
//!     assert_eq!(value.value, b"hunter2");
//!     Ok(())
//! }
//!
//! run().unwrap();
//! ```

pub mod audit;
pub mod crypto;
pub mod error;
pub mod facade;
pub mod model;
pub mod policy;
pub mod store;
