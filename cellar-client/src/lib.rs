//! A caching client library for talking to a secrets server: a thin RPC
//! shim over the wire protocol, a background-refreshed store layered on
//! top of it, a local mirror for surviving server outages, and a
//! declarative-style field binding helper for structs that want their
//! fields populated straight from secrets.
//!
//! ```no_run
//! # async fn run() -> cellar_core::error::CResult<()> {
//! use cellar_client::store::Builder;
//!
//! let store = Builder::new("https://secrets.example.internal")
//!     .declare(["db/password"])
//!     .open()
//!     .await?;
//!
//! let password = store.secret("db/password").get();
//! # let _ = password;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod fields;
pub mod mirror;
pub mod rpc;
pub mod store;
