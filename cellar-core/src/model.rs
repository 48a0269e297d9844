//! Data model: secrets, the database they live in, callers, and the on-disk
//! envelope.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::policy::Rule;

/// A secret version. Zero is reserved as "default / not specified" and is
/// never a key of [`Secret::versions`].
pub type Version = u64;

/// A single named secret: every value it has ever held, plus which one is
/// currently active and the highest version number ever assigned.
///
/// Invariants (enforced by [`crate::store::Store`], never by this type
/// alone): `active_version` is always a key of `versions`; `latest_version`
/// never decreases and is always `>= max(keys(versions))`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Secret {
    #[serde(rename = "Versions")]
    pub versions: BTreeMap<Version, ByteBuf>,
    #[serde(rename = "ActiveVersion")]
    pub active_version: Version,
    #[serde(rename = "LatestVersion")]
    pub latest_version: Version,
}

impl Secret {
    fn new(first: Vec<u8>) -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(1, ByteBuf(first));
        Secret {
            versions,
            active_version: 1,
            latest_version: 1,
        }
    }
}

/// Base64-in-JSON byte blob, matching the wire layout's `"v": base64bytes`
/// convention for the embedded serialized database.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ByteBuf(pub Vec<u8>);

impl serde::Serialize for ByteBuf {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use base64::Engine;
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> serde::Deserialize<'de> for ByteBuf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use base64::Engine;
        let s = String::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(ByteBuf(bytes))
    }
}

/// The decrypted, deserialized contents of the store: a mapping from secret
/// name to [`Secret`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Database {
    #[serde(rename = "Secrets")]
    pub secrets: BTreeMap<String, Secret>,
}

impl Database {
    pub fn empty() -> Self {
        Database {
            secrets: BTreeMap::new(),
        }
    }

    pub fn get_or_create(&mut self, name: &str, initial: Vec<u8>) -> &mut Secret {
        self.secrets
            .entry(name.to_string())
            .or_insert_with(|| Secret::new(initial))
    }
}

/// A fully-resolved secret value, as handed back to the facade/server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretValue {
    pub value: Vec<u8>,
    pub version: Version,
}

/// Metadata about a secret, without its byte values.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretInfo {
    pub name: String,
    pub versions: Vec<Version>,
    pub active_version: Version,
}

/// Identity of the caller making a request, derived by the transport host
/// from the connection's remote address. Not implemented here; this is the
/// shape the identity oracle returns.
#[derive(Clone, Debug, Default)]
pub struct Principal {
    pub node: String,
    pub addr: String,
    pub user_login: Option<String>,
    pub tags: Vec<String>,
}

impl Principal {
    /// The set of labels a [`crate::policy::Rule`] principal list is matched
    /// against: the user login if there is one, else the tag set.
    pub fn labels(&self) -> Vec<&str> {
        if let Some(login) = &self.user_login {
            vec![login.as_str()]
        } else {
            self.tags.iter().map(String::as_str).collect()
        }
    }
}

/// A caller: a principal plus the compiled rules extracted from its
/// capability grant.
#[derive(Clone, Debug, Default)]
pub struct Caller {
    pub principal: Principal,
    pub rules: Vec<Rule>,
}

/// The persistence envelope written to disk. `schema_version` is currently
/// always 1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Version")]
    pub schema_version: u32,
    #[serde(rename = "DEK")]
    pub wrapped_data_key: ByteBuf,
    #[serde(rename = "DB")]
    pub ciphertext: ByteBuf,
}

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub fn dek_associated_data(schema_version: u32) -> Vec<u8> {
    format!("DEK v{schema_version}").into_bytes()
}

pub fn db_associated_data(schema_version: u32) -> Vec<u8> {
    format!("DB v{schema_version}").into_bytes()
}
