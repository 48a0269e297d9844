//! The database facade: wraps the store with mutual exclusion, policy
//! checks, and audit emission. Every request-server handler goes through
//! here, never straight to [`crate::store::Store`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::audit::{AuditEntry, AuditSink};
use crate::error::{CResult, Error};
use crate::model::{Caller, SecretInfo, SecretValue, Version};
use crate::policy::Action;
use crate::store::Store;

/// Names under this prefix are reserved for future policy-driven
/// configuration and never reach the KV store.
pub const CONFIG_PREFIX: &str = "_internal/";

/// A clock abstraction so audit timestamps are injectable in tests, the way
/// a cached client store's clock is injectable too -- kept symmetric across
/// both sides.
pub trait Clock: Send + Sync {
    fn now_rfc3339(&self) -> String;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_rfc3339(&self) -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

/// Serializes all mutations on the underlying [`Store`] behind one
/// exclusive lock, checks policy before every operation, and emits an
/// audit entry before any state change is committed.
pub struct Database {
    store: Mutex<Store>,
    audit: Arc<dyn AuditSink>,
    clock: Box<dyn Clock>,
    next_audit_id: AtomicU64,
}

impl Database {
    pub fn new(store: Store, audit: Arc<dyn AuditSink>) -> Self {
        Database {
            store: Mutex::new(store),
            audit,
            clock: Box::new(SystemClock),
            next_audit_id: AtomicU64::new(1),
        }
    }

    #[cfg(test)]
    pub fn with_clock(store: Store, audit: Arc<dyn AuditSink>, clock: Box<dyn Clock>) -> Self {
        Database {
            store: Mutex::new(store),
            audit,
            clock,
            next_audit_id: AtomicU64::new(1),
        }
    }

    pub fn write_generation(&self) -> u64 {
        self.store.lock().unwrap().write_generation()
    }

    fn record(
        &self,
        caller: &Caller,
        action: Action,
        secret: Option<&str>,
        secret_version: Option<Version>,
        authorized: bool,
    ) -> CResult<()> {
        let entry = AuditEntry {
            id: self.next_audit_id.fetch_add(1, Ordering::SeqCst),
            time: self.clock.now_rfc3339(),
            principal: caller.principal.node.clone(),
            action,
            secret: secret.map(str::to_string),
            secret_version,
            authorized,
        };
        self.audit.write_entries(std::slice::from_ref(&entry))
    }

    /// Checks policy, audits the outcome, and only then performs `op` under
    /// the store's exclusive lock. If the audit write itself fails, returns
    /// a composite internal error and never performs `op`.
    fn guarded<T>(
        &self,
        caller: &Caller,
        action: Action,
        name: &str,
        version: Option<Version>,
        op: impl FnOnce(&mut Store) -> CResult<T>,
    ) -> CResult<T> {
        if let Some(handled) = self.handle_config_prefixed(caller, action, name, version)? {
            return Ok(handled);
        }

        let policy = crate::policy::Policy::compile(caller.rules.clone())?;
        let allowed = policy.allow(&caller.principal.labels(), name, action);

        if !allowed {
            self.record(caller, action, Some(name), version, false)?;
            return Err(Error::AccessDenied(format!(
                "{:?} not permitted on {name}",
                action
            )));
        }

        self.record(caller, action, Some(name), version, true)
            .map_err(|err| Error::internal(format!("audit write failed, mutation aborted: {err}")))?;

        let mut store = self.store.lock().unwrap();
        op(&mut store)
    }

    /// `put`/`set_active` on a `_internal/`-prefixed name route here instead
    /// of the KV store. Currently no configuration keys are recognized, so
    /// every call fails -- the hook exists for forward compatibility, not
    /// because anything is implemented behind it yet.
    fn handle_config_prefixed<T>(
        &self,
        _caller: &Caller,
        action: Action,
        name: &str,
        _version: Option<Version>,
    ) -> CResult<Option<T>> {
        if !name.starts_with(CONFIG_PREFIX) {
            return Ok(None);
        }
        match action {
            Action::Put | Action::Activate => {
                Err(Error::BadRequest("unknown config value".to_string()))
            }
            _ => Ok(None),
        }
    }

    /// Lists secret names visible to the caller. A single audit entry is
    /// recorded for the `list` call itself; per-entry visibility is
    /// filtered against the caller's `info` permission without emitting
    /// per-entry audit records.
    pub fn list(&self, caller: &Caller) -> CResult<Vec<SecretInfo>> {
        self.record(caller, Action::Info, None, None, true)?;

        let policy = crate::policy::Policy::compile(caller.rules.clone())?;
        let store = self.store.lock().unwrap();
        let labels = caller.principal.labels();

        let mut infos = Vec::new();
        for name in store.list() {
            if policy.allow(&labels, &name, Action::Info) {
                infos.push(store.info(&name)?);
            }
        }
        Ok(infos)
    }

    pub fn info(&self, caller: &Caller, name: &str) -> CResult<SecretInfo> {
        self.guarded(caller, Action::Info, name, None, |store| store.info(name))
    }

    pub fn get(&self, caller: &Caller, name: &str) -> CResult<SecretValue> {
        self.guarded(caller, Action::Get, name, None, |store| store.get(name))
    }

    pub fn get_version(
        &self,
        caller: &Caller,
        name: &str,
        version: Version,
    ) -> CResult<SecretValue> {
        self.guarded(caller, Action::Get, name, Some(version), |store| {
            store.get_version(name, version)
        })
    }

    /// Three-valued conditional get: `version == 0` returns the active
    /// value unconditionally; otherwise returns the active value
    /// only if its version differs from `version` (else
    /// [`Error::ValueNotChanged`]), or that specific version if
    /// `update_if_changed` is false.
    pub fn get_conditional(
        &self,
        caller: &Caller,
        name: &str,
        version: Version,
        update_if_changed: bool,
    ) -> CResult<SecretValue> {
        if version == 0 {
            return self.get(caller, name);
        }
        if !update_if_changed {
            return self.get_version(caller, name, version);
        }
        self.guarded(caller, Action::Get, name, Some(version), |store| {
            let current = store.get(name)?;
            if current.version == version {
                Err(Error::ValueNotChanged)
            } else {
                Ok(current)
            }
        })
    }

    pub fn put(&self, caller: &Caller, name: &str, bytes: Vec<u8>) -> CResult<Version> {
        if name.is_empty() {
            return Err(Error::BadRequest("secret name must not be empty".into()));
        }
        self.guarded(caller, Action::Put, name, None, |store| {
            store.put(name, bytes)
        })
    }

    pub fn activate(&self, caller: &Caller, name: &str, version: Version) -> CResult<()> {
        self.guarded(caller, Action::Activate, name, Some(version), |store| {
            store.set_active(name, version)
        })
    }

    pub fn delete(&self, caller: &Caller, name: &str) -> CResult<()> {
        self.guarded(caller, Action::Delete, name, None, |store| {
            store.delete(name)
        })
    }

    pub fn delete_version(&self, caller: &Caller, name: &str, version: Version) -> CResult<()> {
        self.guarded(caller, Action::Delete, name, Some(version), |store| {
            store.delete_version(name, version)
        })
    }
}
