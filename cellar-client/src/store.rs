//! The cached client store (§4.6): background-refreshed, concurrent-safe
//! secret store with conditional fetches, cold-start from a possibly-stale
//! mirror, lookup-on-demand, and typed change notification.
//!
//! Concurrency mirrors the contract in §5: one writer (the poller, plus
//! any handle mutator such as `lookup_secret`) touches the cache through
//! [`std::sync::RwLock`]'s write side; many readers (`Handle::get`) take
//! the read side and never suspend. Unlike a goroutine holding an
//! explicit mutex across a network call, nothing here ever holds a lock
//! guard across an `.await` point, so the "drop the lock for the
//! duration of the fetch" hazard §5 calls out is structural rather than
//! something we have to get right by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use cellar_core::error::{CResult, Error};
use cellar_core::model::Version;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::mirror::{self, Mirror, MirrorDocument, MirrorEntry, MirrorSecret};
use crate::rpc::RpcClient;

/// Injectable wall clock, returning unix seconds. Kept symmetric with
/// [`cellar_core::facade::Clock`] on the server side.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// An injectable clock for tests, settable at any instant.
pub struct FakeClock {
    now: AtomicU64,
}

impl FakeClock {
    pub fn new(start: u64) -> Self {
        FakeClock {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, t: u64) {
        self.now.store(t, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Determines how long the poller sleeps between cycles. The real
/// implementation jitters the configured interval by ±10% (§4.6); tests
/// substitute one that never fires on its own, driving cycles
/// deterministically through [`CachedStore::refresh`] instead.
pub trait Ticker: Send + Sync {
    fn next_delay(&self) -> Duration;
}

pub struct JitteredTicker {
    interval: Duration,
}

impl JitteredTicker {
    pub fn new(interval: Duration) -> Self {
        JitteredTicker { interval }
    }
}

impl Ticker for JitteredTicker {
    fn next_delay(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::from_secs_f64(self.interval.as_secs_f64() * factor)
    }
}

/// A ticker that never fires on its own. Pair with explicit
/// [`CachedStore::refresh`] calls in tests.
pub struct NeverTicker;

impl Ticker for NeverTicker {
    fn next_delay(&self) -> Duration {
        Duration::from_secs(u64::MAX / 2)
    }
}

struct Entry {
    value: Option<Vec<u8>>,
    version: Version,
    declared: bool,
    last_access: AtomicU64,
}

impl Entry {
    fn stub(declared: bool, now: u64) -> Self {
        Entry {
            value: None,
            version: 0,
            declared,
            last_access: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) {
        self.last_access.store(now, Ordering::SeqCst);
    }

    fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::SeqCst)
    }
}

struct SharedState {
    entries: RwLock<HashMap<String, Entry>>,
    watchers: std::sync::Mutex<HashMap<String, Vec<mpsc::Sender<()>>>>,
    clock: Arc<dyn Clock>,
}

/// A handle to one secret's current bytes. Cheap to clone, safe to share
/// across threads; `get` never blocks, never fails, and never returns a
/// mid-update torn value because it clones out of the cache under a
/// shared read lock.
#[derive(Clone)]
pub struct Handle {
    name: String,
    shared: Arc<SharedState>,
}

impl Handle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current bytes, or `None` if the name is undeclared and has never
    /// been looked up (or `allow_lookup` is off).
    pub fn get(&self) -> Option<Vec<u8>> {
        let entries = self.shared.entries.read().unwrap();
        let entry = entries.get(&self.name)?;
        entry.touch(self.shared.clock.now());
        entry.value.clone()
    }
}

/// A [`Handle`] plus a 1-deep coalescing notification channel. Multiple
/// watchers per name are supported; a single update signals all of them.
pub struct Watcher {
    handle: Handle,
    rx: mpsc::Receiver<()>,
}

impl Watcher {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Resolves once this secret has changed since the watcher was
    /// created or last polled. Coalesces: N back-to-back updates between
    /// calls yield at least one and at most N signals (§8 invariant 11).
    pub async fn changed(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    /// Non-blocking poll of the same channel, for callers that cannot
    /// await (e.g. a select loop already polling other futures).
    pub fn try_changed(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

/// Builder for [`CachedStore`], gathering the construction inputs of §4.6.
pub struct Builder {
    base_url: String,
    http: Option<reqwest::Client>,
    declared: Vec<String>,
    mirror: Option<Arc<dyn Mirror>>,
    poll_interval: Duration,
    ticker: Option<Arc<dyn Ticker>>,
    clock: Arc<dyn Clock>,
    allow_lookup: bool,
    expiry_age: Option<Duration>,
    init_timeout: Duration,
}

impl Builder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Builder {
            base_url: base_url.into(),
            http: None,
            declared: Vec::new(),
            mirror: None,
            poll_interval: Duration::from_secs(60),
            ticker: None,
            clock: Arc::new(SystemClock),
            allow_lookup: false,
            expiry_age: None,
            init_timeout: Duration::from_secs(30),
        }
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn declare(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.declared.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn mirror(mut self, mirror: Arc<dyn Mirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = Some(ticker);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn allow_lookup(mut self, allow: bool) -> Self {
        self.allow_lookup = allow;
        self
    }

    pub fn expiry_age(mut self, age: Duration) -> Self {
        self.expiry_age = Some(age);
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Runs the full initialization protocol of §4.6 and launches the
    /// background poller. Blocks until every declared name has a value or
    /// `init_timeout` elapses.
    pub async fn open(self) -> CResult<Arc<CachedStore>> {
        let rpc = match self.http {
            Some(http) => RpcClient::with_http_client(self.base_url, http),
            None => RpcClient::new(self.base_url),
        };

        let shared = Arc::new(SharedState {
            entries: RwLock::new(HashMap::new()),
            watchers: std::sync::Mutex::new(HashMap::new()),
            clock: self.clock.clone(),
        });

        load_mirror(&shared, self.mirror.as_deref(), &self.declared);
        fetch_missing_declared(&shared, &rpc, self.init_timeout).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ticker = self
            .ticker
            .unwrap_or_else(|| Arc::new(JitteredTicker::new(self.poll_interval)));

        let poller = spawn_poller(
            shared.clone(),
            rpc.clone(),
            self.mirror.clone(),
            self.expiry_age,
            ticker,
            shutdown_rx,
        );

        Ok(Arc::new(CachedStore {
            shared,
            rpc,
            mirror: self.mirror,
            allow_lookup: self.allow_lookup,
            expiry_age: self.expiry_age,
            shutdown_tx,
            poller: std::sync::Mutex::new(Some(poller)),
        }))
    }
}

fn load_mirror(shared: &SharedState, mirror: Option<&dyn Mirror>, declared: &[String]) {
    let now = shared.clock.now();
    let doc = mirror
        .map(|m| match m.read() {
            Ok(bytes) => mirror::decode(&bytes).unwrap_or_else(|err| {
                log::warn!("mirror decode failed, treating as empty: {err}");
                MirrorDocument::new()
            }),
            Err(err) => {
                log::warn!("mirror read failed, treating as empty: {err}");
                MirrorDocument::new()
            }
        })
        .unwrap_or_default();

    let mut entries = shared.entries.write().unwrap();
    let declared_set: std::collections::HashSet<&str> = declared.iter().map(String::as_str).collect();

    for (name, mirrored) in doc {
        let is_declared = declared_set.contains(name.as_str());
        entries.insert(
            name,
            Entry {
                value: Some(mirrored.secret.value.0),
                version: mirrored.secret.version,
                declared: is_declared,
                last_access: AtomicU64::new(now),
            },
        );
    }

    for name in declared {
        entries
            .entry(name.clone())
            .or_insert_with(|| Entry::stub(true, now));
    }
}

async fn fetch_missing_declared(
    shared: &SharedState,
    rpc: &RpcClient,
    init_timeout: Duration,
) -> CResult<()> {
    let deadline = tokio::time::Instant::now() + init_timeout;
    let mut backoff = Duration::from_millis(250);
    const MAX_BACKOFF: Duration = Duration::from_millis(4000);

    loop {
        let missing: Vec<String> = {
            let entries = shared.entries.read().unwrap();
            entries
                .iter()
                .filter(|(_, e)| e.declared && e.value.is_none())
                .map(|(name, _)| name.clone())
                .collect()
        };

        if missing.is_empty() {
            return Ok(());
        }

        for name in &missing {
            match rpc.get(name).await {
                Ok(value) => {
                    let mut entries = shared.entries.write().unwrap();
                    if let Some(entry) = entries.get_mut(name) {
                        entry.value = Some(value.value);
                        entry.version = value.version;
                    }
                }
                Err(err) => {
                    log::warn!("initial fetch of {name} failed, will retry: {err}");
                }
            }
        }

        let still_missing: Vec<String> = {
            let entries = shared.entries.read().unwrap();
            entries
                .iter()
                .filter(|(_, e)| e.declared && e.value.is_none())
                .map(|(name, _)| name.clone())
                .collect()
        };

        if still_missing.is_empty() {
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::internal(format!(
                "{} unavailable secrets: {}",
                still_missing.len(),
                still_missing.join(", ")
            )));
        }

        tokio::time::sleep(backoff.min(MAX_BACKOFF)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn spawn_poller(
    shared: Arc<SharedState>,
    rpc: RpcClient,
    mirror: Option<Arc<dyn Mirror>>,
    expiry_age: Option<Duration>,
    ticker: Arc<dyn Ticker>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delay = ticker.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    poll_once(&shared, &rpc, mirror.as_deref(), expiry_age).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

/// One poll cycle (§4.6 steady state): snapshot tracked versions, issue
/// conditional gets, apply updates under the write lock, evict expired
/// lookup-added entries, flush the mirror, and fan out to watchers.
async fn poll_once(
    shared: &SharedState,
    rpc: &RpcClient,
    mirror: Option<&dyn Mirror>,
    expiry_age: Option<Duration>,
) {
    let snapshot: Vec<(String, Version)> = {
        let entries = shared.entries.read().unwrap();
        entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.version))
            .collect()
    };

    let mut updates = Vec::new();
    for (name, version) in snapshot {
        match rpc.get_if_changed(&name, version).await {
            Ok(value) => updates.push((name, value)),
            Err(Error::ValueNotChanged) => {}
            Err(err) => log::warn!("poll of {name} failed, will retry next cycle: {err}"),
        }
    }

    let now = shared.clock.now();
    let mut updated_names = Vec::with_capacity(updates.len());
    {
        let mut entries = shared.entries.write().unwrap();

        for (name, value) in updates {
            if let Some(entry) = entries.get_mut(&name) {
                entry.value = Some(value.value);
                entry.version = value.version;
            }
            updated_names.push(name);
        }

        if let Some(age) = expiry_age {
            let age_secs = age.as_secs();
            entries.retain(|_, entry| entry.declared || now.saturating_sub(entry.last_access()) <= age_secs);
        }
    }

    if let Some(mirror) = mirror {
        flush_mirror(shared, mirror);
    }

    fan_out(shared, &updated_names);
}

fn flush_mirror(shared: &SharedState, mirror: &dyn Mirror) {
    let entries = shared.entries.read().unwrap();
    let mut doc = MirrorDocument::new();
    for (name, entry) in entries.iter() {
        let Some(value) = &entry.value else { continue };
        doc.insert(
            name.clone(),
            MirrorEntry {
                secret: MirrorSecret {
                    value: cellar_core::model::ByteBuf(value.clone()),
                    version: entry.version,
                },
                last_access: entry.last_access().to_string(),
            },
        );
    }
    drop(entries);

    match mirror::encode(&doc) {
        Ok(bytes) => {
            if let Err(err) = mirror.write(&bytes) {
                log::warn!("mirror flush failed: {err}");
            }
        }
        Err(err) => log::warn!("mirror encode failed: {err}"),
    }
}

fn fan_out(shared: &SharedState, updated_names: &[String]) {
    let watchers = shared.watchers.lock().unwrap();
    for name in updated_names {
        if let Some(senders) = watchers.get(name) {
            for sender in senders {
                let _ = sender.try_send(());
            }
        }
    }
}

/// The cached client store. Construct via [`Builder`].
pub struct CachedStore {
    shared: Arc<SharedState>,
    rpc: RpcClient,
    mirror: Option<Arc<dyn Mirror>>,
    allow_lookup: bool,
    expiry_age: Option<Duration>,
    shutdown_tx: watch::Sender<bool>,
    poller: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CachedStore {
    /// A handle that, when invoked, returns the current bytes for
    /// `name`. Never blocks, never fails, never returns a torn value.
    pub fn secret(&self, name: &str) -> Handle {
        Handle {
            name: name.to_string(),
            shared: self.shared.clone(),
        }
    }

    /// Fetches the active value for `name` if not already tracked (or
    /// returns it if it is), adds it to the tracked set, and returns a
    /// handle. Requires `allow_lookup`.
    pub async fn lookup_secret(&self, name: &str) -> CResult<Handle> {
        if !self.allow_lookup {
            return Err(Error::BadRequest(
                "lookup_secret called but allow_lookup is disabled".into(),
            ));
        }

        {
            let entries = self.shared.entries.read().unwrap();
            if let Some(entry) = entries.get(name) {
                if entry.value.is_some() {
                    entry.touch(self.shared.clock.now());
                    return Ok(self.secret(name));
                }
            }
        }

        let fetched = self.rpc.get(name).await?;

        {
            let mut entries = self.shared.entries.write().unwrap();
            let entry = entries
                .entry(name.to_string())
                .or_insert_with(|| Entry::stub(false, self.shared.clock.now()));
            // Never regress a concurrently-installed later fetch.
            if entry.value.is_none() || fetched.version >= entry.version {
                entry.value = Some(fetched.value);
                entry.version = fetched.version;
            }
            entry.touch(self.shared.clock.now());
        }

        Ok(self.secret(name))
    }

    /// Like [`Self::lookup_secret`], but also registers a 1-deep
    /// coalescing notification channel for the name.
    pub async fn lookup_watcher(&self, name: &str) -> CResult<Watcher> {
        let handle = self.lookup_secret(name).await?;
        let (tx, rx) = mpsc::channel(1);
        self.shared
            .watchers
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(tx);
        Ok(Watcher { handle, rx })
    }

    /// Registers a watcher for an already-declared/tracked name without
    /// performing a lookup fetch.
    pub fn watch(&self, name: &str) -> Watcher {
        let (tx, rx) = mpsc::channel(1);
        self.shared
            .watchers
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(tx);
        Watcher {
            handle: self.secret(name),
            rx,
        }
    }

    /// Triggers an immediate poll cycle and blocks for its completion.
    pub async fn refresh(&self) {
        poll_once(
            &self.shared,
            &self.rpc,
            self.mirror.as_deref(),
            self.expiry_age,
        )
        .await;
    }

    /// Stops the poller, waits for it to exit, and flushes the mirror one
    /// last time.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.poller.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Some(mirror) = &self.mirror {
            flush_mirror(&self.shared, mirror.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MemoryMirror;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_get(server: &MockServer, value: &str, version: u64) {
        Mock::given(method("POST"))
            .and(path("/api/get"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Value": base64_of(value),
                "Version": version,
            })))
            .mount(server)
            .await;
    }

    fn base64_of(s: &str) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(s.as_bytes())
    }

    #[tokio::test]
    async fn cold_starts_and_serves_declared_secret() {
        let server = MockServer::start().await;
        mock_get(&server, "hunter2", 1).await;

        let store = Builder::new(server.uri())
            .declare(["db/password"])
            .ticker(Arc::new(NeverTicker))
            .open()
            .await
            .unwrap();

        let handle = store.secret("db/password");
        assert_eq!(handle.get().unwrap(), b"hunter2");
        store.close().await;
    }

    #[tokio::test]
    async fn lookup_requires_allow_lookup() {
        let server = MockServer::start().await;
        let store = Builder::new(server.uri())
            .ticker(Arc::new(NeverTicker))
            .open()
            .await
            .unwrap();

        let err = store.lookup_secret("undeclared").await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        store.close().await;
    }

    #[tokio::test]
    async fn lookup_on_demand_adds_tracked_secret() {
        let server = MockServer::start().await;
        mock_get(&server, "looked-up-value", 1).await;

        let store = Builder::new(server.uri())
            .allow_lookup(true)
            .ticker(Arc::new(NeverTicker))
            .open()
            .await
            .unwrap();

        assert!(store.secret("extra").get().is_none());
        let handle = store.lookup_secret("extra").await.unwrap();
        assert_eq!(handle.get().unwrap(), b"looked-up-value");
        store.close().await;
    }

    #[tokio::test]
    async fn refresh_delivers_updates_and_fires_watcher_once() {
        use wiremock::matchers::body_partial_json;

        let server = MockServer::start().await;

        // Unconditional fetch during init (Version: 0).
        Mock::given(method("POST"))
            .and(path("/api/get"))
            .and(body_partial_json(serde_json::json!({"Version": 0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Value": base64_of("v1"),
                "Version": 1,
            })))
            .mount(&server)
            .await;

        // First poll cycle's conditional get sees version 1 and changed.
        Mock::given(method("POST"))
            .and(path("/api/get"))
            .and(body_partial_json(serde_json::json!({"Version": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Value": base64_of("v2"),
                "Version": 2,
            })))
            .mount(&server)
            .await;

        // Second poll cycle's conditional get sees version 2, unchanged.
        Mock::given(method("POST"))
            .and(path("/api/get"))
            .and(body_partial_json(serde_json::json!({"Version": 2})))
            .respond_with(ResponseTemplate::new(304).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let store = Builder::new(server.uri())
            .declare(["g"])
            .ticker(Arc::new(NeverTicker))
            .open()
            .await
            .unwrap();

        let mut watcher = store.watch("g");
        assert!(!watcher.try_changed());

        store.refresh().await;
        assert!(watcher.try_changed());
        assert_eq!(store.secret("g").get().unwrap(), b"v2");

        // Second poll with no further change should not re-fire.
        store.refresh().await;
        assert!(!watcher.try_changed());
        store.close().await;
    }

    #[tokio::test]
    async fn cold_start_from_mirror_then_refresh_picks_up_activation() {
        let server = MockServer::start().await;

        let mut doc = MirrorDocument::new();
        doc.insert(
            "alpha".to_string(),
            MirrorEntry {
                secret: MirrorSecret {
                    value: cellar_core::model::ByteBuf(b"foobar".to_vec()),
                    version: 1,
                },
                last_access: "0".to_string(),
            },
        );
        let mirror = Arc::new(MemoryMirror::seeded(mirror::encode(&doc).unwrap()));

        mock_get(&server, "bazquux", 2).await;

        let store = Builder::new(server.uri())
            .declare(["alpha"])
            .mirror(mirror.clone())
            .ticker(Arc::new(NeverTicker))
            .open()
            .await
            .unwrap();

        // Served from the mirror before the first poll.
        assert_eq!(store.secret("alpha").get().unwrap(), b"foobar");

        store.refresh().await;
        assert_eq!(store.secret("alpha").get().unwrap(), b"bazquux");

        let flushed = mirror::decode(&mirror.read().unwrap()).unwrap();
        assert_eq!(flushed["alpha"].secret.version, 2);
        store.close().await;
    }

    #[tokio::test]
    async fn expiry_evicts_only_lookup_added_entries() {
        let server = MockServer::start().await;
        mock_get(&server, "x", 1).await;

        let clock = Arc::new(FakeClock::new(0));
        let store = Builder::new(server.uri())
            .declare(["apple"])
            .allow_lookup(true)
            .expiry_age(Duration::from_secs(30))
            .clock(clock.clone())
            .ticker(Arc::new(NeverTicker))
            .open()
            .await
            .unwrap();

        clock.set(25);
        store.lookup_secret("pear").await.unwrap();
        clock.set(50);
        store.lookup_secret("plum").await.unwrap();
        clock.set(75);
        store.lookup_secret("cherry").await.unwrap();

        clock.set(95);
        store.refresh().await;

        assert!(store.secret("apple").get().is_some());
        assert!(store.secret("cherry").get().is_some());
        assert!(store.secret("pear").get().is_none());
        assert!(store.secret("plum").get().is_none());
        store.close().await;
    }
}
