//! Background activation bridge: a separately scheduled worker that
//! intercepts the client's HTTP traffic, applies a caching policy per
//! resource class and can wake the client to drain its queue.

mod cache;

pub use cache::{CacheStorage, RequestKey};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::error::{BridgeError, TransportError};
use crate::queue::SyncRegistrar;
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, Transport};

/// Bridge → client message. No payload, no acknowledgment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeMessage {
    #[serde(rename = "SYNC_NOW")]
    SyncNow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Installing,
    /// Installed and waiting for activation.
    Installed,
    Activating,
    Activated,
    /// Install failed; the worker never becomes active.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// Synthesized by the worker because neither network nor cache answered.
    Offline,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fetched {
    pub response: HttpResponse,
    pub source: ResponseSource,
}

impl Fetched {
    fn network(response: HttpResponse) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
        }
    }

    fn cache(response: HttpResponse) -> Self {
        Self {
            response,
            source: ResponseSource::Cache,
        }
    }

    fn offline(response: HttpResponse) -> Self {
        Self {
            response,
            source: ResponseSource::Offline,
        }
    }
}

pub type ClientId = u64;

#[derive(Clone, Debug, PartialEq)]
pub struct BridgeConfig {
    /// Origin the static manifest paths are fetched from.
    pub origin: String,
    pub api_base: String,
    pub static_cache: String,
    pub api_cache: String,
    pub static_manifest: Vec<String>,
    pub sync_tag: String,
}

impl BridgeConfig {
    pub fn from_client_config(origin: impl Into<String>, config: &ClientConfig) -> Self {
        Self {
            origin: origin.into(),
            api_base: config.api_base.clone(),
            static_cache: config.cache.static_name.clone(),
            api_cache: config.cache.api_name.clone(),
            static_manifest: config.cache.static_manifest.clone(),
            sync_tag: config.sync_tag.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestClass {
    StaticAsset,
    Api,
    Other,
}

struct Clients {
    senders: BTreeMap<ClientId, mpsc::UnboundedSender<BridgeMessage>>,
    controlled: BTreeSet<ClientId>,
}

pub struct ServiceWorker {
    config: BridgeConfig,
    network: Arc<dyn Transport>,
    caches: CacheStorage,
    state: Mutex<WorkerState>,
    /// Set by the first `install`; later calls are rejected while it runs.
    install_started: AtomicBool,
    clients: Mutex<Clients>,
    next_client: AtomicU64,
    sync_tags: Mutex<BTreeSet<String>>,
}

impl ServiceWorker {
    pub fn new(config: BridgeConfig, network: Arc<dyn Transport>, caches: CacheStorage) -> Self {
        Self {
            config,
            network,
            caches,
            state: Mutex::new(WorkerState::Installing),
            install_started: AtomicBool::new(false),
            clients: Mutex::new(Clients {
                senders: BTreeMap::new(),
                controlled: BTreeSet::new(),
            }),
            next_client: AtomicU64::new(1),
            sync_tags: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    fn transition(
        &self,
        operation: &'static str,
        from: WorkerState,
        to: WorkerState,
    ) -> Result<(), BridgeError> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(BridgeError::InvalidState {
                operation,
                state: state.to_string(),
            });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: WorkerState) {
        *lock(&self.state) = to;
    }

    /// Fetches the whole static manifest and stores it only if every entry
    /// succeeded. Any failure leaves the worker redundant and the static
    /// generation untouched.
    pub async fn install(&self) -> Result<(), BridgeError> {
        {
            let state = lock(&self.state);
            if *state != WorkerState::Installing
                || self.install_started.swap(true, Ordering::AcqRel)
            {
                return Err(BridgeError::InvalidState {
                    operation: "install",
                    state: state.to_string(),
                });
            }
        }

        let mut fetched = Vec::with_capacity(self.config.static_manifest.len());
        for path in &self.config.static_manifest {
            let url = crate::gateway::join_url(&self.config.origin, path);
            let outcome = match self.network.send(HttpRequest::get(url.clone())).await {
                Ok(response) if response.is_success() => Ok(response),
                Ok(response) => Err(format!("status {}", response.status)),
                Err(err) => Err(err.to_string()),
            };
            match outcome {
                Ok(response) => {
                    fetched.push((RequestKey::new(HttpMethod::Get, path.clone()), response))
                }
                Err(reason) => {
                    log::warn!("install aborted: {url}: {reason}");
                    self.set_state(WorkerState::Redundant);
                    return Err(BridgeError::InstallFailed { url, reason });
                }
            }
        }

        for (key, response) in &fetched {
            if let Err(err) = self.caches.put(&self.config.static_cache, key, response) {
                if let Err(cleanup) = self.caches.delete_generation(&self.config.static_cache) {
                    log::warn!(
                        "failed to roll back {} after install error: {cleanup}",
                        self.config.static_cache
                    );
                }
                self.set_state(WorkerState::Redundant);
                return Err(err.into());
            }
        }
        log::info!(
            "installed {} static assets into {}",
            fetched.len(),
            self.config.static_cache
        );
        self.transition("install", WorkerState::Installing, WorkerState::Installed)
    }

    /// Adopts a static generation left complete by an earlier process so a
    /// restart can activate without refetching the manifest.
    pub fn resume(&self) -> Result<bool, BridgeError> {
        let mut state = lock(&self.state);
        if *state != WorkerState::Installing || self.install_started.load(Ordering::Acquire) {
            return Ok(false);
        }
        for path in &self.config.static_manifest {
            let key = RequestKey::new(HttpMethod::Get, path.clone());
            if self.caches.match_in(&self.config.static_cache, &key)?.is_none() {
                return Ok(false);
            }
        }
        self.install_started.store(true, Ordering::Release);
        *state = WorkerState::Installed;
        log::debug!("resumed static generation {}", self.config.static_cache);
        Ok(true)
    }

    /// Resume or install, then activate. Failures are logged and leave the
    /// worker passing requests straight to the network.
    pub async fn start(&self) -> WorkerState {
        let resumed = self.resume().unwrap_or_else(|err| {
            log::warn!("could not inspect {}: {err}", self.config.static_cache);
            false
        });
        if !resumed {
            if let Err(err) = self.install().await {
                log::warn!("worker install failed: {err}");
                return self.state();
            }
        }
        if let Err(err) = self.activate() {
            log::warn!("worker activation failed: {err}");
        }
        self.state()
    }

    /// Retires every generation other than the current two and takes control
    /// of all connected clients.
    pub fn activate(&self) -> Result<(), BridgeError> {
        self.transition("activate", WorkerState::Installed, WorkerState::Activating)?;

        let keep = [self.config.static_cache.as_str(), self.config.api_cache.as_str()];
        let stale = match self.caches.generations() {
            Ok(generations) => generations,
            Err(err) => {
                self.set_state(WorkerState::Installed);
                return Err(err.into());
            }
        };
        for generation in stale.iter().filter(|name| !keep.contains(&name.as_str())) {
            match self.caches.delete_generation(generation) {
                Ok(removed) => {
                    log::info!("deleted cache generation {generation} ({removed} entries)")
                }
                Err(err) => {
                    self.set_state(WorkerState::Installed);
                    return Err(err.into());
                }
            }
        }

        self.claim_and_activate();
        Ok(())
    }

    /// Clients lock is held across the state change so a client registering
    /// concurrently is either claimed here or sees `Activated`.
    fn claim_and_activate(&self) {
        let mut clients = lock(&self.clients);
        let ids: Vec<ClientId> = clients.senders.keys().copied().collect();
        clients.controlled.extend(ids);
        self.set_state(WorkerState::Activated);
    }

    pub fn register_client(&self) -> (ClientId, mpsc::UnboundedReceiver<BridgeMessage>) {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut clients = lock(&self.clients);
        clients.senders.insert(id, sender);
        if self.state() == WorkerState::Activated {
            clients.controlled.insert(id);
        }
        (id, receiver)
    }

    pub fn unregister_client(&self, id: ClientId) {
        let mut clients = lock(&self.clients);
        clients.senders.remove(&id);
        clients.controlled.remove(&id);
    }

    pub fn is_controlled(&self, id: ClientId) -> bool {
        lock(&self.clients).controlled.contains(&id)
    }

    fn classify(&self, request: &HttpRequest) -> RequestClass {
        let path = request.path();
        if request.method == HttpMethod::Get
            && self.config.static_manifest.iter().any(|entry| entry == path)
        {
            return RequestClass::StaticAsset;
        }
        if is_under(&request.url, &self.config.api_base) {
            return RequestClass::Api;
        }
        RequestClass::Other
    }

    /// Intercepts one request. Before activation requests go straight to the
    /// network.
    pub async fn handle_fetch(&self, request: HttpRequest) -> Result<Fetched, TransportError> {
        if self.state() != WorkerState::Activated {
            return self.network.send(request).await.map(Fetched::network);
        }
        match self.classify(&request) {
            RequestClass::StaticAsset => self.static_first(request).await,
            RequestClass::Api => self.api_network_first(request).await,
            RequestClass::Other => self.network_then_cache(request).await,
        }
    }

    async fn static_first(&self, request: HttpRequest) -> Result<Fetched, TransportError> {
        let key = RequestKey::new(HttpMethod::Get, request.path());
        match self.caches.match_in(&self.config.static_cache, &key) {
            Ok(Some(hit)) => return Ok(Fetched::cache(hit)),
            Ok(None) => {}
            Err(err) => log::warn!("static cache lookup for {key} failed: {err}"),
        }
        match self.network.send(request).await {
            Ok(response) => Ok(Fetched::network(response)),
            Err(err) => {
                log::debug!("static asset {key} unavailable: {err}");
                Ok(Fetched::offline(HttpResponse::text(503, "Offline")))
            }
        }
    }

    /// Network-first for API calls. Offline reads without a snapshot degrade
    /// to an empty success body; offline writes surface the transport error so
    /// the caller can queue them.
    async fn api_network_first(&self, request: HttpRequest) -> Result<Fetched, TransportError> {
        let key = RequestKey::of(&request);
        let is_read = request.method == HttpMethod::Get;
        match self.network.send(request).await {
            Ok(response) => {
                if is_read && response.is_success() {
                    if let Err(err) = self.caches.put(&self.config.api_cache, &key, &response) {
                        log::warn!("failed to cache {key}: {err}");
                    }
                }
                Ok(Fetched::network(response))
            }
            Err(err) => {
                if !is_read {
                    return Err(err);
                }
                match self.caches.match_in(&self.config.api_cache, &key) {
                    Ok(Some(hit)) => return Ok(Fetched::cache(hit)),
                    Ok(None) => {}
                    Err(store_err) => {
                        log::warn!("api cache lookup for {key} failed: {store_err}")
                    }
                }
                Ok(Fetched::offline(HttpResponse::json(
                    200,
                    &json!({ "ok": true, "offline": true, "data": [] }),
                )))
            }
        }
    }

    async fn network_then_cache(&self, request: HttpRequest) -> Result<Fetched, TransportError> {
        let key = RequestKey::of(&request);
        match self.network.send(request).await {
            Ok(response) => Ok(Fetched::network(response)),
            Err(err) => match self.caches.match_any(&key) {
                Ok(Some(hit)) => Ok(Fetched::cache(hit)),
                Ok(None) => Err(err),
                Err(store_err) => {
                    log::warn!("cache lookup for {key} failed: {store_err}");
                    Err(err)
                }
            },
        }
    }

    /// Platform background-sync event. Posts `SYNC_NOW` to one connected
    /// client when the tag matches; returns whether a client received it.
    pub fn on_sync(&self, tag: &str) -> bool {
        if tag != self.config.sync_tag {
            log::debug!("ignoring sync event {tag}");
            return false;
        }
        let mut clients = lock(&self.clients);
        let mut closed = Vec::new();
        let mut delivered = false;
        for (id, sender) in &clients.senders {
            if sender.send(BridgeMessage::SyncNow).is_ok() {
                log::debug!("posted SYNC_NOW to client {id}");
                delivered = true;
                break;
            }
            closed.push(*id);
        }
        for id in closed {
            clients.senders.remove(&id);
            clients.controlled.remove(&id);
        }
        delivered
    }

    pub fn registered_syncs(&self) -> Vec<String> {
        lock(&self.sync_tags).iter().cloned().collect()
    }

    /// Fires every registered sync tag. Tags that reached a client are
    /// consumed; the rest stay registered for the next attempt.
    pub fn fire_pending_syncs(&self) -> usize {
        let tags = self.registered_syncs();
        let mut fired = 0;
        for tag in tags {
            if self.on_sync(&tag) {
                lock(&self.sync_tags).remove(&tag);
                fired += 1;
            }
        }
        fired
    }
}

impl SyncRegistrar for ServiceWorker {
    fn register_sync(&self, tag: &str) -> std::io::Result<()> {
        lock(&self.sync_tags).insert(tag.to_string());
        Ok(())
    }
}

/// Routes a client's requests through the worker.
#[derive(Clone)]
pub struct BridgedTransport {
    worker: Arc<ServiceWorker>,
}

impl BridgedTransport {
    pub fn new(worker: Arc<ServiceWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl Transport for BridgedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.worker.handle_fetch(request).await.map(|fetched| fetched.response)
    }
}

/// `url` is `base` itself or a path, query or fragment below it.
fn is_under(url: &str, base: &str) -> bool {
    url.strip_prefix(base.trim_end_matches('/'))
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?', '#']))
}

/// Lock state that stays consistent across a panicking holder.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests;
