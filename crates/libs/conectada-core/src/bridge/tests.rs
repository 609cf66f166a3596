use super::*;
use crate::error::StoreError;
use crate::store::{LocalStore, MemoryStore};
use crate::testing::ScriptedTransport;
use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

const ORIGIN: &str = "https://app.city.example";
const API: &str = "https://api.city.example";

fn config() -> BridgeConfig {
    BridgeConfig {
        origin: ORIGIN.into(),
        api_base: API.into(),
        static_cache: "cc-static-v2".into(),
        api_cache: "cc-api-v2".into(),
        static_manifest: vec!["/".into(), "/index.html".into(), "/js/app.js".into()],
        sync_tag: "sync-reports".into(),
    }
}

fn serve_manifest(network: &ScriptedTransport) {
    network.route(HttpMethod::Get, "/", HttpResponse::text(200, "<html>home</html>"));
    network.route(HttpMethod::Get, "/index.html", HttpResponse::text(200, "<html>index</html>"));
    network.route(HttpMethod::Get, "/js/app.js", HttpResponse::text(200, "console.log(1)"));
}

fn worker(network: Arc<ScriptedTransport>) -> ServiceWorker {
    ServiceWorker::new(config(), network, CacheStorage::new(Arc::new(MemoryStore::new())))
}

async fn active_worker(network: Arc<ScriptedTransport>) -> ServiceWorker {
    serve_manifest(&network);
    let worker = worker(network);
    worker.install().await.expect("install");
    worker.activate().expect("activate");
    worker
}

#[tokio::test]
async fn install_populates_static_generation_and_waits() {
    let network = Arc::new(ScriptedTransport::new());
    serve_manifest(&network);
    let worker = worker(network.clone());

    worker.install().await.expect("install");
    assert_eq!(worker.state(), WorkerState::Installed);
    assert_eq!(worker.caches().entry_count("cc-static-v2").expect("count"), 3);
    assert_eq!(network.requests()[1].url, "https://app.city.example/index.html");
}

#[tokio::test]
async fn install_is_all_or_nothing() {
    let network = Arc::new(ScriptedTransport::new());
    network.route(HttpMethod::Get, "/", HttpResponse::text(200, "home"));
    network.route(HttpMethod::Get, "/index.html", HttpResponse::text(200, "index"));
    // "/js/app.js" is unrouted and answers 404.
    let worker = worker(network);

    let err = worker.install().await.expect_err("missing asset");
    assert!(matches!(
        err,
        BridgeError::InstallFailed { ref url, .. } if url.ends_with("/js/app.js")
    ));
    assert_eq!(worker.state(), WorkerState::Redundant);
    assert_eq!(worker.caches().entry_count("cc-static-v2").expect("count"), 0);
    assert!(worker.activate().is_err());
}

/// Answers every manifest fetch once the gate opens.
struct HeldTransport {
    entered: Notify,
    gate: Semaphore,
}

#[async_trait]
impl Transport for HeldTransport {
    async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.entered.notify_one();
        let _open = self.gate.acquire().await;
        Ok(HttpResponse::text(200, "asset"))
    }
}

#[tokio::test]
async fn concurrent_install_is_rejected() {
    let network = Arc::new(HeldTransport {
        entered: Notify::new(),
        gate: Semaphore::new(0),
    });
    let worker = ServiceWorker::new(
        config(),
        network.clone(),
        CacheStorage::new(Arc::new(MemoryStore::new())),
    );

    let (first, second) = tokio::join!(worker.install(), async {
        network.entered.notified().await;
        let second = worker.install().await;
        network.gate.add_permits(1);
        second
    });
    first.expect("first install");
    assert!(matches!(second, Err(BridgeError::InvalidState { operation: "install", .. })));
    assert_eq!(worker.state(), WorkerState::Installed);
    assert_eq!(worker.caches().entry_count("cc-static-v2").expect("count"), 3);
}

/// Accepts one write, then refuses every write and removal.
#[derive(Default)]
struct BrittleStore {
    inner: MemoryStore,
    writes: std::sync::atomic::AtomicUsize,
}

impl LocalStore for BrittleStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(StoreError::Poisoned);
        }
        self.inner.set(key, value)
    }

    fn remove(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Poisoned)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.keys_with_prefix(prefix)
    }
}

#[tokio::test]
async fn failed_rollback_still_reports_the_write_error() {
    let network = Arc::new(ScriptedTransport::new());
    serve_manifest(&network);
    let store = Arc::new(BrittleStore::default());
    let worker = ServiceWorker::new(config(), network, CacheStorage::new(store));

    let err = worker.install().await.expect_err("second write fails");
    assert!(matches!(err, BridgeError::Store(StoreError::Poisoned)));
    assert_eq!(worker.state(), WorkerState::Redundant);
    assert!(matches!(worker.install().await, Err(BridgeError::InvalidState { .. })));
}

#[tokio::test]
async fn restart_resumes_installed_generation_offline() {
    let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
    let network = Arc::new(ScriptedTransport::new());
    serve_manifest(&network);
    let first = ServiceWorker::new(config(), network.clone(), CacheStorage::new(store.clone()));
    assert_eq!(first.start().await, WorkerState::Activated);

    network.set_offline(true);
    let fetched = network.request_count();
    let second = ServiceWorker::new(config(), network.clone(), CacheStorage::new(store));
    assert_eq!(second.start().await, WorkerState::Activated);
    assert_eq!(network.request_count(), fetched);
}

#[tokio::test]
async fn first_start_offline_passes_requests_through() {
    let network = Arc::new(ScriptedTransport::new());
    network.set_offline(true);
    let worker = worker(network);
    assert_eq!(worker.start().await, WorkerState::Redundant);
    assert!(!worker.resume().expect("resume"));
}

#[tokio::test]
async fn activation_requires_install_and_retires_old_generations() {
    let network = Arc::new(ScriptedTransport::new());
    serve_manifest(&network);
    let worker = worker(network);
    assert!(matches!(worker.activate(), Err(BridgeError::InvalidState { .. })));

    let old = RequestKey::new(HttpMethod::Get, "/index.html");
    worker.caches().put("cc-static-v1", &old, &HttpResponse::text(200, "stale")).expect("put");
    worker.caches().put("cc-api-v1", &old, &HttpResponse::text(200, "stale")).expect("put");
    let current = RequestKey::new(HttpMethod::Get, "https://api.city.example/Reports");
    worker.caches().put("cc-api-v2", &current, &HttpResponse::text(200, "[]")).expect("put");

    worker.install().await.expect("install");
    worker.activate().expect("activate");

    let generations: Vec<String> =
        worker.caches().generations().expect("generations").into_iter().collect();
    assert_eq!(generations, vec!["cc-api-v2".to_string(), "cc-static-v2".to_string()]);
    assert_eq!(worker.state(), WorkerState::Activated);
}

#[tokio::test]
async fn activation_claims_existing_clients() {
    let network = Arc::new(ScriptedTransport::new());
    serve_manifest(&network);
    let worker = worker(network);
    let (early, _early_rx) = worker.register_client();
    assert!(!worker.is_controlled(early));

    worker.install().await.expect("install");
    worker.activate().expect("activate");
    assert!(worker.is_controlled(early));

    let (late, _late_rx) = worker.register_client();
    assert!(worker.is_controlled(late));
}

#[tokio::test]
async fn cached_static_asset_never_reaches_network() {
    let network = Arc::new(ScriptedTransport::new());
    let worker = active_worker(network.clone()).await;
    let before = network.request_count();

    let fetched = worker
        .handle_fetch(HttpRequest::get("https://app.city.example/index.html?v=3"))
        .await
        .expect("fetch");
    assert_eq!(fetched.source, ResponseSource::Cache);
    assert_eq!(fetched.response.body, "<html>index</html>");
    assert_eq!(network.request_count(), before);
}

#[tokio::test]
async fn uncached_static_asset_offline_gets_synthesized_response() {
    let network = Arc::new(ScriptedTransport::new());
    let worker = active_worker(network.clone()).await;
    worker.caches().delete_generation("cc-static-v2").expect("evict");
    network.set_offline(true);

    let fetched = worker
        .handle_fetch(HttpRequest::get("https://app.city.example/js/app.js"))
        .await
        .expect("fetch");
    assert_eq!(fetched.source, ResponseSource::Offline);
    assert_eq!(fetched.response.status, 503);
    assert_eq!(fetched.response.body, "Offline");
}

#[tokio::test]
async fn api_success_overwrites_cached_snapshot() {
    let network = Arc::new(ScriptedTransport::new());
    let worker = active_worker(network.clone()).await;
    let url = "https://api.city.example/Reports";
    let key = RequestKey::new(HttpMethod::Get, url);
    let seeded = HttpResponse::json(200, &json!([{"id": 1}]));
    worker.caches().put("cc-api-v2", &key, &seeded).expect("seed");
    network.route(HttpMethod::Get, "/Reports", HttpResponse::json(200, &json!([{"id": 2}])));

    let fetched = worker.handle_fetch(HttpRequest::get(url)).await.expect("fetch");
    assert_eq!(fetched.source, ResponseSource::Network);

    let cached = worker.caches().match_in("cc-api-v2", &key).expect("match").expect("cached");
    assert_eq!(cached.body, json!([{"id": 2}]).to_string());
}

#[tokio::test]
async fn api_failure_serves_last_snapshot() {
    let network = Arc::new(ScriptedTransport::new());
    let worker = active_worker(network.clone()).await;
    let url = "https://api.city.example/Reports/5";
    network.route(HttpMethod::Get, "/Reports/5", HttpResponse::json(200, &json!({"id": 5})));
    worker.handle_fetch(HttpRequest::get(url)).await.expect("warm");

    network.set_offline(true);
    let fetched = worker.handle_fetch(HttpRequest::get(url)).await.expect("fetch");
    assert_eq!(fetched.source, ResponseSource::Cache);
    assert_eq!(fetched.response.body, json!({"id": 5}).to_string());
}

#[tokio::test]
async fn api_failure_without_snapshot_degrades_to_empty_success() {
    let network = Arc::new(ScriptedTransport::new());
    let worker = active_worker(network.clone()).await;
    network.set_offline(true);

    let fetched = worker
        .handle_fetch(HttpRequest::get("https://api.city.example/Reports"))
        .await
        .expect("fetch");
    assert_eq!(fetched.source, ResponseSource::Offline);
    assert_eq!(fetched.response.status, 200);
    assert!(fetched.response.is_json());
    let body: serde_json::Value = serde_json::from_str(&fetched.response.body).expect("json");
    assert_eq!(body, json!({"ok": true, "offline": true, "data": []}));
}

#[tokio::test]
async fn api_writes_are_not_cached_and_fail_offline() {
    let network = Arc::new(ScriptedTransport::new());
    let worker = active_worker(network.clone()).await;
    let url = "https://api.city.example/Reports/5/estado";
    network.route(
        HttpMethod::Put,
        "/Reports/5/estado",
        HttpResponse::json(200, &json!({"ok": true})),
    );
    worker.handle_fetch(HttpRequest::new(HttpMethod::Put, url)).await.expect("online write");
    assert_eq!(worker.caches().entry_count("cc-api-v2").expect("count"), 0);

    network.set_offline(true);
    let err =
        worker.handle_fetch(HttpRequest::new(HttpMethod::Put, url)).await.expect_err("offline");
    assert!(matches!(err, TransportError::Unreachable { .. }));
}

#[tokio::test]
async fn other_requests_fall_back_to_any_cache_then_fail() {
    let network = Arc::new(ScriptedTransport::new());
    let worker = active_worker(network.clone()).await;
    let fonts = "https://fonts.example/inter.woff2";
    let font_key = RequestKey::new(HttpMethod::Get, fonts);
    worker.caches().put("cc-static-v2", &font_key, &HttpResponse::text(200, "font")).expect("seed");
    network.set_offline(true);

    let hit = worker.handle_fetch(HttpRequest::get(fonts)).await.expect("cached");
    assert_eq!(hit.source, ResponseSource::Cache);

    let miss = worker.handle_fetch(HttpRequest::get("https://cdn.example/other.css")).await;
    assert!(miss.is_err());
}

#[tokio::test]
async fn before_activation_requests_pass_through() {
    let network = Arc::new(ScriptedTransport::new());
    let worker = worker(network.clone());
    network.set_offline(true);
    let err = worker.handle_fetch(HttpRequest::get("https://api.city.example/Reports")).await;
    assert!(err.is_err());
}

#[test]
fn sync_event_posts_to_one_client_only() {
    let worker = worker(Arc::new(ScriptedTransport::new()));
    let (_first, mut first_rx) = worker.register_client();
    let (_second, mut second_rx) = worker.register_client();

    assert!(!worker.on_sync("some-other-tag"));
    assert!(worker.on_sync("sync-reports"));
    assert_eq!(first_rx.try_recv().expect("message"), BridgeMessage::SyncNow);
    assert!(second_rx.try_recv().is_err());
}

#[test]
fn sync_event_skips_closed_clients() {
    let worker = worker(Arc::new(ScriptedTransport::new()));
    let (_gone, gone_rx) = worker.register_client();
    drop(gone_rx);
    let (_alive, mut alive_rx) = worker.register_client();

    assert!(worker.on_sync("sync-reports"));
    assert_eq!(alive_rx.try_recv().expect("message"), BridgeMessage::SyncNow);
}

#[test]
fn registered_syncs_fire_once_delivered() {
    let worker = worker(Arc::new(ScriptedTransport::new()));
    worker.register_sync("sync-reports").expect("register");
    assert_eq!(worker.fire_pending_syncs(), 0, "no client yet");
    assert_eq!(worker.registered_syncs(), vec!["sync-reports".to_string()]);

    let (_id, mut rx) = worker.register_client();
    assert_eq!(worker.fire_pending_syncs(), 1);
    assert!(worker.registered_syncs().is_empty());
    assert_eq!(rx.try_recv().expect("message"), BridgeMessage::SyncNow);
}

#[test]
fn sync_message_wire_shape() {
    let wire = serde_json::to_value(BridgeMessage::SyncNow).expect("ser");
    assert_eq!(wire, json!({"type": "SYNC_NOW"}));
}

#[test]
fn api_class_requires_a_path_boundary() {
    let network = Arc::new(ScriptedTransport::new());
    let worker = worker(network);
    let class = |url: &str| worker.classify(&HttpRequest::get(url));
    assert_eq!(class("https://api.city.example/Reports"), RequestClass::Api);
    assert_eq!(class("https://api.city.example"), RequestClass::Api);
    assert_eq!(class("https://api.city.example?page=2"), RequestClass::Api);
    assert_eq!(class("https://api.city.example.evil/Reports"), RequestClass::Other);
    assert_eq!(class("https://api.city.examples/Reports"), RequestClass::Other);
}
