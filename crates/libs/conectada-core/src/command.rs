//! Typed command dispatch over an explicit [`AppContext`].

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, watch};

use crate::api::{NewUser, Report, ReportsApi, Submission};
use crate::bridge::{BridgeMessage, BridgedTransport, ServiceWorker};
use crate::config::ClientConfig;
use crate::connectivity::{spawn_drain, Connectivity, ConnectivityObserver};
use crate::error::ApiError;
use crate::events::EventBus;
use crate::gateway::ApiClient;
use crate::notify::{Notification, Notifier};
use crate::queue::{DeadLetter, DrainOutcome, QueuedAction, SyncQueue};
use crate::session::Session;
use crate::store::LocalStore;
use crate::transport::Transport;

/// Everything a page needs, wired once and passed around explicitly.
pub struct AppContext {
    pub config: ClientConfig,
    pub store: Arc<dyn LocalStore>,
    pub session: Session,
    pub client: Arc<ApiClient>,
    pub queue: Arc<SyncQueue>,
    pub api: ReportsApi,
    pub events: EventBus,
    pub notifier: Arc<dyn Notifier>,
}

impl AppContext {
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let queue = SyncQueue::new(
            store.clone(),
            transport.clone(),
            Session::new(store.clone()),
            config.api_base.clone(),
            EventBus::new(),
        );
        Self::assemble(config, store, transport, notifier, queue)
    }

    /// Routes traffic through `worker` and registers background syncs with it.
    pub fn with_bridge(
        config: ClientConfig,
        store: Arc<dyn LocalStore>,
        worker: Arc<ServiceWorker>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(BridgedTransport::new(worker.clone()));
        let queue = SyncQueue::new(
            store.clone(),
            transport.clone(),
            Session::new(store.clone()),
            config.api_base.clone(),
            EventBus::new(),
        )
        .with_registrar(worker, config.sync_tag.clone());
        Self::assemble(config, store, transport, notifier, queue)
    }

    fn assemble(
        config: ClientConfig,
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        queue: SyncQueue,
    ) -> Self {
        let events = queue.events().clone();
        let session = Session::new(store.clone());
        let client = Arc::new(ApiClient::new(
            config.api_base.clone(),
            transport,
            session.clone(),
            notifier.clone(),
            events.clone(),
        ));
        let queue = Arc::new(queue);
        let api = ReportsApi::new(client.clone(), queue.clone());
        Self {
            config,
            store,
            session,
            client,
            queue,
            api,
            events,
            notifier,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Login { email: String, password: String },
    Logout,
    WhoAmI,
    Register(NewUser),
    ListReports,
    ShowReport { id: String },
    Evidence { id: String },
    SetStatus { id: String, estado: String },
    SyncNow,
    ShowQueue,
    DropQueued { id: u64 },
    DeadLetters,
    ClearDeadLetters,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommandOutput {
    LoggedIn { user: JsonValue },
    LoggedOut,
    User(Option<JsonValue>),
    Registered(JsonValue),
    Reports(Vec<Report>),
    Report(Report),
    Evidence(Vec<String>),
    Submission(Submission),
    Drained(DrainOutcome),
    Queue(Vec<QueuedAction>),
    Dropped { id: u64, found: bool },
    DeadLetters(Vec<DeadLetter>),
    Cleared,
}

#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<AppContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    pub async fn dispatch(&self, command: Command) -> Result<CommandOutput, ApiError> {
        let ctx = &self.ctx;
        match command {
            Command::Login { email, password } => {
                let credential = ctx.api.login(&email, &password).await?;
                ctx.notifier.notify(Notification::success("Signed in"));
                Ok(CommandOutput::LoggedIn {
                    user: credential.user,
                })
            }
            Command::Logout => {
                ctx.api.logout()?;
                Ok(CommandOutput::LoggedOut)
            }
            Command::WhoAmI => Ok(CommandOutput::User(ctx.api.current_user()?)),
            Command::Register(user) => {
                let created = ctx.api.register_user(&user).await?;
                ctx.notifier.notify(Notification::success("User registered"));
                Ok(CommandOutput::Registered(created))
            }
            Command::ListReports => Ok(CommandOutput::Reports(ctx.api.list_reports().await?)),
            Command::ShowReport { id } => Ok(CommandOutput::Report(ctx.api.get_report(&id).await?)),
            Command::Evidence { id } => {
                Ok(CommandOutput::Evidence(ctx.api.get_evidence(&id).await?))
            }
            Command::SetStatus { id, estado } => {
                let submission = ctx.api.set_report_status(&id, &estado).await?;
                if !submission.is_queued() {
                    ctx.notifier.notify(Notification::success("Status updated"));
                }
                Ok(CommandOutput::Submission(submission))
            }
            Command::SyncNow => Ok(CommandOutput::Drained(ctx.queue.drain().await?)),
            Command::ShowQueue => Ok(CommandOutput::Queue(ctx.queue.pending()?)),
            Command::DropQueued { id } => {
                let found = ctx.queue.remove(id)?;
                Ok(CommandOutput::Dropped { id, found })
            }
            Command::DeadLetters => Ok(CommandOutput::DeadLetters(ctx.queue.dead_letters()?)),
            Command::ClearDeadLetters => {
                ctx.queue.clear_dead_letters()?;
                Ok(CommandOutput::Cleared)
            }
        }
    }
}

/// Lifetime of one open page: drains at startup, on every `SYNC_NOW` from
/// the bridge and on every transition to online. Returns once the bridge
/// drops the page's channel, after the drains it started have finished.
pub async fn page_loop(
    ctx: Arc<AppContext>,
    mut bridge: mpsc::UnboundedReceiver<BridgeMessage>,
    connectivity: watch::Receiver<Connectivity>,
) {
    let observer = ConnectivityObserver::new(
        ctx.queue.clone(),
        ctx.notifier.clone(),
        ctx.events.clone(),
        connectivity,
    );
    let observing = tokio::spawn(observer.run());

    let mut drains = Vec::new();
    while let Some(message) = bridge.recv().await {
        match message {
            BridgeMessage::SyncNow => drains.push(spawn_drain(ctx.queue.clone(), "SYNC_NOW")),
        }
        drains.retain(|handle| !handle.is_finished());
    }
    log::debug!("bridge channel closed; page loop stopping");

    observing.abort();
    for handle in drains {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeConfig, CacheStorage};
    use crate::events::AppEvent;
    use crate::store::MemoryStore;
    use crate::testing::{RecordingNotifier, ScriptedTransport};
    use crate::transport::{HttpMethod, HttpResponse};
    use serde_json::json;

    const API: &str = "https://api.city.example";

    fn dispatcher(transport: Arc<ScriptedTransport>) -> Dispatcher {
        let ctx = AppContext::new(
            ClientConfig::new(API),
            Arc::new(MemoryStore::new()),
            transport,
            Arc::new(RecordingNotifier::new()),
        );
        Dispatcher::new(Arc::new(ctx))
    }

    #[tokio::test]
    async fn login_then_list_sends_bearer_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route(
            HttpMethod::Post,
            "/auth/login",
            HttpResponse::json(200, &json!({"token": "jwt-9", "user": {"id": 1}})),
        );
        transport.route(HttpMethod::Get, "/Reports", HttpResponse::json(200, &json!([])));
        let dispatcher = dispatcher(transport.clone());

        let login = Command::Login {
            email: "ana@example.com".into(),
            password: "pw".into(),
        };
        let output = dispatcher.dispatch(login).await.expect("login");
        assert_eq!(output, CommandOutput::LoggedIn { user: json!({"id": 1}) });

        let reports = dispatcher.dispatch(Command::ListReports).await.expect("list");
        assert_eq!(reports, CommandOutput::Reports(Vec::new()));
        let listed = &transport.requests_to("/Reports")[0];
        assert_eq!(listed.header("authorization"), Some("Bearer jwt-9"));

        dispatcher.dispatch(Command::Logout).await.expect("logout");
        let whoami = dispatcher.dispatch(Command::WhoAmI).await.expect("whoami");
        assert_eq!(whoami, CommandOutput::User(None));
    }

    #[tokio::test]
    async fn queued_status_is_visible_and_droppable() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_offline(true);
        let dispatcher = dispatcher(transport);

        let set = Command::SetStatus {
            id: "7".into(),
            estado: "En proceso".into(),
        };
        let CommandOutput::Submission(Submission::Queued(action)) =
            dispatcher.dispatch(set).await.expect("queued")
        else {
            panic!("expected a queued submission");
        };

        let listing = dispatcher.dispatch(Command::ShowQueue).await.expect("queue");
        let CommandOutput::Queue(pending) = listing else {
            panic!("expected queue listing");
        };
        assert_eq!(pending, vec![action.clone()]);

        let drop_it = Command::DropQueued { id: action.id };
        let dropped = dispatcher.dispatch(drop_it.clone()).await.expect("drop");
        assert_eq!(dropped, CommandOutput::Dropped { id: action.id, found: true });
        let again = dispatcher.dispatch(drop_it).await.expect("drop");
        assert_eq!(again, CommandOutput::Dropped { id: action.id, found: false });
    }

    #[tokio::test]
    async fn sync_now_reports_dead_letters() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route_unreachable(HttpMethod::Put, "/Reports/3/estado");
        transport.route(
            HttpMethod::Put,
            "/Reports/3/estado",
            HttpResponse::text(404, "no such report"),
        );
        let dispatcher = dispatcher(transport);

        let set = Command::SetStatus {
            id: "3".into(),
            estado: "Resuelto".into(),
        };
        dispatcher.dispatch(set).await.expect("queued");

        let drained = dispatcher.dispatch(Command::SyncNow).await.expect("sync");
        let CommandOutput::Drained(outcome) = drained else {
            panic!("expected drain outcome");
        };
        assert_eq!(outcome.report().map(|report| report.dead_lettered), Some(1));

        let CommandOutput::DeadLetters(letters) =
            dispatcher.dispatch(Command::DeadLetters).await.expect("letters")
        else {
            panic!("expected dead letters");
        };
        assert_eq!(letters[0].status, 404);

        dispatcher.dispatch(Command::ClearDeadLetters).await.expect("clear");
        assert_eq!(
            dispatcher.dispatch(Command::DeadLetters).await.expect("letters"),
            CommandOutput::DeadLetters(Vec::new())
        );
    }

    #[tokio::test]
    async fn page_loop_drains_on_sync_now() {
        let network = Arc::new(ScriptedTransport::new());
        network.route(
            HttpMethod::Put,
            "/Reports/5/estado",
            HttpResponse::json(200, &json!({"ok": true})),
        );
        let config = ClientConfig::new(API);
        let worker = Arc::new(ServiceWorker::new(
            BridgeConfig::from_client_config("https://app.city.example", &config),
            network.clone(),
            CacheStorage::new(Arc::new(MemoryStore::new())),
        ));
        let ctx = Arc::new(AppContext::with_bridge(
            config,
            Arc::new(MemoryStore::new()),
            worker.clone(),
            Arc::new(RecordingNotifier::new()),
        ));

        network.set_offline(true);
        let set = Command::SetStatus {
            id: "5".into(),
            estado: "Resuelto".into(),
        };
        Dispatcher::new(ctx.clone()).dispatch(set).await.expect("queued");
        assert_eq!(worker.registered_syncs(), vec!["sync-reports".to_string()]);

        let (client, page_rx) = worker.register_client();
        let (_signal, connectivity) = watch::channel(Connectivity::Offline);
        let mut events = ctx.events.subscribe();
        let page = tokio::spawn(page_loop(ctx.clone(), page_rx, connectivity));

        network.set_offline(false);
        assert_eq!(worker.fire_pending_syncs(), 1);
        loop {
            if let AppEvent::DrainFinished { succeeded, .. } = events.recv().await.expect("event") {
                assert_eq!(succeeded, 1);
                break;
            }
        }
        assert!(ctx.queue.is_empty().expect("empty"));

        worker.unregister_client(client);
        page.await.expect("page loop");
    }
}
