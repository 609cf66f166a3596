//! Offline-first sync client for the Ciudad Conectada reports API.
//!
//! The crate is organised leaves first:
//!
//! - [`store`]: durable key-value storage ([`LocalStore`]) with memory and
//!   SQLite backends
//! - [`session`]: the bearer credential kept in the store
//! - [`transport`]: raw HTTP exchange ([`Transport`]) over `ureq`
//! - [`gateway`]: [`ApiClient`], which adds auth headers, classifies
//!   responses and tears the session down on `401`
//! - [`queue`]: [`SyncQueue`], the persisted action queue and its drain
//! - [`bridge`]: [`ServiceWorker`], the background activation bridge with
//!   its cache generations and `SYNC_NOW` channel
//! - [`connectivity`]: online/offline observer that triggers drains
//! - [`api`]: typed calls for the reports HTTP contract
//! - [`command`]: typed command dispatch over an explicit [`AppContext`]
//!
//! Everything that touches the network, storage or the user is behind a
//! trait so tests can substitute doubles from [`testing`].

pub mod api;
pub mod bridge;
pub mod command;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod gateway;
pub mod notify;
pub mod queue;
pub mod session;
pub mod store;
pub mod testing;
pub mod transport;

pub use api::{NewUser, Report, ReportsApi, Submission};
pub use bridge::{BridgeMessage, ServiceWorker, WorkerState};
pub use command::{AppContext, Command, CommandOutput, Dispatcher};
pub use config::ClientConfig;
pub use connectivity::{Connectivity, ConnectivityObserver};
pub use error::{ApiError, StoreError, TransportError};
pub use events::AppEvent;
pub use gateway::{ApiBody, ApiClient, CallOptions, RequestBody};
pub use notify::{Notification, NotificationLevel, Notifier};
pub use queue::{DrainOutcome, DrainReport, NewAction, QueuedAction, SyncQueue};
pub use session::{Session, SessionCredential};
pub use store::{LocalStore, MemoryStore, SqliteStore};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, Transport, UreqTransport};
