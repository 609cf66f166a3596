//! Persisted queue of mutating calls deferred while offline.
//!
//! The whole queue is one JSON array under [`SYNC_QUEUE_KEY`]. A drain reads
//! it, replays every action in order through the raw transport and rewrites
//! the array once at the end, so a crash mid-pass loses nothing and the next
//! drain starts again from the top. Replays therefore happen at least once;
//! only idempotent actions belong here.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::StoreError;
use crate::events::{AppEvent, EventBus};
use crate::gateway::{authorized_request, join_url};
use crate::session::Session;
use crate::store::{get_json, set_json, LocalStore, DEAD_LETTERS_KEY, SYNC_QUEUE_KEY};
use crate::transport::{HttpMethod, Transport};

/// A mutating call to defer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewAction {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
}

impl NewAction {
    pub fn new(method: HttpMethod, url: impl Into<String>, body: Option<JsonValue>) -> Self {
        Self {
            url: url.into(),
            method,
            body,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: u64,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
}

/// An action whose replay was rejected for good.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub action: QueuedAction,
    pub status: u16,
    pub body: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayClass {
    Delivered,
    Retry,
    Permanent,
}

/// `401` is retried: the action becomes valid again once the user signs in.
pub fn classify_status(status: u16) -> ReplayClass {
    match status {
        200..=299 => ReplayClass::Delivered,
        401 | 408 | 425 | 429 => ReplayClass::Retry,
        400..=499 => ReplayClass::Permanent,
        _ => ReplayClass::Retry,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub retained: usize,
    pub dead_lettered: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain held the single-flight guard; nothing was touched.
    AlreadyRunning,
    Completed(DrainReport),
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::AlreadyRunning => None,
        }
    }
}

/// Platform hook asking for a later background-sync wake-up.
pub trait SyncRegistrar: Send + Sync {
    fn register_sync(&self, tag: &str) -> std::io::Result<()>;
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncQueue {
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn Transport>,
    session: Session,
    base_url: String,
    events: EventBus,
    registrar: Option<(Arc<dyn SyncRegistrar>, String)>,
    draining: AtomicBool,
    write_lock: Mutex<()>,
    last_id: AtomicU64,
}

impl SyncQueue {
    pub fn new(
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn Transport>,
        session: Session,
        base_url: impl Into<String>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            transport,
            session,
            base_url: base_url.into(),
            events,
            registrar: None,
            draining: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            last_id: AtomicU64::new(0),
        }
    }

    pub fn with_registrar(
        mut self,
        registrar: Arc<dyn SyncRegistrar>,
        tag: impl Into<String>,
    ) -> Self {
        self.registrar = Some((registrar, tag.into()));
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pending(&self) -> Result<Vec<QueuedAction>, StoreError> {
        Ok(get_json(self.store.as_ref(), SYNC_QUEUE_KEY)?.unwrap_or_default())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.pending()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.pending()?.is_empty())
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        Ok(get_json(self.store.as_ref(), DEAD_LETTERS_KEY)?.unwrap_or_default())
    }

    pub fn clear_dead_letters(&self) -> Result<(), StoreError> {
        self.store.remove(DEAD_LETTERS_KEY)
    }

    /// Appends and persists before returning; background-sync registration
    /// afterwards is best-effort.
    pub fn enqueue(&self, action: NewAction) -> Result<QueuedAction, StoreError> {
        let queued = {
            let _write = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
            let mut queue = self.pending()?;
            let floor = queue.last().map_or(0, |last| last.id);
            let queued = QueuedAction {
                id: self.fresh_id(floor),
                url: action.url,
                method: action.method,
                body: action.body,
            };
            queue.push(queued.clone());
            set_json(self.store.as_ref(), SYNC_QUEUE_KEY, &queue)?;
            queued
        };
        log::info!("queued {} {} as action {}", queued.method, queued.url, queued.id);
        self.events.publish(AppEvent::ActionQueued { id: queued.id });

        if let Some((registrar, tag)) = &self.registrar {
            if let Err(err) = registrar.register_sync(tag) {
                log::debug!("background sync registration for {tag} failed: {err}");
            }
        }
        Ok(queued)
    }

    /// Drops a single queued action by id. Returns whether it was present.
    pub fn remove(&self, id: u64) -> Result<bool, StoreError> {
        let _write = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut queue = self.pending()?;
        let before = queue.len();
        queue.retain(|action| action.id != id);
        if queue.len() == before {
            return Ok(false);
        }
        set_json(self.store.as_ref(), SYNC_QUEUE_KEY, &queue)?;
        Ok(true)
    }

    /// Timestamp-derived and strictly greater than anything issued or stored.
    fn fresh_id(&self, floor: u64) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut previous = self.last_id.load(Ordering::Acquire);
        loop {
            let next = now.max(previous + 1).max(floor + 1);
            match self
                .last_id
                .compare_exchange(previous, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }

    pub async fn drain(&self) -> Result<DrainOutcome, StoreError> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("drain already in progress");
            return Ok(DrainOutcome::AlreadyRunning);
        }
        let _guard = DrainGuard(&self.draining);

        let snapshot = self.pending()?;
        if snapshot.is_empty() {
            return Ok(DrainOutcome::Completed(DrainReport::default()));
        }

        let token = self.session.token()?;
        let mut report = DrainReport {
            attempted: snapshot.len(),
            ..DrainReport::default()
        };
        let mut failed_actions = Vec::new();
        let mut dead = Vec::new();

        for action in &snapshot {
            let url = join_url(&self.base_url, &action.url);
            let mut request = authorized_request(action.method, url, token.as_deref(), &[]);
            request.body = action.body.as_ref().map(JsonValue::to_string);

            match self.transport.send(request).await {
                Ok(response) => match classify_status(response.status) {
                    ReplayClass::Delivered => report.succeeded += 1,
                    ReplayClass::Retry => {
                        log::warn!(
                            "replay of action {} got {}; keeping",
                            action.id,
                            response.status
                        );
                        failed_actions.push(action.clone());
                    }
                    ReplayClass::Permanent => {
                        log::warn!(
                            "replay of action {} rejected with {}; dropping",
                            action.id,
                            response.status
                        );
                        dead.push(DeadLetter {
                            action: action.clone(),
                            status: response.status,
                            body: response.body,
                        });
                    }
                },
                Err(err) => {
                    log::warn!("replay of action {} failed: {err}; keeping", action.id);
                    failed_actions.push(action.clone());
                }
            }
        }

        report.retained = failed_actions.len();
        report.dead_lettered = dead.len();
        self.commit(&snapshot, failed_actions, dead)?;

        log::info!(
            "drain finished: {} attempted, {} delivered, {} kept, {} dead-lettered",
            report.attempted,
            report.succeeded,
            report.retained,
            report.dead_lettered
        );
        self.events.publish(AppEvent::DrainFinished {
            succeeded: report.succeeded,
            retained: report.retained,
            dead_lettered: report.dead_lettered,
        });
        Ok(DrainOutcome::Completed(report))
    }

    /// Replaces the drained snapshot with its failures. Actions enqueued while
    /// the drain was in flight are not part of the snapshot and stay queued
    /// after the retained ones. Failures removed while in flight stay removed.
    fn commit(
        &self,
        snapshot: &[QueuedAction],
        mut residual: Vec<QueuedAction>,
        dead: Vec<DeadLetter>,
    ) -> Result<(), StoreError> {
        let _write = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let current = self.pending()?;
        let still_queued: HashSet<u64> = current.iter().map(|action| action.id).collect();
        residual.retain(|action| still_queued.contains(&action.id));
        let drained: HashSet<u64> = snapshot.iter().map(|action| action.id).collect();
        let arrived = current.into_iter().filter(|action| !drained.contains(&action.id));
        residual.extend(arrived);
        set_json(self.store.as_ref(), SYNC_QUEUE_KEY, &residual)?;

        if !dead.is_empty() {
            let mut letters = self.dead_letters()?;
            letters.extend(dead);
            set_json(self.store.as_ref(), DEAD_LETTERS_KEY, &letters)?;
        }
        Ok(())
    }
}
