use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::events::{AppEvent, EventBus};
use crate::notify::{Notification, Notifier};
use crate::queue::{DrainOutcome, SyncQueue};
use crate::transport::{HttpRequest, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

/// Starts a drain on its own task. Overlapping calls are absorbed by the
/// queue's single-flight guard.
pub fn spawn_drain(queue: Arc<SyncQueue>, reason: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::debug!("drain triggered by {reason}");
        match queue.drain().await {
            Ok(DrainOutcome::AlreadyRunning) => log::debug!("{reason}: drain already running"),
            Ok(DrainOutcome::Completed(_)) => {}
            Err(err) => log::warn!("{reason}: drain failed: {err}"),
        }
    })
}

/// Drains on startup and on every transition to online. Going offline only
/// updates the status indicator.
pub struct ConnectivityObserver {
    queue: Arc<SyncQueue>,
    notifier: Arc<dyn Notifier>,
    events: EventBus,
    signal: watch::Receiver<Connectivity>,
    initial: Connectivity,
}

impl ConnectivityObserver {
    /// The startup state is the signal's value at construction.
    pub fn new(
        queue: Arc<SyncQueue>,
        notifier: Arc<dyn Notifier>,
        events: EventBus,
        mut signal: watch::Receiver<Connectivity>,
    ) -> Self {
        let initial = *signal.borrow_and_update();
        Self {
            queue,
            notifier,
            events,
            signal,
            initial,
        }
    }

    /// Runs until the signal's sender is dropped, then waits for the drains
    /// it started.
    pub async fn run(mut self) {
        let mut drains = Vec::new();
        let mut current = self.initial;
        if current.is_online() {
            drains.push(spawn_drain(self.queue.clone(), "startup"));
        }

        while self.signal.changed().await.is_ok() {
            let next = *self.signal.borrow_and_update();
            if next == current {
                continue;
            }
            current = next;
            self.indicate(next);
            if next.is_online() {
                drains.push(spawn_drain(self.queue.clone(), "connectivity"));
            }
            drains.retain(|handle| !handle.is_finished());
        }

        for handle in drains {
            let _ = handle.await;
        }
    }

    fn indicate(&self, connectivity: Connectivity) {
        let notification = match connectivity {
            Connectivity::Online => Notification::info("Back online"),
            Connectivity::Offline => {
                Notification::info("Offline: changes will sync when the connection returns")
            }
        };
        self.notifier.notify(notification);
        self.events.publish(AppEvent::ConnectivityChanged { connectivity });
    }
}

/// Polls a URL and publishes whether the server answered at all.
pub struct ConnectivityProbe {
    transport: Arc<dyn Transport>,
    url: String,
    interval: Duration,
}

impl ConnectivityProbe {
    pub fn new(transport: Arc<dyn Transport>, url: impl Into<String>, interval: Duration) -> Self {
        Self {
            transport,
            url: url.into(),
            interval,
        }
    }

    /// Any HTTP response, whatever its status, counts as online.
    pub async fn check_once(&self) -> Connectivity {
        match self.transport.send(HttpRequest::get(self.url.clone())).await {
            Ok(_) => Connectivity::Online,
            Err(err) => {
                log::debug!("probe {} failed: {err}", self.url);
                Connectivity::Offline
            }
        }
    }

    /// Publishes changes until every receiver is gone.
    pub async fn run(self, sender: watch::Sender<Connectivity>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while !sender.is_closed() {
            ticker.tick().await;
            let next = self.check_once().await;
            sender.send_if_modified(|current| {
                if *current == next {
                    return false;
                }
                *current = next;
                true
            });
        }
    }
}
