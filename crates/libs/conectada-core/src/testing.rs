//! Test doubles for the network and notification seams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::notify::{Notification, Notifier};
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, Transport};

type Route = (HttpMethod, String);

/// Transport that answers from per-route scripts and records every request.
///
/// Routes are matched on method plus the request path. A route holds a queue
/// of outcomes; the last outcome repeats once the queue is down to one entry.
/// Unrouted requests get a `404`. While offline every request fails with
/// [`TransportError::Unreachable`] and is still recorded.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<Route, VecDeque<Result<HttpResponse, TransportError>>>>,
    requests: Mutex<Vec<HttpRequest>>,
    offline: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, method: HttpMethod, path: &str, response: HttpResponse) -> &Self {
        self.push(method, path, Ok(response))
    }

    pub fn route_unreachable(&self, method: HttpMethod, path: &str) -> &Self {
        self.push(method, path, Err(TransportError::unreachable("scripted outage")))
    }

    fn push(
        &self,
        method: HttpMethod,
        path: &str,
        outcome: Result<HttpResponse, TransportError>,
    ) -> &Self {
        let mut routes = self.routes.lock().expect("routes lock");
        routes.entry((method, path.to_string())).or_default().push_back(outcome);
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.requests().into_iter().filter(|request| request.path() == path).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let key = (request.method, request.path().to_string());
        self.requests.lock().expect("requests lock").push(request);
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::unreachable("offline"));
        }
        let mut routes = self.routes.lock().expect("routes lock");
        match routes.get_mut(&key) {
            Some(script) if script.len() > 1 => script.pop_front().expect("non-empty script"),
            Some(script) => script.front().cloned().expect("non-empty script"),
            None => Ok(HttpResponse::text(404, "not found")),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().expect("notifications lock").clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.notifications.lock().expect("notifications lock").push(notification);
    }
}
