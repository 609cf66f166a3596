//! Typed calls for the reports HTTP contract.

mod types;

pub use types::{EvidenceList, NewUser, Report, ServiceRef, Submission};

use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use crate::error::ApiError;
use crate::events::AppEvent;
use crate::gateway::{ApiClient, CallOptions};
use crate::notify::Notification;
use crate::queue::{NewAction, SyncQueue};
use crate::session::SessionCredential;
use crate::transport::HttpMethod;

pub struct ReportsApi {
    client: Arc<ApiClient>,
    queue: Arc<SyncQueue>,
}

impl ReportsApi {
    pub fn new(client: Arc<ApiClient>, queue: Arc<SyncQueue>) -> Self {
        Self { client, queue }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<SessionCredential, ApiError> {
        let body = self
            .client
            .call(
                "/auth/login",
                CallOptions::json(
                    HttpMethod::Post,
                    json!({ "email": email, "password": password }),
                ),
            )
            .await?
            .into_json()?;

        let token = body
            .get("token")
            .and_then(JsonValue::as_str)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| self.invalid("login response has no token"))?;
        let user = body
            .get("user")
            .filter(|user| !user.is_null())
            .cloned()
            .ok_or_else(|| self.invalid("login response has no user"))?;

        let credential = SessionCredential {
            token: token.to_string(),
            user,
        };
        self.client.session().save(&credential)?;
        self.client.events().publish(AppEvent::LoggedIn);
        Ok(credential)
    }

    pub fn logout(&self) -> Result<(), ApiError> {
        self.client.session().clear()?;
        self.client.events().publish(AppEvent::LoggedOut);
        Ok(())
    }

    pub fn current_user(&self) -> Result<Option<JsonValue>, ApiError> {
        Ok(self.client.session().current_user()?)
    }

    /// Never deferred: a replayed create could register the user twice.
    pub async fn register_user(&self, user: &NewUser) -> Result<JsonValue, ApiError> {
        let body = serde_json::to_value(user)?;
        let created = self.client.call("/Users", CallOptions::json(HttpMethod::Post, body)).await?;
        Ok(created.as_json().cloned().unwrap_or(JsonValue::Null))
    }

    pub async fn list_reports(&self) -> Result<Vec<Report>, ApiError> {
        let response = self.client.call("/Reports", CallOptions::get()).await?;
        let decoded = response
            .into_json()
            .and_then(unwrap_list)
            .and_then(|list| Ok(serde_json::from_value::<Vec<Report>>(list)?));
        self.reported(decoded)
    }

    /// An offline read with no cached copy is reported as unreachable.
    pub async fn get_report(&self, id: &str) -> Result<Report, ApiError> {
        let response = self.client.call(&format!("/Reports/{id}"), CallOptions::get()).await?;
        let body = self.reported(response.into_json())?;
        if is_offline_placeholder(&body) {
            self.client
                .notifier()
                .notify(Notification::error("This report is not available offline"));
            return Err(ApiError::Transport {
                message: format!("report {id} is not cached for offline use"),
            });
        }
        self.reported(serde_json::from_value(body).map_err(ApiError::from))
    }

    pub async fn get_evidence(&self, id: &str) -> Result<Vec<String>, ApiError> {
        let response = self
            .client
            .call(&format!("/Reports/{id}/evidencias"), CallOptions::get())
            .await?;
        let body = self.reported(response.into_json())?;
        if is_offline_placeholder(&body) {
            return Ok(Vec::new());
        }
        let list: EvidenceList =
            self.reported(serde_json::from_value(body).map_err(ApiError::from))?;
        Ok(list.evidencias)
    }

    /// Setting a status is idempotent, so an unreachable server defers the
    /// call to the sync queue instead of failing.
    pub async fn set_report_status(&self, id: &str, estado: &str) -> Result<Submission, ApiError> {
        let endpoint = format!("/Reports/{id}/estado");
        let body = json!({ "estado": estado });
        let options = CallOptions::json(HttpMethod::Put, body.clone());
        match self.client.call(&endpoint, options).await {
            Ok(response) => {
                let echoed = response.as_json().cloned().unwrap_or(JsonValue::Null);
                Ok(Submission::Sent(echoed))
            }
            Err(err) if err.is_transport() => {
                let action = NewAction::new(HttpMethod::Put, endpoint, Some(body));
                let queued = self.queue.enqueue(action)?;
                self.client.notifier().notify(Notification::info(
                    "Saved offline; it will be sent when the connection returns",
                ));
                Ok(Submission::Queued(queued))
            }
            Err(err) => Err(err),
        }
    }

    fn invalid(&self, message: &str) -> ApiError {
        let err = ApiError::parse(message);
        self.announce(&err);
        err
    }

    /// Surfaces a failure found after the gateway returned. The gateway
    /// already notified for its own failures.
    fn reported<T>(&self, result: Result<T, ApiError>) -> Result<T, ApiError> {
        if let Err(err) = &result {
            self.announce(err);
        }
        result
    }

    fn announce(&self, err: &ApiError) {
        log::warn!("unusable response: {err}");
        self.client
            .notifier()
            .notify(Notification::error("Unexpected response from the server"));
    }
}

/// The bridge answers offline reads with `{ok, offline, data}`; other
/// deployments wrap lists in `data` too.
fn unwrap_list(body: JsonValue) -> Result<JsonValue, ApiError> {
    match body {
        JsonValue::Array(_) => Ok(body),
        JsonValue::Object(mut object) => match object.remove("data") {
            Some(data @ JsonValue::Array(_)) => Ok(data),
            _ => Err(ApiError::parse("expected a list of reports")),
        },
        _ => Err(ApiError::parse("expected a list of reports")),
    }
}

fn is_offline_placeholder(body: &JsonValue) -> bool {
    body.get("offline").and_then(JsonValue::as_bool).unwrap_or(false)
}
