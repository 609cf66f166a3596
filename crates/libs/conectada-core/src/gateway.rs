use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::ApiError;
use crate::events::{AppEvent, EventBus};
use crate::notify::{Notification, Notifier};
use crate::session::Session;
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, Transport};

#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    Json(JsonValue),
    /// Already serialized; sent verbatim.
    Text(String),
}

impl RequestBody {
    fn into_wire(self) -> String {
        match self {
            Self::Json(value) => value.to_string(),
            Self::Text(text) => text,
        }
    }
}

impl From<JsonValue> for RequestBody {
    fn from(value: JsonValue) -> Self {
        Self::Json(value)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallOptions {
    pub method: HttpMethod,
    pub body: Option<RequestBody>,
    pub headers: Vec<(String, String)>,
}

impl CallOptions {
    pub fn get() -> Self {
        Self {
            method: HttpMethod::Get,
            ..Self::default()
        }
    }

    pub fn with_method(method: HttpMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn json(method: HttpMethod, body: JsonValue) -> Self {
        Self {
            method,
            body: Some(RequestBody::Json(body)),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Parsed response body.
#[derive(Clone, Debug, PartialEq)]
pub enum ApiBody {
    Json(JsonValue),
    Text(String),
}

impl ApiBody {
    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    pub fn into_json(self) -> Result<JsonValue, ApiError> {
        match self {
            Self::Json(value) => Ok(value),
            Self::Text(text) => Err(ApiError::parse(format!("expected json, got text: {text}"))),
        }
    }

    pub fn decode<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        Ok(serde_json::from_value(self.into_json()?)?)
    }
}

/// Joins a relative endpoint onto the API base with exactly one `/`.
/// Absolute URLs pass through untouched.
pub fn join_url(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), endpoint.trim_start_matches('/'))
}

/// Attaches the JSON content type and, when a session exists, the bearer
/// token. Later headers replace earlier ones with the same name, so caller
/// headers are applied last; blank caller values are ignored so a default can
/// be overridden but never removed.
pub(crate) fn authorized_request(
    method: HttpMethod,
    url: String,
    token: Option<&str>,
    extra_headers: &[(String, String)],
) -> HttpRequest {
    let mut request = HttpRequest::new(method, url);
    request.set_header("Content-Type", "application/json");
    if let Some(token) = token {
        request.set_header("Authorization", format!("Bearer {token}"));
    }
    for (name, value) in extra_headers {
        if !value.trim().is_empty() {
            request.set_header(name.clone(), value.clone());
        }
    }
    request
}

pub struct ApiClient {
    base_url: String,
    transport: Arc<dyn Transport>,
    session: Session,
    notifier: Arc<dyn Notifier>,
    events: EventBus,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        session: Session,
        notifier: Arc<dyn Notifier>,
        events: EventBus,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            transport,
            session,
            notifier,
            events,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn call(&self, endpoint: &str, options: CallOptions) -> Result<ApiBody, ApiError> {
        let result = self.call_inner(endpoint, options).await;
        if let Err(err) = &result {
            log::warn!("api call {endpoint} failed: {err}");
            self.notifier.notify(Notification::error(user_message(err)));
        }
        result
    }

    async fn call_inner(&self, endpoint: &str, options: CallOptions) -> Result<ApiBody, ApiError> {
        let token = self.session.token()?;
        let url = join_url(&self.base_url, endpoint);
        let mut request =
            authorized_request(options.method, url, token.as_deref(), &options.headers);
        request.body = options.body.map(RequestBody::into_wire);

        log::debug!("api {} {}", request.method, request.url);
        let response = self.transport.send(request).await?;

        if !response.is_success() {
            if response.status == 401 {
                self.expire_session();
            }
            return Err(ApiError::Status {
                status: response.status,
                body: response.body,
            });
        }
        parse_body(response)
    }

    fn expire_session(&self) {
        if let Err(err) = self.session.clear() {
            log::warn!("failed to clear session after 401: {err}");
        }
        self.events.publish(AppEvent::SessionExpired);
    }
}

fn parse_body(response: HttpResponse) -> Result<ApiBody, ApiError> {
    if response.is_json() {
        if response.body.trim().is_empty() {
            return Ok(ApiBody::Json(JsonValue::Null));
        }
        return Ok(ApiBody::Json(serde_json::from_str(&response.body)?));
    }
    Ok(ApiBody::Text(response.body))
}

fn user_message(err: &ApiError) -> String {
    match err {
        ApiError::Transport { .. } => "No connection to the server".to_string(),
        ApiError::Status { status: 401, .. } => "Session expired, please sign in again".to_string(),
        ApiError::Status { status, body } if body.trim().is_empty() => {
            format!("Request failed ({status})")
        }
        ApiError::Status { status, body } => format!("Request failed ({status}): {}", body.trim()),
        ApiError::Parse { .. } => "Unexpected response from the server".to_string(),
        ApiError::Store(_) => "Local storage is unavailable".to_string(),
    }
}
