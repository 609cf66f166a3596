use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

use crate::queue::QueuedAction;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub estado: Option<String>,
    #[serde(default, rename = "createdAt")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub service: Option<ServiceRef>,
    /// Fields this client does not interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceRef {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl Report {
    pub fn service_kind(&self) -> &str {
        self.service.as_ref().and_then(|service| service.kind.as_deref()).unwrap_or("-")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub rol: String,
    pub is_admin: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvidenceList {
    #[serde(default)]
    pub evidencias: Vec<String>,
}

/// Result of a mutating call that may have been deferred.
#[derive(Clone, Debug, PartialEq)]
pub enum Submission {
    Sent(JsonValue),
    /// The server was unreachable; the call waits in the sync queue.
    Queued(QueuedAction),
}

impl Submission {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(value) => Ok(value),
        JsonValue::Number(value) => Ok(value.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}
