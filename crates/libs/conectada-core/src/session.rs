use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::StoreError;
use crate::store::{get_json, set_json, LocalStore, AUTH_TOKEN_KEY, CURRENT_USER_KEY};

/// Opaque bearer token plus the user record returned at login.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionCredential {
    pub token: String,
    pub user: JsonValue,
}

/// Session credential persisted under `authToken` / `currentUser`.
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn LocalStore>,
}

impl Session {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    pub fn save(&self, credential: &SessionCredential) -> Result<(), StoreError> {
        self.store.set(AUTH_TOKEN_KEY, &credential.token)?;
        set_json(self.store.as_ref(), CURRENT_USER_KEY, &credential.user)
    }

    pub fn token(&self) -> Result<Option<String>, StoreError> {
        Ok(self.store.get(AUTH_TOKEN_KEY)?.filter(|token| !token.is_empty()))
    }

    pub fn current_user(&self) -> Result<Option<JsonValue>, StoreError> {
        get_json(self.store.as_ref(), CURRENT_USER_KEY)
    }

    /// Both halves must be present for a credential to exist.
    pub fn credential(&self) -> Result<Option<SessionCredential>, StoreError> {
        let (Some(token), Some(user)) = (self.token()?, self.current_user()?) else {
            return Ok(None);
        };
        Ok(Some(SessionCredential { token, user }))
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.token(), Ok(Some(_)))
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.remove(AUTH_TOKEN_KEY)?;
        self.store.remove(CURRENT_USER_KEY)
    }
}
