use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;

use crate::db_client::{Collections, DocumentStore};
use crate::document::{FieldValue, Fields, Write};

/// Outcome of [`PushTokenRegistrar::on_user_login`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFlush {
    /// A pending token was saved in the remote store.
    Flushed,
    /// The save failed; the token stays pending for the next login.
    SaveFailed,
    /// Nothing was pending; the platform should register again.
    NoPendingToken,
}

#[derive(Debug, Default)]
struct RegistrarState {
    pending_token: Option<String>,
    user_email: Option<String>,
}

/// Saves push registration tokens under the signed-in user's email.
///
/// A token that arrives before sign-in is held in memory and written once a
/// user logs in. Save failures are logged and the token stays pending.
pub struct PushTokenRegistrar<D: DocumentStore> {
    db: Arc<D>,
    collections: Collections,
    state: Mutex<RegistrarState>,
}

impl<D: DocumentStore> std::fmt::Debug for PushTokenRegistrar<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PushTokenRegistrar")
            .field("pending", &state.pending_token.is_some())
            .field("user_email", &state.user_email)
            .finish()
    }
}

impl<D: DocumentStore> PushTokenRegistrar<D> {
    pub fn new(db: Arc<D>, collections: Collections) -> Self {
        Self {
            db,
            collections,
            state: Mutex::new(RegistrarState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistrarState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending_token(&self) -> Option<String> {
        self.lock().pending_token.clone()
    }

    pub fn user_email(&self) -> Option<String> {
        self.lock().user_email.clone()
    }

    pub async fn on_registration(&self, token: &str) {
        let user = {
            let mut state = self.lock();
            state.pending_token = Some(token.to_string());
            state.user_email.clone()
        };
        match user {
            Some(email) => {
                self.flush(&email, token).await;
            }
            None => tracing::info!("Push token received before sign-in, holding it"),
        }
    }

    pub async fn on_user_login(&self, email: &str) -> TokenFlush {
        let pending = {
            let mut state = self.lock();
            state.user_email = Some(email.to_string());
            state.pending_token.clone()
        };
        match pending {
            Some(token) if self.flush(email, &token).await => TokenFlush::Flushed,
            Some(_) => TokenFlush::SaveFailed,
            None => TokenFlush::NoPendingToken,
        }
    }

    pub fn on_user_logout(&self) {
        self.lock().user_email = None;
    }

    /// Returns whether the token was saved.
    async fn flush(&self, email: &str, token: &str) -> bool {
        match self.save_token(email, token).await {
            Ok(()) => {
                let mut state = self.lock();
                if state.pending_token.as_deref() == Some(token) {
                    state.pending_token = None;
                }
                tracing::info!("Push token saved for {}", email);
                true
            }
            Err(e) => {
                tracing::error!("Failed to save push token for {}: {:#}", email, e);
                false
            }
        }
    }

    async fn save_token(&self, email: &str, token: &str) -> Result<()> {
        let mut fields = Fields::new();
        fields.insert("fcmToken".to_string(), token.into());
        fields.insert("updatedAt".to_string(), FieldValue::ServerTimestamp);
        self.db
            .commit(vec![Write::Set {
                path: format!("{}/{}", self.collections.push_tokens, email),
                fields,
                merge: true,
            }])
            .await
    }
}
