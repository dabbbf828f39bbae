//! Email/password sign-in against the Firebase identity REST API.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::db_client::{DatabaseConfig, FirestoreDbClient};

pub const DEFAULT_IDENTITY_URL: &str = "https://identitytoolkit.googleapis.com/v1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("User not found, check the email address")]
    UserNotFound,
    #[error("Wrong password")]
    WrongPassword,
    #[error("Invalid email format")]
    InvalidEmail,
    #[error("This account has been disabled")]
    UserDisabled,
    #[error("Too many sign-in attempts, try again later")]
    TooManyAttempts,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Sign-in failed: {0}")]
    Other(String),
}

impl AuthError {
    /// Maps an identity API error message such as `EMAIL_NOT_FOUND` or
    /// `TOO_MANY_ATTEMPTS_TRY_LATER : Access disabled` to a variant.
    pub fn from_code(message: &str) -> Self {
        let code = message
            .split(|c: char| c == ':' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        match code {
            "EMAIL_NOT_FOUND" => AuthError::UserNotFound,
            "INVALID_PASSWORD" | "INVALID_LOGIN_CREDENTIALS" => AuthError::WrongPassword,
            "INVALID_EMAIL" => AuthError::InvalidEmail,
            "USER_DISABLED" => AuthError::UserDisabled,
            "TOO_MANY_ATTEMPTS_TRY_LATER" => AuthError::TooManyAttempts,
            "" => AuthError::Other("unknown error".to_string()),
            _ => AuthError::Other(message.to_string()),
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Network(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub identity_url: String,
    pub api_key: String,
}

impl AuthConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            identity_url: DEFAULT_IDENTITY_URL.to_string(),
            api_key: api_key.into(),
        }
    }

    /// Reuses the database API key; `SIGNALEMENT_IDENTITY_URL` overrides the endpoint.
    pub fn from_db_config(db: &DatabaseConfig) -> Result<Self> {
        dotenv::dotenv().ok();
        let identity_url = match std::env::var("SIGNALEMENT_IDENTITY_URL") {
            Ok(raw) => {
                url::Url::parse(&raw)?;
                raw.trim_end_matches('/').to_string()
            }
            Err(_) => DEFAULT_IDENTITY_URL.to_string(),
        };
        Ok(Self {
            identity_url,
            api_key: db.api_key.clone(),
        })
    }
}

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub uid: String,
    pub email: String,
    pub id_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    id_token: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

pub struct AuthClient {
    config: AuthConfig,
    http: reqwest::Client,
    db: Option<FirestoreDbClient>,
    state: watch::Sender<Option<AuthUser>>,
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("identity_url", &self.config.identity_url)
            .field("signed_in", &self.state.borrow().is_some())
            .finish()
    }
}

impl AuthClient {
    pub fn new(config: AuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        let (state, _) = watch::channel(None);
        Ok(Self {
            config,
            http,
            db: None,
            state,
        })
    }

    /// Installs the id token on `db` after each sign-in.
    pub fn with_db_client(mut self, db: FirestoreDbClient) -> Self {
        self.db = Some(db);
        self
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        self.state.borrow().clone()
    }

    /// Receives the signed-in user, or `None` after sign-out.
    pub fn subscribe(&self) -> watch::Receiver<Option<AuthUser>> {
        self.state.subscribe()
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser, AuthError> {
        let url = format!(
            "{}/accounts:signInWithPassword?key={}",
            self.config.identity_url, self.config.api_key
        );
        let response = self
            .http
            .post(&url)
            .json(&SignInRequest {
                email,
                password,
                return_secure_token: true,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await?;
            let error = match serde_json::from_str::<ErrorEnvelope>(&body) {
                Ok(envelope) => AuthError::from_code(&envelope.error.message),
                Err(_) => AuthError::Other(format!("HTTP {}", status.as_u16())),
            };
            tracing::warn!("Sign-in failed for {}: {}", email, error);
            return Err(error);
        }

        let body: SignInResponse = response.json().await?;
        let user = AuthUser {
            uid: body.local_id,
            email: body.email.unwrap_or_else(|| email.to_string()),
            id_token: body.id_token,
        };
        if let Some(db) = &self.db {
            db.set_id_token(Some(user.id_token.clone()));
        }
        self.state.send_replace(Some(user.clone()));
        tracing::info!("Signed in as {}", user.email);
        Ok(user)
    }

    pub fn sign_out(&self) {
        if let Some(db) = &self.db {
            db.set_id_token(None);
        }
        if self.state.send_replace(None).is_some() {
            tracing::info!("Signed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_map_to_variants() {
        assert_eq!(AuthError::from_code("EMAIL_NOT_FOUND"), AuthError::UserNotFound);
        assert_eq!(AuthError::from_code("INVALID_PASSWORD"), AuthError::WrongPassword);
        assert_eq!(AuthError::from_code("INVALID_EMAIL"), AuthError::InvalidEmail);
        assert_eq!(AuthError::from_code("USER_DISABLED"), AuthError::UserDisabled);
        assert_eq!(
            AuthError::from_code(
                "TOO_MANY_ATTEMPTS_TRY_LATER : Access to this account has been temporarily disabled"
            ),
            AuthError::TooManyAttempts
        );
        assert_eq!(
            AuthError::from_code("OPERATION_NOT_ALLOWED"),
            AuthError::Other("OPERATION_NOT_ALLOWED".to_string())
        );
        assert_eq!(
            AuthError::from_code(""),
            AuthError::Other("unknown error".to_string())
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        let config = AuthConfig {
            identity_url: "http://127.0.0.1:9".to_string(),
            api_key: "key".to_string(),
        };
        let client = AuthClient::new(config).unwrap();
        let result = client.sign_in("a@b.mg", "secret").await;
        assert!(matches!(result, Err(AuthError::Network(_))));
        assert_eq!(client.current_user(), None);
    }

    #[test]
    fn test_sign_out_publishes_none() {
        let client = AuthClient::new(AuthConfig::new("key")).unwrap();
        let mut state = client.subscribe();
        client.state.send_replace(Some(AuthUser {
            uid: "u1".to_string(),
            email: "a@b.mg".to_string(),
            id_token: "t".to_string(),
        }));
        assert!(state.borrow_and_update().is_some());

        client.sign_out();
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow(), None);
    }
}
