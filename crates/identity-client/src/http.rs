//! HTTP implementation of the identity service.
//!
//! Speaks the backend's REST surface: auth endpoints under `/auth/v1/` and
//! the per-user resources (`profiles`, `preferences`, `stats`) under
//! `/rest/v1/` filtered by `user_id=eq.<id>`. Auth state changes observed by
//! this client are pushed on a broadcast channel.

use crate::{
    AccountRecord, AuthEvent, IdentityError, IdentityResult, IdentityService, PreferencesRecord,
    ProfileRecord, ProfileUpdate, StatsRecord,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Caller-side timeout applied to every identity request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(12);

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Configuration for the HTTP identity client.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Backend project URL (e.g. `https://abc123.backend.example`)
    pub base_url: String,
    /// Publishable API key sent with every request
    pub api_key: String,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl IdentityConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Token grant response from the auth endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    user: WireAccount,
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

/// HTTP identity service.
///
/// Holds the bearer token for the current backend session in memory only;
/// the persisted session envelope is owned by the session cache and never
/// contains tokens.
pub struct HttpIdentityService {
    config: IdentityConfig,
    http_client: Client,
    access_token: Mutex<Option<String>>,
    events: broadcast::Sender<AuthEvent>,
}

impl HttpIdentityService {
    /// Create a new HTTP identity service.
    pub fn new(config: IdentityConfig) -> IdentityResult<Self> {
        let http_client = Client::builder().timeout(config.request_timeout).build()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            http_client,
            access_token: Mutex::new(None),
            events,
        })
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.config.base_url, path)
    }

    fn rest_url(&self, table: &str, user_id: &str) -> String {
        format!(
            "{}/rest/v1/{}?user_id=eq.{}",
            self.config.base_url, table, user_id
        )
    }

    fn bearer(&self) -> Option<String> {
        self.access_token.lock().unwrap().clone()
    }

    fn set_bearer(&self, token: Option<String>) {
        *self.access_token.lock().unwrap() = token;
    }

    fn emit(&self, event: AuthEvent) {
        // No receivers is fine; the send result only reports that.
        let _ = self.events.send(event);
    }

    fn map_send_error(e: reqwest::Error) -> IdentityError {
        if e.is_timeout() {
            IdentityError::Timeout
        } else {
            IdentityError::Http(e)
        }
    }

    async fn failure_body(response: Response) -> (StatusCode, String) {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        (status, body)
    }

    /// Fetch a single row from a per-user resource. Missing rows are `None`.
    async fn fetch_row<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        user_id: &str,
    ) -> IdentityResult<Option<T>> {
        let token = self
            .bearer()
            .ok_or_else(|| IdentityError::SessionInvalid("No active session".to_string()))?;
        let url = format!("{}&select=*&limit=1", self.rest_url(table, user_id));

        debug!(table, user_id, "Fetching resource row");

        let response = self
            .http_client
            .get(&url)
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if !response.status().is_success() {
            let (status, body) = Self::failure_body(response).await;
            warn!(table, status = %status, "Resource fetch failed");
            return Err(match status.as_u16() {
                401 | 403 => IdentityError::SessionInvalid(format!("HTTP {}: {}", status, body)),
                404 => IdentityError::NotFound(format!("{} for user {}", table, user_id)),
                s if (500..600).contains(&s) => {
                    IdentityError::Unavailable(format!("HTTP {}: {}", status, body))
                }
                _ => IdentityError::Protocol(format!("HTTP {}: {}", status, body)),
            });
        }

        let rows: Vec<T> = response.json().await.map_err(Self::map_send_error)?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn sign_in(&self, email: &str, password: &str) -> IdentityResult<AccountRecord> {
        let url = format!("{}?grant_type=password", self.auth_url("token"));

        debug!(email = %email, "Attempting email/password sign-in");

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.config.api_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "email": email,
                "password": password,
            }))
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if !response.status().is_success() {
            let (status, body) = Self::failure_body(response).await;
            warn!(status = %status, "Sign-in failed");
            return Err(match status.as_u16() {
                s if (500..600).contains(&s) => {
                    IdentityError::Unavailable(format!("HTTP {}: {}", status, body))
                }
                _ => IdentityError::InvalidCredentials(format!("HTTP {}: {}", status, body)),
            });
        }

        let data: TokenResponse = response.json().await.map_err(Self::map_send_error)?;
        self.set_bearer(Some(data.access_token));

        info!(user_id = %data.user.id, "Sign-in successful");
        self.emit(AuthEvent::SignedIn {
            user_id: data.user.id.clone(),
        });

        Ok(AccountRecord {
            id: data.user.id,
            email: data.user.email,
        })
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> IdentityResult<AccountRecord> {
        let url = self.auth_url("signup");

        debug!(email = %email, "Attempting sign-up");

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.config.api_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "email": email,
                "password": password,
                "data": { "display_name": display_name },
            }))
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if !response.status().is_success() {
            let (status, body) = Self::failure_body(response).await;
            warn!(status = %status, "Sign-up failed");
            return Err(match status.as_u16() {
                s if (500..600).contains(&s) => {
                    IdentityError::Unavailable(format!("HTTP {}: {}", status, body))
                }
                // Duplicate email and friends come back as 4xx validation errors.
                _ => IdentityError::Validation(format!("HTTP {}: {}", status, body)),
            });
        }

        let data: TokenResponse = response.json().await.map_err(Self::map_send_error)?;
        self.set_bearer(Some(data.access_token));

        info!(user_id = %data.user.id, "Sign-up successful");
        self.emit(AuthEvent::SignedIn {
            user_id: data.user.id.clone(),
        });

        Ok(AccountRecord {
            id: data.user.id,
            email: data.user.email,
        })
    }

    async fn sign_out(&self) -> IdentityResult<()> {
        let token = match self.bearer() {
            Some(token) => token,
            // Nothing to terminate.
            None => return Ok(()),
        };

        let response = self
            .http_client
            .post(self.auth_url("logout"))
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(Self::map_send_error);

        // The local session ends regardless of what the backend said.
        self.set_bearer(None);
        self.emit(AuthEvent::SignedOut);

        match response {
            Ok(r) if !r.status().is_success() => {
                let (status, body) = Self::failure_body(r).await;
                warn!(status = %status, body = %body, "Remote sign-out returned an error");
                Ok(())
            }
            Ok(_) => {
                info!("Signed out");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_session(&self) -> IdentityResult<Option<AccountRecord>> {
        let token = match self.bearer() {
            Some(token) => token,
            None => return Ok(None),
        };

        let response = self
            .http_client
            .get(self.auth_url("user"))
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if response.status() == StatusCode::UNAUTHORIZED
            || response.status() == StatusCode::FORBIDDEN
        {
            debug!("Backend no longer recognizes the session");
            return Ok(None);
        }

        if !response.status().is_success() {
            let (status, body) = Self::failure_body(response).await;
            return Err(IdentityError::Unavailable(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let account: WireAccount = response.json().await.map_err(Self::map_send_error)?;
        Ok(Some(AccountRecord {
            id: account.id,
            email: account.email,
        }))
    }

    async fn get_profile(&self, user_id: &str) -> IdentityResult<Option<ProfileRecord>> {
        self.fetch_row("profiles", user_id).await
    }

    async fn update_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> IdentityResult<ProfileRecord> {
        let token = self
            .bearer()
            .ok_or_else(|| IdentityError::SessionInvalid("No active session".to_string()))?;

        debug!(user_id, "Updating profile");

        let response = self
            .http_client
            .patch(self.rest_url("profiles", user_id))
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", token))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(update)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if !response.status().is_success() {
            let (status, body) = Self::failure_body(response).await;
            warn!(status = %status, "Profile update failed");
            return Err(match status.as_u16() {
                401 | 403 => IdentityError::SessionInvalid(format!("HTTP {}: {}", status, body)),
                404 => IdentityError::NotFound(format!("profile for user {}", user_id)),
                s if (500..600).contains(&s) => {
                    IdentityError::Unavailable(format!("HTTP {}: {}", status, body))
                }
                _ => IdentityError::Validation(format!("HTTP {}: {}", status, body)),
            });
        }

        let rows: Vec<ProfileRecord> = response.json().await.map_err(Self::map_send_error)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| IdentityError::NotFound(format!("profile for user {}", user_id)))
    }

    async fn get_preferences(&self, user_id: &str) -> IdentityResult<Option<PreferencesRecord>> {
        self.fetch_row("preferences", user_id).await
    }

    async fn get_stats(&self, user_id: &str) -> IdentityResult<Option<StatsRecord>> {
        self.fetch_row("stats", user_id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}
