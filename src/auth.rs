//! Authentication state machine: session id / device id / access token
//! lifecycle, OAuth device-code flow, and token validation.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::{Mutex, Notify};

use crate::constants::{ClientInfo, CLIENT_ANDROID_APP, OAUTH_DEVICE_URL, OAUTH_TOKEN_URL, OAUTH_VALIDATE_URL};
use crate::error::MinerError;
use crate::http::HttpClient;

/// The fields the rest of the system needs once authentication succeeds.
/// Populated incrementally by [`Auth::validate`]; `user_id`/`access_token`
/// are empty until validation completes.
#[derive(Debug, Clone, Default)]
pub struct AuthFields {
    pub user_id: u64,
    pub login: String,
    pub device_id: String,
    pub session_id: String,
    pub access_token: String,
    pub client_version: Option<String>,
}

impl AuthFields {
    pub fn is_populated(&self) -> bool {
        self.user_id != 0 && !self.access_token.is_empty()
    }
}

/// Callback invoked with the device-code and verification URL so a caller
/// (the CLI, a test harness) can present it to the user. The actual
/// presentation surface is out of scope for this core.
pub type DeviceCodeCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Authentication state machine. `validate()` is serialized by an internal
/// mutex so concurrent callers (e.g. a 401 retry racing a scheduled refresh)
/// never run the device-code flow twice.
pub struct Auth {
    http: HttpClient,
    client_info: ClientInfo,
    fields: Mutex<AuthFields>,
    logged_in: Notify,
    logged_in_flag: std::sync::atomic::AtomicBool,
}

impl Auth {
    pub fn new(http: HttpClient) -> Self {
        Self::with_client_info(http, CLIENT_ANDROID_APP)
    }

    pub fn with_client_info(http: HttpClient, client_info: ClientInfo) -> Self {
        Self {
            http,
            client_info,
            fields: Mutex::new(AuthFields::default()),
            logged_in: Notify::new(),
            logged_in_flag: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Seed fields from a previous run (e.g. loaded from disk) before
    /// calling `validate`; any already-populated field is left alone by
    /// `validate`'s idempotent steps.
    pub async fn seed(&self, fields: AuthFields) {
        *self.fields.lock().await = fields;
    }

    pub async fn snapshot(&self) -> AuthFields {
        self.fields.lock().await.clone()
    }

    /// A one-shot gate dependents can await: resolves once `validate` has
    /// succeeded at least once.
    pub async fn wait_logged_in(&self) {
        if self.logged_in_flag.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        self.logged_in.notified().await;
    }

    /// Run the five-step validation described in the spec. Idempotent:
    /// already-populated fields are left untouched so repeated calls (e.g.
    /// from a 401 retry) only do the work that's still missing.
    pub async fn validate(&self, on_device_code: DeviceCodeCallback) -> Result<(), MinerError> {
        for _outer in 0..2 {
            let mut fields = self.fields.lock().await;

            if fields.session_id.is_empty() {
                fields.session_id = generate_session_id();
            }

            if fields.device_id.is_empty() {
                drop(fields);
                let device_id = self.fetch_device_id().await?;
                fields = self.fields.lock().await;
                fields.device_id = device_id;
            }

            if fields.access_token.is_empty() {
                if let Some(cookie_token) = self.http.cookie_value(self.client_info.host(), "auth-token") {
                    fields.access_token = cookie_token;
                } else {
                    let device_id = fields.device_id.clone();
                    drop(fields);
                    let token = self.run_device_code_flow(&device_id, on_device_code.clone()).await?;
                    fields = self.fields.lock().await;
                    fields.access_token = token;
                }
            }

            let access_token = fields.access_token.clone();
            let device_id = fields.device_id.clone();
            drop(fields);

            match self.introspect(&access_token, &device_id).await {
                Ok((user_id, login)) => {
                    let mut fields = self.fields.lock().await;
                    fields.user_id = user_id;
                    fields.login = login;
                    drop(fields);
                    self.http.save_cookies()?;
                    self.logged_in_flag.store(true, std::sync::atomic::Ordering::SeqCst);
                    self.logged_in.notify_waiters();
                    return Ok(());
                }
                Err(IntrospectError::Unauthorized) => {
                    self.http.clear_cookies_for_host(self.client_info.host());
                    let mut fields = self.fields.lock().await;
                    fields.access_token.clear();
                    continue;
                }
                Err(IntrospectError::ClientMismatch) => {
                    self.http.clear_all_cookies();
                    let mut fields = self.fields.lock().await;
                    *fields = AuthFields::default();
                    continue;
                }
                Err(IntrospectError::Other(e)) => return Err(e),
            }
        }
        Err(MinerError::Other(anyhow::anyhow!(
            "authentication failed after retrying client-id mismatch / unauthorized recovery"
        )))
    }

    async fn fetch_device_id(&self) -> Result<String, MinerError> {
        let resp = self
            .http
            .send_with_retry(
                || {
                    self.http
                        .inner()
                        .get(self.client_info.client_url)
                        .header("User-Agent", self.client_info.user_agent)
                        .header("Accept", "text/html")
                },
                None,
            )
            .await?;

        if let Some(id) = self.http.cookie_value(self.client_info.host(), "unique_id") {
            return Ok(id);
        }
        // Some proxies strip cookies from the jar before we read it back;
        // fall back to scanning the raw Set-Cookie headers.
        for (name, value) in resp.headers().iter() {
            if name.as_str().eq_ignore_ascii_case("set-cookie") {
                if let Ok(s) = value.to_str() {
                    if let Some(rest) = s.strip_prefix("unique_id=") {
                        let end = rest.find(';').unwrap_or(rest.len());
                        return Ok(rest[..end].to_string());
                    }
                }
            }
        }
        Err(MinerError::Other(anyhow::anyhow!(
            "server did not set the unique_id cookie"
        )))
    }

    async fn run_device_code_flow(
        &self,
        device_id: &str,
        on_device_code: DeviceCodeCallback,
    ) -> Result<String, MinerError> {
        loop {
            let device = self.request_device_code(device_id).await?;
            on_device_code(&device.user_code, &device.verification_uri);

            let invalidate_after = Utc::now() + ChronoDuration::seconds(device.expires_in as i64);
            match self
                .poll_for_token(device_id, &device.device_code, device.interval, invalidate_after)
                .await
            {
                Ok(token) => return Ok(token),
                Err(MinerError::RequestInvalid(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn request_device_code(&self, device_id: &str) -> Result<DeviceCodeResponse, MinerError> {
        let resp = self
            .http
            .send_with_retry(
                || {
                    self.http
                        .inner()
                        .post(OAUTH_DEVICE_URL)
                        .header("Client-Id", self.client_info.client_id)
                        .header("X-Device-Id", device_id)
                        .header("User-Agent", self.client_info.user_agent)
                        .form(&[("client_id", self.client_info.client_id), ("scopes", "")])
                },
                None,
            )
            .await?;
        resp.json()
            .await
            .map_err(|e| MinerError::Other(anyhow::anyhow!("parsing device code response: {e}")))
    }

    async fn poll_for_token(
        &self,
        device_id: &str,
        device_code: &str,
        interval_secs: u64,
        invalidate_after: chrono::DateTime<Utc>,
    ) -> Result<String, MinerError> {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
            if Utc::now() >= invalidate_after {
                return Err(MinerError::RequestInvalid(invalidate_after.to_rfc3339()));
            }

            let resp = self
                .http
                .send_with_retry(
                    || {
                        self.http
                            .inner()
                            .post(OAUTH_TOKEN_URL)
                            .header("Client-Id", self.client_info.client_id)
                            .header("X-Device-Id", device_id)
                            .header("User-Agent", self.client_info.user_agent)
                            .form(&[
                                ("client_id", self.client_info.client_id),
                                ("device_code", device_code),
                                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                            ])
                    },
                    Some(invalidate_after),
                )
                .await?;

            if resp.status().is_success() {
                let token: TokenResponse = resp
                    .json()
                    .await
                    .map_err(|e| MinerError::Other(anyhow::anyhow!("parsing token response: {e}")))?;
                return Ok(token.access_token);
            }
            if resp.status().as_u16() == 400 {
                continue;
            }
            return Err(MinerError::Other(anyhow::anyhow!(
                "device token request failed: {}",
                resp.status()
            )));
        }
    }

    async fn introspect(&self, access_token: &str, device_id: &str) -> Result<(u64, String), IntrospectError> {
        let resp = self
            .http
            .send_with_retry(
                || {
                    self.http
                        .inner()
                        .get(OAUTH_VALIDATE_URL)
                        .header("Authorization", format!("OAuth {access_token}"))
                        .header("Client-Id", self.client_info.client_id)
                        .header("X-Device-Id", device_id)
                },
                None,
            )
            .await
            .map_err(|e| IntrospectError::Other(e.into()))?;

        match resp.status().as_u16() {
            200 => {
                let body: ValidateResponse = resp
                    .json()
                    .await
                    .map_err(|e| IntrospectError::Other(MinerError::Other(anyhow::anyhow!("{e}"))))?;
                if body.client_id != self.client_info.client_id {
                    return Err(IntrospectError::ClientMismatch);
                }
                let user_id: u64 = body
                    .user_id
                    .parse()
                    .map_err(|_| IntrospectError::Other(MinerError::Other(anyhow::anyhow!("bad user_id"))))?;
                Ok((user_id, body.login))
            }
            401 => Err(IntrospectError::Unauthorized),
            other => Err(IntrospectError::Other(MinerError::Other(anyhow::anyhow!(
                "token validation failed: {other}"
            )))),
        }
    }

    /// Common GQL-path headers per the spec's header builder.
    pub async fn gql_headers(&self) -> Vec<(&'static str, String)> {
        let f = self.fields.lock().await;
        vec![
            ("Accept", "*/*".to_string()),
            ("Client-Id", self.client_info.client_id.to_string()),
            ("X-Device-Id", f.device_id.clone()),
            ("Client-Session-Id", f.session_id.clone()),
            ("Origin", self.client_info.client_url.to_string()),
            ("Referer", self.client_info.client_url.to_string()),
            ("Authorization", format!("OAuth {}", f.access_token)),
        ]
    }
}

enum IntrospectError {
    Unauthorized,
    ClientMismatch,
    Other(MinerError),
}

impl From<MinerError> for IntrospectError {
    fn from(e: MinerError) -> Self {
        IntrospectError::Other(e)
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    interval: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    user_id: String,
    login: String,
    client_id: String,
}

fn generate_session_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..16).map(|_| HEX[rng.gen_range(0..16)] as char).collect()
}

impl ClientInfo {
    /// Host portion of `client_url`, used to key cookie-jar lookups.
    pub fn host(&self) -> &'static str {
        self.client_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_16_lowercase_hex_chars() {
        let id = generate_session_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn session_ids_are_not_constant() {
        assert_ne!(generate_session_id(), generate_session_id());
    }

    #[test]
    fn auth_fields_populated_requires_both_fields() {
        let mut f = AuthFields::default();
        assert!(!f.is_populated());
        f.user_id = 42;
        assert!(!f.is_populated());
        f.access_token = "tok".into();
        assert!(f.is_populated());
    }
}
