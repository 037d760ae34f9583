//! Single persistent HTTP session shared by the whole process: cookie jar,
//! proxy, connection-quality-scaled timeouts, and the shared retry loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cookie_store::CookieStore;
use reqwest::RequestBuilder;
use reqwest_cookie_store::CookieStoreMutex;

use crate::backoff::Backoff;
use crate::constants::MAX_BACKOFF;
use crate::error::MinerError;

/// Clamp a user-chosen connection quality into `[1, 6]`.
pub fn clamp_quality(quality: i32) -> u8 {
    quality.clamp(1, 6) as u8
}

/// Shared HTTP client: one `reqwest::Client` per process, backed by a cookie
/// jar persisted to disk between runs.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    cookie_store: Arc<CookieStoreMutex>,
    cookie_path: PathBuf,
    exit_requested: Arc<AtomicBool>,
    total_timeout: Duration,
}

impl HttpClient {
    /// Build a client scaled by `quality` (clamped to `[1,6]`):
    /// `connect = 5*q s`, `total = 10*q s`. Loads the cookie jar from
    /// `cookie_path`, tolerating a missing or corrupt file by starting empty.
    pub fn new(quality: i32, proxy_url: Option<&str>, cookie_path: impl AsRef<Path>) -> Self {
        let quality = clamp_quality(quality) as u64;
        let connect_timeout = Duration::from_secs(5 * quality);
        let total_timeout = Duration::from_secs(10 * quality);

        let cookie_store = load_cookie_store(cookie_path.as_ref());
        let cookie_store = Arc::new(CookieStoreMutex::new(cookie_store));

        let mut builder = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(total_timeout)
            .cookie_provider(cookie_store.clone());

        if let Some(url) = proxy_url {
            if let Ok(proxy) = reqwest::Proxy::all(url) {
                builder = builder.proxy(proxy);
            } else {
                tracing::warn!("invalid proxy url, ignoring: {}", crate::utils::mask_proxy_url(url));
            }
        }

        let client = builder.build().expect("failed to build HTTP client");

        Self {
            client,
            cookie_store,
            cookie_path: cookie_path.as_ref().to_path_buf(),
            exit_requested: Arc::new(AtomicBool::new(false)),
            total_timeout,
        }
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// Send a request, retrying transient failures with exponential backoff
    /// capped at 3 minutes, per the shared retry policy:
    /// * exit requested -> `ExitRequested`
    /// * `invalidate_after` crossed by the next attempt -> `RequestInvalid`
    /// * status < 500 -> success
    /// * TLS certificate failure -> surfaced immediately, no retry
    /// * connection/timeout/payload errors and status >= 500 -> retry
    pub async fn send_with_retry(
        &self,
        mut build: impl FnMut() -> RequestBuilder,
        invalidate_after: Option<DateTime<Utc>>,
    ) -> Result<reqwest::Response, MinerError> {
        let mut backoff = Backoff::standard(MAX_BACKOFF);
        let mut attempt: u32 = 0;

        loop {
            if self.exit_requested() {
                return Err(MinerError::ExitRequested);
            }
            if let Some(deadline) = invalidate_after {
                if Utc::now() + self.total_timeout >= deadline {
                    return Err(MinerError::RequestInvalid(deadline.to_rfc3339()));
                }
            }

            let result = build().send().await;
            match result {
                Ok(resp) if resp.status().as_u16() < 500 => return Ok(resp),
                Ok(resp) => {
                    attempt += 1;
                    let status = resp.status();
                    if attempt > 1 {
                        tracing::warn!("HTTP {} from {}, retrying", status, resp.url());
                    }
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(e) if is_tls_failure(&e) => {
                    return Err(MinerError::TlsFailure(e.to_string()));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > 1 {
                        tracing::warn!("transport error: {}, retrying", e);
                    }
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    /// Prune empty cookie entries and write the jar to disk. Call on
    /// shutdown.
    pub fn save_cookies(&self) -> Result<(), MinerError> {
        let mut store = self.cookie_store.lock().unwrap();
        prune_empty_entries(&mut store);
        let file = std::fs::File::create(&self.cookie_path)
            .map_err(|e| MinerError::Other(anyhow::anyhow!("opening cookie file: {e}")))?;
        let mut writer = std::io::BufWriter::new(file);
        store
            .save_json(&mut writer)
            .map_err(|e| MinerError::Other(anyhow::anyhow!("saving cookie jar: {e}")))?;
        Ok(())
    }

    /// Clear all cookies for a given host (used on a 401 from /validate).
    pub fn clear_cookies_for_host(&self, host: &str) {
        let mut store = self.cookie_store.lock().unwrap();
        let to_remove: Vec<(String, String, String)> = store
            .iter_any()
            .filter(|c| c.domain().is_some_and(|d| d.trim_start_matches('.') == host))
            .map(|c| {
                (
                    c.domain().unwrap_or_default().to_string(),
                    c.path().unwrap_or("/").to_string(),
                    c.name().to_string(),
                )
            })
            .collect();
        for (domain, path, name) in to_remove {
            store.remove(&domain, &path, &name);
        }
    }

    /// Clear the whole jar and delete the backing file (client-id mismatch
    /// recovery path).
    pub fn clear_all_cookies(&self) {
        let mut store = self.cookie_store.lock().unwrap();
        store.clear();
        let _ = std::fs::remove_file(&self.cookie_path);
    }

    pub fn cookie_value(&self, domain: &str, name: &str) -> Option<String> {
        let store = self.cookie_store.lock().unwrap();
        store
            .iter_unexpired()
            .find(|c| c.domain().is_some_and(|d| d.trim_start_matches('.') == domain) && c.name() == name)
            .map(|c| c.value().to_string())
    }
}

fn load_cookie_store(path: &Path) -> CookieStore {
    match std::fs::File::open(path) {
        Ok(f) => {
            let reader = std::io::BufReader::new(f);
            CookieStore::load_json(reader).unwrap_or_else(|e| {
                tracing::warn!("cookie jar at {:?} is corrupt, starting empty: {}", path, e);
                CookieStore::default()
            })
        }
        Err(_) => CookieStore::default(),
    }
}

fn prune_empty_entries(store: &mut CookieStore) {
    let empty_keys: Vec<(String, String, String)> = store
        .iter_any()
        .filter(|c| c.value().is_empty())
        .map(|c| {
            (
                c.domain().unwrap_or_default().to_string(),
                c.path().unwrap_or("/").to_string(),
                c.name().to_string(),
            )
        })
        .collect();
    for (domain, path, name) in empty_keys {
        store.remove(&domain, &path, &name);
    }
}

fn is_tls_failure(e: &reqwest::Error) -> bool {
    use std::error::Error as _;
    if !e.is_connect() && !e.is_request() {
        return false;
    }
    let mut cause = e.source();
    while let Some(err) = cause {
        let msg = err.to_string().to_lowercase();
        if msg.contains("certificate") || msg.contains("tls") || msg.contains("handshake") {
            return true;
        }
        cause = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_is_clamped() {
        assert_eq!(clamp_quality(0), 1);
        assert_eq!(clamp_quality(1), 1);
        assert_eq!(clamp_quality(6), 6);
        assert_eq!(clamp_quality(99), 6);
        assert_eq!(clamp_quality(-5), 1);
    }

    #[test]
    fn prune_removes_only_empty_values() {
        let mut store = CookieStore::default();
        let _ = store.parse("a=1; Domain=example.com; Path=/", &"https://example.com".parse().unwrap());
        let _ = store.parse("b=; Domain=example.com; Path=/", &"https://example.com".parse().unwrap());
        prune_empty_entries(&mut store);
        let remaining: Vec<_> = store.iter_any().map(|c| c.name().to_string()).collect();
        assert!(remaining.contains(&"a".to_string()));
        assert!(!remaining.contains(&"b".to_string()));
    }
}
