//! Persisted-query GraphQL client: rate-limited, retried per the error-class
//! matrix, with a pure `merge_data` helper for combining inventory- and
//! campaigns-sourced data for the same campaign id.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::auth::Auth;
use crate::backoff::Backoff;
use crate::constants::{gql_operations, ClientInfo, GqlOperation, CLIENT_ANDROID_APP, GQL_MAX_BACKOFF, GQL_URL};
use crate::error::MinerError;
use crate::http::HttpClient;
use crate::models::gql::GqlRequest;
use crate::ratelimit::RateLimiter;

#[derive(Clone)]
pub struct GqlClient {
    http: HttpClient,
    auth: Arc<Auth>,
    limiter: RateLimiter,
    client_info: ClientInfo,
}

impl GqlClient {
    pub fn new(http: HttpClient, auth: Arc<Auth>) -> Self {
        Self {
            http,
            auth,
            limiter: RateLimiter::gql_default(),
            client_info: CLIENT_ANDROID_APP,
        }
    }

    /// Run a single persisted-query operation, returning its `data` payload.
    pub async fn query(&self, operation: &GqlOperation, variables: Option<Value>) -> Result<Value, MinerError> {
        let request = GqlRequest::new(operation, variables);
        let body = self.execute(vec![request]).await?;
        let mut responses = as_response_array(body);
        let resp = responses
            .pop()
            .ok_or_else(|| MinerError::GqlFatal("empty GQL response".into()))?;
        extract_data(resp)
    }

    /// Run several persisted-query operations in one request, returning
    /// each one's `data` payload in the same order.
    pub async fn query_batch(
        &self,
        operations: Vec<(&GqlOperation, Option<Value>)>,
    ) -> Result<Vec<Value>, MinerError> {
        let requests = operations
            .into_iter()
            .map(|(op, vars)| GqlRequest::new(op, vars))
            .collect();
        let body = self.execute(requests).await?;
        as_response_array(body).into_iter().map(extract_data).collect()
    }

    /// POST the request(s), applying the error-class retry matrix to every
    /// sub-response until the batch either succeeds, is salvaged by nulling
    /// a `server error` path, or fails fatally.
    async fn execute(&self, requests: Vec<GqlRequest>) -> Result<Value, MinerError> {
        let body = if requests.len() == 1 {
            serde_json::to_value(&requests[0]).unwrap()
        } else {
            serde_json::to_value(&requests).unwrap()
        };

        let mut backoff = Backoff::gql(GQL_MAX_BACKOFF);
        let mut single_retry_used = false;
        let headers = self.auth.gql_headers().await;

        for _attempt in 0..16 {
            let _permit = self.limiter.acquire().await;

            let mut req = self.http.inner().post(GQL_URL);
            for (k, v) in &headers {
                req = req.header(*k, v);
            }
            req = req
                .header("Client-Id", self.client_info.client_id)
                .header("User-Agent", self.client_info.user_agent)
                .header("Content-Type", "application/json")
                .json(&body);

            let resp = req
                .send()
                .await
                .map_err(|e| MinerError::TransportTransient(e.to_string()))?;

            if !resp.status().is_success() {
                return Err(MinerError::GqlFatal(format!("HTTP {}", resp.status())));
            }

            let mut parsed: Value = resp
                .json()
                .await
                .map_err(|e| MinerError::Other(anyhow::anyhow!("parsing GQL response: {e}")))?;

            match classify(&parsed) {
                Classification::Ok => return Ok(parsed),
                Classification::ServerPath(paths) => {
                    null_out_paths(&mut parsed, &paths);
                    return Ok(parsed);
                }
                Classification::RetryOnceBumped => {
                    if single_retry_used {
                        return Err(MinerError::GqlFatal(
                            "service error / PersistedQueryNotFound persisted after single retry".into(),
                        ));
                    }
                    single_retry_used = true;
                    let delay = backoff.next_delay().max(Duration::from_secs(5));
                    tokio::time::sleep(delay).await;
                }
                Classification::RetryTransient => {
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Classification::Fatal(msg) => return Err(MinerError::GqlFatal(msg)),
            }
        }

        Err(MinerError::GqlTransient("exhausted retries".into()))
    }
}

enum Classification {
    Ok,
    /// `server error` with a `path`, one path list per sub-response (in
    /// request order); the caller nulls each sub-response's own paths out.
    ServerPath(Vec<Vec<Vec<String>>>),
    RetryOnceBumped,
    RetryTransient,
    Fatal(String),
}

fn classify(body: &Value) -> Classification {
    if let Some(msg) = body.get("message").and_then(Value::as_str) {
        if body.get("error").is_some() {
            return Classification::Fatal(format!("top-level error: {msg}"));
        }
    }

    let responses: Vec<&Value> = match body {
        Value::Array(arr) => arr.iter().collect(),
        other => vec![other],
    };

    let mut server_paths: Vec<Vec<Vec<String>>> = vec![Vec::new(); responses.len()];
    for (i, resp) in responses.iter().enumerate() {
        let Some(errors) = resp.get("errors").and_then(Value::as_array) else {
            continue;
        };
        for err in errors {
            let message = err.get("message").and_then(Value::as_str).unwrap_or("");
            match message {
                "service error" | "PersistedQueryNotFound" => return Classification::RetryOnceBumped,
                "service timeout" | "service unavailable" | "context deadline exceeded" => {
                    return Classification::RetryTransient;
                }
                "server error" if err.get("path").is_some() => {
                    if let Some(path) = err.get("path").and_then(Value::as_array) {
                        let segments = path
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect();
                        server_paths[i].push(segments);
                    }
                }
                other => return Classification::Fatal(format!("GQL error: {other}")),
            }
        }
    }

    if server_paths.iter().any(|p| !p.is_empty()) {
        return Classification::ServerPath(server_paths);
    }
    Classification::Ok
}

fn null_out_paths(body: &mut Value, paths_per_response: &[Vec<Vec<String>>]) {
    let targets: Vec<&mut Value> = match body {
        Value::Array(arr) => arr.iter_mut().collect(),
        other => vec![other],
    };
    for (target, paths) in targets.into_iter().zip(paths_per_response) {
        for p in paths {
            set_null_at_path(target, p);
        }
    }
}

fn set_null_at_path(root: &mut Value, path: &[String]) {
    let Some(data) = root.get_mut("data") else { return };
    let mut cursor = data;
    for (i, segment) in path.iter().enumerate() {
        if i + 1 == path.len() {
            if let Some(obj) = cursor.as_object_mut() {
                obj.insert(segment.clone(), Value::Null);
            }
            return;
        }
        cursor = match cursor.get_mut(segment.as_str()) {
            Some(v) => v,
            None => return,
        };
    }
}

fn as_response_array(body: Value) -> Vec<Value> {
    match body {
        Value::Array(arr) => arr,
        other => vec![other],
    }
}

fn extract_data(resp: Value) -> Result<Value, MinerError> {
    resp.get("data")
        .cloned()
        .ok_or_else(|| MinerError::GqlFatal("response missing data".into()))
}

/// Recursively merge two JSON object trees, preferring `primary`'s values
/// and requiring matching JSON types at corresponding keys.
pub fn merge_data(primary: &Value, secondary: &Value) -> Result<Value, MinerError> {
    match (primary, secondary) {
        (Value::Object(p), Value::Object(s)) => {
            let mut merged = p.clone();
            for (k, sv) in s {
                match merged.get(k) {
                    Some(pv) => {
                        if same_variant(pv, sv) {
                            if pv.is_object() {
                                let sub = merge_data(pv, sv)?;
                                merged.insert(k.clone(), sub);
                            }
                            // else: primary's scalar/array value wins as-is
                        } else if !(pv.is_null() || sv.is_null()) {
                            return Err(MinerError::Other(anyhow::anyhow!(
                                "merge_data: type mismatch at key {k}"
                            )));
                        }
                    }
                    None => {
                        merged.insert(k.clone(), sv.clone());
                    }
                }
            }
            Ok(Value::Object(merged))
        }
        (a, b) if same_variant(a, b) => Ok(a.clone()),
        (a, b) if a.is_null() || b.is_null() => Ok(if a.is_null() { b.clone() } else { a.clone() }),
        _ => Err(MinerError::Other(anyhow::anyhow!("merge_data: top-level type mismatch"))),
    }
}

fn same_variant(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Null, Value::Null)
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_))
    )
}

// convenience query-variable builders for the operations named in the spec

pub fn inventory_variables() -> Value {
    serde_json::json!({"fetchRewardCampaigns": false})
}

pub fn campaigns_variables() -> Value {
    serde_json::json!({"fetchRewardCampaigns": false})
}

pub fn campaign_details_variables(user_id: u64, drop_id: &str) -> Value {
    serde_json::json!({"channelLogin": user_id.to_string(), "dropID": drop_id})
}

pub fn current_drop_variables(channel_id: &str) -> Value {
    serde_json::json!({"channelID": channel_id, "channelLogin": ""})
}

pub fn game_directory_variables(slug: &str, limit: u32) -> Value {
    serde_json::json!({
        "limit": limit,
        "slug": slug,
        "imageWidth": 50,
        "includeCostreaming": false,
        "options": {
            "includeRestricted": ["SUB_ONLY_LIVE"],
            "sort": "RELEVANCE",
            "systemFilters": ["DROPS_ENABLED"],
        },
        "sortTypeIsRecency": false,
    })
}

pub fn claim_drop_variables(drop_instance_id: &str) -> Value {
    serde_json::json!({"input": {"dropInstanceID": drop_instance_id}})
}

pub fn notifications_delete_variables(notification_id: &str) -> Value {
    serde_json::json!({"input": {"id": notification_id}})
}

/// Helper used by [`crate::services::inventory`] to batch `CampaignDetails`
/// lookups.
pub fn campaign_details_batch<'a>(
    user_id: u64,
    drop_ids: impl Iterator<Item = &'a str>,
) -> Vec<(&'static GqlOperation, Option<Value>)> {
    drop_ids
        .map(|id| (&gql_operations::CAMPAIGN_DETAILS, Some(campaign_details_variables(user_id, id))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_data_is_idempotent() {
        let a = json!({"a": 1, "b": {"c": 2}});
        assert_eq!(merge_data(&a, &a).unwrap(), a);
    }

    #[test]
    fn merge_data_preserves_primary_values_and_adds_secondary_keys() {
        let primary = json!({"a": 1, "b": {"c": 2}});
        let secondary = json!({"a": 99, "b": {"d": 3}, "e": 4});
        let merged = merge_data(&primary, &secondary).unwrap();
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"]["c"], 2);
        assert_eq!(merged["b"]["d"], 3);
        assert_eq!(merged["e"], 4);
    }

    #[test]
    fn merge_data_fails_on_type_mismatch() {
        let primary = json!({"a": 1});
        let secondary = json!({"a": "not a number"});
        assert!(merge_data(&primary, &secondary).is_err());
    }

    #[test]
    fn classify_detects_service_error_for_single_retry() {
        let body = json!({"data": null, "errors": [{"message": "service error"}]});
        assert!(matches!(classify(&body), Classification::RetryOnceBumped));
    }

    #[test]
    fn classify_detects_persisted_query_not_found() {
        let body = json!({"data": null, "errors": [{"message": "PersistedQueryNotFound"}]});
        assert!(matches!(classify(&body), Classification::RetryOnceBumped));
    }

    #[test]
    fn classify_detects_service_timeout_as_transient() {
        let body = json!({"data": null, "errors": [{"message": "service timeout"}]});
        assert!(matches!(classify(&body), Classification::RetryTransient));
    }

    #[test]
    fn classify_nulls_server_error_path() {
        let body = json!({
            "data": {"user": {"campaign": {"id": "x"}}},
            "errors": [{"message": "server error", "path": ["user", "campaign"]}]
        });
        match classify(&body) {
            Classification::ServerPath(paths) => {
                assert_eq!(paths, vec![vec![vec!["user".to_string(), "campaign".to_string()]]]);
            }
            _ => panic!("expected ServerPath"),
        }
    }

    #[test]
    fn classify_server_path_keeps_paths_scoped_to_their_own_response() {
        let body = json!([
            {"data": {"a": 1}, "errors": [{"message": "server error", "path": ["a"]}]},
            {"data": {"b": 2}}
        ]);
        match classify(&body) {
            Classification::ServerPath(paths) => {
                assert_eq!(paths, vec![vec![vec!["a".to_string()]], vec![]]);
            }
            _ => panic!("expected ServerPath"),
        }
    }

    #[test]
    fn null_out_paths_only_affects_the_response_that_produced_the_path() {
        let mut body = json!([
            {"data": {"a": 1}},
            {"data": {"b": 2}}
        ]);
        null_out_paths(&mut body, &[vec![vec!["a".to_string()]], vec![]]);
        assert!(body[0]["data"]["a"].is_null());
        assert_eq!(body[1]["data"]["b"], 2);
    }

    #[test]
    fn classify_fatal_on_other_errors() {
        let body = json!({"data": null, "errors": [{"message": "not authorized"}]});
        assert!(matches!(classify(&body), Classification::Fatal(_)));
    }

    #[test]
    fn classify_ok_with_no_errors() {
        let body = json!({"data": {"ok": true}});
        assert!(matches!(classify(&body), Classification::Ok));
    }

    #[test]
    fn set_null_at_path_nulls_the_target() {
        let mut body = json!({"data": {"user": {"campaign": {"id": "x"}}}});
        set_null_at_path(&mut body, &["user".to_string(), "campaign".to_string()]);
        assert!(body["data"]["user"]["campaign"].is_null());
    }
}
