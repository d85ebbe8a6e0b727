use std::{sync::Arc, time::Duration};

use reqwest::{header::HeaderMap, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    config::ConsulConfig,
    error::{BackendError, Error},
    Result,
};

const TOKEN_HEADER: &str = "X-Consul-Token";
const INDEX_HEADER: &str = "X-Consul-Index";

/// Extra time allowed on top of a blocking query's wait, covering the
/// jitter the agent adds to it.
const BLOCKING_GRACE: Duration = Duration::from_secs(5);

/// Consul HTTP API client, shared by every lock prepared from it.
#[derive(Clone, Debug)]
pub struct ConsulClient {
    http: reqwest::Client,
    config: Arc<ConsulConfig>,
}

/// Session creation request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SessionEntry {
    pub name: String,
    #[serde(rename = "TTL")]
    pub ttl: String,
    pub behavior: String,
    pub lock_delay: String,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

/// A key/value entry as returned by `GET /v1/kv/{key}`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct KvPair {
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub modify_index: u64,
}

impl KvPair {
    pub fn held_by(&self) -> Option<&str> {
        self.session.as_deref().filter(|s| !s.is_empty())
    }
}

/// Format a duration the way the agent parses it.
pub(crate) fn duration_param(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis().max(1))
    }
}

impl ConsulClient {
    pub fn new(config: ConsulConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .tcp_keepalive(config.tcp_keepalive)
            .build()
            .map_err(|e| Error::BackendUnavailable(e.into()))?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    /// Client configured from the `CONSUL_HTTP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ConsulConfig::from_env())
    }

    pub fn config(&self) -> &ConsulConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/v1/{}", self.config.base_url(), path);
        let mut req = self.http.request(method, url);
        if let Some(token) = &self.config.token {
            req = req.header(TOKEN_HEADER, token);
        }
        if let Some(dc) = &self.config.datacenter {
            req = req.query(&[("dc", dc)]);
        }
        req
    }

    async fn check(resp: Response) -> std::result::Result<Response, BackendError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BackendError::Status { status, body })
    }

    #[tracing::instrument(skip_all, fields(name = %entry.name), err)]
    pub(crate) async fn session_create(
        &self,
        entry: &SessionEntry,
    ) -> std::result::Result<String, BackendError> {
        let resp = self
            .request(Method::PUT, "session/create")
            .json(entry)
            .send()
            .await?;
        let body = Self::check(resp).await?.bytes().await?;
        let created: SessionCreated = serde_json::from_slice(&body)?;
        debug!(session = created.id, "session created");
        Ok(created.id)
    }

    /// Renew a session. Returns `false` when the session no longer exists.
    pub(crate) async fn session_renew(&self, id: &str) -> std::result::Result<bool, BackendError> {
        let resp = self
            .request(Method::PUT, &format!("session/renew/{}", id))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let body = Self::check(resp).await?.bytes().await?;
        let entries: Vec<serde_json::Value> = serde_json::from_slice(&body)?;
        Ok(!entries.is_empty())
    }

    pub(crate) async fn session_destroy(&self, id: &str) -> std::result::Result<(), BackendError> {
        let resp = self
            .request(Method::PUT, &format!("session/destroy/{}", id))
            .send()
            .await?;
        Self::check(resp).await?;
        trace!(session = id, "session destroyed");
        Ok(())
    }

    /// Read a key. With `wait`, this is a blocking query that returns once
    /// the key's index moves past the given one or the wait time elapses.
    pub(crate) async fn kv_get(
        &self,
        key: &str,
        wait: Option<(u64, Duration)>,
    ) -> std::result::Result<(Option<KvPair>, u64), BackendError> {
        let mut req = self.request(Method::GET, &format!("kv/{}", key));
        if let Some((index, wait_time)) = wait {
            req = req
                .query(&[("index", index.to_string()), ("wait", duration_param(wait_time))])
                .timeout(wait_time + wait_time / 16 + BLOCKING_GRACE);
        }
        let resp = req.send().await?;
        let index = last_index(resp.headers());
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok((None, index));
        }
        let body = Self::check(resp).await?.bytes().await?;
        let mut pairs: Vec<KvPair> = serde_json::from_slice(&body)?;
        Ok((pairs.pop(), index))
    }

    async fn kv_put(
        &self,
        key: &str,
        query: &[(&str, String)],
        value: Vec<u8>,
    ) -> std::result::Result<bool, BackendError> {
        let resp = self
            .request(Method::PUT, &format!("kv/{}", key))
            .query(query)
            .body(value)
            .send()
            .await?;
        let body = Self::check(resp).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub(crate) async fn kv_acquire(
        &self,
        key: &str,
        session: &str,
        value: &[u8],
        flags: u64,
    ) -> std::result::Result<bool, BackendError> {
        self.kv_put(
            key,
            &[("acquire", session.to_owned()), ("flags", flags.to_string())],
            value.to_vec(),
        )
        .await
    }

    pub(crate) async fn kv_release(
        &self,
        key: &str,
        session: &str,
        flags: u64,
    ) -> std::result::Result<bool, BackendError> {
        self.kv_put(
            key,
            &[("release", session.to_owned()), ("flags", flags.to_string())],
            Vec::new(),
        )
        .await
    }

    /// Delete a key only if it was not modified since `modify_index`.
    pub(crate) async fn kv_delete_cas(
        &self,
        key: &str,
        modify_index: u64,
    ) -> std::result::Result<bool, BackendError> {
        let resp = self
            .request(Method::DELETE, &format!("kv/{}", key))
            .query(&[("cas", modify_index.to_string())])
            .send()
            .await?;
        let body = Self::check(resp).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

fn last_index(headers: &HeaderMap) -> u64 {
    headers
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{body_json, header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    async fn client_for(server: &MockServer, token: Option<&str>) -> ConsulClient {
        let mut config = ConsulConfig::default();
        config.set_address(&server.uri());
        config.token = token.map(str::to_owned);
        ConsulClient::new(config).expect("client")
    }

    #[test]
    fn test_duration_param() {
        assert_eq!(duration_param(Duration::from_secs(15)), "15s");
        assert_eq!(duration_param(Duration::from_millis(1500)), "1500ms");
    }

    #[tokio::test]
    async fn test_session_create_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/create"))
            .and(header("X-Consul-Token", "acl-token"))
            .and(body_json(serde_json::json!({
                "Name": "locks-testlock",
                "TTL": "30s",
                "Behavior": "release",
                "LockDelay": "15s",
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"ID": "sess-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("acl-token")).await;
        let id = client
            .session_create(&SessionEntry {
                name: "locks-testlock".to_owned(),
                ttl: "30s".to_owned(),
                behavior: "release".to_owned(),
                lock_delay: "15s".to_owned(),
            })
            .await
            .expect("session");
        assert_eq!(id, "sess-1");
    }

    #[tokio::test]
    async fn test_kv_get_missing_and_present() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/locks/missing"))
            .respond_with(ResponseTemplate::new(404).insert_header("X-Consul-Index", "7"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/locks/held"))
            .and(query_param("index", "3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Consul-Index", "9")
                    .set_body_json(serde_json::json!([{
                        "Key": "locks/held",
                        "Flags": 3304740253564472344u64,
                        "Session": "sess-2",
                        "ModifyIndex": 9,
                        "LockIndex": 1,
                        "Value": "aG9zdDE="
                    }])),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, None).await;
        let (pair, index) = client.kv_get("locks/missing", None).await.expect("get");
        assert!(pair.is_none());
        assert_eq!(index, 7);

        let (pair, index) = client
            .kv_get("locks/held", Some((3, Duration::from_secs(1))))
            .await
            .expect("get");
        let pair = pair.expect("pair");
        assert_eq!(index, 9);
        assert_eq!(pair.held_by(), Some("sess-2"));
        assert_eq!(pair.modify_index, 9);
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/destroy/sess-1"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Permission denied"))
            .mount(&server)
            .await;

        let client = client_for(&server, None).await;
        match client.session_destroy("sess-1").await {
            Err(BackendError::Status { status, body }) => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, "Permission denied");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
