//! Upstash Redis over its REST API.
//!
//! Keys, per sender:
//! - `<prefix>:buf:<sender>`  : list of JSON-encoded fragments (RPUSH order)
//! - `<prefix>:last:<sender>` : unix ms of the latest append
//! - `<prefix>:lock:<sender>` : lease token, `SET NX PX`
//!
//! Buffer keys carry a `PEXPIRE` so Redis drops abandoned bursts on its own.
//! Every request is bounded by the configured timeout; a hung call fails
//! as [`StoreError::Http`] and takes the caller's store-failure path.

use std::time::Duration;

use async_trait::async_trait;
use coalesce_core::types::Fragment;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::buffer::BufferStore;
use crate::error::{Result, StoreError};
use crate::lock::{CoordinationLock, LeaseToken, Release};

/// Refresh a lease only if the caller still owns it.
const EXTEND_SCRIPT: &str = "if redis.call('GET', KEYS[1]) == ARGV[1] then \
     return redis.call('PEXPIRE', KEYS[1], ARGV[2]) else return 0 end";

/// Compare-and-delete: 1 released, -1 held by another token, 0 absent.
const RELEASE_SCRIPT: &str = "local v = redis.call('GET', KEYS[1]) \
     if v == ARGV[1] then redis.call('DEL', KEYS[1]) return 1 \
     elseif v then return -1 else return 0 end";

/// One element of an Upstash REST reply.
#[derive(Debug, Deserialize)]
struct RestReply {
    #[serde(default)]
    result: Value,
    error: Option<String>,
}

impl RestReply {
    fn into_result(self) -> Result<Value> {
        match self.error {
            Some(e) => Err(StoreError::Upstash(e)),
            None => Ok(self.result),
        }
    }
}

pub struct UpstashStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
    prefix: String,
    buffer_ttl: Duration,
}

impl UpstashStore {
    pub fn new(
        base_url: Option<&str>,
        token: Option<&str>,
        prefix: &str,
        buffer_ttl: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| StoreError::Config("missing Upstash REST URL".to_string()))?;
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| StoreError::Config("missing Upstash REST token".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            prefix: prefix.to_string(),
            buffer_ttl,
        })
    }

    fn buffer_key(&self, sender: &str) -> String {
        format!("{}:buf:{}", self.prefix, sender)
    }

    fn last_key(&self, sender: &str) -> String {
        format!("{}:last:{}", self.prefix, sender)
    }

    fn lock_key(&self, sender: &str) -> String {
        format!("{}:lock:{}", self.prefix, sender)
    }

    /// Run a single command.
    async fn command(&self, args: Value) -> Result<Value> {
        let reply: RestReply = self.post(&self.base_url, &args).await?;
        reply.into_result()
    }

    /// Run several commands inside MULTI/EXEC; all results, in order.
    async fn transaction(&self, commands: Value) -> Result<Vec<Value>> {
        let url = format!("{}/multi-exec", self.base_url);
        let replies: Vec<RestReply> = self.post(&url, &commands).await?;
        replies.into_iter().map(RestReply::into_result).collect()
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, url: &str, body: &Value) -> Result<T> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "Upstash REST error");
            return Err(StoreError::Upstash(format!("HTTP {}: {}", status.as_u16(), text)));
        }
        Ok(resp.json().await?)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Decode the `LRANGE` payload; entries that are not valid fragments are
/// skipped so one corrupt element cannot sink the whole burst.
fn decode_fragments(sender: &str, raw: &Value) -> Vec<Fragment> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let s = item.as_str()?;
            match serde_json::from_str::<Fragment>(s) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(sender, error = %e, "skipping undecodable buffered fragment");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl BufferStore for UpstashStore {
    fn backend(&self) -> &str {
        "upstash"
    }

    async fn append(&self, sender: &str, fragment: &Fragment) -> Result<()> {
        let buf = self.buffer_key(sender);
        let ttl = self.buffer_ttl.as_millis().to_string();
        let encoded = serde_json::to_string(fragment)?;
        self.transaction(json!([
            ["RPUSH", buf, encoded],
            ["PEXPIRE", buf, ttl],
            ["SET", self.last_key(sender), now_ms().to_string(), "PX", ttl],
        ]))
        .await?;
        Ok(())
    }

    async fn read_and_clear(&self, sender: &str) -> Result<Vec<Fragment>> {
        let buf = self.buffer_key(sender);
        let results = self
            .transaction(json!([
                ["LRANGE", buf, "0", "-1"],
                ["DEL", buf],
                ["DEL", self.last_key(sender)],
            ]))
            .await?;
        let fragments = results
            .first()
            .map(|raw| decode_fragments(sender, raw))
            .unwrap_or_default();
        debug!(sender, fragments = fragments.len(), "drained Upstash buffer");
        Ok(fragments)
    }

    async fn quiet_for(&self, sender: &str) -> Result<Option<Duration>> {
        let last = self.command(json!(["GET", self.last_key(sender)])).await?;
        Ok(parse_millis(&last)
            .map(|at| Duration::from_millis(now_ms().saturating_sub(at).max(0) as u64)))
    }
}

#[async_trait]
impl CoordinationLock for UpstashStore {
    async fn try_acquire(&self, sender: &str, ttl: Duration) -> Result<Option<LeaseToken>> {
        let token = LeaseToken::new();
        let reply = self
            .command(json!([
                "SET",
                self.lock_key(sender),
                token.as_str(),
                "NX",
                "PX",
                ttl.as_millis().to_string()
            ]))
            .await?;
        Ok((reply.as_str() == Some("OK")).then_some(token))
    }

    async fn extend(&self, sender: &str, token: &LeaseToken, ttl: Duration) -> Result<bool> {
        let reply = self
            .command(json!([
                "EVAL",
                EXTEND_SCRIPT,
                "1",
                self.lock_key(sender),
                token.as_str(),
                ttl.as_millis().to_string()
            ]))
            .await?;
        Ok(reply.as_i64() == Some(1))
    }

    async fn release(&self, sender: &str, token: &LeaseToken) -> Result<Release> {
        let reply = self
            .command(json!([
                "EVAL",
                RELEASE_SCRIPT,
                "1",
                self.lock_key(sender),
                token.as_str()
            ]))
            .await?;
        release_from_reply(&reply)
    }
}

fn parse_millis(v: &Value) -> Option<i64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn release_from_reply(v: &Value) -> Result<Release> {
    match v.as_i64() {
        Some(1) => Ok(Release::Released),
        Some(0) => Ok(Release::Absent),
        Some(-1) => Ok(Release::HeldByOther),
        _ => Err(StoreError::Upstash(format!("unexpected release reply: {v}"))),
    }
}
