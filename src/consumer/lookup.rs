//! nsqlookupd HTTP queries.
//!
//! `GET /lookup?topic=<topic>` returns the nsqd nodes carrying a topic.
//! Current lookupd versions answer `{"producers": [...]}`; older ones wrap
//! it as `{"status_code": 200, "data": {"producers": [...]}}`. Both are
//! accepted. A 404 means the topic does not exist yet.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{NsqError, Result};

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

#[derive(Debug, Deserialize)]
struct Producers {
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupBody {
    Legacy { data: Producers },
    Current(Producers),
}

/// HTTP client for lookupd queries.
#[derive(Debug, Clone)]
pub(crate) struct LookupClient {
    http: reqwest::Client,
}

impl LookupClient {
    pub(crate) fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nsq-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    /// nsqd TCP addresses carrying `topic`, as reported by `lookupd`.
    pub(crate) async fn query(&self, lookupd: &str, topic: &str) -> Result<Vec<String>> {
        let url = lookup_url(lookupd);
        let resp = self
            .http
            .get(&url)
            .query(&[("topic", topic)])
            .header("Accept", "application/vnd.nsq; version=1.0")
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!("{}: topic {} not found", lookupd, topic);
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(NsqError::Lookup(format!("{} returned {}", url, status)));
        }
        parse_lookup(&resp.bytes().await?)
    }
}

/// Lookup endpoint for a lookupd given as `host:port` or a full URL.
pub(crate) fn lookup_url(lookupd: &str) -> String {
    let base = if lookupd.starts_with("http://") || lookupd.starts_with("https://") {
        lookupd.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", lookupd.trim_end_matches('/'))
    };
    if base.ends_with("/lookup") {
        base
    } else {
        format!("{}/lookup", base)
    }
}

/// Extract `address:port` pairs from a lookup response body.
pub(crate) fn parse_lookup(body: &[u8]) -> Result<Vec<String>> {
    let producers = match serde_json::from_slice::<LookupBody>(body)? {
        LookupBody::Legacy { data } => data.producers,
        LookupBody::Current(p) => p.producers,
    };
    Ok(producers
        .into_iter()
        .map(|p| {
            if p.broadcast_address.contains(':') {
                format!("[{}]:{}", p.broadcast_address, p.tcp_port)
            } else {
                format!("{}:{}", p.broadcast_address, p.tcp_port)
            }
        })
        .collect())
}
