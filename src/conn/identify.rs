//! IDENTIFY and AUTH bodies.
//!
//! The IDENTIFY request is a JSON object describing the client and the
//! features it wants. A server that supports feature negotiation answers
//! with a JSON object; older servers answer with a bare `OK`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::Result;
use crate::protocol::OK;

/// Server default for `max_rdy_count` when it does not say.
pub const DEFAULT_MAX_RDY_COUNT: u32 = 2500;

/// Body of the IDENTIFY command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifyRequest {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub feature_negotiation: bool,
    /// Milliseconds; -1 disables heartbeats.
    pub heartbeat_interval: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_size: Option<i64>,
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_timeout: Option<i64>,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: u32,
    pub snappy: bool,
    pub sample_rate: u8,
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_timeout: Option<i64>,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl IdentifyRequest {
    /// Build the request from client configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            client_id: config.client_id.clone(),
            hostname: config.hostname.clone(),
            user_agent: config.user_agent.clone(),
            feature_negotiation: true,
            heartbeat_interval: config.heartbeat_interval.map_or(-1, millis),
            output_buffer_size: config.output_buffer_size,
            output_buffer_timeout: config.output_buffer_timeout.map(millis),
            tls_v1: config.tls.is_some(),
            deflate: config.deflate,
            deflate_level: config.deflate_level,
            snappy: false,
            sample_rate: config.sample_rate,
            msg_timeout: config.msg_timeout.map(millis),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Features the server agreed to, from the IDENTIFY response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IdentifyResponse {
    pub max_rdy_count: u32,
    pub version: String,
    /// Milliseconds.
    pub max_msg_timeout: i64,
    /// Milliseconds.
    pub msg_timeout: i64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: u32,
    pub max_deflate_level: u32,
    pub snappy: bool,
    pub sample_rate: u8,
    pub auth_required: bool,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
}

impl Default for IdentifyResponse {
    fn default() -> Self {
        Self {
            max_rdy_count: DEFAULT_MAX_RDY_COUNT,
            version: String::new(),
            max_msg_timeout: 0,
            msg_timeout: 0,
            tls_v1: false,
            deflate: false,
            deflate_level: 0,
            max_deflate_level: 0,
            snappy: false,
            sample_rate: 0,
            auth_required: false,
            output_buffer_size: 0,
            output_buffer_timeout: 0,
        }
    }
}

impl IdentifyResponse {
    /// Parse the response payload; a bare `OK` means no negotiation.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload == OK {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(payload)?)
    }

    /// Server-side message timeout, if reported.
    pub fn msg_timeout(&self) -> Option<Duration> {
        u64::try_from(self.msg_timeout)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Reply to AUTH.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AuthResponse {
    pub identity: String,
    pub identity_url: Option<String>,
    pub permission_count: i64,
}

impl AuthResponse {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_config() {
        let config = Config {
            client_id: "worker-1".to_string(),
            hostname: "worker-1.example".to_string(),
            heartbeat_interval: Some(Duration::from_secs(15)),
            deflate: true,
            msg_timeout: Some(Duration::from_secs(120)),
            ..Config::default()
        };
        let json: serde_json::Value =
            serde_json::from_slice(&IdentifyRequest::from_config(&config).to_json().unwrap()).unwrap();

        assert_eq!(json["client_id"], "worker-1");
        assert_eq!(json["hostname"], "worker-1.example");
        assert_eq!(json["feature_negotiation"], true);
        assert_eq!(json["heartbeat_interval"], 15000);
        assert_eq!(json["deflate"], true);
        assert_eq!(json["snappy"], false);
        assert_eq!(json["tls_v1"], false);
        assert_eq!(json["msg_timeout"], 120000);
        assert!(json.get("output_buffer_size").is_none());
    }

    #[test]
    fn test_disabled_heartbeat() {
        let config = Config {
            heartbeat_interval: None,
            ..Config::default()
        };
        assert_eq!(IdentifyRequest::from_config(&config).heartbeat_interval, -1);
    }

    #[test]
    fn test_parse_ok_response() {
        let resp = IdentifyResponse::parse(b"OK").unwrap();
        assert_eq!(resp.max_rdy_count, DEFAULT_MAX_RDY_COUNT);
        assert!(!resp.tls_v1);
        assert_eq!(resp.msg_timeout(), None);
    }

    #[test]
    fn test_parse_json_response() {
        let payload = br#"{"max_rdy_count":100,"version":"1.2.1","max_msg_timeout":900000,
            "msg_timeout":60000,"tls_v1":false,"deflate":true,"deflate_level":6,
            "max_deflate_level":6,"snappy":false,"sample_rate":0,"auth_required":true,
            "output_buffer_size":16384,"output_buffer_timeout":250}"#;
        let resp = IdentifyResponse::parse(payload).unwrap();
        assert_eq!(resp.max_rdy_count, 100);
        assert_eq!(resp.version, "1.2.1");
        assert!(resp.deflate);
        assert!(resp.auth_required);
        assert_eq!(resp.msg_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_partial_response_uses_defaults() {
        let resp = IdentifyResponse::parse(br#"{"version":"0.3.8"}"#).unwrap();
        assert_eq!(resp.max_rdy_count, DEFAULT_MAX_RDY_COUNT);
        assert!(IdentifyResponse::parse(b"not json").is_err());
    }

    #[test]
    fn test_parse_auth_response() {
        let resp = AuthResponse::parse(
            br#"{"identity":"svc","identity_url":"https://auth.local/svc","permission_count":2}"#,
        )
        .unwrap();
        assert_eq!(resp.identity, "svc");
        assert_eq!(resp.permission_count, 2);
    }
}
