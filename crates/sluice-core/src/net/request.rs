//! Request, response and download trace types

use crate::config::AttemptParameters;
use crate::types::{ByteRange, ContentType};
use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// What a request is for; modifiers use it to decide whether to act
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Manifest,
    Segment,
    License,
    ServerCertificate,
    Key,
    Timing,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestType::Manifest => write!(f, "manifest"),
            RequestType::Segment => write!(f, "segment"),
            RequestType::License => write!(f, "license"),
            RequestType::ServerCertificate => write!(f, "server_certificate"),
            RequestType::Key => write!(f, "key"),
            RequestType::Timing => write!(f, "timing"),
        }
    }
}

/// A request executed by the attempt engine
#[derive(Debug, Clone)]
pub struct Request {
    /// Candidate URIs; attempt `n` uses `uris[n % uris.len()]`
    pub uris: Vec<Url>,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
    pub byte_range: Option<ByteRange>,
    pub request_type: RequestType,
    pub content_type: Option<ContentType>,
    pub retry_parameters: AttemptParameters,
}

impl Request {
    pub fn new(request_type: RequestType, uris: Vec<Url>, retry_parameters: AttemptParameters) -> Self {
        Self {
            uris,
            method: Method::GET,
            headers: BTreeMap::new(),
            body: None,
            byte_range: None,
            request_type,
            content_type: None,
            retry_parameters,
        }
    }

    /// A segment GET for one content type
    pub fn segment(
        uris: Vec<Url>,
        byte_range: Option<ByteRange>,
        content_type: ContentType,
        retry_parameters: AttemptParameters,
    ) -> Self {
        Self {
            byte_range,
            content_type: Some(content_type),
            ..Self::new(RequestType::Segment, uris, retry_parameters)
        }
    }

    /// A POST carrying a license or certificate challenge
    pub fn post(request_type: RequestType, uri: Url, body: Bytes, retry_parameters: AttemptParameters) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::new(request_type, vec![uri], retry_parameters)
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A successful response
#[derive(Debug, Clone)]
pub struct Response {
    /// URI after redirects
    pub uri: Url,
    /// URI the attempt was sent to
    pub original_uri: Url,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub data: Bytes,
    pub request_type: RequestType,
    /// Duration of the successful attempt (milliseconds)
    pub time_ms: f64,
}

/// Measurement of one transfer, fed to bandwidth estimation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTrace {
    pub bytes: u64,
    pub elapsed_ms: f64,
    pub request_type: RequestType,
    pub content_type: Option<ContentType>,
    /// In-flight progress rather than a completed transfer
    pub partial: bool,
}

impl DownloadTrace {
    /// Throughput in bits per second
    pub fn throughput_bps(&self) -> f64 {
        if self.elapsed_ms > 0.0 {
            self.bytes as f64 * 8.0 * 1000.0 / self.elapsed_ms
        } else {
            0.0
        }
    }
}
