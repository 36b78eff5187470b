//! Transport seam and the default HTTP implementation

use super::request::Request;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// Progress callback: cumulative bytes received and time since the attempt started
pub type Progress<'a> = &'a (dyn Fn(u64, Duration) + Send + Sync);

/// Failure below the HTTP status level
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("transfer failed: {0}")]
    Transfer(String),
}

/// Raw response from a transport, before status classification
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    /// URI after redirects
    pub uri: Url,
    pub headers: BTreeMap<String, String>,
    pub data: Bytes,
}

/// Sends one attempt of a request to one URI
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &Request,
        uri: &Url,
        progress: Progress<'_>,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &Request,
        uri: &Url,
        progress: Progress<'_>,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let start = Instant::now();

        let mut builder = self.client.request(request.method.clone(), uri.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(range) = request.byte_range {
            builder = builder.header(reqwest::header::RANGE, range.header_value());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let mut response = builder
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = response.status().as_u16();
        let final_uri = response.url().clone();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
            .collect();

        let mut data = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TransportError::Transfer(e.to_string()))?
        {
            data.extend_from_slice(&chunk);
            progress(data.len() as u64, start.elapsed());
        }

        debug!(
            uri = %uri,
            status,
            bytes = data.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "HTTP transfer complete"
        );

        Ok(TransportResponse {
            status,
            uri: final_uri,
            headers,
            data: data.freeze(),
        })
    }
}
