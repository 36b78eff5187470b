//! Transport that serves `file://` URIs from disk and everything else over HTTP

use async_trait::async_trait;
use bytes::Bytes;
use sluice_core::net::{Progress, TransportError, TransportResponse};
use sluice_core::{HttpTransport, Request, Transport};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Default)]
pub struct FixtureTransport {
    http: HttpTransport,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for FixtureTransport {
    async fn send(
        &self,
        request: &Request,
        uri: &Url,
        progress: Progress<'_>,
    ) -> Result<TransportResponse, TransportError> {
        if uri.scheme() != "file" {
            return self.http.send(request, uri, progress).await;
        }

        let path = uri
            .to_file_path()
            .map_err(|_| TransportError::Connection(format!("not a local path: {}", uri)))?;

        let (status, data) = match tokio::fs::read(&path).await {
            Ok(contents) => match request.byte_range {
                Some(range) => {
                    let start = (range.start as usize).min(contents.len());
                    let end = (range.end() as usize + 1).min(contents.len());
                    (206, Bytes::copy_from_slice(&contents[start..end]))
                }
                None => (200, Bytes::from(contents)),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (404, Bytes::new()),
            Err(e) => return Err(TransportError::Transfer(e.to_string())),
        };

        progress(data.len() as u64, Duration::ZERO);
        debug!(path = %path.display(), status, bytes = data.len(), "File read complete");

        Ok(TransportResponse {
            status,
            uri: uri.clone(),
            headers: BTreeMap::new(),
            data,
        })
    }
}
