//! Network attempt engine
//!
//! Executes a [`Request`] with:
//! - Request modifiers before the first attempt, response modifiers after success
//! - Round-robin URI rotation across attempts
//! - Exponential backoff with jitter between attempts
//! - Per-attempt timeouts and session-wide cancellation
//! - One CDN fallback cycle after the attempts are exhausted
//! - Download traces for every completed attempt

use super::backoff::Backoff;
use super::modifiers::{ModifierChain, RequestModifier, ResponseModifier};
use super::request::{DownloadTrace, Request, RequestType, Response};
use super::transport::{Transport, TransportResponse};
use crate::error::{Error, Result, Severity};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

/// Called once after a request exhausts its attempts; may return a replacement URI
pub type CdnFallback = Arc<dyn Fn(&Error, &Request) -> Option<Url> + Send + Sync>;

/// Receives every download trace, in order
pub type TraceObserver = Arc<dyn Fn(&DownloadTrace) + Send + Sync>;

/// Receives recoverable errors raised while a request continues
pub type RecoverableErrorObserver = Arc<dyn Fn(&Error) + Send + Sync>;

/// Why a cycle of attempts ended without a response
enum Failure {
    /// Every attempt failed with a retryable error
    Exhausted(Error),
    /// A non-retryable failure; no fallback
    Fatal(Error),
    Aborted,
}

pub struct NetworkingEngine {
    transport: Arc<dyn Transport>,
    modifiers: ModifierChain,
    cdn_fallback: RwLock<Option<CdnFallback>>,
    trace_observers: RwLock<Vec<TraceObserver>>,
    error_observers: RwLock<Vec<RecoverableErrorObserver>>,
    cancel: Mutex<CancellationToken>,
}

impl NetworkingEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            modifiers: ModifierChain::new(),
            cdn_fallback: RwLock::new(None),
            trace_observers: RwLock::new(Vec::new()),
            error_observers: RwLock::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn register_request_modifier(&self, modifier: Arc<dyn RequestModifier>) {
        self.modifiers.register_request(modifier);
    }

    pub fn register_response_modifier(&self, modifier: Arc<dyn ResponseModifier>) {
        self.modifiers.register_response(modifier);
    }

    pub fn clear_modifiers(&self) {
        self.modifiers.clear();
    }

    pub fn set_cdn_fallback(&self, fallback: Option<CdnFallback>) {
        *self.cdn_fallback.write() = fallback;
    }

    pub fn on_trace(&self, observer: TraceObserver) {
        self.trace_observers.write().push(observer);
    }

    pub fn on_recoverable_error(&self, observer: RecoverableErrorObserver) {
        self.error_observers.write().push(observer);
    }

    /// Drop trace and error observers; used when a session is torn down
    pub fn clear_observers(&self) {
        self.trace_observers.write().clear();
        self.error_observers.write().clear();
    }

    /// Token that cancels every request started before the next [`abort_all`](Self::abort_all)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Cancel all in-flight requests; later requests are unaffected
    pub fn abort_all(&self) {
        let mut guard = self.cancel.lock();
        guard.cancel();
        *guard = CancellationToken::new();
        debug!("Aborted all in-flight requests");
    }

    /// Execute a request to completion
    #[instrument(skip(self, request), fields(request_type = %request.request_type))]
    pub async fn attempt(&self, request: Request) -> Result<Response> {
        let token = self.cancellation_token();
        self.attempt_with_token(request, &token).await
    }

    /// Execute a request, also honouring a caller-supplied cancellation token
    pub async fn attempt_with_token(&self, mut request: Request, token: &CancellationToken) -> Result<Response> {
        if request.uris.is_empty() {
            return Err(Error::NoUris);
        }

        let token = &Abort {
            session: self.cancellation_token(),
            caller: token.clone(),
        };

        tokio::select! {
            _ = token.cancelled() => return Err(Error::OperationAborted),
            res = self.modifiers.apply_request(&mut request) => {
                res.map_err(|source| Error::RequestModifier { source })?;
            }
        }
        if request.uris.is_empty() {
            return Err(Error::NoUris);
        }

        let mut response = match self.run_attempts(&request, token).await {
            Ok(response) => response,
            Err(Failure::Aborted) => return Err(Error::OperationAborted),
            Err(Failure::Fatal(err)) => return Err(err),
            Err(Failure::Exhausted(err)) => self.fall_back(request, err, token).await?,
        };

        tokio::select! {
            _ = token.cancelled() => return Err(Error::OperationAborted),
            res = self.modifiers.apply_response(&mut response) => {
                res.map_err(|source| Error::ResponseModifier { source })?;
            }
        }

        Ok(response)
    }

    async fn fall_back(&self, mut request: Request, err: Error, token: &Abort) -> Result<Response> {
        let fallback = self.cdn_fallback.read().clone();
        let Some(uri) = fallback.and_then(|f| f(&err, &request)) else {
            return Err(err);
        };

        warn!(
            request_type = %request.request_type,
            fallback = %uri,
            error = %err,
            "Attempts exhausted, retrying against fallback URI"
        );
        self.notify_recoverable(&err.with_severity(Severity::Recoverable));

        request.uris = vec![uri];
        match self.run_attempts(&request, token).await {
            Ok(response) => Ok(response),
            Err(Failure::Aborted) => Err(Error::OperationAborted),
            Err(Failure::Fatal(err)) | Err(Failure::Exhausted(err)) => Err(err),
        }
    }

    async fn run_attempts(&self, request: &Request, token: &Abort) -> std::result::Result<Response, Failure> {
        let params = &request.retry_parameters;
        let backoff = Backoff::new(params);
        let max_attempts = params.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = backoff.delay_for_attempt(attempt);
                if let Some(err) = &last_error {
                    warn!(
                        attempt = attempt + 1,
                        max = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying request"
                    );
                }
                tokio::select! {
                    _ = token.cancelled() => return Err(Failure::Aborted),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let uri = &request.uris[attempt as usize % request.uris.len()];
            match self.send_once(request, uri, attempt + 1, token).await {
                Ok(response) => return Ok(response),
                Err(Failure::Exhausted(err)) => last_error = Some(err),
                Err(other) => return Err(other),
            }
        }

        Err(Failure::Exhausted(last_error.unwrap_or(Error::NoUris)))
    }

    async fn send_once(
        &self,
        request: &Request,
        uri: &Url,
        attempts: u32,
        token: &Abort,
    ) -> std::result::Result<Response, Failure> {
        let start = Instant::now();
        let request_type = request.request_type;
        let content_type = request.content_type;

        let progress = |bytes: u64, elapsed: Duration| {
            self.emit_trace(&DownloadTrace {
                bytes,
                elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                request_type,
                content_type,
                partial: true,
            });
        };

        let send = self.transport.send(request, uri, &progress);
        let timeout = request.retry_parameters.timeout;

        let outcome = tokio::select! {
            _ = token.cancelled() => return Err(Failure::Aborted),
            res = async {
                if timeout > 0 {
                    tokio::time::timeout(Duration::from_millis(timeout), send).await.ok()
                } else {
                    Some(send.await)
                }
            } => res,
        };

        let elapsed = start.elapsed();
        match outcome {
            None => {
                debug!(uri = %uri, attempts, "Attempt timed out");
                Err(Failure::Exhausted(Error::Timeout {
                    uri: uri.to_string(),
                    attempts,
                    severity: Severity::Fatal,
                }))
            }
            Some(Err(e)) => {
                debug!(uri = %uri, attempts, error = %e, "Attempt failed");
                Err(Failure::Exhausted(Error::HttpError {
                    uri: uri.to_string(),
                    message: e.to_string(),
                    attempts,
                    severity: Severity::Fatal,
                }))
            }
            Some(Ok(raw)) => {
                self.emit_trace(&DownloadTrace {
                    bytes: raw.data.len() as u64,
                    elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                    request_type,
                    content_type,
                    partial: false,
                });
                self.classify(request_type, uri, raw, attempts, elapsed, &request.retry_parameters.fatal_status_codes)
            }
        }
    }

    fn classify(
        &self,
        request_type: RequestType,
        uri: &Url,
        raw: TransportResponse,
        attempts: u32,
        elapsed: Duration,
        fatal_codes: &std::collections::BTreeSet<u16>,
    ) -> std::result::Result<Response, Failure> {
        if (200..300).contains(&raw.status) {
            return Ok(Response {
                uri: raw.uri,
                original_uri: uri.clone(),
                status: raw.status,
                headers: raw.headers,
                data: raw.data,
                request_type,
                time_ms: elapsed.as_secs_f64() * 1000.0,
            });
        }

        let err = Error::BadHttpStatus {
            uri: uri.to_string(),
            status: raw.status,
            attempts,
            severity: Severity::Fatal,
        };
        if fatal_codes.contains(&raw.status) {
            debug!(uri = %uri, status = raw.status, "Fatal status, not retrying");
            Err(Failure::Fatal(err))
        } else {
            debug!(uri = %uri, status = raw.status, attempts, "Bad status");
            Err(Failure::Exhausted(err))
        }
    }

    fn emit_trace(&self, trace: &DownloadTrace) {
        let observers = self.trace_observers.read().clone();
        for observer in observers {
            observer(trace);
        }
    }

    fn notify_recoverable(&self, err: &Error) {
        let observers = self.error_observers.read().clone();
        for observer in observers {
            observer(err);
        }
    }
}

/// Cancelled by a session-wide abort or by the caller's own token
struct Abort {
    session: CancellationToken,
    caller: CancellationToken,
}

impl Abort {
    async fn cancelled(&self) {
        tokio::select! {
            _ = self.session.cancelled() => {}
            _ = self.caller.cancelled() => {}
        }
    }
}
