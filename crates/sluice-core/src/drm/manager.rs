//! DRM session manager
//!
//! Turns `encrypted` occurrences into licensed CDM sessions:
//! - Sessions are cached by a SHA-256 fingerprint of the init data
//! - `enforceSingleSession` collapses every occurrence of an asset into one
//!   single-flight session; duplicates wait for the first to resolve
//! - Certificates and licenses are fetched through the attempt engine with
//!   the application hooks around them
//! - `ldlDelay` arms a renewal timer, re-armed when the CDM asks for renewal
//! - Key status changes drive expiry and output restrictions

use super::cdm::{Cdm, CdmEvent, KeyStatus};
use super::clearkey;
use super::hooks::{DrmHooks, NoHooks, SessionContext};
use super::session::{DrmSession, DrmSessionState};
use crate::config::{AdvancedDrmConfiguration, AttemptParameters, DrmConfiguration};
use crate::error::{Error, Result, Severity};
use crate::events::{EventBus, PlayerEvent, SessionSignal, SignalSender};
use crate::net::{NetworkingEngine, Request, RequestType};
use crate::track::Rendition;
use crate::types::{saturating_secs, DrmInfo, InitData, KeySystem};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Server certificates that outlive a single load
#[derive(Debug, Clone, Default)]
pub struct CertificateCache(Arc<Mutex<HashMap<KeySystem, Bytes>>>);

impl CertificateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key_system: KeySystem) -> Option<Bytes> {
        self.0.lock().get(&key_system).cloned()
    }

    pub fn insert(&self, key_system: KeySystem, certificate: Bytes) {
        self.0.lock().insert(key_system, certificate);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SessionKey {
    /// Every occurrence of the asset (single-session mode)
    Asset,
    Fingerprint(String),
    /// Init data that is never cached
    Unique(Uuid),
}

type Slot = Arc<OnceCell<Arc<DrmSession>>>;

pub struct DrmSessionManager {
    config: DrmConfiguration,
    retry: AttemptParameters,
    cdm: Arc<dyn Cdm>,
    net: Arc<NetworkingEngine>,
    hooks: Arc<dyn DrmHooks>,
    events: Arc<EventBus>,
    signals: Option<SignalSender>,
    certificates: CertificateCache,
    fetched: Mutex<HashMap<KeySystem, Bytes>>,
    slots: Mutex<HashMap<SessionKey, Slot>>,
    sessions: Mutex<Vec<Arc<DrmSession>>>,
    restricted: Mutex<HashSet<String>>,
    license_requests: AtomicU32,
    cancel: CancellationToken,
}

impl DrmSessionManager {
    pub fn new(
        config: DrmConfiguration,
        retry: AttemptParameters,
        cdm: Arc<dyn Cdm>,
        net: Arc<NetworkingEngine>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            retry,
            cdm,
            net,
            hooks: Arc::new(NoHooks),
            events,
            signals: None,
            certificates: CertificateCache::new(),
            fetched: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            sessions: Mutex::new(Vec::new()),
            restricted: Mutex::new(HashSet::new()),
            license_requests: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn DrmHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_signals(mut self, signals: SignalSender) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn with_certificate_cache(mut self, cache: CertificateCache) -> Self {
        self.certificates = cache;
        self
    }

    pub fn sessions(&self) -> Vec<Arc<DrmSession>> {
        self.sessions.lock().clone()
    }

    /// License requests sent to a server (renewals included)
    pub fn license_request_count(&self) -> u32 {
        self.license_requests.load(Ordering::SeqCst)
    }

    /// Key ids currently reported as output-restricted
    pub fn restricted_key_ids(&self) -> HashSet<String> {
        self.restricted.lock().clone()
    }

    /// Pick the DRM info to use among the ones a rendition offers
    pub fn select_drm_info<'a>(&self, infos: &'a [DrmInfo]) -> Option<&'a DrmInfo> {
        let usable = |info: &&DrmInfo| self.cdm.supports(info.key_system);
        let configured = |info: &&DrmInfo| {
            info.license_server_uri.is_some()
                || self.config.server_for(info.key_system).is_some()
                || (info.key_system == KeySystem::ClearKey && !self.config.clear_keys.is_empty())
        };

        for name in &self.config.preferred_key_systems {
            if let Some(info) = infos
                .iter()
                .filter(usable)
                .find(|info| info.key_system.name() == name.as_str())
            {
                return Some(info);
            }
        }
        infos
            .iter()
            .filter(usable)
            .find(configured)
            .or_else(|| infos.iter().find(usable))
    }

    /// Make sure every session an encrypted rendition needs is open
    #[instrument(skip(self, rendition), fields(rendition_id = rendition.id))]
    pub async fn prepare_rendition(self: &Arc<Self>, rendition: &Rendition) -> Result<Vec<Arc<DrmSession>>> {
        let Some(info) = self.select_drm_info(&rendition.drm_infos) else {
            let offered: Vec<&str> = rendition.drm_infos.iter().map(|i| i.key_system.name()).collect();
            return Err(Error::KeySystemUnavailable {
                key_system: offered.join(", "),
            });
        };

        let init_data = if info.init_data.is_empty() {
            vec![clearkey::key_ids_init_data(&info.key_ids)?]
        } else {
            info.init_data.clone()
        };

        let mut sessions = Vec::with_capacity(init_data.len());
        for init in init_data {
            sessions.push(self.encrypted(info, init).await?);
        }
        Ok(sessions)
    }

    /// Handle one `encrypted` occurrence
    #[instrument(skip(self, drm_info, init_data), fields(key_system = %drm_info.key_system, init_data_type = %init_data.init_data_type))]
    pub async fn encrypted(self: &Arc<Self>, drm_info: &DrmInfo, init_data: InitData) -> Result<Arc<DrmSession>> {
        if self.cancel.is_cancelled() {
            return Err(Error::OperationAborted);
        }

        let fingerprint = self.fingerprint(&init_data);
        let key = if self.config.enforce_single_session {
            SessionKey::Asset
        } else {
            match &fingerprint {
                Some(fp) => SessionKey::Fingerprint(fp.clone()),
                None => SessionKey::Unique(Uuid::new_v4()),
            }
        };

        let slot = {
            let mut slots = self.slots.lock();
            let entry = slots.entry(key).or_default();
            if entry.get().is_some_and(|s| !s.state().is_usable()) {
                *entry = Arc::new(OnceCell::new());
            }
            entry.clone()
        };

        if let Some(session) = slot.get() {
            debug!(session_id = %session.id(), "Session cache hit");
            return Ok(session.clone());
        }

        let session = slot
            .get_or_try_init(|| self.open_session(drm_info, init_data, fingerprint))
            .await?;
        Ok(session.clone())
    }

    fn fingerprint(&self, init_data: &InitData) -> Option<String> {
        if init_data.is_skd() && !self.config.enable_session_cache_for_skd {
            return None;
        }
        let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
        ctx.update(init_data.init_data_type.as_bytes());
        ctx.update(&[0]);
        ctx.update(&init_data.data);
        Some(hex::encode(ctx.finish()))
    }

    async fn open_session(
        self: &Arc<Self>,
        drm_info: &DrmInfo,
        init_data: InitData,
        fingerprint: Option<String>,
    ) -> Result<Arc<DrmSession>> {
        let key_system = drm_info.key_system;
        if !self.cdm.supports(key_system) {
            return Err(Error::KeySystemUnavailable {
                key_system: key_system.name().to_string(),
            });
        }

        let license_server = drm_info
            .license_server_uri
            .clone()
            .or_else(|| self.config.server_for(key_system).cloned());
        let local_keys = key_system == KeySystem::ClearKey && !self.config.clear_keys.is_empty();
        if license_server.is_none() && !local_keys {
            return Err(Error::NoLicenseServer {
                key_system: key_system.name().to_string(),
            });
        }

        let advanced = self.config.advanced_for(key_system);
        let mut ctx = SessionContext::new(key_system);
        let init_data = self
            .hooks
            .transform_init_data(init_data, &mut ctx)
            .await
            .map_err(|source| Error::DrmHook {
                hook: "transformInitData",
                source,
            })?;
        let content_id = self
            .hooks
            .extract_content_id(&init_data, &mut ctx)
            .await
            .map_err(|source| Error::DrmHook {
                hook: "extractContentId",
                source,
            })?;
        ctx.content_id = content_id;

        let (tx, rx) = mpsc::unbounded_channel();
        let cdm_session = self.cdm.create_session(key_system, &advanced.session_type, tx).await?;
        ctx.session_id = Some(cdm_session.session_id());

        let session = Arc::new(DrmSession::new(
            key_system,
            fingerprint,
            license_server,
            cdm_session,
            ctx,
            self.cancel.child_token(),
        ));
        self.sessions.lock().push(session.clone());
        self.spawn_event_loop(session.clone(), rx);
        info!(session_id = %session.id(), key_system = %key_system, "DRM session created");

        if let Err(err) = self.activate(&session, &init_data, &advanced).await {
            error!(session_id = %session.id(), error = %err, "DRM session failed");
            self.discard(&session).await;
            return Err(err);
        }
        Ok(session)
    }

    async fn activate(
        self: &Arc<Self>,
        session: &Arc<DrmSession>,
        init_data: &InitData,
        advanced: &AdvancedDrmConfiguration,
    ) -> Result<()> {
        if let Some(certificate) = self.server_certificate(session, advanced).await? {
            self.cdm.set_server_certificate(session.key_system(), &certificate).await?;
        }

        session.transition(DrmSessionState::RequestingLicense);
        let challenge = session.cdm.generate_request(init_data).await?;
        let license = self.fetch_license(session, challenge).await?;
        session.cdm.update(&license).await?;

        session.transition(DrmSessionState::Active);
        self.events.emit(PlayerEvent::DrmSessionUpdate {
            session_id: session.id().to_string(),
            key_system: session.key_system(),
        });
        self.arm_ldl_timer(session, advanced.ldl_delay);
        Ok(())
    }

    async fn server_certificate(
        &self,
        session: &DrmSession,
        advanced: &AdvancedDrmConfiguration,
    ) -> Result<Option<Bytes>> {
        let key_system = session.key_system();
        if let Some(certificate) = &advanced.server_certificate {
            return Ok(Some(certificate.clone()));
        }
        let Some(uri) = advanced.server_certificate_uri.clone() else {
            return Ok(None);
        };
        let already_fetched = self.fetched.lock().get(&key_system).cloned();
        if let Some(certificate) = already_fetched {
            return Ok(Some(certificate));
        }

        session.transition(DrmSessionState::RequestingCertificate);
        let mut ctx = session.context.lock().await;
        let mut request = Request::new(RequestType::ServerCertificate, vec![uri], self.retry.clone());
        self.hooks
            .certificate_request(&mut request, &mut ctx)
            .await
            .map_err(|source| Error::DrmHook {
                hook: "certificateRequest",
                source,
            })?;

        match self.net.attempt(request).await {
            Ok(mut response) => {
                self.hooks
                    .certificate_response(&mut response, &mut ctx)
                    .await
                    .map_err(|source| Error::DrmHook {
                        hook: "certificateResponse",
                        source,
                    })?;
                self.fetched.lock().insert(key_system, response.data.clone());
                self.certificates.insert(key_system, response.data.clone());
                Ok(Some(response.data))
            }
            Err(err) if err.is_aborted() => Err(err),
            Err(err) => match self.certificates.get(key_system) {
                Some(cached) => {
                    warn!(key_system = %key_system, error = %err, "Certificate request failed, reusing cached certificate");
                    self.report(Error::CertificateRequestFailed {
                        source: Box::new(err),
                        severity: Severity::Recoverable,
                    });
                    Ok(Some(cached))
                }
                None => Err(Error::CertificateRequestFailed {
                    source: Box::new(err),
                    severity: Severity::Fatal,
                }),
            },
        }
    }

    async fn fetch_license(&self, session: &DrmSession, challenge: Bytes) -> Result<Bytes> {
        let Some(uri) = session.license_server.clone() else {
            debug!(session_id = %session.id(), "Using configured ClearKey keys");
            return clearkey::license_from_keys(&self.config.clear_keys);
        };

        let mut request = Request::post(RequestType::License, uri, challenge, self.retry.clone())
            .with_header("content-type", "application/octet-stream");
        let mut ctx = session.context.lock().await;
        self.hooks
            .license_request(&mut request, &mut ctx)
            .await
            .map_err(|source| Error::DrmHook {
                hook: "licenseRequest",
                source,
            })?;

        self.license_requests.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        let mut response = self.net.attempt(request).await.map_err(|err| {
            if err.is_aborted() {
                err
            } else {
                Error::LicenseRequestFailed {
                    source: Box::new(err),
                    severity: Severity::Fatal,
                }
            }
        })?;

        self.hooks
            .license_response(&mut response, &mut ctx)
            .await
            .map_err(|source| Error::DrmHook {
                hook: "licenseResponse",
                source,
            })?;

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        session.add_license_time(elapsed_ms);
        debug!(session_id = %session.id(), elapsed_ms, bytes = response.data.len(), "License received");
        Ok(response.data)
    }

    /// Renew a session's license; `challenge` comes from the CDM when it asked for the renewal
    #[instrument(skip(self, session, challenge), fields(session_id = %session.id()))]
    pub async fn renew(self: &Arc<Self>, session: &Arc<DrmSession>, challenge: Option<Bytes>) -> Result<()> {
        if !session.transition(DrmSessionState::Renewing) {
            return Ok(());
        }

        let result = async {
            let challenge = match challenge {
                Some(challenge) => challenge,
                None => session.cdm.generate_renewal().await?,
            };
            let license = self.fetch_license(session, challenge).await?;
            session.cdm.update(&license).await
        }
        .await;

        match result {
            Ok(()) => {
                session.transition(DrmSessionState::Active);
                let renewals = session.count_renewal();
                self.events.emit(PlayerEvent::DrmSessionRenewed {
                    session_id: session.id().to_string(),
                    renewals,
                });
                Ok(())
            }
            Err(err) if err.is_aborted() => Err(err),
            Err(err) => {
                if session.transition(DrmSessionState::Expired) {
                    self.events.emit(PlayerEvent::DrmSessionExpired {
                        session_id: session.id().to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    fn arm_ldl_timer(self: &Arc<Self>, session: &Arc<DrmSession>, delay: f64) {
        if delay <= 0.0 {
            return;
        }
        let token = session.cancel.child_token();
        if let Some(previous) = session.ldl_timer.lock().replace(token.clone()) {
            previous.cancel();
        }

        let manager = Arc::clone(self);
        let session = Arc::clone(session);
        debug!(session_id = %session.id(), delay, "LDL renewal timer armed");
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(saturating_secs(delay)) => {
                    session.ldl_timer.lock().take();
                    info!(session_id = %session.id(), delay, "LDL delay elapsed, forcing license renewal");
                    if let Err(err) = manager.renew(&session, None).await {
                        if !err.is_aborted() {
                            manager.report(err);
                        }
                    }
                }
            }
        });
    }

    fn spawn_event_loop(self: &Arc<Self>, session: Arc<DrmSession>, mut rx: mpsc::UnboundedReceiver<CdmEvent>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => manager.handle_cdm_event(&session, event).await,
                        None => break,
                    },
                }
            }
        });
    }

    async fn handle_cdm_event(self: &Arc<Self>, session: &Arc<DrmSession>, event: CdmEvent) {
        match event {
            CdmEvent::KeyStatusesChanged(statuses) => self.on_key_statuses(session, statuses),
            CdmEvent::RenewalRequested(challenge) => {
                session.cancel_ldl_timer();
                info!(session_id = %session.id(), "CDM requested license renewal");
                if let Err(err) = self.renew(session, Some(challenge)).await {
                    if !err.is_aborted() {
                        self.report(err);
                    }
                    return;
                }
                let delay = self.config.advanced_for(session.key_system()).ldl_delay;
                self.arm_ldl_timer(session, delay);
            }
            CdmEvent::ExpirationChanged(expiration) => {
                debug!(session_id = %session.id(), ?expiration, "License expiration changed");
            }
        }
    }

    fn on_key_statuses(&self, session: &DrmSession, statuses: BTreeMap<String, KeyStatus>) {
        *session.key_statuses.lock() = statuses.clone();

        let all_expired = !statuses.is_empty() && statuses.values().all(|s| *s == KeyStatus::Expired);
        if all_expired {
            session.cancel_ldl_timer();
            if session.transition(DrmSessionState::Expired) {
                self.events.emit(PlayerEvent::DrmSessionExpired {
                    session_id: session.id().to_string(),
                });
                self.report(Error::LicenseExpired {
                    session_id: session.id().to_string(),
                });
            }
            return;
        }

        let changed = {
            let mut restricted = self.restricted.lock();
            let before = restricted.clone();
            for (key_id, status) in &statuses {
                if status.is_restricted() {
                    restricted.insert(key_id.clone());
                } else {
                    restricted.remove(key_id);
                }
            }
            (before != *restricted).then(|| restricted.clone())
        };

        if let Some(restricted) = changed {
            let mut key_ids: Vec<String> = restricted.iter().cloned().collect();
            key_ids.sort();
            warn!(session_id = %session.id(), restricted = key_ids.len(), "Key restrictions changed");
            self.events.emit(PlayerEvent::KeyStatusRestricted { key_ids });
            if let Some(signals) = &self.signals {
                let _ = signals.send(SessionSignal::RestrictionsChanged(restricted));
            }
        }

        self.events.emit(PlayerEvent::DrmSessionUpdate {
            session_id: session.id().to_string(),
            key_system: session.key_system(),
        });
    }

    fn report(&self, err: Error) {
        match err.severity() {
            Severity::Fatal => error!(code = err.code(), error = %err, "DRM error"),
            Severity::Recoverable => warn!(code = err.code(), error = %err, "Recoverable DRM error"),
        }
        match &self.signals {
            Some(signals) => {
                let _ = signals.send(SessionSignal::Error(err));
            }
            None => {
                self.events.emit(PlayerEvent::error(&err));
            }
        }
    }

    async fn discard(&self, session: &Arc<DrmSession>) {
        session.cancel_ldl_timer();
        session.cancel.cancel();
        session.transition(DrmSessionState::Closed);
        if let Err(err) = session.cdm.close().await {
            debug!(session_id = %session.id(), error = %err, "CDM close failed");
        }
        self.sessions.lock().retain(|s| !Arc::ptr_eq(s, session));
    }

    /// Close every session and cancel their timers
    pub async fn close_all(&self) {
        self.cancel.cancel();
        self.slots.lock().clear();
        let sessions = std::mem::take(&mut *self.sessions.lock());
        for session in sessions {
            session.cancel_ldl_timer();
            session.transition(DrmSessionState::Closed);
            if let Err(err) = session.cdm.close().await {
                debug!(session_id = %session.id(), error = %err, "CDM close failed");
            }
        }
        info!("DRM sessions closed");
    }
}
