//! DRM session state

use super::cdm::{CdmSession, KeyStatus};
use super::hooks::SessionContext;
use crate::types::KeySystem;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

/// Lifecycle of a license session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrmSessionState {
    Uninitialized,
    RequestingCertificate,
    RequestingLicense,
    Active,
    Renewing,
    Expired,
    Closed,
}

impl DrmSessionState {
    pub fn can_transition_to(&self, target: DrmSessionState) -> bool {
        use DrmSessionState::*;
        matches!(
            (self, target),
            (Uninitialized, RequestingCertificate)
                | (Uninitialized, RequestingLicense)
                | (RequestingCertificate, RequestingLicense)
                | (RequestingLicense, Active)
                | (Active, Renewing)
                | (Active, Expired)
                | (Renewing, Active)
                | (Renewing, Expired)
                | (Uninitialized | RequestingCertificate | RequestingLicense | Active | Renewing | Expired, Closed)
        )
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, DrmSessionState::Active | DrmSessionState::Renewing)
    }
}

impl std::fmt::Display for DrmSessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrmSessionState::Uninitialized => write!(f, "UNINITIALIZED"),
            DrmSessionState::RequestingCertificate => write!(f, "REQUESTING_CERTIFICATE"),
            DrmSessionState::RequestingLicense => write!(f, "REQUESTING_LICENSE"),
            DrmSessionState::Active => write!(f, "ACTIVE"),
            DrmSessionState::Renewing => write!(f, "RENEWING"),
            DrmSessionState::Expired => write!(f, "EXPIRED"),
            DrmSessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Serializable view of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrmSessionInfo {
    pub session_id: String,
    pub key_system: KeySystem,
    pub state: DrmSessionState,
    pub key_statuses: BTreeMap<String, KeyStatus>,
    pub renewals: u32,
    pub license_time_ms: f64,
    pub created_at: DateTime<Utc>,
}

/// One license session and its CDM counterpart
pub struct DrmSession {
    pub(crate) id: String,
    pub(crate) key_system: KeySystem,
    pub(crate) fingerprint: Option<String>,
    pub(crate) license_server: Option<Url>,
    pub(crate) cdm: Box<dyn CdmSession>,
    pub(crate) context: tokio::sync::Mutex<SessionContext>,
    pub(crate) key_statuses: Mutex<BTreeMap<String, KeyStatus>>,
    pub(crate) ldl_timer: Mutex<Option<CancellationToken>>,
    pub(crate) cancel: CancellationToken,
    state: watch::Sender<DrmSessionState>,
    renewals: AtomicU32,
    license_time_ms: Mutex<f64>,
    created_at: DateTime<Utc>,
}

impl DrmSession {
    pub(crate) fn new(
        key_system: KeySystem,
        fingerprint: Option<String>,
        license_server: Option<Url>,
        cdm: Box<dyn CdmSession>,
        context: SessionContext,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(DrmSessionState::Uninitialized);
        Self {
            id: cdm.session_id(),
            key_system,
            fingerprint,
            license_server,
            cdm,
            context: tokio::sync::Mutex::new(context),
            key_statuses: Mutex::new(BTreeMap::new()),
            ldl_timer: Mutex::new(None),
            cancel,
            state,
            renewals: AtomicU32::new(0),
            license_time_ms: Mutex::new(0.0),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key_system(&self) -> KeySystem {
        self.key_system
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn state(&self) -> DrmSessionState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<DrmSessionState> {
        self.state.subscribe()
    }

    pub fn renewals(&self) -> u32 {
        self.renewals.load(Ordering::SeqCst)
    }

    pub fn key_statuses(&self) -> BTreeMap<String, KeyStatus> {
        self.key_statuses.lock().clone()
    }

    pub fn license_time_ms(&self) -> f64 {
        *self.license_time_ms.lock()
    }

    pub(crate) fn add_license_time(&self, ms: f64) {
        *self.license_time_ms.lock() += ms;
    }

    pub(crate) fn count_renewal(&self) -> u32 {
        self.renewals.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply a transition if it is legal; returns false otherwise
    pub(crate) fn transition(&self, to: DrmSessionState) -> bool {
        let from = self.state();
        if !from.can_transition_to(to) {
            warn!(session_id = %self.id, from = %from, to = %to, "Ignoring invalid DRM session transition");
            return false;
        }
        self.state.send_replace(to);
        info!(session_id = %self.id, from = %from, to = %to, "DRM session transition");
        true
    }

    /// Cancel the pending LDL renewal timer, if any
    pub(crate) fn cancel_ldl_timer(&self) {
        if let Some(timer) = self.ldl_timer.lock().take() {
            timer.cancel();
        }
    }

    pub fn info(&self) -> DrmSessionInfo {
        DrmSessionInfo {
            session_id: self.id.clone(),
            key_system: self.key_system,
            state: self.state(),
            key_statuses: self.key_statuses(),
            renewals: self.renewals(),
            license_time_ms: self.license_time_ms(),
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for DrmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmSession")
            .field("id", &self.id)
            .field("key_system", &self.key_system)
            .field("state", &self.state())
            .finish()
    }
}
