//! Platform CDM seam

use crate::error::Result;
use crate::types::{InitData, KeySystem};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Status of one key as reported by the CDM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStatus {
    Usable,
    Expired,
    Released,
    OutputRestricted,
    OutputDownscaled,
    StatusPending,
    InternalError,
}

impl KeyStatus {
    /// Key cannot be used for the current output
    pub fn is_restricted(&self) -> bool {
        matches!(self, KeyStatus::OutputRestricted | KeyStatus::InternalError)
    }
}

/// Notification raised by a CDM session
#[derive(Debug, Clone, PartialEq)]
pub enum CdmEvent {
    /// Hex key id -> status
    KeyStatusesChanged(BTreeMap<String, KeyStatus>),
    /// The CDM wants a license renewal; carries the renewal challenge
    RenewalRequested(Bytes),
    /// New expiration (seconds since the Unix epoch), `None` if the license never expires
    ExpirationChanged(Option<f64>),
}

/// Sender handed to the CDM when a session is created
pub type CdmEventSender = mpsc::UnboundedSender<CdmEvent>;

/// One CDM key session
#[async_trait]
pub trait CdmSession: Send + Sync {
    fn session_id(&self) -> String;

    /// Produce the license challenge for the given init data
    async fn generate_request(&self, init_data: &InitData) -> Result<Bytes>;

    /// Load a license or renewal response
    async fn update(&self, response: &[u8]) -> Result<()>;

    /// Produce a renewal challenge on demand
    async fn generate_renewal(&self) -> Result<Bytes>;

    async fn close(&self) -> Result<()>;
}

/// Platform content decryption module
#[async_trait]
pub trait Cdm: Send + Sync {
    fn supports(&self, key_system: KeySystem) -> bool;

    async fn set_server_certificate(&self, key_system: KeySystem, certificate: &[u8]) -> Result<()>;

    /// Open a session; notifications for it are sent on `events`
    async fn create_session(
        &self,
        key_system: KeySystem,
        session_type: &str,
        events: CdmEventSender,
    ) -> Result<Box<dyn CdmSession>>;
}
