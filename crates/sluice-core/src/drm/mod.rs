//! DRM - license sessions for encrypted renditions
//!
//! Provides:
//! - A platform CDM seam ([`Cdm`], [`CdmSession`]) with an in-process ClearKey CDM
//! - Session caching by init data fingerprint, single-flight per asset
//! - Certificate and license exchange through the attempt engine
//! - LDL renewals and key status tracking
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                DRM Session Manager                  │
//! ├─────────────────────────────────────────────────────┤
//! │                                                     │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐           │
//! │  │ Session  │  │ Session  │  │ Session  │           │
//! │  │  cache   │  │  hooks   │  │  timers  │           │
//! │  └────┬─────┘  └────┬─────┘  └────┬─────┘           │
//! │       │             │             │                 │
//! │       └─────────────┼─────────────┘                 │
//! │                     │                               │
//! │         ┌───────────┴───────────┐                   │
//! │         │ CDM          Network  │                   │
//! │         │ session      engine   │                   │
//! │         └───────────────────────┘                   │
//! └─────────────────────────────────────────────────────┘
//! ```

mod cdm;
pub mod clearkey;
mod hooks;
mod manager;
mod session;

pub use cdm::{Cdm, CdmEvent, CdmEventSender, CdmSession, KeyStatus};
pub use clearkey::ClearKeyCdm;
pub use hooks::{DrmHooks, NoHooks, SessionContext};
pub use manager::{CertificateCache, DrmSessionManager};
pub use session::{DrmSession, DrmSessionInfo, DrmSessionState};
