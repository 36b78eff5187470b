//! Application hooks around certificate and license exchanges
//!
//! Every hook of one DRM session receives the same [`SessionContext`], so
//! data can be carried from the certificate step to the license step through
//! `custom_data`.

use crate::error::BoxError;
use crate::net::{Request, Response};
use crate::types::{InitData, KeySystem};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Mutable state shared by the hooks of one session
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub key_system: KeySystem,
    /// Set once the CDM session exists
    pub session_id: Option<String>,
    /// Filled by [`DrmHooks::extract_content_id`]
    pub content_id: Option<String>,
    /// Opaque application data
    pub custom_data: Map<String, Value>,
}

impl SessionContext {
    pub fn new(key_system: KeySystem) -> Self {
        Self {
            key_system,
            session_id: None,
            content_id: None,
            custom_data: Map::new(),
        }
    }
}

/// DRM hooks; every method defaults to a no-op
#[async_trait]
pub trait DrmHooks: Send + Sync {
    async fn certificate_request(
        &self,
        _request: &mut Request,
        _ctx: &mut SessionContext,
    ) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    async fn certificate_response(
        &self,
        _response: &mut Response,
        _ctx: &mut SessionContext,
    ) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    async fn license_request(
        &self,
        _request: &mut Request,
        _ctx: &mut SessionContext,
    ) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    async fn license_response(
        &self,
        _response: &mut Response,
        _ctx: &mut SessionContext,
    ) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Content id for key systems that need one (FairPlay)
    async fn extract_content_id(
        &self,
        _init_data: &InitData,
        _ctx: &mut SessionContext,
    ) -> std::result::Result<Option<String>, BoxError> {
        Ok(None)
    }

    /// Rewrite init data before it reaches the CDM
    async fn transform_init_data(
        &self,
        init_data: InitData,
        _ctx: &mut SessionContext,
    ) -> std::result::Result<InitData, BoxError> {
        Ok(init_data)
    }
}

/// Hooks that change nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl DrmHooks for NoHooks {}
