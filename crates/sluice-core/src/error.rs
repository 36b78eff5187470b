//! Error types for Sluice Core
//!
//! Every error belongs to a [`Category`] and carries a [`Severity`]. Network
//! failures record the severity the attempt engine decided on, so the same
//! variant can be recoverable (a CDN substitution is still available) or fatal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for player operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error produced by host-supplied code (modifiers, hooks, CDM).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Network,
    Drm,
    Media,
    Manifest,
    Streaming,
    Player,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Network => write!(f, "NETWORK"),
            Category::Drm => write!(f, "DRM"),
            Category::Media => write!(f, "MEDIA"),
            Category::Manifest => write!(f, "MANIFEST"),
            Category::Streaming => write!(f, "STREAMING"),
            Category::Player => write!(f, "PLAYER"),
        }
    }
}

/// Error severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Recoverable,
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Recoverable => write!(f, "RECOVERABLE"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Player error types
#[derive(Error, Debug)]
pub enum Error {
    // Network errors
    #[error("HTTP status {status} from {uri} after {attempts} attempt(s)")]
    BadHttpStatus {
        uri: String,
        status: u16,
        attempts: u32,
        severity: Severity,
    },

    #[error("HTTP request to {uri} failed after {attempts} attempt(s): {message}")]
    HttpError {
        uri: String,
        message: String,
        attempts: u32,
        severity: Severity,
    },

    #[error("Request to {uri} timed out after {attempts} attempt(s)")]
    Timeout {
        uri: String,
        attempts: u32,
        severity: Severity,
    },

    #[error("Request has no candidate URIs")]
    NoUris,

    #[error("Request modifier rejected the request")]
    RequestModifier {
        #[source]
        source: BoxError,
    },

    #[error("Response modifier rejected the response")]
    ResponseModifier {
        #[source]
        source: BoxError,
    },

    #[error("Operation aborted")]
    OperationAborted,

    // DRM errors
    #[error("No license server configured for {key_system}")]
    NoLicenseServer { key_system: String },

    #[error("Key system {key_system} is not available")]
    KeySystemUnavailable { key_system: String },

    #[error("License request failed: {source}")]
    LicenseRequestFailed {
        #[source]
        source: Box<Error>,
        severity: Severity,
    },

    #[error("Server certificate request failed: {source}")]
    CertificateRequestFailed {
        #[source]
        source: Box<Error>,
        severity: Severity,
    },

    #[error("DRM hook `{hook}` failed")]
    DrmHook {
        hook: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("CDM rejected {operation}: {message}")]
    Cdm {
        operation: &'static str,
        message: String,
    },

    #[error("All keys of DRM session {session_id} expired")]
    LicenseExpired { session_id: String },

    #[error("DRM session {session_id} not found")]
    SessionNotFound { session_id: String },

    // Media errors
    #[error("Buffer sink rejected append for {content_type}: {message}")]
    AppendFailed {
        content_type: String,
        message: String,
    },

    // Manifest errors
    #[error("No playable renditions available")]
    NoRenditions,

    #[error("All renditions are restricted by key status or application restrictions")]
    RestrictionsCannotBeMet,

    #[error("Manifest refresh failed: {0}")]
    ManifestRefresh(String),

    #[error("Invalid segment list: {0}")]
    InvalidManifest(String),

    // Streaming errors
    #[error("Playback stalled at {position}s, skipped {skipped}s forward")]
    BufferStall { position: f64, skipped: f64 },

    #[error("Text stream failed: {source}")]
    TextStreamFailed {
        #[source]
        source: Box<Error>,
    },

    // Player errors
    #[error("Load interrupted by a newer load or release")]
    LoadInterrupted,

    #[error("Invalid playback state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Player has no content loaded")]
    NotLoaded,
}

impl Error {
    /// Category this error belongs to
    pub fn category(&self) -> Category {
        match self {
            Error::BadHttpStatus { .. }
            | Error::HttpError { .. }
            | Error::Timeout { .. }
            | Error::NoUris
            | Error::RequestModifier { .. }
            | Error::ResponseModifier { .. } => Category::Network,
            Error::NoLicenseServer { .. }
            | Error::KeySystemUnavailable { .. }
            | Error::LicenseRequestFailed { .. }
            | Error::CertificateRequestFailed { .. }
            | Error::DrmHook { .. }
            | Error::Cdm { .. }
            | Error::LicenseExpired { .. }
            | Error::SessionNotFound { .. } => Category::Drm,
            Error::AppendFailed { .. } => Category::Media,
            Error::NoRenditions
            | Error::RestrictionsCannotBeMet
            | Error::ManifestRefresh(_)
            | Error::InvalidManifest(_) => {
                Category::Manifest
            }
            Error::BufferStall { .. } | Error::TextStreamFailed { .. } => Category::Streaming,
            Error::OperationAborted
            | Error::LoadInterrupted
            | Error::InvalidStateTransition { .. }
            | Error::InvalidConfig(_)
            | Error::NotLoaded => Category::Player,
        }
    }

    /// Severity of this error
    pub fn severity(&self) -> Severity {
        match self {
            Error::BadHttpStatus { severity, .. }
            | Error::HttpError { severity, .. }
            | Error::Timeout { severity, .. }
            | Error::LicenseRequestFailed { severity, .. }
            | Error::CertificateRequestFailed { severity, .. } => *severity,
            Error::BufferStall { .. }
            | Error::TextStreamFailed { .. }
            | Error::ManifestRefresh(_)
            | Error::OperationAborted
            | Error::LoadInterrupted => Severity::Recoverable,
            _ => Severity::Fatal,
        }
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        self.severity() == Severity::Recoverable
    }

    /// Returns true for cancellation caused by session teardown
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::OperationAborted | Error::LoadInterrupted)
    }

    /// Returns the stable error code for reporting
    pub fn code(&self) -> &'static str {
        match self {
            Error::BadHttpStatus { .. } => "BAD_HTTP_STATUS",
            Error::HttpError { .. } => "HTTP_ERROR",
            Error::Timeout { .. } => "TIMEOUT",
            Error::NoUris => "NO_URIS",
            Error::RequestModifier { .. } => "REQUEST_MODIFIER_ERROR",
            Error::ResponseModifier { .. } => "RESPONSE_MODIFIER_ERROR",
            Error::OperationAborted => "OPERATION_ABORTED",
            Error::NoLicenseServer { .. } => "NO_LICENSE_SERVER_GIVEN",
            Error::KeySystemUnavailable { .. } => "REQUESTED_KEY_SYSTEM_UNAVAILABLE",
            Error::LicenseRequestFailed { .. } => "LICENSE_REQUEST_FAILED",
            Error::CertificateRequestFailed { .. } => "SERVER_CERTIFICATE_REQUEST_FAILED",
            Error::DrmHook { .. } => "DRM_HOOK_FAILED",
            Error::Cdm { .. } => "CDM_ERROR",
            Error::LicenseExpired { .. } => "EXPIRED",
            Error::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            Error::AppendFailed { .. } => "MEDIA_SOURCE_OPERATION_FAILED",
            Error::NoRenditions => "NO_RENDITIONS",
            Error::RestrictionsCannotBeMet => "RESTRICTIONS_CANNOT_BE_MET",
            Error::ManifestRefresh(_) => "MANIFEST_REFRESH_FAILED",
            Error::InvalidManifest(_) => "INVALID_MANIFEST",
            Error::BufferStall { .. } => "BUFFER_STALL",
            Error::TextStreamFailed { .. } => "TEXT_STREAM_FAILED",
            Error::LoadInterrupted => "LOAD_INTERRUPTED",
            Error::InvalidStateTransition { .. } => "INVALID_STATE",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::NotLoaded => "NOT_LOADED",
        }
    }

    /// Re-stamp the severity of a network or DRM request failure.
    ///
    /// Variants without a severity field are returned unchanged.
    pub fn with_severity(mut self, new: Severity) -> Self {
        match &mut self {
            Error::BadHttpStatus { severity, .. }
            | Error::HttpError { severity, .. }
            | Error::Timeout { severity, .. }
            | Error::LicenseRequestFailed { severity, .. }
            | Error::CertificateRequestFailed { severity, .. } => *severity = new,
            _ => {}
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_severity_is_carried() {
        let err = Error::BadHttpStatus {
            uri: "https://cdn.example.com/seg1.m4s".to_string(),
            status: 500,
            attempts: 3,
            severity: Severity::Fatal,
        };
        assert_eq!(err.category(), Category::Network);
        assert!(!err.is_recoverable());

        let err = err.with_severity(Severity::Recoverable);
        assert!(err.is_recoverable());
        assert_eq!(err.code(), "BAD_HTTP_STATUS");
    }

    #[test]
    fn test_modifier_errors_are_fatal() {
        let err = Error::RequestModifier {
            source: "bad token".into(),
        };
        assert_eq!(err.severity(), Severity::Fatal);
        assert_eq!(err.code(), "REQUEST_MODIFIER_ERROR");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_abort_is_not_a_network_failure() {
        let err = Error::OperationAborted;
        assert_eq!(err.category(), Category::Player);
        assert!(err.is_aborted());
    }
}
