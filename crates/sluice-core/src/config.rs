//! Player configuration
//!
//! Configuration is plain data. A host builds it by merging a partial JSON
//! document over the defaults ([`PlayerConfiguration::merge`]); the result is
//! validated once when a session starts.

use crate::error::{Error, Result};
use crate::track::Rendition;
use crate::types::KeySystem;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use url::Url;

/// Longest value accepted for any configured duration (seconds)
const MAX_SECONDS: f64 = 365.0 * 86_400.0;

fn check_seconds(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=MAX_SECONDS).contains(&value) {
        return Err(Error::InvalidConfig(format!(
            "{name} must be within [0, {MAX_SECONDS}] seconds, got {value}"
        )));
    }
    Ok(())
}

/// Retry behaviour of one class of requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AttemptParameters {
    /// Multiplier applied to the delay after every failed attempt
    pub backoff_factor: f64,
    /// Delay before the first retry (milliseconds)
    pub base_delay: u64,
    /// Relative random jitter applied to every delay, in [0, 1]
    pub fuzz_factor: f64,
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Per-attempt timeout (milliseconds, 0 = unlimited)
    pub timeout: u64,
    /// Status codes that fail immediately without a retry
    pub fatal_status_codes: BTreeSet<u16>,
}

impl Default for AttemptParameters {
    fn default() -> Self {
        Self {
            backoff_factor: 2.0,
            base_delay: 1000,
            fuzz_factor: 0.5,
            max_attempts: 2,
            timeout: 30_000,
            fatal_status_codes: BTreeSet::new(),
        }
    }
}

impl AttemptParameters {
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::InvalidConfig(format!("{name}.maxAttempts must be at least 1")));
        }
        if !(0.0..=1.0).contains(&self.fuzz_factor) {
            return Err(Error::InvalidConfig(format!("{name}.fuzzFactor must be within [0, 1]")));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(Error::InvalidConfig(format!("{name}.backoffFactor must be a finite value of at least 1")));
        }
        Ok(())
    }
}

/// Buffering, gap and live-edge behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamingConfiguration {
    /// Seconds of content to keep buffered ahead of the playhead
    pub buffering_goal: f64,
    /// Seconds required to start or resume playback
    pub rebuffering_goal: f64,
    /// Seconds of content kept behind the playhead
    pub buffer_behind: f64,
    /// Gaps up to this size are jumped silently (seconds)
    pub small_gap_limit: f64,
    /// Jump gaps larger than `small_gap_limit` unless the event is prevented
    pub jump_large_gaps: bool,
    pub stall_enabled: bool,
    /// Seconds without playhead movement before a stall is declared
    pub stall_threshold: f64,
    /// Seconds skipped forward to recover from a stall
    pub stall_skip: f64,
    /// Margin kept from the live edge when seeking to it (seconds)
    pub safe_seek_offset: f64,
    pub enable_live_edge_chasing: bool,
    pub chase_jump_distance: f64,
    pub start_chasing_at: f64,
    pub stop_chasing_at: f64,
    pub chasing_rate: f64,
    /// Live manifest refresh period (seconds); derived from segment durations when unset
    pub live_refresh_period: Option<f64>,
    pub ignore_text_stream_failures: bool,
    /// Interval of the playhead/gap/chase evaluation loop (seconds)
    pub tick_interval: f64,
}

impl Default for StreamingConfiguration {
    fn default() -> Self {
        Self {
            buffering_goal: 10.0,
            rebuffering_goal: 2.0,
            buffer_behind: 30.0,
            small_gap_limit: 0.5,
            jump_large_gaps: false,
            stall_enabled: true,
            stall_threshold: 1.0,
            stall_skip: 0.1,
            safe_seek_offset: 5.0,
            enable_live_edge_chasing: false,
            chase_jump_distance: 10.0,
            start_chasing_at: 4.0,
            stop_chasing_at: 1.0,
            chasing_rate: 1.1,
            live_refresh_period: None,
            ignore_text_stream_failures: false,
            tick_interval: 0.25,
        }
    }
}

impl StreamingConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.rebuffering_goal < 0.0 || self.buffering_goal <= 0.0 {
            return Err(Error::InvalidConfig("buffering goals must be positive".into()));
        }
        if self.rebuffering_goal > self.buffering_goal {
            return Err(Error::InvalidConfig(
                "streaming.rebufferingGoal must not exceed streaming.bufferingGoal".into(),
            ));
        }
        if self.enable_live_edge_chasing {
            if !(self.chase_jump_distance > self.start_chasing_at
                && self.start_chasing_at > self.stop_chasing_at)
            {
                return Err(Error::InvalidConfig(
                    "live chasing requires chaseJumpDistance > startChasingAt > stopChasingAt".into(),
                ));
            }
            if self.chasing_rate <= 0.0 {
                return Err(Error::InvalidConfig("streaming.chasingRate must be positive".into()));
            }
        }
        if self.tick_interval <= 0.0 {
            return Err(Error::InvalidConfig("streaming.tickInterval must be positive".into()));
        }
        check_seconds("streaming.bufferingGoal", self.buffering_goal)?;
        check_seconds("streaming.bufferBehind", self.buffer_behind)?;
        check_seconds("streaming.smallGapLimit", self.small_gap_limit)?;
        check_seconds("streaming.stallThreshold", self.stall_threshold)?;
        check_seconds("streaming.stallSkip", self.stall_skip)?;
        check_seconds("streaming.safeSeekOffset", self.safe_seek_offset)?;
        check_seconds("streaming.tickInterval", self.tick_interval)?;
        if let Some(period) = self.live_refresh_period {
            check_seconds("streaming.liveRefreshPeriod", period)?;
        }
        Ok(())
    }
}

/// Rendition restrictions applied before ABR selection (0 = unrestricted maximum)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AbrRestrictions {
    pub min_bandwidth: u64,
    pub max_bandwidth: u64,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub min_pixels: u64,
    pub max_pixels: u64,
}

impl AbrRestrictions {
    /// True if the rendition satisfies every restriction
    pub fn allows(&self, rendition: &Rendition) -> bool {
        fn within(value: u64, min: u64, max: u64) -> bool {
            value >= min && (max == 0 || value <= max)
        }

        if !within(rendition.bandwidth, self.min_bandwidth, self.max_bandwidth) {
            return false;
        }
        match rendition.resolution {
            Some(res) => {
                within(res.width as u64, self.min_width as u64, self.max_width as u64)
                    && within(res.height as u64, self.min_height as u64, self.max_height as u64)
                    && within(res.pixels(), self.min_pixels, self.max_pixels)
            }
            None => true,
        }
    }

    fn validate(&self) -> Result<()> {
        let pairs = [
            ("Bandwidth", self.min_bandwidth, self.max_bandwidth),
            ("Width", self.min_width as u64, self.max_width as u64),
            ("Height", self.min_height as u64, self.max_height as u64),
            ("Pixels", self.min_pixels, self.max_pixels),
        ];
        for (name, min, max) in pairs {
            if max != 0 && min > max {
                return Err(Error::InvalidConfig(format!(
                    "abr.restrictions.min{name} exceeds max{name}"
                )));
            }
        }
        Ok(())
    }
}

/// Bandwidth estimation and rendition switching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AbrConfiguration {
    pub enabled: bool,
    /// Estimate used until enough data has been sampled (bps)
    pub default_bandwidth_estimate: u64,
    /// Upgrade only to renditions below `estimate * bandwidthUpgradeTarget`
    pub bandwidth_upgrade_target: f64,
    /// Keep the current rendition while it stays below `estimate * bandwidthDowngradeTarget`
    pub bandwidth_downgrade_target: f64,
    /// Minimum seconds between two adaptive switches
    pub switch_interval: f64,
    pub use_switch_interval_for_initial_switch: bool,
    pub restrictions: AbrRestrictions,
    /// Half-life of the short-term estimate (seconds of transfer)
    pub fast_half_life: f64,
    /// Half-life of the long-term estimate (seconds of transfer)
    pub slow_half_life: f64,
    /// Traces smaller than this do not feed the estimate
    pub min_bytes_for_estimate: u64,
    /// Transfer time required before the sampled estimate replaces the default
    pub min_total_time_ms: f64,
}

impl Default for AbrConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            default_bandwidth_estimate: 1_000_000,
            bandwidth_upgrade_target: 0.85,
            bandwidth_downgrade_target: 0.95,
            switch_interval: 8.0,
            use_switch_interval_for_initial_switch: false,
            restrictions: AbrRestrictions::default(),
            fast_half_life: 2.0,
            slow_half_life: 5.0,
            min_bytes_for_estimate: 16_000,
            min_total_time_ms: 200.0,
        }
    }
}

impl AbrConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.bandwidth_upgrade_target <= 0.0 || self.bandwidth_downgrade_target <= 0.0 {
            return Err(Error::InvalidConfig("abr bandwidth targets must be positive".into()));
        }
        if self.bandwidth_upgrade_target > self.bandwidth_downgrade_target {
            return Err(Error::InvalidConfig(
                "abr.bandwidthUpgradeTarget must not exceed abr.bandwidthDowngradeTarget".into(),
            ));
        }
        if self.switch_interval < 0.0 {
            return Err(Error::InvalidConfig("abr.switchInterval must not be negative".into()));
        }
        if self.fast_half_life <= 0.0 || self.slow_half_life <= 0.0 {
            return Err(Error::InvalidConfig("abr half-lives must be positive".into()));
        }
        self.restrictions.validate()
    }
}

/// Per key system DRM settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdvancedDrmConfiguration {
    pub server_certificate_uri: Option<Url>,
    /// Pre-provisioned server certificate
    #[serde(skip)]
    pub server_certificate: Option<bytes::Bytes>,
    /// Seconds after license acquisition at which a renewal is forced (0 = off)
    pub ldl_delay: f64,
    /// "temporary" or "persistent-license"
    pub session_type: String,
}

/// License acquisition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DrmConfiguration {
    /// License server per key system name
    pub servers: HashMap<String, Url>,
    /// Advanced settings per key system name
    pub advanced: HashMap<String, AdvancedDrmConfiguration>,
    /// ClearKey keys (hex key id -> hex key)
    pub clear_keys: HashMap<String, String>,
    /// Collapse all encrypted events of one asset into a single session
    pub enforce_single_session: bool,
    /// Cache FairPlay SKD sessions by init data fingerprint
    pub enable_session_cache_for_skd: bool,
    /// Key systems in preference order
    pub preferred_key_systems: Vec<String>,
}

impl Default for DrmConfiguration {
    fn default() -> Self {
        Self {
            servers: HashMap::new(),
            advanced: HashMap::new(),
            clear_keys: HashMap::new(),
            enforce_single_session: false,
            enable_session_cache_for_skd: true,
            preferred_key_systems: Vec::new(),
        }
    }
}

impl DrmConfiguration {
    /// Configuration with a single license server
    pub fn with_server(key_system: KeySystem, uri: Url) -> Self {
        let mut config = Self::default();
        config.servers.insert(key_system.name().to_string(), uri);
        config
    }

    pub fn server_for(&self, key_system: KeySystem) -> Option<&Url> {
        self.servers.get(key_system.name())
    }

    pub fn advanced_for(&self, key_system: KeySystem) -> AdvancedDrmConfiguration {
        self.advanced.get(key_system.name()).cloned().unwrap_or_default()
    }

    /// Check if any DRM is configured
    pub fn is_configured(&self) -> bool {
        !self.servers.is_empty() || !self.clear_keys.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        for (name, advanced) in &self.advanced {
            check_seconds(&format!("drm.advanced.{name}.ldlDelay"), advanced.ldl_delay)?;
        }
        for name in self.servers.keys().chain(self.preferred_key_systems.iter()) {
            if KeySystem::from_name(name).is_none() {
                return Err(Error::InvalidConfig(format!("unknown key system {name}")));
            }
        }
        Ok(())
    }
}

/// Complete player configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerConfiguration {
    pub streaming: StreamingConfiguration,
    pub abr: AbrConfiguration,
    pub drm: DrmConfiguration,
    pub manifest_retry: AttemptParameters,
    pub segment_retry: AttemptParameters,
    pub license_retry: AttemptParameters,
    pub preferred_audio_language: Option<String>,
    pub preferred_text_language: Option<String>,
}

impl PlayerConfiguration {
    /// Deep-merge a partial JSON document over the defaults and validate the result.
    pub fn merge(overrides: serde_json::Value) -> Result<Self> {
        Self::default().merged_with(overrides)
    }

    /// Deep-merge a partial JSON document over this configuration and validate the result.
    pub fn merged_with(&self, overrides: serde_json::Value) -> Result<Self> {
        let mut base = serde_json::to_value(self)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        merge_json(&mut base, overrides);
        let mut merged: PlayerConfiguration = serde_json::from_value(base)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        // Certificates are not representable in JSON; carry them over.
        for (name, advanced) in &self.drm.advanced {
            if let Some(cert) = &advanced.server_certificate {
                merged
                    .drm
                    .advanced
                    .entry(name.clone())
                    .or_default()
                    .server_certificate = Some(cert.clone());
            }
        }
        merged.validate()?;
        Ok(merged)
    }

    pub fn validate(&self) -> Result<()> {
        self.streaming.validate()?;
        self.abr.validate()?;
        self.drm.validate()?;
        self.manifest_retry.validate("manifestRetry")?;
        self.segment_retry.validate("segmentRetry")?;
        self.license_retry.validate("licenseRetry")?;
        Ok(())
    }
}

fn merge_json(base: &mut serde_json::Value, overrides: serde_json::Value) {
    match (base, overrides) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overrides) => *base = overrides,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_are_valid() {
        assert!(PlayerConfiguration::default().validate().is_ok());
    }

    #[test]
    fn test_merge_keeps_unspecified_defaults() {
        let config = PlayerConfiguration::merge(json!({
            "streaming": { "bufferingGoal": 30.0 },
            "segmentRetry": { "maxAttempts": 5, "fatalStatusCodes": [403, 404] }
        }))
        .unwrap();

        assert_eq!(config.streaming.buffering_goal, 30.0);
        assert_eq!(config.streaming.rebuffering_goal, 2.0);
        assert_eq!(config.segment_retry.max_attempts, 5);
        assert_eq!(config.segment_retry.base_delay, 1000);
        assert!(config.segment_retry.fatal_status_codes.contains(&404));
        assert_eq!(config.abr.bandwidth_upgrade_target, 0.85);
    }

    #[test]
    fn test_chase_ordering_validated() {
        let err = PlayerConfiguration::merge(json!({
            "streaming": {
                "enableLiveEdgeChasing": true,
                "chaseJumpDistance": 3.0,
                "startChasingAt": 4.0,
                "stopChasingAt": 1.0
            }
        }))
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");

        // Not validated while chasing is off
        assert!(PlayerConfiguration::merge(json!({
            "streaming": { "chaseJumpDistance": 3.0 }
        }))
        .is_ok());
    }

    #[test]
    fn test_attempt_parameters_validated() {
        assert!(PlayerConfiguration::merge(json!({ "licenseRetry": { "maxAttempts": 0 } })).is_err());
        assert!(PlayerConfiguration::merge(json!({ "segmentRetry": { "fuzzFactor": 1.5 } })).is_err());
    }

    #[test]
    fn test_unbounded_durations_rejected() {
        let err = PlayerConfiguration::merge(json!({
            "drm": { "advanced": { "org.w3.clearkey": { "ldlDelay": 1e300 } } }
        }))
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");

        assert!(PlayerConfiguration::merge(json!({ "streaming": { "stallThreshold": 1e30 } })).is_err());
        assert!(PlayerConfiguration::merge(json!({ "streaming": { "liveRefreshPeriod": -1.0 } })).is_err());

        let mut config = PlayerConfiguration::default();
        config.streaming.tick_interval = f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_key_system_rejected() {
        let err = PlayerConfiguration::merge(json!({
            "drm": { "servers": { "com.example.drm": "https://license.example.com" } }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("com.example.drm"));
    }

    #[test]
    fn test_restrictions_allow() {
        let restrictions = AbrRestrictions {
            max_bandwidth: 3_000_000,
            min_height: 360,
            ..Default::default()
        };
        let ok = Rendition::new(1, 1, crate::types::ContentType::Video, 2_000_000).with_resolution(1280, 720);
        let too_big = Rendition::new(2, 1, crate::types::ContentType::Video, 5_000_000).with_resolution(1920, 1080);
        let too_small = Rendition::new(3, 1, crate::types::ContentType::Video, 300_000).with_resolution(426, 240);
        assert!(restrictions.allows(&ok));
        assert!(!restrictions.allows(&too_big));
        assert!(!restrictions.allows(&too_small));
    }
}
