//! In-process ClearKey CDM
//!
//! License requests and responses use the W3C ClearKey JSON format with
//! base64url (unpadded) key ids and keys. Key ids are kept hex-encoded
//! everywhere else in the crate.

use super::cdm::{Cdm, CdmEvent, CdmEventSender, CdmSession, KeyStatus};
use crate::error::{Error, Result};
use crate::types::{InitData, KeySystem};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct LicenseRequestBody {
    kids: Vec<String>,
    #[serde(rename = "type")]
    session_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonWebKey {
    kty: String,
    kid: String,
    k: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LicenseBody {
    keys: Vec<JsonWebKey>,
    #[serde(rename = "type", default)]
    session_type: Option<String>,
}

fn hex_to_b64url(hex_id: &str) -> Result<String> {
    let raw = hex::decode(hex_id).map_err(|e| Error::Cdm {
        operation: "encode key id",
        message: e.to_string(),
    })?;
    Ok(URL_SAFE_NO_PAD.encode(raw))
}

fn b64url_to_hex(value: &str) -> Result<String> {
    let raw = URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| Error::Cdm {
            operation: "decode key id",
            message: e.to_string(),
        })?;
    Ok(hex::encode(raw))
}

/// Build a ClearKey license from hex key id -> hex key pairs
pub fn license_from_keys(keys: &HashMap<String, String>) -> Result<Bytes> {
    if keys.is_empty() {
        return Err(Error::Cdm {
            operation: "build license",
            message: "no ClearKey keys configured".into(),
        });
    }
    let mut jwks = Vec::with_capacity(keys.len());
    for (kid, key) in keys {
        jwks.push(JsonWebKey {
            kty: "oct".into(),
            kid: hex_to_b64url(kid)?,
            k: hex_to_b64url(key)?,
        });
    }
    let body = LicenseBody {
        keys: jwks,
        session_type: Some("temporary".into()),
    };
    let json = serde_json::to_vec(&body).map_err(|e| Error::Cdm {
        operation: "build license",
        message: e.to_string(),
    })?;
    Ok(Bytes::from(json))
}

/// `keyids` init data for a set of hex key ids
pub fn key_ids_init_data<'a>(key_ids: impl IntoIterator<Item = &'a String>) -> Result<InitData> {
    let kids = key_ids.into_iter().map(|k| hex_to_b64url(k)).collect::<Result<Vec<_>>>()?;
    let json = serde_json::json!({ "kids": kids });
    Ok(InitData::new("keyids", json.to_string().into_bytes()))
}

/// Hex key ids referenced by init data ("keyids" JSON or a version 1 `pssh` box)
pub fn key_ids_from_init_data(init_data: &InitData) -> Result<Vec<String>> {
    match init_data.init_data_type.as_str() {
        "keyids" => {
            let body: serde_json::Value = serde_json::from_slice(&init_data.data).map_err(|e| Error::Cdm {
                operation: "parse init data",
                message: e.to_string(),
            })?;
            body["kids"]
                .as_array()
                .map(|kids| kids.iter().filter_map(|k| k.as_str()).map(b64url_to_hex).collect())
                .unwrap_or_else(|| Ok(Vec::new()))
        }
        "cenc" => Ok(pssh_key_ids(&init_data.data)),
        other => Err(Error::Cdm {
            operation: "parse init data",
            message: format!("unsupported init data type {other}"),
        }),
    }
}

/// Key ids of every version 1 `pssh` box in `data`
fn pssh_key_ids(mut data: &[u8]) -> Vec<String> {
    let mut ids = Vec::new();
    while data.len() >= 8 {
        let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if size < 8 || size > data.len() {
            break;
        }
        let (pssh, rest) = data.split_at(size);
        data = rest;
        // size(4) type(4) version(1) flags(3) system id(16) kid count(4)
        if &pssh[4..8] != b"pssh" || pssh.len() < 32 || pssh[8] == 0 {
            continue;
        }
        let count = u32::from_be_bytes([pssh[28], pssh[29], pssh[30], pssh[31]]) as usize;
        for kid in pssh[32..].chunks_exact(16).take(count) {
            ids.push(hex::encode(kid));
        }
    }
    ids
}

/// ClearKey CDM holding keys in memory
#[derive(Default, Clone)]
pub struct ClearKeyCdm {
    keys: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl ClearKeyCdm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hex key for a hex key id, once a license delivered it
    pub fn key(&self, key_id: &str) -> Option<String> {
        self.keys.lock().get(&key_id.to_lowercase()).map(hex::encode)
    }
}

#[async_trait]
impl Cdm for ClearKeyCdm {
    fn supports(&self, key_system: KeySystem) -> bool {
        key_system == KeySystem::ClearKey
    }

    async fn set_server_certificate(&self, _key_system: KeySystem, _certificate: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn create_session(
        &self,
        key_system: KeySystem,
        session_type: &str,
        events: CdmEventSender,
    ) -> Result<Box<dyn CdmSession>> {
        if key_system != KeySystem::ClearKey {
            return Err(Error::KeySystemUnavailable {
                key_system: key_system.name().to_string(),
            });
        }
        Ok(Box::new(ClearKeySession {
            id: Uuid::new_v4().to_string(),
            session_type: if session_type.is_empty() {
                "temporary".to_string()
            } else {
                session_type.to_string()
            },
            key_ids: Mutex::new(Vec::new()),
            keys: self.keys.clone(),
            events,
        }))
    }
}

struct ClearKeySession {
    id: String,
    session_type: String,
    key_ids: Mutex<Vec<String>>,
    keys: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    events: CdmEventSender,
}

impl ClearKeySession {
    fn request_for(&self, key_ids: &[String]) -> Result<Bytes> {
        let body = LicenseRequestBody {
            kids: key_ids.iter().map(|k| hex_to_b64url(k)).collect::<Result<_>>()?,
            session_type: self.session_type.clone(),
        };
        let json = serde_json::to_vec(&body).map_err(|e| Error::Cdm {
            operation: "generate request",
            message: e.to_string(),
        })?;
        Ok(Bytes::from(json))
    }
}

#[async_trait]
impl CdmSession for ClearKeySession {
    fn session_id(&self) -> String {
        self.id.clone()
    }

    async fn generate_request(&self, init_data: &InitData) -> Result<Bytes> {
        let ids = key_ids_from_init_data(init_data)?;
        *self.key_ids.lock() = ids.clone();
        debug!(session_id = %self.id, key_ids = ids.len(), "ClearKey license request generated");
        self.request_for(&ids)
    }

    async fn update(&self, response: &[u8]) -> Result<()> {
        let license: LicenseBody = serde_json::from_slice(response).map_err(|e| Error::Cdm {
            operation: "update",
            message: format!("invalid ClearKey license: {e}"),
        })?;

        let mut statuses = BTreeMap::new();
        {
            let mut keys = self.keys.lock();
            for jwk in &license.keys {
                if jwk.kty != "oct" {
                    continue;
                }
                let kid = b64url_to_hex(&jwk.kid)?;
                let key = URL_SAFE_NO_PAD
                    .decode(jwk.k.trim_end_matches('='))
                    .map_err(|e| Error::Cdm {
                        operation: "update",
                        message: e.to_string(),
                    })?;
                keys.insert(kid.clone(), key);
                statuses.insert(kid, KeyStatus::Usable);
            }
        }
        if statuses.is_empty() {
            return Err(Error::Cdm {
                operation: "update",
                message: "license carries no keys".into(),
            });
        }
        let _ = self.events.send(CdmEvent::KeyStatusesChanged(statuses));
        Ok(())
    }

    async fn generate_renewal(&self) -> Result<Bytes> {
        let ids = self.key_ids.lock().clone();
        self.request_for(&ids)
    }

    async fn close(&self) -> Result<()> {
        debug!(session_id = %self.id, "ClearKey session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const KID: &str = "00112233445566778899aabbccddeeff";
    const KEY: &str = "0f0e0d0c0b0a09080706050403020100";

    #[test]
    fn test_license_from_keys() {
        let mut keys = HashMap::new();
        keys.insert(KID.to_string(), KEY.to_string());

        let license = license_from_keys(&keys).unwrap();
        let body: LicenseBody = serde_json::from_slice(&license).unwrap();
        assert_eq!(body.keys.len(), 1);
        assert_eq!(body.keys[0].kty, "oct");
        assert_eq!(b64url_to_hex(&body.keys[0].kid).unwrap(), KID);
    }

    #[test]
    fn test_pssh_v1_key_ids() {
        let mut pssh = Vec::new();
        let size: u32 = 32 + 16 + 4;
        pssh.extend_from_slice(&size.to_be_bytes());
        pssh.extend_from_slice(b"pssh");
        pssh.extend_from_slice(&[1, 0, 0, 0]);
        pssh.extend_from_slice(&[0u8; 16]);
        pssh.extend_from_slice(&1u32.to_be_bytes());
        pssh.extend_from_slice(&hex::decode(KID).unwrap());
        pssh.extend_from_slice(&0u32.to_be_bytes());

        let ids = key_ids_from_init_data(&InitData::new("cenc", pssh)).unwrap();
        assert_eq!(ids, vec![KID.to_string()]);
    }

    #[tokio::test]
    async fn test_session_roundtrip_reports_usable_keys() {
        let cdm = ClearKeyCdm::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = cdm.create_session(KeySystem::ClearKey, "", tx).await.unwrap();

        let init = key_ids_init_data([&KID.to_string()]).unwrap();
        let request = session.generate_request(&init).await.unwrap();
        let body: LicenseRequestBody = serde_json::from_slice(&request).unwrap();
        assert_eq!(body.session_type, "temporary");
        assert_eq!(body.kids.len(), 1);

        let mut keys = HashMap::new();
        keys.insert(KID.to_string(), KEY.to_string());
        session.update(&license_from_keys(&keys).unwrap()).await.unwrap();

        match rx.recv().await.unwrap() {
            CdmEvent::KeyStatusesChanged(statuses) => {
                assert_eq!(statuses.get(KID), Some(&KeyStatus::Usable));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(cdm.key(KID).as_deref(), Some(KEY));
    }

    #[tokio::test]
    async fn test_other_key_systems_are_rejected() {
        let cdm = ClearKeyCdm::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!cdm.supports(KeySystem::Widevine));
        assert!(cdm.create_session(KeySystem::Widevine, "", tx).await.is_err());
    }
}
