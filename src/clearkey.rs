//! In-process W3C clear key session.
//!
//! The key request is the clear key JSON (`{"kids":[...],"type":"temporary"}`)
//! and the license is a JSON Web Key set. Samples are decrypted with
//! AES-128-CTR following CENC subsample layout.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use aes::Aes128;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ctr::cipher::{KeyIvInit, StreamCipher};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cdm::{DecryptParams, EncryptionScheme};
use crate::drm_data::DrmData;
use crate::error::CdmError;
use crate::event::Event;
use crate::helper::DrmHelper;
use crate::key::{key_id_display, KeyState, KeyStatus};
use crate::platform::{hdcp22_violation, OutputProtection};
use crate::pssh::Pssh;
use crate::session::{ChallengeKind, DrmSession, KeyRequest, SecManagerSession};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

#[derive(Debug, Serialize)]
struct LicenseRequest<'a> {
    kids: Vec<String>,
    #[serde(rename = "type")]
    session_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct JsonWebKeySet {
    keys: Vec<JsonWebKey>,
}

#[derive(Debug, Deserialize)]
struct JsonWebKey {
    kty: String,
    k: String,
    #[serde(default)]
    kid: Option<String>,
}

#[derive(Debug)]
struct Inner {
    state: KeyState,
    key_id: Option<Uuid>,
    key: Option<[u8; 16]>,
    sec_manager_session: Option<SecManagerSession>,
}

/// Clear key [`DrmSession`] that decrypts without a CDM.
///
/// Decrypt is still subject to HDCP 2.2 gating against the platform output.
pub struct ClearKeySession {
    helper: Arc<dyn DrmHelper>,
    output_protection: Arc<dyn OutputProtection>,
    output_protection_enabled: AtomicBool,
    inner: Mutex<Inner>,
    state_changed: Event,
}

impl fmt::Debug for ClearKeySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClearKeySession")
            .field("helper", &self.helper)
            .field("output_protection_enabled", &self.output_protection_enabled())
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

/// Decode base64url, tolerating padding and standard alphabet.
fn decode_b64url(value: &str) -> Option<Vec<u8>> {
    let trimmed = value.trim().trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(value.trim()))
        .ok()
}

impl ClearKeySession {
    pub fn new(helper: Arc<dyn DrmHelper>, output_protection: Arc<dyn OutputProtection>) -> Self {
        Self {
            helper,
            output_protection,
            output_protection_enabled: AtomicBool::new(true),
            inner: Mutex::new(Inner {
                state: KeyState::Init,
                key_id: None,
                key: None,
                sec_manager_session: None,
            }),
            state_changed: Event::new(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, inner: &mut Inner, state: KeyState) {
        inner.state = state;
        self.state_changed.signal();
    }

    fn select_key(&self, set: JsonWebKeySet, key_id: Option<Uuid>) -> Option<[u8; 16]> {
        set.keys
            .into_iter()
            .filter(|jwk| jwk.kty == "oct")
            .filter(|jwk| match (key_id, jwk.kid.as_deref().and_then(decode_b64url)) {
                (Some(wanted), Some(kid)) => kid == wanted.as_bytes(),
                _ => true,
            })
            .find_map(|jwk| decode_b64url(&jwk.k)?.try_into().ok())
    }
}

impl DrmSession for ClearKeySession {
    fn key_system(&self) -> &str {
        self.helper.ocdm_system_id()
    }

    fn generate_drm_session(&self, init_data: &[u8], _custom_data: Option<&[u8]>) {
        let key_id = self.helper.key_ids().first().copied().or_else(|| {
            Pssh::parse_bytes(init_data, true)
                .and_then(|pssh| pssh.key_ids())
                .ok()
                .and_then(|ids| ids.first().copied())
        });

        let mut inner = self.inner();
        inner.key = None;
        inner.key_id = key_id;
        match key_id {
            Some(key_id) => {
                debug!("Clear key session for key id {}", key_id);
                inner.state = KeyState::Init;
            }
            None => {
                error!("Clear key init data carries no key id");
                inner.state = KeyState::Error;
            }
        }
    }

    fn generate_key_request(&self, _timeout: Duration) -> Option<KeyRequest> {
        let mut inner = self.inner();
        let Some(key_id) = inner.key_id else {
            inner.state = KeyState::Error;
            return None;
        };

        let request = LicenseRequest {
            kids: vec![URL_SAFE_NO_PAD.encode(key_id.as_bytes())],
            session_type: "temporary",
        };
        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to build clear key request: {}", e);
                inner.state = KeyState::Error;
                return None;
            }
        };

        inner.state = KeyState::Pending;
        Some(KeyRequest {
            challenge: DrmData::from(body),
            destination_url: self.helper.license_server_url().unwrap_or_default().to_string(),
            kind: ChallengeKind::LicenseRequest,
        })
    }

    fn process_drm_key(&self, key: Option<&DrmData>, _timeout: Duration) -> Result<(), CdmError> {
        let mut inner = self.inner();

        let Some(key) = key else {
            error!("Clear key sessions need the license in-band");
            self.finish(&mut inner, KeyState::Error);
            return Err(CdmError::Status(KeyStatus::InternalError.code()));
        };

        let selected = serde_json::from_slice::<JsonWebKeySet>(key.data())
            .map_err(|e| warn!("Invalid clear key license: {}", e))
            .ok()
            .and_then(|set| self.select_key(set, inner.key_id));

        match selected {
            Some(content_key) => {
                inner.key = Some(content_key);
                self.finish(&mut inner, KeyState::Ready);
                Ok(())
            }
            None => {
                error!("Clear key license has no usable key");
                self.finish(&mut inner, KeyState::Error);
                Err(CdmError::Status(KeyStatus::InternalError.code()))
            }
        }
    }

    fn decrypt(&self, params: &DecryptParams<'_>, payload: &mut [u8]) -> Result<(), CdmError> {
        let required = self.helper.is_hdcp22_required();
        if self.output_protection_enabled()
            && hdcp22_violation(required, self.output_protection.as_ref())
        {
            warn!("HDCP 2.2 required for UHD content but the output link is not HDCP 2.2");
            return Err(CdmError::HdcpCompliance);
        }

        let inner = self.inner();
        let key = inner.key.ok_or(CdmError::NoSession)?;

        if params.scheme != EncryptionScheme::Cenc {
            warn!("Clear key session only supports cenc");
            return Err(CdmError::Status(KeyStatus::InternalError.code()));
        }
        if let (Some(expected), false) = (inner.key_id, params.key_id.is_empty()) {
            if params.key_id != expected.as_bytes() {
                warn!("No clear key for key id {}", key_id_display(params.key_id));
                return Err(CdmError::Status(KeyStatus::InternalError.code()));
            }
        }

        // 8-byte CENC IVs are the high half of the counter block.
        let mut iv = [0u8; 16];
        match params.iv.len() {
            8 | 16 => iv[..params.iv.len()].copy_from_slice(params.iv),
            other => {
                warn!("Unsupported IV length {}", other);
                return Err(CdmError::Status(KeyStatus::InternalError.code()));
            }
        }

        let mut cipher = Aes128Ctr::new(&key.into(), &iv.into());
        if params.subsamples.is_empty() {
            cipher.apply_keystream(payload);
            return Ok(());
        }

        let mut offset = 0usize;
        for subsample in params.subsamples {
            let start = offset + subsample.clear_bytes as usize;
            let end = start + subsample.encrypted_bytes as usize;
            if end > payload.len() {
                warn!("Subsample layout exceeds payload ({} > {})", end, payload.len());
                return Err(CdmError::Status(KeyStatus::InternalError.code()));
            }
            cipher.apply_keystream(&mut payload[start..end]);
            offset = end;
        }
        Ok(())
    }

    fn state(&self) -> KeyState {
        self.inner().state
    }

    fn wait_for_state(&self, state: KeyState, timeout: Duration) -> bool {
        if self.state() == state {
            return true;
        }
        self.state_changed.wait(timeout);
        self.state() == state
    }

    fn clear_decrypt_context(&self) {
        let mut inner = self.inner();
        inner.key = None;
        inner.state = KeyState::Init;
    }

    fn set_output_protection(&self, enabled: bool) {
        self.output_protection_enabled.store(enabled, Ordering::Relaxed);
    }

    fn output_protection_enabled(&self) -> bool {
        self.output_protection_enabled.load(Ordering::Relaxed)
    }

    fn set_sec_manager_session(&self, handle: Option<SecManagerSession>) {
        self.inner().sec_manager_session = handle;
    }

    fn sec_manager_session(&self) -> Option<SecManagerSession> {
        self.inner().sec_manager_session
    }
}
