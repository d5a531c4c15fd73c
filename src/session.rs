//! DRM session contract shared by all backends.
//!
//! A session is created per content protection event for one key system and
//! walks the key exchange: build the native session from init data, hand the
//! CDM challenge to the caller, feed back the license, then decrypt.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::cdm::DecryptParams;
use crate::drm_data::DrmData;
use crate::error::CdmError;
use crate::key::KeyState;

/// Marker separating the message type token from a CDM challenge.
pub const CHALLENGE_TYPE_MARKER: &[u8] = b":Type:";

/// Message type carried in a CDM challenge prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Plain license request (token `0` or no prefix).
    LicenseRequest,
    /// License renewal (token `1`).
    LicenseRenewal,
    /// License release (token `2`).
    LicenseRelease,
    /// Device individualization (token `3` or `individualization-request`).
    Individualization,
    /// Any other token.
    Other(String),
}

impl ChallengeKind {
    pub fn from_token(token: Option<&str>) -> Self {
        match token {
            None | Some("0") => ChallengeKind::LicenseRequest,
            Some("1") => ChallengeKind::LicenseRenewal,
            Some("2") => ChallengeKind::LicenseRelease,
            Some("3") | Some("individualization-request") => ChallengeKind::Individualization,
            Some(other) => ChallengeKind::Other(other.to_string()),
        }
    }
}

/// Split an optional `"<token>:Type:"` prefix off a challenge.
///
/// The prefix is only recognised when the token is non-empty and the marker
/// does not end the payload; otherwise the whole payload is the body.
pub fn split_challenge(payload: &[u8]) -> (Option<&str>, &[u8]) {
    let Some(pos) = payload
        .windows(CHALLENGE_TYPE_MARKER.len())
        .position(|window| window == CHALLENGE_TYPE_MARKER)
    else {
        return (None, payload);
    };

    let body_start = pos + CHALLENGE_TYPE_MARKER.len();
    if pos == 0 || body_start >= payload.len() {
        return (None, payload);
    }

    match std::str::from_utf8(&payload[..pos]) {
        Ok(token) => (Some(token), &payload[body_start..]),
        Err(_) => (None, payload),
    }
}

/// Handle of an external security manager session bound to a DRM session.
///
/// Opaque to this crate and not owned by the session; hosts attach it to
/// relate the two and read it back later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecManagerSession(pub i64);

/// License request produced by [`DrmSession::generate_key_request`].
#[derive(Debug)]
pub struct KeyRequest {
    /// Challenge body to post to the license server.
    pub challenge: DrmData,
    /// License server URL suggested by the CDM (may be empty).
    pub destination_url: String,
    pub kind: ChallengeKind,
}

/// Polymorphic DRM session.
///
/// Timeouts of `Duration::ZERO` wait forever.
pub trait DrmSession: Send + Sync {
    /// Key system this session was created for (e.g. `com.widevine.alpha`).
    fn key_system(&self) -> &str;

    /// Create the native session bound to `init_data`.
    ///
    /// Failures are reported through [`DrmSession::state`], never returned.
    fn generate_drm_session(&self, init_data: &[u8], custom_data: Option<&[u8]>);

    /// Wait up to `timeout` for the CDM challenge.
    fn generate_key_request(&self, timeout: Duration) -> Option<KeyRequest>;

    /// Feed a license response (or `None` when the CDM acquires the key
    /// itself) and wait up to `timeout` for the key status.
    fn process_drm_key(&self, key: Option<&DrmData>, timeout: Duration) -> Result<(), CdmError>;

    /// Decrypt `payload` in place.
    fn decrypt(&self, params: &DecryptParams<'_>, payload: &mut [u8]) -> Result<(), CdmError>;

    fn state(&self) -> KeyState;

    /// Wait once for a state change and report whether `state` is current.
    fn wait_for_state(&self, state: KeyState, timeout: Duration) -> bool;

    /// Close the native session and return to [`KeyState::Init`].
    fn clear_decrypt_context(&self);

    fn set_output_protection(&self, enabled: bool);

    fn output_protection_enabled(&self) -> bool;

    /// Attach (or detach) the security manager session handle.
    fn set_sec_manager_session(&self, handle: Option<SecManagerSession>);

    fn sec_manager_session(&self) -> Option<SecManagerSession>;
}

/// Session for content that needs no decryption.
///
/// Always ready; decrypt leaves the payload untouched.
#[derive(Debug)]
pub struct NullSession {
    key_system: String,
    sec_manager_session: Mutex<Option<SecManagerSession>>,
}

impl NullSession {
    pub fn new(key_system: impl Into<String>) -> Self {
        Self {
            key_system: key_system.into(),
            sec_manager_session: Mutex::new(None),
        }
    }
}

impl DrmSession for NullSession {
    fn key_system(&self) -> &str {
        &self.key_system
    }

    fn generate_drm_session(&self, _init_data: &[u8], _custom_data: Option<&[u8]>) {}

    fn generate_key_request(&self, _timeout: Duration) -> Option<KeyRequest> {
        None
    }

    fn process_drm_key(&self, _key: Option<&DrmData>, _timeout: Duration) -> Result<(), CdmError> {
        Ok(())
    }

    fn decrypt(&self, _params: &DecryptParams<'_>, _payload: &mut [u8]) -> Result<(), CdmError> {
        Ok(())
    }

    fn state(&self) -> KeyState {
        KeyState::Ready
    }

    fn wait_for_state(&self, state: KeyState, _timeout: Duration) -> bool {
        state == KeyState::Ready
    }

    fn clear_decrypt_context(&self) {}

    fn set_output_protection(&self, _enabled: bool) {}

    fn output_protection_enabled(&self) -> bool {
        false
    }

    fn set_sec_manager_session(&self, handle: Option<SecManagerSession>) {
        *self
            .sec_manager_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handle;
    }

    fn sec_manager_session(&self) -> Option<SecManagerSession> {
        *self
            .sec_manager_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
