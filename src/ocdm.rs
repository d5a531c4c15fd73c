//! DRM session over a native CDM binding.
//!
//! [`OcdmSessionAdapter`] drives the key exchange state machine:
//!
//! ```text
//! KEY_INIT -> KEY_PENDING -> KEY_READY
//!                         \-> KEY_ERROR
//! ```
//!
//! The CDM reports challenges and key statuses on its own thread. Callers
//! block on one of three events (challenge ready, key status ready, state
//! changed) with a timeout; the events are independent so a key status
//! update never wakes a thread waiting for a challenge.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::callbacks::DrmCallbacks;
use crate::cdm::{CdmBinding, CdmSession, CdmSystem, DecryptParams, SessionCallbacks};
use crate::drm_data::DrmData;
use crate::error::CdmError;
use crate::event::Event;
use crate::fatal::FatalErrorPolicy;
use crate::helper::DrmHelper;
use crate::key::{key_id_display, KeyState, KeyStatus};
use crate::memory::MemorySystem;
use crate::platform::{hdcp22_violation, OutputProtection};
use crate::session::{split_challenge, ChallengeKind, DrmSession, KeyRequest, SecManagerSession};

/// Collaborators an adapter needs besides its helper.
#[derive(Clone)]
pub struct AdapterDeps {
    pub binding: Arc<dyn CdmBinding>,
    pub output_protection: Arc<dyn OutputProtection>,
    pub callbacks: Option<Arc<dyn DrmCallbacks>>,
    pub fatal_policy: Arc<dyn FatalErrorPolicy>,
}

/// Native handles, guarded by the session mutex.
#[derive(Default)]
struct Native {
    system: Option<Arc<dyn CdmSystem>>,
    session: Option<Arc<dyn CdmSession>>,
    memory_system: Option<Box<dyn MemorySystem>>,
}

#[derive(Default)]
struct PendingChallenge {
    payload: Vec<u8>,
    destination_url: String,
}

#[derive(Default)]
struct KeyMaterial {
    key_id: Vec<u8>,
    /// `None` until a status was computed for `key_id`.
    status: Option<KeyStatus>,
}

struct Shared {
    key_system: &'static str,
    helper: Arc<dyn DrmHelper>,
    deps: AdapterDeps,
    output_protection_enabled: AtomicBool,
    native: Mutex<Native>,
    state: Mutex<KeyState>,
    challenge: Mutex<PendingChallenge>,
    key: Mutex<KeyMaterial>,
    sec_manager_session: Mutex<Option<SecManagerSession>>,
    challenge_ready: Event,
    key_status_ready: Event,
    state_changed: Event,
}

// Callbacks hold a temporary strong handle while they run, so when the host
// drops its last handle mid-callback this runs on the CDM thread and calls
// `CdmSession::close` from inside the callback.
impl Drop for Shared {
    fn drop(&mut self) {
        let native = self.native.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = native.session.take() {
            session.close();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`DrmSession`] backed by a native CDM.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct OcdmSessionAdapter {
    shared: Arc<Shared>,
}

impl OcdmSessionAdapter {
    pub fn new(helper: Arc<dyn DrmHelper>, deps: AdapterDeps) -> Self {
        let memory_system = helper.memory_system();
        Self {
            shared: Arc::new(Shared {
                key_system: helper.ocdm_system_id(),
                helper,
                deps,
                output_protection_enabled: AtomicBool::new(true),
                native: Mutex::new(Native {
                    memory_system,
                    ..Default::default()
                }),
                state: Mutex::new(KeyState::Init),
                challenge: Mutex::new(PendingChallenge::default()),
                key: Mutex::new(KeyMaterial::default()),
                sec_manager_session: Mutex::new(None),
                challenge_ready: Event::new(),
                key_status_ready: Event::new(),
                state_changed: Event::new(),
            }),
        }
    }

    pub fn helper(&self) -> &Arc<dyn DrmHelper> {
        &self.shared.helper
    }

    /// Replace the memory system used around native decrypt.
    pub fn set_memory_system(&self, memory_system: Option<Box<dyn MemorySystem>>) {
        lock(&self.shared.native).memory_system = memory_system;
    }

    /// `false` when decrypt must be refused for output protection reasons.
    pub fn verify_output_protection(&self) -> bool {
        if !self.output_protection_enabled() {
            return true;
        }
        let violation = hdcp22_violation(
            self.shared.helper.is_hdcp22_required(),
            self.shared.deps.output_protection.as_ref(),
        );
        if violation {
            warn!("HDCP 2.2 required for UHD content but the output link is not HDCP 2.2");
        }
        !violation
    }

    fn set_state(&self, state: KeyState) {
        let mut current = lock(&self.shared.state);
        if *current != state {
            debug!("{} session state {} -> {}", self.shared.key_system, *current, state);
        }
        *current = state;
    }

    fn native_session(&self) -> Option<Arc<dyn CdmSession>> {
        lock(&self.shared.native).session.clone()
    }

    fn session_callbacks(&self) -> SessionCallbacks {
        let weak = Arc::downgrade(&self.shared);
        SessionCallbacks {
            challenge: Box::new({
                let weak = weak.clone();
                move |url, payload| {
                    if let Some(adapter) = upgrade(&weak) {
                        adapter.on_challenge(url, payload);
                    }
                }
            }),
            key_update: Box::new({
                let weak = weak.clone();
                move |key_id| {
                    if let Some(adapter) = upgrade(&weak) {
                        adapter.on_key_update(key_id);
                    }
                }
            }),
            error: Box::new({
                let weak = weak.clone();
                move |message| {
                    if let Some(adapter) = upgrade(&weak) {
                        error!("{} CDM error: {}", adapter.shared.key_system, message);
                    }
                }
            }),
            keys_updated: Box::new(move || {
                if let Some(adapter) = upgrade(&weak) {
                    adapter.shared.key_status_ready.signal();
                }
            }),
        }
    }

    fn on_challenge(&self, url: &str, payload: &[u8]) {
        let (token, body) = split_challenge(payload);
        let kind = ChallengeKind::from_token(token);

        if kind == ChallengeKind::Individualization {
            info!("{} individualization request ({} bytes)", self.shared.key_system, body.len());
            if let Some(callbacks) = &self.shared.deps.callbacks {
                callbacks.individualization(body);
            }
        } else {
            {
                let mut challenge = lock(&self.shared.challenge);
                challenge.payload = payload.to_vec();
                challenge.destination_url = url.to_string();
            }
            self.shared.challenge_ready.signal();
        }

        // Renewal notification is independent of the challenge handoff above.
        if kind == ChallengeKind::LicenseRenewal {
            info!("{} license renewal requested", self.shared.key_system);
            if let Some(callbacks) = &self.shared.deps.callbacks {
                callbacks.license_renewal(&self.shared.helper, self);
            }
        }
    }

    fn on_key_update(&self, key_id: &[u8]) {
        // The session lock may be held by the caller thread (or the handle
        // not stored yet); leave the status indeterminate in that case.
        let session = self
            .shared
            .native
            .try_lock()
            .ok()
            .and_then(|native| native.session.clone());

        let mut key = lock(&self.shared.key);
        key.key_id = key_id.to_vec();
        key.status = session.map(|session| session.status(key_id));
        trace!(
            "{} key update {} status {:?}",
            self.shared.key_system,
            key_id_display(key_id),
            key.status
        );
    }

    /// Key status, computed now from the stored key id if the update arrived
    /// before it could be evaluated.
    fn resolve_key_status(&self) -> Option<KeyStatus> {
        let session = self.native_session();
        let mut key = lock(&self.shared.key);
        if key.status.is_none() && !key.key_id.is_empty() {
            if let Some(session) = session {
                key.status = Some(session.status(&key.key_id));
            }
        }
        key.status
    }
}

fn upgrade(weak: &Weak<Shared>) -> Option<OcdmSessionAdapter> {
    weak.upgrade().map(|shared| OcdmSessionAdapter { shared })
}

impl DrmSession for OcdmSessionAdapter {
    fn key_system(&self) -> &str {
        self.shared.key_system
    }

    fn generate_drm_session(&self, init_data: &[u8], custom_data: Option<&[u8]>) {
        let mut native = lock(&self.shared.native);

        let system = match &native.system {
            Some(system) => system.clone(),
            None => match self.shared.deps.binding.create_system(self.shared.key_system) {
                Some(system) => {
                    native.system = Some(system.clone());
                    system
                }
                None => {
                    error!("Failed to create CDM system for {}", self.shared.key_system);
                    self.set_state(KeyState::Error);
                    return;
                }
            },
        };

        // A previous exchange must not feed challenges or key updates into
        // this one.
        if let Some(previous) = native.session.take() {
            debug!("{} closing previous CDM session {}", self.shared.key_system, previous.id());
            previous.close();
        }

        *lock(&self.shared.key) = KeyMaterial::default();
        self.shared.challenge_ready.reset();
        self.shared.key_status_ready.reset();

        match system.construct_session(init_data, custom_data, self.session_callbacks()) {
            Ok(session) => {
                let session_id = session.id();
                if session_id.is_empty() {
                    error!("{} CDM session has an empty session id", self.shared.key_system);
                    session.close();
                    self.set_state(KeyState::ErrorEmptySessionId);
                    return;
                }
                info!("{} CDM session {} created", self.shared.key_system, session_id);
                native.session = Some(Arc::from(session));
            }
            Err(status) => {
                error!(
                    "Failed to construct {} CDM session: status {}",
                    self.shared.key_system, status
                );
                self.set_state(KeyState::Error);
            }
        }
    }

    fn generate_key_request(&self, timeout: Duration) -> Option<KeyRequest> {
        // Pessimistic: only a delivered challenge upgrades to pending.
        self.set_state(KeyState::Error);

        if !self.shared.challenge_ready.wait(timeout) {
            warn!(
                "{} timed out after {:?} waiting for a key request",
                self.shared.key_system, timeout
            );
            return None;
        }

        let (payload, destination_url) = {
            let mut challenge = lock(&self.shared.challenge);
            (
                std::mem::take(&mut challenge.payload),
                std::mem::take(&mut challenge.destination_url),
            )
        };
        if payload.is_empty() {
            warn!("{} delivered an empty key request", self.shared.key_system);
            return None;
        }

        let (token, body) = split_challenge(&payload);
        let request = KeyRequest {
            challenge: DrmData::from_slice(body),
            destination_url,
            kind: ChallengeKind::from_token(token),
        };
        debug!(
            "{} key request {:?} ({} bytes) for {}",
            self.shared.key_system,
            request.kind,
            request.challenge.len(),
            request.destination_url
        );
        self.set_state(KeyState::Pending);
        Some(request)
    }

    fn process_drm_key(&self, key: Option<&DrmData>, timeout: Duration) -> Result<(), CdmError> {
        match key {
            Some(key) => match self.native_session() {
                Some(session) => {
                    if let Err(status) = session.update(key.data()) {
                        warn!("{} session update failed: status {}", self.shared.key_system, status);
                    }
                }
                None => error!("{} has no CDM session to update", self.shared.key_system),
            },
            None => debug!("{} key acquired by the CDM, skipping update", self.shared.key_system),
        }

        if !self.shared.key_status_ready.wait(timeout) {
            warn!(
                "{} timed out after {:?} waiting for key status",
                self.shared.key_system, timeout
            );
        }

        let result = match self.resolve_key_status() {
            Some(KeyStatus::Usable) => {
                info!("{} key is usable", self.shared.key_system);
                self.set_state(KeyState::Ready);
                Ok(())
            }
            Some(KeyStatus::HwError) => {
                self.set_state(KeyState::Error);
                self.shared.deps.fatal_policy.on_hardware_error(self.shared.key_system);
                Err(CdmError::Status(KeyStatus::HwError.code()))
            }
            Some(KeyStatus::OutputRestricted) => {
                self.set_state(KeyState::Error);
                Err(CdmError::OutputProtection)
            }
            Some(KeyStatus::OutputRestrictedHdcp22) => {
                self.set_state(KeyState::Error);
                Err(CdmError::HdcpCompliance)
            }
            Some(status) => {
                self.set_state(KeyState::Error);
                Err(CdmError::Status(status.code()))
            }
            None => {
                self.set_state(KeyState::Error);
                Err(CdmError::Timeout)
            }
        };
        if let Err(e) = &result {
            error!("{} key processing failed: {} (code {})", self.shared.key_system, e, e.code());
        }

        self.shared.state_changed.signal();
        result
    }

    fn decrypt(&self, params: &DecryptParams<'_>, payload: &mut [u8]) -> Result<(), CdmError> {
        if !self.verify_output_protection() {
            return Err(CdmError::HdcpCompliance);
        }

        // The native call runs under the session lock so a concurrent
        // clear_decrypt_context cannot tear the handle down mid-decrypt.
        let mut native = lock(&self.shared.native);
        let Native {
            session,
            memory_system,
            ..
        } = &mut *native;
        let session = session.as_ref().ok_or(CdmError::NoSession)?;

        let Some(memory_system) = memory_system.as_mut() else {
            return session.decrypt(params, payload).map_err(CdmError::Status);
        };

        let mut encoded = memory_system.encode(payload).ok_or_else(|| {
            error!("{} memory system encode failed", self.shared.key_system);
            CdmError::MemorySystem
        })?;

        if let Err(status) = session.decrypt(params, &mut encoded) {
            memory_system.terminate_early();
            return Err(CdmError::Status(status));
        }

        if !memory_system.decode(&encoded, payload) {
            error!("{} memory system decode failed", self.shared.key_system);
            return Err(CdmError::MemorySystem);
        }
        Ok(())
    }

    fn state(&self) -> KeyState {
        *lock(&self.shared.state)
    }

    fn wait_for_state(&self, state: KeyState, timeout: Duration) -> bool {
        if self.state() == state {
            return true;
        }
        self.shared.state_changed.wait(timeout);
        self.state() == state
    }

    fn clear_decrypt_context(&self) {
        let mut native = lock(&self.shared.native);
        if let Some(session) = native.session.take() {
            debug!("{} closing CDM session {}", self.shared.key_system, session.id());
            session.close();
        }
        *lock(&self.shared.key) = KeyMaterial::default();
        self.set_state(KeyState::Init);
    }

    fn set_output_protection(&self, enabled: bool) {
        self.shared
            .output_protection_enabled
            .store(enabled, Ordering::Relaxed);
    }

    fn output_protection_enabled(&self) -> bool {
        self.shared.output_protection_enabled.load(Ordering::Relaxed)
    }

    fn set_sec_manager_session(&self, handle: Option<SecManagerSession>) {
        *lock(&self.shared.sec_manager_session) = handle;
    }

    fn sec_manager_session(&self) -> Option<SecManagerSession> {
        *lock(&self.shared.sec_manager_session)
    }
}
