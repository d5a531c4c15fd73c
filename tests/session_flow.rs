use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use uuid::Uuid;

use rsdrm::callbacks::DrmCallbacks;
use rsdrm::cdm::{CdmBinding, CdmSession, CdmSystem, DecryptParams, NativeStatus, SessionCallbacks};
use rsdrm::config::DrmConfig;
use rsdrm::context::DrmContext;
use rsdrm::fatal::FatalErrorPolicy;
use rsdrm::helper::{ClearKeyHelper, DrmHelper, DrmInfo, WidevineHelper};
use rsdrm::memory::MemorySystem;
use rsdrm::ocdm::{AdapterDeps, OcdmSessionAdapter};
use rsdrm::platform::StaticOutputProtection;
use rsdrm::pssh::{Pssh, SystemId};
use rsdrm::session::{ChallengeKind, SecManagerSession};
use rsdrm::{CdmError, DrmData, DrmSession, KeyRequest, KeyState, KeyStatus, LicenseFetcher};

const KEY_ID: &[u8] = b"0123456789abcdef";
const WAIT: Duration = Duration::from_secs(5);
const SHORT: Duration = Duration::from_millis(30);

/// Scriptable CDM; one instance plays binding, system and session.
struct FakeCdm {
    callbacks: Mutex<Option<SessionCallbacks>>,
    session_id: Mutex<String>,
    no_system: AtomicBool,
    fail_construct: AtomicBool,
    /// Challenge fired from inside `construct_session`.
    challenge_on_construct: Mutex<Option<Vec<u8>>>,
    /// Key update fired from inside `construct_session`.
    key_update_on_construct: AtomicBool,
    /// Fire a key update for `KEY_ID` from inside `update`.
    answer_updates: AtomicBool,
    status: Mutex<KeyStatus>,
    decrypt_failure: Mutex<Option<NativeStatus>>,
    decrypt_delay: Mutex<Duration>,
    in_decrypt: AtomicBool,
    closed_during_decrypt: AtomicBool,
    updates: Mutex<Vec<Vec<u8>>>,
    decrypts: AtomicUsize,
    closes: AtomicUsize,
    close_thread: Mutex<Option<ThreadId>>,
}

impl Default for FakeCdm {
    fn default() -> Self {
        Self {
            callbacks: Mutex::new(None),
            session_id: Mutex::new("fake-session-1".to_string()),
            no_system: AtomicBool::new(false),
            fail_construct: AtomicBool::new(false),
            challenge_on_construct: Mutex::new(None),
            key_update_on_construct: AtomicBool::new(false),
            answer_updates: AtomicBool::new(true),
            status: Mutex::new(KeyStatus::Usable),
            decrypt_failure: Mutex::new(None),
            decrypt_delay: Mutex::new(Duration::ZERO),
            in_decrypt: AtomicBool::new(false),
            closed_during_decrypt: AtomicBool::new(false),
            updates: Mutex::new(Vec::new()),
            decrypts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            close_thread: Mutex::new(None),
        }
    }
}

#[derive(Clone, Default)]
struct Fake(Arc<FakeCdm>);

impl Fake {
    fn fire_challenge(&self, url: &str, payload: &[u8]) {
        let callbacks = self.0.callbacks.lock().unwrap();
        (callbacks.as_ref().expect("session constructed").challenge)(url, payload);
    }

    fn fire_key_update(&self, key_id: &[u8]) {
        let callbacks = self.0.callbacks.lock().unwrap();
        let callbacks = callbacks.as_ref().expect("session constructed");
        (callbacks.key_update)(key_id);
        (callbacks.keys_updated)();
    }

    fn set_status(&self, status: KeyStatus) {
        *self.0.status.lock().unwrap() = status;
    }

    fn updates(&self) -> Vec<Vec<u8>> {
        self.0.updates.lock().unwrap().clone()
    }

    fn decrypts(&self) -> usize {
        self.0.decrypts.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.0.closes.load(Ordering::SeqCst)
    }
}

impl CdmBinding for Fake {
    fn create_system(&self, _key_system: &str) -> Option<Arc<dyn CdmSystem>> {
        if self.0.no_system.load(Ordering::SeqCst) {
            return None;
        }
        Some(Arc::new(self.clone()))
    }
}

impl CdmSystem for Fake {
    fn construct_session(
        &self,
        _init_data: &[u8],
        _custom_data: Option<&[u8]>,
        callbacks: SessionCallbacks,
    ) -> Result<Box<dyn CdmSession>, NativeStatus> {
        if self.0.fail_construct.load(Ordering::SeqCst) {
            return Err(-2);
        }
        if let Some(challenge) = self.0.challenge_on_construct.lock().unwrap().as_deref() {
            (callbacks.challenge)("https://license.example.com", challenge);
        }
        if self.0.key_update_on_construct.load(Ordering::SeqCst) {
            (callbacks.key_update)(KEY_ID);
            (callbacks.keys_updated)();
        }
        *self.0.callbacks.lock().unwrap() = Some(callbacks);
        Ok(Box::new(self.clone()))
    }
}

impl CdmSession for Fake {
    fn id(&self) -> String {
        self.0.session_id.lock().unwrap().clone()
    }

    fn update(&self, response: &[u8]) -> Result<(), NativeStatus> {
        self.0.updates.lock().unwrap().push(response.to_vec());
        if self.0.answer_updates.load(Ordering::SeqCst) {
            self.fire_key_update(KEY_ID);
        }
        Ok(())
    }

    fn status(&self, _key_id: &[u8]) -> KeyStatus {
        *self.0.status.lock().unwrap()
    }

    fn decrypt(&self, _params: &DecryptParams<'_>, payload: &mut [u8]) -> Result<(), NativeStatus> {
        self.0.decrypts.fetch_add(1, Ordering::SeqCst);
        self.0.in_decrypt.store(true, Ordering::SeqCst);
        let delay = *self.0.decrypt_delay.lock().unwrap();
        thread::sleep(delay);
        self.0.in_decrypt.store(false, Ordering::SeqCst);
        if let Some(status) = *self.0.decrypt_failure.lock().unwrap() {
            return Err(status);
        }
        for byte in payload.iter_mut() {
            *byte ^= 0xff;
        }
        Ok(())
    }

    fn close(&self) {
        if self.0.in_decrypt.load(Ordering::SeqCst) {
            self.0.closed_during_decrypt.store(true, Ordering::SeqCst);
        }
        *self.0.close_thread.lock().unwrap() = Some(thread::current().id());
        self.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingPolicy(Mutex<Vec<String>>);

impl FatalErrorPolicy for RecordingPolicy {
    fn on_hardware_error(&self, key_system: &str) {
        self.0.lock().unwrap().push(key_system.to_string());
    }
}

#[derive(Default)]
struct RecordingCallbacks {
    individualization: Mutex<Vec<Vec<u8>>>,
    renewals: Mutex<Vec<String>>,
}

impl DrmCallbacks for RecordingCallbacks {
    fn individualization(&self, payload: &[u8]) {
        self.individualization.lock().unwrap().push(payload.to_vec());
    }

    fn license_renewal(&self, _helper: &Arc<dyn DrmHelper>, session: &dyn DrmSession) {
        self.renewals.lock().unwrap().push(session.key_system().to_string());
    }
}

struct Harness {
    cdm: Fake,
    policy: Arc<RecordingPolicy>,
    callbacks: Arc<RecordingCallbacks>,
    session: OcdmSessionAdapter,
}

fn adapter(
    cdm: &Fake,
    hdcp22_required: bool,
    output: StaticOutputProtection,
    callbacks: Arc<dyn DrmCallbacks>,
    policy: Arc<dyn FatalErrorPolicy>,
) -> OcdmSessionAdapter {
    let helper = WidevineHelper::new(DrmInfo {
        hdcp22_required,
        ..Default::default()
    });
    OcdmSessionAdapter::new(
        Arc::new(helper),
        AdapterDeps {
            binding: Arc::new(cdm.clone()),
            output_protection: Arc::new(output),
            callbacks: Some(callbacks),
            fatal_policy: policy,
        },
    )
}

fn harness_with(hdcp22_required: bool, output: StaticOutputProtection) -> Harness {
    let cdm = Fake::default();
    let policy = Arc::new(RecordingPolicy::default());
    let callbacks = Arc::new(RecordingCallbacks::default());
    let session = adapter(
        &cdm,
        hdcp22_required,
        output,
        callbacks.clone(),
        policy.clone(),
    );
    Harness {
        cdm,
        policy,
        callbacks,
        session,
    }
}

fn harness() -> Harness {
    harness_with(false, StaticOutputProtection::default())
}

/// Harness with a constructed native session.
fn started() -> Harness {
    let h = harness();
    h.session.generate_drm_session(b"init", None);
    assert_eq!(h.session.state(), KeyState::Init);
    h
}

fn license() -> DrmData {
    DrmData::from(b"LICENSE".to_vec())
}

#[test]
fn missing_system_sets_key_error() {
    let h = harness();
    h.cdm.0.no_system.store(true, Ordering::SeqCst);
    h.session.generate_drm_session(b"init", None);
    assert_eq!(h.session.state(), KeyState::Error);
}

#[test]
fn construction_failure_sets_key_error() {
    let h = harness();
    h.cdm.0.fail_construct.store(true, Ordering::SeqCst);
    h.session.generate_drm_session(b"init", None);
    assert_eq!(h.session.state(), KeyState::Error);
}

#[test]
fn empty_session_id_is_reported_and_closed() {
    let h = harness();
    h.cdm.0.session_id.lock().unwrap().clear();
    h.session.generate_drm_session(b"init", None);
    assert_eq!(h.session.state(), KeyState::ErrorEmptySessionId);
    assert_eq!(h.cdm.closes(), 1);
}

#[test]
fn key_request_times_out_into_key_error() {
    let h = started();
    let timeout = Duration::from_millis(100);
    let start = Instant::now();
    assert!(h.session.generate_key_request(timeout).is_none());
    let elapsed = start.elapsed();
    assert!(elapsed >= timeout, "returned after {:?}", elapsed);
    assert!(elapsed < WAIT, "returned after {:?}", elapsed);
    assert_eq!(h.session.state(), KeyState::Error);
}

#[test]
fn regenerating_closes_previous_native_session() {
    let h = started();
    h.session.generate_drm_session(b"init-2", None);
    assert_eq!(h.cdm.closes(), 1);
    assert_eq!(h.session.state(), KeyState::Init);

    h.cdm.fire_challenge("", b"SECOND");
    let request = h.session.generate_key_request(WAIT).expect("key request");
    assert_eq!(request.challenge.data(), b"SECOND");
}

#[test]
fn typed_challenge_is_stripped() {
    let h = started();
    h.cdm.fire_challenge("https://license.example.com", b"0:Type:CHALLENGE");

    let request = h.session.generate_key_request(WAIT).expect("key request");
    assert_eq!(request.challenge.data(), b"CHALLENGE");
    assert_eq!(request.destination_url, "https://license.example.com");
    assert_eq!(request.kind, ChallengeKind::LicenseRequest);
    assert_eq!(h.session.state(), KeyState::Pending);
}

#[test]
fn raw_challenge_is_kept_verbatim() {
    let h = started();
    h.cdm.fire_challenge("", b"RAW-CHALLENGE");

    let request = h.session.generate_key_request(WAIT).expect("key request");
    assert_eq!(request.challenge.data(), b"RAW-CHALLENGE");
    assert!(request.destination_url.is_empty());
}

#[test]
fn challenge_from_cdm_thread_wakes_waiter() {
    let h = started();
    let cdm = h.cdm.clone();
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        cdm.fire_challenge("https://license.example.com", b"LATE");
    });

    let request = h.session.generate_key_request(WAIT).expect("key request");
    assert_eq!(request.challenge.data(), b"LATE");
    sender.join().unwrap();
}

#[test]
fn individualization_goes_to_side_channel_only() {
    let h = started();
    h.cdm.fire_challenge("", b"individualization-request:Type:PROVISION");

    assert_eq!(
        *h.callbacks.individualization.lock().unwrap(),
        vec![b"PROVISION".to_vec()]
    );
    assert!(h.session.generate_key_request(SHORT).is_none());
    assert_eq!(h.session.state(), KeyState::Error);
}

#[test]
fn renewal_notifies_and_still_delivers_challenge() {
    let h = started();
    h.cdm.fire_challenge("", b"1:Type:STANDARDCHALLENGE");

    assert_eq!(
        *h.callbacks.renewals.lock().unwrap(),
        vec!["com.widevine.alpha".to_string()]
    );
    let request = h.session.generate_key_request(WAIT).expect("key request");
    assert_eq!(request.challenge.data(), b"STANDARDCHALLENGE");
    assert_eq!(request.kind, ChallengeKind::LicenseRenewal);
}

#[test]
fn usable_key_makes_session_ready() {
    let h = started();
    h.session
        .process_drm_key(Some(&license()), WAIT)
        .expect("usable key");

    assert_eq!(h.cdm.updates(), vec![b"LICENSE".to_vec()]);
    assert_eq!(h.session.state(), KeyState::Ready);
    assert!(h.session.wait_for_state(KeyState::Ready, SHORT));
}

#[test]
fn no_license_skips_update_but_waits_for_status() {
    let h = started();
    let cdm = h.cdm.clone();
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        cdm.fire_key_update(KEY_ID);
    });

    h.session.process_drm_key(None, WAIT).expect("usable key");
    sender.join().unwrap();
    assert!(h.cdm.updates().is_empty());
    assert_eq!(h.session.state(), KeyState::Ready);
}

#[test]
fn missing_key_status_times_out() {
    let h = started();
    assert_eq!(h.session.process_drm_key(None, SHORT), Err(CdmError::Timeout));
    assert_eq!(h.session.state(), KeyState::Error);
}

#[test]
fn key_update_during_construction_is_resolved_later() {
    let h = harness();
    h.cdm.0.key_update_on_construct.store(true, Ordering::SeqCst);
    h.session.generate_drm_session(b"init", None);

    h.session.process_drm_key(None, WAIT).expect("usable key");
    assert_eq!(h.session.state(), KeyState::Ready);
}

#[test]
fn output_restricted_maps_to_hdcp_codes() {
    let h = started();
    h.cdm.set_status(KeyStatus::OutputRestricted);
    let err = h.session.process_drm_key(Some(&license()), WAIT).unwrap_err();
    assert_eq!(err, CdmError::OutputProtection);
    assert_eq!(err.code(), 4327);
    assert_eq!(h.session.state(), KeyState::Error);

    let h = started();
    h.cdm.set_status(KeyStatus::OutputRestrictedHdcp22);
    let err = h.session.process_drm_key(Some(&license()), WAIT).unwrap_err();
    assert_eq!(err.code(), 4427);
}

#[test]
fn other_status_is_reported_verbatim() {
    let h = started();
    h.cdm.set_status(KeyStatus::Expired);
    assert_eq!(
        h.session.process_drm_key(Some(&license()), WAIT),
        Err(CdmError::Status(KeyStatus::Expired.code()))
    );
    assert!(h.policy.0.lock().unwrap().is_empty());
}

#[test]
fn hardware_error_invokes_fatal_policy() {
    let h = started();
    h.cdm.set_status(KeyStatus::HwError);
    assert_eq!(
        h.session.process_drm_key(Some(&license()), WAIT),
        Err(CdmError::Status(7))
    );
    assert_eq!(
        *h.policy.0.lock().unwrap(),
        vec!["com.widevine.alpha".to_string()]
    );
    assert_eq!(h.session.state(), KeyState::Error);
}

#[test]
fn wait_for_state_wakes_on_key_processing() {
    let h = started();
    let session = h.session.clone();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        session.process_drm_key(Some(&license()), WAIT)
    });

    assert!(h.session.wait_for_state(KeyState::Ready, WAIT));
    assert_eq!(worker.join().unwrap(), Ok(()));
}

#[test]
fn wait_for_state_returns_at_once_when_already_there() {
    let h = started();
    h.session.process_drm_key(Some(&license()), WAIT).unwrap();
    // Consume the latch left by process_drm_key.
    assert!(!h.session.wait_for_state(KeyState::Pending, WAIT));

    let start = Instant::now();
    assert!(h.session.wait_for_state(KeyState::Ready, WAIT));
    assert!(start.elapsed() < Duration::from_secs(1));
}

fn assert_error_wakes_waiter(status: KeyStatus, expected: CdmError) {
    let h = started();
    h.cdm.set_status(status);
    let session = h.session.clone();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        session.process_drm_key(Some(&license()), WAIT)
    });

    let start = Instant::now();
    assert!(!h.session.wait_for_state(KeyState::Ready, WAIT));
    assert!(start.elapsed() < WAIT, "waiter slept through the failure");
    assert_eq!(h.session.state(), KeyState::Error);
    assert_eq!(worker.join().unwrap(), Err(expected));
}

#[test]
fn hardware_error_wakes_state_waiter() {
    assert_error_wakes_waiter(KeyStatus::HwError, CdmError::Status(7));
}

#[test]
fn output_restricted_wakes_state_waiter() {
    assert_error_wakes_waiter(KeyStatus::OutputRestricted, CdmError::OutputProtection);
}

#[test]
fn wait_for_state_reports_mismatch() {
    let h = started();
    assert!(!h.session.wait_for_state(KeyState::Ready, SHORT));
    assert!(h.session.wait_for_state(KeyState::Init, SHORT));
}

#[test]
fn decrypt_refused_without_hdcp22() {
    let uhd_without_hdcp = StaticOutputProtection {
        source_uhd: true,
        hdcp_2_2: false,
    };
    let h = harness_with(true, uhd_without_hdcp);
    h.session.generate_drm_session(b"init", None);
    h.session.process_drm_key(Some(&license()), WAIT).unwrap();

    let mut payload = vec![0u8; 4];
    let err = h
        .session
        .decrypt(&DecryptParams::default(), &mut payload)
        .unwrap_err();
    assert_eq!(err.code(), 4427);
    assert_eq!(h.cdm.decrypts(), 0);

    h.session.set_output_protection(false);
    h.session
        .decrypt(&DecryptParams::default(), &mut payload)
        .expect("gating disabled");
    assert_eq!(h.cdm.decrypts(), 1);
}

#[test]
fn decrypt_without_session_fails() {
    let h = harness();
    let mut payload = vec![1, 2, 3];
    assert_eq!(
        h.session.decrypt(&DecryptParams::default(), &mut payload),
        Err(CdmError::NoSession)
    );
}

#[test]
fn native_decrypt_status_is_returned() {
    let h = started();
    *h.cdm.0.decrypt_failure.lock().unwrap() = Some(-5);
    let mut payload = vec![1, 2, 3];
    assert_eq!(
        h.session.decrypt(&DecryptParams::default(), &mut payload),
        Err(CdmError::Status(-5))
    );
}

/// Prepends a header on encode and strips it on decode.
struct FramedMemory {
    terminated: Arc<AtomicUsize>,
    fail_encode: bool,
}

impl MemorySystem for FramedMemory {
    fn encode(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if self.fail_encode {
            return None;
        }
        let mut framed = vec![0u8; 2];
        framed.extend_from_slice(data);
        Some(framed)
    }

    fn decode(&mut self, data: &[u8], out: &mut [u8]) -> bool {
        if data.len() != out.len() + 2 {
            return false;
        }
        out.copy_from_slice(&data[2..]);
        true
    }

    fn terminate_early(&mut self) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn memory_system_wraps_native_decrypt() {
    let h = started();
    let terminated = Arc::new(AtomicUsize::new(0));
    h.session.set_memory_system(Some(Box::new(FramedMemory {
        terminated: terminated.clone(),
        fail_encode: false,
    })));

    let mut payload = vec![0x00, 0x0f, 0xf0];
    h.session
        .decrypt(&DecryptParams::default(), &mut payload)
        .expect("decrypt");
    assert_eq!(payload, vec![0xff, 0xf0, 0x0f]);

    *h.cdm.0.decrypt_failure.lock().unwrap() = Some(-3);
    assert_eq!(
        h.session.decrypt(&DecryptParams::default(), &mut payload),
        Err(CdmError::Status(-3))
    );
    assert_eq!(terminated.load(Ordering::SeqCst), 1);
}

#[test]
fn memory_system_encode_failure_skips_native_decrypt() {
    let h = started();
    h.session.set_memory_system(Some(Box::new(FramedMemory {
        terminated: Arc::new(AtomicUsize::new(0)),
        fail_encode: true,
    })));

    let mut payload = vec![1, 2, 3];
    let err = h
        .session
        .decrypt(&DecryptParams::default(), &mut payload)
        .unwrap_err();
    assert_eq!(err, CdmError::MemorySystem);
    assert_eq!(err.code(), -1);
    assert_eq!(h.cdm.decrypts(), 0);
}

#[test]
fn clearing_decrypt_context_is_idempotent() {
    let h = started();
    h.session.process_drm_key(Some(&license()), WAIT).unwrap();

    h.session.clear_decrypt_context();
    assert_eq!(h.session.state(), KeyState::Init);
    h.session.clear_decrypt_context();
    assert_eq!(h.session.state(), KeyState::Init);
    assert_eq!(h.cdm.closes(), 1);
}

#[test]
fn clear_waits_for_running_decrypt() {
    let h = started();
    *h.cdm.0.decrypt_delay.lock().unwrap() = Duration::from_millis(100);

    let session = h.session.clone();
    let decryptor = thread::spawn(move || {
        let mut payload = vec![0u8; 4];
        session.decrypt(&DecryptParams::default(), &mut payload)
    });
    while !h.cdm.0.in_decrypt.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }

    h.session.clear_decrypt_context();
    assert_eq!(decryptor.join().unwrap(), Ok(()));
    assert!(!h.cdm.0.closed_during_decrypt.load(Ordering::SeqCst));
    assert_eq!(h.cdm.closes(), 1);
    assert_eq!(h.session.state(), KeyState::Init);

    let mut payload = vec![0u8; 4];
    assert_eq!(
        h.session.decrypt(&DecryptParams::default(), &mut payload),
        Err(CdmError::NoSession)
    );
}

/// Renewal side channel that parks the CDM thread until released.
struct ParkingRenewal(Arc<Barrier>);

impl DrmCallbacks for ParkingRenewal {
    fn individualization(&self, _payload: &[u8]) {}

    fn license_renewal(&self, _helper: &Arc<dyn DrmHelper>, _session: &dyn DrmSession) {
        self.0.wait();
        self.0.wait();
    }
}

#[test]
fn handle_dropped_during_callback_closes_on_cdm_thread() {
    let cdm = Fake::default();
    let barrier = Arc::new(Barrier::new(2));
    let session = adapter(
        &cdm,
        false,
        StaticOutputProtection::default(),
        Arc::new(ParkingRenewal(barrier.clone())),
        Arc::new(RecordingPolicy::default()),
    );
    session.generate_drm_session(b"init", None);

    let firer = cdm.clone();
    let cdm_thread = thread::spawn(move || {
        firer.fire_challenge("", b"1:Type:RENEW");
        thread::current().id()
    });

    barrier.wait();
    drop(session);
    assert_eq!(cdm.closes(), 0);
    barrier.wait();

    let cdm_thread_id = cdm_thread.join().unwrap();
    assert_eq!(cdm.closes(), 1);
    assert_eq!(*cdm.0.close_thread.lock().unwrap(), Some(cdm_thread_id));
}

#[test]
fn sec_manager_handle_is_kept_across_exchanges() {
    let h = started();
    assert_eq!(h.session.sec_manager_session(), None);
    h.session.set_sec_manager_session(Some(SecManagerSession(7)));

    h.session.clear_decrypt_context();
    h.session.generate_drm_session(b"init-2", None);
    assert_eq!(h.session.sec_manager_session(), Some(SecManagerSession(7)));

    h.session.set_sec_manager_session(None);
    assert_eq!(h.session.sec_manager_session(), None);
}

#[test]
fn dropping_last_handle_closes_native_session() {
    let h = started();
    let cdm = h.cdm.clone();
    drop(h);
    assert_eq!(cdm.closes(), 1);
}

struct EchoServer;

impl LicenseFetcher for EchoServer {
    fn fetch(
        &self,
        _helper: &dyn DrmHelper,
        request: &KeyRequest,
    ) -> rsdrm::Result<Option<DrmData>> {
        let mut license = b"LICENSE-FOR-".to_vec();
        license.extend_from_slice(request.challenge.data());
        Ok(Some(DrmData::from(license)))
    }
}

#[test]
fn context_acquires_license_over_native_binding() {
    let cdm = Fake::default();
    *cdm.0.challenge_on_construct.lock().unwrap() = Some(b"0:Type:HELLO".to_vec());

    let ctx = DrmContext::builder(DrmConfig::default())
        .binding(Arc::new(cdm.clone()))
        .fatal_policy(Arc::new(RecordingPolicy::default()))
        .build();
    let helper: Arc<dyn DrmHelper> = Arc::new(WidevineHelper::new(DrmInfo::default()));

    let session = ctx.acquire_license(helper, &EchoServer).expect("license");
    assert_eq!(session.state(), KeyState::Ready);
    assert_eq!(cdm.updates(), vec![b"LICENSE-FOR-HELLO".to_vec()]);
}

struct JwkServer;

impl LicenseFetcher for JwkServer {
    fn fetch(
        &self,
        _helper: &dyn DrmHelper,
        request: &KeyRequest,
    ) -> rsdrm::Result<Option<DrmData>> {
        let body: serde_json::Value = serde_json::from_slice(request.challenge.data())?;
        let license = serde_json::json!({
            "keys": [{"kty": "oct", "kid": body["kids"][0], "k": URL_SAFE_NO_PAD.encode([5u8; 16])}]
        });
        Ok(Some(DrmData::from(serde_json::to_vec(&license)?)))
    }
}

fn clear_key_session(config: DrmConfig) -> Box<dyn DrmSession> {
    let kid = Uuid::new_v4();
    let mut helper = ClearKeyHelper::new(DrmInfo {
        system_uuid: SystemId::ClearKey.to_uuid().to_string(),
        hdcp22_required: true,
        ..Default::default()
    });
    assert!(helper.parse_pssh(&Pssh::with_key_ids(SystemId::ClearKey, vec![kid]).to_bytes()));

    let ctx = DrmContext::builder(config)
        .output_protection(Arc::new(StaticOutputProtection {
            source_uhd: true,
            hdcp_2_2: false,
        }))
        .fatal_policy(Arc::new(RecordingPolicy::default()))
        .build();
    ctx.acquire_license(Arc::new(helper), &JwkServer)
        .expect("clear key license")
}

#[test]
fn clear_key_decrypt_refused_without_hdcp22() {
    let session = clear_key_session(DrmConfig::default());
    assert!(session.output_protection_enabled());

    let iv = [0u8; 16];
    let params = DecryptParams {
        iv: &iv,
        ..Default::default()
    };
    let mut payload = vec![0u8; 16];
    let err = session.decrypt(&params, &mut payload).unwrap_err();
    assert_eq!(err, CdmError::HdcpCompliance);
    assert_eq!(err.code(), 4427);
    assert_eq!(payload, vec![0u8; 16]);
}

#[test]
fn clear_key_gating_follows_config() {
    let config = DrmConfig {
        output_protection: false,
        ..Default::default()
    };
    let session = clear_key_session(config);
    assert!(!session.output_protection_enabled());

    let iv = [0u8; 16];
    let params = DecryptParams {
        iv: &iv,
        ..Default::default()
    };
    let mut payload = vec![0u8; 16];
    session.decrypt(&params, &mut payload).expect("gating disabled");
}
