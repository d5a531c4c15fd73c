//! Native CDM binding.
//!
//! These traits describe what the session layer needs from a content
//! decryption module: create a system for a key system, construct sessions
//! that report challenges and key updates through callbacks, feed license
//! responses, query key status and decrypt samples. An OpenCDM binding, a
//! vendor SDK or a test double all plug in here.
use std::fmt;
use std::sync::Arc;

use crate::key::KeyStatus;

/// Raw status code returned by a failing native call.
pub type NativeStatus = i32;

/// CENC protection scheme of the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionScheme {
    /// AES-CTR (`cenc`).
    #[default]
    Cenc,
    /// AES-CBC with pattern (`cbcs`).
    Cbcs,
}

/// Pattern encryption block counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionPattern {
    pub crypt_blocks: u32,
    pub skip_blocks: u32,
}

/// Clear/encrypted split of a CENC subsample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subsample {
    pub clear_bytes: u32,
    pub encrypted_bytes: u32,
}

/// Per-sample decryption metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecryptParams<'a> {
    pub iv: &'a [u8],
    pub key_id: &'a [u8],
    pub scheme: EncryptionScheme,
    pub pattern: Option<EncryptionPattern>,
    /// Empty means the whole payload is encrypted.
    pub subsamples: &'a [Subsample],
}

type ChallengeFn = dyn Fn(&str, &[u8]) + Send + Sync;
type KeyUpdateFn = dyn Fn(&[u8]) + Send + Sync;
type ErrorFn = dyn Fn(&str) + Send + Sync;
type KeysUpdatedFn = dyn Fn() + Send + Sync;

/// Callbacks a native session invokes from the CDM thread.
pub struct SessionCallbacks {
    /// License challenge with its destination URL.
    pub challenge: Box<ChallengeFn>,
    /// Status of a single key changed; carries the key id.
    pub key_update: Box<KeyUpdateFn>,
    /// CDM error message.
    pub error: Box<ErrorFn>,
    /// All key updates for the current license were delivered.
    pub keys_updated: Box<KeysUpdatedFn>,
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks").finish_non_exhaustive()
    }
}

/// Factory for per-key-system CDM systems.
pub trait CdmBinding: Send + Sync {
    /// Create the system handle for `key_system` (e.g. `com.widevine.alpha`).
    fn create_system(&self, key_system: &str) -> Option<Arc<dyn CdmSystem>>;
}

/// A CDM system handle, shared by all sessions of one key system.
pub trait CdmSystem: Send + Sync {
    /// Construct a session for `init_data`.
    ///
    /// `callbacks` may fire on any thread, including during this call.
    fn construct_session(
        &self,
        init_data: &[u8],
        custom_data: Option<&[u8]>,
        callbacks: SessionCallbacks,
    ) -> Result<Box<dyn CdmSession>, NativeStatus>;
}

/// A native CDM session.
pub trait CdmSession: Send + Sync {
    /// Session identifier assigned by the CDM.
    fn id(&self) -> String;

    /// Feed a license response.
    fn update(&self, response: &[u8]) -> Result<(), NativeStatus>;

    /// Usability of the key with `key_id`.
    fn status(&self, key_id: &[u8]) -> KeyStatus;

    /// Decrypt `payload` in place.
    fn decrypt(&self, params: &DecryptParams<'_>, payload: &mut [u8]) -> Result<(), NativeStatus>;

    /// Close the session. The handle is destructed when dropped.
    ///
    /// May be called from inside one of this session's callbacks, on the
    /// CDM thread, when the owning adapter is dropped during the callback.
    /// Implementations must not deadlock on their own callback locks here.
    fn close(&self);
}
