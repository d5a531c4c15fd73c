//! Per-DRM-system helpers.
//!
//! A helper knows how one DRM system describes its protection data: how to
//! read the PSSH, which key system string the CDM expects, what init data a
//! session is created from and whether output protection applies. Helpers are
//! resolved by system UUID through a [`DrmHelperEngine`].
use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

use crate::memory::MemorySystem;
use crate::pssh::{parse_playready_header, Pssh, SystemId};

/// Manifest-side description of the protection of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrmInfo {
    /// DRM system UUID, e.g. `edef8ba9-79d6-4ace-a3c8-27dcd51d21ed`.
    pub system_uuid: String,
    /// Encryption method declared by the manifest (`SAMPLE-AES-CTR`, ...).
    pub method: String,
    /// Key URI as it appeared in the manifest.
    pub key_uri: String,
    /// URL of the manifest declaring the key.
    pub manifest_url: String,
    /// Content requires an HDCP 2.2 link when played in UHD.
    pub hdcp22_required: bool,
}

/// DRM-system specific knowledge used to drive a session.
pub trait DrmHelper: Send + Sync + fmt::Debug {
    /// Human readable system name.
    fn friendly_name(&self) -> &'static str;

    fn system_id(&self) -> SystemId;

    /// Key system string passed to the CDM.
    fn ocdm_system_id(&self) -> &'static str {
        self.system_id().key_system()
    }

    /// Parse PSSH bytes taken from the manifest. Returns `false` when the
    /// data is unusable for this system.
    fn parse_pssh(&mut self, pssh: &[u8]) -> bool;

    /// Init data to construct the CDM session from.
    fn init_data(&self) -> Vec<u8>;

    /// Key ids found while parsing the PSSH.
    fn key_ids(&self) -> &[Uuid];

    fn is_hdcp22_required(&self) -> bool;

    /// License server URL embedded in the protection data, if any.
    fn license_server_url(&self) -> Option<&str> {
        None
    }

    /// PSSH travels as raw bytes in the key URI instead of base64.
    fn raw_pssh(&self) -> bool {
        false
    }

    /// Secure buffer transport used around native decrypt.
    fn memory_system(&self) -> Option<Box<dyn MemorySystem>> {
        None
    }
}

/// Widevine: init data is the PSSH box, key ids come from the PSSH data.
#[derive(Debug, Default)]
pub struct WidevineHelper {
    info: DrmInfo,
    pssh: Vec<u8>,
    key_ids: Vec<Uuid>,
}

impl WidevineHelper {
    pub fn new(info: DrmInfo) -> Self {
        Self {
            info,
            ..Default::default()
        }
    }
}

impl DrmHelper for WidevineHelper {
    fn friendly_name(&self) -> &'static str {
        "Widevine"
    }

    fn system_id(&self) -> SystemId {
        SystemId::Widevine
    }

    fn parse_pssh(&mut self, pssh: &[u8]) -> bool {
        let Ok(parsed) = Pssh::from_bytes(pssh) else {
            return false;
        };
        let key_ids = match parsed.key_ids() {
            Ok(key_ids) => key_ids,
            Err(e) => {
                warn!("Widevine PSSH without usable key ids: {}", e);
                return false;
            }
        };
        if parsed.system_id != SystemId::Widevine.to_uuid() {
            return false;
        }
        self.key_ids = key_ids;
        self.pssh = pssh.to_vec();
        true
    }

    fn init_data(&self) -> Vec<u8> {
        self.pssh.clone()
    }

    fn key_ids(&self) -> &[Uuid] {
        &self.key_ids
    }

    fn is_hdcp22_required(&self) -> bool {
        self.info.hdcp22_required
    }
}

/// PlayReady: WRMHEADER key ids and license acquisition URL.
#[derive(Debug, Default)]
pub struct PlayReadyHelper {
    info: DrmInfo,
    pssh: Vec<u8>,
    key_ids: Vec<Uuid>,
    la_url: Option<String>,
}

impl PlayReadyHelper {
    pub fn new(info: DrmInfo) -> Self {
        Self {
            info,
            ..Default::default()
        }
    }
}

impl DrmHelper for PlayReadyHelper {
    fn friendly_name(&self) -> &'static str {
        "PlayReady"
    }

    fn system_id(&self) -> SystemId {
        SystemId::PlayReady
    }

    fn parse_pssh(&mut self, pssh: &[u8]) -> bool {
        let Ok(parsed) = Pssh::from_bytes(pssh) else {
            return false;
        };
        match parse_playready_header(&parsed.init_data) {
            Ok(header) => {
                self.key_ids = header.key_ids;
                self.la_url = header.la_url;
                self.pssh = pssh.to_vec();
                true
            }
            Err(e) => {
                warn!("PlayReady header parse failed: {}", e);
                false
            }
        }
    }

    fn init_data(&self) -> Vec<u8> {
        self.pssh.clone()
    }

    fn key_ids(&self) -> &[Uuid] {
        &self.key_ids
    }

    fn is_hdcp22_required(&self) -> bool {
        self.info.hdcp22_required
    }

    fn license_server_url(&self) -> Option<&str> {
        self.la_url.as_deref()
    }
}

/// W3C clear key: key ids from a v1 PSSH box.
#[derive(Debug, Default)]
pub struct ClearKeyHelper {
    info: DrmInfo,
    pssh: Vec<u8>,
    key_ids: Vec<Uuid>,
}

impl ClearKeyHelper {
    pub fn new(info: DrmInfo) -> Self {
        Self {
            info,
            ..Default::default()
        }
    }
}

impl DrmHelper for ClearKeyHelper {
    fn friendly_name(&self) -> &'static str {
        "Clearkey"
    }

    fn system_id(&self) -> SystemId {
        SystemId::ClearKey
    }

    fn parse_pssh(&mut self, pssh: &[u8]) -> bool {
        match Pssh::parse_bytes(pssh, true).and_then(|parsed| parsed.key_ids()) {
            Ok(key_ids) if !key_ids.is_empty() => {
                self.key_ids = key_ids;
                self.pssh = pssh.to_vec();
                true
            }
            _ => false,
        }
    }

    fn init_data(&self) -> Vec<u8> {
        self.pssh.clone()
    }

    fn key_ids(&self) -> &[Uuid] {
        &self.key_ids
    }

    fn is_hdcp22_required(&self) -> bool {
        self.info.hdcp22_required
    }

    fn license_server_url(&self) -> Option<&str> {
        (!self.info.key_uri.is_empty() && !self.info.key_uri.starts_with("data:"))
            .then_some(self.info.key_uri.as_str())
    }
}

/// Verimatrix: the key URI itself is the opaque init data.
#[derive(Debug, Default)]
pub struct VerimatrixHelper {
    info: DrmInfo,
    init_data: Vec<u8>,
}

impl VerimatrixHelper {
    pub fn new(info: DrmInfo) -> Self {
        Self {
            info,
            ..Default::default()
        }
    }
}

impl DrmHelper for VerimatrixHelper {
    fn friendly_name(&self) -> &'static str {
        "Verimatrix"
    }

    fn system_id(&self) -> SystemId {
        SystemId::Verimatrix
    }

    fn parse_pssh(&mut self, pssh: &[u8]) -> bool {
        if pssh.is_empty() {
            return false;
        }
        self.init_data = pssh.to_vec();
        true
    }

    fn init_data(&self) -> Vec<u8> {
        self.init_data.clone()
    }

    fn key_ids(&self) -> &[Uuid] {
        &[]
    }

    fn is_hdcp22_required(&self) -> bool {
        self.info.hdcp22_required
    }

    fn raw_pssh(&self) -> bool {
        true
    }
}

type HelperFactory = Box<dyn Fn(DrmInfo) -> Box<dyn DrmHelper> + Send + Sync>;

/// Registry of helper factories keyed by DRM system UUID.
pub struct DrmHelperEngine {
    factories: HashMap<Uuid, HelperFactory>,
}

impl fmt::Debug for DrmHelperEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmHelperEngine")
            .field("systems", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for DrmHelperEngine {
    /// Engine with the Widevine, PlayReady, ClearKey and Verimatrix helpers.
    fn default() -> Self {
        let mut engine = Self::empty();
        engine.register(SystemId::Widevine.to_uuid(), |info| {
            Box::new(WidevineHelper::new(info))
        });
        engine.register(SystemId::PlayReady.to_uuid(), |info| {
            Box::new(PlayReadyHelper::new(info))
        });
        engine.register(SystemId::ClearKey.to_uuid(), |info| {
            Box::new(ClearKeyHelper::new(info))
        });
        engine.register(SystemId::Verimatrix.to_uuid(), |info| {
            Box::new(VerimatrixHelper::new(info))
        });
        engine
    }
}

impl DrmHelperEngine {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register (or replace) the factory for `system`.
    pub fn register<F>(&mut self, system: Uuid, factory: F)
    where
        F: Fn(DrmInfo) -> Box<dyn DrmHelper> + Send + Sync + 'static,
    {
        self.factories.insert(system, Box::new(factory));
    }

    pub fn has_drm(&self, info: &DrmInfo) -> bool {
        parse_system_uuid(&info.system_uuid).is_some_and(|uuid| self.factories.contains_key(&uuid))
    }

    /// Create a helper for `info`, `None` when the system is unknown.
    pub fn create_helper(&self, info: DrmInfo) -> Option<Box<dyn DrmHelper>> {
        let uuid = parse_system_uuid(&info.system_uuid)?;
        let factory = self.factories.get(&uuid)?;
        Some(factory(info))
    }
}

fn parse_system_uuid(value: &str) -> Option<Uuid> {
    let value = value.trim();
    let value = value.strip_prefix("urn:uuid:").unwrap_or(value);
    Uuid::parse_str(value).ok()
}
