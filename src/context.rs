//! Player-wide DRM context.
//!
//! Built once at player startup and handed to the components that create
//! DRM sessions. It owns the helper registry, the CDM binding and the
//! platform collaborators, and picks the session backend from configuration.
use std::sync::Arc;

use crate::callbacks::DrmCallbacks;
use crate::cdm::CdmBinding;
use crate::clearkey::ClearKeySession;
use crate::config::{DrmConfig, SessionBackend};
use crate::drm_data::DrmData;
use crate::error::{Error, Result};
use crate::fatal::{FatalErrorPolicy, TerminateProcess};
use crate::helper::{DrmHelper, DrmHelperEngine};
use crate::hls::drm_helper_from_ext_x_key;
use crate::key::KeyState;
use crate::ocdm::{AdapterDeps, OcdmSessionAdapter};
use crate::platform::{OutputProtection, StaticOutputProtection};
use crate::pssh::SystemId;
use crate::session::{DrmSession, KeyRequest, NullSession};

/// Posts a key request to the license server.
pub trait LicenseFetcher {
    /// Return the license response, or `None` when the CDM obtains the key
    /// on its own.
    fn fetch(&self, helper: &dyn DrmHelper, request: &KeyRequest) -> Result<Option<DrmData>>;
}

/// Shared DRM collaborators and session factory.
pub struct DrmContext {
    config: DrmConfig,
    helpers: DrmHelperEngine,
    binding: Option<Arc<dyn CdmBinding>>,
    output_protection: Arc<dyn OutputProtection>,
    callbacks: Option<Arc<dyn DrmCallbacks>>,
    fatal_policy: Arc<dyn FatalErrorPolicy>,
}

/// Builder for [`DrmContext`].
pub struct DrmContextBuilder {
    config: DrmConfig,
    helpers: Option<DrmHelperEngine>,
    binding: Option<Arc<dyn CdmBinding>>,
    output_protection: Option<Arc<dyn OutputProtection>>,
    callbacks: Option<Arc<dyn DrmCallbacks>>,
    fatal_policy: Option<Arc<dyn FatalErrorPolicy>>,
}

impl DrmContextBuilder {
    pub fn helpers(mut self, helpers: DrmHelperEngine) -> Self {
        self.helpers = Some(helpers);
        self
    }

    pub fn binding(mut self, binding: Arc<dyn CdmBinding>) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn output_protection(mut self, output_protection: Arc<dyn OutputProtection>) -> Self {
        self.output_protection = Some(output_protection);
        self
    }

    pub fn callbacks(mut self, callbacks: Arc<dyn DrmCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn fatal_policy(mut self, fatal_policy: Arc<dyn FatalErrorPolicy>) -> Self {
        self.fatal_policy = Some(fatal_policy);
        self
    }

    /// Missing collaborators fall back to the configuration: static output
    /// protection from `platform`, process termination from `fatal`.
    pub fn build(self) -> DrmContext {
        let config = self.config;
        let output_protection = self.output_protection.unwrap_or_else(|| {
            Arc::new(StaticOutputProtection {
                source_uhd: config.platform.source_uhd,
                hdcp_2_2: config.platform.hdcp_2_2,
            })
        });
        let fatal_policy = self
            .fatal_policy
            .unwrap_or_else(|| Arc::new(TerminateProcess::from_config(&config.fatal)));

        DrmContext {
            helpers: self.helpers.unwrap_or_default(),
            binding: self.binding,
            output_protection,
            callbacks: self.callbacks,
            fatal_policy,
            config,
        }
    }
}

impl DrmContext {
    pub fn builder(config: DrmConfig) -> DrmContextBuilder {
        DrmContextBuilder {
            config,
            helpers: None,
            binding: None,
            output_protection: None,
            callbacks: None,
            fatal_policy: None,
        }
    }

    pub fn config(&self) -> &DrmConfig {
        &self.config
    }

    pub fn helpers(&self) -> &DrmHelperEngine {
        &self.helpers
    }

    /// Resolve a helper from an HLS `EXT-X-KEY` attribute list.
    pub fn helper_from_ext_x_key(
        &self,
        attributes: &str,
        hdcp22_required: bool,
    ) -> Option<Arc<dyn DrmHelper>> {
        drm_helper_from_ext_x_key(&self.helpers, attributes, hdcp22_required)
    }

    /// Create a session for `helper` with the configured backend.
    pub fn create_session(&self, helper: Arc<dyn DrmHelper>) -> Result<Box<dyn DrmSession>> {
        let is_clear_key = helper.system_id() == SystemId::ClearKey;
        let session: Box<dyn DrmSession> = match self.config.backend {
            SessionBackend::Null => Box::new(NullSession::new(helper.ocdm_system_id())),
            SessionBackend::ClearKey => {
                Box::new(ClearKeySession::new(helper, self.output_protection.clone()))
            }
            SessionBackend::Ocdm if is_clear_key && self.config.native_clear_key => {
                Box::new(ClearKeySession::new(helper, self.output_protection.clone()))
            }
            SessionBackend::Ocdm => {
                let binding = self
                    .binding
                    .clone()
                    .ok_or_else(|| Error::NoCdmBinding(helper.ocdm_system_id().to_string()))?;
                Box::new(OcdmSessionAdapter::new(
                    helper,
                    AdapterDeps {
                        binding,
                        output_protection: self.output_protection.clone(),
                        callbacks: self.callbacks.clone(),
                        fatal_policy: self.fatal_policy.clone(),
                    },
                ))
            }
        };
        session.set_output_protection(self.config.output_protection);
        info!(
            "Created {:?} session for {}",
            self.config.backend,
            session.key_system()
        );
        Ok(session)
    }

    /// Run the whole key exchange for `helper`.
    ///
    /// Creates the session, builds the native session from the helper's init
    /// data, fetches the license for the CDM challenge and feeds it back.
    /// Returns the session once its key is ready.
    pub fn acquire_license(
        &self,
        helper: Arc<dyn DrmHelper>,
        fetcher: &dyn LicenseFetcher,
    ) -> Result<Box<dyn DrmSession>> {
        let session = self.create_session(helper.clone())?;
        if session.state() == KeyState::Ready {
            return Ok(session);
        }

        session.generate_drm_session(&helper.init_data(), None);
        match session.state() {
            KeyState::Error | KeyState::ErrorEmptySessionId => {
                return Err(Error::Other(format!(
                    "{} session creation failed ({})",
                    session.key_system(),
                    session.state()
                )));
            }
            _ => {}
        }

        let timeout = self.config.key_request_timeout();
        let request = session
            .generate_key_request(timeout)
            .ok_or(Error::KeyRequestTimeout(timeout))?;
        let license = fetcher.fetch(helper.as_ref(), &request)?;

        session.process_drm_key(license.as_ref(), self.config.license_timeout())?;
        Ok(session)
    }
}
