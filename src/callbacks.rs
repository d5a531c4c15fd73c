//! Side channel for CDM messages that are not license challenges.
use std::sync::Arc;

use crate::helper::DrmHelper;
use crate::session::DrmSession;

/// Receives individualization and license renewal notifications.
///
/// Called from the CDM callback thread.
pub trait DrmCallbacks: Send + Sync {
    /// Device provisioning request payload (prefix already stripped).
    fn individualization(&self, payload: &[u8]);

    /// The CDM asked for a license renewal on `session`.
    fn license_renewal(&self, helper: &Arc<dyn DrmHelper>, session: &dyn DrmSession);
}
