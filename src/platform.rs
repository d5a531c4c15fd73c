//! Output protection queries.

/// Platform view of the video output link.
pub trait OutputProtection: Send + Sync {
    /// The current source is UHD content.
    fn is_source_uhd(&self) -> bool;

    /// The display is connected over HDCP 2.2.
    fn is_hdcp_connection_2_2(&self) -> bool;
}

/// Fixed answers, typically taken from [`crate::config::PlatformConfig`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticOutputProtection {
    pub source_uhd: bool,
    pub hdcp_2_2: bool,
}

impl OutputProtection for StaticOutputProtection {
    fn is_source_uhd(&self) -> bool {
        self.source_uhd
    }

    fn is_hdcp_connection_2_2(&self) -> bool {
        self.hdcp_2_2
    }
}

/// Whether decrypt must be refused: HDCP 2.2 required, UHD source, and a
/// link without HDCP 2.2.
pub fn hdcp22_violation(hdcp22_required: bool, platform: &dyn OutputProtection) -> bool {
    hdcp22_required && platform.is_source_uhd() && !platform.is_hdcp_connection_2_2()
}
