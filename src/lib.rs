//! rsdrm - player-side DRM session layer.
//!
//! This crate provides:
//! - The DRM session key exchange state machine over a pluggable CDM binding.
//! - A timed latch rendezvous between CDM callback threads and callers.
//! - HDCP 2.2 output protection gating and secure memory hooks for decrypt.
//! - PSSH parsing, per-system DRM helpers and HLS `EXT-X-KEY` extraction.
//! - An in-process clear key session.
//!
//! Feature flags:
//! - `tracing` (default): log through `tracing`.
//! - `log`: log through `log` when `tracing` is disabled.
//! - `cli`: enable the `rsdrm` binary.

#[macro_use]
mod macros;

/// Side channel for individualization and renewal messages.
pub mod callbacks;
/// Native CDM binding traits.
pub mod cdm;
/// In-process clear key session.
pub mod clearkey;
/// YAML configuration.
pub mod config;
/// Player-wide DRM context and license acquisition.
pub mod context;
/// Owned license payload buffer.
pub mod drm_data;
/// Common error types and Result alias.
pub mod error;
/// Timed rendezvous primitive.
pub mod event;
/// Process-fatal hardware error handling.
pub mod fatal;
/// Per-DRM-system helpers.
pub mod helper;
/// HLS `EXT-X-KEY` handling.
pub mod hls;
/// Key states and statuses.
pub mod key;
/// Secure buffer transport hooks.
pub mod memory;
/// Session adapter over a native CDM.
pub mod ocdm;
/// Output protection queries.
pub mod platform;
/// PSSH parsing utilities.
pub mod pssh;
/// DRM session contract.
pub mod session;

pub use context::{DrmContext, LicenseFetcher};
pub use drm_data::DrmData;
pub use error::{CdmError, Error, Result};
pub use key::{KeyState, KeyStatus};
pub use session::{DrmSession, KeyRequest};
