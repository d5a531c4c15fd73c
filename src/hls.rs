//! HLS `EXT-X-KEY` handling.
//!
//! Resolves the DRM helper from `KEYFORMAT` and the PSSH from `URI`.
use std::sync::Arc;

use base64::Engine;

use crate::helper::{DrmHelper, DrmHelperEngine, DrmInfo};

/// Find the value of attribute `key` in an HLS attribute list.
///
/// Quoted values run to the closing quote, unquoted ones to the next comma.
/// Occurrences of `key` that are part of a longer name or not followed by
/// `=` are skipped.
pub fn find_attribute<'a>(attributes: &'a str, key: &str) -> Option<&'a str> {
    let mut search_from = 0;
    while let Some(found) = attributes[search_from..].find(key) {
        let start = search_from + found;
        let after = start + key.len();
        search_from = after;

        let at_boundary = attributes[..start]
            .chars()
            .next_back()
            .map_or(true, |c| c == ',' || c == ':' || c.is_whitespace());
        if !at_boundary || !attributes[after..].starts_with('=') {
            continue;
        }

        let value = &attributes[after + 1..];
        return Some(match value.strip_prefix('"') {
            Some(quoted) => quoted.split('"').next().unwrap_or(quoted),
            None => value.split(',').next().unwrap_or(value).trim_end(),
        });
    }
    None
}

/// PSSH bytes carried in a key URI.
///
/// Raw systems use the URI bytes as is; others base64-decode the part after
/// the data URI comma (or the whole URI when there is none).
pub fn pssh_from_uri(uri: &str, raw: bool) -> Option<Vec<u8>> {
    if raw {
        return Some(uri.as_bytes().to_vec());
    }
    let encoded = uri.split_once(',').map_or(uri, |(_, data)| data);
    match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
        Ok(pssh) => Some(pssh),
        Err(e) => {
            warn!("Key URI is not base64 PSSH data: {}", e);
            None
        }
    }
}

/// Build a DRM helper from an `EXT-X-KEY` attribute list.
///
/// Returns `None` if `KEYFORMAT` or `URI` is missing, the key format is not
/// a known system, the PSSH is empty, or the helper rejects it.
pub fn drm_helper_from_ext_x_key(
    engine: &DrmHelperEngine,
    attributes: &str,
    hdcp22_required: bool,
) -> Option<Arc<dyn DrmHelper>> {
    let Some(key_format) = find_attribute(attributes, "KEYFORMAT") else {
        warn!("EXT-X-KEY without KEYFORMAT: {}", attributes);
        return None;
    };
    let system_uuid = key_format.strip_prefix("urn:uuid:").unwrap_or(key_format);

    let Some(uri) = find_attribute(attributes, "URI") else {
        warn!("EXT-X-KEY without URI: {}", attributes);
        return None;
    };

    let info = DrmInfo {
        system_uuid: system_uuid.to_string(),
        method: find_attribute(attributes, "METHOD").unwrap_or_default().to_string(),
        key_uri: uri.to_string(),
        hdcp22_required,
        ..Default::default()
    };
    let Some(mut helper) = engine.create_helper(info) else {
        warn!("No DRM helper for key format {}", key_format);
        return None;
    };

    let pssh = pssh_from_uri(uri, helper.raw_pssh())?;
    if pssh.is_empty() {
        warn!("{} key URI carries no PSSH data", helper.friendly_name());
        return None;
    }
    if !helper.parse_pssh(&pssh) {
        warn!("{} PSSH parse failed", helper.friendly_name());
        return None;
    }

    debug!(
        "{} helper from EXT-X-KEY with {} key id(s)",
        helper.friendly_name(),
        helper.key_ids().len()
    );
    Some(Arc::from(helper))
}
