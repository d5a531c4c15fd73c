//! Key exchange states and CDM key statuses.

use std::fmt;

use uuid::Uuid;

/// Session key exchange state.
///
/// Advances Init -> Pending -> (Ready | Error). Only clearing the decrypt
/// context returns a session to `Init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    Init,
    Pending,
    Ready,
    Error,
    Closed,
    /// The native session came back with an empty session id.
    ErrorEmptySessionId,
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyState::Init => "KEY_INIT",
            KeyState::Pending => "KEY_PENDING",
            KeyState::Ready => "KEY_READY",
            KeyState::Error => "KEY_ERROR",
            KeyState::Closed => "KEY_CLOSED",
            KeyState::ErrorEmptySessionId => "KEY_ERROR_EMPTY_SESSION_ID",
        };
        f.write_str(name)
    }
}

/// Key usability reported by the CDM once keys are updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum KeyStatus {
    Usable = 0,
    Expired = 1,
    Released = 2,
    OutputRestricted = 3,
    OutputDownscaled = 4,
    StatusPending = 5,
    InternalError = 6,
    HwError = 7,
    OutputRestrictedHdcp22 = 8,
}

impl KeyStatus {
    /// Numeric status as reported by the CDM.
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for KeyStatus {
    type Error = i32;

    fn try_from(value: i32) -> std::result::Result<Self, i32> {
        Ok(match value {
            0 => KeyStatus::Usable,
            1 => KeyStatus::Expired,
            2 => KeyStatus::Released,
            3 => KeyStatus::OutputRestricted,
            4 => KeyStatus::OutputDownscaled,
            5 => KeyStatus::StatusPending,
            6 => KeyStatus::InternalError,
            7 => KeyStatus::HwError,
            8 => KeyStatus::OutputRestrictedHdcp22,
            other => return Err(other),
        })
    }
}

/// Render a key id for logs.
///
/// 16-byte ids print as a UUID, anything else as hex.
#[must_use]
pub fn key_id_display(key_id: &[u8]) -> String {
    match Uuid::from_slice(key_id) {
        Ok(uuid) => uuid.to_string(),
        Err(_) => hex::encode(key_id),
    }
}

/// Normalize a key id found in init data to 16 bytes.
///
/// Handles:
/// - 16 bytes: used as is
/// - 32 bytes: hex-encoded UUID string
/// - Other lengths: right-aligned into 16 bytes (truncating from the left)
#[must_use]
pub fn normalize_key_id(key_id: &[u8]) -> Uuid {
    if key_id.len() == 16 {
        return Uuid::from_slice(key_id).unwrap_or_else(|_| Uuid::nil());
    }

    if key_id.len() == 32 {
        if let Ok(s) = std::str::from_utf8(key_id) {
            if let Ok(uuid) = Uuid::parse_str(s) {
                return uuid;
            }
        }
    }

    let mut buf = [0u8; 16];
    if key_id.len() >= 16 {
        buf.copy_from_slice(&key_id[key_id.len() - 16..]);
    } else {
        buf[16 - key_id.len()..].copy_from_slice(key_id);
    }
    Uuid::from_bytes(buf)
}
