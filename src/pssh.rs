//! PSSH parsing and key id extraction.
//!
//! Handles full PSSH boxes, bare Widevine PSSH data and PlayReady objects.
use base64::Engine;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use prost::Message;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::key::normalize_key_id;

/// Known DRM system IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemId {
    Widevine,
    PlayReady,
    ClearKey,
    Verimatrix,
}

impl SystemId {
    pub const ALL: [SystemId; 4] = [
        SystemId::Widevine,
        SystemId::PlayReady,
        SystemId::ClearKey,
        SystemId::Verimatrix,
    ];

    pub fn to_uuid(self) -> Uuid {
        match self {
            SystemId::Widevine => Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed),
            SystemId::PlayReady => Uuid::from_u128(0x9a04f07998404286ab92e65be0885f95),
            SystemId::ClearKey => Uuid::from_u128(0x1077efecc0b24d02ace33c1e52e2fb4b),
            SystemId::Verimatrix => Uuid::from_u128(0x9a27dd82fde247258cbc4234aa06ec09),
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.to_uuid() == uuid)
    }

    /// Key system string understood by OpenCDM.
    pub fn key_system(self) -> &'static str {
        match self {
            SystemId::Widevine => "com.widevine.alpha",
            SystemId::PlayReady => "com.microsoft.playready",
            SystemId::ClearKey => "org.w3.clearkey",
            SystemId::Verimatrix => "com.verimatrix.ott",
        }
    }
}

/// Widevine PSSH data (the init data of a Widevine PSSH box).
#[derive(Clone, PartialEq, Message)]
pub struct WidevinePsshData {
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub key_ids: Vec<Vec<u8>>,
    #[prost(string, optional, tag = "3")]
    pub provider: Option<String>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub content_id: Option<Vec<u8>>,
    #[prost(string, optional, tag = "6")]
    pub policy: Option<String>,
}

/// Parsed PSSH box or DRM init data wrapper.
#[derive(Debug, Clone)]
pub struct Pssh {
    pub version: u8,
    pub flags: u32,
    pub system_id: Uuid,
    key_ids: Vec<Uuid>,
    pub init_data: Vec<u8>,
}

impl Pssh {
    /// Parse from bytes; unknown input is wrapped as Widevine init data.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::parse_bytes(data, false)
    }

    /// Parse from base64 in lenient mode.
    pub fn from_base64(data_b64: &str) -> Result<Self> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(data_b64.trim())
            .map_err(Error::Base64DecodeError)?;
        Self::parse_bytes(&data, false)
    }

    /// Parse a PSSH box or init data from raw bytes.
    ///
    /// Strict mode rejects data that is neither a PSSH box, Widevine PSSH
    /// data nor a PlayReady object.
    pub fn parse_bytes(data: &[u8], strict: bool) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidInitData("Data must not be empty".to_string()));
        }

        if let Ok(pssh) = parse_pssh_box(data) {
            return Ok(pssh);
        }

        if let Ok(pssh_data) = WidevinePsshData::decode(data) {
            if pssh_data.encode_to_vec() == data {
                return Ok(Pssh::wrap(SystemId::Widevine, data));
            }
        }

        if contains_playready_header(data) {
            return Ok(Pssh::wrap(SystemId::PlayReady, data));
        }

        if strict {
            return Err(Error::InvalidInitData(
                "Could not parse data as PSSH or Widevine PSSH Data".to_string(),
            ));
        }

        Ok(Pssh::wrap(SystemId::Widevine, data))
    }

    fn wrap(system: SystemId, init_data: &[u8]) -> Self {
        Self {
            version: 0,
            flags: 0,
            system_id: system.to_uuid(),
            key_ids: Vec::new(),
            init_data: init_data.to_vec(),
        }
    }

    /// Serialize as a full PSSH box.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(self.version);
        body.extend_from_slice(&self.flags.to_be_bytes()[1..]);
        body.extend_from_slice(self.system_id.as_bytes());

        if self.version == 1 {
            body.extend_from_slice(&(self.key_ids.len() as u32).to_be_bytes());
            for kid in self.key_ids.iter() {
                body.extend_from_slice(kid.as_bytes());
            }
        }

        body.extend_from_slice(&(self.init_data.len() as u32).to_be_bytes());
        body.extend_from_slice(&self.init_data);

        let mut out = Vec::with_capacity(body.len() + 8);
        out.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(b"pssh");
        out.extend_from_slice(&body);
        out
    }

    /// Build a v1 box carrying only key ids.
    pub fn with_key_ids(system: SystemId, key_ids: Vec<Uuid>) -> Self {
        Self {
            version: 1,
            flags: 0,
            system_id: system.to_uuid(),
            key_ids,
            init_data: Vec::new(),
        }
    }

    /// Extract KIDs from box/init data where possible.
    ///
    /// Supports v1 PSSH boxes, Widevine PSSH data and PlayReady headers
    /// (versions 4.0.0.0 - 4.3.0.0).
    pub fn key_ids(&self) -> Result<Vec<Uuid>> {
        if self.version == 1 && !self.key_ids.is_empty() {
            return Ok(self.key_ids.clone());
        }

        match SystemId::from_uuid(self.system_id) {
            Some(SystemId::Widevine) => {
                let pssh_data = WidevinePsshData::decode(self.init_data.as_slice()).map_err(|e| {
                    Error::DecodeError(format!("Failed to parse WidevinePsshData: {}", e))
                })?;
                Ok(pssh_data.key_ids.iter().map(|kid| normalize_key_id(kid)).collect())
            }
            Some(SystemId::PlayReady) => Ok(parse_playready_header(&self.init_data)?.key_ids),
            _ => Err(Error::InvalidInitData(
                "Unsupported system ID for key_ids".to_string(),
            )),
        }
    }
}

fn parse_pssh_box(data: &[u8]) -> Result<Pssh> {
    if data.len() < 8 {
        return Err(Error::InvalidInitData("Data too short".to_string()));
    }

    let mut offset = 0;
    let size = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
    offset += 4;
    if &data[offset..offset + 4] != b"pssh" {
        return Err(Error::InvalidInitData("Not a PSSH box".to_string()));
    }
    offset += 4;

    let mut actual_size = size;
    if size == 1 {
        if data.len() < 16 {
            return Err(Error::InvalidInitData("Data too short".to_string()));
        }
        actual_size = BigEndian::read_u64(&data[offset..offset + 8]) as usize;
        offset += 8;
    } else if size == 0 {
        actual_size = data.len();
    }

    if actual_size > data.len() {
        return Err(Error::InvalidInitData("PSSH size exceeds data length".to_string()));
    }

    if data.len() < offset + 4 + 16 {
        return Err(Error::InvalidInitData("PSSH header incomplete".to_string()));
    }

    let version = data[offset];
    let flags = BigEndian::read_u24(&data[offset + 1..offset + 4]);
    offset += 4;

    let system_id = Uuid::from_slice(&data[offset..offset + 16])
        .map_err(|_| Error::InvalidInitData("Invalid system ID".to_string()))?;
    offset += 16;

    let mut key_ids = Vec::new();
    if version == 1 {
        if data.len() < offset + 4 {
            return Err(Error::InvalidInitData("Missing KID count".to_string()));
        }
        let kid_count = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
        offset += 4;

        let required = offset + kid_count * 16;
        if data.len() < required {
            return Err(Error::InvalidInitData("Missing KIDs".to_string()));
        }
        key_ids = data[offset..required]
            .chunks_exact(16)
            .map(|kid| Uuid::from_slice(kid).unwrap_or_else(|_| Uuid::nil()))
            .collect();
        offset = required;
    }

    if data.len() < offset + 4 {
        return Err(Error::InvalidInitData("Missing init data length".to_string()));
    }
    let data_size = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
    offset += 4;
    if data.len() < offset + data_size {
        return Err(Error::InvalidInitData("Missing init data".to_string()));
    }

    Ok(Pssh {
        version,
        flags,
        system_id,
        key_ids,
        init_data: data[offset..offset + data_size].to_vec(),
    })
}

fn contains_playready_header(data: &[u8]) -> bool {
    let marker = "</WRMHEADER>"
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect::<Vec<u8>>();
    data.windows(marker.len()).any(|window| window == marker)
}

/// Fields of interest in a PlayReady WRMHEADER.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayReadyHeader {
    pub key_ids: Vec<Uuid>,
    pub la_url: Option<String>,
}

/// Parse a PlayReady object (record list) and read its WRMHEADER.
pub fn parse_playready_header(data: &[u8]) -> Result<PlayReadyHeader> {
    if data.len() < 6 {
        return Err(Error::InvalidInitData("PlayReady data too short".to_string()));
    }

    let total_length = LittleEndian::read_u32(&data[0..4]) as usize;
    if total_length != data.len() {
        return Err(Error::InvalidInitData(
            "PlayReady object length mismatch".to_string(),
        ));
    }

    let record_count = LittleEndian::read_u16(&data[4..6]) as usize;
    let mut offset = 6;

    for _ in 0..record_count {
        if data.len() < offset + 4 {
            return Err(Error::InvalidInitData("PlayReady record truncated".to_string()));
        }
        let record_type = LittleEndian::read_u16(&data[offset..offset + 2]);
        let record_length = LittleEndian::read_u16(&data[offset + 2..offset + 4]) as usize;
        offset += 4;

        if data.len() < offset + record_length {
            return Err(Error::InvalidInitData("PlayReady record truncated".to_string()));
        }
        let record_data = &data[offset..offset + record_length];
        offset += record_length;

        // Type 1 is the rights management header; others are embedded stores.
        if record_type != 0x01 {
            continue;
        }

        let xml = String::from_utf16(
            &record_data
                .chunks_exact(2)
                .map(LittleEndian::read_u16)
                .collect::<Vec<u16>>(),
        )
        .map_err(|_| Error::InvalidInitData("Invalid PlayReady XML".to_string()))?;

        return parse_wrm_header(&xml);
    }

    Err(Error::InvalidInitData(
        "Unsupported PlayReady object".to_string(),
    ))
}

fn parse_wrm_header(xml: &str) -> Result<PlayReadyHeader> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| Error::InvalidInitData(format!("PlayReady XML parse error: {}", e)))?;

    let root = doc.root_element();
    let version = root
        .attribute("version")
        .ok_or_else(|| Error::InvalidInitData("Missing PlayReady version".to_string()))?;

    let mut key_ids = Vec::new();
    for node in root.descendants().filter(|n| n.tag_name().name() == "KID") {
        // 4.0.0.0 carries the KID as element text, later versions as VALUE.
        let value = match version {
            "4.0.0.0" => node.text(),
            "4.1.0.0" | "4.2.0.0" | "4.3.0.0" => node.attribute("VALUE"),
            _ => {
                return Err(Error::InvalidInitData(format!(
                    "Unsupported PlayReady version {}",
                    version
                )));
            }
        };
        let Some(value) = value else { continue };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(value.trim())
            .map_err(Error::Base64DecodeError)?;
        key_ids.push(playready_kid_to_uuid(&bytes));
    }

    if key_ids.is_empty() {
        return Err(Error::InvalidInitData("No PlayReady KIDs found".to_string()));
    }

    let la_url = root
        .descendants()
        .find(|n| n.tag_name().name() == "LA_URL")
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string());

    Ok(PlayReadyHeader { key_ids, la_url })
}

// PlayReady stores the first three GUID fields little-endian.
fn playready_kid_to_uuid(bytes: &[u8]) -> Uuid {
    if bytes.len() != 16 {
        return normalize_key_id(bytes);
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(bytes);
    Uuid::from_bytes_le(buf)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a PlayReady object holding one WRMHEADER record.
    pub(crate) fn playready_object(xml: &str) -> Vec<u8> {
        let record = xml
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect::<Vec<u8>>();
        let mut out = Vec::new();
        out.extend_from_slice(&((record.len() + 10) as u32).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&(record.len() as u16).to_le_bytes());
        out.extend_from_slice(&record);
        out
    }

    #[test]
    fn pssh_box_v0_parses() {
        let pssh_data = WidevinePsshData {
            key_ids: vec![vec![0x42; 16]],
            ..Default::default()
        };
        let mut pssh = Pssh::with_key_ids(SystemId::Widevine, Vec::new());
        pssh.version = 0;
        pssh.init_data = pssh_data.encode_to_vec();

        let parsed = Pssh::from_bytes(&pssh.to_bytes()).expect("parse pssh");
        assert_eq!(parsed.version, 0);
        assert_eq!(parsed.system_id, SystemId::Widevine.to_uuid());
        assert_eq!(parsed.key_ids().expect("key ids"), vec![Uuid::from_bytes([0x42; 16])]);
    }

    #[test]
    fn pssh_box_v1_key_ids() {
        let kid = Uuid::new_v4();
        let bytes = Pssh::with_key_ids(SystemId::ClearKey, vec![kid]).to_bytes();
        let parsed = Pssh::from_bytes(&bytes).expect("parse pssh");
        assert_eq!(parsed.system_id, SystemId::ClearKey.to_uuid());
        assert_eq!(parsed.key_ids().expect("key ids"), vec![kid]);
    }

    #[test]
    fn empty_base64_is_error() {
        let err = Pssh::from_base64("").expect_err("empty input should fail");
        assert!(format!("{}", err).contains("empty"));
    }

    #[test]
    fn playready_header_key_ids_and_la_url() {
        let kid = Uuid::new_v4();
        let xml = format!(
            r#"<WRMHEADER xmlns="http://schemas.microsoft.com/DRM/2007/03/PlayReadyHeader" version="4.3.0.0"><DATA><PROTECTINFO><KIDS><KID ALGID="AESCTR" VALUE="{}"></KID></KIDS></PROTECTINFO><LA_URL>https://pr.example.com/rightsmanager.asmx</LA_URL></DATA></WRMHEADER>"#,
            base64::engine::general_purpose::STANDARD.encode(kid.to_bytes_le())
        );
        let data = playready_object(&xml);

        let pssh = Pssh::from_bytes(&data).expect("parse playready");
        assert_eq!(pssh.system_id, SystemId::PlayReady.to_uuid());

        let header = parse_playready_header(&data).expect("header");
        assert_eq!(header.key_ids, vec![kid]);
        assert_eq!(
            header.la_url.as_deref(),
            Some("https://pr.example.com/rightsmanager.asmx")
        );
    }

    #[test]
    fn system_ids_map_to_key_systems() {
        let uuid = SystemId::Verimatrix.to_uuid();
        assert_eq!(SystemId::from_uuid(uuid), Some(SystemId::Verimatrix));
        assert_eq!(SystemId::PlayReady.key_system(), "com.microsoft.playready");
    }
}
