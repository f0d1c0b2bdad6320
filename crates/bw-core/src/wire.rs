use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReadingStatus {
    #[serde(rename = "GET")]
    Sighting,
    #[serde(rename = "OUT")]
    Departed,
}

/// One line from a sensor node: either a sighting of a bed or an explicit
/// departure. Field names follow the firmware's JSON exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorReading {
    pub esp_id: String,
    #[serde(rename = "cama")]
    pub bed_name: String,
    pub status: ReadingStatus,
    #[serde(rename = "RSSI", default)]
    pub rssi: i32,
    #[serde(rename = "wifi", default)]
    pub link_quality: i32,
    #[serde(rename = "dataOn", default)]
    pub origin_ts: Option<DateTime<Utc>>,
}

impl SensorReading {
    pub fn is_departure(&self) -> bool {
        self.status == ReadingStatus::Departed
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NoticeStatus {
    #[serde(rename = "GET")]
    Sighting,
    #[serde(rename = "OUT")]
    Departed,
    #[serde(rename = "WARNING")]
    Warning,
}

/// Outbound notification of a committed bed-state change, one JSON object
/// per downstream connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomNotice {
    #[serde(rename = "quarto")]
    pub room: Option<String>,
    #[serde(rename = "cama")]
    pub bed_name: String,
    pub status: NoticeStatus,
    #[serde(rename = "dataOn", default)]
    pub origin_ts: Option<DateTime<Utc>>,
    #[serde(rename = "wifi", default)]
    pub link_quality: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

pub fn decode_reading(bytes: &[u8], max_frame_bytes: usize) -> Result<SensorReading, FrameError> {
    let reading: SensorReading = decode_frame(bytes, max_frame_bytes)?;
    if reading.esp_id.trim().is_empty() {
        return Err(FrameError::MissingField("esp_id"));
    }
    if reading.bed_name.trim().is_empty() {
        return Err(FrameError::MissingField("cama"));
    }
    Ok(reading)
}
