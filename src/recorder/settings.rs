use crate::error::Error;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

fn default_buffer_seconds() -> u64 {
    15
}

fn default_sensitivity() -> u32 {
    10
}

fn default_resolution() -> Resolution {
    Resolution {
        width: 640,
        height: 480,
    }
}

fn default_framerate() -> u32 {
    20
}

fn default_rotation() -> u32 {
    270
}

fn default_encoding_bitrate() -> u32 {
    17_000_000
}

fn default_encoding_profile() -> String {
    "high".to_string()
}

fn default_encoding_level() -> String {
    "4".to_string()
}

/// Live camera settings, patchable through the `camera` namespace
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CameraSettings {
    /// Pre-roll duration in seconds, also the post-motion capture length
    #[serde(default = "default_buffer_seconds")]
    pub buffer_seconds: u64,
    /// Number of moving blocks needed to trigger a motion event
    #[serde(default = "default_sensitivity")]
    pub sensitivity: u32,
    #[serde(default = "default_resolution")]
    pub resolution: Resolution,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// Clockwise rotation in degrees (0, 90, 180, 270)
    #[serde(default = "default_rotation")]
    pub rotation: u32,
    #[serde(default)]
    pub recording_window: Option<RecordingWindow>,
    #[serde(default = "default_encoding_bitrate")]
    pub encoding_bitrate: u32,
    #[serde(default = "default_encoding_profile")]
    pub encoding_profile: String,
    #[serde(default = "default_encoding_level")]
    pub encoding_level: String,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            buffer_seconds: default_buffer_seconds(),
            sensitivity: default_sensitivity(),
            resolution: default_resolution(),
            framerate: default_framerate(),
            rotation: default_rotation(),
            recording_window: None,
            encoding_bitrate: default_encoding_bitrate(),
            encoding_profile: default_encoding_profile(),
            encoding_level: default_encoding_level(),
        }
    }
}

/// Capture resolution, written as `WIDTHxHEIGHT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .trim()
            .split_once('x')
            .ok_or_else(|| Error::Config(format!("Invalid resolution: {}", s)))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .ok()
                .filter(|value| *value > 0)
                .ok_or_else(|| Error::Config(format!("Invalid resolution: {}", s)))
        };
        Ok(Self {
            width: parse(width)?,
            height: parse(height)?,
        })
    }
}

impl TryFrom<String> for Resolution {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Hours of the day during which capture is active, written as `START-END`.
///
/// Both hours are inclusive. A window whose start is after its end wraps
/// around midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordingWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl RecordingWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour <= self.end_hour
        } else {
            hour >= self.start_hour || hour <= self.end_hour
        }
    }
}

impl FromStr for RecordingWindow {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| Error::Config(format!("Invalid recording window: {}", s)))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .ok()
                .filter(|hour| *hour < 24)
                .ok_or_else(|| Error::Config(format!("Invalid recording window: {}", s)))
        };
        Ok(Self {
            start_hour: parse(start)?,
            end_hour: parse(end)?,
        })
    }
}

impl TryFrom<String> for RecordingWindow {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RecordingWindow> for String {
    fn from(value: RecordingWindow) -> Self {
        value.to_string()
    }
}

impl Display for RecordingWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start_hour, self.end_hour)
    }
}

type FieldSetter = fn(&mut CameraSettings, &Value) -> Result<()>;

/// Every field the `camera` namespace may set, with its typed setter
const CAMERA_FIELDS: &[(&str, FieldSetter)] = &[
    ("buffer", set_buffer as FieldSetter),
    ("sensitivity", set_sensitivity as FieldSetter),
    ("recording_window", set_recording_window as FieldSetter),
    ("rotation", set_rotation as FieldSetter),
    ("resolution", set_resolution as FieldSetter),
    ("framerate", set_framerate as FieldSetter),
    ("encoding_bitrate", set_encoding_bitrate as FieldSetter),
    ("encoding_profile", set_encoding_profile as FieldSetter),
    ("encoding_level", set_encoding_level as FieldSetter),
];

fn set_buffer(settings: &mut CameraSettings, value: &Value) -> Result<()> {
    settings.buffer_seconds = positive(as_u64("buffer", value)?, "buffer")?;
    Ok(())
}

fn set_sensitivity(settings: &mut CameraSettings, value: &Value) -> Result<()> {
    settings.sensitivity = as_u32("sensitivity", value)?;
    Ok(())
}

fn set_recording_window(settings: &mut CameraSettings, value: &Value) -> Result<()> {
    settings.recording_window = match as_text(value) {
        Some(text) if text.trim().is_empty() => None,
        Some(text) => Some(text.parse()?),
        None if value.is_null() => None,
        None => return Err(invalid("recording_window", value)),
    };
    Ok(())
}

fn set_rotation(settings: &mut CameraSettings, value: &Value) -> Result<()> {
    let rotation = as_u32("rotation", value)?;
    if rotation % 90 != 0 || rotation >= 360 {
        return Err(invalid("rotation", value));
    }
    settings.rotation = rotation;
    Ok(())
}

fn set_resolution(settings: &mut CameraSettings, value: &Value) -> Result<()> {
    let text = as_text(value).ok_or_else(|| invalid("resolution", value))?;
    settings.resolution = text.parse()?;
    Ok(())
}

fn set_framerate(settings: &mut CameraSettings, value: &Value) -> Result<()> {
    let framerate = as_u32("framerate", value)?;
    positive(framerate as u64, "framerate")?;
    settings.framerate = framerate;
    Ok(())
}

fn set_encoding_bitrate(settings: &mut CameraSettings, value: &Value) -> Result<()> {
    settings.encoding_bitrate = as_u32("encoding_bitrate", value)?;
    Ok(())
}

fn set_encoding_profile(settings: &mut CameraSettings, value: &Value) -> Result<()> {
    settings.encoding_profile = as_text(value).ok_or_else(|| invalid("encoding_profile", value))?;
    Ok(())
}

fn set_encoding_level(settings: &mut CameraSettings, value: &Value) -> Result<()> {
    settings.encoding_level = as_text(value).ok_or_else(|| invalid("encoding_level", value))?;
    Ok(())
}

impl CameraSettings {
    /// Names accepted by `patched`
    pub fn field_names() -> impl Iterator<Item = &'static str> {
        CAMERA_FIELDS.iter().map(|(name, _)| *name)
    }

    /// Return a copy with every recognised field of `fields` applied.
    ///
    /// Unrecognised fields are skipped. Any malformed value fails the whole
    /// patch, leaving `self` untouched.
    pub fn patched(&self, fields: &Map<String, Value>) -> Result<(Self, Vec<&'static str>)> {
        let mut next = self.clone();
        let mut applied = Vec::new();
        for (name, value) in fields {
            match CAMERA_FIELDS.iter().find(|(field, _)| field == name) {
                Some((field, setter)) => {
                    setter(&mut next, value)?;
                    applied.push(*field);
                }
                None => log::debug!("Ignoring unknown camera field {}", name),
            }
        }
        Ok((next, applied))
    }

    /// Settable fields as reported in the `camera` namespace
    pub fn to_document(&self) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("buffer".into(), Value::from(self.buffer_seconds));
        body.insert("sensitivity".into(), Value::from(self.sensitivity));
        body.insert(
            "recording_window".into(),
            self.recording_window
                .map(|window| Value::from(window.to_string()))
                .unwrap_or(Value::Null),
        );
        body.insert("rotation".into(), Value::from(self.rotation));
        body.insert("resolution".into(), Value::from(self.resolution.to_string()));
        body.insert("framerate".into(), Value::from(self.framerate));
        body.insert("encoding_bitrate".into(), Value::from(self.encoding_bitrate));
        body.insert(
            "encoding_profile".into(),
            Value::from(self.encoding_profile.clone()),
        );
        body.insert(
            "encoding_level".into(),
            Value::from(self.encoding_level.clone()),
        );
        body
    }
}

fn invalid(field: &str, value: &Value) -> anyhow::Error {
    Error::Config(format!("Invalid value for camera.{}: {}", field, value)).into()
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_u64(field: &str, value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n.as_u64().ok_or_else(|| invalid(field, value)),
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| invalid(field, value)),
        _ => Err(invalid(field, value)),
    }
}

fn as_u32(field: &str, value: &Value) -> Result<u32> {
    u32::try_from(as_u64(field, value)?).map_err(|_| invalid(field, value))
}

fn positive(value: u64, field: &str) -> Result<u64> {
    if value == 0 {
        return Err(Error::Config(format!("camera.{} must be positive", field)).into());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn patches_string_encoded_fields() {
        let (next, applied) = CameraSettings::default()
            .patched(&fields(json!({
                "buffer": "20",
                "sensitivity": "20",
                "recording_window": "12-20",
                "rotation": "180",
                "resolution": "320x240",
                "framerate": "30",
                "encoding_bitrate": "5000000",
                "encoding_profile": "main",
                "encoding_level": "2.1"
            })))
            .unwrap();

        assert_eq!(applied.len(), 9);
        assert_eq!(next.buffer_seconds, 20);
        assert_eq!(next.sensitivity, 20);
        assert_eq!(
            next.recording_window,
            Some(RecordingWindow {
                start_hour: 12,
                end_hour: 20
            })
        );
        assert_eq!(next.rotation, 180);
        assert_eq!(
            next.resolution,
            Resolution {
                width: 320,
                height: 240
            }
        );
        assert_eq!(next.framerate, 30);
        assert_eq!(next.encoding_bitrate, 5_000_000);
        assert_eq!(next.encoding_profile, "main");
        assert_eq!(next.encoding_level, "2.1");
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let base = CameraSettings::default();
        let (next, applied) = base
            .patched(&fields(json!({"buffer": 5, "exposure": "night"})))
            .unwrap();
        assert_eq!(applied, vec!["buffer"]);
        assert_eq!(next.buffer_seconds, 5);
    }

    #[test]
    fn malformed_value_rejects_whole_patch() {
        let base = CameraSettings::default();
        let result = base.patched(&fields(json!({"buffer": "30", "resolution": "wide"})));
        assert!(result.is_err());
        assert_eq!(base.buffer_seconds, 15);
    }

    #[test]
    fn rejects_odd_rotation_and_zero_buffer() {
        let base = CameraSettings::default();
        assert!(base.patched(&fields(json!({"rotation": 45}))).is_err());
        assert!(base.patched(&fields(json!({"buffer": "0"}))).is_err());
    }

    #[test]
    fn window_membership_and_wrap() {
        let day: RecordingWindow = "8-17".parse().unwrap();
        assert!(day.contains(8));
        assert!(day.contains(17));
        assert!(!day.contains(18));

        let night: RecordingWindow = "22-5".parse().unwrap();
        assert!(night.contains(23));
        assert!(night.contains(0));
        assert!(!night.contains(12));

        assert!("25-3".parse::<RecordingWindow>().is_err());
    }

    #[test]
    fn document_round_trips_through_patch() {
        let (configured, _) = CameraSettings::default()
            .patched(&fields(json!({"recording_window": "0-23", "resolution": "1280x720"})))
            .unwrap();
        let (again, _) = CameraSettings::default()
            .patched(&configured.to_document())
            .unwrap();
        assert_eq!(again, configured);
    }
}
