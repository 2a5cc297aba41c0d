use std::collections::BTreeMap;

use crate::error::{KilnError, KilnResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> KilnResult<Self> {
        if width == 0 || height == 0 {
            return Err(KilnError::validation("resolution width/height must be > 0"));
        }
        Ok(Self { width, height })
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Job settings as received from the caller.
///
/// This is the single typed representation that crosses every layer; the
/// manifest's validation hash is computed over its canonical JSON form, so
/// `extra` uses a `BTreeMap` to keep key order stable.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RenderSettings {
    pub resolution: Resolution,
    pub fps: u32,
    pub duration_secs: f64,
    pub engine: String,
    /// Engine-specific flags. Keys are sorted, so serialization order is
    /// independent of insertion order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RenderSettings {
    pub fn validate(&self) -> KilnResult<()> {
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(KilnError::validation("resolution width/height must be > 0"));
        }
        if self.fps == 0 {
            return Err(KilnError::validation("fps must be > 0"));
        }
        if !self.duration_secs.is_finite() || self.duration_secs <= 0.0 {
            return Err(KilnError::validation("duration_secs must be > 0"));
        }
        if self.engine.is_empty() {
            return Err(KilnError::validation("engine must be non-empty"));
        }
        Ok(())
    }

    /// Total frame count, `ceil(duration × fps)`, at least 1.
    pub fn frame_count(&self) -> u32 {
        ((self.duration_secs * f64::from(self.fps)).ceil() as u32).max(1)
    }
}

/// Outputs a finished job is expected to produce, derived once from settings
/// and frozen into the manifest.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExpectedOutputs {
    pub resolution: Resolution,
    /// Inclusive frame range `[start, end]`, 1-based.
    pub frame_range: [u32; 2],
    pub output_format: String,
}

impl ExpectedOutputs {
    pub fn derive(settings: &RenderSettings) -> Self {
        Self {
            resolution: settings.resolution,
            frame_range: [1, settings.frame_count()],
            output_format: "mp4".to_string(),
        }
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_range[1].saturating_sub(self.frame_range[0]) + 1
    }
}
