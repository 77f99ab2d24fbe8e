use serde::{Deserialize, Serialize};

/// Settle criteria: how still the star must be, for how long, before a
/// guide or dither operation reports `SettleDone`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettleParams {
    pub tolerance_px: f64,
    /// Required settle duration, either in seconds or in frames.
    pub duration: SettleDuration,
    pub timeout_secs: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettleDuration {
    Seconds(u32),
    Frames(u32),
}

impl SettleParams {
    /// Settle used when a calibration request does not supply one.
    pub fn calibration_default() -> Self {
        Self {
            tolerance_px: 1.5,
            duration: SettleDuration::Seconds(10),
            timeout_secs: 60,
        }
    }

    pub fn settle_secs(&self) -> Option<u32> {
        match self.duration {
            SettleDuration::Seconds(s) => Some(s),
            SettleDuration::Frames(_) => None,
        }
    }
}

/// Subframe in image pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuideRequest {
    pub settle: SettleParams,
    pub recalibrate: bool,
    pub roi: Option<Rect>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRequest {
    pub force_recalibration: bool,
    pub settle: SettleParams,
    pub roi: Option<Rect>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DitherRequest {
    /// Maximum offset in pixels along each axis.
    pub amount: f64,
    pub ra_only: bool,
    pub settle: SettleParams,
}

/// How much of the guider a pause stops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseKind {
    /// Stop issuing corrections, keep looping exposures.
    Guiding,
    /// Stop exposures as well.
    Full,
}
