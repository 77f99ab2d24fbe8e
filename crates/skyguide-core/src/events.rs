//! Guiding events broadcast to every connected client.
//!
//! Each variant maps to one fixed wire name and a fixed field set. Fields are
//! emitted in declaration order after the envelope header; optional fields
//! are omitted rather than sent as `null`. Adding a field is backward
//! compatible, renaming or removing one is not.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event protocol version reported in the `Version` event.
pub const MSG_PROTOCOL_VERSION: u32 = 1;

/// Guider state as exposed to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppState {
    Stopped,
    Selected,
    Calibrating,
    Guiding,
    LostLock,
    Paused,
    Looping,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Selected => "Selected",
            Self::Calibrating => "Calibrating",
            Self::Guiding => "Guiding",
            Self::LostLock => "LostLock",
            Self::Paused => "Paused",
            Self::Looping => "Looping",
        }
    }
}

/// Image coordinates in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuideDirection {
    North,
    South,
    East,
    West,
}

impl GuideDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::North => "North",
            Self::South => "South",
            Self::East => "East",
            Self::West => "West",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    Info,
    Question,
    Warning,
    Error,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Question => "question",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Star measurements attached to looping and guiding frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StarInfo {
    pub mass: f64,
    pub snr: f64,
    pub hfd: f64,
}

/// One calibration step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStep {
    pub mount: String,
    pub direction: String,
    pub dist: f64,
    pub dx: f64,
    pub dy: f64,
    pub pos: Point,
    pub step: u32,
    pub state: Option<String>,
}

/// One guide step: measured offset and the correction issued for it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GuideStep {
    pub frame: u32,
    pub time: f64,
    pub mount: String,
    pub dx: f64,
    pub dy: f64,
    pub ra_distance_raw: f64,
    pub dec_distance_raw: f64,
    pub ra_distance_guide: f64,
    pub dec_distance_guide: f64,
    /// Pulse length in ms; zero when no RA correction was issued.
    pub ra_duration: u32,
    pub ra_direction: Option<GuideDirection>,
    pub dec_duration: u32,
    pub dec_direction: Option<GuideDirection>,
    /// Adaptive optics position, only for step guiders.
    pub ao_pos: Option<(i32, i32)>,
    pub star: StarInfo,
    pub avg_dist: f64,
    pub error_code: i32,
    pub ra_limited: bool,
    pub dec_limited: bool,
}

/// A frame in which the guide star could not be measured.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameDropped {
    pub frame: u32,
    pub time: f64,
    pub star: StarInfo,
    pub avg_dist: f64,
    pub error_code: i32,
    pub status: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GuideEvent {
    Version {
        version: String,
        subversion: String,
    },
    LockPositionSet(Point),
    LockPositionLost,
    LockPositionShiftLimitReached,
    StarSelected(Point),
    StarLost(FrameDropped),
    StartCalibration {
        mount: String,
    },
    Calibrating(CalibrationStep),
    CalibrationComplete {
        mount: String,
        limit: Option<i32>,
    },
    CalibrationFailed {
        mount: String,
        reason: String,
    },
    CalibrationDataFlipped {
        mount: String,
    },
    StartGuiding,
    GuidingStopped,
    Paused,
    Resumed,
    GuideStep(GuideStep),
    GuidingDithered {
        dx: f64,
        dy: f64,
    },
    LoopingExposures {
        frame: u32,
        star: Option<StarInfo>,
        error_code: i32,
        status: Option<String>,
    },
    LoopingExposuresStopped,
    SettleBegin,
    Settling {
        distance: f64,
        time: f64,
        settle_time: f64,
        star_locked: bool,
    },
    SettleDone {
        error: Option<String>,
        total_frames: u32,
        dropped_frames: u32,
    },
    AppState(AppState),
    Alert {
        msg: String,
        kind: AlertKind,
    },
    GuideParamChange {
        name: String,
        value: Value,
    },
    ConfigurationChange,
    SingleFrameComplete {
        success: bool,
        error: Option<String>,
        path: Option<String>,
    },
}

impl GuideEvent {
    /// Wire name carried in the envelope's `Event` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Version { .. } => "Version",
            Self::LockPositionSet(_) => "LockPositionSet",
            Self::LockPositionLost => "LockPositionLost",
            Self::LockPositionShiftLimitReached => "LockPositionShiftLimitReached",
            Self::StarSelected(_) => "StarSelected",
            Self::StarLost(_) => "StarLost",
            Self::StartCalibration { .. } => "StartCalibration",
            Self::Calibrating(_) => "Calibrating",
            Self::CalibrationComplete { .. } => "CalibrationComplete",
            Self::CalibrationFailed { .. } => "CalibrationFailed",
            Self::CalibrationDataFlipped { .. } => "CalibrationDataFlipped",
            Self::StartGuiding => "StartGuiding",
            Self::GuidingStopped => "GuidingStopped",
            Self::Paused => "Paused",
            Self::Resumed => "Resumed",
            Self::GuideStep(_) => "GuideStep",
            Self::GuidingDithered { .. } => "GuidingDithered",
            Self::LoopingExposures { .. } => "LoopingExposures",
            Self::LoopingExposuresStopped => "LoopingExposuresStopped",
            Self::SettleBegin => "SettleBegin",
            Self::Settling { .. } => "Settling",
            Self::SettleDone { .. } => "SettleDone",
            Self::AppState(_) => "AppState",
            Self::Alert { .. } => "Alert",
            Self::GuideParamChange { .. } => "GuideParamChange",
            Self::ConfigurationChange => "ConfigurationChange",
            Self::SingleFrameComplete { .. } => "SingleFrameComplete",
        }
    }

    /// Event-specific fields in wire order, excluding the envelope header.
    pub fn fields(&self) -> Map<String, Value> {
        let mut f = Fields::default();
        match self {
            Self::Version { version, subversion } => {
                f.put("PHDVersion", version.as_str())
                    .put("PHDSubver", subversion.as_str())
                    .put("OverlapSupport", true)
                    .put("MsgVersion", MSG_PROTOCOL_VERSION);
            }
            Self::LockPositionSet(pt) | Self::StarSelected(pt) => {
                f.fixed("X", pt.x, 3).fixed("Y", pt.y, 3);
            }
            Self::StarLost(info) => {
                f.put("Frame", info.frame)
                    .fixed("Time", info.time, 3)
                    .fixed("StarMass", info.star.mass, 0)
                    .fixed("SNR", info.star.snr, 2)
                    .fixed("HFD", info.star.hfd, 2)
                    .fixed("AvgDist", info.avg_dist, 2);
                if info.error_code != 0 {
                    f.put("ErrorCode", info.error_code);
                }
                if let Some(status) = info.status.as_deref().filter(|s| !s.is_empty()) {
                    f.put("Status", status);
                }
            }
            Self::StartCalibration { mount } | Self::CalibrationDataFlipped { mount } => {
                f.put("Mount", mount.as_str());
            }
            Self::Calibrating(step) => {
                f.put("Mount", step.mount.as_str())
                    .put("dir", step.direction.as_str())
                    .fixed("dist", step.dist, 3)
                    .fixed("dx", step.dx, 3)
                    .fixed("dy", step.dy, 3)
                    .put(
                        "pos",
                        Value::Array(vec![round(step.pos.x, 2), round(step.pos.y, 2)]),
                    )
                    .put("step", step.step);
                if let Some(state) = step.state.as_deref().filter(|s| !s.is_empty()) {
                    f.put("State", state);
                }
            }
            Self::CalibrationComplete { mount, limit } => {
                f.put("Mount", mount.as_str());
                if let Some(limit) = limit {
                    f.put("Limit", *limit);
                }
            }
            Self::CalibrationFailed { mount, reason } => {
                f.put("Mount", mount.as_str()).put("Reason", reason.as_str());
            }
            Self::StartGuiding
            | Self::GuidingStopped
            | Self::Paused
            | Self::Resumed
            | Self::LockPositionLost
            | Self::LockPositionShiftLimitReached
            | Self::LoopingExposuresStopped
            | Self::SettleBegin
            | Self::ConfigurationChange => {}
            Self::GuideStep(step) => guide_step_fields(&mut f, step),
            Self::GuidingDithered { dx, dy } => {
                f.fixed("dx", *dx, 3).fixed("dy", *dy, 3);
            }
            Self::LoopingExposures {
                frame,
                star,
                error_code,
                status,
            } => {
                f.put("Frame", *frame);
                if let Some(star) = star.filter(|s| s.mass != 0.0) {
                    f.fixed("StarMass", star.mass, 0)
                        .fixed("SNR", star.snr, 2)
                        .fixed("HFD", star.hfd, 2);
                }
                if *error_code != 0 {
                    f.put("ErrorCode", *error_code);
                }
                if let Some(status) = status.as_deref().filter(|s| !s.is_empty()) {
                    f.put("Status", status);
                }
            }
            Self::Settling {
                distance,
                time,
                settle_time,
                star_locked,
            } => {
                f.fixed("Distance", *distance, 2)
                    .fixed("Time", *time, 1)
                    .fixed("SettleTime", *settle_time, 1)
                    .put("StarLocked", *star_locked);
            }
            Self::SettleDone {
                error,
                total_frames,
                dropped_frames,
            } => {
                let error = error.as_deref().filter(|e| !e.is_empty());
                f.put("Status", if error.is_some() { 1 } else { 0 });
                if let Some(error) = error {
                    f.put("Error", error);
                }
                f.put("TotalFrames", *total_frames)
                    .put("DroppedFrames", *dropped_frames);
            }
            Self::AppState(state) => {
                f.put("State", state.as_str());
            }
            Self::Alert { msg, kind } => {
                f.put("Msg", msg.as_str()).put("Type", kind.as_str());
            }
            Self::GuideParamChange { name, value } => {
                f.put("Name", name.as_str()).put("Value", value.clone());
            }
            Self::SingleFrameComplete {
                success,
                error,
                path,
            } => {
                f.put("Success", *success);
                if !success {
                    f.put("Error", error.as_deref().unwrap_or_default());
                }
                if let Some(path) = path {
                    f.put("Path", path.as_str());
                }
            }
        }
        f.0
    }
}

fn guide_step_fields(f: &mut Fields, step: &GuideStep) {
    f.put("Frame", step.frame)
        .fixed("Time", step.time, 3)
        .put("Mount", step.mount.as_str())
        .fixed("dx", step.dx, 3)
        .fixed("dy", step.dy, 3)
        .fixed("RADistanceRaw", step.ra_distance_raw, 3)
        .fixed("DECDistanceRaw", step.dec_distance_raw, 3)
        .fixed("RADistanceGuide", step.ra_distance_guide, 3)
        .fixed("DECDistanceGuide", step.dec_distance_guide, 3);

    if step.ra_duration > 0 {
        f.put("RADuration", step.ra_duration);
        if let Some(dir) = step.ra_direction {
            f.put("RADirection", dir.as_str());
        }
    }
    if step.dec_duration > 0 {
        f.put("DECDuration", step.dec_duration);
        if let Some(dir) = step.dec_direction {
            f.put("DECDirection", dir.as_str());
        }
    }
    if let Some((x, y)) = step.ao_pos {
        f.put("Pos", Value::Array(vec![x.into(), y.into()]));
    }

    f.fixed("StarMass", step.star.mass, 0)
        .fixed("SNR", step.star.snr, 2)
        .fixed("HFD", step.star.hfd, 2)
        .fixed("AvgDist", step.avg_dist, 2);

    if step.error_code != 0 {
        f.put("ErrorCode", step.error_code);
    }
    if step.ra_limited {
        f.put("RALimited", true);
    }
    if step.dec_limited {
        f.put("DecLimited", true);
    }
}

/// Ordered field builder.
#[derive(Default)]
struct Fields(Map<String, Value>);

impl Fields {
    fn put(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    fn fixed(&mut self, name: &str, value: f64, precision: i32) -> &mut Self {
        self.0.insert(name.to_string(), round(value, precision));
        self
    }
}

/// Round to a fixed number of decimals. Non-finite values become `null`.
pub fn round(value: f64, precision: i32) -> Value {
    let scale = 10f64.powi(precision);
    let rounded = (value * scale).round() / scale;
    if precision == 0 && rounded.abs() < i64::MAX as f64 {
        return Value::from(rounded as i64);
    }
    serde_json::Number::from_f64(rounded)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
