//! Narrow interface between the event server and the guiding engine.
//!
//! The server only ever talks to the engine through [`GuidingContext`]; the
//! engine only ever talks back through an [`EventSink`]. Calls into the
//! context must not block on I/O: long operations (calibration, guiding,
//! dithering) return once accepted and report progress as events.

use serde::{Deserialize, Serialize};

use crate::errors::GuideError;
use crate::events::{AppState, GuideEvent, Point};
use crate::params::{CalibrationRequest, DitherRequest, GuideRequest, PauseKind, Rect};

/// Receiver for engine events.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: GuideEvent);
}

/// Sink that discards everything. Useful before the server is started.
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, _event: GuideEvent) {}
}

/// A saved equipment profile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
}

/// Internal guider state, finer-grained than [`AppState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuiderState {
    Uninitialized,
    Selecting,
    Selected,
    CalibratingPrimary,
    CalibratingSecondary,
    Calibrated,
    Guiding,
}

impl GuiderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Selecting => "Selecting",
            Self::Selected => "Selected",
            Self::CalibratingPrimary => "CalibratingPrimary",
            Self::CalibratingSecondary => "CalibratingSecondary",
            Self::Calibrated => "Calibrated",
            Self::Guiding => "Guiding",
        }
    }

    pub fn is_calibrating(&self) -> bool {
        matches!(self, Self::CalibratingPrimary | Self::CalibratingSecondary)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStatus {
    pub state: GuiderState,
    /// Which mount is being calibrated, while calibrating.
    pub mount: Option<String>,
    pub mount_calibrated: Option<bool>,
    pub ao_calibrated: Option<bool>,
}

impl CalibrationStatus {
    pub fn calibrating(&self) -> bool {
        self.state.is_calibrating()
    }

    /// True when every attached mount has a calibration.
    pub fn calibrated(&self) -> bool {
        self.mount_calibrated.unwrap_or(false) && self.ao_calibrated.unwrap_or(true)
    }
}

/// Everything a newly connected client needs to catch up with the guider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuiderSnapshot {
    pub version: String,
    pub subversion: String,
    pub app_state: AppState,
    pub lock_position: Option<Point>,
    pub star_position: Option<Point>,
    /// Calibrated mounts as `(name, AO travel limit)`.
    pub calibrated_mounts: Vec<(String, Option<i32>)>,
    /// Mount currently being calibrated, if any.
    pub calibrating_mount: Option<String>,
}

impl GuiderSnapshot {
    /// Catch-up events in the order a new client must see them.
    pub fn catchup_events(&self) -> Vec<GuideEvent> {
        let mut events = vec![GuideEvent::Version {
            version: self.version.clone(),
            subversion: self.subversion.clone(),
        }];

        if let Some(pt) = self.lock_position {
            events.push(GuideEvent::LockPositionSet(pt));
        }
        if let Some(pt) = self.star_position {
            events.push(GuideEvent::StarSelected(pt));
        }
        for (mount, limit) in &self.calibrated_mounts {
            events.push(GuideEvent::CalibrationComplete {
                mount: mount.clone(),
                limit: *limit,
            });
        }

        match self.app_state {
            AppState::Guiding => events.push(GuideEvent::StartGuiding),
            AppState::Calibrating => events.push(GuideEvent::StartCalibration {
                mount: self
                    .calibrating_mount
                    .clone()
                    .unwrap_or_else(|| "Mount".to_string()),
            }),
            AppState::Paused => events.push(GuideEvent::Paused),
            _ => {}
        }

        events.push(GuideEvent::AppState(self.app_state));
        events
    }
}

/// The guiding engine as seen by RPC handlers.
pub trait GuidingContext: Send + Sync {
    // Equipment
    fn is_connected(&self) -> bool;
    fn set_connected(&self, connected: bool) -> Result<(), GuideError>;

    // Exposure
    fn exposure_ms(&self) -> u32;
    fn set_exposure_ms(&self, ms: u32) -> Result<(), GuideError>;
    fn exposure_durations(&self) -> Vec<u32>;
    /// Image scale in arc-seconds per pixel, when known.
    fn pixel_scale(&self) -> Option<f64>;

    // Profiles
    fn profiles(&self) -> Vec<Profile>;
    fn current_profile(&self) -> Profile;
    fn set_profile(&self, id: i64) -> Result<(), GuideError>;

    // State
    fn app_state(&self) -> AppState;
    fn calibration_status(&self) -> CalibrationStatus;
    fn is_paused(&self) -> bool;
    fn is_settling(&self) -> bool;
    fn lock_position(&self) -> Option<Point>;
    fn snapshot(&self) -> GuiderSnapshot;

    /// Run `f` with the current snapshot. Engines that notify their sink
    /// while holding their state lock keep it held across `f`, so a client
    /// registered inside `f` sees each transition once: either in the
    /// snapshot or as an event, never both.
    fn with_snapshot(&self, f: &mut dyn FnMut(&GuiderSnapshot)) {
        f(&self.snapshot());
    }

    // Operations
    fn start_capture(&self) -> Result<(), GuideError>;
    fn stop_capture(&self) -> Result<(), GuideError>;
    fn find_star(&self, roi: Option<Rect>) -> Result<Point, GuideError>;
    fn deselect_star(&self) -> Result<(), GuideError>;
    fn guide(&self, request: GuideRequest) -> Result<(), GuideError>;
    fn start_calibration(&self, request: CalibrationRequest) -> Result<(), GuideError>;
    fn dither(&self, request: DitherRequest) -> Result<(), GuideError>;
    fn set_paused(&self, pause: Option<PauseKind>) -> Result<(), GuideError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(state: AppState) -> GuiderSnapshot {
        GuiderSnapshot {
            version: "2.6.13".into(),
            subversion: String::new(),
            app_state: state,
            lock_position: None,
            star_position: None,
            calibrated_mounts: Vec::new(),
            calibrating_mount: None,
        }
    }

    fn names(events: &[GuideEvent]) -> Vec<&'static str> {
        events.iter().map(GuideEvent::name).collect()
    }

    #[test]
    fn idle_catchup_is_version_then_state() {
        let events = snapshot(AppState::Stopped).catchup_events();
        assert_eq!(names(&events), vec!["Version", "AppState"]);
    }

    #[test]
    fn guiding_catchup_order() {
        let mut snap = snapshot(AppState::Guiding);
        snap.lock_position = Some(Point::new(10.0, 20.0));
        snap.star_position = Some(Point::new(10.5, 20.5));
        snap.calibrated_mounts = vec![("Mount".into(), None), ("AO".into(), Some(45))];

        let events = snap.catchup_events();
        assert_eq!(
            names(&events),
            vec![
                "Version",
                "LockPositionSet",
                "StarSelected",
                "CalibrationComplete",
                "CalibrationComplete",
                "StartGuiding",
                "AppState",
            ]
        );
    }

    #[test]
    fn calibrating_catchup_names_mount() {
        let mut snap = snapshot(AppState::Calibrating);
        snap.calibrating_mount = Some("AO".into());
        let events = snap.catchup_events();
        assert_eq!(
            events[1],
            GuideEvent::StartCalibration { mount: "AO".into() }
        );
    }

    #[test]
    fn calibration_status_flags() {
        let status = CalibrationStatus {
            state: GuiderState::CalibratingSecondary,
            mount: Some("AO".into()),
            mount_calibrated: Some(true),
            ao_calibrated: Some(false),
        };
        assert!(status.calibrating());
        assert!(!status.calibrated());

        let status = CalibrationStatus {
            state: GuiderState::Calibrated,
            mount: None,
            mount_calibrated: Some(true),
            ao_calibrated: None,
        };
        assert!(status.calibrated());
    }
}
