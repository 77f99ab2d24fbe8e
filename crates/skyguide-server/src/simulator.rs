//! In-process guider used by the binary and the tests.
//!
//! Advances one exposure per [`SimulatedGuider::tick`]. Star motion is a
//! deterministic oscillation so runs are reproducible.

use std::sync::Arc;

use parking_lot::Mutex;
use skyguide_core::context::{
    CalibrationStatus, EventSink, GuiderSnapshot, GuiderState, GuidingContext, Profile,
};
use skyguide_core::errors::GuideError;
use skyguide_core::events::{
    AppState, CalibrationStep, GuideDirection, GuideEvent, GuideStep, Point, StarInfo,
};
use skyguide_core::params::{
    CalibrationRequest, DitherRequest, GuideRequest, PauseKind, Rect, SettleDuration, SettleParams,
};

const MOUNT: &str = "Mount";
/// Steps per calibration leg.
const CALIBRATION_STEPS: u32 = 4;
const DEFAULT_STAR: Point = Point { x: 512.3, y: 384.7 };
const STAR: StarInfo = StarInfo {
    mass: 14_500.0,
    snr: 32.5,
    hfd: 2.41,
};
const EXPOSURE_DURATIONS: &[u32] = &[
    100, 200, 300, 500, 1000, 1500, 2000, 2500, 3000, 3500, 4000, 4500, 5000, 10000, 15000,
];

#[derive(Debug)]
struct Settle {
    params: SettleParams,
    /// Initial offset from the lock position, decays each frame.
    offset: f64,
    frames: u32,
    in_range_secs: f64,
    in_range_frames: u32,
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    exposure_ms: u32,
    profiles: Vec<Profile>,
    profile_id: i64,
    state: GuiderState,
    capturing: bool,
    paused: Option<PauseKind>,
    calibrated: bool,
    calibration_step: u32,
    lock_position: Option<Point>,
    star_position: Option<Point>,
    frame: u32,
    elapsed_secs: f64,
    /// Settle to start once calibration finishes.
    pending_settle: Option<SettleParams>,
    settle: Option<Settle>,
}

impl SimState {
    fn new() -> Self {
        Self {
            connected: false,
            exposure_ms: 1000,
            profiles: vec![
                Profile {
                    id: 1,
                    name: "Simulator".into(),
                },
                Profile {
                    id: 2,
                    name: "Simulator (AO)".into(),
                },
            ],
            profile_id: 1,
            state: GuiderState::Uninitialized,
            capturing: false,
            paused: None,
            calibrated: false,
            calibration_step: 0,
            lock_position: None,
            star_position: None,
            frame: 0,
            elapsed_secs: 0.0,
            pending_settle: None,
            settle: None,
        }
    }

    fn app_state(&self) -> AppState {
        if !self.capturing {
            return AppState::Stopped;
        }
        if self.paused.is_some() {
            return AppState::Paused;
        }
        match self.state {
            GuiderState::CalibratingPrimary | GuiderState::CalibratingSecondary => {
                AppState::Calibrating
            }
            GuiderState::Guiding => AppState::Guiding,
            GuiderState::Selected | GuiderState::Calibrated => AppState::Selected,
            _ => AppState::Looping,
        }
    }

    fn snapshot(&self) -> GuiderSnapshot {
        GuiderSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            subversion: String::new(),
            app_state: self.app_state(),
            lock_position: self.lock_position,
            star_position: self.star_position,
            calibrated_mounts: if self.calibrated {
                vec![(MOUNT.to_string(), None)]
            } else {
                Vec::new()
            },
            calibrating_mount: self.state.is_calibrating().then(|| MOUNT.to_string()),
        }
    }

    fn exposure_secs(&self) -> f64 {
        f64::from(self.exposure_ms) / 1000.0
    }

    fn require_idle(&self) -> Result<(), GuideError> {
        if self.state.is_calibrating() || self.state == GuiderState::Guiding {
            return Err(GuideError::Busy);
        }
        Ok(())
    }

    fn start_looping(&mut self, events: &mut Vec<GuideEvent>) {
        if self.capturing {
            return;
        }
        self.capturing = true;
        self.state = GuiderState::Selecting;
        events.push(GuideEvent::AppState(self.app_state()));
    }

    fn select_star(&mut self, at: Point, events: &mut Vec<GuideEvent>) {
        self.star_position = Some(at);
        self.lock_position = Some(at);
        self.state = GuiderState::Selected;
        events.push(GuideEvent::StarSelected(at));
        events.push(GuideEvent::LockPositionSet(at));
    }

    fn begin_calibration(&mut self, settle: SettleParams, events: &mut Vec<GuideEvent>) {
        self.state = GuiderState::CalibratingPrimary;
        self.calibration_step = 0;
        self.calibrated = false;
        self.pending_settle = Some(settle);
        events.push(GuideEvent::StartCalibration {
            mount: MOUNT.into(),
        });
        events.push(GuideEvent::AppState(self.app_state()));
    }

    fn begin_guiding(&mut self, settle: SettleParams, events: &mut Vec<GuideEvent>) {
        self.state = GuiderState::Guiding;
        events.push(GuideEvent::StartGuiding);
        events.push(GuideEvent::AppState(self.app_state()));
        self.begin_settle(settle, 0.4, events);
    }

    fn begin_settle(&mut self, params: SettleParams, offset: f64, events: &mut Vec<GuideEvent>) {
        if self.settle.is_some() {
            self.finish_settle(Some("settling interrupted".into()), events);
        }
        self.settle = Some(Settle {
            params,
            offset,
            frames: 0,
            in_range_secs: 0.0,
            in_range_frames: 0,
        });
        events.push(GuideEvent::SettleBegin);
    }

    fn finish_settle(&mut self, error: Option<String>, events: &mut Vec<GuideEvent>) {
        if let Some(settle) = self.settle.take() {
            events.push(GuideEvent::SettleDone {
                error,
                total_frames: settle.frames,
                dropped_frames: 0,
            });
        }
    }

    fn stop(&mut self, events: &mut Vec<GuideEvent>) {
        if !self.capturing {
            return;
        }
        if self.settle.is_some() {
            self.finish_settle(Some("guiding stopped".into()), events);
        }
        if self.state == GuiderState::Guiding || self.state.is_calibrating() {
            events.push(GuideEvent::GuidingStopped);
        } else {
            events.push(GuideEvent::LoopingExposuresStopped);
        }
        self.capturing = false;
        self.paused = None;
        self.pending_settle = None;
        self.state = if self.star_position.is_some() {
            GuiderState::Selected
        } else {
            GuiderState::Uninitialized
        };
        events.push(GuideEvent::AppState(AppState::Stopped));
    }

    fn tick(&mut self, events: &mut Vec<GuideEvent>) {
        if !self.capturing || self.paused == Some(PauseKind::Full) {
            return;
        }
        self.frame += 1;
        self.elapsed_secs += self.exposure_secs();

        match self.state {
            GuiderState::CalibratingPrimary | GuiderState::CalibratingSecondary => {
                self.calibration_tick(events)
            }
            GuiderState::Guiding => self.guide_tick(events),
            _ => events.push(GuideEvent::LoopingExposures {
                frame: self.frame,
                star: self.star_position.map(|_| STAR),
                error_code: 0,
                status: None,
            }),
        }
    }

    fn calibration_tick(&mut self, events: &mut Vec<GuideEvent>) {
        self.calibration_step += 1;
        let step = self.calibration_step;
        let (direction, leg_step) = if step <= CALIBRATION_STEPS {
            (GuideDirection::West, step)
        } else {
            (GuideDirection::North, step - CALIBRATION_STEPS)
        };
        let dist = 2.5 * f64::from(leg_step);
        let (dx, dy) = match direction {
            GuideDirection::West => (dist, 0.0),
            _ => (0.0, dist),
        };
        let origin = self.lock_position.unwrap_or(DEFAULT_STAR);
        events.push(GuideEvent::Calibrating(CalibrationStep {
            mount: MOUNT.into(),
            direction: direction.as_str().into(),
            dist,
            dx,
            dy,
            pos: Point::new(origin.x + dx, origin.y + dy),
            step: leg_step,
            state: Some(format!("{} {} steps", direction.as_str(), leg_step)),
        }));

        if step >= 2 * CALIBRATION_STEPS {
            self.calibrated = true;
            self.state = GuiderState::Calibrated;
            events.push(GuideEvent::CalibrationComplete {
                mount: MOUNT.into(),
                limit: None,
            });
            let settle = self
                .pending_settle
                .take()
                .unwrap_or_else(SettleParams::calibration_default);
            self.begin_guiding(settle, events);
        }
    }

    fn guide_tick(&mut self, events: &mut Vec<GuideEvent>) {
        let phase = f64::from(self.frame) * 0.7;
        let settle_offset = self.settle.as_ref().map_or(0.0, |s| s.offset);
        let dx = 0.18 * phase.sin() + settle_offset;
        let dy = 0.12 * phase.cos();
        let guiding = self.paused.is_none();

        let (ra_duration, ra_direction) = pulse(dx, GuideDirection::West, GuideDirection::East);
        let (dec_duration, dec_direction) = pulse(dy, GuideDirection::North, GuideDirection::South);
        let distance = dx.hypot(dy);
        events.push(GuideEvent::GuideStep(GuideStep {
            frame: self.frame,
            time: self.elapsed_secs,
            mount: MOUNT.into(),
            dx,
            dy,
            ra_distance_raw: dx,
            dec_distance_raw: dy,
            ra_distance_guide: dx * 0.7,
            dec_distance_guide: dy * 0.7,
            ra_duration: if guiding { ra_duration } else { 0 },
            ra_direction,
            dec_duration: if guiding { dec_duration } else { 0 },
            dec_direction,
            ao_pos: None,
            star: STAR,
            avg_dist: distance,
            error_code: 0,
            ra_limited: false,
            dec_limited: false,
        }));

        let exposure_secs = self.exposure_secs();
        let Some(settle) = self.settle.as_mut() else {
            return;
        };
        settle.frames += 1;
        settle.offset *= 0.5;
        let elapsed = f64::from(settle.frames) * exposure_secs;
        if distance <= settle.params.tolerance_px {
            settle.in_range_secs += exposure_secs;
            settle.in_range_frames += 1;
        } else {
            settle.in_range_secs = 0.0;
            settle.in_range_frames = 0;
        }
        let (settled, settle_time) = match settle.params.duration {
            SettleDuration::Seconds(secs) => {
                (settle.in_range_secs >= f64::from(secs), f64::from(secs))
            }
            SettleDuration::Frames(frames) => (
                settle.in_range_frames >= frames,
                f64::from(frames) * exposure_secs,
            ),
        };
        events.push(GuideEvent::Settling {
            distance,
            time: settle.in_range_secs,
            settle_time,
            star_locked: true,
        });

        if settled {
            self.finish_settle(None, events);
        } else if elapsed >= f64::from(settle.params.timeout_secs) {
            self.finish_settle(Some("timed-out waiting for guider to settle".into()), events);
        }
    }
}

/// Pulse length and direction for an offset; small offsets get none.
fn pulse(offset: f64, positive: GuideDirection, negative: GuideDirection) -> (u32, Option<GuideDirection>) {
    if offset.abs() < 0.05 {
        return (0, None);
    }
    let ms = (offset.abs() * 150.0).round() as u32;
    let dir = if offset > 0.0 { positive } else { negative };
    (ms, Some(dir))
}

/// Simulated camera, mount and guider.
pub struct SimulatedGuider {
    state: Mutex<SimState>,
    sink: Arc<dyn EventSink>,
}

impl SimulatedGuider {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            state: Mutex::new(SimState::new()),
            sink,
        }
    }

    /// Run `f` under the state lock and emit what it produced before the
    /// lock is released. Lock order is guider state, then the sink's own
    /// locks; the sink must not call back into the guider.
    fn with_state<T>(&self, f: impl FnOnce(&mut SimState, &mut Vec<GuideEvent>) -> T) -> T {
        let mut state = self.state.lock();
        let mut events = Vec::new();
        let result = f(&mut state, &mut events);
        for event in events {
            self.sink.notify(event);
        }
        result
    }

    /// Advance one exposure.
    pub fn tick(&self) {
        self.with_state(|state, events| state.tick(events));
    }

    /// Current exposure, for pacing [`tick`](Self::tick).
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(u64::from(self.state.lock().exposure_ms))
    }

    fn start_guiding(&self, settle: SettleParams, recalibrate: bool, roi: Option<Rect>) -> Result<(), GuideError> {
        self.with_state(|state, events| {
            if !state.connected {
                return Err(GuideError::CameraNotConnected);
            }
            if state.state == GuiderState::Guiding && !recalibrate {
                state.begin_settle(settle, 0.4, events);
                return Ok(());
            }
            state.require_idle()?;
            if state.paused.take().is_some() {
                events.push(GuideEvent::Resumed);
            }
            state.start_looping(events);
            if state.star_position.is_none() {
                state.select_star(star_in(roi), events);
            }
            if !state.calibrated || recalibrate {
                state.begin_calibration(settle, events);
            } else {
                state.begin_guiding(settle, events);
            }
            Ok(())
        })
    }
}

fn star_in(roi: Option<Rect>) -> Point {
    match roi {
        Some(r) => Point::new(
            f64::from(r.x) + f64::from(r.width) / 2.0 + 0.3,
            f64::from(r.y) + f64::from(r.height) / 2.0 + 0.7,
        ),
        None => DEFAULT_STAR,
    }
}

impl GuidingContext for SimulatedGuider {
    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn set_connected(&self, connected: bool) -> Result<(), GuideError> {
        self.with_state(|state, events| {
            if !connected {
                state.stop(events);
            }
            if state.connected != connected {
                state.connected = connected;
                events.push(GuideEvent::ConfigurationChange);
            }
            Ok(())
        })
    }

    fn exposure_ms(&self) -> u32 {
        self.state.lock().exposure_ms
    }

    fn set_exposure_ms(&self, ms: u32) -> Result<(), GuideError> {
        self.with_state(|state, events| {
            if !state.connected {
                return Err(GuideError::CameraNotConnected);
            }
            state.exposure_ms = ms;
            events.push(GuideEvent::ConfigurationChange);
            Ok(())
        })
    }

    fn exposure_durations(&self) -> Vec<u32> {
        EXPOSURE_DURATIONS.to_vec()
    }

    fn pixel_scale(&self) -> Option<f64> {
        Some(1.5)
    }

    fn profiles(&self) -> Vec<Profile> {
        self.state.lock().profiles.clone()
    }

    fn current_profile(&self) -> Profile {
        let state = self.state.lock();
        state
            .profiles
            .iter()
            .find(|p| p.id == state.profile_id)
            .cloned()
            .unwrap_or_else(|| state.profiles[0].clone())
    }

    fn set_profile(&self, id: i64) -> Result<(), GuideError> {
        self.with_state(|state, events| {
            if !state.profiles.iter().any(|p| p.id == id) {
                return Err(GuideError::UnknownProfile(id));
            }
            if state.connected {
                return Err(GuideError::Failed(
                    "cannot change profile when equipment is connected".into(),
                ));
            }
            if state.profile_id != id {
                state.profile_id = id;
                state.calibrated = false;
                events.push(GuideEvent::ConfigurationChange);
            }
            Ok(())
        })
    }

    fn app_state(&self) -> AppState {
        self.state.lock().app_state()
    }

    fn calibration_status(&self) -> CalibrationStatus {
        let state = self.state.lock();
        CalibrationStatus {
            state: state.state,
            mount: state.state.is_calibrating().then(|| MOUNT.to_string()),
            mount_calibrated: Some(state.calibrated),
            ao_calibrated: None,
        }
    }

    fn is_paused(&self) -> bool {
        self.state.lock().paused.is_some()
    }

    fn is_settling(&self) -> bool {
        self.state.lock().settle.is_some()
    }

    fn lock_position(&self) -> Option<Point> {
        self.state.lock().lock_position
    }

    fn snapshot(&self) -> GuiderSnapshot {
        self.state.lock().snapshot()
    }

    fn with_snapshot(&self, f: &mut dyn FnMut(&GuiderSnapshot)) {
        let state = self.state.lock();
        f(&state.snapshot());
    }

    fn start_capture(&self) -> Result<(), GuideError> {
        self.with_state(|state, events| {
            if !state.connected {
                return Err(GuideError::CameraNotConnected);
            }
            state.start_looping(events);
            Ok(())
        })
    }

    fn stop_capture(&self) -> Result<(), GuideError> {
        self.with_state(|state, events| {
            state.stop(events);
            Ok(())
        })
    }

    fn find_star(&self, roi: Option<Rect>) -> Result<Point, GuideError> {
        self.with_state(|state, events| {
            if !state.capturing {
                return Err(GuideError::InvalidState(
                    "cannot find star while not looping".into(),
                ));
            }
            state.require_idle()?;
            if let Some(r) = roi {
                if r.width <= 0 || r.height <= 0 {
                    return Err(GuideError::StarNotFound);
                }
            }
            let at = star_in(roi);
            state.select_star(at, events);
            Ok(at)
        })
    }

    fn deselect_star(&self) -> Result<(), GuideError> {
        self.with_state(|state, events| {
            state.require_idle()?;
            if state.star_position.take().is_some() {
                state.lock_position = None;
                events.push(GuideEvent::LockPositionLost);
            }
            if state.capturing {
                state.state = GuiderState::Selecting;
            } else {
                state.state = GuiderState::Uninitialized;
            }
            Ok(())
        })
    }

    fn guide(&self, request: GuideRequest) -> Result<(), GuideError> {
        self.start_guiding(request.settle, request.recalibrate, request.roi)
    }

    fn start_calibration(&self, request: CalibrationRequest) -> Result<(), GuideError> {
        self.start_guiding(request.settle, request.force_recalibration, request.roi)
    }

    fn dither(&self, request: DitherRequest) -> Result<(), GuideError> {
        self.with_state(|state, events| {
            if state.state != GuiderState::Guiding {
                return Err(GuideError::InvalidState("cannot dither if not guiding".into()));
            }
            let dx = request.amount * 0.6;
            let dy = if request.ra_only {
                0.0
            } else {
                -request.amount * 0.4
            };
            if let Some(lock) = state.lock_position.as_mut() {
                lock.x += dx;
                lock.y += dy;
                let moved = *lock;
                events.push(GuideEvent::LockPositionSet(moved));
            }
            events.push(GuideEvent::GuidingDithered { dx, dy });
            state.begin_settle(request.settle, dx.hypot(dy), events);
            Ok(())
        })
    }

    fn set_paused(&self, pause: Option<PauseKind>) -> Result<(), GuideError> {
        self.with_state(|state, events| {
            let was_paused = state.paused.is_some();
            state.paused = pause;
            match (was_paused, pause.is_some()) {
                (false, true) => {
                    events.push(GuideEvent::Paused);
                    events.push(GuideEvent::AppState(state.app_state()));
                }
                (true, false) => {
                    events.push(GuideEvent::Resumed);
                    events.push(GuideEvent::AppState(state.app_state()));
                }
                _ => {}
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<GuideEvent>>);

    impl EventSink for Recorder {
        fn notify(&self, event: GuideEvent) {
            self.0.lock().push(event);
        }
    }

    impl Recorder {
        fn take_names(&self) -> Vec<&'static str> {
            self.0.lock().drain(..).map(|e| e.name()).collect()
        }
    }

    fn setup() -> (SimulatedGuider, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let guider = SimulatedGuider::new(recorder.clone());
        (guider, recorder)
    }

    fn settle(secs: u32) -> SettleParams {
        SettleParams {
            tolerance_px: 1.5,
            duration: SettleDuration::Seconds(secs),
            timeout_secs: 60,
        }
    }

    #[test]
    fn transitions_wait_while_a_snapshot_is_held() {
        let (guider, recorder) = setup();
        guider.set_connected(true).unwrap();
        recorder.take_names();
        let guider = Arc::new(guider);

        let mut worker = None;
        let mut during = None;
        guider.with_snapshot(&mut |snap: &GuiderSnapshot| {
            let g = Arc::clone(&guider);
            let handle = std::thread::spawn(move || g.start_capture());
            std::thread::sleep(std::time::Duration::from_millis(50));
            during = Some((snap.app_state, recorder.take_names(), handle.is_finished()));
            worker = Some(handle);
        });
        worker.unwrap().join().unwrap().unwrap();

        assert_eq!(during, Some((AppState::Stopped, Vec::new(), false)));
        assert_eq!(recorder.take_names(), vec!["AppState"]);
        assert_eq!(guider.snapshot().app_state, AppState::Looping);
    }

    #[test]
    fn capture_requires_connection() {
        let (guider, _) = setup();
        assert_eq!(guider.start_capture(), Err(GuideError::CameraNotConnected));
        guider.set_connected(true).unwrap();
        guider.start_capture().unwrap();
        assert_eq!(guider.app_state(), AppState::Looping);
    }

    #[test]
    fn looping_emits_frames() {
        let (guider, events) = setup();
        guider.set_connected(true).unwrap();
        guider.start_capture().unwrap();
        events.take_names();

        guider.tick();
        guider.tick();
        assert_eq!(events.take_names(), vec!["LoopingExposures", "LoopingExposures"]);

        guider.stop_capture().unwrap();
        assert_eq!(events.take_names(), vec!["LoopingExposuresStopped", "AppState"]);
        assert_eq!(guider.app_state(), AppState::Stopped);
    }

    #[test]
    fn guide_calibrates_then_guides_and_settles() {
        let (guider, events) = setup();
        guider.set_connected(true).unwrap();
        events.take_names();

        guider
            .guide(GuideRequest {
                settle: settle(2),
                recalibrate: false,
                roi: None,
            })
            .unwrap();
        assert_eq!(
            events.take_names(),
            vec!["AppState", "StarSelected", "LockPositionSet", "StartCalibration", "AppState"]
        );
        assert!(guider.calibration_status().calibrating());

        for _ in 0..2 * CALIBRATION_STEPS {
            guider.tick();
        }
        let names = events.take_names();
        assert_eq!(names.iter().filter(|n| **n == "Calibrating").count(), 8);
        assert!(names.ends_with(&["CalibrationComplete", "StartGuiding", "AppState", "SettleBegin"]));
        assert_eq!(guider.app_state(), AppState::Guiding);
        assert!(guider.is_settling());

        for _ in 0..10 {
            guider.tick();
        }
        let names = events.take_names();
        assert!(names.contains(&"GuideStep"));
        assert!(names.contains(&"SettleDone"));
        assert!(!guider.is_settling());
    }

    #[test]
    fn dither_requires_guiding() {
        let (guider, events) = setup();
        let request = DitherRequest {
            amount: 5.0,
            ra_only: false,
            settle: settle(1),
        };
        assert!(matches!(guider.dither(request.clone()), Err(GuideError::InvalidState(_))));

        guider.set_connected(true).unwrap();
        guider
            .guide(GuideRequest {
                settle: settle(1),
                recalibrate: false,
                roi: None,
            })
            .unwrap();
        for _ in 0..2 * CALIBRATION_STEPS {
            guider.tick();
        }
        events.take_names();

        let before = guider.lock_position().unwrap();
        guider.dither(request).unwrap();
        let after = guider.lock_position().unwrap();
        assert!((after.x - before.x - 3.0).abs() < 1e-9);
        assert!((after.y - before.y + 2.0).abs() < 1e-9);
        // the settle begun by guiding is cut short by the dither
        assert_eq!(
            events.take_names(),
            vec!["LockPositionSet", "GuidingDithered", "SettleDone", "SettleBegin"]
        );
    }

    #[test]
    fn pause_and_resume() {
        let (guider, events) = setup();
        guider.set_connected(true).unwrap();
        guider.start_capture().unwrap();
        events.take_names();

        guider.set_paused(Some(PauseKind::Full)).unwrap();
        assert_eq!(guider.app_state(), AppState::Paused);
        guider.tick();
        guider.set_paused(None).unwrap();
        assert_eq!(
            events.take_names(),
            vec!["Paused", "AppState", "Resumed", "AppState"]
        );
    }

    #[test]
    fn snapshot_reflects_state() {
        let (guider, _) = setup();
        let snap = guider.snapshot();
        assert_eq!(snap.app_state, AppState::Stopped);
        assert!(snap.lock_position.is_none());

        guider.set_connected(true).unwrap();
        guider.start_capture().unwrap();
        let at = guider.find_star(None).unwrap();
        let snap = guider.snapshot();
        assert_eq!(snap.lock_position, Some(at));
        assert_eq!(snap.app_state, AppState::Selected);
    }

    #[test]
    fn disconnect_stops_capture() {
        let (guider, _) = setup();
        guider.set_connected(true).unwrap();
        guider.start_capture().unwrap();
        guider.set_connected(false).unwrap();
        assert_eq!(guider.app_state(), AppState::Stopped);
        assert!(!guider.is_connected());
    }

    #[test]
    fn profile_change_needs_disconnect() {
        let (guider, _) = setup();
        guider.set_connected(true).unwrap();
        assert!(matches!(guider.set_profile(2), Err(GuideError::Failed(_))));
        guider.set_connected(false).unwrap();
        guider.set_profile(2).unwrap();
        assert_eq!(guider.current_profile().id, 2);
    }
}
