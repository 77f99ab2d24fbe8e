//! The guiding method table.
//!
//! Each handler decodes its `params`, validates ranges, and calls into the
//! [`GuidingContext`]. Parameters may be passed by name (an object) or by
//! position (an array, mapped onto the method's declared parameter names).

use std::sync::Arc;

use serde_json::{json, Map, Value};
use skyguide_core::context::GuidingContext;
use skyguide_core::events::Point;
use skyguide_core::params::{
    CalibrationRequest, DitherRequest, GuideRequest, PauseKind, Rect, SettleDuration, SettleParams,
};

use crate::error::HandlerError;
use crate::registry::{HandlerResult, MethodRegistry};

const MIN_EXPOSURE_MS: f64 = 1.0;
const MAX_EXPOSURE_MS: f64 = 60_000.0;

type Method = fn(&dyn GuidingContext, &Value) -> HandlerResult;

/// Method table: wire name and implementation. Aliases share a function.
const METHODS: &[(&str, Method)] = &[
    ("get_connected", get_connected),
    ("set_connected", set_connected),
    ("get_app_state", get_app_state),
    ("get_exposure", get_exposure),
    ("set_exposure", set_exposure),
    ("get_exposure_durations", get_exposure_durations),
    ("get_pixel_scale", get_pixel_scale),
    ("get_profiles", get_profiles),
    ("get_profile", get_profile),
    ("set_profile", set_profile),
    ("get_calibrated", get_calibrated),
    ("get_calibration_status", get_calibration_status),
    ("get_guider_calibration_status", get_calibration_status),
    ("start_capture", start_capture),
    ("loop", start_capture),
    ("stop_capture", stop_capture),
    ("find_star", find_star),
    ("deselect_star", deselect_star),
    ("get_lock_position", get_lock_position),
    ("guide", guide),
    ("start_guider_calibration", start_guider_calibration),
    ("dither", dither),
    ("get_paused", get_paused),
    ("set_paused", set_paused),
    ("get_settling", get_settling),
];

/// Register every guiding method against `context`.
///
/// # Panics
///
/// Panics if any of the names is already registered.
pub fn register_guiding_methods(registry: &mut MethodRegistry, context: Arc<dyn GuidingContext>) {
    for &(name, method) in METHODS {
        let context = Arc::clone(&context);
        registry.register(name, move |params| method(context.as_ref(), params));
    }
}

/// Named view of a request's `params`.
///
/// An object is looked up by key. An array is matched positionally against
/// `names`; extra elements are ignored. Anything else counts as no params.
pub struct Params<'a> {
    values: Vec<(&'static str, &'a Value)>,
}

impl<'a> Params<'a> {
    pub fn new(names: &[&'static str], params: &'a Value) -> Self {
        let values = match params {
            Value::Object(map) => names
                .iter()
                .filter_map(|name| map.get(*name).map(|v| (*name, v)))
                .collect(),
            Value::Array(items) => names.iter().copied().zip(items.iter()).collect(),
            _ => Vec::new(),
        };
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.values
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
            .filter(|v| !v.is_null())
    }
}

fn invalid(msg: impl Into<String>) -> HandlerError {
    HandlerError::invalid_params(msg)
}

/// Booleans, or integers read as C-style truth values.
fn as_flag(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

fn as_int(v: &Value) -> Option<i64> {
    v.as_i64()
}

/// `[x, y, width, height]`, all integers, nothing extra.
fn parse_rect(v: &Value) -> Option<Rect> {
    let items = v.as_array()?;
    if items.len() != 4 {
        return None;
    }
    let mut a = [0i32; 4];
    for (slot, item) in a.iter_mut().zip(items) {
        *slot = i32::try_from(item.as_i64()?).ok()?;
    }
    Some(Rect {
        x: a[0],
        y: a[1],
        width: a[2],
        height: a[3],
    })
}

fn point_value(pt: Point) -> Value {
    json!([pt.x, pt.y])
}

/// Decode a settle object: one of `pixels`/`arcsecs`, one of
/// `time`/`frames`, and `timeout`, all required.
pub fn parse_settle(v: &Value, pixel_scale: Option<f64>) -> Result<SettleParams, String> {
    let obj: &Map<String, Value> = v.as_object().ok_or("settle must be an object")?;
    let number = |key: &str| -> Result<Option<f64>, String> {
        match obj.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| format!("'{key}' must be a number")),
        }
    };

    let tolerance_px = match (number("pixels")?, number("arcsecs")?) {
        (Some(_), Some(_)) => return Err("cannot specify both 'pixels' and 'arcsecs' tolerance".into()),
        (Some(px), None) if px <= 0.0 => return Err("pixels tolerance must be positive".into()),
        (Some(px), None) => px,
        (None, Some(arcsecs)) if arcsecs <= 0.0 => {
            return Err("arcsecs tolerance must be positive".into())
        }
        (None, Some(arcsecs)) => match pixel_scale {
            Some(scale) if scale > 0.0 => arcsecs / scale,
            _ => return Err("camera pixel scale not available for arcsec conversion".into()),
        },
        (None, None) => return Err("settle tolerance required: specify 'pixels' or 'arcsecs'".into()),
    };

    let frames = match obj.get("frames") {
        None => None,
        Some(v) => Some(v.as_i64().ok_or("'frames' must be an integer")?),
    };
    let duration = match (number("time")?, frames) {
        (Some(_), Some(_)) => {
            return Err("cannot specify both 'time' and 'frames' settle duration".into())
        }
        (Some(t), None) if t <= 0.0 => return Err("settle time must be positive".into()),
        (Some(t), None) => SettleDuration::Seconds(t.floor() as u32),
        (None, Some(f)) if f <= 0 => return Err("frames settle duration must be positive".into()),
        (None, Some(f)) => SettleDuration::Frames(u32::try_from(f).unwrap_or(u32::MAX)),
        (None, None) => {
            return Err("settle duration required: specify 'time' or 'frames'".into())
        }
    };

    let timeout_secs = match number("timeout")? {
        Some(t) if t <= 0.0 => return Err("timeout must be positive".into()),
        Some(t) => t.floor() as u32,
        None => return Err("settle timeout required: specify 'timeout'".into()),
    };

    Ok(SettleParams {
        tolerance_px,
        duration,
        timeout_secs,
    })
}

fn settle_param(ctx: &dyn GuidingContext, v: Option<&Value>) -> Result<SettleParams, HandlerError> {
    let v = v.filter(|v| v.is_object()).ok_or_else(|| {
        invalid("missing or invalid 'settle' parameter (must be object with 'pixels'/'arcsecs', 'time'/'frames', 'timeout')")
    })?;
    parse_settle(v, ctx.pixel_scale()).map_err(|e| invalid(format!("settle parameter error: {e}")))
}

fn roi_param(v: Option<&Value>) -> Result<Option<Rect>, HandlerError> {
    match v {
        None => Ok(None),
        Some(v) => parse_rect(v).map(Some).ok_or_else(|| invalid("invalid ROI param")),
    }
}

fn get_connected(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    Ok(json!(ctx.is_connected()))
}

fn set_connected(ctx: &dyn GuidingContext, params: &Value) -> HandlerResult {
    let p = Params::new(&["connected"], params);
    let connected = p
        .get("connected")
        .and_then(Value::as_bool)
        .ok_or_else(|| invalid("expected connected boolean param"))?;
    ctx.set_connected(connected)?;
    Ok(json!(0))
}

fn get_app_state(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    Ok(json!(ctx.app_state().as_str()))
}

fn get_exposure(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    Ok(json!(ctx.exposure_ms()))
}

fn set_exposure(ctx: &dyn GuidingContext, params: &Value) -> HandlerResult {
    let p = Params::new(&["exposure"], params);
    let ms = p.get("exposure").and_then(Value::as_f64).ok_or_else(|| {
        invalid("expected 'exposure' parameter with positive numeric value (milliseconds, typical range 1-5000)")
    })?;
    let ms = ms.trunc();
    if ms < MIN_EXPOSURE_MS {
        return Err(invalid("exposure time too short (minimum 1 millisecond)"));
    }
    if ms > MAX_EXPOSURE_MS {
        return Err(invalid(
            "exposure time too long (maximum 60000 milliseconds / 60 seconds)",
        ));
    }
    ctx.set_exposure_ms(ms as u32)?;
    Ok(json!(0))
}

fn get_exposure_durations(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    Ok(json!(ctx.exposure_durations()))
}

fn get_pixel_scale(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    Ok(ctx.pixel_scale().map_or(Value::Null, |s| json!(s)))
}

fn get_profiles(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    let current = ctx.current_profile().id;
    let profiles: Vec<Value> = ctx
        .profiles()
        .into_iter()
        .map(|profile| {
            let mut entry = json!({ "id": profile.id, "name": profile.name });
            if profile.id == current {
                entry["selected"] = json!(true);
            }
            entry
        })
        .collect();
    Ok(Value::Array(profiles))
}

fn get_profile(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    let profile = ctx.current_profile();
    Ok(json!({ "id": profile.id, "name": profile.name }))
}

fn set_profile(ctx: &dyn GuidingContext, params: &Value) -> HandlerResult {
    let p = Params::new(&["id"], params);
    let id = p
        .get("id")
        .and_then(as_int)
        .ok_or_else(|| invalid("expected profile id param"))?;
    ctx.set_profile(id)?;
    Ok(json!(0))
}

fn get_calibrated(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    Ok(json!(ctx.calibration_status().calibrated()))
}

fn get_calibration_status(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    let status = ctx.calibration_status();
    let mut result = Map::new();
    result.insert("calibrating".into(), json!(status.calibrating()));
    result.insert("state".into(), json!(status.state.as_str()));
    if status.calibrating() {
        if let Some(mount) = &status.mount {
            result.insert("mount".into(), json!(mount));
        }
    }
    if let Some(calibrated) = status.mount_calibrated {
        result.insert("mount_calibrated".into(), json!(calibrated));
    }
    if let Some(calibrated) = status.ao_calibrated {
        result.insert("ao_calibrated".into(), json!(calibrated));
    }
    Ok(Value::Object(result))
}

fn start_capture(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    ctx.start_capture()?;
    Ok(json!(0))
}

fn stop_capture(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    ctx.stop_capture()?;
    Ok(json!(0))
}

fn find_star(ctx: &dyn GuidingContext, params: &Value) -> HandlerResult {
    let p = Params::new(&["roi"], params);
    let roi = roi_param(p.get("roi"))?;
    let star = ctx.find_star(roi)?;
    Ok(point_value(star))
}

fn deselect_star(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    ctx.deselect_star()?;
    Ok(json!(0))
}

fn get_lock_position(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    Ok(ctx.lock_position().map_or(Value::Null, point_value))
}

fn guide(ctx: &dyn GuidingContext, params: &Value) -> HandlerResult {
    let p = Params::new(&["settle", "recalibrate", "roi"], params);
    let settle = settle_param(ctx, p.get("settle"))?;

    if settle.tolerance_px < 0.1 {
        return Err(invalid("settle tolerance too small (minimum 0.1 pixels)"));
    }
    if settle.tolerance_px > 50.0 {
        return Err(invalid("settle tolerance too large (maximum 50 pixels)"));
    }
    if let Some(secs) = settle.settle_secs() {
        if secs < 1 {
            return Err(invalid("settle time too short (minimum 1 second)"));
        }
        if secs > 300 {
            return Err(invalid("settle time too long (maximum 300 seconds)"));
        }
    }
    check_timeout(&settle, "")?;
    if let Some(secs) = settle.settle_secs() {
        if settle.timeout_secs <= secs {
            return Err(invalid("timeout must be greater than settle time"));
        }
    }

    let recalibrate = match p.get("recalibrate") {
        None => false,
        Some(v) => as_flag(v).ok_or_else(|| invalid("expected boolean value for 'recalibrate'"))?,
    };
    let roi = roi_param(p.get("roi"))?;

    ctx.guide(GuideRequest {
        settle,
        recalibrate,
        roi,
    })?;
    Ok(json!(0))
}

fn check_timeout(settle: &SettleParams, prefix: &str) -> Result<(), HandlerError> {
    if settle.timeout_secs < 1 {
        return Err(invalid(format!("{prefix}timeout too short (minimum 1 second)")));
    }
    if settle.timeout_secs > 600 {
        return Err(invalid(format!("{prefix}timeout too long (maximum 600 seconds)")));
    }
    Ok(())
}

fn start_guider_calibration(ctx: &dyn GuidingContext, params: &Value) -> HandlerResult {
    let p = Params::new(&["force_recalibration", "settle", "roi"], params);
    let force_recalibration = match p.get("force_recalibration") {
        None => false,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| invalid("expected bool value for force_recalibration"))?,
    };
    let settle = match p.get("settle") {
        None => SettleParams::calibration_default(),
        Some(v) => parse_settle(v, ctx.pixel_scale()).map_err(invalid)?,
    };
    check_timeout(&settle, "")?;
    let roi = roi_param(p.get("roi"))?;

    ctx.start_calibration(CalibrationRequest {
        force_recalibration,
        settle,
        roi,
    })?;
    Ok(json!(0))
}

fn dither(ctx: &dyn GuidingContext, params: &Value) -> HandlerResult {
    let p = Params::new(&["amount", "raOnly", "settle"], params);
    let amount = p.get("amount").and_then(Value::as_f64).ok_or_else(|| {
        invalid("missing or invalid 'amount' parameter (expected positive number for dither pixels)")
    })?;
    if amount <= 0.0 {
        return Err(invalid("dither amount must be positive (typically 2-20 pixels)"));
    }
    if amount > 100.0 {
        return Err(invalid("dither amount too large (maximum 100 pixels)"));
    }

    let ra_only = match p.get("raOnly") {
        None => false,
        Some(v) => as_flag(v).ok_or_else(|| invalid("invalid 'raOnly' parameter (expected boolean)"))?,
    };

    let settle = settle_param(ctx, p.get("settle"))?;
    if settle.tolerance_px < 0.1 {
        return Err(invalid("dither settle tolerance too small (minimum 0.1 pixels)"));
    }
    check_timeout(&settle, "dither ")?;

    ctx.dither(DitherRequest {
        amount,
        ra_only,
        settle,
    })?;
    Ok(json!(0))
}

fn get_paused(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    Ok(json!(ctx.is_paused()))
}

fn set_paused(ctx: &dyn GuidingContext, params: &Value) -> HandlerResult {
    let p = Params::new(&["paused", "type"], params);
    let paused = p
        .get("paused")
        .and_then(as_flag)
        .ok_or_else(|| invalid("expected bool param at index 0"))?;

    let pause = if paused {
        match p.get("type") {
            None => Some(PauseKind::Guiding),
            Some(Value::String(kind)) if kind == "full" => Some(PauseKind::Full),
            Some(Value::String(_)) => Some(PauseKind::Guiding),
            Some(_) => return Err(invalid("expected string param at index 1")),
        }
    } else {
        None
    };

    ctx.set_paused(pause)?;
    Ok(json!(0))
}

fn get_settling(ctx: &dyn GuidingContext, _: &Value) -> HandlerResult {
    Ok(json!(ctx.is_settling()))
}
