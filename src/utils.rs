use js_sys::Reflect;
use wasm_bindgen::JsValue;

pub fn get_attribute<T>(
    object: &JsValue,
    field_name: &str,
    mapper: impl Fn(&JsValue) -> Option<T>,
) -> Option<T> {
    Reflect::get(object, &JsValue::from_str(field_name))
        .ok()
        .and_then(|x| mapper(&x))
}

pub fn set_attribute(
    object: &JsValue,
    field_name: &str,
    value: &JsValue,
) -> bool {
    Reflect::set(object, &JsValue::from_str(field_name), value)
        .unwrap_or(false)
}

/// Rounds to a number of significant digits.
///
/// Thread counts are computed from ratios of floats that should land on
/// integers, e.g. `49 / 0.05`. Rounding to 14 significant digits first keeps
/// `979.9999999999999` from flooring to 979.
pub fn round_sig(
    value: f64,
    digits: i32,
) -> f64 {
    if value == 0. || !value.is_finite() {
        return value;
    }

    let magnitude = value.abs().log10().floor() as i32 + 1;
    let scale = 10f64.powi(digits - magnitude);

    (value * scale).round() / scale
}

pub fn floor_threads(value: f64) -> usize {
    let value = round_sig(value, 14);
    if !value.is_finite() || value <= 0. {
        return 0;
    }

    value.floor() as usize
}

pub fn ceil_threads(value: f64) -> usize {
    let value = round_sig(value, 14);
    if !value.is_finite() || value <= 0. {
        return 0;
    }

    value.ceil() as usize
}

/// RAM amounts are tracked in hundredths of a GB.
pub fn gb_to_hundredths_floor(gb: f64) -> u64 {
    if gb <= 0. {
        return 0;
    }

    (round_sig(gb * 100., 14)).floor() as u64
}

pub fn gb_to_hundredths_ceil(gb: f64) -> u64 {
    if gb <= 0. {
        return 0;
    }

    (round_sig(gb * 100., 14)).ceil() as u64
}

pub fn format_duration(millis: f64) -> String {
    let secs = millis / 1000.;

    if secs < 60. {
        format!("{:.1}s", secs)
    }
    else if secs < 3600. {
        format!("{}m{:02}s", (secs / 60.) as u64, (secs % 60.) as u64)
    }
    else {
        format!("{}h{:02}m", (secs / 3600.) as u64, ((secs % 3600.) / 60.) as u64)
    }
}

pub fn format_money(money: f64) -> String {
    const SUFFIXES: [&str; 6] = ["", "k", "m", "b", "t", "q"];

    let mut value = money;
    let mut idx = 0;
    while 1000. <= value.abs() && idx < SUFFIXES.len() - 1 {
        value /= 1000.;
        idx += 1;
    }

    format!("${:.2}{}", value, SUFFIXES[idx])
}
