//! Slicer settings documents
//!
//! Orca-family slicers store settings as a flat JSON object of string or
//! string-list values. Per-filament settings are lists indexed by filament
//! slot; the slicer indexes them blindly, so every list must have the same
//! length as the active filament count.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Vendor sentinel meaning "use the base default"
const NIL: &str = "nil";

/// Keys whose list values are not per-filament
const NON_FILAMENT_LIST_KEYS: [&str; 4] = [
    "compatible_printers",
    "compatible_prints",
    "print_compatible_printers",
    "bed_temperature_initial_layer_single",
];

/// Keys with their own list shape
const SPECIAL_LIST_KEYS: [&str; 12] = [
    "flush_volumes_matrix",
    "flush_volumes_vector",
    "different_settings_to_system",
    "inherits_group",
    "upward_compatible_machine",
    "printable_area",
    "bed_exclude_area",
    "thumbnails",
    "head_wrap_detect_zone",
    "extruder_offset",
    "wipe_tower_x",
    "wipe_tower_y",
];

/// Prime tower position keys
pub const WIPE_TOWER_KEYS: [&str; 2] = ["wipe_tower_x", "wipe_tower_y"];

/// Smallest half-footprint kept between the tower centre and the bed edge (mm)
const TOWER_MIN_HALF_SPAN: f64 = 12.0;

/// Extra clearance around the tower and its brim (mm)
const TOWER_MARGIN: f64 = 6.0;

/// A flat settings document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsDoc(Map<String, Value>);

impl From<Map<String, Value>> for SettingsDoc {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl SettingsDoc {
    /// Empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON object
    pub fn from_json(text: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::Profile(format!(
                "settings document must be a JSON object, found {}",
                json_type(&other)
            ))),
        }
    }

    /// Pretty-printed JSON with two-space indentation
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.0)?)
    }

    /// The underlying map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Value by key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Set a value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Set a value only when the key is absent
    pub fn insert_default(&mut self, key: &str, value: impl Into<Value>) {
        if !self.0.contains_key(key) {
            self.0.insert(key.to_string(), value.into());
        }
    }

    /// Remove a key
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the document has no keys
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `other`; its keys win
    pub fn merge(&mut self, other: &Map<String, Value>) {
        for (key, value) in other {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Replace `"nil"` list entries with the first real value of the list
    ///
    /// Keys whose lists hold nothing but `"nil"` are removed. Returns the
    /// number of lists fixed and keys removed.
    pub fn sanitize_nil(&mut self) -> (usize, usize) {
        let mut fixed = 0;
        let mut removed = Vec::new();
        for (key, value) in self.0.iter_mut() {
            let Value::Array(items) = value else {
                continue;
            };
            if !items.iter().any(is_nil) {
                continue;
            }
            match items.iter().find(|v| !is_nil(v)).cloned() {
                Some(default) => {
                    for item in items.iter_mut().filter(|v| is_nil(v)) {
                        *item = default.clone();
                    }
                    fixed += 1;
                }
                None => removed.push(key.clone()),
            }
        }
        for key in &removed {
            self.0.remove(key);
        }
        if fixed > 0 || !removed.is_empty() {
            tracing::info!(fixed, removed = removed.len(), "sanitized nil settings values");
        }
        (fixed, removed.len())
    }

    /// Extend every short per-filament list to `target` by repeating its last value
    ///
    /// Never truncates. Returns the number of lists padded.
    pub fn pad_filament_arrays(&mut self, target: usize) -> usize {
        let mut padded = 0;
        for (key, value) in self.0.iter_mut() {
            if NON_FILAMENT_LIST_KEYS.contains(&key.as_str()) {
                continue;
            }
            if let Value::Array(items) = value {
                if !items.is_empty() && items.len() < target {
                    repeat_last(items, target);
                    padded += 1;
                }
            }
        }
        if padded > 0 {
            tracing::info!(padded, target, "padded per-filament arrays");
        }
        padded
    }

    /// Resize every per-filament list to exactly `target` entries
    ///
    /// `flush_volumes_matrix` is resized to `target²` and
    /// `flush_volumes_vector` to `2·target`. Other special-shape keys are
    /// left alone. Returns the number of lists adjusted.
    pub fn normalize_filament_arrays(&mut self, target: usize) -> usize {
        let mut adjusted = 0;
        for (key, value) in self.0.iter_mut() {
            let key = key.as_str();
            if NON_FILAMENT_LIST_KEYS.contains(&key) || SPECIAL_LIST_KEYS.contains(&key) {
                continue;
            }
            if let Value::Array(items) = value {
                if resize_list(items, target) {
                    adjusted += 1;
                }
            }
        }
        for (key, needed) in [
            ("flush_volumes_matrix", target * target),
            ("flush_volumes_vector", target * 2),
        ] {
            if let Some(Value::Array(items)) = self.0.get_mut(key) {
                if resize_list(items, needed) {
                    adjusted += 1;
                }
            }
        }
        if adjusted > 0 {
            tracing::info!(adjusted, target, "normalized per-filament arrays");
        }
        adjusted
    }

    /// Coerce an index-like value to an integer string of at least `minimum`
    ///
    /// Unparseable values become `minimum`. Absent keys stay absent.
    pub fn sanitize_index_field(&mut self, key: &str, minimum: i64) {
        let Some(raw) = self.0.get(key) else {
            return;
        };
        let numeric = value_text(raw)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| v.trunc() as i64)
            .unwrap_or(minimum)
            .max(minimum);
        self.0.insert(key.to_string(), Value::String(numeric.to_string()));
    }

    /// Numeric value of a scalar or the first entry of a list
    pub fn numeric(&self, key: &str, fallback: f64) -> f64 {
        let value = match self.0.get(key) {
            Some(Value::Array(items)) if !items.is_empty() => &items[0],
            Some(v) => v,
            None => return fallback,
        };
        value_text(value).trim().parse().unwrap_or(fallback)
    }

    /// Keep the prime tower footprint, brim included, inside a square bed
    ///
    /// Positions are clamped to `[half, bed − half]` where
    /// `half = max(12, width/2 + brim + 6)`. Lists keep their shape and
    /// unparseable entries are kept as text.
    pub fn clamp_wipe_tower(&mut self, bed_size: f64) {
        let width = self.numeric("prime_tower_width", 35.0);
        let brim = self.numeric("prime_tower_brim_width", 3.0).max(0.0);
        let half = TOWER_MIN_HALF_SPAN.max(width / 2.0 + brim + TOWER_MARGIN);
        let (lo, hi) = (half, (bed_size - half).max(half));

        for key in WIPE_TOWER_KEYS {
            let Some(raw) = self.0.get_mut(key) else {
                continue;
            };
            match raw {
                Value::Array(items) if !items.is_empty() => {
                    for item in items.iter_mut() {
                        *item = Value::String(clamp_position(item, lo, hi));
                    }
                }
                Value::Array(_) => {}
                scalar => *scalar = Value::String(clamp_position(scalar, lo, hi)),
            }
        }
    }

    /// Whether the tower position is stored per plate
    pub fn has_per_plate_wipe_tower(&self) -> bool {
        WIPE_TOWER_KEYS
            .iter()
            .any(|k| matches!(self.0.get(*k), Some(Value::Array(_))))
    }

    /// Replicate scalar tower overrides across the per-plate lists of `base`
    pub fn replicate_wipe_tower_overrides(&mut self, base: &SettingsDoc, overrides: &Map<String, Value>) {
        for key in WIPE_TOWER_KEYS {
            let Some(Value::Array(plates)) = base.get(key) else {
                continue;
            };
            if plates.is_empty() || !overrides.contains_key(key) {
                continue;
            }
            let text = self.0.get(key).map(value_text).unwrap_or_default();
            self.0.insert(
                key.to_string(),
                Value::Array(vec![Value::String(text); plates.len()]),
            );
        }
    }

    /// Make `key` a list of at least `target` entries
    ///
    /// Missing or empty values start from `fallback`.
    pub fn pad_list(&mut self, key: &str, target: usize, fallback: &[&str]) {
        let values = match self.0.remove(key) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(scalar) => vec![scalar],
        };
        let values = if values.is_empty() {
            fallback.iter().map(|s| Value::String((*s).to_string())).collect()
        } else {
            values
        };
        let default = fallback.last().map(|s| Value::String((*s).to_string()));
        self.0
            .insert(key.to_string(), Value::Array(pad_list(values, target, default)));
    }

    /// Drop `filament_start_gcode` when it carries vendor-only macros
    pub fn strip_vendor_filament_gcode(&mut self) -> bool {
        let vendor_only = matches!(
            self.0.get("filament_start_gcode"),
            Some(Value::Array(items)) if items.iter().any(|g| {
                let text = value_text(g);
                text.contains("M142") || text.contains("air_filtration")
            })
        );
        if vendor_only {
            self.0.remove("filament_start_gcode");
            tracing::info!("stripped vendor-specific filament_start_gcode");
        }
        vendor_only
    }

    /// Number of entries in a list value, if it is a non-empty list
    pub fn list_len(&self, key: &str) -> Option<usize> {
        match self.0.get(key) {
            Some(Value::Array(items)) if !items.is_empty() => Some(items.len()),
            _ => None,
        }
    }

    /// Centre of the `printable_area` polygon
    pub fn printable_area_center(&self) -> Option<(f64, f64)> {
        self.0.get("printable_area").and_then(printable_area_center)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn is_nil(value: &Value) -> bool {
    matches!(value, Value::String(s) if s == NIL)
}

fn repeat_last(items: &mut Vec<Value>, target: usize) {
    if let Some(last) = items.last().cloned() {
        items.resize(target, last);
    }
}

/// Pad with the last entry or truncate; returns whether the list changed
fn resize_list(items: &mut Vec<Value>, target: usize) -> bool {
    if items.is_empty() || items.len() == target {
        return false;
    }
    if items.len() < target {
        repeat_last(items, target);
    } else {
        items.truncate(target);
    }
    true
}

fn clamp_position(value: &Value, lo: f64, hi: f64) -> String {
    let text = value_text(value);
    match text.trim().parse::<f64>() {
        Ok(v) if !v.is_nan() => format!("{:.3}", v.clamp(lo, hi)),
        _ => text,
    }
}

/// Text form of a settings value
///
/// Strings are returned as they are; everything else uses its JSON form.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Extend `values` to `target` by repeating the last entry
///
/// An empty list starts from `default`. Lists already long enough are
/// returned unchanged, as is everything when `target` is zero.
pub fn pad_list(mut values: Vec<Value>, target: usize, default: Option<Value>) -> Vec<Value> {
    if target == 0 {
        return values;
    }
    if values.is_empty() {
        values.extend(default);
    }
    if values.len() < target {
        repeat_last(&mut values, target);
    }
    values
}

/// Centre of a `printable_area` list of `"XxY"` points
///
/// Needs at least three points; any malformed point yields `None`.
pub fn printable_area_center(value: &Value) -> Option<(f64, f64)> {
    let Value::Array(points) = value else {
        return None;
    };
    if points.len() < 3 {
        return None;
    }
    let mut min = (f64::INFINITY, f64::INFINITY);
    let mut max = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for point in points {
        let text = value_text(point);
        let mut parts = text.split('x');
        let (Some(x), Some(y), None) = (parts.next(), parts.next(), parts.next()) else {
            return None;
        };
        let (x, y): (f64, f64) = (x.trim().parse().ok()?, y.trim().parse().ok()?);
        min = (min.0.min(x), min.1.min(y));
        max = (max.0.max(x), max.1.max(y));
    }
    Some(((min.0 + max.0) / 2.0, (min.1 + max.1) / 2.0))
}

/// Remove per-extruder flow calibration blocks from start G-code
///
/// Each block is a `{if (is_extruder_used[N])}` guard, one
/// `SM_PRINT_FLOW_CALIBRATE` line and `{endif}`. The section header comment
/// that introduces the blocks goes too.
pub fn strip_flow_calibrate(gcode: &str) -> String {
    let lines: Vec<&str> = gcode.split_inclusive('\n').collect();
    let mut out = String::with_capacity(gcode.len());
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if is_extruder_guard(line)
            && lines
                .get(i + 1)
                .is_some_and(|l| l.starts_with("SM_PRINT_FLOW_CALIBRATE") && l.ends_with('\n'))
        {
            if let Some(rest) = lines.get(i + 2).and_then(|l| l.strip_prefix("{endif}")) {
                out.push_str(rest.strip_prefix('\n').unwrap_or(rest));
                i += 3;
                continue;
            }
        }
        if !is_flow_header(line) {
            out.push_str(line);
        }
        i += 1;
    }
    out
}

fn is_extruder_guard(line: &str) -> bool {
    line.strip_prefix("{if (is_extruder_used[")
        .and_then(|rest| rest.strip_suffix("])}\n"))
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

fn is_flow_header(line: &str) -> bool {
    let Some(body) = line.strip_suffix('\n').and_then(|l| l.strip_prefix(";=")) else {
        return false;
    };
    let Some(rest) = body.trim_start_matches('=').strip_prefix(" 挤出流量") else {
        return false;
    };
    let tail = rest.trim_start();
    tail.len() < rest.len() && !tail.is_empty() && tail.bytes().all(|b| b == b'=')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> SettingsDoc {
        match value {
            Value::Object(map) => SettingsDoc::from(map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_merge_later_wins() {
        let mut base = doc(json!({"a": "1", "b": ["x"]}));
        base.merge(json!({"b": ["y", "z"], "c": "3"}).as_object().unwrap());
        assert_eq!(base.get("a"), Some(&json!("1")));
        assert_eq!(base.get("b"), Some(&json!(["y", "z"])));
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn test_sanitize_nil() {
        let mut d = doc(json!({
            "temps": ["nil", "215", "nil"],
            "all_nil": ["nil", "nil"],
            "scalar": "nil",
            "clean": ["1"]
        }));
        assert_eq!(d.sanitize_nil(), (1, 1));
        assert_eq!(d.get("temps"), Some(&json!(["215", "215", "215"])));
        assert!(!d.contains_key("all_nil"));
        // scalars are not touched
        assert_eq!(d.get("scalar"), Some(&json!("nil")));

        let mut leading = doc(json!({"nozzle_temperature": ["nil", "nil", "210"]}));
        assert_eq!(leading.sanitize_nil(), (1, 0));
        assert_eq!(leading.get("nozzle_temperature"), Some(&json!(["210", "210", "210"])));
    }

    #[test]
    fn test_normalize_filament_arrays() {
        let mut d = doc(json!({
            "filament_type": ["PLA", "PETG"],
            "nozzle_temperature": ["210", "220", "230", "240", "250"],
            "compatible_printers": ["a"],
            "printable_area": ["0x0", "270x0", "270x270", "0x270"],
            "flush_volumes_matrix": ["0", "1", "2", "3"],
            "flush_volumes_vector": ["70"],
            "empty": []
        }));
        assert_eq!(d.normalize_filament_arrays(3), 4);
        assert_eq!(d.get("filament_type"), Some(&json!(["PLA", "PETG", "PETG"])));
        assert_eq!(d.get("nozzle_temperature"), Some(&json!(["210", "220", "230"])));
        assert_eq!(d.get("compatible_printers"), Some(&json!(["a"])));
        assert_eq!(d.list_len("printable_area"), Some(4));
        assert_eq!(d.list_len("flush_volumes_matrix"), Some(9));
        assert_eq!(d.list_len("flush_volumes_vector"), Some(6));
        assert_eq!(d.get("empty"), Some(&json!([])));
    }

    #[test]
    fn test_pad_never_truncates() {
        let mut d = doc(json!({"a": ["1"], "b": ["1", "2", "3", "4", "5"], "compatible_prints": ["x"]}));
        assert_eq!(d.pad_filament_arrays(4), 1);
        assert_eq!(d.list_len("a"), Some(4));
        assert_eq!(d.list_len("b"), Some(5));
        assert_eq!(d.list_len("compatible_prints"), Some(1));
    }

    #[test]
    fn test_sanitize_index_field() {
        let mut d = doc(json!({"wall_filament": "0", "prime_volume": "-3.7", "raft": "abc", "n": 2.9}));
        d.sanitize_index_field("wall_filament", 1);
        d.sanitize_index_field("prime_volume", 0);
        d.sanitize_index_field("raft", 0);
        d.sanitize_index_field("n", 0);
        d.sanitize_index_field("absent", 1);
        assert_eq!(d.get("wall_filament"), Some(&json!("1")));
        assert_eq!(d.get("prime_volume"), Some(&json!("0")));
        assert_eq!(d.get("raft"), Some(&json!("0")));
        assert_eq!(d.get("n"), Some(&json!("2")));
        assert!(!d.contains_key("absent"));
    }

    #[test]
    fn test_clamp_wipe_tower() {
        let mut d = doc(json!({
            "prime_tower_width": ["40"],
            "prime_tower_brim_width": "4",
            "wipe_tower_x": "15",
            "wipe_tower_y": ["300", "abc", "100"]
        }));
        d.clamp_wipe_tower(270.0);
        // half = 20 + 4 + 6 = 30
        assert_eq!(d.get("wipe_tower_x"), Some(&json!("30.000")));
        assert_eq!(d.get("wipe_tower_y"), Some(&json!(["240.000", "abc", "100.000"])));

        let mut narrow = doc(json!({"prime_tower_width": "2", "prime_tower_brim_width": "-5", "wipe_tower_x": "1"}));
        narrow.clamp_wipe_tower(270.0);
        assert_eq!(narrow.get("wipe_tower_x"), Some(&json!("12.000")));
    }

    #[test]
    fn test_replicate_wipe_tower_overrides() {
        let base = doc(json!({"wipe_tower_x": ["10", "20", "30"], "wipe_tower_y": "5"}));
        let mut d = doc(json!({"wipe_tower_x": "150", "wipe_tower_y": "90"}));
        let overrides = json!({"wipe_tower_x": "150", "wipe_tower_y": "90"});
        d.replicate_wipe_tower_overrides(&base, overrides.as_object().unwrap());
        assert_eq!(d.get("wipe_tower_x"), Some(&json!(["150", "150", "150"])));
        assert_eq!(d.get("wipe_tower_y"), Some(&json!("90")));
        assert!(base.has_per_plate_wipe_tower());
    }

    #[test]
    fn test_pad_list() {
        assert_eq!(pad_list(vec![], 3, Some(json!("PLA"))), vec![json!("PLA"); 3]);
        assert_eq!(pad_list(vec![json!("a"), json!("b")], 3, None), vec![json!("a"), json!("b"), json!("b")]);
        assert_eq!(pad_list(vec![json!("a")], 0, None), vec![json!("a")]);

        let mut d = doc(json!({"filament_type": "PETG"}));
        d.pad_list("filament_type", 2, &["PLA"]);
        d.pad_list("filament_colour", 2, &["#FFFFFF"]);
        assert_eq!(d.get("filament_type"), Some(&json!(["PETG", "PETG"])));
        assert_eq!(d.get("filament_colour"), Some(&json!(["#FFFFFF", "#FFFFFF"])));
    }

    #[test]
    fn test_numeric() {
        let d = doc(json!({"a": ["0.4", "0.6"], "b": " 7 ", "c": "x", "d": 3}));
        assert_eq!(d.numeric("a", 1.0), 0.4);
        assert_eq!(d.numeric("b", 1.0), 7.0);
        assert_eq!(d.numeric("c", 1.0), 1.0);
        assert_eq!(d.numeric("d", 1.0), 3.0);
        assert_eq!(d.numeric("missing", 2.5), 2.5);
    }

    #[test]
    fn test_printable_area_center() {
        let area = json!(["-0.5x-1", "270.5x-1", "270.5x271", "-0.5x271"]);
        assert_eq!(printable_area_center(&area), Some((135.0, 135.0)));
        assert_eq!(printable_area_center(&json!(["0x0", "1x1"])), None);
        assert_eq!(printable_area_center(&json!(["0x0", "1x1", "bad"])), None);
        assert_eq!(printable_area_center(&json!("0x0")), None);
    }

    #[test]
    fn test_strip_vendor_filament_gcode() {
        let mut d = doc(json!({"filament_start_gcode": ["; hi\nM142 P1"]}));
        assert!(d.strip_vendor_filament_gcode());
        assert!(!d.contains_key("filament_start_gcode"));

        let mut keep = doc(json!({"filament_start_gcode": ["M104 S200"]}));
        assert!(!keep.strip_vendor_filament_gcode());
    }

    #[test]
    fn test_strip_flow_calibrate() {
        let gcode = "G28\n;===== 挤出流量 =====\n{if (is_extruder_used[0])}\nSM_PRINT_FLOW_CALIBRATE INDEX=0\n{endif}\n{if (is_extruder_used[1])}\nSM_PRINT_FLOW_CALIBRATE INDEX=1\n{endif}\nG1 X0\n";
        assert_eq!(strip_flow_calibrate(gcode), "G28\nG1 X0\n");

        let untouched = "{if (is_extruder_used[0])}\nM104 S200\n{endif}\n";
        assert_eq!(strip_flow_calibrate(untouched), untouched);
    }

    #[test]
    fn test_from_json_rejects_non_object() {
        assert!(SettingsDoc::from_json("[1, 2]").is_err());
        assert_eq!(SettingsDoc::from_json("{\"a\": \"1\"}").unwrap().len(), 1);
    }
}
