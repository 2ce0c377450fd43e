//! Property-based tests for plate-bridge
//!
//! These tests use proptest to generate random transforms, bounding boxes,
//! settings documents and toolpaths, and check that the invariants the
//! pipeline relies on hold across a wide range of inputs.

use plate_bridge::gcode;
use plate_bridge::profile::SettingsDoc;
use plate_bridge::{Aabb, Affine3x4};
use proptest::prelude::*;
use serde_json::{Map, Value};

// ============================================================================
// Generators
// ============================================================================

/// A transform with a bounded linear part and a bed-scale translation
fn affine_strategy() -> impl Strategy<Value = Affine3x4> {
    (
        prop::array::uniform9(-10.0f64..10.0),
        prop::array::uniform3(-1000.0f64..1000.0),
    )
        .prop_map(|(l, t)| {
            Affine3x4::from_values([l[0], l[1], l[2], l[3], l[4], l[5], l[6], l[7], l[8], t[0], t[1], t[2]])
        })
}

/// Rotation about Z plus a translation, as build items carry them
fn placement_strategy() -> impl Strategy<Value = Affine3x4> {
    (-360.0f64..360.0, -500.0f64..500.0, -500.0f64..500.0)
        .prop_map(|(deg, x, y)| Affine3x4::rotation_z(deg).with_translation([x, y, 0.0]))
}

/// A non-empty box
fn aabb_strategy() -> impl Strategy<Value = Aabb> {
    (
        prop::array::uniform3(-200.0f64..200.0),
        prop::array::uniform3(0.0f64..200.0),
    )
        .prop_map(|(min, size)| Aabb::new(min, [min[0] + size[0], min[1] + size[1], min[2] + size[2]]))
}

/// A per-filament list of 0..6 string entries
fn list_strategy() -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec("[0-9]{1,3}", 0..6).prop_map(|v| v.into_iter().map(Value::String).collect())
}

fn max_abs_diff(a: &Affine3x4, b: &Affine3x4) -> f64 {
    a.values()
        .iter()
        .zip(b.values())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

// ============================================================================
// Affine kernel
// ============================================================================

proptest! {
    #[test]
    fn prop_format_then_parse_is_stable(t in affine_strategy()) {
        let text = t.format();
        let parsed = Affine3x4::try_parse(&text);
        prop_assert!(parsed.is_some(), "formatted transform did not parse: {}", text);
        let parsed = parsed.unwrap();
        // six decimals are written
        prop_assert!(max_abs_diff(&parsed, &t) <= 5e-7);
        // a second round trip is exact
        prop_assert_eq!(parsed.format(), text);
    }

    #[test]
    fn prop_identity_is_neutral(t in affine_strategy()) {
        prop_assert!(Affine3x4::IDENTITY.compose(&t).approx_eq(&t, 1e-12));
        prop_assert!(t.compose(&Affine3x4::IDENTITY).approx_eq(&t, 1e-12));
    }

    #[test]
    fn prop_compose_is_associative(
        a in affine_strategy(),
        b in affine_strategy(),
        c in affine_strategy(),
    ) {
        let left = a.compose(&b).compose(&c);
        let right = a.compose(&b.compose(&c));
        let scale = left.values().iter().map(|v| v.abs()).fold(1.0, f64::max);
        prop_assert!(max_abs_diff(&left, &right) <= 1e-9 * scale);
    }

    #[test]
    fn prop_compose_applies_right_operand_first(
        a in affine_strategy(),
        b in affine_strategy(),
        p in prop::array::uniform3(-100.0f64..100.0),
    ) {
        let direct = a.compose(&b).transform_point(p);
        let stepwise = a.transform_point(b.transform_point(p));
        for axis in 0..3 {
            let tol = 1e-9 * direct[axis].abs().max(1.0) * 1e3;
            prop_assert!((direct[axis] - stepwise[axis]).abs() <= tol);
        }
    }

    #[test]
    fn prop_transformed_box_encloses_transformed_points(
        t in placement_strategy(),
        b in aabb_strategy(),
        fx in 0.0f64..=1.0,
        fy in 0.0f64..=1.0,
        fz in 0.0f64..=1.0,
    ) {
        let outer = t.transform_aabb(&b);
        let p = [
            b.min[0] + fx * (b.max[0] - b.min[0]),
            b.min[1] + fy * (b.max[1] - b.min[1]),
            b.min[2] + fz * (b.max[2] - b.min[2]),
        ];
        prop_assert!(outer.contains_point(t.transform_point(p), 1e-6));
    }

    #[test]
    fn prop_rotation_survives_placement(deg in -179.0f64..179.0, x in -500.0f64..500.0) {
        let t = Affine3x4::rotation_z(deg).translated_xy(x, 0.0);
        prop_assert!((t.rotation_z_deg() - deg).abs() < 1e-6);
        prop_assert!((t.translation()[0] - x).abs() < 1e-9);
    }
}

// ============================================================================
// Settings documents
// ============================================================================

proptest! {
    #[test]
    fn prop_normalize_sizes_every_filament_list(
        lists in prop::collection::btree_map("[a-z_]{3,12}", list_strategy(), 0..8),
        matrix in prop::collection::vec("[0-9]{1,3}", 1..40),
        vector in prop::collection::vec("[0-9]{1,3}", 1..16),
        target in 1usize..6,
    ) {
        let mut map = Map::new();
        for (key, values) in &lists {
            map.insert(format!("filament_{}", key), Value::Array(values.clone()));
        }
        map.insert("compatible_printers".to_string(), Value::Array(vec![Value::from("a")]));
        map.insert("printable_area".to_string(), Value::Array(vec![Value::from("0x0"); 4]));
        map.insert("layer_height".to_string(), Value::from("0.2"));
        map.insert("flush_volumes_matrix".to_string(), Value::from(matrix));
        map.insert("flush_volumes_vector".to_string(), Value::from(vector));
        let mut doc = SettingsDoc::from(map);

        doc.normalize_filament_arrays(target);

        for (key, values) in &lists {
            let len = doc.list_len(&format!("filament_{}", key));
            if values.is_empty() {
                prop_assert_eq!(len, None);
            } else {
                prop_assert_eq!(len, Some(target));
            }
        }
        prop_assert_eq!(doc.list_len("flush_volumes_matrix"), Some(target * target));
        prop_assert_eq!(doc.list_len("flush_volumes_vector"), Some(2 * target));
        prop_assert_eq!(doc.list_len("compatible_printers"), Some(1));
        prop_assert_eq!(doc.list_len("printable_area"), Some(4));
        prop_assert_eq!(doc.get("layer_height"), Some(&Value::from("0.2")));
    }

    #[test]
    fn prop_padding_never_truncates(values in list_strategy(), target in 0usize..6) {
        let mut map = Map::new();
        map.insert("nozzle_temperature".to_string(), Value::Array(values.clone()));
        let mut doc = SettingsDoc::from(map);

        doc.pad_filament_arrays(target);

        let expected = (!values.is_empty()).then(|| values.len().max(target));
        prop_assert_eq!(doc.list_len("nozzle_temperature"), expected);
    }
}

// ============================================================================
// G-code scanning
// ============================================================================

proptest! {
    #[test]
    fn prop_bounds_cover_every_extrusion(
        points in prop::collection::vec((0.0f64..270.0, 0.0f64..270.0), 1..40),
    ) {
        let mut text = String::from("G90\nM83\nG1 X0 Y0 Z0.2\n");
        for (x, y) in &points {
            text.push_str(&format!("G1 X{:.3} Y{:.3} E0.5\n", x, y));
        }

        let extent = gcode::bounds(text.as_bytes()).unwrap();
        let segments = gcode::parse_segments(text.as_bytes(), &gcode::ParseOptions::default()).unwrap();
        match extent {
            Some(b) => {
                for segment in &segments.extrusions {
                    prop_assert!(b.contains_point(segment.to, 1e-9));
                    prop_assert!(b.contains_point(segment.from, 1e-9));
                }
            }
            None => prop_assert!(segments.extrusions.is_empty()),
        }
    }

    #[test]
    fn prop_scanner_accepts_arbitrary_lines(lines in prop::collection::vec(".{0,40}", 0..30)) {
        let text = lines.join("\n");
        prop_assert!(gcode::bounds(text.as_bytes()).is_ok());
        prop_assert!(!gcode::tools_used(text.as_bytes()).unwrap().is_empty());
        prop_assert!(gcode::layers(text.as_bytes(), 0, 5).is_ok());
    }
}
