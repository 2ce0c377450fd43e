//! 3x4 affine transforms in 3MF convention
//!
//! 3MF stores placements as twelve whitespace-separated numbers in row-major
//! order: the 3x3 linear part followed by the translation,
//! `m00 m01 m02 m10 m11 m12 m20 m21 m22 tx ty tz`. Points are treated as row
//! vectors in the file format, but every consumer in this crate (and every
//! slicer we feed) applies the matrix as `p' = L·p + t` with `L` read row by
//! row, so that is the convention used here.
//!
//! Transforms are values: composition returns a new transform and nothing is
//! mutated in place.

use serde::{Deserialize, Serialize};

/// A point in model space (millimetres)
pub type Point3 = [f64; 3];

/// Number of tokens in the native 3MF encoding
pub const TRANSFORM_TOKENS: usize = 12;

/// Number of tokens in a homogeneous 4x4 encoding
const HOMOGENEOUS_TOKENS: usize = 16;

/// Values closer to zero than this are written as `0`
const FORMAT_ZERO_EPSILON: f64 = 1e-10;

/// A 3x4 row-major affine transform
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Affine3x4 {
    m: [f64; TRANSFORM_TOKENS],
}

impl Default for Affine3x4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Affine3x4 {
    /// The identity transform
    pub const IDENTITY: Affine3x4 = Affine3x4 {
        m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
    };

    /// Build a transform from its twelve 3MF values
    pub const fn from_values(m: [f64; TRANSFORM_TOKENS]) -> Self {
        Self { m }
    }

    /// Pure translation
    pub const fn translation_of(tx: f64, ty: f64, tz: f64) -> Self {
        Self {
            m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, tx, ty, tz],
        }
    }

    /// Counter-clockwise rotation about +Z by `degrees`
    pub fn rotation_z(degrees: f64) -> Self {
        let rad = degrees.to_radians();
        let (s, c) = rad.sin_cos();
        Self {
            m: [c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
        }
    }

    /// Uniform scale about the origin
    pub const fn scale(factor: f64) -> Self {
        Self {
            m: [
                factor, 0.0, 0.0, 0.0, factor, 0.0, 0.0, 0.0, factor, 0.0, 0.0, 0.0,
            ],
        }
    }

    /// The raw twelve values
    pub fn values(&self) -> &[f64; TRANSFORM_TOKENS] {
        &self.m
    }

    /// Strictly parse a transform attribute
    ///
    /// Accepts 12 tokens (native) or 16 tokens (4x4, homogeneous row dropped).
    /// Returns `None` for any other token count or for non-numeric text.
    pub fn try_parse(text: &str) -> Option<Self> {
        let mut values = Vec::with_capacity(HOMOGENEOUS_TOKENS);
        for token in text.split_whitespace() {
            values.push(token.parse::<f64>().ok()?);
        }

        match values.len() {
            TRANSFORM_TOKENS => {
                let mut m = [0.0; TRANSFORM_TOKENS];
                m.copy_from_slice(&values);
                Some(Self { m })
            }
            HOMOGENEOUS_TOKENS => Some(Self {
                m: [
                    values[0], values[1], values[2], values[4], values[5], values[6], values[8],
                    values[9], values[10], values[12], values[13], values[14],
                ],
            }),
            _ => None,
        }
    }

    /// Leniently parse a transform attribute
    ///
    /// A missing or empty attribute is the identity. Malformed text also
    /// yields the identity and logs a data-quality warning; it never fails.
    pub fn parse(text: &str) -> Self {
        if text.trim().is_empty() {
            return Self::IDENTITY;
        }
        match Self::try_parse(text) {
            Some(t) => t,
            None => {
                tracing::warn!(transform = text, "malformed transform attribute, using identity");
                Self::IDENTITY
            }
        }
    }

    /// Parse an optional attribute value, treating `None` as identity
    pub fn parse_opt(text: Option<&str>) -> Self {
        text.map(Self::parse).unwrap_or(Self::IDENTITY)
    }

    /// Format as a 3MF `transform` attribute value
    pub fn format(&self) -> String {
        self.m
            .iter()
            .map(|v| format_number(*v))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Return `self ∘ other`: apply `other` first, then `self`
    pub fn compose(&self, other: &Affine3x4) -> Affine3x4 {
        let a = &self.m;
        let b = &other.m;
        let mut m = [0.0; TRANSFORM_TOKENS];

        for r in 0..3 {
            for c in 0..3 {
                m[r * 3 + c] = (0..3).map(|k| a[r * 3 + k] * b[k * 3 + c]).sum();
            }
        }
        for r in 0..3 {
            m[9 + r] = (0..3).map(|k| a[r * 3 + k] * b[9 + k]).sum::<f64>() + a[9 + r];
        }

        Affine3x4 { m }
    }

    /// Apply the transform to a point
    pub fn transform_point(&self, p: Point3) -> Point3 {
        let m = &self.m;
        [
            m[0] * p[0] + m[1] * p[1] + m[2] * p[2] + m[9],
            m[3] * p[0] + m[4] * p[1] + m[5] * p[2] + m[10],
            m[6] * p[0] + m[7] * p[1] + m[8] * p[2] + m[11],
        ]
    }

    /// Transform an axis-aligned box, returning the box enclosing all 8 corners
    pub fn transform_aabb(&self, bounds: &Aabb) -> Aabb {
        let mut out = Aabb::empty();
        for i in 0..8 {
            let corner = [
                if i & 1 == 0 { bounds.min[0] } else { bounds.max[0] },
                if i & 2 == 0 { bounds.min[1] } else { bounds.max[1] },
                if i & 4 == 0 { bounds.min[2] } else { bounds.max[2] },
            ];
            out.include(self.transform_point(corner));
        }
        out
    }

    /// Translation components `(tx, ty, tz)`
    pub fn translation(&self) -> Point3 {
        [self.m[9], self.m[10], self.m[11]]
    }

    /// Copy of this transform with the translation replaced
    pub fn with_translation(&self, t: Point3) -> Self {
        let mut m = self.m;
        m[9] = t[0];
        m[10] = t[1];
        m[11] = t[2];
        Self { m }
    }

    /// Copy of this transform with `dx`, `dy` added to the translation
    pub fn translated_xy(&self, dx: f64, dy: f64) -> Self {
        let mut m = self.m;
        m[9] += dx;
        m[10] += dy;
        Self { m }
    }

    /// Rotation about Z implied by the linear part, in degrees
    pub fn rotation_z_deg(&self) -> f64 {
        self.m[3].atan2(self.m[0]).to_degrees()
    }

    /// Element-wise comparison within `tol`
    pub fn approx_eq(&self, other: &Affine3x4, tol: f64) -> bool {
        self.m
            .iter()
            .zip(other.m.iter())
            .all(|(a, b)| (a - b).abs() <= tol)
    }

    /// Whether this is the identity within `tol`
    pub fn is_identity(&self, tol: f64) -> bool {
        self.approx_eq(&Self::IDENTITY, tol)
    }
}

/// Format one number the way slicers expect in transform attributes
///
/// Six decimals, trailing zeros trimmed, always carrying a decimal point so
/// integers read back as floats (`50` becomes `50.0`).
pub fn format_number(v: f64) -> String {
    let v = if v.abs() < FORMAT_ZERO_EPSILON { 0.0 } else { v };
    let fixed = format!("{:.6}", v);
    let mut s = fixed.trim_end_matches('0').trim_end_matches('.').to_string();
    if s.is_empty() || s == "-0" || s == "-" {
        s = "0".to_string();
    }
    if !s.contains('.') && !s.to_ascii_lowercase().contains('e') {
        s.push_str(".0");
    }
    s
}

/// An axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    /// Minimum corner
    pub min: Point3,
    /// Maximum corner
    pub max: Point3,
}

impl Aabb {
    /// Box from two corners
    pub const fn new(min: Point3, max: Point3) -> Self {
        Self { min, max }
    }

    /// The empty box (min = +inf, max = -inf); `union` with it is a no-op
    pub const fn empty() -> Self {
        Self {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
        }
    }

    /// The all-zero box reported for scenes without geometry
    pub const fn zero() -> Self {
        Self {
            min: [0.0; 3],
            max: [0.0; 3],
        }
    }

    /// Whether no point has been included yet
    pub fn is_empty(&self) -> bool {
        self.min[0] > self.max[0] || self.min[1] > self.max[1] || self.min[2] > self.max[2]
    }

    /// Grow to include `p`
    pub fn include(&mut self, p: Point3) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(p[axis]);
            self.max[axis] = self.max[axis].max(p[axis]);
        }
    }

    /// Smallest box containing both
    pub fn union(&self, other: &Aabb) -> Aabb {
        let mut out = *self;
        for axis in 0..3 {
            out.min[axis] = out.min[axis].min(other.min[axis]);
            out.max[axis] = out.max[axis].max(other.max[axis]);
        }
        out
    }

    /// Union over an iterator; `None` when the iterator yields nothing
    pub fn union_all<'a>(boxes: impl IntoIterator<Item = &'a Aabb>) -> Option<Aabb> {
        let merged = boxes
            .into_iter()
            .fold(Aabb::empty(), |acc, b| acc.union(b));
        if merged.is_empty() { None } else { Some(merged) }
    }

    /// Extent along each axis
    pub fn size(&self) -> Point3 {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Centre of the XY footprint
    pub fn center_xy(&self) -> (f64, f64) {
        (
            (self.min[0] + self.max[0]) / 2.0,
            (self.min[1] + self.max[1]) / 2.0,
        )
    }

    /// Copy shifted in X and Y
    pub fn translated_xy(&self, dx: f64, dy: f64) -> Aabb {
        Aabb {
            min: [self.min[0] + dx, self.min[1] + dy, self.min[2]],
            max: [self.max[0] + dx, self.max[1] + dy, self.max[2]],
        }
    }

    /// Whether this box lies inside `[0,x]×[0,y]×[0,z]` within `tol`
    pub fn inside_volume(&self, x: f64, y: f64, z: f64, tol: f64) -> bool {
        self.min[0] >= -tol
            && self.min[1] >= -tol
            && self.min[2] >= -tol
            && self.max[0] <= x + tol
            && self.max[1] <= y + tol
            && self.max[2] <= z + tol
    }

    /// Whether `other` lies entirely inside this box within `tol`
    pub fn contains_aabb(&self, other: &Aabb, tol: f64) -> bool {
        self.contains_point(other.min, tol) && self.contains_point(other.max, tol)
    }

    /// Whether `p` lies inside the box within `tol`
    pub fn contains_point(&self, p: Point3, tol: f64) -> bool {
        (0..3).all(|axis| p[axis] >= self.min[axis] - tol && p[axis] <= self.max[axis] + tol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_native_and_homogeneous() {
        let t = Affine3x4::parse("1 0 0 0 1 0 0 0 1 50 50 0");
        assert_eq!(t.translation(), [50.0, 50.0, 0.0]);

        let h = Affine3x4::parse("1 0 0 0 0 1 0 0 0 0 1 0 5 6 7 1");
        assert_eq!(h.translation(), [5.0, 6.0, 7.0]);
        assert!(h.approx_eq(&Affine3x4::translation_of(5.0, 6.0, 7.0), 1e-12));
    }

    #[test]
    fn test_parse_malformed_is_identity() {
        assert_eq!(Affine3x4::parse("1 0 0"), Affine3x4::IDENTITY);
        assert_eq!(Affine3x4::parse("a b c d e f g h i j k l"), Affine3x4::IDENTITY);
        assert_eq!(Affine3x4::parse(""), Affine3x4::IDENTITY);
        assert!(Affine3x4::try_parse("1 2").is_none());
    }

    #[test]
    fn test_format_trims_zeros() {
        assert_eq!(format_number(50.0), "50.0");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(1e-12), "0.0");
        assert_eq!(format_number(-1e-12), "0.0");
        assert_eq!(format_number(-2.25), "-2.25");
        assert_eq!(format_number(1.23456789), "1.234568");
        assert_eq!(
            Affine3x4::translation_of(60.0, 45.0, 0.0).format(),
            "1.0 0.0 0.0 0.0 1.0 0.0 0.0 0.0 1.0 60.0 45.0 0.0"
        );
    }

    #[test]
    fn test_rotation_90_linear_part() {
        let r = Affine3x4::IDENTITY.compose(&Affine3x4::rotation_z(90.0));
        let expected = [0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        for (got, want) in r.values()[..9].iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-12, "{got} != {want}");
        }
        assert_eq!(r.translation(), [0.0, 0.0, 0.0]);
        assert!((r.rotation_z_deg() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_compose_applies_right_first() {
        let t = Affine3x4::translation_of(10.0, 0.0, 0.0);
        let r = Affine3x4::rotation_z(90.0);
        // rotate, then translate
        let p = t.compose(&r).transform_point([1.0, 0.0, 0.0]);
        assert!((p[0] - 10.0).abs() < 1e-12 && (p[1] - 1.0).abs() < 1e-12);
        // translate, then rotate
        let q = r.compose(&t).transform_point([1.0, 0.0, 0.0]);
        assert!(q[0].abs() < 1e-9 && (q[1] - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_transform_aabb_rotated() {
        let b = Aabb::new([0.0, 0.0, 0.0], [10.0, 20.0, 5.0]);
        let out = Affine3x4::rotation_z(90.0).transform_aabb(&b);
        assert!((out.min[0] + 20.0).abs() < 1e-9);
        assert!((out.max[0]).abs() < 1e-9);
        assert!((out.max[1] - 10.0).abs() < 1e-9);
        assert_eq!(out.max[2], 5.0);
    }

    #[test]
    fn test_aabb_union_all_empty() {
        assert!(Aabb::union_all(std::iter::empty()).is_none());
        let a = Aabb::new([0.0; 3], [1.0; 3]);
        let b = Aabb::new([-1.0; 3], [0.5; 3]);
        let u = Aabb::union_all([&a, &b]).unwrap();
        assert_eq!(u.min, [-1.0; 3]);
        assert_eq!(u.max, [1.0; 3]);
    }

    #[test]
    fn test_aabb_containment() {
        let bed = Aabb::new([0.0; 3], [270.0; 3]);
        let part = Aabb::new([10.0, 10.0, 0.0], [30.0, 30.0, 20.0]);
        assert!(bed.contains_aabb(&part, 0.0));
        assert!(!part.contains_aabb(&bed, 0.0));

        let edge = part.translated_xy(240.0005, 0.0);
        assert!(!bed.contains_aabb(&edge, 0.0));
        assert!(bed.contains_aabb(&edge, 0.001));
    }
}
