//! Multi-view preview rasterizer
//!
//! Draws one segment set three ways on a landscape canvas: an oblique view
//! of the whole bed in the left square, a top view in the upper right and a
//! front view in the lower right.

use super::parser::{Segment, SegmentSet};
use crate::error::Result;
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// Tool colours used when none are given
pub const DEFAULT_TOOL_COLORS: [[u8; 3]; 8] = [
    [59, 130, 246],
    [239, 68, 68],
    [34, 197, 94],
    [234, 179, 8],
    [168, 85, 247],
    [236, 72, 153],
    [20, 184, 166],
    [249, 115, 22],
];

const BACKGROUND: Rgb<u8> = Rgb([26, 26, 26]);
const TRAVEL: Rgb<u8> = Rgb([60, 40, 40]);
const BED_OUTLINE: Rgb<u8> = Rgb([70, 70, 70]);
const DIVIDER: Rgb<u8> = Rgb([50, 50, 50]);
const LABEL: Rgb<u8> = Rgb([80, 80, 80]);
const PLACEHOLDER_MARK: Rgb<u8> = Rgb([120, 120, 120]);

/// Channel sum below which a custom colour is lifted
const DARK_SUM: u16 = 80;
/// Floor applied to each channel of a lifted colour
const DARK_FLOOR: u8 = 60;

/// cos 45° and sin 45°, as the oblique view uses them
const DIAG: f64 = 0.7071;

/// Preview settings
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    /// Canvas height in pixels; the width is 1.5 times this
    pub size: u32,
    /// Square bed edge (mm)
    pub bed_size: f64,
    /// Tool colours as `#rgb` or `#rrggbb`, indexed by tool
    pub filament_colors: Vec<String>,
    /// Extrusion line width in pixels
    pub line_width: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            size: 800,
            bed_size: 270.0,
            filament_colors: Vec::new(),
            line_width: 1,
        }
    }
}

/// Parse `#rgb` or `#rrggbb`; anything else becomes the first default colour
pub fn hex_to_rgb(text: &str) -> [u8; 3] {
    let hex = text.trim_start_matches('#');
    let expanded: String = if hex.len() == 3 {
        hex.chars().flat_map(|c| [c, c]).collect()
    } else {
        hex.to_string()
    };
    let channel = |i: usize| {
        expanded
            .get(i..i + 2)
            .and_then(|h| u8::from_str_radix(h, 16).ok())
    };
    match (channel(0), channel(2), channel(4)) {
        (Some(r), Some(g), Some(b)) => [r, g, b],
        _ => DEFAULT_TOOL_COLORS[0],
    }
}

/// Palette indexed by tool number
///
/// Entries that are not hex strings fall back to the default colour for
/// their slot. Near-black custom colours are lifted so they show on the dark
/// background.
pub fn tool_palette(colors: &[String]) -> Vec<[u8; 3]> {
    if colors.is_empty() {
        return DEFAULT_TOOL_COLORS.to_vec();
    }
    colors
        .iter()
        .enumerate()
        .map(|(i, c)| {
            if !c.starts_with('#') {
                return DEFAULT_TOOL_COLORS[i % DEFAULT_TOOL_COLORS.len()];
            }
            let rgb = hex_to_rgb(c);
            if rgb.iter().map(|&v| u16::from(v)).sum::<u16>() < DARK_SUM {
                rgb.map(|v| v.max(DARK_FLOOR))
            } else {
                rgb
            }
        })
        .collect()
}

/// Render the three views
///
/// An empty set yields the placeholder canvas.
pub fn render_views(set: &SegmentSet, options: &RenderOptions) -> RgbImage {
    let layout = Layout::new(options.size);
    if set.is_empty() {
        tracing::debug!("no extrusion segments, drawing placeholder");
        return placeholder(&layout);
    }

    let palette = tool_palette(&options.filament_colors);
    let color_of = |s: &Segment| Rgb(palette[s.tool as usize % palette.len()]);
    let bed = options.bed_size;
    let width = options.line_width.max(1);
    let mut canvas = Canvas::new(&layout);

    canvas.line((layout.main_w, 0.0), (layout.main_w, layout.total_h), DIVIDER, 1);
    canvas.line((layout.main_w, layout.side_h), (layout.total_w, layout.side_h), DIVIDER, 1);
    canvas.label(8, 4, "3D");
    canvas.label(layout.main_w as i64 + 6, 4, "TOP");
    canvas.label(layout.main_w as i64 + 6, layout.side_h as i64 + 4, "FRONT");

    // oblique
    let oblique = Oblique::new(&layout, bed, set.max_z);
    let corners = [[0.0, 0.0], [bed, 0.0], [bed, bed], [0.0, bed]];
    for i in 0..4 {
        let (a, b) = (corners[i], corners[(i + 1) % 4]);
        canvas.line(oblique.project([a[0], a[1], 0.0]), oblique.project([b[0], b[1], 0.0]), BED_OUTLINE, 1);
    }
    let mut order: Vec<(f64, usize)> = set
        .extrusions
        .iter()
        .enumerate()
        .map(|(i, s)| (oblique.depth(s), i))
        .collect();
    order.sort_by(|a, b| a.0.total_cmp(&b.0));
    for (_, i) in order {
        let s = &set.extrusions[i];
        canvas.line(oblique.project(s.from), oblique.project(s.to), color_of(s), width);
    }

    // top
    let margin = layout.side_w * 0.08;
    let scale = (layout.side_w.min(layout.side_h) - 2.0 * margin) / bed;
    let top = |p: [f64; 3]| {
        (
            layout.main_w + margin + p[0] * scale,
            layout.side_h - margin - p[1] * scale,
        )
    };
    let bed_corners = (top([0.0, bed, 0.0]), top([bed, 0.0, 0.0]));
    canvas.rect(bed_corners.0, bed_corners.1, BED_OUTLINE);
    for s in &set.travels {
        canvas.line(top(s.from), top(s.to), TRAVEL, 1);
    }
    for s in &set.extrusions {
        canvas.line(top(s.from), top(s.to), color_of(s), width);
    }
    canvas.rect(bed_corners.0, bed_corners.1, BED_OUTLINE);

    // front
    let margin = layout.side_w * 0.10;
    let usable_w = layout.side_w - 2.0 * margin;
    let usable_h = layout.side_h - 2.0 * margin;
    let scale = (usable_w / bed).min(usable_h / set.max_z.max(1.0));
    let bed_px = bed * scale;
    let left = layout.main_w + margin + (usable_w - bed_px) / 2.0;
    let bottom = 2.0 * layout.side_h - margin;
    let front = |p: [f64; 3]| (left + p[0] * scale, bottom - p[2] * scale);
    canvas.line((left, bottom), (left + bed_px, bottom), BED_OUTLINE, 1);
    for s in &set.extrusions {
        canvas.line(front(s.from), front(s.to), color_of(s), width);
    }

    tracing::info!(segments = set.extrusions.len(), "rendered preview views");
    canvas.image
}

/// Render and encode as PNG
pub fn render_png(set: &SegmentSet, options: &RenderOptions) -> Result<Vec<u8>> {
    let image = render_views(set, options);
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

/// Canvas regions in pixels
#[derive(Debug, Clone, Copy)]
struct Layout {
    total_w: f64,
    total_h: f64,
    main_w: f64,
    side_w: f64,
    side_h: f64,
}

impl Layout {
    fn new(size: u32) -> Self {
        let size = size.max(8);
        let total_w = (f64::from(size) * 1.5).floor();
        let total_h = f64::from(size);
        Self {
            total_w,
            total_h,
            main_w: total_h,
            side_w: total_w - total_h,
            side_h: (size / 2) as f64,
        }
    }
}

/// Bed rotated 45° about Z, depth and height folded into the vertical axis
struct Oblique {
    center: f64,
    scale: f64,
    origin: (f64, f64),
}

impl Oblique {
    fn new(layout: &Layout, bed: f64, max_z: f64) -> Self {
        let margin = layout.main_w * 0.08;
        let usable = layout.main_w - 2.0 * margin;
        let x_spread = bed * DIAG;
        let y_spread = bed * DIAG * 0.5 + max_z;
        Self {
            center: bed / 2.0,
            scale: (usable / (x_spread * 2.0)).min(usable / (y_spread * 1.2)),
            origin: (layout.main_w / 2.0, layout.main_w * 0.65),
        }
    }

    fn rotate(&self, x: f64, y: f64) -> (f64, f64) {
        let (rx, ry) = (x - self.center, y - self.center);
        (rx * DIAG - ry * DIAG, rx * DIAG + ry * DIAG)
    }

    fn project(&self, p: [f64; 3]) -> (f64, f64) {
        let (rx, ry) = self.rotate(p[0], p[1]);
        (
            self.origin.0 + rx * self.scale,
            self.origin.1 - (ry * self.scale * 0.5 + p[2] * self.scale),
        )
    }

    /// Draw-order key matching the projection's vertical shift
    fn depth(&self, s: &Segment) -> f64 {
        let (_, ry) = self.rotate((s.from[0] + s.to[0]) * 0.5, (s.from[1] + s.to[1]) * 0.5);
        ry * 0.5 + (s.from[2] + s.to[2]) * 0.5
    }
}

struct Canvas {
    image: RgbImage,
}

impl Canvas {
    fn new(layout: &Layout) -> Self {
        Self {
            image: RgbImage::from_pixel(layout.total_w as u32, layout.total_h as u32, BACKGROUND),
        }
    }

    fn put(&mut self, x: i64, y: i64, color: Rgb<u8>) {
        if x >= 0 && y >= 0 && x < i64::from(self.image.width()) && y < i64::from(self.image.height()) {
            self.image.put_pixel(x as u32, y as u32, color);
        }
    }

    /// Bresenham line; wider lines repeat it across the minor axis
    fn line(&mut self, from: (f64, f64), to: (f64, f64), color: Rgb<u8>, width: u32) {
        if !(from.0.is_finite() && from.1.is_finite() && to.0.is_finite() && to.1.is_finite()) {
            return;
        }
        let (x0, y0) = (from.0.round() as i64, from.1.round() as i64);
        let (x1, y1) = (to.0.round() as i64, to.1.round() as i64);
        let steep = (y1 - y0).abs() > (x1 - x0).abs();
        let half = i64::from(width.saturating_sub(1)) / 2;
        for offset in -half..=(i64::from(width) - 1 - half) {
            let (ox, oy) = if steep { (offset, 0) } else { (0, offset) };
            self.bresenham(x0 + ox, y0 + oy, x1 + ox, y1 + oy, color);
        }
    }

    fn bresenham(&mut self, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgb<u8>) {
        let dx = (x1 - x0).abs();
        let dy = (y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx - dy;
        let (mut x, mut y) = (x0, y0);
        loop {
            self.put(x, y, color);
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 > -dy {
                err -= dy;
                x += sx;
            }
            if e2 < dx {
                err += dx;
                y += sy;
            }
        }
    }

    fn rect(&mut self, top_left: (f64, f64), bottom_right: (f64, f64), color: Rgb<u8>) {
        let (l, t) = top_left;
        let (r, b) = bottom_right;
        self.line((l, t), (r, t), color, 1);
        self.line((r, t), (r, b), color, 1);
        self.line((r, b), (l, b), color, 1);
        self.line((l, b), (l, t), color, 1);
    }

    fn fill(&mut self, x: i64, y: i64, w: i64, h: i64, color: Rgb<u8>) {
        for yy in y..y + h {
            for xx in x..x + w {
                self.put(xx, yy, color);
            }
        }
    }

    /// Panel caption in a 3x5 block font, two pixels per cell
    fn label(&mut self, x: i64, y: i64, text: &str) {
        let mut pen = x;
        for c in text.chars() {
            let rows = glyph(c);
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..3 {
                    if bits & (0b100 >> col) != 0 {
                        self.fill(pen + col * 2, y + row as i64 * 2, 2, 2, LABEL);
                    }
                }
            }
            pen += 8;
        }
    }
}

fn glyph(c: char) -> [u8; 5] {
    match c {
        '3' => [0b111, 0b001, 0b011, 0b001, 0b111],
        'D' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'T' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'O' => [0b111, 0b101, 0b101, 0b101, 0b111],
        'P' => [0b111, 0b101, 0b111, 0b100, 0b100],
        'F' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'R' => [0b110, 0b101, 0b110, 0b101, 0b101],
        'N' => [0b101, 0b111, 0b111, 0b111, 0b101],
        _ => [0; 5],
    }
}

/// Framed canvas with the bed outline and a bar marking missing extrusion
fn placeholder(layout: &Layout) -> RgbImage {
    let mut canvas = Canvas::new(layout);
    let (w, h) = (layout.total_w - 1.0, layout.total_h - 1.0);
    canvas.rect((0.0, 0.0), (w, h), DIVIDER);

    let margin = layout.main_w * 0.15;
    let edge = layout.main_w - 2.0 * margin;
    canvas.rect((margin, margin), (margin + edge, margin + edge), BED_OUTLINE);

    let bar_w = (layout.main_w * 0.3) as i64;
    let bar_h = (layout.total_h * 0.02).max(2.0) as i64;
    let cx = (layout.main_w * 0.5) as i64;
    let cy = (layout.total_h * 0.45) as i64;
    canvas.fill(cx - bar_w / 2, cy - bar_h / 2, bar_w, bar_h, PLACEHOLDER_MARK);
    canvas.image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::{ParseOptions, parse_segments};

    #[test]
    fn test_hex_to_rgb() {
        assert_eq!(hex_to_rgb("#FF8000"), [255, 128, 0]);
        assert_eq!(hex_to_rgb("#0f0"), [0, 255, 0]);
        assert_eq!(hex_to_rgb("#zz0000"), DEFAULT_TOOL_COLORS[0]);
    }

    #[test]
    fn test_tool_palette() {
        assert_eq!(tool_palette(&[]), DEFAULT_TOOL_COLORS.to_vec());
        let palette = tool_palette(&[
            "#000000".to_string(),
            "red".to_string(),
            "#FFFFFF".to_string(),
        ]);
        assert_eq!(palette, vec![[60, 60, 60], DEFAULT_TOOL_COLORS[1], [255, 255, 255]]);
    }

    #[test]
    fn test_empty_renders_placeholder() {
        let image = render_views(&SegmentSet::default(), &RenderOptions::default());
        assert_eq!(image.dimensions(), (1200, 800));
        assert_eq!(*image.get_pixel(400, 360), PLACEHOLDER_MARK);
        assert_eq!(*image.get_pixel(0, 0), DIVIDER);
    }

    #[test]
    fn test_render_views_draws_tool_colours() {
        let gcode = "M83\nG1 X100 Y135 Z0.2\nG1 X170 Y135 E2\nT1\nG1 X170 Y150 E1\n";
        let set = parse_segments(gcode.as_bytes(), &ParseOptions::default()).unwrap();
        let options = RenderOptions {
            size: 400,
            filament_colors: vec!["#FF0000".to_string(), "#00FF00".to_string()],
            ..RenderOptions::default()
        };
        let image = render_views(&set, &options);
        assert_eq!(image.dimensions(), (600, 400));
        let red = image.pixels().filter(|p| **p == Rgb([255, 0, 0])).count();
        let green = image.pixels().filter(|p| **p == Rgb([0, 255, 0])).count();
        assert!(red > 0);
        assert!(green > 0);
        // divider between the oblique and the side views
        assert_eq!(*image.get_pixel(400, 300), DIVIDER);
    }

    #[test]
    fn test_render_png_signature() {
        let bytes = render_png(&SegmentSet::default(), &RenderOptions { size: 64, ..RenderOptions::default() }).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }
}
