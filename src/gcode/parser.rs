use super::{Command, Lexer, classify, for_each_line, strip_line};
use crate::affine::{Aabb, Point3};
use crate::config::PipelineConfig;
use crate::error::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::BufRead;

/// XY displacement below which a move is ignored (mm)
const MIN_XY_MOVE: f64 = 0.001;

/// One straight move between two points
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Segment {
    /// Start point
    pub from: Point3,
    /// End point
    pub to: Point3,
    /// Active tool index
    pub tool: u32,
}

/// Segments collected from one G-code file
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SegmentSet {
    /// Every extrusion move, possibly sub-sampled
    pub extrusions: Vec<Segment>,
    /// Decimated travel moves
    pub travels: Vec<Segment>,
    /// Highest Z reached by an extrusion
    pub max_z: f64,
    /// Stride applied to the extrusions; 1 when nothing was dropped
    pub stride: usize,
}

impl SegmentSet {
    /// Whether the file had no extrusion at all
    pub fn is_empty(&self) -> bool {
        self.extrusions.is_empty()
    }
}

/// Limits for [`parse_segments`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    /// Keep one travel move out of this many
    pub travel_keep_every: usize,
    /// Sub-sample extrusions above this count
    pub max_segments: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for ParseOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            travel_keep_every: config.travel_keep_every,
            max_segments: config.max_render_segments,
        }
    }
}

/// A classified XY move
#[derive(Debug, Clone, Copy, PartialEq)]
struct Motion {
    from: Point3,
    to: Point3,
    tool: u32,
    extrudes: bool,
}

/// Position, extrusion and tool state of the machine
#[derive(Debug)]
struct Machine {
    lexer: Lexer,
    pos: Point3,
    e: f64,
    absolute_positions: bool,
    absolute_extrusion: bool,
    tool: u32,
}

impl Machine {
    fn new() -> Result<Self> {
        Ok(Self {
            lexer: Lexer::new()?,
            pos: [0.0; 3],
            e: 0.0,
            absolute_positions: true,
            absolute_extrusion: false,
            tool: 0,
        })
    }

    /// Apply one raw line; returns the move it made, if any
    fn step(&mut self, raw: &[u8]) -> Option<Motion> {
        let line = strip_line(raw);
        if line.is_empty() {
            return None;
        }
        match classify(line) {
            Command::Tool(t) => self.tool = t,
            Command::AbsolutePositions => self.absolute_positions = true,
            Command::RelativePositions => self.absolute_positions = false,
            Command::AbsoluteExtrusion => self.absolute_extrusion = true,
            Command::RelativeExtrusion => self.absolute_extrusion = false,
            Command::Reset => {
                let words = self.lexer.words(line);
                for (axis, value) in [(0, words.x), (1, words.y), (2, words.z)] {
                    if let Some(v) = value {
                        self.pos[axis] = v;
                    }
                }
                if let Some(e) = words.e {
                    self.e = e;
                }
            }
            Command::Move { .. } => return self.travel(line),
            Command::Other => {}
        }
        None
    }

    fn travel(&mut self, line: &[u8]) -> Option<Motion> {
        let words = self.lexer.words(line);
        let from = self.pos;
        let prev_e = self.e;
        for (axis, value) in [(0, words.x), (1, words.y), (2, words.z)] {
            if let Some(v) = value {
                self.pos[axis] = if self.absolute_positions { v } else { self.pos[axis] + v };
            }
        }
        if let Some(e) = words.e {
            self.e = if self.absolute_extrusion { e } else { self.e + e };
        }
        let to = self.pos;
        if (to[0] - from[0]).abs() < MIN_XY_MOVE && (to[1] - from[1]).abs() < MIN_XY_MOVE {
            return None;
        }
        Some(Motion {
            from,
            to,
            tool: self.tool,
            extrudes: self.e > prev_e,
        })
    }
}

/// Collect extrusion and travel segments in one pass
///
/// Extrusions are all kept unless there are more than
/// `options.max_segments`, in which case every n-th is kept. Travels are
/// decimated as they stream by.
pub fn parse_segments<R: BufRead>(reader: R, options: &ParseOptions) -> Result<SegmentSet> {
    let keep_every = options.travel_keep_every.max(1);
    let mut machine = Machine::new()?;
    let mut set = SegmentSet {
        stride: 1,
        ..SegmentSet::default()
    };
    let mut travel_count = 0usize;

    for_each_line(reader, |raw| {
        let Some(motion) = machine.step(raw) else {
            return Ok(true);
        };
        let segment = Segment {
            from: motion.from,
            to: motion.to,
            tool: motion.tool,
        };
        if motion.extrudes {
            set.max_z = set.max_z.max(motion.to[2]);
            set.extrusions.push(segment);
        } else {
            travel_count += 1;
            if travel_count % keep_every == 0 {
                set.travels.push(segment);
            }
        }
        Ok(true)
    })?;

    let max_segments = options.max_segments.max(1);
    if set.extrusions.len() > max_segments {
        let stride = set.extrusions.len() / max_segments + 1;
        set.extrusions = set.extrusions.into_iter().step_by(stride).collect();
        set.stride = stride;
        tracing::info!(stride, kept = set.extrusions.len(), "sub-sampled extrusion segments");
    }
    tracing::debug!(
        extrusions = set.extrusions.len(),
        travels = set.travels.len(),
        max_z = set.max_z,
        "parsed G-code segments"
    );
    Ok(set)
}

/// Extent of the extrusion moves, `None` when nothing is extruded
pub fn bounds<R: BufRead>(reader: R) -> Result<Option<Aabb>> {
    let mut machine = Machine::new()?;
    let mut extent = Aabb::empty();
    for_each_line(reader, |raw| {
        if let Some(motion) = machine.step(raw).filter(|m| m.extrudes) {
            extent.include(motion.from);
            extent.include(motion.to);
        }
        Ok(true)
    })?;
    Ok((!extent.is_empty()).then_some(extent))
}

/// Tool numbers selected anywhere in the file; `{0}` when none is
pub fn tools_used<R: BufRead>(reader: R) -> Result<BTreeSet<u32>> {
    let mut tools = BTreeSet::new();
    for_each_line(reader, |raw| {
        if let Command::Tool(t) = classify(strip_line(raw)) {
            tools.insert(t);
        }
        Ok(true)
    })?;
    if tools.is_empty() {
        tools.insert(0);
    }
    Ok(tools)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
; generated
G90
M83
G92 E0
G1 Z0.2 F600
G1 X10 Y10 F3000
G1 X20 Y10 E0.5
G1 X20 Y20 E0.5 ; perimeter
G1 X20.0004 Y20.0002 E0.1
T1
G1 X30 Y20 E-0.8
G1 X30 Y30 E0.8
G1 Z0.4
G1 X40 Y30 E0.3
";

    #[test]
    fn test_parse_segments_classifies_moves() {
        let options = ParseOptions {
            travel_keep_every: 1,
            max_segments: 100,
        };
        let set = parse_segments(SAMPLE.as_bytes(), &options).unwrap();
        assert_eq!(set.extrusions.len(), 4);
        assert_eq!(set.travels.len(), 2);
        assert_eq!(set.extrusions[0].from, [10.0, 10.0, 0.2]);
        assert_eq!(set.extrusions[0].to, [20.0, 10.0, 0.2]);
        assert_eq!(set.extrusions[0].tool, 0);
        assert_eq!(set.extrusions[2].tool, 1);
        assert_eq!(set.max_z, 0.4);
        assert_eq!(set.stride, 1);
    }

    #[test]
    fn test_absolute_extrusion_and_reset() {
        let gcode = "M82\nG1 X1 E1\nG1 X2 E2\nG92 E0\nG1 X3 E0.5\nG1 X4 E0.5\n";
        let options = ParseOptions {
            travel_keep_every: 1,
            max_segments: 100,
        };
        let set = parse_segments(gcode.as_bytes(), &options).unwrap();
        assert_eq!(set.extrusions.len(), 3);
        assert_eq!(set.travels.len(), 1);
    }

    #[test]
    fn test_relative_positions() {
        let gcode = "G91\nG1 X5 Y5 E1\nG1 X5 E1\n";
        let set = parse_segments(gcode.as_bytes(), &ParseOptions::default()).unwrap();
        assert_eq!(set.extrusions[1].to, [10.0, 5.0, 0.0]);
    }

    #[test]
    fn test_travel_decimation_and_cap() {
        let mut gcode = String::from("M83\n");
        for i in 0..50 {
            gcode.push_str(&format!("G0 X{} Y0\nG1 X{} Y1 E0.1\n", i * 2 + 1, i * 2 + 2));
        }
        let options = ParseOptions {
            travel_keep_every: 10,
            max_segments: 20,
        };
        let set = parse_segments(gcode.as_bytes(), &options).unwrap();
        assert_eq!(set.travels.len(), 5);
        assert_eq!(set.stride, 3);
        assert_eq!(set.extrusions.len(), 17);
    }

    #[test]
    fn test_bounds() {
        let extent = bounds(SAMPLE.as_bytes()).unwrap().unwrap();
        assert_eq!(extent.min, [10.0, 10.0, 0.2]);
        assert_eq!(extent.max, [40.0, 30.0, 0.4]);
        assert!(bounds("G28\nG1 X10 Y10\n".as_bytes()).unwrap().is_none());
    }

    #[test]
    fn test_tools_used() {
        assert_eq!(tools_used(SAMPLE.as_bytes()).unwrap(), BTreeSet::from([1]));
        assert_eq!(tools_used("G1 X1\n".as_bytes()).unwrap(), BTreeSet::from([0]));
    }
}
