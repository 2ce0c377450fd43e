//! G-code scanning and preview rendering
//!
//! Slicer output is read line by line in a single forward pass. Only motion,
//! mode and tool lines are interpreted; everything else is skipped without
//! allocating. The same dialect serves the segment collector, the bounds
//! scan and the paged layer reader:
//!
//! - `G90`/`G91` absolute or relative positions
//! - `M82`/`M83` absolute or relative extrusion (`G82`/`G83` accepted too)
//! - `G92` axis reset
//! - `T<n>` tool select
//! - `G0`..`G3` moves, arcs by their end point
//!
//! Text after `;` is a comment.

pub mod layers;
mod parser;
pub mod render;

pub use layers::{Layer, LayerMove, MoveKind, layers};
pub use parser::{ParseOptions, Segment, SegmentSet, bounds, parse_segments, tools_used};
pub use render::{RenderOptions, render_png, render_views};

use crate::error::{Error, Result};
use regex::bytes::Regex;
use std::io::BufRead;

/// Coordinate words: an axis letter and a signed decimal
const COORD_PATTERN: &str = r"([XYZEF])([-+]?\d*\.?\d+)";

/// Initial capacity of the reused line buffer
const LINE_BUFFER_CAPACITY: usize = 256;

/// Coordinate words found on one line
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct Words {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub e: Option<f64>,
}

/// Compiled token patterns
#[derive(Debug, Clone)]
pub(crate) struct Lexer {
    coords: Regex,
}

impl Lexer {
    pub fn new() -> Result<Self> {
        let coords = Regex::new(COORD_PATTERN)
            .map_err(|e| Error::InvalidRequest(format!("G-code token pattern: {}", e)))?;
        Ok(Self { coords })
    }

    /// Axis words of a command line; later words win
    pub fn words(&self, line: &[u8]) -> Words {
        let mut words = Words::default();
        for caps in self.coords.captures_iter(line) {
            let (Some(axis), Some(number)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let Some(value) = std::str::from_utf8(number.as_bytes())
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
            else {
                continue;
            };
            match axis.as_bytes() {
                b"X" => words.x = Some(value),
                b"Y" => words.y = Some(value),
                b"Z" => words.z = Some(value),
                b"E" => words.e = Some(value),
                _ => {}
            }
        }
        words
    }
}

/// What a command line does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Tool(u32),
    AbsolutePositions,
    RelativePositions,
    AbsoluteExtrusion,
    RelativeExtrusion,
    Reset,
    Move { arc: bool },
    Other,
}

/// Classify a comment-stripped, trimmed line
pub(crate) fn classify(line: &[u8]) -> Command {
    match line {
        [b'T', rest @ ..] if rest.first().is_some_and(u8::is_ascii_digit) => {
            let end = rest.iter().take_while(|b| b.is_ascii_digit()).count();
            std::str::from_utf8(&rest[..end])
                .ok()
                .and_then(|s| s.parse().ok())
                .map_or(Command::Other, Command::Tool)
        }
        _ if line.starts_with(b"G90") => Command::AbsolutePositions,
        _ if line.starts_with(b"G91") => Command::RelativePositions,
        _ if line.starts_with(b"M82") || line.starts_with(b"G82") => Command::AbsoluteExtrusion,
        _ if line.starts_with(b"M83") || line.starts_with(b"G83") => Command::RelativeExtrusion,
        _ if line.starts_with(b"G92") => Command::Reset,
        [b'G', code @ (b'0'..=b'3'), rest @ ..] if rest.first().is_none_or(|b| matches!(b, b' ' | b'\t')) => {
            Command::Move {
                arc: matches!(code, b'2' | b'3'),
            }
        }
        _ => Command::Other,
    }
}

/// Drop the comment and surrounding whitespace of a raw line
pub(crate) fn strip_line(raw: &[u8]) -> &[u8] {
    let code = match raw.iter().position(|&b| b == b';') {
        Some(at) => &raw[..at],
        None => raw,
    };
    code.trim_ascii()
}

/// Feed every line of `reader` to `visit` through one reused buffer
///
/// `visit` returns `false` to stop early.
pub(crate) fn for_each_line<R, F>(mut reader: R, mut visit: F) -> Result<()>
where
    R: BufRead,
    F: FnMut(&[u8]) -> Result<bool>,
{
    let mut buf = Vec::with_capacity(LINE_BUFFER_CAPACITY);
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        if !visit(&buf)? {
            return Ok(());
        }
    }
}
