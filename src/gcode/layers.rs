//! Paged per-layer move lists for toolpath viewers

use super::{Command, Lexer, classify, for_each_line, strip_line};
use crate::error::Result;
use serde::Serialize;
use std::io::BufRead;

/// Extrusion delta that counts as depositing material
const MIN_EXTRUDE: f64 = 1e-6;

/// Whether a move deposits material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveKind {
    /// Material is deposited
    Extrude,
    /// Head moves without extruding
    Travel,
}

/// A straight XY move inside one layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LayerMove {
    /// Extrusion or travel
    #[serde(rename = "type")]
    pub kind: MoveKind,
    /// Start X
    pub x1: f64,
    /// Start Y
    pub y1: f64,
    /// End X
    pub x2: f64,
    /// End Y
    pub y2: f64,
}

/// Moves of one layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Layer {
    /// Layer number from the marker comments
    #[serde(rename = "layer_num")]
    pub index: i64,
    /// Z of the last move seen in the layer
    pub z_height: f64,
    /// Moves in file order
    pub moves: Vec<LayerMove>,
}

/// Layer marker in a comment line
fn layer_marker(line: &[u8]) -> Option<Marker> {
    let body = line.strip_prefix(b";")?.trim_ascii_start();
    for word in [&b"LAYER_CHANGE"[..], b"CHANGE_LAYER"] {
        if body.len() >= word.len()
            && body[..word.len()].eq_ignore_ascii_case(word)
            && body.get(word.len()).is_none_or(|b| !b.is_ascii_alphanumeric() && *b != b'_')
        {
            return Some(Marker::Next);
        }
    }
    if body.len() >= 5 && body[..5].eq_ignore_ascii_case(b"LAYER") {
        let rest = body[5..].trim_ascii_start().strip_prefix(b":")?.trim_ascii_start();
        let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 || rest.get(digits).is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_') {
            return None;
        }
        let number = std::str::from_utf8(&rest[..digits]).ok()?.parse().ok()?;
        return Some(Marker::Numbered(number));
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Next,
    Numbered(i64),
}

/// Layers `start..start + count` with their XY moves
///
/// Layers are split on `;LAYER_CHANGE`, `;CHANGE_LAYER` or `;LAYER:n`
/// comments; lines before the first marker belong to layer -1. Layers before
/// `start` are not listed but still advance the position and extrusion
/// state. Arc moves update the position but are not listed since a chord
/// would misdraw them.
/// Extrusion starts absolute; in absolute mode a move only counts as
/// extruding once some E value has been seen.
pub fn layers<R: BufRead>(reader: R, start: i64, count: usize) -> Result<Vec<Layer>> {
    let lexer = Lexer::new()?;
    let mut state = LayerState {
        start,
        count,
        layers: Vec::new(),
        current: -1,
        z: 0.0,
        moves: Vec::new(),
    };
    if count == 0 {
        return Ok(state.layers);
    }

    let mut last = (0.0_f64, 0.0_f64);
    let mut last_e: Option<f64> = None;
    let mut relative_extrusion = false;

    for_each_line(reader, |raw| {
        let trimmed = raw.trim_ascii();
        if let Some(marker) = layer_marker(trimmed) {
            if state.flush() {
                return Ok(false);
            }
            state.current = match marker {
                Marker::Next => state.current + 1,
                Marker::Numbered(n) => n,
            };
            return Ok(true);
        }
        let recording = state.current >= state.start;
        if recording && state.layers.len() >= state.count {
            return Ok(false);
        }

        let line = strip_line(trimmed);
        match classify(line) {
            Command::AbsoluteExtrusion => relative_extrusion = false,
            Command::RelativeExtrusion => relative_extrusion = true,
            Command::Reset => {
                if let Some(e) = lexer.words(line).e {
                    last_e = Some(e);
                }
            }
            Command::Move { arc } => {
                let words = lexer.words(line);
                let x = words.x.unwrap_or(last.0);
                let y = words.y.unwrap_or(last.1);
                state.z = words.z.unwrap_or(state.z);

                if x != last.0 || y != last.1 {
                    let extruding_cmd = arc || line.starts_with(b"G1");
                    let extrudes = match (extruding_cmd, words.e) {
                        (true, Some(e)) if relative_extrusion => e > MIN_EXTRUDE,
                        (true, Some(e)) => last_e.is_some_and(|prev| e > prev + MIN_EXTRUDE),
                        _ => false,
                    };
                    if recording && !arc {
                        state.moves.push(LayerMove {
                            kind: if extrudes { MoveKind::Extrude } else { MoveKind::Travel },
                            x1: last.0,
                            y1: last.1,
                            x2: x,
                            y2: y,
                        });
                    }
                }
                if words.e.is_some() {
                    last_e = words.e;
                }
                last = (x, y);
            }
            _ => {}
        }
        Ok(true)
    })?;

    if state.layers.len() < state.count {
        state.flush();
    }
    tracing::debug!(start, returned = state.layers.len(), "read G-code layers");
    Ok(state.layers)
}

struct LayerState {
    start: i64,
    count: usize,
    layers: Vec<Layer>,
    current: i64,
    z: f64,
    moves: Vec<LayerMove>,
}

impl LayerState {
    /// Close the current layer; returns whether enough layers are collected
    fn flush(&mut self) -> bool {
        if self.current >= self.start && !self.moves.is_empty() {
            self.layers.push(Layer {
                index: self.current,
                z_height: self.z,
                moves: std::mem::take(&mut self.moves),
            });
            return self.layers.len() >= self.count;
        }
        false
    }
}
