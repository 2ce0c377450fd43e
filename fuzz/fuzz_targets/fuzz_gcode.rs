#![no_main]

use libfuzzer_sys::fuzz_target;
use plate_bridge::gcode::{self, ParseOptions, RenderOptions};

fuzz_target!(|data: &[u8]| {
    let _ = gcode::bounds(data);
    let _ = gcode::tools_used(data);
    let _ = gcode::layers(data, 0, 8);
    if let Ok(set) = gcode::parse_segments(data, &ParseOptions::default()) {
        let options = RenderOptions {
            size: 64,
            ..RenderOptions::default()
        };
        let _ = gcode::render_views(&set, &options);
    }
});
