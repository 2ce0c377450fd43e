#![no_main]

use libfuzzer_sys::fuzz_target;
use plate_bridge::model::{ParseMode, parse_model};

fuzz_target!(|data: &[u8]| {
    if let Ok(xml) = std::str::from_utf8(data) {
        let _ = parse_model(xml, ParseMode::Structure);
        let _ = parse_model(xml, ParseMode::Full);
    }
});
