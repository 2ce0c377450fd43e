#![no_main]

use libfuzzer_sys::fuzz_target;
use plate_bridge::{BedVolume, Package, ProbeReport, Scene, layout};
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    // ZIP extraction -> model and vendor settings -> plates -> layout
    let Ok(mut package) = Package::open(Cursor::new(data)) else {
        return;
    };
    let _ = ProbeReport::probe(&mut package, 1 << 20);
    if let Ok(mut scene) = Scene::new(package, 12) {
        let _ = scene.parse_plates();
        let _ = layout(&mut scene, BedVolume::default(), None);
    }
});
