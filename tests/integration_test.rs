//! End-to-end tests of the read, mutate and embed stages on generated archives

mod common;

use common::{
    Item, MODEL_PATH, MODEL_SETTINGS_PATH, PROJECT_SETTINGS_PATH, box_object, model_xml, two_cube_archive,
    vendor_settings, write_archive, write_profiles,
};
use plate_bridge::profile::SettingsDoc;
use plate_bridge::{
    BedVolume, EmbedPath, EmbedRequest, Error, ObjectTransform, Package, PipelineConfig, ProbeReport,
    ProfileEmbedder, Scene, apply_copies, apply_object_transforms, apply_uniform_scale,
    enforce_transformed_bounds, extract_plate, layout, parse_plates, strip_non_printable_items,
};
use tempfile::TempDir;

const DEPTH: usize = 12;

#[test]
fn test_plates_and_items_of_two_cube_file() {
    let dir = TempDir::new().unwrap();
    let path = two_cube_archive(dir.path());

    let plates = parse_plates(&path, DEPTH).unwrap();
    assert!(plates.is_multi_plate);
    assert_eq!(plates.plates.len(), 2);
    assert_eq!(plates.plates[1].translation, [150.0, 100.0, 0.0]);

    let mut scene = Scene::open_path(&path, DEPTH).unwrap();
    let items = scene.list_build_items(Some(2)).unwrap();
    assert_eq!(items.len(), 1);
    let bounds = items[0].world_bounds.unwrap();
    assert_eq!(bounds.min, [150.0, 100.0, 0.0]);
    assert_eq!(bounds.max, [170.0, 120.0, 20.0]);

    let err = scene.list_build_items(Some(3)).unwrap_err();
    assert!(matches!(err, Error::PlateNotFound(_)));
}

#[test]
fn test_layout_report_serializes() {
    let dir = TempDir::new().unwrap();
    let path = two_cube_archive(dir.path());
    let mut scene = Scene::open_path(&path, DEPTH).unwrap();

    let report = layout(&mut scene, BedVolume::default(), None).unwrap();
    assert_eq!(report.objects.len(), 2);
    assert!(report.validation.fits);
    assert!(report.objects.iter().all(|o| o.ui_base_pose.is_some()));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["placement_frame"]["canonical"], "bed_local_xy_mm");
    assert_eq!(json["build_volume"]["x"], 270.0);
}

#[test]
fn test_transform_then_bounds_check() {
    let dir = TempDir::new().unwrap();
    let model = model_xml(&[box_object(1, [20.0, 20.0, 20.0])], &[Item::at(1, 100.0, 100.0)]);
    let src = write_archive(&dir.path().join("one.3mf"), &[(MODEL_PATH, model)]);
    let bed = BedVolume::default();

    let nudged = dir.path().join("nudged.3mf");
    let report = apply_object_transforms(
        &src,
        &nudged,
        &[ObjectTransform {
            build_item_index: 1,
            object_id: Some("1".to_string()),
            translate_x_mm: 30.0,
            rotate_z_deg: 90.0,
            ..ObjectTransform::default()
        }],
    )
    .unwrap();
    assert_eq!(report.applied_count, 1);
    enforce_transformed_bounds(&nudged, &bed, None, Some(&src), DEPTH).unwrap();

    let mut scene = Scene::open_path(&nudged, DEPTH).unwrap();
    let item = &scene.list_build_items(None).unwrap()[0];
    assert!((item.rotation_z_deg - 90.0).abs() < 1e-6);
    assert_eq!(item.translation, [130.0, 100.0, 0.0]);

    let pushed = dir.path().join("pushed.3mf");
    apply_object_transforms(
        &src,
        &pushed,
        &[ObjectTransform {
            build_item_index: 1,
            translate_x_mm: 400.0,
            ..ObjectTransform::default()
        }],
    )
    .unwrap();
    let err = enforce_transformed_bounds(&pushed, &bed, None, Some(&src), DEPTH).unwrap_err();
    assert!(matches!(err, Error::OutOfBuildVolume(_)));
    assert!(err.is_user_error());
}

#[test]
fn test_transform_rejects_bad_requests() {
    let dir = TempDir::new().unwrap();
    let src = two_cube_archive(dir.path());
    let dst = dir.path().join("out.3mf");
    let moved = |index| ObjectTransform {
        build_item_index: index,
        translate_x_mm: 1.0,
        ..ObjectTransform::default()
    };

    let err = apply_object_transforms(&src, &dst, &[]).unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
    let err = apply_object_transforms(&src, &dst, &[moved(3)]).unwrap_err();
    assert!(matches!(err, Error::InvalidIndex(_)));
    let err = apply_object_transforms(&src, &dst, &[moved(1), moved(1)]).unwrap_err();
    assert!(matches!(err, Error::DuplicateIndex(1)));

    let wrong_id = ObjectTransform {
        object_id: Some("9".to_string()),
        ..moved(2)
    };
    let err = apply_object_transforms(&src, &dst, &[wrong_id]).unwrap_err();
    assert!(matches!(err, Error::ObjectIdMismatch { index: 2, .. }));
    assert!(!dst.exists());
}

#[test]
fn test_extract_and_strip_plate() {
    let dir = TempDir::new().unwrap();
    let src = two_cube_archive(dir.path());

    let extracted = dir.path().join("plate2.3mf");
    extract_plate(&src, &extracted, 2).unwrap();
    let plates = parse_plates(&extracted, DEPTH).unwrap();
    assert!(!plates.plates[0].printable);
    assert!(plates.plates[1].printable);

    let stripped = dir.path().join("stripped.3mf");
    assert!(strip_non_printable_items(&extracted, &stripped).unwrap());
    let plates = parse_plates(&stripped, DEPTH).unwrap();
    assert_eq!(plates.plates.len(), 1);
    assert_eq!(plates.plates[0].object_id, "2");

    let err = extract_plate(&src, &dir.path().join("nope.3mf"), 5).unwrap_err();
    assert_eq!(err.to_string(), "[E4004] Plate 5 out of range (1-2)");
}

#[test]
fn test_uniform_scale_grows_bounds() {
    let dir = TempDir::new().unwrap();
    let src = two_cube_archive(dir.path());
    let dst = dir.path().join("scaled.3mf");

    apply_uniform_scale(&src, &dst, 150.0).unwrap();
    let mut scene = Scene::open_path(&dst, DEPTH).unwrap();
    let bounds = scene.scene_bounds(None).unwrap();
    // each cube scales about its own origin
    assert_eq!(bounds.min, [100.0, 100.0, 0.0]);
    assert_eq!(bounds.max, [180.0, 130.0, 30.0]);

    let err = apply_uniform_scale(&src, &dst, 0.0).unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[test]
fn test_copies_grid_is_centred() {
    let dir = TempDir::new().unwrap();
    let model = model_xml(&[box_object(1, [20.0, 20.0, 20.0])], &[Item::at(1, 10.0, 10.0)]);
    let src = write_archive(&dir.path().join("one.3mf"), &[(MODEL_PATH, model)]);
    let dst = dir.path().join("copies.3mf");
    let bed = BedVolume::default();

    let grid = apply_copies(&src, &dst, 4, 10.0, 1.0, &bed).unwrap();
    assert_eq!((grid.cols, grid.rows, grid.fits_bed), (2, 2, true));

    let mut scene = Scene::open_path(&dst, DEPTH).unwrap();
    assert_eq!(scene.items().len(), 4);
    let bounds = scene.scene_bounds(None).unwrap();
    assert_eq!(bounds.center_xy(), (135.0, 135.0));
    assert_eq!(bounds.size()[0], 50.0);

    let crowded = apply_copies(&src, &dir.path().join("crowded.3mf"), 100, 10.0, 1.0, &bed).unwrap();
    assert!(!crowded.fits_bed);
    assert!(!dir.path().join("crowded.3mf").exists());
}

#[test]
fn test_probe_and_embed_vendor_file() {
    let dir = TempDir::new().unwrap();
    let model = model_xml(
        &[box_object(1, [20.0, 20.0, 20.0]), box_object(2, [20.0, 20.0, 20.0])],
        &[Item::at(1, 100.0, 100.0), Item::at(2, 150.0, 100.0), Item::at(2, 150.0, 150.0).hidden()],
    );
    let settings = vendor_settings(&[(1, 1), (2, 2)], &[(1, &[1, 2])]);
    let src = write_archive(
        &dir.path().join("vendor.3mf"),
        &[(MODEL_PATH, model), (MODEL_SETTINGS_PATH, settings)],
    );

    let probes = ProbeReport::probe(&mut Package::open_path(&src).unwrap(), 1024 * 1024);
    assert!(probes.is_vendor_format);
    assert!(probes.has_multi_extruder_assignments);
    assert!(probes.has_non_printable_items);
    assert_eq!(probes.assigned_extruder_count, 2);

    let profile_dir = dir.path().join("profiles");
    let config = PipelineConfig::new().with_profile_dir(&profile_dir);
    write_profiles(&profile_dir, &config.profile_names);
    let mut embedder = ProfileEmbedder::new(config);

    let dst = dir.path().join("embedded.3mf");
    let request = EmbedRequest {
        requested_filament_count: 2,
        ..EmbedRequest::default()
    };
    let outcome = embedder.embed(&src, &dst, &request).unwrap();
    assert_eq!(outcome.path, EmbedPath::PreservePath);
    assert_eq!(outcome.filament_slots, 2);

    let mut out = Package::open_path(&dst).unwrap();
    let doc = SettingsDoc::from_json(&out.read_string(PROJECT_SETTINGS_PATH).unwrap()).unwrap();
    assert_eq!(doc.get("nozzle_temperature"), Some(&serde_json::json!(["210", "210"])));
    assert_eq!(doc.get("single_extruder_multi_material"), Some(&serde_json::json!("0")));
    // geometry is untouched on the preserve path
    assert_eq!(parse_plates(&dst, DEPTH).unwrap().plates.len(), 3);
}

#[test]
fn test_corrupt_inputs() {
    let dir = TempDir::new().unwrap();
    let not_zip = dir.path().join("model.3mf");
    std::fs::write(&not_zip, b"solid cube\nendsolid").unwrap();
    let err = parse_plates(&not_zip, DEPTH).unwrap_err();
    assert_eq!(err.kind(), "corrupt_archive");

    let no_model = write_archive(&dir.path().join("empty.3mf"), &[("readme.txt", "hi".to_string())]);
    let err = parse_plates(&no_model, DEPTH).unwrap_err();
    assert!(matches!(err, Error::MissingModel));

    let bad_xml = write_archive(&dir.path().join("bad.3mf"), &[(MODEL_PATH, "<model><build></model>".to_string())]);
    let err = parse_plates(&bad_xml, DEPTH).unwrap_err();
    assert_eq!(err.kind(), "malformed_model");
    assert!(err.is_user_error());
}
