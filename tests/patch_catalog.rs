mod common;

use clientforge::{PatchCatalog, PatchTarget, TargetOutcome};

fn three_targets() -> PatchCatalog {
    PatchCatalog::new(
        "it-1",
        vec![
            PatchTarget::from_hex("masked", "AA ?? CC", "11 22", 3).unwrap(),
            PatchTarget::from_hex("absent", "01 02 03 04 05", "FF", 0).unwrap(),
            PatchTarget::from_hex("tail", "EE EE", "00", -1).unwrap(),
        ],
    )
}

#[test]
fn test_masked_pattern_matches_any_middle_byte() {
    for mid in [0x00u8, 0x99, 0xFF] {
        let cat = PatchCatalog::new(
            "m",
            vec![PatchTarget::from_hex("t", "AA ?? CC", "00", 0).unwrap()],
        );
        let mut buf = vec![0xAA, mid, 0xCC];
        assert_eq!(cat.apply(&mut buf).applied(), 1, "middle byte {mid:#x}");
    }
    let cat = PatchCatalog::new(
        "m",
        vec![PatchTarget::from_hex("t", "AA ?? CC", "00", 0).unwrap()],
    );
    let mut buf = vec![0xAB, 0x00, 0xCC];
    let report = cat.apply(&mut buf);
    assert_eq!(report.entries[0].1, TargetOutcome::NotFound);
    assert_eq!(buf, vec![0xAB, 0x00, 0xCC]);
}

#[test]
fn test_missing_target_is_reported_and_others_apply() {
    let cat = three_targets();
    let mut buf = vec![0x00, 0xAA, 0x42, 0xCC, 0x00, 0x00, 0x30, 0xEE, 0xEE];
    let report = cat.apply(&mut buf);

    assert_eq!(report.catalog_version, "it-1");
    assert_eq!(report.applied(), 2);
    assert_eq!(report.missing(), 1);
    assert_eq!(report.entries[0].1, TargetOutcome::Applied { at: 4 });
    assert_eq!(report.entries[1].1, TargetOutcome::NotFound);
    assert_eq!(report.entries[2].1, TargetOutcome::Applied { at: 6 });
    assert_eq!(buf, vec![0x00, 0xAA, 0x42, 0xCC, 0x11, 0x22, 0x00, 0xEE, 0xEE]);
}

#[test]
fn test_second_application_changes_nothing() {
    let cat = three_targets();
    let mut buf = vec![0x00, 0xAA, 0x42, 0xCC, 0x00, 0x00, 0x30, 0xEE, 0xEE];
    cat.apply(&mut buf);
    let once = buf.clone();

    let again = cat.apply(&mut buf);
    assert_eq!(buf, once);
    assert_eq!(again.applied(), 0);
    assert!(!again.changed());
    assert_eq!(again.already_applied(), 2);
}

#[test]
fn test_catalog_loads_from_yaml_file() {
    let td = tempfile::tempdir().expect("tmpdir");
    let p = td.path().join("catalog.yml");
    std::fs::write(
        &p,
        "version: \"2024.1\"\ntargets:\n  - name: magic\n    pattern: \"CF FA ED FE\"\n    replacement: \"DE AD BE EF\"\n    offset: 110\n",
    )
    .unwrap();
    let cat = PatchCatalog::load(&p).expect("load");
    assert_eq!(cat.version(), "2024.1");

    let mut img = common::macho_image(0, 128, 256);
    let report = cat.apply(&mut img);
    assert_eq!(report.entries[0].1.to_string(), "applied at 0x6e");
    assert_eq!(&img[110..114], &[0xDE, 0xAD, 0xBE, 0xEF]);

    assert!(PatchCatalog::load(&td.path().join("missing.yml")).is_err());
}
