use crate::aeg::Aeg;
use crate::cfg::InstClass;
use crate::ir::{AliasResult, BaseObjectOracle, ForcedOracle};
use crate::leakage::{detect, detect_parallel, Detector, Leakage};
use crate::testutil;

fn classes(po: &crate::cfg::expanded::CfgExpanded, leak: &Leakage) -> Vec<InstClass> {
    leak.vec.iter().map(|&r| po.lookup(r).class()).collect()
}

fn inst_ids(po: &crate::cfg::expanded::CfgExpanded, leak: &Leakage) -> Vec<u32> {
    leak.vec
        .iter()
        .map(|&r| po.lookup(r).id().unwrap().inst)
        .collect()
}

#[test]
fn s1_classic_array_bounds() {
    let m = testutil::s1_module(false);
    let config = testutil::v1_config();
    let po = crate::expand_function(&m, "victim", &config).unwrap();
    let oracle = BaseObjectOracle::new(&m, "victim");
    let leaks = detect(&po, &oracle, &config).unwrap();

    assert_eq!(leaks.len(), 1);
    let (leak, desc) = &leaks[0];
    assert_eq!(leak.vec.len(), 3);
    assert_eq!(
        classes(&po, leak),
        vec![InstClass::Load, InstClass::Load, InstClass::Load]
    );
    // Chain runs bounds load -> guarded load -> transmitter.
    let ids = inst_ids(&po, leak);
    assert!(ids[0] < ids[1] && ids[1] < ids[2]);
    assert_eq!(leak.vec[2], leak.transmitter);
    // The transmitter instance runs transiently: it is an expansion clone.
    assert!(po.is_clone(leak.transmitter));
    assert!(!desc.is_empty());
}

#[test]
fn s2_branch_predicate() {
    let m = testutil::s2_module();
    let config = testutil::v1_ctrl_config();
    let po = crate::expand_function(&m, "victim", &config).unwrap();
    let oracle = BaseObjectOracle::new(&m, "victim");
    let leaks = detect(&po, &oracle, &config).unwrap();

    assert_eq!(leaks.len(), 1);
    let (leak, _) = &leaks[0];
    assert_eq!(
        classes(&po, leak),
        vec![InstClass::Load, InstClass::Branch, InstClass::Load]
    );
    assert_eq!(leak.vec[2], leak.transmitter);
    assert!(po.is_clone(leak.transmitter));
}

#[test]
fn s3_store_bypass() {
    let m = testutil::s3_module();
    let config = testutil::v4_config(1);
    let po = crate::expand_function(&m, "victim", &config).unwrap();
    let oracle = BaseObjectOracle::new(&m, "victim");
    let leaks = detect(&po, &oracle, &config).unwrap();

    assert_eq!(leaks.len(), 1);
    let (leak, _) = &leaks[0];
    assert_eq!(
        classes(&po, leak),
        vec![
            InstClass::Store,
            InstClass::Store,
            InstClass::Load,
            InstClass::Load
        ]
    );
    // The stale source is the first store.
    let ids = inst_ids(&po, leak);
    assert!(ids[0] < ids[1]);
}

#[test]
fn s4_fence_blocks_the_window() {
    let m = testutil::s1_module(true);
    let config = testutil::v1_config();
    let po = crate::expand_function(&m, "victim", &config).unwrap();
    let oracle = BaseObjectOracle::new(&m, "victim");
    let leaks = detect(&po, &oracle, &config).unwrap();
    assert!(leaks.is_empty());
}

#[test]
fn s5_must_alias_merge() {
    let m = testutil::s5_module();
    let config = testutil::v1_config();
    let po = crate::expand_function(&m, "victim", &config).unwrap();
    let oracle = BaseObjectOracle::new(&m, "victim");
    let leaks = detect(&po, &oracle, &config).unwrap();

    assert_eq!(leaks.len(), 1);
    let (leak, _) = &leaks[0];
    assert_eq!(leak.vec.len(), 3);
    assert_eq!(
        classes(&po, leak),
        vec![InstClass::Load, InstClass::Load, InstClass::Load]
    );
}

#[test]
fn s6_window_boundary() {
    let m = testutil::s1_module(false);
    let mut config = testutil::v1_config();
    config.window_size = Some(2);
    let config = config.validated().unwrap();
    assert!(config.partial_executions);
    let po = crate::expand_function(&m, "victim", &config).unwrap();
    let oracle = BaseObjectOracle::new(&m, "victim");
    let leaks = detect(&po, &oracle, &config).unwrap();
    assert!(leaks.is_empty());
}

#[test]
fn zero_spec_depth_means_zero_leaks() {
    for (m, mut config) in [
        (testutil::s1_module(false), testutil::v1_config()),
        (testutil::s3_module(), testutil::v4_config(1)),
    ] {
        config.spec_depth = 0;
        let po = crate::expand_function(&m, "victim", &config).unwrap();
        let oracle = BaseObjectOracle::new(&m, "victim");
        let leaks = detect(&po, &oracle, &config).unwrap();
        assert!(leaks.is_empty());
    }
}

#[test]
fn zero_traceback_kills_v4() {
    let m = testutil::s3_module();
    let mut config = testutil::v4_config(1);
    config.max_traceback = 0;
    let po = crate::expand_function(&m, "victim", &config).unwrap();
    let oracle = BaseObjectOracle::new(&m, "victim");
    let leaks = detect(&po, &oracle, &config).unwrap();
    assert!(leaks.is_empty());
}

#[test]
fn deep_store_buffer_kills_v4() {
    // Only one store separates the stale value from the load.
    let m = testutil::s3_module();
    let config = testutil::v4_config(2);
    let po = crate::expand_function(&m, "victim", &config).unwrap();
    let oracle = BaseObjectOracle::new(&m, "victim");
    let leaks = detect(&po, &oracle, &config).unwrap();
    assert!(leaks.is_empty());
}

#[test]
fn forced_no_alias_means_zero_leaks() {
    let m = testutil::s3_module();
    let config = testutil::v4_config(1);
    let po = crate::expand_function(&m, "victim", &config).unwrap();
    let leaks = detect(&po, &ForcedOracle(AliasResult::No), &config).unwrap();
    assert!(leaks.is_empty());
}

#[test]
fn detector_is_idempotent() {
    let m = testutil::s1_module(false);
    let config = testutil::v1_config();
    let po = crate::expand_function(&m, "victim", &config).unwrap();
    let oracle = BaseObjectOracle::new(&m, "victim");

    let z3 = z3::Context::new(&z3::Config::new());
    let aeg = Aeg::construct(&z3, &po, &oracle, &config).unwrap();

    let mut first = Detector::new(&aeg, &oracle, &config);
    first.run().unwrap();
    let mut second = Detector::new(&aeg, &oracle, &config);
    second.run().unwrap();

    let leaks = |d: &Detector| -> Vec<Leakage> {
        d.leaks().iter().map(|(l, _)| l.clone()).collect()
    };
    assert_eq!(leaks(&first), leaks(&second));
    assert_eq!(leaks(&first).len(), 1);
}

#[test]
fn fast_mode_still_reports_the_leak() {
    let m = testutil::s1_module(false);
    let mut config = testutil::v1_config();
    config.fast_mode = true;
    let config = config.validated().unwrap();
    let po = crate::expand_function(&m, "victim", &config).unwrap();
    let oracle = BaseObjectOracle::new(&m, "victim");
    let leaks = detect(&po, &oracle, &config).unwrap();
    assert_eq!(leaks.len(), 1);
}

#[test]
fn parallel_matches_sequential() {
    let m = testutil::s1_module(false);
    let config = testutil::v1_config();
    let po = crate::expand_function(&m, "victim", &config).unwrap();
    let oracle = BaseObjectOracle::new(&m, "victim");

    let sequential = detect(&po, &oracle, &config).unwrap();

    let mut par_config = testutil::v1_config();
    par_config.max_parallel = 2;
    let parallel = detect_parallel(&po, &oracle, &par_config).unwrap();

    let key = |leaks: &[(Leakage, String)]| -> Vec<Leakage> {
        let mut v: Vec<Leakage> = leaks.iter().map(|(l, _)| l.clone()).collect();
        v.sort();
        v
    };
    assert_eq!(key(&sequential), key(&parallel));
}

#[test]
fn output_files_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let m = testutil::s1_module(false);
    let mut config = testutil::v1_config();
    config.output_dir = Some(dir.path().to_path_buf());
    let po = crate::expand_function(&m, "victim", &config).unwrap();
    let oracle = BaseObjectOracle::new(&m, "victim");
    let leaks = detect(&po, &oracle, &config).unwrap();
    assert_eq!(leaks.len(), 1);

    let leakage = std::fs::read_to_string(dir.path().join("leakage.txt")).unwrap();
    assert!(leakage.contains(" : "));
    assert!(leakage.contains(" -- "));
    let transmitters = std::fs::read_to_string(dir.path().join("transmitters.txt")).unwrap();
    assert_eq!(transmitters.lines().count(), 1);

    // One DOT witness per leak.
    let witnesses = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with("spectre-v1") && name.ends_with(".dot")
        })
        .count();
    assert_eq!(witnesses, 1);
}

#[test]
fn driver_reports_and_resumes() {
    let m = testutil::s1_module(false);
    let config = testutil::v1_config();
    let mut analyzed = std::collections::BTreeSet::new();
    let reports = crate::analyze_module(&m, &config, &mut analyzed).unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].leaks.len(), 1);
    assert!(reports[0].skipped.is_none());

    // A second pass over the same module skips the analyzed function.
    let reports = crate::analyze_module(&m, &config, &mut analyzed).unwrap();
    assert!(reports[0].skipped.is_some());
    assert!(reports[0].leaks.is_empty());
}
