mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use meridian_core::compute::cpu::CpuBackend;
use meridian_core::consts::SUMMARY_FILE_NAME;
use meridian_core::error::{FailureKind, MeridianError};
use meridian_core::io::load_volume;
use meridian_core::pipeline::{
    generated_template_path, register_directory, register_directory_reported, select_template,
    OrchestratorConfig, OutcomeStatus, PipelineStage, ProgressReporter, SkipReason,
    TemplateStrategy,
};

use common::{blob_volume, fast_config, write_volume};

/// Writes `count` slightly different blobs named `sub00.nii.gz`, `sub01.nii.gz`, ...
fn populate(dir: &Path, count: usize) {
    for n in 0..count {
        let dx = 0.1 * (n % 3) as f64;
        let v = blob_volume([8, 8, 8], [3.5 + dx, 3.5, 3.4], 1.6);
        write_volume(dir, &format!("sub{n:02}.nii.gz"), &v);
    }
}

fn config(input: &Path, output: &Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(input, output);
    config.workers = 2;
    config.registration = fast_config();
    config.registration.deformable.enabled = false;
    config
}

// ---------------------------------------------------------------------------
// Template selection
// ---------------------------------------------------------------------------

#[test]
fn test_central_template_is_middle_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let candidates: Vec<_> = (0..31)
        .map(|n| {
            let v = blob_volume([4, 4, 4], [1.5, 1.5, 1.5], 1.0);
            write_volume(dir.path(), &format!("vol{n:02}.nii.gz"), &v)
        })
        .collect();

    let template = select_template(&CpuBackend, &TemplateStrategy::Central, &candidates).unwrap();
    assert_eq!(template.source.as_deref(), Some(candidates[15].as_path()));

    let indexed =
        select_template(&CpuBackend, &TemplateStrategy::Index { index: 3 }, &candidates).unwrap();
    assert_eq!(indexed.source.as_deref(), Some(candidates[3].as_path()));
}

#[test]
fn test_template_index_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path(), 2);
    let candidates = meridian_core::pipeline::discover_inputs(dir.path(), "*.nii.gz").unwrap();
    let err = select_template(&CpuBackend, &TemplateStrategy::Index { index: 2 }, &candidates)
        .unwrap_err();
    assert!(matches!(err, MeridianError::InvalidConfig(_)));
}

#[test]
fn test_average_template_is_voxelwise_mean() {
    let dir = tempfile::tempdir().unwrap();
    let a = blob_volume([5, 5, 5], [2.0, 2.0, 2.0], 1.0);
    let b = blob_volume([5, 5, 5], [3.0, 2.0, 2.0], 1.0);
    let candidates = vec![
        write_volume(dir.path(), "a.nii.gz", &a),
        write_volume(dir.path(), "b.nii.gz", &b),
    ];
    let template = select_template(&CpuBackend, &TemplateStrategy::Average, &candidates).unwrap();
    assert!(template.source.is_none());
    let expected = (a.data()[[2, 2, 2]] + b.data()[[2, 2, 2]]) / 2.0;
    assert!((template.volume.data()[[2, 2, 2]] - expected).abs() < 1e-6);
}

// ---------------------------------------------------------------------------
// Directory runs
// ---------------------------------------------------------------------------

#[test]
fn test_directory_run_registers_every_file() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    populate(input.path(), 3);

    let report = register_directory(&config(input.path(), output.path())).unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.successful, 3, "{:?}", report.errors);
    assert_eq!(report.failed, 0);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.template_strategy, "central");
    assert_eq!(
        report.template.as_deref(),
        Some(input.path().join("sub01.nii.gz").as_path())
    );
    for n in 0..3 {
        for suffix in ["reg", "forward_field", "inverse_field"] {
            let path = output.path().join(format!("sub{n:02}.{suffix}.nii.gz"));
            assert!(path.exists(), "missing {}", path.display());
        }
    }
    let summary = std::fs::read_to_string(output.path().join(SUMMARY_FILE_NAME)).unwrap();
    assert!(summary.contains("Successful:  3"));

    let inputs: Vec<_> = report.file_results.iter().map(|o| o.input.clone()).collect();
    let mut sorted = inputs.clone();
    sorted.sort();
    assert_eq!(inputs, sorted);
}

#[test]
fn test_second_run_skips_everything() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    populate(input.path(), 3);
    let config = config(input.path(), output.path());

    let first = register_directory(&config).unwrap();
    assert_eq!(first.successful, 3);

    let second = register_directory(&config).unwrap();
    assert_eq!(second.total, 3);
    assert_eq!(second.skipped, 3);
    assert_eq!(second.failed, 0);
    assert!(second
        .file_results
        .iter()
        .all(|o| o.skip_reason == Some(SkipReason::AlreadyRegistered)));
}

#[test]
fn test_outputs_in_input_dir_are_not_rediscovered() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path(), 2);
    let mut config = config(dir.path(), dir.path());
    config.template = TemplateStrategy::Average;

    let first = register_directory(&config).unwrap();
    assert_eq!(first.total, 2);
    let second = register_directory(&config).unwrap();
    assert_eq!(second.total, 2);
    assert_eq!(second.skipped, 2);
}

#[test]
fn test_corrupt_file_fails_alone() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    populate(input.path(), 3);
    // Sorted last, so never the central template.
    std::fs::write(input.path().join("zz_corrupt.nii.gz"), b"garbage").unwrap();

    let report = register_directory(&config(input.path(), output.path())).unwrap();

    assert_eq!(report.total, 4);
    assert_eq!(report.successful, 3);
    assert_eq!(report.failed, 1);
    let failed: Vec<_> = report
        .file_results
        .iter()
        .filter(|o| o.status == OutcomeStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].input.ends_with("zz_corrupt.nii.gz"));
    assert_eq!(failed[0].failure_kind, Some(FailureKind::InvalidVolume));
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("InvalidVolumeError"));
}

#[test]
fn test_unreadable_central_candidate_falls_back_to_neighbour() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path(), 5);
    std::fs::write(dir.path().join("sub02.nii.gz"), b"garbage").unwrap();
    std::fs::write(dir.path().join("sub03.nii.gz"), b"garbage").unwrap();
    let candidates = meridian_core::pipeline::discover_inputs(dir.path(), "*.nii.gz").unwrap();

    // Index 2 and its upper neighbour are unreadable; the lower one loads.
    let template = select_template(&CpuBackend, &TemplateStrategy::Central, &candidates).unwrap();
    assert_eq!(template.source.as_deref(), Some(candidates[1].as_path()));

    let indexed =
        select_template(&CpuBackend, &TemplateStrategy::Index { index: 3 }, &candidates).unwrap();
    assert_eq!(indexed.source.as_deref(), Some(candidates[4].as_path()));
}

#[test]
fn test_average_template_skips_unreadable_input() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path(), 3);
    std::fs::write(dir.path().join("sub01.nii.gz"), b"garbage").unwrap();
    let candidates = meridian_core::pipeline::discover_inputs(dir.path(), "*.nii.gz").unwrap();

    let template = select_template(&CpuBackend, &TemplateStrategy::Average, &candidates).unwrap();
    assert!(template.source.is_none());
    assert_eq!(template.volume.dims(), [8, 8, 8]);
}

#[test]
fn test_no_loadable_candidate_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.nii.gz"), b"garbage").unwrap();
    std::fs::write(dir.path().join("b.nii.gz"), b"garbage").unwrap();
    let candidates = meridian_core::pipeline::discover_inputs(dir.path(), "*.nii.gz").unwrap();
    let err = select_template(&CpuBackend, &TemplateStrategy::Central, &candidates).unwrap_err();
    assert_eq!(err.kind(), FailureKind::InvalidVolume);
}

#[test]
fn test_corrupt_central_file_fails_alone() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    populate(input.path(), 3);
    std::fs::write(input.path().join("sub01.nii.gz"), b"garbage").unwrap();

    let report = register_directory(&config(input.path(), output.path())).unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.successful, 2);
    assert_eq!(report.failed, 1);
    let template = report.template.as_deref().unwrap();
    assert!(template.ends_with("sub02.nii.gz"));
    let failed: Vec<_> = report
        .file_results
        .iter()
        .filter(|o| o.status == OutcomeStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].input.ends_with("sub01.nii.gz"));
    assert_eq!(failed[0].failure_kind, Some(FailureKind::InvalidVolume));
}

#[test]
fn test_empty_directory_reports_error() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    std::fs::write(input.path().join("readme.txt"), b"no volumes here").unwrap();

    let report = register_directory(&config(input.path(), output.path())).unwrap();
    assert_eq!(report.total, 0);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("no files matching"));
}

#[test]
fn test_missing_input_directory_is_an_error() {
    let output = tempfile::tempdir().unwrap();
    let config = config(&output.path().join("absent"), output.path());
    assert!(register_directory(&config).is_err());
}

#[test]
fn test_invalid_config_is_rejected_before_work() {
    let input = tempfile::tempdir().unwrap();
    populate(input.path(), 1);
    let out = input.path().join("out");
    let mut config = config(input.path(), &out);
    config.workers = 0;
    assert!(matches!(
        register_directory(&config),
        Err(MeridianError::InvalidConfig(_))
    ));
    assert!(!out.exists());
}

#[test]
fn test_expired_deadline_skips_all_files() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    populate(input.path(), 3);
    let mut config = config(input.path(), output.path());
    config.timeout_secs = Some(0);

    let report = register_directory(&config).unwrap();
    assert_eq!(report.total, 3);
    assert_eq!(report.skipped, 3);
    assert!(report
        .file_results
        .iter()
        .all(|o| o.skip_reason == Some(SkipReason::DeadlineReached)));
    assert!(!output.path().join("sub00.reg.nii.gz").exists());
}

#[test]
fn test_report_serializes_to_json() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    populate(input.path(), 2);
    std::fs::write(input.path().join("zz_corrupt.nii.gz"), b"garbage").unwrap();
    let mut config = config(input.path(), output.path());
    config.timeout_secs = Some(0);

    let report = register_directory(&config).unwrap();
    let json = serde_json::to_string(&report).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["total"], 3);
    assert_eq!(value["skipped"], 3);
    assert_eq!(value["template_strategy"], "central");
    assert_eq!(value["file_results"][0]["skip_reason"], "DeadlineReached");
}

#[test]
fn test_average_template_is_saved_with_outputs() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    populate(input.path(), 3);
    let mut config = config(input.path(), output.path());
    config.template = TemplateStrategy::Average;

    let report = register_directory(&config).unwrap();
    let saved = generated_template_path(output.path(), &TemplateStrategy::Average);
    assert_eq!(report.template.as_deref(), Some(saved.as_path()));
    assert_eq!(load_volume(&saved).unwrap().dims(), [8, 8, 8]);
    assert_eq!(report.template_strategy, "average");
}

#[test]
fn test_concurrent_runs_register_each_file_once() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    populate(input.path(), 4);
    let config = config(input.path(), output.path());

    let (a, b) = std::thread::scope(|s| {
        let a = s.spawn(|| register_directory(&config).unwrap());
        let b = s.spawn(|| register_directory(&config).unwrap());
        (a.join().unwrap(), b.join().unwrap())
    });

    assert_eq!(a.failed + b.failed, 0);
    assert_eq!(a.successful + b.successful, 4);
    assert_eq!(a.skipped + b.skipped, 4);
}

#[derive(Default)]
struct Counter {
    registering_total: AtomicUsize,
    last_advance: AtomicUsize,
}

impl ProgressReporter for Counter {
    fn begin_stage(&self, stage: PipelineStage, total_items: Option<usize>) {
        if stage == PipelineStage::Registering {
            self.registering_total.store(total_items.unwrap_or(0), Ordering::SeqCst);
        }
    }

    fn advance(&self, items_done: usize) {
        self.last_advance.store(items_done, Ordering::SeqCst);
    }
}

#[test]
fn test_progress_counts_every_file() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    populate(input.path(), 3);
    let mut config = config(input.path(), output.path());
    config.timeout_secs = Some(0);

    let counter = Arc::new(Counter::default());
    register_directory_reported(&config, counter.clone()).unwrap();
    assert_eq!(counter.registering_total.load(Ordering::SeqCst), 3);
    assert_eq!(counter.last_advance.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[test]
fn test_shifted_volume_moves_toward_template() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    for n in 0..4 {
        let v = blob_volume([8, 8, 8], [3.5, 3.5, 3.5], 1.5);
        write_volume(input.path(), &format!("sub{n:02}.nii.gz"), &v);
    }
    let shifted = blob_volume([8, 8, 8], [4.5, 3.5, 3.5], 1.5);
    write_volume(input.path(), "sub04.nii.gz", &shifted);

    let mut config = OrchestratorConfig::new(input.path(), output.path());
    config.template = TemplateStrategy::Average;
    config.workers = 2;
    config.registration = fast_config();

    let report = register_directory(&config).unwrap();
    assert_eq!(report.successful, 5, "{:?}", report.errors);

    let template = load_volume(report.template.as_deref().unwrap()).unwrap();
    let registered = load_volume(&output.path().join("sub04.reg.nii.gz")).unwrap();
    let target = template.center_of_mass();
    let before = (shifted.center_of_mass() - target).norm();
    let after = (registered.center_of_mass() - target).norm();
    assert!(after < before, "before {before:.3} mm, after {after:.3} mm");
}
