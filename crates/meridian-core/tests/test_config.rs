use std::path::PathBuf;

use meridian_core::compute::DevicePreference;
use meridian_core::consts::{DEFAULT_FILE_PATTERN, DEFAULT_WORKERS};
use meridian_core::error::{FailureKind, MeridianError};
use meridian_core::pipeline::{OrchestratorConfig, RegistrationConfig, TemplateStrategy};
use meridian_core::similarity::Metric;
use meridian_core::transform::{FillPolicy, Interpolation};

fn assert_invalid(config: &RegistrationConfig) {
    match config.validate() {
        Err(MeridianError::InvalidConfig(_)) => {}
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

#[test]
fn test_registration_defaults_validate() {
    let config = RegistrationConfig::default();
    config.validate().unwrap();
    assert_eq!(config.device, DevicePreference::Auto);
    assert_eq!(config.similarity.metric, Metric::Lncc);
    assert_eq!(config.similarity.kernel_size % 2, 1);
    assert!(config.deformable.enabled);
    assert_eq!(config.interpolation, Interpolation::Linear);
    assert_eq!(config.fill, FillPolicy::Constant(0.0));
}

#[test]
fn test_orchestrator_defaults() {
    let config = OrchestratorConfig::new("in", "out");
    config.validate().unwrap();
    assert_eq!(config.input_dir, PathBuf::from("in"));
    assert_eq!(config.output_dir, PathBuf::from("out"));
    assert_eq!(config.template, TemplateStrategy::Central);
    assert_eq!(config.file_pattern, DEFAULT_FILE_PATTERN);
    assert_eq!(config.workers, DEFAULT_WORKERS);
    assert_eq!(config.timeout_secs, None);
    assert!(config.sort_results);
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

#[test]
fn test_template_strategy_display() {
    assert_eq!(TemplateStrategy::Central.to_string(), "central");
    assert_eq!(TemplateStrategy::Average.to_string(), "average");
    assert_eq!(TemplateStrategy::Index { index: 4 }.to_string(), "index 4");
    let specified = TemplateStrategy::Specified {
        path: PathBuf::from("atlas.nii.gz"),
    };
    assert_eq!(specified.to_string(), "specified (atlas.nii.gz)");
    assert_eq!(specified.name(), "specified");
}

#[test]
fn test_failure_kind_display() {
    assert_eq!(FailureKind::InvalidVolume.to_string(), "InvalidVolumeError");
    assert_eq!(
        FailureKind::NonInvertibleTransform.to_string(),
        "NonInvertibleTransformError"
    );
    let err = MeridianError::DegenerateOverlap { overlap: 0.0 };
    assert_eq!(err.kind(), FailureKind::DegenerateOverlap);
    assert_eq!(
        MeridianError::FileNotFound(PathBuf::from("x")).kind(),
        FailureKind::InvalidVolume
    );
}

// ---------------------------------------------------------------------------
// TOML
// ---------------------------------------------------------------------------

#[test]
fn test_minimal_toml_fills_defaults() {
    let config: OrchestratorConfig = toml::from_str(
        r#"
        input_dir = "/data/in"
        output_dir = "/data/out"
        "#,
    )
    .unwrap();
    assert_eq!(config.template, TemplateStrategy::Central);
    assert_eq!(config.workers, DEFAULT_WORKERS);
    assert_eq!(config.file_pattern, DEFAULT_FILE_PATTERN);
    assert!(config.sort_results);
    config.validate().unwrap();
}

#[test]
fn test_partial_tables_override_only_named_fields() {
    let config: OrchestratorConfig = toml::from_str(
        r#"
        input_dir = "in"
        output_dir = "out"
        template = "average"
        workers = 2
        timeout_secs = 600

        [registration]
        device = "Cpu"
        fill = "NearestEdge"

        [registration.similarity]
        metric = "Mse"
        kernel_size = 5

        [registration.deformable]
        enabled = false
        "#,
    )
    .unwrap();
    assert_eq!(config.template, TemplateStrategy::Average);
    assert_eq!(config.workers, 2);
    assert_eq!(config.timeout_secs, Some(600));
    let reg = &config.registration;
    assert_eq!(reg.device, DevicePreference::Cpu);
    assert_eq!(reg.fill, FillPolicy::NearestEdge);
    assert_eq!(reg.similarity.metric, Metric::Mse);
    assert_eq!(reg.similarity.kernel_size, 5);
    assert!(reg.similarity.normalize);
    assert!(!reg.deformable.enabled);
    assert_eq!(
        reg.deformable.max_iterations,
        RegistrationConfig::default().deformable.max_iterations
    );
}

#[test]
fn test_template_strategy_forms() {
    let config: OrchestratorConfig = toml::from_str(
        r#"
        input_dir = "in"
        output_dir = "out"
        template = { index = { index = 3 } }
        "#,
    )
    .unwrap();
    assert_eq!(config.template, TemplateStrategy::Index { index: 3 });

    let config: OrchestratorConfig = toml::from_str(
        r#"
        input_dir = "in"
        output_dir = "out"

        [template.specified]
        path = "/atlas/mni.nii.gz"
        "#,
    )
    .unwrap();
    assert_eq!(
        config.template,
        TemplateStrategy::Specified {
            path: PathBuf::from("/atlas/mni.nii.gz")
        }
    );
}

#[test]
fn test_constant_fill_from_toml() {
    let config: RegistrationConfig = toml::from_str("fill = { Constant = -1.5 }").unwrap();
    assert_eq!(config.fill, FillPolicy::Constant(-1.5));
}

#[test]
fn test_mutual_information_metric_from_toml() {
    let config: RegistrationConfig = toml::from_str(
        r#"
        [similarity]
        metric = "MutualInformation"
        histogram_bins = 48
        "#,
    )
    .unwrap();
    assert_eq!(config.similarity.metric, Metric::MutualInformation);
    assert_eq!(config.similarity.histogram_bins, 48);
    assert_eq!(config.similarity.metric.to_string(), "MI");
    config.validate().unwrap();
}

#[test]
fn test_unknown_template_strategy_is_rejected() {
    let parsed: Result<OrchestratorConfig, _> = toml::from_str(
        r#"
        input_dir = "in"
        output_dir = "out"
        template = "median"
        "#,
    );
    assert!(parsed.is_err());
}

#[test]
fn test_config_survives_toml_round_trip() {
    let mut config = OrchestratorConfig::new("in", "out");
    config.template = TemplateStrategy::Index { index: 7 };
    config.registration.similarity.kernel_size = 9;
    config.registration.fill = FillPolicy::NearestEdge;
    let text = toml::to_string(&config).unwrap();
    let back: OrchestratorConfig = toml::from_str(&text).unwrap();
    assert_eq!(back.template, config.template);
    assert_eq!(back.registration.similarity.kernel_size, 9);
    assert_eq!(back.registration.fill, FillPolicy::NearestEdge);
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn test_even_kernel_rejected() {
    let mut config = RegistrationConfig::default();
    config.similarity.kernel_size = 4;
    assert_invalid(&config);
    config.similarity.kernel_size = 0;
    assert_invalid(&config);
}

#[test]
fn test_too_few_histogram_bins_rejected() {
    let mut config = RegistrationConfig::default();
    config.similarity.histogram_bins = 2;
    assert_invalid(&config);
}

#[test]
fn test_bad_percentiles_rejected() {
    let mut config = RegistrationConfig::default();
    config.similarity.lower_percentile = 90.0;
    config.similarity.upper_percentile = 10.0;
    assert_invalid(&config);
    config.similarity.lower_percentile = 0.0;
    config.similarity.upper_percentile = 101.0;
    assert_invalid(&config);
}

#[test]
fn test_overlap_out_of_range_rejected() {
    let mut config = RegistrationConfig::default();
    config.similarity.min_overlap = 1.5;
    assert_invalid(&config);
}

#[test]
fn test_non_positive_learning_rates_rejected() {
    let mut config = RegistrationConfig::default();
    config.affine.learning_rate = 0.0;
    assert_invalid(&config);

    let mut config = RegistrationConfig::default();
    config.deformable.learning_rate = f64::NAN;
    assert_invalid(&config);

    // Ignored while the stage is disabled.
    config.deformable.enabled = false;
    config.validate().unwrap();
}

#[test]
fn test_negative_penalty_weights_rejected() {
    let mut config = RegistrationConfig::default();
    config.deformable.gradient_weight = -0.1;
    assert_invalid(&config);
}

#[test]
fn test_zero_iteration_caps_rejected() {
    let mut config = RegistrationConfig::default();
    config.affine.max_iterations = 0;
    assert_invalid(&config);

    let mut config = RegistrationConfig::default();
    config.inversion.max_iterations = 0;
    assert_invalid(&config);
}

#[test]
fn test_orchestrator_rejects_zero_workers_and_empty_pattern() {
    let mut config = OrchestratorConfig::new("in", "out");
    config.workers = 0;
    assert!(matches!(config.validate(), Err(MeridianError::InvalidConfig(_))));

    let mut config = OrchestratorConfig::new("in", "out");
    config.file_pattern.clear();
    assert!(matches!(config.validate(), Err(MeridianError::InvalidConfig(_))));

    let mut config = OrchestratorConfig::new("in", "out");
    config.registration.similarity.kernel_size = 2;
    assert!(matches!(config.validate(), Err(MeridianError::InvalidConfig(_))));
}
