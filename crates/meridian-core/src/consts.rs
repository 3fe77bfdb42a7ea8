/// Minimum voxel count to use Rayon parallelism in the CPU backend.
pub const PARALLEL_VOXEL_THRESHOLD: usize = 32_768;

/// Small epsilon to avoid division by zero in floating-point comparisons.
pub const EPSILON: f64 = 1e-10;

/// Determinant magnitude below which a 3x3 linear block is treated as singular.
pub const SINGULAR_DETERMINANT: f64 = 1e-12;

/// Stabilizer added to the LNCC denominator (variance product).
pub const LNCC_EPSILON: f64 = 1e-5;

/// Default LNCC window edge length in voxels.
pub const DEFAULT_LNCC_KERNEL_SIZE: usize = 7;

/// Default number of intensity bins per axis of the mutual-information histogram.
pub const DEFAULT_MI_BINS: usize = 32;

/// Parzen window standard deviation for mutual information, in bins.
pub const MI_PARZEN_SIGMA_BINS: f64 = 0.5;

/// Default minimum fraction of fixed voxels that must map inside the moving volume.
pub const DEFAULT_MIN_OVERLAP: f64 = 0.05;

/// Default iteration cap for the affine stage.
pub const DEFAULT_AFFINE_ITERATIONS: usize = 1500;

/// Default iteration cap for the deformable stage.
pub const DEFAULT_DEFORMABLE_ITERATIONS: usize = 5000;

/// Default number of squarings when integrating a stationary velocity field.
pub const DEFAULT_INTEGRATION_STEPS: usize = 6;

/// Default trailing window (in iterations) for convergence detection.
pub const DEFAULT_CONVERGENCE_WINDOW: usize = 50;

/// Default relative loss improvement over the window below which an optimizer stops.
pub const DEFAULT_CONVERGENCE_THRESHOLD: f64 = 1e-5;

/// Default fixed-point tolerance (mm) for transform inversion.
pub const DEFAULT_INVERSION_TOLERANCE_MM: f64 = 0.01;

/// Default iteration cap for transform inversion.
pub const DEFAULT_INVERSION_ITERATIONS: usize = 100;

/// Round-trip error, as a fraction of the smallest voxel spacing, accepted by
/// the inverse-consistency check.
pub const ROUND_TRIP_TOLERANCE_VOXELS: f64 = 0.1;

/// Fraction of voxels that must pass the inverse-consistency check.
pub const ROUND_TRIP_MIN_FRACTION: f64 = 0.95;

/// Default worker count for directory registration.
pub const DEFAULT_WORKERS: usize = 4;

/// Default candidate file pattern.
pub const DEFAULT_FILE_PATTERN: &str = "*.nii.gz";

/// Name of the human-readable run summary written to the output directory.
pub const SUMMARY_FILE_NAME: &str = "registration_summary.txt";

/// Suffix marking registered volumes; such files are never registration inputs.
pub const REGISTERED_SUFFIX: &str = "reg";

/// Suffix of persisted forward deformation fields.
pub const FORWARD_FIELD_SUFFIX: &str = "forward_field";

/// Suffix of persisted inverse deformation fields.
pub const INVERSE_FIELD_SUFFIX: &str = "inverse_field";

/// Extension appended to an output path to form its claim (lock) file.
pub const LOCK_EXTENSION: &str = "lock";
