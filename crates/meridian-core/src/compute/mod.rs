mod backend;
pub mod cpu;

pub use backend::{create_backend, ComputeBackend, DevicePreference, SampledGradient};
