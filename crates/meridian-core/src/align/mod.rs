//! The three registration stages: center alignment, affine refinement and
//! diffeomorphic deformable refinement.

pub mod affine;
pub mod center;
pub mod deformable;
pub mod optim;

pub use affine::{register_affine, AffineConfig, AffineObjective, AffineResult};
pub use center::center_align;
pub use deformable::{
    integrate_velocity, register_deformable, DeformableConfig, DeformableObjective,
    DeformableResult,
};
pub use optim::{Adam, ConvergenceMonitor};
