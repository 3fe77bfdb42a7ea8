pub mod align;
pub mod compute;
pub mod consts;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod similarity;
pub mod transform;
pub mod volume;
