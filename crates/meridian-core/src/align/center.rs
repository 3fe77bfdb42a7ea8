use tracing::debug;

use crate::error::{MeridianError, Result};
use crate::transform::AffineTransform;
use crate::volume::Volume;

/// Translation taking the geometric center of `fixed` onto that of `moving`.
///
/// The returned transform maps fixed-space points to moving-space points.
/// Identical grids yield the zero translation.
pub fn center_align(fixed: &Volume, moving: &Volume) -> Result<AffineTransform> {
    for (role, volume) in [("fixed", fixed), ("moving", moving)] {
        if volume.grid().voxel_count() == 0 {
            return Err(MeridianError::InvalidVolume(format!("{role} volume is empty")));
        }
        if !volume.data().iter().any(|v| v.is_finite()) {
            return Err(MeridianError::InvalidVolume(format!(
                "{role} volume has no finite samples"
            )));
        }
    }
    let translation = moving.grid().center() - fixed.grid().center();
    debug!(
        tx = translation.x,
        ty = translation.y,
        tz = translation.z,
        "Center alignment"
    );
    Ok(AffineTransform::from_translation(translation))
}
