// THEORY:
// Perspective makes identical plants shrink with distance from the camera,
// and in a fixed greenhouse rig distance correlates almost perfectly with row
// position. Splitting a region into N horizontal bands lets the estimator
// calibrate plant size independently per band instead of assuming one global
// average that is wrong at both ends of the tray.
//
// The partition must be exact: band y-ranges cover [0, H) with no gaps and no
// overlaps, and the final band absorbs the remainder of the integer division.
// Every downstream per-band quantity (residual area, suppressed area,
// calibration) relies on this exactness, so it is enforced here once.

use image::GrayImage;

/// Default number of horizontal bands. Fewer under-corrects perspective;
/// more starves per-band calibration of detections.
pub const DEFAULT_BAND_COUNT: usize = 4;

/// One horizontal slice of a region's residual mask.
#[derive(Debug, Clone)]
pub struct Band {
    /// Position of the band, 0 at the top of the region.
    pub index: usize,
    /// First row of the band (inclusive).
    pub y_start: u32,
    /// One past the last row of the band (exclusive).
    pub y_end: u32,
    /// Full-size residual mask with every row outside [y_start, y_end) zeroed.
    pub residual: GrayImage,
}

/// Splits a residual mask into `band_count` row-aligned slices of height
/// ⌊H/N⌋, the last slice taking any remainder so the bands exactly cover
/// [0, H).
pub fn partition_bands(residual: &GrayImage, band_count: usize) -> Vec<Band> {
    let (width, height) = residual.dimensions();
    let base_height = height / band_count as u32;
    let mut bands = Vec::with_capacity(band_count);

    for index in 0..band_count {
        let y_start = index as u32 * base_height;
        let y_end = if index == band_count - 1 {
            height
        } else {
            (index as u32 + 1) * base_height
        };

        let mut band_mask = GrayImage::new(width, height);
        for y in y_start..y_end {
            for x in 0..width {
                band_mask.put_pixel(x, y, *residual.get_pixel(x, y));
            }
        }

        bands.push(Band {
            index,
            y_start,
            y_end,
            residual: band_mask,
        });
    }
    bands
}
