// THEORY:
// Residual area is not all plants: most of what a detector leaves unexplained
// in a greenhouse photograph is bare soil or substrate. Counting that as
// plant matter would wreck the estimate, so each band's residual is scrubbed
// by two independent, cheap foreground filters before any counting happens:
// 1.  **Brightness**: the band's luma histogram (over residual pixels only)
//     is split with an Otsu-style adaptive threshold. Flat, dark background
//     falls below the split; textured, lit foliage sits above it.
// 2.  **Color**: pixels whose RGB value falls inside a configured dark/brown
//     "soil" range are excluded outright, independent of brightness.
// The two decisions are ANDed together; under mixed lighting and varied
// substrate color their conjunction is materially more robust than either
// filter alone. A single round of 3x3 morphological opening then strips
// isolated single-pixel noise, and a final AND with the input residual
// guarantees suppression only ever removes area.

use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};

/// RGB range treated as soil/substrate and excluded from foreground.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloorFilterConfig {
    /// Lower RGB bound (inclusive) of the soil color range.
    pub soil_min: [u8; 3],
    /// Upper RGB bound (inclusive) of the soil color range.
    pub soil_max: [u8; 3],
}

impl Default for FloorFilterConfig {
    fn default() -> Self {
        // Dark browns through dull tans, the usual substrate palette.
        Self {
            soil_min: [30, 15, 0],
            soil_max: [150, 115, 95],
        }
    }
}

impl FloorFilterConfig {
    pub fn validate(&self) -> Result<(), String> {
        for channel in 0..3 {
            if self.soil_min[channel] > self.soil_max[channel] {
                return Err(format!(
                    "soil range channel {channel}: min {} exceeds max {}",
                    self.soil_min[channel], self.soil_max[channel]
                ));
            }
        }
        Ok(())
    }

    fn is_soil(&self, rgb: [u8; 3]) -> bool {
        (0..3).all(|c| rgb[c] >= self.soil_min[c] && rgb[c] <= self.soil_max[c])
    }
}

/// Removes floor/background pixels from one band's residual mask.
///
/// `crop` is the source-image rectangle the region overlays; it must share
/// dimensions with the residual mask. The output is always a subset of the
/// input residual.
pub fn suppress_floor(
    residual: &GrayImage,
    crop: &RgbImage,
    config: &FloorFilterConfig,
) -> GrayImage {
    debug_assert_eq!(residual.dimensions(), crop.dimensions());
    let (width, height) = residual.dimensions();
    let mut foreground = GrayImage::new(width, height);

    // --- 1. Adaptive brightness split over residual pixels ---
    let mut histogram = [0u64; 256];
    let mut total = 0u64;
    for (x, y, pixel) in residual.enumerate_pixels() {
        if pixel.0[0] > 0 {
            histogram[luma(crop.get_pixel(x, y).0) as usize] += 1;
            total += 1;
        }
    }
    if total == 0 {
        return foreground;
    }
    let threshold = otsu_threshold(&histogram, total);

    // --- 2. Conjunction of the two foreground decisions ---
    for (x, y, pixel) in residual.enumerate_pixels() {
        if pixel.0[0] == 0 {
            continue;
        }
        let rgb = crop.get_pixel(x, y).0;
        let bright = luma(rgb) > threshold;
        if bright && !config.is_soil(rgb) {
            foreground.put_pixel(x, y, Luma([255]));
        }
    }

    // --- 3. One round of opening, then re-clip to the residual ---
    let opened = dilate3x3(&erode3x3(&foreground));
    let mut suppressed = GrayImage::new(width, height);
    for (x, y, pixel) in opened.enumerate_pixels() {
        if pixel.0[0] > 0 && residual.get_pixel(x, y).0[0] > 0 {
            suppressed.put_pixel(x, y, Luma([255]));
        }
    }
    suppressed
}

/// Rec. 601 luma from 8-bit RGB.
fn luma(rgb: [u8; 3]) -> u8 {
    (0.299 * rgb[0] as f64 + 0.587 * rgb[1] as f64 + 0.114 * rgb[2] as f64).round() as u8
}

/// Classic Otsu: pick the threshold maximizing between-class variance.
fn otsu_threshold(histogram: &[u64; 256], total: u64) -> u8 {
    let sum_all: f64 = histogram
        .iter()
        .enumerate()
        .map(|(value, &count)| value as f64 * count as f64)
        .sum();

    let mut sum_background = 0.0;
    let mut weight_background = 0.0;
    let mut best_variance = 0.0;
    let mut best_threshold = 0u8;

    for value in 0..256 {
        weight_background += histogram[value] as f64;
        if weight_background == 0.0 {
            continue;
        }
        let weight_foreground = total as f64 - weight_background;
        if weight_foreground == 0.0 {
            break;
        }
        sum_background += value as f64 * histogram[value] as f64;

        let mean_background = sum_background / weight_background;
        let mean_foreground = (sum_all - sum_background) / weight_foreground;
        let diff = mean_background - mean_foreground;
        let variance = weight_background * weight_foreground * diff * diff;

        if variance > best_variance {
            best_variance = variance;
            best_threshold = value as u8;
        }
    }
    best_threshold
}

/// 3x3 erosion: a pixel survives only if its full neighborhood is set
/// (out-of-bounds neighbors count as unset).
fn erode3x3(mask: &GrayImage) -> GrayImage {
    let (width, height) = mask.dimensions();
    let mut eroded = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let mut keep = true;
            'kernel: for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                        keep = false;
                        break 'kernel;
                    }
                    if mask.get_pixel(nx as u32, ny as u32).0[0] == 0 {
                        keep = false;
                        break 'kernel;
                    }
                }
            }
            if keep {
                eroded.put_pixel(x, y, Luma([255]));
            }
        }
    }
    eroded
}

/// 3x3 dilation: a pixel is set if any neighbor (or itself) is set.
fn dilate3x3(mask: &GrayImage) -> GrayImage {
    let (width, height) = mask.dimensions();
    let mut dilated = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let mut set = false;
            'kernel: for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if nx >= 0 && ny >= 0 && nx < width as i64 && ny < height as i64 {
                        if mask.get_pixel(nx as u32, ny as u32).0[0] > 0 {
                            set = true;
                            break 'kernel;
                        }
                    }
                }
            }
            if set {
                dilated.put_pixel(x, y, Luma([255]));
            }
        }
    }
    dilated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::mask_builder::mask_area;
    use image::Rgb;

    const PLANT: [u8; 3] = [70, 180, 60];
    const SOIL: [u8; 3] = [95, 60, 35];

    /// Crop whose left half is foliage and right half is soil.
    fn split_crop(width: u32, height: u32) -> RgbImage {
        let mut crop = RgbImage::new(width, height);
        for (x, _, pixel) in crop.enumerate_pixels_mut() {
            *pixel = if x < width / 2 { Rgb(PLANT) } else { Rgb(SOIL) };
        }
        crop
    }

    fn full_residual(width: u32, height: u32) -> GrayImage {
        let mut mask = GrayImage::new(width, height);
        for pixel in mask.pixels_mut() {
            pixel.0[0] = 255;
        }
        mask
    }

    #[test]
    fn suppression_is_a_subset_of_the_residual() {
        let residual = full_residual(32, 32);
        let suppressed = suppress_floor(&residual, &split_crop(32, 32), &FloorFilterConfig::default());
        assert!(mask_area(&suppressed) <= mask_area(&residual));
        for (x, y, pixel) in suppressed.enumerate_pixels() {
            if pixel.0[0] > 0 {
                assert_eq!(residual.get_pixel(x, y).0[0], 255);
            }
        }
    }

    #[test]
    fn soil_half_is_removed_and_foliage_survives() {
        let residual = full_residual(32, 32);
        let suppressed = suppress_floor(&residual, &split_crop(32, 32), &FloorFilterConfig::default());
        // Interior foliage pixel, away from the opening's edge erosion.
        assert_eq!(suppressed.get_pixel(5, 16).0[0], 255);
        // Soil side is gone entirely.
        assert_eq!(suppressed.get_pixel(28, 16).0[0], 0);
    }

    #[test]
    fn empty_residual_yields_empty_suppression() {
        let residual = GrayImage::new(16, 16);
        let suppressed = suppress_floor(&residual, &split_crop(16, 16), &FloorFilterConfig::default());
        assert_eq!(mask_area(&suppressed), 0);
    }

    #[test]
    fn opening_removes_isolated_single_pixels() {
        // One lone bright pixel in a soil field: the brightness filter keeps
        // it, the opening must not.
        let mut crop = RgbImage::new(16, 16);
        for pixel in crop.pixels_mut() {
            *pixel = Rgb(SOIL);
        }
        crop.put_pixel(8, 8, Rgb(PLANT));
        let residual = full_residual(16, 16);
        let suppressed = suppress_floor(&residual, &crop, &FloorFilterConfig::default());
        assert_eq!(suppressed.get_pixel(8, 8).0[0], 0);
        assert_eq!(mask_area(&suppressed), 0);
    }

    #[test]
    fn soil_range_validation_rejects_inverted_bounds() {
        let config = FloorFilterConfig {
            soil_min: [100, 0, 0],
            soil_max: [50, 255, 255],
        };
        assert!(config.validate().is_err());
    }
}
