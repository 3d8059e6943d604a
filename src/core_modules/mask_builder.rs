// THEORY:
// The detection mask is the engine's record of which pixels are already
// "explained" by the upstream detector. Everything not covered by it is
// residual area, the raw material for the undetected-plant estimate.
//
// Each detection is rendered as a filled circle rather than its bounding
// rectangle: plants are roughly radial, and circles with softened,
// re-thresholded edges approximate a detector's true footprint without the
// hard seams a grid of touching rectangles would leave. The soft edge comes
// from a light gaussian blur followed by re-binarization, so the output is
// still a strict 0/255 mask.
//
// The residual computation is a pure set operation: region AND NOT detection.
// It can only ever remove area, which gives the pipeline one of its core
// invariants (residual_area <= region_area).

use crate::core_modules::detection::Detection;
use image::{GrayImage, Luma};

/// Circle radius as a fraction of the detection's larger side.
pub const DEFAULT_RADIUS_SCALE: f64 = 0.85;
/// Gaussian sigma for softening circle edges before re-thresholding.
const EDGE_SOFTEN_SIGMA: f32 = 1.2;
/// Cutoff used to re-binarize the blurred mask.
const BINARY_THRESHOLD: u8 = 128;

/// Renders the soft "explained-by-detection" mask for a region.
///
/// An empty detection list yields an all-zero mask; there are no error
/// conditions.
pub fn build_detection_mask(
    detections: &[Detection],
    width: u32,
    height: u32,
    radius_scale: f64,
) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    if detections.is_empty() || width == 0 || height == 0 {
        return mask;
    }

    for detection in detections {
        let radius = radius_scale * detection.width.max(detection.height);
        fill_circle(&mut mask, detection.center_x, detection.center_y, radius);
    }

    // Soften the edges, then snap back to binary.
    let softened = image::imageops::blur(&mask, EDGE_SOFTEN_SIGMA);
    let mut binary = softened;
    for pixel in binary.pixels_mut() {
        pixel.0[0] = if pixel.0[0] >= BINARY_THRESHOLD { 255 } else { 0 };
    }
    binary
}

/// `region AND NOT detection`: the area not yet explained by any detection.
/// Both masks must share dimensions; the output is a subset of the region.
pub fn residual_mask(region: &GrayImage, detection: &GrayImage) -> GrayImage {
    debug_assert_eq!(region.dimensions(), detection.dimensions());
    let mut residual = GrayImage::new(region.width(), region.height());
    for (x, y, pixel) in region.enumerate_pixels() {
        if pixel.0[0] > 0 && detection.get_pixel(x, y).0[0] == 0 {
            residual.put_pixel(x, y, Luma([255]));
        }
    }
    residual
}

/// Number of set pixels in a binary mask.
pub fn mask_area(mask: &GrayImage) -> u64 {
    mask.pixels().filter(|p| p.0[0] > 0).count() as u64
}

fn fill_circle(mask: &mut GrayImage, center_x: f64, center_y: f64, radius: f64) {
    if radius <= 0.0 {
        return;
    }
    let (width, height) = mask.dimensions();
    let min_x = (center_x - radius).floor().max(0.0) as u32;
    let max_x = ((center_x + radius).ceil() as i64).min(width as i64 - 1).max(0) as u32;
    let min_y = (center_y - radius).floor().max(0.0) as u32;
    let max_y = ((center_y + radius).ceil() as i64).min(height as i64 - 1).max(0) as u32;
    let radius_sq = radius * radius;

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let dx = x as f64 + 0.5 - center_x;
            let dy = y as f64 + 0.5 - center_y;
            if dx * dx + dy * dy <= radius_sq {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection_at(center_x: f64, center_y: f64, side: f64) -> Detection {
        Detection {
            center_x,
            center_y,
            width: side,
            height: side,
            confidence: 0.9,
            class_label: "plant".to_string(),
        }
    }

    #[test]
    fn empty_detection_list_yields_all_zero_mask() {
        let mask = build_detection_mask(&[], 64, 64, DEFAULT_RADIUS_SCALE);
        assert_eq!(mask_area(&mask), 0);
    }

    #[test]
    fn detection_mask_covers_the_detection_center() {
        let detections = vec![detection_at(32.0, 32.0, 20.0)];
        let mask = build_detection_mask(&detections, 64, 64, DEFAULT_RADIUS_SCALE);
        assert_eq!(mask.get_pixel(32, 32).0[0], 255);
        assert!(mask_area(&mask) > 0);
        // A corner far outside the circle stays unexplained.
        assert_eq!(mask.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn detections_near_the_edge_are_clipped_not_rejected() {
        let detections = vec![detection_at(1.0, 1.0, 30.0)];
        let mask = build_detection_mask(&detections, 64, 64, DEFAULT_RADIUS_SCALE);
        assert!(mask_area(&mask) > 0);
    }

    #[test]
    fn residual_never_exceeds_region() {
        let mut region = GrayImage::new(32, 32);
        for y in 0..32 {
            for x in 0..16 {
                region.put_pixel(x, y, Luma([255]));
            }
        }
        let detections = vec![detection_at(8.0, 8.0, 10.0)];
        let detection_mask = build_detection_mask(&detections, 32, 32, DEFAULT_RADIUS_SCALE);
        let residual = residual_mask(&region, &detection_mask);

        let region_area = mask_area(&region);
        let residual_area = mask_area(&residual);
        assert!(residual_area <= region_area);
        assert!(residual_area < region_area, "circle should explain some area");

        // Residual pixels are always region pixels.
        for (x, y, pixel) in residual.enumerate_pixels() {
            if pixel.0[0] > 0 {
                assert_eq!(region.get_pixel(x, y).0[0], 255);
            }
        }
    }

    #[test]
    fn residual_of_empty_detection_mask_is_the_region() {
        let mut region = GrayImage::new(16, 16);
        region.put_pixel(5, 5, Luma([255]));
        let empty = build_detection_mask(&[], 16, 16, DEFAULT_RADIUS_SCALE);
        let residual = residual_mask(&region, &empty);
        assert_eq!(mask_area(&residual), mask_area(&region));
    }
}
