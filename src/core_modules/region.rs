// THEORY:
// A `SegmentationRegion` is one physically distinct container (a tray, a box)
// found by the upstream segmenter inside the source photograph. The engine
// treats it as read-only input: every estimation run operates on exactly one
// region, and no region ever reads another region's data.
//
// The segmenter may describe a region either as a ready binary mask or as a
// boundary polygon. Polygons are validated (at least three vertices, non-zero
// area, no self-intersection between non-adjacent edges) and rasterized to a
// mask with an even-odd scanline fill, so everything downstream of this
// module only ever sees masks. Degenerate boundaries are a validation
// rejection, not a fatal error: the region is excluded with a warning and the
// session continues.

use crate::error::ValidationError;
use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};

/// The kind of physical container a region represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerType {
    Tray,
    Box,
    Other(String),
}

/// How the segmenter described the region's extent.
#[derive(Debug, Clone)]
pub enum RegionBoundary {
    /// A binary mask (0 = outside, non-zero = inside), region-local.
    Mask(GrayImage),
    /// A closed boundary polygon in region-local pixel coordinates.
    Polygon(Vec<(f64, f64)>),
}

/// One containment region produced by the external segmenter.
#[derive(Debug, Clone)]
pub struct SegmentationRegion {
    /// Stable identifier assigned by the segmenter.
    pub id: u64,
    /// Container tag carried through to the output records.
    pub container_type: ContainerType,
    /// Top-left corner of the region within the source image.
    pub origin: (u32, u32),
    /// Mask or polygon extent, region-local.
    pub boundary: RegionBoundary,
}

impl SegmentationRegion {
    /// Pixel dimensions of the region's mask. For polygon boundaries this
    /// also performs the full degeneracy validation, since the dimensions of
    /// a broken polygon are meaningless.
    pub fn mask_dimensions(&self) -> Result<(u32, u32), ValidationError> {
        match &self.boundary {
            RegionBoundary::Mask(mask) => {
                if mask.width() == 0 || mask.height() == 0 {
                    return Err(ValidationError::DegenerateBoundary(
                        "zero-dimension mask".to_string(),
                    ));
                }
                Ok((mask.width(), mask.height()))
            }
            RegionBoundary::Polygon(points) => {
                validate_polygon(points)?;
                Ok(polygon_dimensions(points))
            }
        }
    }

    /// Resolves the boundary into a binary mask (0 or 255 per pixel).
    pub fn resolve_mask(&self) -> Result<GrayImage, ValidationError> {
        match &self.boundary {
            RegionBoundary::Mask(mask) => {
                if mask.width() == 0 || mask.height() == 0 {
                    return Err(ValidationError::DegenerateBoundary(
                        "zero-dimension mask".to_string(),
                    ));
                }
                // Normalize any non-zero value to 255.
                let mut binary = mask.clone();
                for pixel in binary.pixels_mut() {
                    pixel.0[0] = if pixel.0[0] > 0 { 255 } else { 0 };
                }
                Ok(binary)
            }
            RegionBoundary::Polygon(points) => {
                validate_polygon(points)?;
                Ok(rasterize_polygon(points))
            }
        }
    }

    /// Cuts this region's rectangle out of the source image. The crop must
    /// lie fully inside the source.
    pub fn crop_from(&self, source: &RgbImage) -> Result<RgbImage, ValidationError> {
        let (width, height) = self.mask_dimensions()?;
        let (x, y) = self.origin;
        if x.saturating_add(width) > source.width() || y.saturating_add(height) > source.height() {
            return Err(ValidationError::CropOutOfBounds {
                x,
                y,
                width,
                height,
                source_width: source.width(),
                source_height: source.height(),
            });
        }
        Ok(image::imageops::crop_imm(source, x, y, width, height).to_image())
    }
}

/// Rejects polygons with fewer than three vertices, negative coordinates,
/// zero area, or a proper crossing between two non-adjacent edges.
fn validate_polygon(points: &[(f64, f64)]) -> Result<(), ValidationError> {
    if points.len() < 3 {
        return Err(ValidationError::DegenerateBoundary(format!(
            "{} vertices, need at least 3",
            points.len()
        )));
    }
    if points.iter().any(|&(x, y)| x < 0.0 || y < 0.0) {
        return Err(ValidationError::DegenerateBoundary(
            "negative vertex coordinate".to_string(),
        ));
    }
    if shoelace_area(points).abs() < f64::EPSILON {
        return Err(ValidationError::DegenerateBoundary(
            "zero enclosed area".to_string(),
        ));
    }

    let n = points.len();
    for i in 0..n {
        for j in (i + 1)..n {
            // Adjacent edges share a vertex and may legitimately touch.
            if j == i + 1 || (i == 0 && j == n - 1) {
                continue;
            }
            let a = points[i];
            let b = points[(i + 1) % n];
            let c = points[j];
            let d = points[(j + 1) % n];
            if segments_cross(a, b, c, d) {
                return Err(ValidationError::DegenerateBoundary(format!(
                    "edges {i} and {j} intersect"
                )));
            }
        }
    }
    Ok(())
}

/// Signed polygon area via the shoelace formula (halved).
fn shoelace_area(points: &[(f64, f64)]) -> f64 {
    let n = points.len();
    let mut twice_area = 0.0;
    for i in 0..n {
        let (x1, y1) = points[i];
        let (x2, y2) = points[(i + 1) % n];
        twice_area += x1 * y2 - x2 * y1;
    }
    twice_area / 2.0
}

fn orientation(p: (f64, f64), q: (f64, f64), r: (f64, f64)) -> f64 {
    (q.0 - p.0) * (r.1 - p.1) - (q.1 - p.1) * (r.0 - p.0)
}

/// Proper-crossing test: the segments intersect at a single interior point.
fn segments_cross(a: (f64, f64), b: (f64, f64), c: (f64, f64), d: (f64, f64)) -> bool {
    let o1 = orientation(a, b, c);
    let o2 = orientation(a, b, d);
    let o3 = orientation(c, d, a);
    let o4 = orientation(c, d, b);
    (o1 * o2 < 0.0) && (o3 * o4 < 0.0)
}

fn polygon_dimensions(points: &[(f64, f64)]) -> (u32, u32) {
    let max_x = points.iter().map(|p| p.0).fold(0.0_f64, f64::max);
    let max_y = points.iter().map(|p| p.1).fold(0.0_f64, f64::max);
    (max_x.ceil().max(1.0) as u32, max_y.ceil().max(1.0) as u32)
}

/// Even-odd scanline fill, sampling each pixel at its center.
fn rasterize_polygon(points: &[(f64, f64)]) -> GrayImage {
    let (width, height) = polygon_dimensions(points);
    let mut mask = GrayImage::new(width, height);
    let n = points.len();

    for row in 0..height {
        let scan_y = row as f64 + 0.5;

        // Collect x-coordinates where polygon edges cross this scanline.
        let mut crossings: Vec<f64> = Vec::new();
        for i in 0..n {
            let (x1, y1) = points[i];
            let (x2, y2) = points[(i + 1) % n];
            let spans = (y1 <= scan_y && y2 > scan_y) || (y2 <= scan_y && y1 > scan_y);
            if spans {
                crossings.push(x1 + (scan_y - y1) * (x2 - x1) / (y2 - y1));
            }
        }
        crossings.sort_by(|a, b| a.total_cmp(b));

        // Fill between alternate crossing pairs.
        for pair in crossings.chunks_exact(2) {
            let (start, end) = (pair[0], pair[1]);
            for col in 0..width {
                let center = col as f64 + 0.5;
                if center >= start && center < end {
                    mask.put_pixel(col, row, Luma([255]));
                }
            }
        }
    }
    mask
}
