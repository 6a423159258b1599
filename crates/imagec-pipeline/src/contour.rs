//! Contour tracing on masks.
//!
//! Wraps [`imageproc::contours::find_contours`] (Suzuki-Abe border
//! following) and keeps outer borders only; holes belong to the object
//! that encloses them and are not reported separately.

use image::GrayImage;
use imageproc::contours::BorderType;

use crate::types::Point;

/// A closed outer contour in mask coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    points: Vec<Point>,
}

impl Contour {
    /// Create a contour from its boundary points (implicitly closed).
    #[must_use]
    pub const fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Boundary points.
    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Number of boundary points.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns `true` if the contour has no points.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Consume and return the points.
    #[must_use]
    pub fn into_points(self) -> Vec<Point> {
        self.points
    }

    /// Shift every point by `(dx, dy)`.
    #[must_use]
    pub fn translated(mut self, dx: f64, dy: f64) -> Self {
        for p in &mut self.points {
            p.x += dx;
            p.y += dy;
        }
        self
    }
}

/// Trace the outer borders of all foreground (non-zero) regions.
///
/// Returned contours are in pixel-centre coordinates of `mask`.
#[must_use = "returns the traced contours"]
pub fn trace_outer_contours(mask: &GrayImage) -> Vec<Contour> {
    let contours: Vec<imageproc::contours::Contour<i32>> =
        imageproc::contours::find_contours(mask);

    contours
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && !c.points.is_empty())
        .map(|c| {
            Contour::new(
                c.points
                    .into_iter()
                    .map(|p| Point::new(f64::from(p.x), f64::from(p.y)))
                    .collect(),
            )
        })
        .collect()
}

/// Length of a closed 8-connected boundary chain.
///
/// Axis-aligned steps count 1, diagonal steps count `sqrt(2)`, so a
/// staircase edge is shorter than its Manhattan length by `2 - sqrt(2)`
/// per corner.
#[must_use]
pub fn traced_perimeter(points: &[Point]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let n = points.len();
    (0..n)
        .map(|i| points[i].distance(points[(i + 1) % n]))
        .sum()
}

/// Circularity `4*pi*A / P^2`, capped at 1.
///
/// A zero perimeter (single pixel) counts as perfectly circular.
#[must_use]
pub fn circularity(area: f64, perimeter: f64) -> f64 {
    if perimeter <= 0.0 {
        return 1.0;
    }
    (4.0 * std::f64::consts::PI * area / (perimeter * perimeter)).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_rect(w: u32, h: u32, x0: u32, y0: u32, rw: u32, rh: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            if x >= x0 && x < x0 + rw && y >= y0 && y < y0 + rh {
                image::Luma([255])
            } else {
                image::Luma([0])
            }
        })
    }

    #[test]
    fn empty_mask_has_no_contours() {
        assert!(trace_outer_contours(&GrayImage::new(8, 8)).is_empty());
    }

    #[test]
    fn hole_is_not_reported() {
        let mut mask = filled_rect(20, 20, 2, 2, 16, 16);
        for y in 8..12 {
            for x in 8..12 {
                mask.put_pixel(x, y, image::Luma([0]));
            }
        }
        let contours = trace_outer_contours(&mask);
        assert_eq!(contours.len(), 1);
    }

    #[test]
    fn two_blobs_two_contours() {
        let mut mask = filled_rect(30, 10, 1, 1, 5, 5);
        for y in 1..6 {
            for x in 20..25 {
                mask.put_pixel(x, y, image::Luma([255]));
            }
        }
        assert_eq!(trace_outer_contours(&mask).len(), 2);
    }

    #[test]
    fn square_perimeter() {
        let mask = filled_rect(30, 30, 5, 5, 20, 20);
        let contours = trace_outer_contours(&mask);
        let perimeter = traced_perimeter(contours[0].points());
        assert!((perimeter - 76.0).abs() < 1e-9, "got {perimeter}");
    }

    #[test]
    fn circularity_is_capped() {
        assert!((circularity(400.0, 76.0) - 0.870).abs() < 0.001);
        assert!((circularity(100.0, 1.0) - 1.0).abs() < f64::EPSILON);
        assert!((circularity(1.0, 0.0) - 1.0).abs() < f64::EPSILON);
    }
}
