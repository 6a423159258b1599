//! Circle detection by gradient Hough voting.
//!
//! Edges come from Canny on the 8-bit view of the plane. Every edge pixel
//! votes for centres along its gradient direction at each radius in
//! range; centres are the strongest accumulator peaks at least
//! `min_circle_distance` apart, and each centre takes the radius most of
//! the edge pixels around it agree on. Circles that do not fit entirely
//! inside the tile are dropped.

use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut, OutputKind};
use crate::class_id::ClassIdIn;
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::commands::edge_detection::canny;
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::object::{Object, ObjectId};
use crate::object_list::ObjectList;
use crate::raster::circle_mask;
use crate::types::{Dimensions, PipelineError, Point};

/// Hough circle options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HoughTransformSettings {
    /// Class of the detected circles.
    pub class_out: ClassIdIn,
    /// Smallest distance between two circle centres, in pixels.
    pub min_circle_distance: u32,
    /// Smallest radius searched.
    pub min_circle_radius: u32,
    /// Largest radius searched.
    pub max_circle_radius: u32,
    /// Upper Canny threshold; the lower one is half of it.
    pub edge_threshold: f32,
    /// Votes a centre needs to count as a circle.
    pub accumulator_threshold: u32,
}

impl Default for HoughTransformSettings {
    fn default() -> Self {
        Self {
            class_out: ClassIdIn::Default,
            min_circle_distance: 20,
            min_circle_radius: 5,
            max_circle_radius: 50,
            edge_threshold: 100.0,
            accumulator_threshold: 20,
        }
    }
}

impl StepSettings for HoughTransformSettings {
    fn in_out(&self) -> InOut {
        InOut::new(ArtifactSet::PIXELS, OutputKind::Object)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(self.min_circle_radius >= 1, "minCircleRadius must be at least 1");
        log.require(
            self.max_circle_radius >= self.min_circle_radius,
            format!(
                "maxCircleRadius ({}) is smaller than minCircleRadius ({})",
                self.max_circle_radius, self.min_circle_radius
            ),
        );
        log.require(self.edge_threshold > 0.0, "edgeThreshold must be positive");
        log.require(self.accumulator_threshold >= 1, "accumulatorThreshold must be at least 1");
        if matches!(self.class_out, ClassIdIn::None) {
            log.error("output class must not be NONE");
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(HoughTransform(self.clone())))
    }
}

settings_command!(HoughTransform, HoughTransformSettings, "houghTransform");

impl HoughTransform {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let class_out = ctx.resolve(self.0.class_out);
        let dims = image.dimensions();
        let circles = find_circles(&to_gray8(image), &self.0);
        let mut found = Vec::with_capacity(circles.len());
        for (centre, radius) in circles {
            let inside = centre.x >= radius
                && centre.y >= radius
                && centre.x + radius < f64::from(dims.width)
                && centre.y + radius < f64::from(dims.height);
            if !inside {
                continue;
            }
            let mask = circle_mask(centre, radius, dims);
            if let Some(mut object) =
                Object::from_tile_mask(ObjectId::new(0), class_out, image.id(), &mask, 1.0)
            {
                object.set_id(ctx.next_id());
                found.push(object);
            }
        }
        tracing::debug!(count = found.len(), "hough circles");
        objects.extend(found);
        Ok(())
    }
}

/// 8-bit view; binary planes map every label to white.
fn to_gray8(image: &ImagePlane) -> GrayImage {
    let pixels = image.to_gray16();
    let binary = image.is_binary();
    GrayImage::from_fn(pixels.width(), pixels.height(), |x, y| {
        let v = pixels.get_pixel(x, y).0[0];
        Luma([match (binary, v) {
            (true, 0) => 0,
            (true, _) => u8::MAX,
            (false, v) => v.to_be_bytes()[0],
        }])
    })
}

/// Detected circles as `(centre, radius)`, strongest first.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
fn find_circles(gray: &GrayImage, s: &HoughTransformSettings) -> Vec<(Point, f64)> {
    let dims = Dimensions::new(gray.width(), gray.height());
    let (w, h) = (dims.width as usize, dims.height as usize);
    let edges = canny(gray, s.edge_threshold / 2.0, s.edge_threshold);
    let gx = imageproc::gradients::horizontal_sobel(gray);
    let gy = imageproc::gradients::vertical_sobel(gray);

    let edge_pixels: Vec<(u32, u32)> = edges
        .enumerate_pixels()
        .filter(|(_, _, p)| p.0[0] != 0)
        .map(|(x, y, _)| (x, y))
        .collect();

    let mut acc = vec![0u32; w * h];
    for &(x, y) in &edge_pixels {
        let dx = f64::from(gx.get_pixel(x, y).0[0]);
        let dy = f64::from(gy.get_pixel(x, y).0[0]);
        let magnitude = dx.hypot(dy);
        if magnitude == 0.0 {
            continue;
        }
        let (ux, uy) = (dx / magnitude, dy / magnitude);
        for r in s.min_circle_radius..=s.max_circle_radius {
            for sign in [-1.0, 1.0] {
                let cx = (f64::from(x) + sign * f64::from(r) * ux).round();
                let cy = (f64::from(y) + sign * f64::from(r) * uy).round();
                if cx >= 0.0 && cy >= 0.0 && (cx as usize) < w && (cy as usize) < h {
                    acc[cy as usize * w + cx as usize] += 1;
                }
            }
        }
    }

    // Rounding spreads a centre's votes over its neighbours.
    let score = |i: usize| -> u32 {
        let (x, y) = ((i % w) as i64, (i / w) as i64);
        let mut sum = 0;
        for ny in (y - 1).max(0)..=(y + 1).min(h as i64 - 1) {
            for nx in (x - 1).max(0)..=(x + 1).min(w as i64 - 1) {
                sum += acc[ny as usize * w + nx as usize];
            }
        }
        sum
    };
    let scores: Vec<u32> = (0..acc.len()).map(score).collect();
    let mut peaks: Vec<usize> = (0..scores.len())
        .filter(|&i| scores[i] >= s.accumulator_threshold && acc[i] > 0)
        .collect();
    peaks.sort_by_key(|&i| (std::cmp::Reverse(scores[i]), std::cmp::Reverse(acc[i]), i));

    let min_distance = f64::from(s.min_circle_distance);
    let mut centres: Vec<Point> = Vec::new();
    for i in peaks {
        let centre = Point::new((i % w) as f64, (i / w) as f64);
        if centres.iter().all(|c| c.distance(centre) >= min_distance) {
            centres.push(centre);
        }
    }

    centres
        .into_iter()
        .filter_map(|centre| {
            best_radius(&edge_pixels, centre, s.min_circle_radius, s.max_circle_radius)
                .map(|r| (centre, f64::from(r)))
        })
        .collect()
}

/// Radius with the most edge pixels at that rounded distance.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn best_radius(edges: &[(u32, u32)], centre: Point, min: u32, max: u32) -> Option<u32> {
    let mut support = vec![0u32; (max - min + 1) as usize];
    for &(x, y) in edges {
        let d = centre.distance(Point::new(f64::from(x), f64::from(y))).round();
        if d >= f64::from(min) && d <= f64::from(max) {
            support[d as usize - min as usize] += 1;
        }
    }
    support
        .iter()
        .enumerate()
        .filter(|&(_, &n)| n > 0)
        .max_by_key(|&(i, &n)| (n, std::cmp::Reverse(i)))
        .and_then(|(i, _)| u32::try_from(i).ok())
        .map(|i| i + min)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::class_id::ClassId;
    use crate::commands::tests::{gray, run};

    fn discs(centres: &[(f64, f64)], r: f64) -> ImagePlane {
        let owned = centres.to_vec();
        gray(96, 64, move |x, y| {
            let inside = owned
                .iter()
                .any(|&(cx, cy)| (f64::from(x) - cx).hypot(f64::from(y) - cy) <= r);
            if inside { 50_000 } else { 500 }
        })
    }

    fn settings() -> HoughTransformSettings {
        HoughTransformSettings {
            class_out: ClassIdIn::Class(ClassId::new(4)),
            min_circle_radius: 6,
            max_circle_radius: 14,
            min_circle_distance: 15,
            ..HoughTransformSettings::default()
        }
    }

    #[test]
    fn finds_a_single_disc() {
        let mut image = discs(&[(30.0, 30.0)], 10.0);
        let mut objects = ObjectList::new();
        run(&HoughTransform(settings()), &mut image, &mut objects).unwrap();
        let circles = objects.class(ClassId::new(4));
        assert_eq!(circles.len(), 1);
        let c = circles[0].centre_of_mass();
        assert!((c.x - 30.0).abs() <= 1.5 && (c.y - 30.0).abs() <= 1.5);
        let r = (circles[0].area() as f64 / std::f64::consts::PI).sqrt();
        assert!((r - 10.0).abs() <= 1.5, "radius {r}");
    }

    #[test]
    fn two_separate_discs() {
        let mut image = discs(&[(25.0, 32.0), (70.0, 32.0)], 9.0);
        let mut objects = ObjectList::new();
        run(&HoughTransform(settings()), &mut image, &mut objects).unwrap();
        assert_eq!(objects.count(ClassId::new(4)), 2);
    }

    #[test]
    fn flat_plane_has_no_circles() {
        let mut image = gray(40, 40, |_, _| 1000);
        let mut objects = ObjectList::new();
        run(&HoughTransform(settings()), &mut image, &mut objects).unwrap();
        assert!(objects.is_empty());
    }

    #[test]
    fn inverted_radius_range_is_rejected() {
        let mut log = crate::diagnostics::CompileLog::new();
        HoughTransformSettings {
            min_circle_radius: 10,
            max_circle_radius: 5,
            ..HoughTransformSettings::default()
        }
        .check(&mut log.step("p", 0));
        assert!(log.has_errors());
    }
}
