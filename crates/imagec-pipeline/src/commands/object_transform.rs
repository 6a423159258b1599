//! Reshape objects: scale, snap to a fixed circle, or replace by a
//! fitted circle or ellipse.
//!
//! When input and output class are the same the objects are reshaped in
//! place and keep their identifiers. Otherwise each reshaped object is a
//! new object in the output class, parented to its source, and the
//! source is left untouched.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut, OutputKind};
use crate::class_id::ClassIdIn;
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::object::Object;
use crate::object_list::ObjectList;
use crate::raster::{circle_mask, ellipse_mask, polygon_mask};
use crate::types::{Dimensions, PipelineError, Point};

/// Shape function applied to every object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformFunction {
    /// Scale the contour about the centre of mass by `factor`.
    #[default]
    Scale,
    /// Circle of `snapAreaSize` diameter at the centre of mass.
    SnapArea,
    /// Smallest circle enclosing the contour.
    MinCircle,
    /// Circle with the object's area at its centre of mass.
    ExactCircle,
    /// Ellipse with the object's second moments.
    FitEllipse,
}

/// Object transform options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectTransformSettings {
    /// Class whose objects are transformed.
    pub class_in: ClassIdIn,
    /// Class of the result; the same class transforms in place.
    pub class_out: ClassIdIn,
    /// Shape function.
    pub function: TransformFunction,
    /// Scale factor.
    pub factor: f64,
    /// Diameter for [`TransformFunction::SnapArea`], in pixels.
    pub snap_area_size: u32,
}

impl Default for ObjectTransformSettings {
    fn default() -> Self {
        Self {
            class_in: ClassIdIn::Default,
            class_out: ClassIdIn::Default,
            function: TransformFunction::Scale,
            factor: 1.0,
            snap_area_size: 0,
        }
    }
}

impl StepSettings for ObjectTransformSettings {
    fn in_out(&self) -> InOut {
        InOut::new(ArtifactSet::OBJECT, OutputKind::Object)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        match self.function {
            TransformFunction::Scale => log.require(
                self.factor > 0.0,
                format!("scale factor must be positive, got {}", self.factor),
            ),
            TransformFunction::SnapArea => {
                log.require(self.snap_area_size > 0, "snapAreaSize must be positive");
            }
            _ => {}
        }
        if matches!(self.class_out, ClassIdIn::None) {
            log.error("output class must not be NONE");
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(ObjectTransform(self.clone())))
    }
}

settings_command!(ObjectTransform, ObjectTransformSettings, "objectTransform");

impl ObjectTransform {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let class_in = ctx.resolve(self.0.class_in);
        let class_out = ctx.resolve(self.0.class_out);
        let dims = image.dimensions();

        if class_in == class_out {
            for object in objects.class_mut(class_in) {
                if let Some(reshaped) = self.reshape(object, dims) {
                    *object = reshaped;
                }
            }
            return Ok(());
        }

        let copies: Vec<Object> = objects
            .class(class_in)
            .iter()
            .filter_map(|object| {
                self.reshape(object, dims)
                    .map(|reshaped| reshaped.copy_as(ctx.next_id(), class_out))
            })
            .collect();
        tracing::debug!(count = copies.len(), %class_out, "transformed copies");
        objects.extend(copies);
        Ok(())
    }

    fn reshape(&self, object: &Object, dims: Dimensions) -> Option<Object> {
        let mask = shape_mask(&self.0, object, dims);
        object.with_tile_mask(&mask)
    }
}

fn shape_mask(settings: &ObjectTransformSettings, object: &Object, dims: Dimensions) -> GrayImage {
    let centre = object.centre_of_mass();
    match settings.function {
        TransformFunction::Scale => {
            let points: Vec<Point> = object
                .contour()
                .iter()
                .map(|p| {
                    Point::new(
                        (p.x - centre.x).mul_add(settings.factor, centre.x),
                        (p.y - centre.y).mul_add(settings.factor, centre.y),
                    )
                })
                .collect();
            polygon_mask(&points, dims)
        }
        TransformFunction::SnapArea => snap_area(centre, settings.snap_area_size, dims),
        TransformFunction::MinCircle => {
            let (c, r) = min_enclosing_circle(object.contour());
            circle_mask(c, r + 0.5, dims)
        }
        TransformFunction::ExactCircle => {
            #[allow(clippy::cast_precision_loss)]
            let r = (object.area() as f64 / std::f64::consts::PI).sqrt();
            circle_mask(centre, r, dims)
        }
        TransformFunction::FitEllipse => {
            let (a, b, angle) = fit_ellipse(object);
            ellipse_mask(centre, a, b, angle, dims)
        }
    }
}

/// Circle of `diameter` pixels at `centre`.
pub(crate) fn snap_area(centre: Point, diameter: u32, dims: Dimensions) -> GrayImage {
    circle_mask(centre, f64::from(diameter) / 2.0, dims)
}

const EPS: f64 = 1e-7;

/// Smallest circle enclosing every point (incremental Welzl).
#[must_use]
pub fn min_enclosing_circle(points: &[Point]) -> (Point, f64) {
    let Some(&first) = points.first() else {
        return (Point::new(0.0, 0.0), 0.0);
    };
    let outside = |c: Point, r: f64, p: Point| c.distance(p) > r + EPS;
    let (mut c, mut r) = (first, 0.0);
    for (i, &pi) in points.iter().enumerate().skip(1) {
        if !outside(c, r, pi) {
            continue;
        }
        (c, r) = (pi, 0.0);
        for (j, &pj) in points.iter().enumerate().take(i) {
            if !outside(c, r, pj) {
                continue;
            }
            c = Point::new((pi.x + pj.x) / 2.0, (pi.y + pj.y) / 2.0);
            r = c.distance(pi);
            for &pk in &points[..j] {
                if outside(c, r, pk) {
                    (c, r) = circumcircle(pi, pj, pk).unwrap_or((c, r.max(c.distance(pk))));
                }
            }
        }
    }
    (c, r)
}

fn circumcircle(a: Point, b: Point, c: Point) -> Option<(Point, f64)> {
    let d = 2.0 * (a.x * (b.y - c.y) + b.x * (c.y - a.y) + c.x * (a.y - b.y));
    if d.abs() < EPS {
        return None;
    }
    let a2 = a.x.mul_add(a.x, a.y * a.y);
    let b2 = b.x.mul_add(b.x, b.y * b.y);
    let c2 = c.x.mul_add(c.x, c.y * c.y);
    let ux = (a2 * (b.y - c.y) + b2 * (c.y - a.y) + c2 * (a.y - b.y)) / d;
    let uy = (a2 * (c.x - b.x) + b2 * (a.x - c.x) + c2 * (b.x - a.x)) / d;
    let centre = Point::new(ux, uy);
    Some((centre, centre.distance(a)))
}

/// Semi-axes and orientation (radians) of the ellipse with the same
/// second moments as the object's pixels.
#[allow(clippy::cast_precision_loss)]
fn fit_ellipse(object: &Object) -> (f64, f64, f64) {
    let c = object.centre_of_mass();
    let n = object.area().max(1) as f64;
    let (mut mu20, mut mu02, mut mu11) = (0.0, 0.0, 0.0);
    for (x, y) in object.pixels() {
        let dx = f64::from(x) - c.x;
        let dy = f64::from(y) - c.y;
        mu20 += dx * dx;
        mu02 += dy * dy;
        mu11 += dx * dy;
    }
    mu20 /= n;
    mu02 /= n;
    mu11 /= n;
    let half_sum = (mu20 + mu02) / 2.0;
    let root = (4.0 * mu11).mul_add(mu11, (mu20 - mu02).powi(2)).sqrt() / 2.0;
    let major = 2.0 * (half_sum + root).max(0.0).sqrt();
    let minor = 2.0 * (half_sum - root).max(0.0).sqrt();
    let angle = 0.5 * (2.0 * mu11).atan2(mu20 - mu02);
    (major.max(0.5), minor.max(0.5), angle)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::class_id::ClassId;
    use crate::commands::tests::{gray, run};
    use crate::object::tests::square;

    fn transform(function: TransformFunction, class_out: u16) -> ObjectTransformSettings {
        ObjectTransformSettings {
            class_in: ClassIdIn::Class(ClassId::new(1)),
            class_out: ClassIdIn::Class(ClassId::new(class_out)),
            function,
            ..ObjectTransformSettings::default()
        }
    }

    fn run_on_square(settings: ObjectTransformSettings) -> ObjectList {
        let mut objects = ObjectList::new();
        objects.push(square(7, 1, 20, 20, 10));
        let mut image = gray(64, 64, |_, _| 0);
        run(&ObjectTransform(settings), &mut image, &mut objects).unwrap();
        objects
    }

    #[test]
    fn in_place_keeps_identifier() {
        let objects = run_on_square(ObjectTransformSettings {
            factor: 2.0,
            ..transform(TransformFunction::Scale, 1)
        });
        let scaled = &objects.class(ClassId::new(1))[0];
        assert_eq!(objects.len(), 1);
        assert_eq!(scaled.id().get(), 7);
        assert!((300..=420).contains(&scaled.area()), "area {}", scaled.area());
        assert!((scaled.centre_of_mass().x - 24.5).abs() < 1.0);
    }

    #[test]
    fn copy_is_parented_and_source_untouched() {
        let objects = run_on_square(transform(TransformFunction::ExactCircle, 2));
        let source = &objects.class(ClassId::new(1))[0];
        let circle = &objects.class(ClassId::new(2))[0];
        assert_eq!(source.area(), 100);
        assert_ne!(circle.id(), source.id());
        assert_eq!(circle.parent_id(), Some(source.id()));
        assert!((85..=115).contains(&circle.area()), "area {}", circle.area());
    }

    #[test]
    fn snap_area_uses_fixed_diameter() {
        let objects = run_on_square(ObjectTransformSettings {
            snap_area_size: 6,
            ..transform(TransformFunction::SnapArea, 1)
        });
        let snapped = &objects.class(ClassId::new(1))[0];
        assert!((25..=37).contains(&snapped.area()), "area {}", snapped.area());
        assert_eq!(snapped.bbox().width, 6);
    }

    #[test]
    fn min_circle_encloses_square() {
        let objects = run_on_square(transform(TransformFunction::MinCircle, 1));
        let circle = &objects.class(ClassId::new(1))[0];
        assert!(circle.area() > 100);
        for (x, y) in square(7, 1, 20, 20, 10).pixels() {
            let corner = (x == 20 || x == 29) && (y == 20 || y == 29);
            if !corner {
                continue;
            }
            assert!(circle.contains_pixel(x, y), "corner ({x}, {y})");
        }
    }

    #[test]
    fn fitted_ellipse_follows_orientation() {
        let mut mask = GrayImage::new(64, 64);
        for y in 30..34 {
            for x in 10..50 {
                mask.put_pixel(x, y, crate::raster::FOREGROUND);
            }
        }
        let bar = Object::from_tile_mask(
            crate::object::ObjectId::new(1),
            ClassId::new(1),
            crate::image_plane::PlaneId::default(),
            &mask,
            1.0,
        )
        .unwrap();
        let (a, b, angle) = fit_ellipse(&bar);
        assert!(a > 4.0 * b);
        assert!(angle.abs() < 0.01);
    }

    #[test]
    fn circle_through_three_points() {
        let (c, r) = min_enclosing_circle(&[
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(5.0, 5.0),
            Point::new(5.0, 1.0),
        ]);
        assert!((c.x - 5.0).abs() < 1e-6);
        assert!(c.y.abs() < 1e-6);
        assert!((r - 5.0).abs() < 1e-6);
    }
}
