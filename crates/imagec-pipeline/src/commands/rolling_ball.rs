//! Rolling-ball background subtraction.
//!
//! The background is the grayscale opening of the plane with a non-flat
//! structuring element shaped like a ball (or paraboloid) of the given
//! radius. For speed the opening runs on a min-shrunk copy of the plane
//! and the background is interpolated back to full size. The result is
//! `f - min(background, f)`.

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::{Gray16Image, ImagePlane, saturate_u16};
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// Shape of the rolling element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BallType {
    /// Spherical cap.
    #[default]
    Ball,
    /// Paraboloid of the same curvature at the apex.
    Paraboloid,
}

/// Rolling-ball step options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollingBallSettings {
    /// Element shape.
    pub ball_type: BallType,
    /// Radius in pixels.
    pub radius: f64,
}

impl Default for RollingBallSettings {
    fn default() -> Self {
        Self {
            ball_type: BallType::Ball,
            radius: 50.0,
        }
    }
}

impl StepSettings for RollingBallSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::IMAGE)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(
            self.radius > 0.0,
            format!("radius must be positive, got {}", self.radius),
        );
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(RollingBall(self.clone())))
    }
}

settings_command!(RollingBall, RollingBallSettings, "rollingBall");

impl RollingBall {
    fn run(
        &self,
        _ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let pixels = image.to_gray16();
        let background = estimate_background(&pixels, self.0.radius, self.0.ball_type);
        let out = Gray16Image::from_fn(pixels.width(), pixels.height(), |x, y| {
            let v = pixels.get_pixel(x, y).0[0];
            image::Luma([v - background.get_pixel(x, y).0[0].min(v)])
        });
        *image = image.derive_gray16(out)?;
        Ok(())
    }
}

/// Shrink factor used for a given radius.
const fn shrink_factor(radius: f64) -> u32 {
    if radius <= 10.0 {
        1
    } else if radius <= 30.0 {
        2
    } else if radius <= 100.0 {
        4
    } else {
        8
    }
}

/// Background estimate of `pixels`, same size as the input.
#[must_use]
pub fn estimate_background(pixels: &Gray16Image, radius: f64, ball: BallType) -> Gray16Image {
    let shrink = shrink_factor(radius);
    let small = shrink_min(pixels, shrink);
    let element = Element::new(radius / f64::from(shrink), ball);
    let opened = element.dilate(&element.erode(&small));
    expand(&opened, shrink, pixels.width(), pixels.height())
}

/// Width-major f64 grid.
struct Grid {
    width: usize,
    height: usize,
    data: Vec<f64>,
}

impl Grid {
    fn get(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }
}

fn shrink_min(pixels: &Gray16Image, shrink: u32) -> Grid {
    let width = pixels.width().div_ceil(shrink) as usize;
    let height = pixels.height().div_ceil(shrink) as usize;
    let mut data = vec![f64::INFINITY; width * height];
    for (x, y, p) in pixels.enumerate_pixels() {
        let i = (y / shrink) as usize * width + (x / shrink) as usize;
        data[i] = data[i].min(f64::from(p.0[0]));
    }
    Grid {
        width,
        height,
        data,
    }
}

/// Non-flat structuring element: offsets with their height penalty.
struct Element {
    taps: Vec<(isize, isize, f64)>,
}

impl Element {
    #[allow(clippy::cast_possible_truncation)]
    fn new(radius: f64, ball: BallType) -> Self {
        let reach = radius.floor().max(0.0) as isize;
        let mut taps = Vec::new();
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                #[allow(clippy::cast_precision_loss)]
                let d2 = (dx * dx + dy * dy) as f64;
                if d2 > radius * radius {
                    continue;
                }
                let penalty = match ball {
                    BallType::Ball => radius - (radius * radius - d2).sqrt(),
                    BallType::Paraboloid => d2 / (2.0 * radius),
                };
                taps.push((dx, dy, penalty));
            }
        }
        Self { taps }
    }

    fn erode(&self, grid: &Grid) -> Grid {
        self.apply(grid, f64::INFINITY, |acc, v, p| acc.min(v + p))
    }

    fn dilate(&self, grid: &Grid) -> Grid {
        self.apply(grid, f64::NEG_INFINITY, |acc, v, p| acc.max(v - p))
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn apply(&self, grid: &Grid, init: f64, fold: impl Fn(f64, f64, f64) -> f64) -> Grid {
        let (w, h) = (grid.width as isize, grid.height as isize);
        let mut data = Vec::with_capacity(grid.data.len());
        for y in 0..h {
            for x in 0..w {
                let mut acc = init;
                for &(dx, dy, penalty) in &self.taps {
                    let (sx, sy) = (x + dx, y + dy);
                    if sx < 0 || sy < 0 || sx >= w || sy >= h {
                        continue;
                    }
                    acc = fold(acc, grid.get(sx as usize, sy as usize), penalty);
                }
                data.push(acc);
            }
        }
        Grid {
            width: grid.width,
            height: grid.height,
            data,
        }
    }
}

/// Bilinear expansion of the shrunk grid back to full size.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn expand(grid: &Grid, shrink: u32, width: u32, height: u32) -> Gray16Image {
    let s = f64::from(shrink);
    let max_x = (grid.width - 1) as f64;
    let max_y = (grid.height - 1) as f64;
    Gray16Image::from_fn(width, height, |x, y| {
        let gx = ((f64::from(x) + 0.5) / s - 0.5).clamp(0.0, max_x);
        let gy = ((f64::from(y) + 0.5) / s - 0.5).clamp(0.0, max_y);
        let (x0, y0) = (gx.floor() as usize, gy.floor() as usize);
        let (x1, y1) = ((x0 + 1).min(grid.width - 1), (y0 + 1).min(grid.height - 1));
        let (fx, fy) = (gx - x0 as f64, gy - y0 as f64);
        let top = grid.get(x0, y0) * (1.0 - fx) + grid.get(x1, y0) * fx;
        let bottom = grid.get(x0, y1) * (1.0 - fx) + grid.get(x1, y1) * fx;
        image::Luma([saturate_u16(top * (1.0 - fy) + bottom * fy)])
    })
}
