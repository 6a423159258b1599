//! Rasterisation helpers shared by object transforms and renderers.
//!
//! All masks are `GrayImage` with 255 for foreground and 0 for
//! background, matching what [`imageproc::contours::find_contours`]
//! expects.

use image::{GrayImage, ImageBuffer, Luma, Pixel};
use imageproc::drawing::draw_polygon_mut;

use crate::types::{BoundingBox, Dimensions, Point};

/// Foreground value in masks.
pub const FOREGROUND: Luma<u8> = Luma([255]);

/// Tight bounding box of the non-zero pixels of `mask`.
#[must_use]
pub fn mask_bounds(mask: &GrayImage) -> Option<BoundingBox> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, p) in mask.enumerate_pixels() {
        if p.0[0] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    bounds.map(|(x0, y0, x1, y1)| BoundingBox::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1))
}

/// Copy the `bbox` region out of a full-size mask.
#[must_use]
pub fn crop_mask(mask: &GrayImage, bbox: BoundingBox) -> GrayImage {
    GrayImage::from_fn(bbox.width, bbox.height, |x, y| {
        *mask.get_pixel(bbox.x + x, bbox.y + y)
    })
}

/// Fill a polygon given in tile coordinates, clipped to `dims`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn polygon_mask(points: &[Point], dims: Dimensions) -> GrayImage {
    let mut mask = GrayImage::new(dims.width, dims.height);
    let mut poly: Vec<imageproc::point::Point<i32>> = points
        .iter()
        .map(|p| imageproc::point::Point::new(p.x.round() as i32, p.y.round() as i32))
        .collect();
    poly.dedup();
    if poly.len() > 1 && poly.first() == poly.last() {
        poly.pop();
    }
    match poly.len() {
        0 => {}
        1 | 2 => {
            for p in &poly {
                put_clipped(&mut mask, i64::from(p.x), i64::from(p.y));
            }
        }
        _ => draw_polygon_mut(&mut mask, &poly, FOREGROUND),
    }
    mask
}

/// Fill a rotated ellipse, clipped to `dims`. `angle` is in radians.
#[must_use]
pub fn ellipse_mask(
    centre: Point,
    semi_major: f64,
    semi_minor: f64,
    angle: f64,
    dims: Dimensions,
) -> GrayImage {
    let (sin, cos) = angle.sin_cos();
    let a2 = (semi_major * semi_major).max(f64::EPSILON);
    let b2 = (semi_minor * semi_minor).max(f64::EPSILON);
    GrayImage::from_fn(dims.width, dims.height, |x, y| {
        let dx = f64::from(x) - centre.x;
        let dy = f64::from(y) - centre.y;
        let u = dx.mul_add(cos, dy * sin);
        let v = dy.mul_add(cos, -dx * sin);
        if (u * u) / a2 + (v * v) / b2 <= 1.0 {
            FOREGROUND
        } else {
            Luma([0])
        }
    })
}

/// Fill a circle, clipped to `dims`.
#[must_use]
pub fn circle_mask(centre: Point, radius: f64, dims: Dimensions) -> GrayImage {
    ellipse_mask(centre, radius, radius, 0.0, dims)
}

fn put_clipped(mask: &mut GrayImage, x: i64, y: i64) {
    if let (Ok(x), Ok(y)) = (u32::try_from(x), u32::try_from(y))
        && x < mask.width()
        && y < mask.height()
    {
        mask.put_pixel(x, y, FOREGROUND);
    }
}

/// Draw the closed outline through `points`, clipped to the canvas.
#[allow(clippy::cast_possible_truncation)]
pub fn draw_outline<P: Pixel>(canvas: &mut ImageBuffer<P, Vec<P::Subpixel>>, points: &[Point], value: P) {
    let n = points.len();
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        let steps = (a.x - b.x).abs().max((a.y - b.y).abs()).ceil().max(1.0) as u32;
        for s in 0..=steps {
            let t = f64::from(s) / f64::from(steps);
            let x = (b.x - a.x).mul_add(t, a.x).round() as i64;
            let y = (b.y - a.y).mul_add(t, a.y).round() as i64;
            if let (Ok(x), Ok(y)) = (u32::try_from(x), u32::try_from(y))
                && x < canvas.width()
                && y < canvas.height()
            {
                canvas.put_pixel(x, y, value);
            }
        }
    }
}

/// Draw the border of `bbox`, clipped to the canvas.
pub fn draw_rect<P: Pixel>(canvas: &mut ImageBuffer<P, Vec<P::Subpixel>>, bbox: BoundingBox, value: P) {
    let corners = [
        Point::new(f64::from(bbox.x), f64::from(bbox.y)),
        Point::new(f64::from(bbox.right() - 1), f64::from(bbox.y)),
        Point::new(f64::from(bbox.right() - 1), f64::from(bbox.bottom() - 1)),
        Point::new(f64::from(bbox.x), f64::from(bbox.bottom() - 1)),
    ];
    draw_outline(canvas, &corners, value);
}

/// An 8-connected foreground component: its bbox and bbox-local mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    /// Bounding box in the coordinates of the labelled mask.
    pub bbox: BoundingBox,
    /// Bbox-sized mask of the component.
    pub mask: GrayImage,
}

/// Split a mask into 8-connected components, in label order (row-major
/// order of each component's first pixel).
#[must_use]
pub fn components(mask: &GrayImage) -> Vec<Component> {
    let labels = imageproc::region_labelling::connected_components(
        mask,
        imageproc::region_labelling::Connectivity::Eight,
        Luma([0u8]),
    );
    let mut bounds: Vec<Option<(u32, u32, u32, u32)>> = Vec::new();
    for (x, y, p) in labels.enumerate_pixels() {
        let label = p.0[0] as usize;
        if label == 0 {
            continue;
        }
        if bounds.len() < label {
            bounds.resize(label, None);
        }
        let slot = &mut bounds[label - 1];
        *slot = Some(match *slot {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    bounds
        .into_iter()
        .enumerate()
        .filter_map(|(i, b)| {
            let (x0, y0, x1, y1) = b?;
            let bbox = BoundingBox::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1);
            let label = u32::try_from(i + 1).ok()?;
            let local = GrayImage::from_fn(bbox.width, bbox.height, |x, y| {
                if labels.get_pixel(bbox.x + x, bbox.y + y).0[0] == label {
                    FOREGROUND
                } else {
                    Luma([0])
                }
            });
            Some(Component { bbox, mask: local })
        })
        .collect()
}

/// Fill enclosed background regions of a mask.
///
/// Background pixels 4-connected to the mask border stay background;
/// every other background pixel becomes foreground.
#[must_use]
pub fn fill_mask_holes(mask: &GrayImage) -> GrayImage {
    let outside = border_background(mask);
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let i = (y as usize) * (mask.width() as usize) + x as usize;
        if mask.get_pixel(x, y).0[0] != 0 || !outside[i] {
            FOREGROUND
        } else {
            Luma([0])
        }
    })
}

/// Flags of background pixels reachable from the border through
/// 4-connected background.
pub(crate) fn border_background(mask: &GrayImage) -> Vec<bool> {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let mut seen = vec![false; w * h];
    let mut stack = Vec::new();
    let is_bg = |x: usize, y: usize| mask.as_raw()[y * w + x] == 0;
    for x in 0..w {
        for y in [0, h.saturating_sub(1)] {
            stack.push((x, y));
        }
    }
    for y in 0..h {
        for x in [0, w.saturating_sub(1)] {
            stack.push((x, y));
        }
    }
    while let Some((x, y)) = stack.pop() {
        let i = y * w + x;
        if seen[i] || !is_bg(x, y) {
            continue;
        }
        seen[i] = true;
        if x > 0 {
            stack.push((x - 1, y));
        }
        if x + 1 < w {
            stack.push((x + 1, y));
        }
        if y > 0 {
            stack.push((x, y - 1));
        }
        if y + 1 < h {
            stack.push((x, y + 1));
        }
    }
    seen
}

/// Foreground mask of the pixels of a label plane equal to `label`.
#[must_use]
pub fn label_mask(labels: &crate::image_plane::Gray16Image, label: u16) -> GrayImage {
    GrayImage::from_fn(labels.width(), labels.height(), |x, y| {
        if labels.get_pixel(x, y).0[0] == label {
            FOREGROUND
        } else {
            Luma([0])
        }
    })
}
