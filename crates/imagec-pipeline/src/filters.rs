//! Neighbourhood filters on 16-bit planes.
//!
//! `imageproc` covers 8-bit rank filters; microscopy planes are 16-bit,
//! so the min/max/median family lives here. Borders replicate the edge
//! pixel.

use image::Luma;
use serde::{Deserialize, Serialize};

use crate::image_plane::Gray16Image;

/// Shape of a structuring element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KernelShape {
    /// Full square.
    #[default]
    Rectangle,
    /// Plus sign.
    Cross,
    /// Inscribed disc.
    Ellipse,
}

/// Offsets of a `size x size` structuring element around its centre.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn kernel_offsets(shape: KernelShape, size: u32) -> Vec<(i32, i32)> {
    let r = (size / 2) as i32;
    let mut offsets = Vec::new();
    for dy in -r..=r {
        for dx in -r..=r {
            let keep = match shape {
                KernelShape::Rectangle => true,
                KernelShape::Cross => dx == 0 || dy == 0,
                KernelShape::Ellipse => {
                    let rr = f64::from(r) + 0.5;
                    f64::from(dx * dx + dy * dy) <= rr * rr
                }
            };
            if keep {
                offsets.push((dx, dy));
            }
        }
    }
    offsets
}

/// Edge-replicating pixel read.
#[must_use]
#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub fn sample(img: &Gray16Image, x: i64, y: i64) -> u16 {
    let cx = x.clamp(0, i64::from(img.width()) - 1) as u32;
    let cy = y.clamp(0, i64::from(img.height()) - 1) as u32;
    img.get_pixel(cx, cy).0[0]
}

/// Which order statistic a rank filter keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rank {
    /// Minimum (erosion).
    Min,
    /// Maximum (dilation).
    Max,
    /// Median.
    Median,
}

/// Apply a rank filter over the given offsets.
#[must_use]
pub fn rank_filter(img: &Gray16Image, offsets: &[(i32, i32)], rank: Rank) -> Gray16Image {
    let mut window = Vec::with_capacity(offsets.len());
    Gray16Image::from_fn(img.width(), img.height(), |x, y| {
        let values = offsets
            .iter()
            .map(|&(dx, dy)| sample(img, i64::from(x) + i64::from(dx), i64::from(y) + i64::from(dy)));
        let v = match rank {
            Rank::Min => values.min().unwrap_or(0),
            Rank::Max => values.max().unwrap_or(0),
            Rank::Median => {
                window.clear();
                window.extend(values);
                let mid = window.len() / 2;
                window.select_nth_unstable(mid);
                window.get(mid).copied().unwrap_or(0)
            }
        };
        Luma([v])
    })
}

/// Square median filter of the given odd size.
#[must_use]
pub fn median(img: &Gray16Image, size: u32) -> Gray16Image {
    rank_filter(img, &kernel_offsets(KernelShape::Rectangle, size), Rank::Median)
}

/// Gaussian sigma matching a kernel size the way OpenCV derives it.
#[must_use]
pub fn sigma_for_kernel(size: u32) -> f32 {
    #[allow(clippy::cast_precision_loss)]
    let k = size as f32;
    0.3f32.mul_add((k - 1.0).mul_add(0.5, -1.0), 0.8)
}

/// Gaussian blur on a 16-bit plane. Non-positive sigma is a no-op.
#[must_use]
pub fn gaussian(img: &Gray16Image, sigma: f32) -> Gray16Image {
    if sigma <= 0.0 {
        return img.clone();
    }
    imageproc::filter::gaussian_blur_f32(img, sigma)
}

/// Pixel-wise saturating `a - b`.
#[must_use]
pub fn subtract(a: &Gray16Image, b: &Gray16Image) -> Gray16Image {
    Gray16Image::from_fn(a.width(), a.height(), |x, y| {
        Luma([a.get_pixel(x, y).0[0].saturating_sub(b.get_pixel(x, y).0[0])])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_shapes() {
        assert_eq!(kernel_offsets(KernelShape::Rectangle, 3).len(), 9);
        assert_eq!(kernel_offsets(KernelShape::Cross, 3).len(), 5);
        assert_eq!(kernel_offsets(KernelShape::Ellipse, 5).len(), 21);
    }

    #[test]
    fn median_removes_salt() {
        let mut img = Gray16Image::from_pixel(5, 5, Luma([100]));
        img.put_pixel(2, 2, Luma([60000]));
        let out = median(&img, 3);
        assert_eq!(out.get_pixel(2, 2).0[0], 100);
    }

    #[test]
    fn min_and_max_grow_and_shrink() {
        let mut img = Gray16Image::new(7, 7);
        img.put_pixel(3, 3, Luma([500]));
        let offsets = kernel_offsets(KernelShape::Rectangle, 3);
        let grown = rank_filter(&img, &offsets, Rank::Max);
        assert_eq!(grown.pixels().filter(|p| p.0[0] == 500).count(), 9);
        let shrunk = rank_filter(&grown, &offsets, Rank::Min);
        assert_eq!(shrunk.pixels().filter(|p| p.0[0] == 500).count(), 1);
    }

    #[test]
    fn sigma_for_three_tap_kernel() {
        assert!((sigma_for_kernel(3) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn gaussian_keeps_flat_image() {
        let img = Gray16Image::from_pixel(6, 6, Luma([1234]));
        let out = gaussian(&img, 1.2);
        assert!(out.pixels().all(|p| p.0[0].abs_diff(1234) <= 1));
    }
}
