//! Zhang-Suen thinning, applied to each label of a mask separately.

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::commands::binary_labels;
use crate::context::ProcessContext;
use crate::image_plane::{Gray16Image, ImagePlane};
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// Skeletonize options (none).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkeletonizeSettings {}

impl StepSettings for SkeletonizeSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::BINARY)
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(Skeletonize(self.clone())))
    }
}

settings_command!(Skeletonize, SkeletonizeSettings, "skeletonize");

impl Skeletonize {
    fn run(
        &self,
        _ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let labels = binary_labels(image, "skeletonize")?;
        *image = image.derive_gray16(skeletonize(&labels))?;
        Ok(())
    }
}

/// Thin every label of `labels` to a one-pixel-wide skeleton.
#[must_use]
pub fn skeletonize(labels: &Gray16Image) -> Gray16Image {
    let (w, h) = (labels.width() as usize, labels.height() as usize);
    let mut distinct: Vec<u16> = labels.as_raw().iter().copied().filter(|v| *v != 0).collect();
    distinct.sort_unstable();
    distinct.dedup();

    let mut out = vec![0u16; w * h];
    for label in distinct {
        let mut grid: Vec<bool> = labels.as_raw().iter().map(|v| *v == label).collect();
        thin(&mut grid, w, h);
        for (dst, keep) in out.iter_mut().zip(grid) {
            if keep {
                *dst = label;
            }
        }
    }
    Gray16Image::from_raw(labels.width(), labels.height(), out)
        .unwrap_or_else(|| labels.clone())
}

fn at(grid: &[bool], w: usize, h: usize, x: isize, y: isize) -> bool {
    match (usize::try_from(x), usize::try_from(y)) {
        (Ok(x), Ok(y)) if x < w && y < h => grid[y * w + x],
        _ => false,
    }
}

fn thin(grid: &mut [bool], w: usize, h: usize) {
    let px = |g: &[bool], x: isize, y: isize| at(g, w, h, x, y);
    let mut remove = Vec::new();
    loop {
        let mut changed = false;
        for pass in 0..2 {
            remove.clear();
            for y in 0..h {
                for x in 0..w {
                    if !grid[y * w + x] {
                        continue;
                    }
                    #[allow(clippy::cast_possible_wrap)]
                    let (xi, yi) = (x as isize, y as isize);
                    // P2..P9 clockwise from north.
                    let n = [
                        px(grid, xi, yi - 1),
                        px(grid, xi + 1, yi - 1),
                        px(grid, xi + 1, yi),
                        px(grid, xi + 1, yi + 1),
                        px(grid, xi, yi + 1),
                        px(grid, xi - 1, yi + 1),
                        px(grid, xi - 1, yi),
                        px(grid, xi - 1, yi - 1),
                    ];
                    let b = n.iter().filter(|v| **v).count();
                    let a = (0..8).filter(|&i| !n[i] && n[(i + 1) % 8]).count();
                    let (p2, p4, p6, p8) = (n[0], n[2], n[4], n[6]);
                    let cond = if pass == 0 {
                        !(p2 && p4 && p6) && !(p4 && p6 && p8)
                    } else {
                        !(p2 && p4 && p8) && !(p2 && p6 && p8)
                    };
                    if (2..=6).contains(&b) && a == 1 && cond {
                        remove.push(y * w + x);
                    }
                }
            }
            for &i in &remove {
                grid[i] = false;
            }
            changed |= !remove.is_empty();
        }
        if !changed {
            break;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::commands::tests::{labels, run};

    #[test]
    fn thick_bar_becomes_a_line() {
        let mut image = labels(20, 9, |x, y| {
            if (2..18).contains(&x) && (2..7).contains(&y) { 3 } else { 0 }
        });
        run(&Skeletonize(SkeletonizeSettings {}), &mut image, &mut ObjectList::new()).unwrap();
        let pixels = image.to_gray16();
        for x in 5..15 {
            let column = (0..9).filter(|&y| pixels.get_pixel(x, y).0[0] == 3).count();
            assert_eq!(column, 1, "column {x}");
        }
    }

    #[test]
    fn labels_are_thinned_independently() {
        let mut image = labels(20, 20, |x, y| {
            if (1..8).contains(&x) && (1..19).contains(&y) {
                1
            } else if (12..19).contains(&x) && (1..19).contains(&y) {
                2
            } else {
                0
            }
        });
        run(&Skeletonize(SkeletonizeSettings {}), &mut image, &mut ObjectList::new()).unwrap();
        let pixels = image.to_gray16();
        assert!(pixels.pixels().any(|p| p.0[0] == 1));
        assert!(pixels.pixels().any(|p| p.0[0] == 2));
        assert!(pixels.pixels().filter(|p| p.0[0] != 0).count() < 60);
    }
}
