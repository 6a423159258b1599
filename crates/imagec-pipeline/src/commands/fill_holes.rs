//! Fill enclosed background regions of a label mask.
//!
//! A hole is a 4-connected background region that does not reach the
//! plane border. It takes the largest label found next to it.

use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::commands::binary_labels;
use crate::context::ProcessContext;
use crate::image_plane::{Gray16Image, ImagePlane};
use crate::object_list::ObjectList;
use crate::raster::{FOREGROUND, border_background};
use crate::types::PipelineError;

/// Fill-holes options (none).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FillHolesSettings {}

impl StepSettings for FillHolesSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::BINARY)
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(FillHoles(self.clone())))
    }
}

settings_command!(FillHoles, FillHolesSettings, "fillHoles");

impl FillHoles {
    fn run(
        &self,
        _ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let labels = binary_labels(image, "fill holes")?;
        *image = image.derive_gray16(fill_label_holes(&labels))?;
        Ok(())
    }
}

/// Fill every hole of `labels` with its largest neighbouring label.
#[must_use]
pub fn fill_label_holes(labels: &Gray16Image) -> Gray16Image {
    let (w, h) = (labels.width() as usize, labels.height() as usize);
    let foreground = GrayImage::from_fn(labels.width(), labels.height(), |x, y| {
        if labels.get_pixel(x, y).0[0] == 0 {
            Luma([0])
        } else {
            FOREGROUND
        }
    });
    let outside = border_background(&foreground);
    let is_hole = |x: usize, y: usize| {
        labels.as_raw()[y * w + x] == 0 && !outside[y * w + x]
    };

    let mut out = labels.clone();
    let mut visited = vec![false; w * h];
    let mut region = Vec::new();
    let mut stack = Vec::new();
    for start in 0..w * h {
        let (sx, sy) = (start % w, start / w);
        if visited[start] || !is_hole(sx, sy) {
            continue;
        }
        region.clear();
        stack.push((sx, sy));
        visited[start] = true;
        let mut fill = 0u16;
        while let Some((x, y)) = stack.pop() {
            region.push((x, y));
            let neighbours = [
                (x.wrapping_sub(1), y),
                (x + 1, y),
                (x, y.wrapping_sub(1)),
                (x, y + 1),
            ];
            for (nx, ny) in neighbours {
                if nx >= w || ny >= h {
                    continue;
                }
                let i = ny * w + nx;
                let label = labels.as_raw()[i];
                if label != 0 {
                    fill = fill.max(label);
                } else if !visited[i] && is_hole(nx, ny) {
                    visited[i] = true;
                    stack.push((nx, ny));
                }
            }
        }
        for &(x, y) in &region {
            #[allow(clippy::cast_possible_truncation)]
            out.put_pixel(x as u32, y as u32, Luma([fill]));
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::commands::tests::{gray, labels, run};

    #[test]
    fn ring_is_filled_with_its_label() {
        let mut image = labels(9, 9, |x, y| {
            let ring = (2..7).contains(&x) && (2..7).contains(&y);
            let hole = (3..6).contains(&x) && (3..6).contains(&y);
            if ring && !hole { 4 } else { 0 }
        });
        run(&FillHoles(FillHolesSettings {}), &mut image, &mut ObjectList::new()).unwrap();
        assert_eq!(image.value_u16(4, 4), 4);
        assert_eq!(image.value_u16(0, 0), 0);
    }

    #[test]
    fn hole_between_two_labels_takes_the_larger() {
        let mut image = labels(7, 5, |x, y| {
            if (1..6).contains(&x) && (1..4).contains(&y) && (x, y) != (3, 2) {
                if x < 3 { 2 } else { 5 }
            } else {
                0
            }
        });
        run(&FillHoles(FillHolesSettings {}), &mut image, &mut ObjectList::new()).unwrap();
        assert_eq!(image.value_u16(3, 2), 5);
    }

    #[test]
    fn gray_input_is_rejected() {
        let mut image = gray(4, 4, |_, _| 1);
        let err = run(&FillHoles(FillHolesSettings {}), &mut image, &mut ObjectList::new());
        assert!(matches!(err, Err(PipelineError::InvalidConfig(_))));
    }
}
