//! Split touching objects along distance-transform valleys.
//!
//! Every label is processed on its own: a chamfer distance map to the
//! nearest pixel of another label, one seed per maximum that stands out
//! by more than `tolerance`, then a priority flood from the seeds. Pixels
//! where two basins meet become background.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use image::Luma;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::commands::binary_labels;
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::{Gray16Image, ImagePlane};
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// Chamfer weights for axial and diagonal steps; one pixel is 3 units.
const AXIAL: u32 = 3;
const DIAGONAL: u32 = 4;

const NEIGHBOURS: [(isize, isize, u32); 8] = [
    (-1, -1, DIAGONAL),
    (0, -1, AXIAL),
    (1, -1, DIAGONAL),
    (-1, 0, AXIAL),
    (1, 0, AXIAL),
    (-1, 1, DIAGONAL),
    (0, 1, AXIAL),
    (1, 1, DIAGONAL),
];

/// Watershed options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatershedSettings {
    /// Minimum height, in pixels, by which a maximum must rise above the
    /// saddle to its neighbour to seed its own basin.
    pub tolerance: f64,
}

impl Default for WatershedSettings {
    fn default() -> Self {
        Self { tolerance: 0.5 }
    }
}

impl StepSettings for WatershedSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::BINARY)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(
            self.tolerance >= 0.0,
            format!("tolerance must not be negative, got {}", self.tolerance),
        );
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(Watershed(self.clone())))
    }
}

settings_command!(Watershed, WatershedSettings, "watershed");

impl Watershed {
    fn run(
        &self,
        _ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let labels = binary_labels(image, "watershed")?;
        *image = image.derive_gray16(split(&labels, self.0.tolerance))?;
        Ok(())
    }
}

struct Grid<'a> {
    labels: &'a [u16],
    w: usize,
    h: usize,
}

impl Grid<'_> {
    fn neighbour(&self, i: usize, dx: isize, dy: isize) -> Option<usize> {
        let x = (i % self.w).checked_add_signed(dx)?;
        let y = (i / self.w).checked_add_signed(dy)?;
        (x < self.w && y < self.h).then_some(y * self.w + x)
    }

    fn same(&self, i: usize, j: usize) -> bool {
        self.labels[i] == self.labels[j]
    }
}

/// Watershed-split every label of `labels`.
#[must_use]
pub fn split(labels: &Gray16Image, tolerance: f64) -> Gray16Image {
    let grid = Grid {
        labels: labels.as_raw(),
        w: labels.width() as usize,
        h: labels.height() as usize,
    };
    let dist = distance_map(&grid);
    let mut basin = seeds(&grid, &dist, tolerance);
    flood(&grid, &dist, &mut basin);

    let mut out = labels.clone();
    for (i, &b) in basin.iter().enumerate() {
        if b == 0 {
            continue;
        }
        let boundary = [(1, 0), (-1, 1), (0, 1), (1, 1)].iter().any(|&(dx, dy)| {
            grid.neighbour(i, dx, dy)
                .is_some_and(|j| grid.same(i, j) && basin[j] != 0 && basin[j] != b)
        });
        if boundary {
            let (x, y) = (i % grid.w, i / grid.w);
            #[allow(clippy::cast_possible_truncation)]
            out.put_pixel(x as u32, y as u32, Luma([0]));
        }
    }
    out
}

/// Two-pass chamfer distance to the nearest pixel of a different label.
/// The plane border does not count as background.
fn distance_map(grid: &Grid<'_>) -> Vec<u32> {
    let n = grid.labels.len();
    let mut dist: Vec<u32> = grid
        .labels
        .iter()
        .map(|&l| if l == 0 { 0 } else { u32::MAX })
        .collect();
    let relax = |dist: &mut [u32], i: usize, offsets: &[(isize, isize, u32)]| {
        if dist[i] == 0 {
            return;
        }
        for &(dx, dy, weight) in offsets {
            if let Some(j) = grid.neighbour(i, dx, dy) {
                let base = if grid.same(i, j) { dist[j] } else { 0 };
                dist[i] = dist[i].min(base.saturating_add(weight));
            }
        }
    };
    for i in 0..n {
        relax(&mut dist, i, &NEIGHBOURS[..4]);
    }
    for i in (0..n).rev() {
        relax(&mut dist, i, &NEIGHBOURS[4..]);
    }
    // A label covering the whole plane never meets background.
    for d in &mut dist {
        if *d == u32::MAX {
            *d = 0;
        }
    }
    dist
}

/// Basin seeds: plateaus around maxima that rise more than `tolerance`
/// above every path to a higher maximum.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn seeds(grid: &Grid<'_>, dist: &[u32], tolerance: f64) -> Vec<u32> {
    let tol = (tolerance * f64::from(AXIAL)).round() as u32;
    let mut candidates: Vec<usize> = (0..dist.len())
        .filter(|&i| {
            dist[i] > 0
                && NEIGHBOURS.iter().all(|&(dx, dy, _)| {
                    grid.neighbour(i, dx, dy)
                        .is_none_or(|j| !grid.same(i, j) || dist[j] <= dist[i])
                })
        })
        .collect();
    candidates.sort_by_key(|&i| (Reverse(dist[i]), i));

    let mut basin = vec![0u32; dist.len()];
    let mut next = 1u32;
    let mut seen = vec![false; dist.len()];
    let mut region = Vec::new();
    let mut queue = VecDeque::new();
    for start in candidates {
        if basin[start] != 0 {
            continue;
        }
        let floor = dist[start].saturating_sub(tol);
        region.clear();
        queue.clear();
        queue.push_back(start);
        seen[start] = true;
        let mut dominated = false;
        while let Some(i) = queue.pop_front() {
            region.push(i);
            for &(dx, dy, _) in &NEIGHBOURS {
                let Some(j) = grid.neighbour(i, dx, dy) else {
                    continue;
                };
                if seen[j] || !grid.same(i, j) || dist[j] < floor.max(1) {
                    continue;
                }
                if basin[j] != 0 || dist[j] > dist[start] {
                    dominated = true;
                    continue;
                }
                seen[j] = true;
                queue.push_back(j);
            }
        }
        for &i in &region {
            seen[i] = false;
            if !dominated {
                basin[i] = next;
            }
        }
        if !dominated {
            next += 1;
        }
    }
    basin
}

/// Grow basins into the rest of their label, highest distance first.
fn flood(grid: &Grid<'_>, dist: &[u32], basin: &mut [u32]) {
    let mut heap = BinaryHeap::new();
    let mut order = 0usize;
    for (i, &b) in basin.iter().enumerate() {
        if b != 0 {
            heap.push((dist[i], Reverse(order), i));
            order += 1;
        }
    }
    while let Some((_, _, i)) = heap.pop() {
        for &(dx, dy, _) in &NEIGHBOURS {
            let Some(j) = grid.neighbour(i, dx, dy) else {
                continue;
            };
            if basin[j] == 0 && grid.labels[j] != 0 && grid.same(i, j) {
                basin[j] = basin[i];
                heap.push((dist[j], Reverse(order), j));
                order += 1;
            }
        }
    }
}
