//! R-tree lookups over object bounding boxes and seed points.

use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};

use crate::object::Object;
use crate::types::{BoundingBox, Point};

type IndexedBox = GeomWithData<Rectangle<[f64; 2]>, usize>;
type IndexedPoint = GeomWithData<[f64; 2], usize>;

/// Inclusive pixel corners, so touching boxes do not intersect.
fn corners(bbox: BoundingBox) -> ([f64; 2], [f64; 2]) {
    let lower = [f64::from(bbox.x), f64::from(bbox.y)];
    let upper = [
        f64::from(bbox.right().saturating_sub(1).max(bbox.x)),
        f64::from(bbox.bottom().saturating_sub(1).max(bbox.y)),
    ];
    (lower, upper)
}

/// Objects indexed by bounding box. Items are positions in the slice the
/// index was built from.
#[derive(Debug)]
pub struct BoxIndex {
    tree: RTree<IndexedBox>,
}

impl BoxIndex {
    /// Index `objects` by position.
    #[must_use]
    pub fn new<'a>(objects: impl IntoIterator<Item = &'a Object>) -> Self {
        let boxes = objects
            .into_iter()
            .enumerate()
            .map(|(i, object)| {
                let (lower, upper) = corners(object.bbox());
                GeomWithData::new(Rectangle::from_corners(lower, upper), i)
            })
            .collect();
        Self {
            tree: RTree::bulk_load(boxes),
        }
    }

    /// Positions of objects whose bounding box overlaps `bbox`, in
    /// ascending order.
    #[must_use]
    pub fn candidates(&self, bbox: BoundingBox) -> Vec<usize> {
        let (lower, upper) = corners(bbox);
        let mut hits: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&AABB::from_corners(lower, upper))
            .map(|item| item.data)
            .collect();
        hits.sort_unstable();
        hits
    }
}

/// Points indexed for nearest-neighbour queries.
#[derive(Debug)]
pub struct PointIndex {
    tree: RTree<IndexedPoint>,
}

impl PointIndex {
    /// Index `points` by position.
    #[must_use]
    pub fn new(points: &[Point]) -> Self {
        let items = points
            .iter()
            .enumerate()
            .map(|(i, p)| GeomWithData::new([p.x, p.y], i))
            .collect();
        Self {
            tree: RTree::bulk_load(items),
        }
    }

    /// Position of the point nearest to `query`, with its squared
    /// distance. Ties go to the lower position.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn nearest(&self, query: Point) -> Option<(usize, f64)> {
        let at = [query.x, query.y];
        let mut best: Option<(usize, f64)> = None;
        for (item, d2) in self.tree.nearest_neighbor_iter_with_distance_2(&at) {
            match best {
                Some((_, best_d2)) if d2 > best_d2 => break,
                Some((i, best_d2)) if d2 == best_d2 && i < item.data => {}
                _ => best = Some((item.data, d2)),
            }
        }
        best
    }

    /// Returns `true` if no point is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}
