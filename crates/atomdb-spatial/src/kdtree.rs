//! Static k-d tree over low-dimensional spatial keys.
//!
//! Built once per partition when an index snapshot is assembled, then only
//! read. Points are split at the median of the widest axis until a leaf
//! holds at most `leaf_size` points; every node keeps its bounding box so a
//! ball query can skip whole subtrees.

use atomdb_core::budget::{Budget, Interrupt};
use atomdb_core::types::AtomId;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl BoundingBox {
    /// Smallest box holding every point. `None` for an empty set.
    pub fn enclosing<'a>(mut points: impl Iterator<Item = &'a [f64]>) -> Option<Self> {
        let first = points.next()?;
        let mut bbox = BoundingBox {
            min: first.to_vec(),
            max: first.to_vec(),
        };
        for p in points {
            bbox.extend(p);
        }
        Some(bbox)
    }

    pub fn extend(&mut self, point: &[f64]) {
        for ((lo, hi), x) in self.min.iter_mut().zip(self.max.iter_mut()).zip(point) {
            *lo = lo.min(*x);
            *hi = hi.max(*x);
        }
    }

    /// Euclidean distance from `point` to the nearest point of the box.
    pub fn min_distance(&self, point: &[f64]) -> f64 {
        self.min
            .iter()
            .zip(&self.max)
            .zip(point)
            .map(|((lo, hi), x)| {
                let d = if x < lo {
                    lo - x
                } else if x > hi {
                    x - hi
                } else {
                    0.0
                };
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    fn widest_axis(&self) -> usize {
        let mut best = 0;
        let mut width = f64::NEG_INFINITY;
        for (axis, (lo, hi)) in self.min.iter().zip(&self.max).enumerate() {
            if hi - lo > width {
                width = hi - lo;
                best = axis;
            }
        }
        best
    }
}

/// A point found by a range query, with its distance from the centre.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub atom_id: AtomId,
    pub distance: f64,
}

#[derive(Debug)]
struct Node {
    bbox: BoundingBox,
    kind: NodeKind,
}

#[derive(Debug)]
enum NodeKind {
    Leaf { start: usize, end: usize },
    Split { left: usize, right: usize },
}

#[derive(Debug)]
pub struct KdTree {
    dims: usize,
    ids: Vec<AtomId>,
    points: Vec<Vec<f64>>,
    nodes: Vec<Node>,
}

impl KdTree {
    /// Build over `(id, coordinates)` pairs. Every point must have `dims`
    /// coordinates.
    pub fn build(dims: usize, entries: Vec<(AtomId, Vec<f64>)>, leaf_size: usize) -> Self {
        let (ids, points): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        let mut tree = KdTree {
            dims,
            ids,
            points,
            nodes: Vec::new(),
        };
        let mut order: Vec<usize> = (0..tree.points.len()).collect();
        if !order.is_empty() {
            tree.build_node(&mut order, 0, leaf_size.max(1));
            tree.apply_order(&order);
        }
        tree
    }

    fn build_node(&mut self, order: &mut [usize], offset: usize, leaf_size: usize) -> usize {
        let bbox = BoundingBox::enclosing(order.iter().map(|&i| self.points[i].as_slice()))
            .unwrap_or(BoundingBox {
                min: vec![0.0; self.dims],
                max: vec![0.0; self.dims],
            });
        let index = self.nodes.len();
        self.nodes.push(Node {
            bbox: bbox.clone(),
            kind: NodeKind::Leaf {
                start: offset,
                end: offset + order.len(),
            },
        });
        if order.len() <= leaf_size {
            return index;
        }

        let axis = bbox.widest_axis();
        let mid = order.len() / 2;
        let points = &self.points;
        order.select_nth_unstable_by(mid, |&a, &b| {
            points[a][axis]
                .total_cmp(&points[b][axis])
                .then_with(|| a.cmp(&b))
        });
        let (lo, hi) = order.split_at_mut(mid);
        let left = self.build_node(lo, offset, leaf_size);
        let right = self.build_node(hi, offset + mid, leaf_size);
        self.nodes[index].kind = NodeKind::Split { left, right };
        index
    }

    /// Lay points out in leaf order so each leaf is a contiguous range.
    fn apply_order(&mut self, order: &[usize]) {
        self.ids = order.iter().map(|&i| self.ids[i]).collect();
        self.points = order.iter().map(|&i| std::mem::take(&mut self.points[i])).collect();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn bounds(&self) -> Option<&BoundingBox> {
        self.nodes.first().map(|n| &n.bbox)
    }

    /// Append every point within `radius` of `center` to `out`.
    ///
    /// The budget is polled once per visited leaf; on interruption the
    /// points found so far stay in `out`.
    pub fn within(
        &self,
        center: &[f64],
        radius: f64,
        budget: &Budget,
        out: &mut Vec<Candidate>,
    ) -> Option<Interrupt> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            if node.bbox.min_distance(center) > radius {
                continue;
            }
            match node.kind {
                NodeKind::Split { left, right } => {
                    stack.push(right);
                    stack.push(left);
                }
                NodeKind::Leaf { start, end } => {
                    if let Some(interrupt) = budget.check() {
                        return Some(interrupt);
                    }
                    for i in start..end {
                        let distance = euclidean(center, &self.points[i]);
                        if distance <= radius {
                            out.push(Candidate {
                                atom_id: self.ids[i],
                                distance,
                            });
                        }
                    }
                }
            }
        }
        None
    }

    /// Iterate over every stored point in layout order.
    pub fn iter(&self) -> impl Iterator<Item = (AtomId, &[f64])> {
        self.ids.iter().copied().zip(self.points.iter().map(Vec::as_slice))
    }
}

pub fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
