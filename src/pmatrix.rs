//! Pressure-difference system: one Young-Laplace relation per interior
//! big edge, built from already-solved tensions and edge curvature.

use std::collections::BTreeMap;

use log::debug;
use sprs::{CsMat, TriMat};

use crate::mesh::Frame;
use crate::solver;
use crate::types::{EpiforceError, ForceKey, PressureAnchor, PressureOptions};

// ─────────────────────────────────────────────────────────────
//  PressureMatrix
// ─────────────────────────────────────────────────────────────

/// The assembled pressure system of one frame.
///
/// Rows: `p_left − p_right = λ·κ` for every big edge flanked by exactly
/// two cells.  Columns follow `mapping_order` (ascending cell ids).  The
/// system is under-determined by the additive pressure constant; the
/// solve fixes the gauge via [`PressureAnchor`].
#[derive(Debug)]
pub struct PressureMatrix {
    pub when: usize,
    matrix: CsMat<f64>,
    rhs: Vec<f64>,
    pub mapping_order: Vec<usize>,
}

impl PressureMatrix {
    /// Assemble from a frame whose forces have already been solved.
    pub fn build(frame: &Frame) -> Result<Self, EpiforceError> {
        if frame.forces.is_empty() {
            return Err(EpiforceError::ForcesNotSolved { when: frame.index });
        }
        let mapping_order: Vec<usize> = frame.cells.keys().copied().collect();
        let column_of: BTreeMap<usize, usize> = mapping_order
            .iter()
            .enumerate()
            .map(|(column, &cell)| (cell, column))
            .collect();

        let mut triplets: Vec<(usize, usize, f64)> = Vec::new();
        let mut rhs = Vec::new();
        for index in 0..frame.big_edges.len() {
            let flanking = frame.big_edge_cells(index);
            if flanking.len() != 2 {
                continue;
            }
            let Some(&tension) = frame.forces.get(&ForceKey::Edge(index)) else {
                continue;
            };
            let curvature = frame.big_edge_curvature(index)?;
            let (left, right) = orient_flanking(frame, index, flanking[0], flanking[1])?;
            let row = rhs.len();
            triplets.push((row, column_of[&left], 1.0));
            triplets.push((row, column_of[&right], -1.0));
            rhs.push(tension * curvature);
        }
        let mut tri = TriMat::new((rhs.len(), mapping_order.len()));
        for (row, column, value) in triplets {
            tri.add_triplet(row, column, value);
        }
        debug!(
            "pressure system for frame {}: {} rows, {} cells",
            frame.index,
            rhs.len(),
            mapping_order.len()
        );
        Ok(Self {
            when: frame.index,
            matrix: tri.to_csc(),
            rhs,
            mapping_order,
        })
    }

    /// Least-squares solve for relative pressures, keyed by cell id.
    pub fn solve(
        &self,
        options: &PressureOptions,
    ) -> Result<BTreeMap<usize, f64>, EpiforceError> {
        if self.mapping_order.is_empty() {
            return Ok(BTreeMap::new());
        }
        if self.mapping_order.len() == 1 {
            // A single cell carries no pressure difference; the gauge
            // fixes it outright.
            return Ok(BTreeMap::from([(self.mapping_order[0], 0.0)]));
        }
        let solution = match options.anchor {
            PressureAnchor::MeanZero => {
                solver::anchored_lstsq(&self.matrix, &self.rhs, 0.0, options.tikhonov)?
            }
            PressureAnchor::Cell(cell) => {
                let pinned = self
                    .mapping_order
                    .iter()
                    .position(|&c| c == cell)
                    .ok_or(EpiforceError::CellNotFound { cell })?;
                solver::pinned_lstsq(&self.matrix, &self.rhs, pinned, options.tikhonov)?
            }
        };
        Ok(self.mapping_order.iter().copied().zip(solution).collect())
    }
}

/// Order two flanking cells as (left, right) of the chain direction,
/// sampled at the middle member edge.  Positive curvature then means the
/// left cell sits on the concave side and carries the higher pressure.
fn orient_flanking(
    frame: &Frame,
    index: usize,
    c1: usize,
    c2: usize,
) -> Result<(usize, usize), EpiforceError> {
    let big_edge = &frame.big_edges[index];
    let mid = big_edge.edges.len() / 2;
    let (xa, ya) = frame.position(big_edge.vertices[mid])?;
    let (xb, yb) = frame.position(big_edge.vertices[mid + 1])?;
    let midpoint = ((xa + xb) / 2.0, (ya + yb) / 2.0);
    let normal = (ya - yb, xb - xa);

    let side = |cell: usize| -> Result<f64, EpiforceError> {
        let (cx, cy) = frame.cell_centroid(cell)?;
        Ok((cx - midpoint.0) * normal.0 + (cy - midpoint.1) * normal.1)
    };
    if side(c1)? >= side(c2)? {
        Ok((c1, c2))
    } else {
        Ok((c2, c1))
    }
}
