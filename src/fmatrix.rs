//! Force-balance system: build the coefficient matrix from edge geometry
//! at interior junctions and solve for big-edge tensions.

use std::collections::BTreeMap;

use log::{debug, warn};
use sprs::{CsMat, TriMat};

use crate::mesh::Frame;
use crate::solver;
use crate::timeseries::TimeSeries;
use crate::types::{EpiforceError, ForceKey, ForceMetadata, SolverOptions, Term};

// ─────────────────────────────────────────────────────────────
//  ForceMatrix
// ─────────────────────────────────────────────────────────────

/// The assembled force-balance system of one frame.
///
/// Rows: an x and a y equilibrium equation per interior junction, plus
/// one temporal coupling row per tracked big edge when a temporal term
/// is active.  Columns: one tension unknown per big edge.  Border
/// vertices contribute no equations (their equilibrium is not assumed),
/// which is what leaves the global scale free.
#[derive(Debug)]
pub struct ForceMatrix {
    pub when: usize,
    pub term: Term,
    matrix: CsMat<f64>,
    rhs: Vec<f64>,
    pub n_unknowns: usize,
}

impl ForceMatrix {
    /// Assemble the system for `frame`.
    ///
    /// `Term::Temporal` requires the time-series mapper and reads the
    /// previous usable frame's solved tensions as regularisation
    /// targets; edges that cannot be tracked across the hop are skipped.
    pub fn build(
        frame: &Frame,
        term: Term,
        metadata: &ForceMetadata,
        series: Option<&TimeSeries>,
        previous: Option<&Frame>,
    ) -> Result<Self, EpiforceError> {
        let n_unknowns = frame.big_edges.len();
        let junctions = frame.interior_junctions();
        let row_of: BTreeMap<usize, usize> = junctions
            .iter()
            .enumerate()
            .map(|(row, &vertex)| (vertex, row))
            .collect();

        let mut triplets: Vec<(usize, usize, f64)> = Vec::new();
        for (column, big_edge) in frame.big_edges.iter().enumerate() {
            let chain = &big_edge.vertices;
            let ends = [
                (chain[0], chain[1]),
                (chain[chain.len() - 1], chain[chain.len() - 2]),
            ];
            // A closed chain anchored at one junction is incident there
            // twice and contributes both end directions.
            for (end, adjacent) in ends {
                if let Some(&row) = row_of.get(&end) {
                    let (ux, uy) = frame.unit_between(end, adjacent)?;
                    triplets.push((2 * row, column, ux));
                    triplets.push((2 * row + 1, column, uy));
                }
            }
        }

        let mut rhs = vec![0.0; 2 * junctions.len()];
        if term == Term::Temporal {
            let series = series.ok_or(EpiforceError::NoTimeSeries)?;
            match previous {
                Some(prev) if !prev.forces.is_empty() => {
                    let weight = metadata.temporal_weight;
                    for (column, big_edge) in frame.big_edges.iter().enumerate() {
                        let (a, b) = big_edge.endpoints();
                        let (Ok(prev_a), Ok(prev_b)) = (
                            series.get_point_id_by_map(a, frame.index, prev.index),
                            series.get_point_id_by_map(b, frame.index, prev.index),
                        ) else {
                            continue;
                        };
                        let Some(matched) = prev.find_big_edge(prev_a, prev_b) else {
                            continue;
                        };
                        let Some(&target) = prev.forces.get(&ForceKey::Edge(matched)) else {
                            continue;
                        };
                        triplets.push((rhs.len(), column, weight));
                        rhs.push(weight * target);
                    }
                }
                _ => warn!(
                    "temporal term for frame {} has no solved previous frame; \
                     building the uncoupled system",
                    frame.index
                ),
            }
        }

        let mut tri = TriMat::new((rhs.len(), n_unknowns));
        for (row, column, value) in triplets {
            tri.add_triplet(row, column, value);
        }
        debug!(
            "force system for frame {}: {} rows, {} unknowns",
            frame.index,
            rhs.len(),
            n_unknowns
        );
        Ok(Self {
            when: frame.index,
            term,
            matrix: tri.to_csc(),
            rhs,
            n_unknowns,
        })
    }

    /// Solve for tensions.
    ///
    /// The default path fixes the free scale with an anchor row tying
    /// the mean tension to `scale_target` and solves the regularised
    /// least-squares system.  With `non_negative` set, an L-BFGS barrier
    /// solve refines from the per-unknown `seed` (neutral `scale_target`
    /// where absent).
    pub fn solve(
        &self,
        options: &SolverOptions,
        seed: Option<&BTreeMap<usize, f64>>,
    ) -> Result<BTreeMap<ForceKey, f64>, EpiforceError> {
        if self.n_unknowns == 0 {
            return Ok(BTreeMap::new());
        }
        let solution = if options.non_negative {
            let start: Vec<f64> = (0..self.n_unknowns)
                .map(|unknown| {
                    seed.and_then(|s| s.get(&unknown))
                        .copied()
                        .unwrap_or(options.scale_target)
                })
                .collect();
            solver::solve_non_negative(&self.matrix, &self.rhs, start, options)?
        } else {
            solver::anchored_lstsq(
                &self.matrix,
                &self.rhs,
                options.scale_target * self.n_unknowns as f64,
                options.tikhonov,
            )?
        };
        Ok(solution
            .into_iter()
            .enumerate()
            .map(|(index, tension)| (ForceKey::Edge(index), tension))
            .collect())
    }
}
