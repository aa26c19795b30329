//! Orchestrator: owns the frame sequence, the per-frame system and
//! result slots, and sequences build → solve stress → solve pressure.

use std::collections::{BTreeMap, BTreeSet};

use log::info;

use crate::fmatrix::ForceMatrix;
use crate::mesh::Frame;
use crate::pmatrix::PressureMatrix;
use crate::timeseries::TimeSeries;
use crate::types::{
    EpiforceError, ForceKey, ForceMetadata, ForceRecord, Guesses, PressureOptions,
    SolverOptions, Term, TimeSeriesOptions,
};

// ─────────────────────────────────────────────────────────────
//  ForceInference
// ─────────────────────────────────────────────────────────────

/// The inference pipeline over one or many frames.
///
/// Each frame has its own matrix and result slot, all empty at
/// construction.  With more than one frame the time-series mapper is
/// built eagerly; a single frame leaves it out, since temporal
/// correspondence is meaningless there.
#[derive(Debug)]
pub struct ForceInference {
    frames: Vec<Frame>,
    time_series: Option<TimeSeries>,
    force_matrices: Vec<Option<ForceMatrix>>,
    pressure_matrices: Vec<Option<PressureMatrix>>,
    forces: Vec<Option<BTreeMap<ForceKey, f64>>>,
    pressures: Vec<Option<BTreeMap<usize, f64>>>,
}

impl ForceInference {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self::with_options(frames, &TimeSeriesOptions::default(), Guesses::new())
    }

    pub fn with_options(
        mut frames: Vec<Frame>,
        options: &TimeSeriesOptions,
        guesses: Guesses,
    ) -> Self {
        // Frame indices must agree with sequence positions; the mapper
        // and every temporal hop key on them.
        for (position, frame) in frames.iter_mut().enumerate() {
            frame.index = position;
        }
        let time_series = if frames.len() > 1 {
            Some(TimeSeries::build(&frames, options, guesses))
        } else {
            None
        };
        let n = frames.len();
        Self {
            frames,
            time_series,
            force_matrices: (0..n).map(|_| None).collect(),
            pressure_matrices: (0..n).map(|_| None).collect(),
            forces: (0..n).map(|_| None).collect(),
            pressures: (0..n).map(|_| None).collect(),
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame(&self, when: usize) -> Result<&Frame, EpiforceError> {
        self.frames.get(when).ok_or(EpiforceError::MissingFrame(when))
    }

    pub fn time_series(&self) -> Option<&TimeSeries> {
        self.time_series.as_ref()
    }

    pub fn forces(&self, when: usize) -> Option<&BTreeMap<ForceKey, f64>> {
        self.forces.get(when).and_then(|slot| slot.as_ref())
    }

    pub fn pressures(&self, when: usize) -> Option<&BTreeMap<usize, f64>> {
        self.pressures.get(when).and_then(|slot| slot.as_ref())
    }

    // ── Build / solve sequencing ───────────────────────────

    /// Assemble the force-balance system for one frame.
    ///
    /// A temporal term reads the previous usable frame's solved tensions
    /// as regularisation targets, so frames coupled in time must be
    /// solved in increasing time order.
    pub fn build_force_matrix(
        &mut self,
        when: usize,
        term: Term,
        metadata: &ForceMetadata,
    ) -> Result<(), EpiforceError> {
        let frame = self.frames.get(when).ok_or(EpiforceError::MissingFrame(when))?;
        let previous = match term {
            Term::Temporal => {
                let series = self.time_series.as_ref().ok_or(EpiforceError::NoTimeSeries)?;
                series.previous_usable(when).and_then(|t| self.frames.get(t))
            }
            Term::None => None,
        };
        let matrix =
            ForceMatrix::build(frame, term, metadata, self.time_series.as_ref(), previous)?;
        self.force_matrices[when] = Some(matrix);
        Ok(())
    }

    /// Solve the previously built force system and write the tensions
    /// into the frame, spreading them onto member short edges.
    pub fn solve_stress(
        &mut self,
        when: usize,
        options: &SolverOptions,
    ) -> Result<(), EpiforceError> {
        if when >= self.frames.len() {
            return Err(EpiforceError::MissingFrame(when));
        }
        let matrix = self.force_matrices[when]
            .as_ref()
            .ok_or(EpiforceError::SolveBeforeBuild { when })?;
        let seed = self.time_series.as_ref().and_then(|series| series.guess_for(when));
        let solved = matrix.solve(options, seed)?;
        self.forces[when] = Some(solved.clone());
        let frame = &mut self.frames[when];
        frame.forces = solved;
        frame.assign_edge_tensions();
        Ok(())
    }

    /// Assemble the pressure system; forces must already be solved.
    pub fn build_pressure_matrix(&mut self, when: usize) -> Result<(), EpiforceError> {
        let frame = self.frames.get(when).ok_or(EpiforceError::MissingFrame(when))?;
        let matrix = PressureMatrix::build(frame)?;
        self.pressure_matrices[when] = Some(matrix);
        Ok(())
    }

    /// Solve the previously built pressure system and write the cell
    /// pressures into the frame.
    pub fn solve_pressure(
        &mut self,
        when: usize,
        options: &PressureOptions,
    ) -> Result<(), EpiforceError> {
        if when >= self.frames.len() {
            return Err(EpiforceError::MissingFrame(when));
        }
        if self.forces[when].is_none() {
            return Err(EpiforceError::ForcesNotSolved { when });
        }
        let matrix = self.pressure_matrices[when]
            .as_ref()
            .ok_or(EpiforceError::SolveBeforeBuild { when })?;
        let solved = matrix.solve(options)?;
        self.pressures[when] = Some(solved.clone());
        self.frames[when].pressures = solved;
        Ok(())
    }

    // ── Result queries ─────────────────────────────────────

    /// Tension of the edge joining `v0`/`v1` (ids at frame `t0`) over
    /// `t0..tmax`, one value per step in time order.
    ///
    /// Every step must be resolvable: a missing correspondence, an
    /// unmatched pair, or an unsolved frame is an error the caller must
    /// guard against, not an internally recovered condition.
    pub fn get_edge_force(
        &self,
        v0: usize,
        v1: usize,
        t0: usize,
        tmax: usize,
    ) -> Result<Vec<f64>, EpiforceError> {
        let series = self.time_series.as_ref().ok_or(EpiforceError::NoTimeSeries)?;
        let mut trace = Vec::with_capacity(tmax.saturating_sub(t0));
        for t in t0..tmax {
            let frame = self.frames.get(t).ok_or(EpiforceError::MissingFrame(t))?;
            let current_v0 = series.get_point_id_by_map(v0, t0, t)?;
            let current_v1 = series.get_point_id_by_map(v1, t0, t)?;
            let index = frame.find_big_edge(current_v0, current_v1).ok_or(
                EpiforceError::EdgeNotFound { v0: current_v0, v1: current_v1, when: t },
            )?;
            let tension = frame
                .forces
                .get(&ForceKey::Edge(index))
                .copied()
                .ok_or(EpiforceError::ForcesNotSolved { when: t })?;
            trace.push(tension);
        }
        Ok(trace)
    }

    /// Solved tensions of one frame as report rows.
    pub fn log_force(&self, when: usize) -> Result<Vec<ForceRecord>, EpiforceError> {
        let frame = self.frames.get(when).ok_or(EpiforceError::MissingFrame(when))?;
        if frame.forces.is_empty() {
            return Err(EpiforceError::ForcesNotSolved { when });
        }
        Ok(frame
            .forces
            .iter()
            .map(|(key, &force)| ForceRecord {
                key: key.to_string(),
                force,
                is_border: key.is_border(),
            })
            .collect())
    }

    /// Per-vertex velocities are not inferred by this pipeline.
    pub fn get_velocities(&self) -> Result<BTreeMap<usize, (f64, f64)>, EpiforceError> {
        Err(EpiforceError::NotImplemented("vertex velocities"))
    }

    /// Per-vertex accelerations are not inferred by this pipeline.
    pub fn get_accelerations(&self) -> Result<BTreeMap<usize, (f64, f64)>, EpiforceError> {
        Err(EpiforceError::NotImplemented("vertex accelerations"))
    }

    // ── Topology mutation ──────────────────────────────────

    /// Cascading cell removal followed by a frame rebuild; the frame's
    /// stale systems and results are dropped.
    pub fn remove_cell(&mut self, when: usize, cell_id: usize) -> Result<(), EpiforceError> {
        let frame = self
            .frames
            .get_mut(when)
            .ok_or(EpiforceError::MissingFrame(when))?;
        frame.remove_cell(cell_id)?;
        self.force_matrices[when] = None;
        self.pressure_matrices[when] = None;
        self.forces[when] = None;
        self.pressures[when] = None;
        Ok(())
    }

    /// Peel border cells off one frame.
    ///
    /// `layers == 0` is a no-op returning `true`.  `layers == 1` removes
    /// every current border cell except the `(frame, cell)` pairs in
    /// `exclusions`.  Deeper peeling is not implemented.
    pub fn remove_outermost_edges(
        &mut self,
        when: usize,
        layers: usize,
        exclusions: &BTreeSet<(usize, usize)>,
    ) -> Result<bool, EpiforceError> {
        match layers {
            0 => Ok(true),
            1 => {
                let frame = self.frames.get(when).ok_or(EpiforceError::MissingFrame(when))?;
                let border_cells: Vec<usize> = frame
                    .cells
                    .values()
                    .filter(|cell| cell.is_border)
                    .map(|cell| cell.id)
                    .collect();
                info!(
                    "removing {} border cells from frame {}",
                    border_cells.len(),
                    when
                );
                for cell_id in border_cells {
                    if exclusions.contains(&(when, cell_id)) {
                        continue;
                    }
                    self.remove_cell(when, cell_id)?;
                }
                Ok(true)
            }
            _ => Err(EpiforceError::NotImplemented("peeling more than one layer")),
        }
    }
}
