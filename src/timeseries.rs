//! Cross-frame vertex identity: pairwise correspondence between adjacent
//! frames, hop-composed lookup across arbitrary time spans, the ordered
//! list of usable frames, and initial-guess propagation.
//!
//! The correspondence table is built once and never mutated afterwards;
//! every frame's matrix builder reads it as shared immutable state.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::mesh::Frame;
use crate::types::{EpiforceError, Guesses, TimeSeriesOptions};

// ─────────────────────────────────────────────────────────────
//  TimeSeries
// ─────────────────────────────────────────────────────────────

/// Vertex correspondence across a frame sequence.
///
/// `mapping[t]` maps vertex ids at frame `t` to vertex ids at frame
/// `t + 1`.  The map is injective but partial: vertices with no
/// acceptable geometric match (rearrangement, division, disappearance)
/// simply have no entry.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    mapping: BTreeMap<usize, BTreeMap<usize, usize>>,
    times_to_use: Vec<usize>,
    guesses: Guesses,
}

impl TimeSeries {
    /// Match every adjacent frame pair and record which frames carry
    /// usable topology (at least one cell and one interior junction).
    pub fn build(frames: &[Frame], options: &TimeSeriesOptions, guesses: Guesses) -> Self {
        let mut mapping = BTreeMap::new();
        for t in 0..frames.len().saturating_sub(1) {
            let matched = match_frames(&frames[t], &frames[t + 1], options);
            debug!(
                "frame {} -> {}: matched {} of {} vertices",
                t,
                t + 1,
                matched.len(),
                frames[t].vertices.len()
            );
            mapping.insert(t, matched);
        }
        let times_to_use = frames
            .iter()
            .enumerate()
            .filter(|(_, frame)| {
                !frame.cells.is_empty() && !frame.interior_junctions().is_empty()
            })
            .map(|(t, _)| t)
            .collect();
        Self { mapping, times_to_use, guesses }
    }

    pub fn mapping(&self) -> &BTreeMap<usize, BTreeMap<usize, usize>> {
        &self.mapping
    }

    /// Frame indices with usable topology, in increasing time order.
    pub fn times_to_use(&self) -> &[usize] {
        &self.times_to_use
    }

    /// The last usable frame strictly before `when`.
    pub fn previous_usable(&self, when: usize) -> Option<usize> {
        self.times_to_use.iter().copied().filter(|&t| t < when).last()
    }

    /// Initial-guess seeds for one frame; `None` means the neutral seed.
    pub fn guess_for(&self, when: usize) -> Option<&BTreeMap<usize, f64>> {
        self.guesses.get(&when)
    }

    /// Resolve the id a vertex known at `source` carries at `target`.
    ///
    /// Walks the adjacent maps forward, or their inverses backward
    /// (injectivity makes the inverse unambiguous).  The first missing
    /// hop aborts with [`EpiforceError::NoCorrespondence`]; callers
    /// decide whether to skip that time step or fall back to an
    /// intra-frame lookup.
    pub fn get_point_id_by_map(
        &self,
        vertex: usize,
        source: usize,
        target: usize,
    ) -> Result<usize, EpiforceError> {
        let missing = || EpiforceError::NoCorrespondence { vertex, from: source, to: target };
        let mut current = vertex;
        if target >= source {
            for t in source..target {
                current = *self
                    .mapping
                    .get(&t)
                    .and_then(|step| step.get(&current))
                    .ok_or_else(missing)?;
            }
        } else {
            for t in (target..source).rev() {
                let step = self.mapping.get(&t).ok_or_else(missing)?;
                current = step
                    .iter()
                    .find(|&(_, &to)| to == current)
                    .map(|(&from, _)| from)
                    .ok_or_else(missing)?;
            }
        }
        Ok(current)
    }
}

// ─────────────────────────────────────────────────────────────
//  Pairwise matching
// ─────────────────────────────────────────────────────────────

/// Greedy nearest-geometry matching between two adjacent frames.
///
/// Candidate pairs within the acceptance radius are sorted by distance
/// (ties broken by ids, keeping the result deterministic) and consumed
/// greedily, which enforces injectivity on both sides.  Vertices left
/// over start a new identity or vanish; a simple index copy would be
/// wrong whenever topology changes between frames.
fn match_frames(
    current: &Frame,
    next: &Frame,
    options: &TimeSeriesOptions,
) -> BTreeMap<usize, usize> {
    let offset = if options.align_centroids {
        let (cx, cy) = current.centroid();
        let (nx, ny) = next.centroid();
        (nx - cx, ny - cy)
    } else {
        (0.0, 0.0)
    };
    let radius = options
        .max_distance
        .unwrap_or_else(|| 0.1 * current.bounding_diagonal());

    let mut candidates = Vec::new();
    for a in current.vertices.values() {
        for b in next.vertices.values() {
            let dx = a.x + offset.0 - b.x;
            let dy = a.y + offset.1 - b.y;
            let distance = (dx * dx + dy * dy).sqrt();
            if distance <= radius {
                candidates.push((distance, a.id, b.id));
            }
        }
    }
    candidates.sort_by(|l, r| {
        l.0.total_cmp(&r.0).then(l.1.cmp(&r.1)).then(l.2.cmp(&r.2))
    });

    let mut taken_from = BTreeSet::new();
    let mut taken_to = BTreeSet::new();
    let mut matched = BTreeMap::new();
    for (_, from, to) in candidates {
        if taken_from.contains(&from) || taken_to.contains(&to) {
            continue;
        }
        taken_from.insert(from);
        taken_to.insert(to);
        matched.insert(from, to);
    }
    matched
}
