use std::collections::BTreeMap;
use std::fmt;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public API returns `Result<T, EpiforceError>`
/// instead of panicking.  Precondition violations (solve before build,
/// pressure before stress) are their own variants so callers can tell a
/// sequencing mistake apart from a numerical failure.
#[derive(Debug)]
pub enum EpiforceError {
    /// Linear algebra failure (singular or non-factorisable system).
    Linalg(sprs::errors::LinalgError),
    /// The iterative solver returned an error.
    Solver(String),
    /// `solve_*` called before the matching `build_*` for this frame.
    SolveBeforeBuild { when: usize },
    /// Pressure build/solve requested before forces were solved.
    ForcesNotSolved { when: usize },
    /// Operation is explicitly unsupported, never silently approximated.
    NotImplemented(&'static str),
    /// Topology consistency violation: a dangling reference or a vertex
    /// mis-attributed to a cell.  Indicates upstream data corruption;
    /// the offending mutation is aborted before any deletion.
    Inconsistent(String),
    /// No cross-frame correspondence for a vertex between two times.
    NoCorrespondence { vertex: usize, from: usize, to: usize },
    /// A tracked vertex pair has no big edge in the target frame.
    EdgeNotFound { v0: usize, v1: usize, when: usize },
    /// Frame index outside the series.
    MissingFrame(usize),
    /// Cell id not present in the frame.
    CellNotFound { cell: usize },
    /// A temporal term was requested but the series has a single frame.
    NoTimeSeries,
    /// Guess file exists but could not be parsed.
    Guess(String),
}

impl fmt::Display for EpiforceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linalg(e) => write!(f, "linear algebra error: {e}"),
            Self::Solver(msg) => write!(f, "solver error: {msg}"),
            Self::SolveBeforeBuild { when } => {
                write!(f, "solve called before build for frame {when}")
            }
            Self::ForcesNotSolved { when } => {
                write!(f, "forces must be calculated first for frame {when}")
            }
            Self::NotImplemented(what) => write!(f, "not implemented: {what}"),
            Self::Inconsistent(msg) => write!(f, "inconsistent topology: {msg}"),
            Self::NoCorrespondence { vertex, from, to } => {
                write!(f, "vertex {vertex} has no correspondence from frame {from} to {to}")
            }
            Self::EdgeNotFound { v0, v1, when } => {
                write!(f, "no edge joining vertices {v0} and {v1} in frame {when}")
            }
            Self::MissingFrame(when) => write!(f, "no frame with index {when}"),
            Self::CellNotFound { cell } => write!(f, "no cell with id {cell}"),
            Self::NoTimeSeries => {
                write!(f, "temporal coupling requires more than one frame")
            }
            Self::Guess(msg) => write!(f, "malformed guess file: {msg}"),
        }
    }
}

impl std::error::Error for EpiforceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Linalg(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sprs::errors::LinalgError> for EpiforceError {
    fn from(e: sprs::errors::LinalgError) -> Self {
        Self::Linalg(e)
    }
}

impl From<argmin::core::Error> for EpiforceError {
    fn from(e: argmin::core::Error) -> Self {
        Self::Solver(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────
//  Result keys
// ─────────────────────────────────────────────────────────────

/// Key of one solved tension unknown.
///
/// The default configuration (`externals = none`) produces only
/// [`ForceKey::Edge`] entries; [`ForceKey::External`] keys appear when a
/// boundary-force column is carried and classify as border in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ForceKey {
    /// Tension of the big edge with this index in the frame's table.
    Edge(usize),
    /// External boundary force attached to this border vertex.
    External(usize),
}

impl ForceKey {
    pub fn is_border(&self) -> bool {
        matches!(self, Self::External(_))
    }
}

impl fmt::Display for ForceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Edge(i) => write!(f, "{i}"),
            Self::External(v) => write!(f, "ext_{v}"),
        }
    }
}

/// Initial guesses per frame: unknown index to seed value.  Frames with
/// an empty map use the neutral seed.
pub type Guesses = BTreeMap<usize, BTreeMap<usize, f64>>;

/// One row of a tension report, ready for downstream consumers.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ForceRecord {
    pub key: String,
    pub force: f64,
    pub is_border: bool,
}

// ─────────────────────────────────────────────────────────────
//  Term selector
// ─────────────────────────────────────────────────────────────

/// Extra rows added to the force-balance system at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Term {
    /// Intra-frame system only.
    #[default]
    None,
    /// Couple to the previous usable frame: penalise tension changes on
    /// edges matched through the time-series mapping.
    Temporal,
}

// ─────────────────────────────────────────────────────────────
//  Configuration
// ─────────────────────────────────────────────────────────────

/// Build-time metadata for the force system.
#[derive(Debug, Clone)]
pub struct ForceMetadata {
    /// Weight of each temporal coupling row (ignored for `Term::None`).
    pub temporal_weight: f64,
}

impl Default for ForceMetadata {
    fn default() -> Self {
        Self { temporal_weight: 0.5 }
    }
}

/// Options for the stress solve.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Target mean tension; fixes the global scale the balance equations
    /// leave free.
    pub scale_target: f64,
    /// Tikhonov weight added to the normal-equation diagonal.
    pub tikhonov: f64,
    /// Refine with the non-negative least-squares path (L-BFGS with a
    /// softplus barrier) instead of the direct factorisation.
    pub non_negative: bool,
    /// Barrier weight for the non-negative path.
    pub barrier_weight: f64,
    /// Barrier sharpness for the non-negative path.
    pub barrier_sharpness: f64,
    /// Quadratic penalty weight tying the mean tension to `scale_target`
    /// in the non-negative path.
    pub scale_weight: f64,
    /// Iteration cap for the non-negative path.
    pub max_iterations: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            scale_target: 1.0,
            tikhonov: 1e-9,
            non_negative: false,
            barrier_weight: 100.0,
            barrier_sharpness: 10.0,
            scale_weight: 10.0,
            max_iterations: 300,
        }
    }
}

/// Gauge choice for the pressure solve.  Pressures are defined up to an
/// additive constant; the anchor removes that degree of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PressureAnchor {
    /// Constrain the cell pressures to zero mean.
    #[default]
    MeanZero,
    /// Pin this cell's pressure to zero.
    Cell(usize),
}

/// Options for the pressure solve.
#[derive(Debug, Clone)]
pub struct PressureOptions {
    pub anchor: PressureAnchor,
    pub tikhonov: f64,
}

impl Default for PressureOptions {
    fn default() -> Self {
        Self { anchor: PressureAnchor::MeanZero, tikhonov: 1e-9 }
    }
}

/// Options for building the cross-frame vertex correspondence.
#[derive(Debug, Clone)]
pub struct TimeSeriesOptions {
    /// Translate each next frame onto the current frame's centroid
    /// before matching.
    pub align_centroids: bool,
    /// Acceptance radius for a match.  `None` uses a tenth of the
    /// current frame's bounding-box diagonal.
    pub max_distance: Option<f64>,
}

impl Default for TimeSeriesOptions {
    fn default() -> Self {
        Self { align_centroids: true, max_distance: None }
    }
}
