//! **epiforce** — tension and pressure inference on dynamic polygonal
//! cell meshes (vertex models of biological tissue).
//!
//! The pipeline, per frame:
//!
//! 1. **Mesh** (`mesh`): vertex/edge/cell arenas, big-edge chains,
//!    cascading mutation with full reconstruction.
//! 2. **Time series** (`timeseries`): cross-frame vertex identity and
//!    guess propagation.
//! 3. **Force system** (`fmatrix`): force balance at interior junctions,
//!    solved for big-edge tensions (`solver` backend).
//! 4. **Pressure system** (`pmatrix`): Young-Laplace relations over the
//!    solved tensions, solved for relative cell pressures.
//! 5. **Orchestrator** (`inference`): per-frame slots and the
//!    build → solve ordering contract.

pub mod types;
pub mod mesh;
pub mod timeseries;
pub mod solver;
pub mod fmatrix;
pub mod pmatrix;
pub mod guess;
pub mod inference;
