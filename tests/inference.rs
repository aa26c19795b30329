//! End-to-end inference tests: build/solve sequencing, force balance on
//! a synthetic mesh, pressure recovery, and the trimming operations.

use std::collections::{BTreeMap, BTreeSet};

use epiforce::inference::ForceInference;
use epiforce::mesh::{Cell, Edge, Frame, Vertex};
use epiforce::pmatrix::PressureMatrix;
use epiforce::types::{
    EpiforceError, ForceKey, ForceMetadata, PressureAnchor, PressureOptions, SolverOptions,
    Term,
};

// ─────────────────────────────────────────────────────────────
//  Fixtures
// ─────────────────────────────────────────────────────────────

/// Two triangles sharing one interior vertex.  The single interior
/// junction makes both tensions equal under force balance.
fn bowtie(index: usize) -> Frame {
    let vertices = BTreeMap::from([
        (0, Vertex::new(0, 0.0, 0.0)),
        (1, Vertex::new(1, -1.0, 1.0)),
        (2, Vertex::new(2, -1.0, -1.0)),
        (3, Vertex::new(3, 1.0, -1.0)),
        (4, Vertex::new(4, 1.0, 1.0)),
    ]);
    let edges = BTreeMap::from([
        (0, Edge::new(0, 0, 1)),
        (1, Edge::new(1, 1, 2)),
        (2, Edge::new(2, 2, 0)),
        (3, Edge::new(3, 0, 3)),
        (4, Edge::new(4, 3, 4)),
        (5, Edge::new(5, 4, 0)),
    ]);
    let cells = BTreeMap::from([
        (0, Cell::new(0, vec![0, 1, 2])),
        (1, Cell::new(1, vec![0, 3, 4])),
    ]);
    Frame::reconstruct(index, vertices, edges, cells, index as f64, false, false).unwrap()
}

/// Three unit squares in a row.
fn strip(index: usize) -> Frame {
    let mut vertices = BTreeMap::new();
    for i in 0..4 {
        vertices.insert(i, Vertex::new(i, i as f64, 0.0));
        vertices.insert(i + 4, Vertex::new(i + 4, i as f64, 1.0));
    }
    let edges = BTreeMap::from([
        (0, Edge::new(0, 0, 1)),
        (1, Edge::new(1, 1, 2)),
        (2, Edge::new(2, 2, 3)),
        (3, Edge::new(3, 4, 5)),
        (4, Edge::new(4, 5, 6)),
        (5, Edge::new(5, 6, 7)),
        (6, Edge::new(6, 0, 4)),
        (7, Edge::new(7, 1, 5)),
        (8, Edge::new(8, 2, 6)),
        (9, Edge::new(9, 3, 7)),
    ]);
    let cells = BTreeMap::from([
        (0, Cell::new(0, vec![0, 1, 5, 4])),
        (1, Cell::new(1, vec![1, 2, 6, 5])),
        (2, Cell::new(2, vec![2, 3, 7, 6])),
    ]);
    Frame::reconstruct(index, vertices, edges, cells, index as f64, false, false).unwrap()
}

/// The strip with the interface between cells 0 and 1 bulged into cell 1
/// by an intermediate vertex, so that interface carries curvature.
fn bulged_strip() -> Frame {
    let mut vertices = BTreeMap::new();
    for i in 0..4 {
        vertices.insert(i, Vertex::new(i, i as f64, 0.0));
        vertices.insert(i + 4, Vertex::new(i + 4, i as f64, 1.0));
    }
    vertices.insert(8, Vertex::new(8, 1.1, 0.5));
    let edges = BTreeMap::from([
        (0, Edge::new(0, 0, 1)),
        (1, Edge::new(1, 1, 2)),
        (2, Edge::new(2, 2, 3)),
        (3, Edge::new(3, 4, 5)),
        (4, Edge::new(4, 5, 6)),
        (5, Edge::new(5, 6, 7)),
        (6, Edge::new(6, 0, 4)),
        (8, Edge::new(8, 2, 6)),
        (9, Edge::new(9, 3, 7)),
        (10, Edge::new(10, 1, 8)),
        (11, Edge::new(11, 8, 5)),
    ]);
    let cells = BTreeMap::from([
        (0, Cell::new(0, vec![0, 1, 8, 5, 4])),
        (1, Cell::new(1, vec![1, 2, 6, 5, 8])),
        (2, Cell::new(2, vec![2, 3, 7, 6])),
    ]);
    Frame::reconstruct(0, vertices, edges, cells, 0.0, false, false).unwrap()
}

/// Residual of the force balance at one junction: sum over incident big
/// edges of the solved tension times the unit vector away from it.
fn balance_residual(frame: &Frame, junction: usize) -> (f64, f64) {
    let mut sum = (0.0, 0.0);
    for (index, big_edge) in frame.big_edges.iter().enumerate() {
        let tension = frame.forces[&ForceKey::Edge(index)];
        let chain = &big_edge.vertices;
        let ends = [
            (chain[0], chain[1]),
            (chain[chain.len() - 1], chain[chain.len() - 2]),
        ];
        for (end, adjacent) in ends {
            if end == junction {
                let (ux, uy) = frame.unit_between(end, adjacent).unwrap();
                sum.0 += tension * ux;
                sum.1 += tension * uy;
            }
        }
    }
    sum
}

// ─────────────────────────────────────────────────────────────
//  Force solve
// ─────────────────────────────────────────────────────────────

#[test]
fn bowtie_force_balance() {
    let mut inference = ForceInference::new(vec![bowtie(0)]);
    inference
        .build_force_matrix(0, Term::None, &ForceMetadata::default())
        .unwrap();
    inference.solve_stress(0, &SolverOptions::default()).unwrap();

    let frame = inference.frame(0).unwrap();
    assert_eq!(frame.forces.len(), 2);
    for (key, tension) in &frame.forces {
        assert!(
            (tension - 1.0).abs() < 1e-5,
            "symmetric bowtie tension {key} should sit at the scale target, got {tension}"
        );
    }
    let (rx, ry) = balance_residual(frame, 0);
    assert!(rx.abs() < 1e-6 && ry.abs() < 1e-6, "unbalanced junction: ({rx}, {ry})");
    // Tensions are spread onto every member short edge.
    assert_eq!(frame.edge_tensions.len(), frame.edges.len());
}

#[test]
fn strip_force_solution_is_structured() {
    let mut inference = ForceInference::new(vec![strip(0)]);
    inference
        .build_force_matrix(0, Term::None, &ForceMetadata::default())
        .unwrap();
    inference.solve_stress(0, &SolverOptions::default()).unwrap();

    let frame = inference.frame(0).unwrap();
    assert_eq!(frame.forces.len(), 6);
    for (index, big_edge) in frame.big_edges.iter().enumerate() {
        let tension = frame.forces[&ForceKey::Edge(index)];
        if big_edge.edges == [7] || big_edge.edges == [8] {
            // Vertical interfaces cannot be balanced against purely
            // horizontal chains, so they carry no tension.
            assert!(tension.abs() < 1e-5, "interface {index} got {tension}");
        } else {
            assert!((tension - 1.5).abs() < 1e-5, "chain {index} got {tension}");
        }
    }
    let mean: f64 = frame.forces.values().sum::<f64>() / frame.forces.len() as f64;
    assert!((mean - 1.0).abs() < 1e-6, "scale anchor fixes the mean, got {mean}");
}

#[test]
fn repeated_solves_are_deterministic() {
    let run = || {
        let mut inference = ForceInference::new(vec![strip(0)]);
        inference
            .build_force_matrix(0, Term::None, &ForceMetadata::default())
            .unwrap();
        inference.solve_stress(0, &SolverOptions::default()).unwrap();
        inference.frame(0).unwrap().forces.clone()
    };
    let first = run();
    let second = run();
    assert_eq!(first, second, "identical input must produce identical tensions");
}

#[test]
fn non_negative_refinement_stays_feasible() {
    let mut inference = ForceInference::new(vec![bowtie(0)]);
    inference
        .build_force_matrix(0, Term::None, &ForceMetadata::default())
        .unwrap();
    let options = SolverOptions { non_negative: true, ..SolverOptions::default() };
    inference.solve_stress(0, &options).unwrap();

    let frame = inference.frame(0).unwrap();
    for (key, tension) in &frame.forces {
        assert!(*tension >= 0.0, "tension {key} went negative: {tension}");
        assert!(
            (tension - 1.0).abs() < 0.05,
            "tension {key} far from the balanced value: {tension}"
        );
    }
}

// ─────────────────────────────────────────────────────────────
//  Ordering preconditions
// ─────────────────────────────────────────────────────────────

#[test]
fn solve_before_build_fails() {
    let mut inference = ForceInference::new(vec![bowtie(0)]);
    let result = inference.solve_stress(0, &SolverOptions::default());
    assert!(matches!(result, Err(EpiforceError::SolveBeforeBuild { when: 0 })));
}

#[test]
fn pressure_before_stress_fails() {
    let mut inference = ForceInference::new(vec![bowtie(0)]);
    let result = inference.build_pressure_matrix(0);
    assert!(matches!(result, Err(EpiforceError::ForcesNotSolved { when: 0 })));

    let result = inference.solve_pressure(0, &PressureOptions::default());
    assert!(matches!(result, Err(EpiforceError::ForcesNotSolved { when: 0 })));
}

#[test]
fn pressure_solve_requires_built_matrix() {
    let mut inference = ForceInference::new(vec![bowtie(0)]);
    inference
        .build_force_matrix(0, Term::None, &ForceMetadata::default())
        .unwrap();
    inference.solve_stress(0, &SolverOptions::default()).unwrap();
    let result = inference.solve_pressure(0, &PressureOptions::default());
    assert!(matches!(result, Err(EpiforceError::SolveBeforeBuild { when: 0 })));
}

#[test]
fn missing_frame_is_an_error() {
    let mut inference = ForceInference::new(vec![bowtie(0)]);
    let result = inference.build_force_matrix(3, Term::None, &ForceMetadata::default());
    assert!(matches!(result, Err(EpiforceError::MissingFrame(3))));
}

// ─────────────────────────────────────────────────────────────
//  Pressure solve
// ─────────────────────────────────────────────────────────────

#[test]
fn straight_strip_has_uniform_pressure() {
    let mut inference = ForceInference::new(vec![strip(0)]);
    inference
        .build_force_matrix(0, Term::None, &ForceMetadata::default())
        .unwrap();
    inference.solve_stress(0, &SolverOptions::default()).unwrap();
    inference.build_pressure_matrix(0).unwrap();
    inference.solve_pressure(0, &PressureOptions::default()).unwrap();

    let frame = inference.frame(0).unwrap();
    assert_eq!(frame.pressures.len(), 3);
    for (cell, pressure) in &frame.pressures {
        assert!(
            pressure.abs() < 1e-6,
            "straight interfaces carry no pressure difference, cell {cell} got {pressure}"
        );
    }
}

#[test]
fn curved_interface_raises_pressure_on_concave_side() {
    // Hand-set unit tensions so the curved interface carries load.
    let mut frame = bulged_strip();
    for index in 0..frame.big_edges.len() {
        frame.forces.insert(ForceKey::Edge(index), 1.0);
    }
    let interface = frame.find_big_edge(1, 8).expect("bulged interface exists");
    let curvature = frame.big_edge_curvature(interface).unwrap();
    assert!(curvature > 0.1, "bulge must register as curvature, got {curvature}");

    let matrix = PressureMatrix::build(&frame).unwrap();
    assert_eq!(matrix.mapping_order, vec![0, 1, 2]);
    let pressures = matrix.solve(&PressureOptions::default()).unwrap();

    let (p0, p1, p2) = (pressures[&0], pressures[&1], pressures[&2]);
    assert!(
        (p0 - p1 - curvature).abs() < 1e-4,
        "Laplace jump across the bulge: expected {curvature}, got {}",
        p0 - p1
    );
    assert!((p1 - p2).abs() < 1e-6, "straight interface keeps cells 1 and 2 level");
    assert!(
        (p0 + p1 + p2).abs() < 1e-6,
        "mean-zero anchor, got sum {}",
        p0 + p1 + p2
    );
}

#[test]
fn anchored_pressure_pins_the_chosen_cell() {
    let mut frame = bulged_strip();
    for index in 0..frame.big_edges.len() {
        frame.forces.insert(ForceKey::Edge(index), 1.0);
    }
    let matrix = PressureMatrix::build(&frame).unwrap();
    let options = PressureOptions { anchor: PressureAnchor::Cell(1), ..Default::default() };
    let pressures = matrix.solve(&options).unwrap();
    assert!(pressures[&1].abs() < 1e-12, "anchor cell is pinned to zero");
    assert!(pressures[&0] > 0.1, "concave-side cell sits above the anchor");

    let missing = PressureOptions { anchor: PressureAnchor::Cell(99), ..Default::default() };
    assert!(matches!(
        matrix.solve(&missing),
        Err(EpiforceError::CellNotFound { cell: 99 })
    ));
}

// ─────────────────────────────────────────────────────────────
//  Reports and unsupported kinematics
// ─────────────────────────────────────────────────────────────

#[test]
fn log_force_classifies_keys() {
    let mut inference = ForceInference::new(vec![bowtie(0)]);
    inference
        .build_force_matrix(0, Term::None, &ForceMetadata::default())
        .unwrap();
    inference.solve_stress(0, &SolverOptions::default()).unwrap();

    let rows = inference.log_force(0).unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert!(!row.is_border, "interior edge rows are not border entries");
        assert!(row.force.is_finite());
    }

    let unsolved = ForceInference::new(vec![bowtie(0)]);
    assert!(matches!(
        unsolved.log_force(0),
        Err(EpiforceError::ForcesNotSolved { when: 0 })
    ));
}

#[test]
fn stress_tensor_needs_solved_forces() {
    let mut inference = ForceInference::new(vec![bowtie(0)]);
    assert!(matches!(
        inference.frame(0).unwrap().stress_tensor(),
        Err(EpiforceError::ForcesNotSolved { when: 0 })
    ));

    inference
        .build_force_matrix(0, Term::None, &ForceMetadata::default())
        .unwrap();
    inference.solve_stress(0, &SolverOptions::default()).unwrap();
    let sigma = inference.frame(0).unwrap().stress_tensor().unwrap();
    assert_eq!(sigma.shape(), &[2, 2]);
    assert!((sigma[[0, 1]] - sigma[[1, 0]]).abs() < 1e-12, "stress tensor is symmetric");
    assert!(sigma[[0, 0]] > 0.0 && sigma[[1, 1]] > 0.0);
}

#[test]
fn kinematics_are_explicitly_unsupported() {
    let inference = ForceInference::new(vec![bowtie(0)]);
    assert!(matches!(
        inference.get_velocities(),
        Err(EpiforceError::NotImplemented(_))
    ));
    assert!(matches!(
        inference.get_accelerations(),
        Err(EpiforceError::NotImplemented(_))
    ));
}

// ─────────────────────────────────────────────────────────────
//  Trimming operations
// ─────────────────────────────────────────────────────────────

#[test]
fn remove_outermost_zero_layers_is_a_noop() {
    let mut inference = ForceInference::new(vec![strip(0)]);
    let cells_before: Vec<usize> = inference.frame(0).unwrap().cells.keys().copied().collect();
    let result = inference.remove_outermost_edges(0, 0, &BTreeSet::new()).unwrap();
    assert!(result);
    let cells_after: Vec<usize> = inference.frame(0).unwrap().cells.keys().copied().collect();
    assert_eq!(cells_before, cells_after);
}

#[test]
fn remove_outermost_deeper_layers_not_implemented() {
    let mut inference = ForceInference::new(vec![strip(0)]);
    let result = inference.remove_outermost_edges(0, 2, &BTreeSet::new());
    assert!(matches!(result, Err(EpiforceError::NotImplemented(_))));
}

#[test]
fn remove_outermost_peels_border_cells() {
    let mut inference = ForceInference::new(vec![strip(0)]);
    inference.remove_outermost_edges(0, 1, &BTreeSet::new()).unwrap();
    let frame = inference.frame(0).unwrap();
    // Cells 0 and 2 were border; only the middle square remains.
    assert_eq!(frame.cells.keys().copied().collect::<Vec<_>>(), vec![1]);
}

#[test]
fn remove_outermost_honours_exclusions() {
    let mut inference = ForceInference::new(vec![strip(0)]);
    let exclusions = BTreeSet::from([(0, 0)]);
    inference.remove_outermost_edges(0, 1, &exclusions).unwrap();
    let frame = inference.frame(0).unwrap();
    assert_eq!(frame.cells.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
}

#[test]
fn orchestrated_removal_invalidates_results() {
    let mut inference = ForceInference::new(vec![strip(0)]);
    inference
        .build_force_matrix(0, Term::None, &ForceMetadata::default())
        .unwrap();
    inference.solve_stress(0, &SolverOptions::default()).unwrap();
    assert!(inference.forces(0).is_some());

    inference.remove_cell(0, 0).unwrap();
    assert!(inference.forces(0).is_none(), "stale tensions must be dropped");
    let result = inference.solve_stress(0, &SolverOptions::default());
    assert!(matches!(result, Err(EpiforceError::SolveBeforeBuild { when: 0 })));
}
