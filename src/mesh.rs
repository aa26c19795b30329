//! Per-frame mesh topology: vertex/edge/cell arenas addressed by stable
//! integer ids, the derived big-edge table, and cascading mutation.
//!
//! All cross-entity navigation goes through the [`Frame`] index; the
//! entities themselves store ids, never references.  Topology-mutating
//! operations validate first, apply on copies, and commit by full
//! reconstruction, so no partially-updated frame is ever observable.

use std::collections::{BTreeMap, BTreeSet};

use ndarray::Array2;

use crate::types::{EpiforceError, ForceKey};

// ─────────────────────────────────────────────────────────────
//  Entities
// ─────────────────────────────────────────────────────────────

/// One mesh vertex.  `own_edges` / `own_cells` must mirror the edge and
/// cell tables of the owning frame (checked at construction).
#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    pub id: usize,
    pub x: f64,
    pub y: f64,
    pub own_edges: Vec<usize>,
    pub own_cells: Vec<usize>,
}

impl Vertex {
    pub fn new(id: usize, x: f64, y: f64) -> Self {
        Self { id, x, y, own_edges: Vec::new(), own_cells: Vec::new() }
    }

    pub fn degree(&self) -> usize {
        self.own_edges.len()
    }

    /// A vertex owned by fewer than 2 cells touches the tissue boundary.
    pub fn is_border(&self) -> bool {
        self.own_cells.len() < 2
    }
}

/// One short edge: an unordered vertex pair, no self-loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub id: usize,
    pub v1: usize,
    pub v2: usize,
}

impl Edge {
    pub fn new(id: usize, v1: usize, v2: usize) -> Self {
        Self { id, v1, v2 }
    }

    pub fn joins(&self, a: usize, b: usize) -> bool {
        (self.v1 == a && self.v2 == b) || (self.v1 == b && self.v2 == a)
    }

    /// The endpoint opposite `v`.  `v` must be one of the endpoints.
    pub fn opposite(&self, v: usize) -> usize {
        if v == self.v1 {
            self.v2
        } else {
            self.v1
        }
    }
}

/// One cell: a closed, ordered cycle of vertex ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub id: usize,
    pub vertices: Vec<usize>,
    pub is_border: bool,
}

impl Cell {
    pub fn new(id: usize, vertices: Vec<usize>) -> Self {
        Self { id, vertices, is_border: false }
    }

    /// Whether `a` and `b` are consecutive (wrapping) in the cycle.
    fn cycle_adjacent(&self, a: usize, b: usize) -> bool {
        let n = self.vertices.len();
        (0..n).any(|i| {
            let u = self.vertices[i];
            let w = self.vertices[(i + 1) % n];
            (u == a && w == b) || (u == b && w == a)
        })
    }
}

/// A maximal chain of short edges joining two junction vertices through
/// intermediate degree-2 vertices.  `vertices[i]` and `vertices[i + 1]`
/// are the endpoints of `edges[i]`.  Tensions are reported at this level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigEdge {
    pub vertices: Vec<usize>,
    pub edges: Vec<usize>,
}

impl BigEdge {
    pub fn endpoints(&self) -> (usize, usize) {
        (self.vertices[0], self.vertices[self.vertices.len() - 1])
    }

    /// Closed chains (a cell ring with no junction, or a loop anchored
    /// at a single junction) start and end at the same vertex.
    pub fn is_closed(&self) -> bool {
        let (a, b) = self.endpoints();
        a == b
    }

    pub fn contains(&self, v: usize) -> bool {
        self.vertices.contains(&v)
    }
}

// ─────────────────────────────────────────────────────────────
//  Frame
// ─────────────────────────────────────────────────────────────

/// One timepoint of the tissue: exclusively-owned entity arenas, the
/// derived big-edge table, provenance flags, and solved results.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: usize,
    pub time: f64,
    pub vertices: BTreeMap<usize, Vertex>,
    pub edges: BTreeMap<usize, Edge>,
    pub cells: BTreeMap<usize, Cell>,
    /// Ground-truth provenance.
    pub gt: bool,
    /// Surface-evolver provenance.
    pub surface_evolver: bool,
    pub big_edges: Vec<BigEdge>,
    /// Solved tensions, keyed per big edge (or external boundary key).
    pub forces: BTreeMap<ForceKey, f64>,
    /// Big-edge tensions spread onto member short edges.
    pub edge_tensions: BTreeMap<usize, f64>,
    /// Solved relative pressures, keyed by cell id.
    pub pressures: BTreeMap<usize, f64>,
}

impl Frame {
    /// Build a frame from a parsed mesh snapshot and validate it.
    ///
    /// The snapshot's own-lists must already be reciprocal with the edge
    /// and cell tables; any dangling or missing reference is an
    /// [`EpiforceError::Inconsistent`].  Cell border flags are re-derived
    /// (a cell touching a boundary vertex is a border cell).
    pub fn new(
        index: usize,
        vertices: BTreeMap<usize, Vertex>,
        edges: BTreeMap<usize, Edge>,
        cells: BTreeMap<usize, Cell>,
        time: f64,
        gt: bool,
        surface_evolver: bool,
    ) -> Result<Self, EpiforceError> {
        let mut frame = Self {
            index,
            time,
            vertices,
            edges,
            cells,
            gt,
            surface_evolver,
            big_edges: Vec::new(),
            forces: BTreeMap::new(),
            edge_tensions: BTreeMap::new(),
            pressures: BTreeMap::new(),
        };
        frame.validate()?;
        frame.derive_border_flags();
        frame.big_edges = build_big_edges(&frame.vertices, &frame.edges);
        Ok(frame)
    }

    /// Rebuild a frame from raw tables, re-deriving every own-list.
    ///
    /// This is the commit step of mutations: ownership is recomputed
    /// from the surviving edge and cell tables, never patched.
    pub fn reconstruct(
        index: usize,
        mut vertices: BTreeMap<usize, Vertex>,
        edges: BTreeMap<usize, Edge>,
        cells: BTreeMap<usize, Cell>,
        time: f64,
        gt: bool,
        surface_evolver: bool,
    ) -> Result<Self, EpiforceError> {
        for vertex in vertices.values_mut() {
            vertex.own_edges.clear();
            vertex.own_cells.clear();
        }
        for (&eid, edge) in &edges {
            for endpoint in [edge.v1, edge.v2] {
                vertices
                    .get_mut(&endpoint)
                    .ok_or_else(|| {
                        EpiforceError::Inconsistent(format!(
                            "edge {eid} references missing vertex {endpoint}"
                        ))
                    })?
                    .own_edges
                    .push(eid);
            }
        }
        for (&cid, cell) in &cells {
            for &vid in &cell.vertices {
                vertices
                    .get_mut(&vid)
                    .ok_or_else(|| {
                        EpiforceError::Inconsistent(format!(
                            "cell {cid} references missing vertex {vid}"
                        ))
                    })?
                    .own_cells
                    .push(cid);
            }
        }
        Self::new(index, vertices, edges, cells, time, gt, surface_evolver)
    }

    // ── Validation ─────────────────────────────────────────

    fn validate(&self) -> Result<(), EpiforceError> {
        for (&eid, edge) in &self.edges {
            if edge.v1 == edge.v2 {
                return Err(EpiforceError::Inconsistent(format!(
                    "edge {eid} is a self-loop on vertex {}",
                    edge.v1
                )));
            }
            for endpoint in [edge.v1, edge.v2] {
                let vertex = self.vertices.get(&endpoint).ok_or_else(|| {
                    EpiforceError::Inconsistent(format!(
                        "edge {eid} references missing vertex {endpoint}"
                    ))
                })?;
                if !vertex.own_edges.contains(&eid) {
                    return Err(EpiforceError::Inconsistent(format!(
                        "vertex {endpoint} does not list owning edge {eid}"
                    )));
                }
            }
        }
        for (&vid, vertex) in &self.vertices {
            for &eid in &vertex.own_edges {
                let edge = self.edges.get(&eid).ok_or_else(|| {
                    EpiforceError::Inconsistent(format!(
                        "vertex {vid} lists missing edge {eid}"
                    ))
                })?;
                if edge.v1 != vid && edge.v2 != vid {
                    return Err(EpiforceError::Inconsistent(format!(
                        "vertex {vid} lists edge {eid} that does not touch it"
                    )));
                }
            }
            for &cid in &vertex.own_cells {
                let cell = self.cells.get(&cid).ok_or_else(|| {
                    EpiforceError::Inconsistent(format!(
                        "vertex {vid} lists missing cell {cid}"
                    ))
                })?;
                if !cell.vertices.contains(&vid) {
                    return Err(EpiforceError::Inconsistent(format!(
                        "vertex {vid} lists cell {cid} that does not contain it"
                    )));
                }
            }
        }
        for (&cid, cell) in &self.cells {
            if cell.vertices.len() < 3 {
                return Err(EpiforceError::Inconsistent(format!(
                    "cell {cid} has fewer than 3 vertices"
                )));
            }
            let n = cell.vertices.len();
            for i in 0..n {
                let vid = cell.vertices[i];
                let next = cell.vertices[(i + 1) % n];
                let vertex = self.vertices.get(&vid).ok_or_else(|| {
                    EpiforceError::Inconsistent(format!(
                        "cell {cid} references missing vertex {vid}"
                    ))
                })?;
                if !vertex.own_cells.contains(&cid) {
                    return Err(EpiforceError::Inconsistent(format!(
                        "vertex {vid} does not list owning cell {cid}"
                    )));
                }
                let joined = vertex
                    .own_edges
                    .iter()
                    .any(|eid| self.edges.get(eid).is_some_and(|e| e.joins(vid, next)));
                if !joined {
                    return Err(EpiforceError::Inconsistent(format!(
                        "cell {cid} cycle is broken between vertices {vid} and {next}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn derive_border_flags(&mut self) {
        let border_vertices: BTreeSet<usize> = self
            .vertices
            .values()
            .filter(|v| v.is_border())
            .map(|v| v.id)
            .collect();
        for cell in self.cells.values_mut() {
            cell.is_border = cell.vertices.iter().any(|v| border_vertices.contains(v));
        }
    }

    // ── Structural queries ─────────────────────────────────

    pub fn position(&self, vertex: usize) -> Result<(f64, f64), EpiforceError> {
        self.vertices
            .get(&vertex)
            .map(|v| (v.x, v.y))
            .ok_or_else(|| {
                EpiforceError::Inconsistent(format!("missing vertex {vertex}"))
            })
    }

    pub fn edge_length(&self, edge: usize) -> Result<f64, EpiforceError> {
        let e = self.edges.get(&edge).ok_or_else(|| {
            EpiforceError::Inconsistent(format!("missing edge {edge}"))
        })?;
        let (x1, y1) = self.position(e.v1)?;
        let (x2, y2) = self.position(e.v2)?;
        Ok(((x2 - x1).powi(2) + (y2 - y1).powi(2)).sqrt())
    }

    /// Unit vector pointing from vertex `a` toward vertex `b`.
    /// Zero for coincident positions.
    pub fn unit_between(&self, a: usize, b: usize) -> Result<(f64, f64), EpiforceError> {
        let (xa, ya) = self.position(a)?;
        let (xb, yb) = self.position(b)?;
        let (dx, dy) = (xb - xa, yb - ya);
        let len = (dx * dx + dy * dy).sqrt();
        if len == 0.0 {
            Ok((0.0, 0.0))
        } else {
            Ok((dx / len, dy / len))
        }
    }

    /// Cells bounded by this edge (0, 1, or 2 ids, ascending).
    pub fn edge_cells(&self, edge: usize) -> Vec<usize> {
        let Some(e) = self.edges.get(&edge) else {
            return Vec::new();
        };
        self.cells
            .iter()
            .filter(|(_, cell)| cell.cycle_adjacent(e.v1, e.v2))
            .map(|(&cid, _)| cid)
            .collect()
    }

    /// Interior junctions carry the force-balance equations: non-border
    /// vertices where at least 3 edges meet.
    pub fn interior_junctions(&self) -> Vec<usize> {
        self.vertices
            .values()
            .filter(|v| !v.is_border() && v.degree() >= 3)
            .map(|v| v.id)
            .collect()
    }

    pub fn border_vertices(&self) -> Vec<usize> {
        self.vertices
            .values()
            .filter(|v| v.is_border())
            .map(|v| v.id)
            .collect()
    }

    /// First big edge whose chain contains both vertices, if any.
    pub fn find_big_edge(&self, v0: usize, v1: usize) -> Option<usize> {
        self.big_edges
            .iter()
            .position(|be| be.contains(v0) && be.contains(v1))
    }

    /// Cells flanking a big edge, sampled at its middle member edge.
    pub fn big_edge_cells(&self, index: usize) -> Vec<usize> {
        match self.big_edges.get(index) {
            Some(be) if !be.edges.is_empty() => {
                self.edge_cells(be.edges[be.edges.len() / 2])
            }
            _ => Vec::new(),
        }
    }

    // ── Derived geometry ───────────────────────────────────

    pub fn cell_area(&self, cell: usize) -> Result<f64, EpiforceError> {
        let c = self
            .cells
            .get(&cell)
            .ok_or(EpiforceError::CellNotFound { cell })?;
        let n = c.vertices.len();
        let mut twice_area = 0.0;
        for i in 0..n {
            let (x1, y1) = self.position(c.vertices[i])?;
            let (x2, y2) = self.position(c.vertices[(i + 1) % n])?;
            twice_area += x1 * y2 - x2 * y1;
        }
        Ok(twice_area.abs() / 2.0)
    }

    pub fn cell_perimeter(&self, cell: usize) -> Result<f64, EpiforceError> {
        let c = self
            .cells
            .get(&cell)
            .ok_or(EpiforceError::CellNotFound { cell })?;
        let n = c.vertices.len();
        let mut perimeter = 0.0;
        for i in 0..n {
            let (x1, y1) = self.position(c.vertices[i])?;
            let (x2, y2) = self.position(c.vertices[(i + 1) % n])?;
            perimeter += ((x2 - x1).powi(2) + (y2 - y1).powi(2)).sqrt();
        }
        Ok(perimeter)
    }

    pub fn cell_centroid(&self, cell: usize) -> Result<(f64, f64), EpiforceError> {
        let c = self
            .cells
            .get(&cell)
            .ok_or(EpiforceError::CellNotFound { cell })?;
        let mut cx = 0.0;
        let mut cy = 0.0;
        for &vid in &c.vertices {
            let (x, y) = self.position(vid)?;
            cx += x;
            cy += y;
        }
        let n = c.vertices.len() as f64;
        Ok((cx / n, cy / n))
    }

    /// Mean vertex position; origin for an empty frame.
    pub fn centroid(&self) -> (f64, f64) {
        if self.vertices.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.vertices.len() as f64;
        let (sx, sy) = self
            .vertices
            .values()
            .fold((0.0, 0.0), |(sx, sy), v| (sx + v.x, sy + v.y));
        (sx / n, sy / n)
    }

    /// Diagonal of the axis-aligned bounding box of all vertices.
    pub fn bounding_diagonal(&self) -> f64 {
        let mut min = (f64::INFINITY, f64::INFINITY);
        let mut max = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for v in self.vertices.values() {
            min = (min.0.min(v.x), min.1.min(v.y));
            max = (max.0.max(v.x), max.1.max(v.y));
        }
        if self.vertices.is_empty() {
            0.0
        } else {
            ((max.0 - min.0).powi(2) + (max.1 - min.1).powi(2)).sqrt()
        }
    }

    /// Signed curvature of a big edge, sampled at three chain points.
    ///
    /// Positive curvature means the chain turns left walking from its
    /// first toward its last vertex.  Chains of a single edge, and
    /// degenerate samples, are straight (zero).
    pub fn big_edge_curvature(&self, index: usize) -> Result<f64, EpiforceError> {
        let be = self.big_edges.get(index).ok_or_else(|| {
            EpiforceError::Inconsistent(format!("missing big edge {index}"))
        })?;
        let pts = &be.vertices;
        let (i0, i1, i2) = if be.is_closed() {
            let unique = pts.len() - 1;
            if unique < 3 {
                return Ok(0.0);
            }
            (0, unique / 3, 2 * unique / 3)
        } else {
            if pts.len() < 3 {
                return Ok(0.0);
            }
            (0, pts.len() / 2, pts.len() - 1)
        };
        let p1 = self.position(pts[i0])?;
        let p2 = self.position(pts[i1])?;
        let p3 = self.position(pts[i2])?;
        let (ux, uy) = (p2.0 - p1.0, p2.1 - p1.1);
        let (vx, vy) = (p3.0 - p2.0, p3.1 - p2.1);
        let (wx, wy) = (p3.0 - p1.0, p3.1 - p1.1);
        let cross = ux * vy - uy * vx;
        let denominator = (ux * ux + uy * uy).sqrt()
            * (vx * vx + vy * vy).sqrt()
            * (wx * wx + wy * wy).sqrt();
        if denominator < 1e-12 {
            Ok(0.0)
        } else {
            Ok(2.0 * cross / denominator)
        }
    }

    // ── Results ────────────────────────────────────────────

    /// Spread solved big-edge tensions onto their member short edges.
    pub fn assign_edge_tensions(&mut self) {
        self.edge_tensions.clear();
        for (key, &tension) in &self.forces {
            if let ForceKey::Edge(index) = key {
                if let Some(be) = self.big_edges.get(*index) {
                    for &eid in &be.edges {
                        self.edge_tensions.insert(eid, tension);
                    }
                }
            }
        }
    }

    /// Tissue-scale 2x2 stress tensor from solved edge tensions
    /// (tension-weighted dyadic sum over edges, normalised by the total
    /// cell area).
    pub fn stress_tensor(&self) -> Result<Array2<f64>, EpiforceError> {
        if self.edge_tensions.is_empty() {
            return Err(EpiforceError::ForcesNotSolved { when: self.index });
        }
        let mut sigma = Array2::<f64>::zeros((2, 2));
        for (&eid, &tension) in &self.edge_tensions {
            let edge = self.edges.get(&eid).ok_or_else(|| {
                EpiforceError::Inconsistent(format!("missing edge {eid}"))
            })?;
            let (x1, y1) = self.position(edge.v1)?;
            let (x2, y2) = self.position(edge.v2)?;
            let (dx, dy) = (x2 - x1, y2 - y1);
            let len = (dx * dx + dy * dy).sqrt();
            if len == 0.0 {
                continue;
            }
            let f = tension / len;
            sigma[[0, 0]] += f * dx * dx;
            sigma[[0, 1]] += f * dx * dy;
            sigma[[1, 0]] += f * dy * dx;
            sigma[[1, 1]] += f * dy * dy;
        }
        let mut area = 0.0;
        for &cid in self.cells.keys() {
            area += self.cell_area(cid)?;
        }
        if area > 0.0 {
            sigma /= area;
        }
        Ok(sigma)
    }

    // ── Mutation ───────────────────────────────────────────

    /// Cascading cell removal.
    ///
    /// Vertices owned solely by this cell are orphans: they are removed
    /// together with every edge touching them.  The removal is
    /// all-or-nothing: attribution is validated for every orphan before
    /// any deletion, and the surviving tables are committed through
    /// [`Frame::reconstruct`].  Solved results are dropped, since they
    /// refer to the old topology.
    pub fn remove_cell(&mut self, cell_id: usize) -> Result<(), EpiforceError> {
        let cell = self
            .cells
            .get(&cell_id)
            .ok_or(EpiforceError::CellNotFound { cell: cell_id })?;

        let mut orphan_vertices = BTreeSet::new();
        let mut orphan_edges = BTreeSet::new();
        for &vid in &cell.vertices {
            let vertex = self.vertices.get(&vid).ok_or_else(|| {
                EpiforceError::Inconsistent(format!(
                    "cell {cell_id} references missing vertex {vid}"
                ))
            })?;
            if vertex.own_cells.len() < 2 {
                if vertex.own_cells != [cell_id] {
                    return Err(EpiforceError::Inconsistent(format!(
                        "vertex {vid} incorrectly placed in cell {cell_id}"
                    )));
                }
                orphan_vertices.insert(vid);
                orphan_edges.extend(vertex.own_edges.iter().copied());
            }
        }

        let mut vertices = self.vertices.clone();
        let mut edges = self.edges.clone();
        let mut cells = self.cells.clone();
        for eid in &orphan_edges {
            edges.remove(eid);
        }
        for vid in &orphan_vertices {
            vertices.remove(vid);
        }
        cells.remove(&cell_id);

        *self = Self::reconstruct(
            self.index,
            vertices,
            edges,
            cells,
            self.time,
            self.gt,
            self.surface_evolver,
        )?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Big-edge chain walking
// ─────────────────────────────────────────────────────────────

/// Collect maximal chains between junctions (vertices of degree != 2).
///
/// Each chain is discovered once: edges are consumed as they are walked.
/// Components with no junction at all (pure cycles) are walked from the
/// smaller endpoint of their smallest unvisited edge.
fn build_big_edges(
    vertices: &BTreeMap<usize, Vertex>,
    edges: &BTreeMap<usize, Edge>,
) -> Vec<BigEdge> {
    let is_junction = |id: usize| vertices.get(&id).map(|v| v.degree() != 2).unwrap_or(true);
    let mut visited: BTreeSet<usize> = BTreeSet::new();
    let mut out = Vec::new();

    let walk = |start: usize, first_edge: usize, visited: &mut BTreeSet<usize>| {
        let mut chain_vertices = vec![start];
        let mut chain_edges = Vec::new();
        let mut current = start;
        let mut eid = first_edge;
        loop {
            visited.insert(eid);
            chain_edges.push(eid);
            let next = edges[&eid].opposite(current);
            chain_vertices.push(next);
            if is_junction(next) || next == start {
                break;
            }
            let Some(&continuation) = vertices[&next]
                .own_edges
                .iter()
                .find(|&&candidate| candidate != eid)
            else {
                break;
            };
            current = next;
            eid = continuation;
        }
        BigEdge { vertices: chain_vertices, edges: chain_edges }
    };

    for (&vid, vertex) in vertices {
        if !is_junction(vid) {
            continue;
        }
        for &eid in &vertex.own_edges {
            if !visited.contains(&eid) {
                out.push(walk(vid, eid, &mut visited));
            }
        }
    }

    // Pure cycles: every remaining edge joins two degree-2 vertices.
    for (&eid, edge) in edges {
        if !visited.contains(&eid) {
            out.push(walk(edge.v1.min(edge.v2), eid, &mut visited));
        }
    }

    out
}
