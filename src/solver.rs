//! Linear-algebra backend for the inference systems.
//!
//! Both inference problems are rectangular and rank-deficient by one
//! gauge degree of freedom (global tension scale, additive pressure
//! constant).  The gauge is fixed by an appended anchor row (sum of
//! unknowns) or by pinning one unknown, and the system is solved through
//! the Tikhonov-regularised normal equations.  An optional non-negative
//! refinement runs L-BFGS with a smooth softplus barrier.

use std::cell::RefCell;

use argmin::core::{CostFunction, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use sprs::{CsMat, CsMatView, FillInReduction, SymmetryCheck, TriMat};
use sprs_ldl::{Ldl, LdlNumeric};

use crate::types::{EpiforceError, SolverOptions};

// ─────────────────────────────────────────────────────────────
//  Factorisation
// ─────────────────────────────────────────────────────────────

/// Which symmetric factorisation a system needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorisationStrategy {
    /// SPD system: Cholesky, D > 0 validated.
    Cholesky,
    /// No definiteness guarantee: LDL.
    LDL,
}

impl FactorisationStrategy {
    /// Regularised normal equations are SPD whenever the Tikhonov term
    /// is strictly positive; without it the matrix may be singular on
    /// untouched unknowns.
    pub fn from_regularisation(tikhonov: f64) -> Self {
        if tikhonov > 0.0 {
            Self::Cholesky
        } else {
            Self::LDL
        }
    }
}

/// Holds a numeric LDL^T (or Cholesky) factorisation.
///
/// Both variants use `sprs-ldl`'s `LdlNumeric` internally.  The Cholesky
/// path validates D > 0; the LDL path allows indefinite D.
pub enum Factorization {
    Cholesky(LdlNumeric<f64, usize>),
    Ldl(LdlNumeric<f64, usize>),
}

impl std::fmt::Debug for Factorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cholesky(_) => write!(f, "Factorization::Cholesky(...)"),
            Self::Ldl(_) => write!(f, "Factorization::Ldl(...)"),
        }
    }
}

impl Factorization {
    pub fn new(
        a: CsMatView<f64>,
        strategy: FactorisationStrategy,
    ) -> Result<Self, sprs::errors::LinalgError> {
        let ldl = Ldl::new()
            .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
            .check_symmetry(SymmetryCheck::DontCheckSymmetry)
            .numeric(a)?;
        match strategy {
            FactorisationStrategy::Cholesky => {
                for (i, &di) in ldl.d().iter().enumerate() {
                    if di <= 0.0 {
                        return Err(sprs::errors::LinalgError::SingularMatrix(
                            sprs::errors::SingularMatrixInfo {
                                index: i,
                                reason: "D <= 0 in Cholesky factorization (not SPD)",
                            },
                        ));
                    }
                }
                Ok(Self::Cholesky(ldl))
            }
            FactorisationStrategy::LDL => Ok(Self::Ldl(ldl)),
        }
    }

    pub fn solve(&self, rhs: &[f64]) -> Vec<f64> {
        match self {
            Self::Cholesky(ldl) | Self::Ldl(ldl) => ldl.solve(rhs),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Sparse helpers
// ─────────────────────────────────────────────────────────────

/// AᵀA as CSC.
fn normal_matrix(a: &CsMat<f64>) -> CsMat<f64> {
    let a_t = a.transpose_view().to_csc();
    (&a_t * a).to_csc()
}

/// y = A x  for CSC `a`.
pub fn apply(a: &CsMat<f64>, x: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; a.rows()];
    for col in 0..a.cols() {
        let start = a.indptr().raw_storage()[col];
        let end = a.indptr().raw_storage()[col + 1];
        for nz in start..end {
            y[a.indices()[nz]] += a.data()[nz] * x[col];
        }
    }
    y
}

/// y = Aᵀ v  for CSC `a`.
pub fn transpose_apply(a: &CsMat<f64>, v: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; a.cols()];
    for col in 0..a.cols() {
        let start = a.indptr().raw_storage()[col];
        let end = a.indptr().raw_storage()[col + 1];
        for nz in start..end {
            y[col] += a.data()[nz] * v[a.indices()[nz]];
        }
    }
    y
}

// ─────────────────────────────────────────────────────────────
//  Gauge-fixed least squares
// ─────────────────────────────────────────────────────────────

/// Solve the regularised normal equations  (AᵀA + μI) x = Aᵀb.
fn solve_normal_equations(
    a: &CsMat<f64>,
    b: &[f64],
    tikhonov: f64,
) -> Result<Vec<f64>, EpiforceError> {
    let n = a.cols();
    let ata = normal_matrix(a);
    let atb = transpose_apply(a, b);

    let mut tri = TriMat::new((n, n));
    for col in 0..n {
        let start = ata.indptr().raw_storage()[col];
        let end = ata.indptr().raw_storage()[col + 1];
        for nz in start..end {
            tri.add_triplet(ata.indices()[nz], col, ata.data()[nz]);
        }
    }
    for i in 0..n {
        tri.add_triplet(i, i, tikhonov);
    }
    let system: CsMat<f64> = tri.to_csc();

    let strategy = FactorisationStrategy::from_regularisation(tikhonov);
    let factorization = Factorization::new(system.view(), strategy)?;
    Ok(factorization.solve(&atb))
}

/// Minimise ‖Ax − b‖² + μ‖x‖²  with the gauge fixed by an appended
/// anchor row  Σx = sum_target.
///
/// The anchor direction spans the nullspace the balance rows leave
/// free, so when those rows are exactly satisfiable the anchored
/// solution satisfies them and the sum exactly.
pub fn anchored_lstsq(
    a: &CsMat<f64>,
    b: &[f64],
    sum_target: f64,
    tikhonov: f64,
) -> Result<Vec<f64>, EpiforceError> {
    let n = a.cols();
    let mut tri = TriMat::new((a.rows() + 1, n));
    for col in 0..n {
        let start = a.indptr().raw_storage()[col];
        let end = a.indptr().raw_storage()[col + 1];
        for nz in start..end {
            tri.add_triplet(a.indices()[nz], col, a.data()[nz]);
        }
    }
    for i in 0..n {
        tri.add_triplet(a.rows(), i, 1.0);
    }
    let augmented: CsMat<f64> = tri.to_csc();

    let mut rhs = b.to_vec();
    rhs.push(sum_target);
    solve_normal_equations(&augmented, &rhs, tikhonov)
}

/// Minimise ‖Ax − b‖² + μ‖x‖²  with  x[pinned] = 0.
///
/// The pinned column drops out of the normal equations before
/// factorising; its unknown re-enters the solution as zero.
pub fn pinned_lstsq(
    a: &CsMat<f64>,
    b: &[f64],
    pinned: usize,
    tikhonov: f64,
) -> Result<Vec<f64>, EpiforceError> {
    let n = a.cols();
    let ata = normal_matrix(a);
    let atb = transpose_apply(a, b);
    let remap = |i: usize| if i < pinned { i } else { i - 1 };

    let mut tri = TriMat::new((n - 1, n - 1));
    for col in 0..n {
        if col == pinned {
            continue;
        }
        let start = ata.indptr().raw_storage()[col];
        let end = ata.indptr().raw_storage()[col + 1];
        for nz in start..end {
            let row = ata.indices()[nz];
            if row != pinned {
                tri.add_triplet(remap(row), remap(col), ata.data()[nz]);
            }
        }
    }
    for i in 0..n - 1 {
        tri.add_triplet(i, i, tikhonov);
    }
    let reduced: CsMat<f64> = tri.to_csc();

    let strategy = FactorisationStrategy::from_regularisation(tikhonov);
    let factorization = Factorization::new(reduced.view(), strategy)?;
    let rhs: Vec<f64> = (0..n).filter(|&i| i != pinned).map(|i| atb[i]).collect();
    let reduced_solution = factorization.solve(&rhs);

    let mut solution = Vec::with_capacity(n);
    for i in 0..n {
        if i == pinned {
            solution.push(0.0);
        } else {
            solution.push(reduced_solution[remap(i)]);
        }
    }
    Ok(solution)
}

// ─────────────────────────────────────────────────────────────
//  Softplus barrier
// ─────────────────────────────────────────────────────────────

/// Numerically stable log(1 + exp(z)).
#[inline]
fn log1pexp(z: f64) -> f64 {
    if z > 0.0 {
        z + (-z).exp().ln_1p()
    } else {
        z.exp().ln_1p()
    }
}

/// Smooth one-sided barrier.
/// `k < 0` penalises x < b; `k > 0` penalises x > b.
#[inline]
pub fn softplus(x: f64, b: f64, k: f64) -> f64 {
    log1pexp(-k * (b - x) - 1.0)
}

/// Derivative of `softplus` w.r.t. `x`.
#[inline]
pub fn softplus_grad(x: f64, b: f64, k: f64) -> f64 {
    let z = -k * (b - x) - 1.0;
    k / (1.0 + (-z).exp())
}

// ─────────────────────────────────────────────────────────────
//  Non-negative refinement (L-BFGS)
// ─────────────────────────────────────────────────────────────

/// Barrier-regularised least squares for tensions that must stay
/// non-negative:
///
///   ½‖Aλ − b‖²  +  w_b Σ softplus(λ_k)  +  ½ w_s (mean λ − target)²
///
/// argmin evaluates cost and gradient separately at the same λ each
/// iteration; the residual from the last evaluation is cached so the
/// sparse product runs once per unique λ.
struct NonNegativeLstsq<'a> {
    matrix: &'a CsMat<f64>,
    rhs: &'a [f64],
    options: &'a SolverOptions,
    last_residual: RefCell<Option<(Vec<f64>, Vec<f64>)>>,
}

impl NonNegativeLstsq<'_> {
    fn residual(&self, lambda: &[f64]) -> Vec<f64> {
        {
            let cached = self.last_residual.borrow();
            if let Some((ref param, ref residual)) = *cached {
                if param == lambda {
                    return residual.clone();
                }
            }
        }
        let mut residual = apply(self.matrix, lambda);
        for (r, b) in residual.iter_mut().zip(self.rhs) {
            *r -= b;
        }
        *self.last_residual.borrow_mut() = Some((lambda.to_vec(), residual.clone()));
        residual
    }

    fn mean_gap(&self, lambda: &[f64]) -> f64 {
        let n = lambda.len().max(1) as f64;
        lambda.iter().sum::<f64>() / n - self.options.scale_target
    }
}

impl CostFunction for NonNegativeLstsq<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, lambda: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let residual = self.residual(lambda);
        let fit: f64 = residual.iter().map(|r| r * r).sum::<f64>() / 2.0;
        let barrier: f64 = lambda
            .iter()
            .map(|&l| softplus(l, 0.0, -self.options.barrier_sharpness))
            .sum();
        let gap = self.mean_gap(lambda);
        Ok(fit + self.options.barrier_weight * barrier
            + self.options.scale_weight * gap * gap / 2.0)
    }
}

impl Gradient for NonNegativeLstsq<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, lambda: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        let residual = self.residual(lambda);
        let mut gradient = transpose_apply(self.matrix, &residual);
        let n = lambda.len().max(1) as f64;
        let gap_term = self.options.scale_weight * self.mean_gap(lambda) / n;
        for (g, &l) in gradient.iter_mut().zip(lambda) {
            *g += self.options.barrier_weight
                * softplus_grad(l, 0.0, -self.options.barrier_sharpness)
                + gap_term;
        }
        Ok(gradient)
    }
}

/// Run the non-negative refinement from `seed`.  Residual negatives left
/// by the soft barrier are clamped to zero on the way out.
pub fn solve_non_negative(
    a: &CsMat<f64>,
    b: &[f64],
    seed: Vec<f64>,
    options: &SolverOptions,
) -> Result<Vec<f64>, EpiforceError> {
    let problem = NonNegativeLstsq {
        matrix: a,
        rhs: b,
        options,
        last_residual: RefCell::new(None),
    };

    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, 10);
    let executor = Executor::new(problem, solver).configure(|config| {
        config
            .param(seed)
            .max_iters(options.max_iterations as u64)
            .target_cost(f64::NEG_INFINITY)
    });

    let result = executor.run()?;
    let best = result
        .state()
        .get_best_param()
        .cloned()
        .ok_or_else(|| EpiforceError::Solver("L-BFGS returned no best parameters".into()))?;
    Ok(best.into_iter().map(|l| l.max(0.0)).collect())
}
