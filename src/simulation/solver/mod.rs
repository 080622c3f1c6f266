//! Solvers for one theta-discretized time step.
//!
//! Both solvers consume the same [`StepContext`] and report a
//! [`SolverOutcome`]. Non-convergence is an ordinary outcome, never an error:
//! the orchestrator owns the retry decision and only reads the converged
//! flag, while the failure kind goes into diagnostics.

pub mod linear;
pub mod newton;

use ndarray::Array1;
use std::fmt;

use crate::errors::*;
use crate::settings::{
    EvolvedEquations, PhysicsSettings, SolverMethod, SolverSettings,
};
use crate::simulation::fvm::{DiscreteOperator, EquationCoefficients};
use crate::simulation::linalg::solve_tridiagonal;
use crate::simulation::mesh::Mesh;
use crate::simulation::models::{
    evaluate_sources, evaluate_transport, SourceModel, SourceTerms, TransportCoefficients,
    TransportModel,
};
use crate::simulation::profiles::{CoreProfiles, Field};
use crate::Float;

pub use self::linear::LinearSolver;
pub use self::newton::NewtonSolver;

/// Why a solve attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    LinearSolverError,
    InvalidDescent,
    MaxIterations,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            FailureKind::LinearSolverError => "linear_solver_error",
            FailureKind::InvalidDescent => "invalid_descent",
            FailureKind::MaxIterations => "max_iterations",
        };
        write!(f, "{}", s)
    }
}

/// Result of one solve attempt.
#[derive(Debug, Clone)]
pub enum SolverOutcome {
    Converged {
        profiles: CoreProfiles,
        iterations: usize,
        residual: Float,
    },
    NotConverged {
        profiles: CoreProfiles,
        iterations: usize,
        residual: Float,
        failure: FailureKind,
    },
}

impl SolverOutcome {
    pub fn converged(&self) -> bool {
        matches!(self, SolverOutcome::Converged { .. })
    }

    pub fn iterations(&self) -> usize {
        match self {
            SolverOutcome::Converged { iterations, .. }
            | SolverOutcome::NotConverged { iterations, .. } => *iterations,
        }
    }

    pub fn residual(&self) -> Float {
        match self {
            SolverOutcome::Converged { residual, .. }
            | SolverOutcome::NotConverged { residual, .. } => *residual,
        }
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            SolverOutcome::Converged { .. } => None,
            SolverOutcome::NotConverged { failure, .. } => Some(*failure),
        }
    }

    pub fn into_profiles(self) -> CoreProfiles {
        match self {
            SolverOutcome::Converged { profiles, .. }
            | SolverOutcome::NotConverged { profiles, .. } => profiles,
        }
    }
}

/// Per-field reference magnitudes for the scaled Newton state. Established
/// once at initialization from the initial profiles; the fields of this
/// problem span twenty orders of magnitude and an unscaled Jacobian is
/// numerically hopeless in single precision.
#[derive(Debug, Clone, Copy)]
pub struct FieldRefs {
    pub t_i: f64,
    pub t_e: f64,
    pub n_e: f64,
    pub psi: f64,
}

impl FieldRefs {
    pub fn from_profiles(p: &CoreProfiles) -> FieldRefs {
        fn scale(values: &Array1<Float>, floor: f64) -> f64 {
            let m = values.iter().fold(0f64, |acc, &v| acc.max(v.abs() as f64));
            m.max(floor)
        }
        FieldRefs {
            t_i: scale(&p.t_i.values, 1.),
            t_e: scale(&p.t_e.values, 1.),
            n_e: scale(&p.n_e.values, 1e18),
            psi: scale(&p.psi.values, 1e-3),
        }
    }

    pub fn get(&self, f: Field) -> f64 {
        match f {
            Field::IonTemperature => self.t_i,
            Field::ElectronTemperature => self.t_e,
            Field::ElectronDensity => self.n_e,
            Field::PoloidalFlux => self.psi,
        }
    }
}

/// Everything a solver needs for one attempt at one step.
pub struct StepContext<'a> {
    pub mesh: &'a Mesh,
    /// Committed state, including the effective face constraints.
    pub old: &'a CoreProfiles,
    pub transport: &'a dyn TransportModel,
    pub sources: &'a dyn SourceModel,
    pub physics: &'a PhysicsSettings,
    pub solver: &'a SolverSettings,
    pub equations: &'a EvolvedEquations,
    pub refs: &'a FieldRefs,
    pub time: f64,
    pub dt: f64,
}

impl<'a> StepContext<'a> {
    /// Evaluate both models at a profile state.
    pub fn evaluate(
        &self,
        profiles: &CoreProfiles,
    ) -> Result<(TransportCoefficients, SourceTerms)> {
        let tc = evaluate_transport(self.transport, profiles, self.mesh, self.time)?;
        let src = evaluate_sources(self.sources, profiles, self.mesh, self.time)?;
        Ok((tc, src))
    }
}

/// Solve one theta-weighted step of a single equation:
///
/// ```text
/// (alpha/dt - theta (M_new + Si_new)) P = alpha/dt P^n
///     + (1 - theta) (M_old P^n + b_old + Si_old P^n + Se_old)
///     + theta (b_new + Se_new)
/// ```
///
/// Returns `None` when the tridiagonal solve fails, leaving the retry
/// decision to the caller.
pub(crate) fn solve_theta_step(
    eq_new: &EquationCoefficients,
    op_new: &DiscreteOperator,
    eq_old: &EquationCoefficients,
    op_old: &DiscreteOperator,
    pn: &Array1<Float>,
    dt: Float,
    theta: Float,
) -> Option<Array1<Float>> {
    let n = pn.len();
    let mut lower = Array1::zeros(n);
    let mut diag = Array1::zeros(n);
    let mut upper = Array1::zeros(n);
    let mut rhs = Array1::zeros(n);

    let explicit_old = op_old.apply(pn);
    for i in 0..n {
        let alpha_dt = eq_new.transient[i] / dt;
        lower[i] = -theta * op_new.lower[i];
        diag[i] = alpha_dt - theta * (op_new.diag[i] + eq_new.source_implicit[i]);
        upper[i] = -theta * op_new.upper[i];
        rhs[i] = alpha_dt * pn[i]
            + (1. - theta)
                * (explicit_old[i] + eq_old.source_implicit[i] * pn[i] + eq_old.source_explicit[i])
            + theta * (op_new.boundary_source[i] + eq_new.source_explicit[i]);
    }
    solve_tridiagonal(&lower, &diag, &upper, &rhs)
}

/// Solver selection, fixed at configuration time.
pub enum TransportSolver {
    Linear(LinearSolver),
    Newton(NewtonSolver),
}

impl TransportSolver {
    pub fn from_settings(s: &SolverSettings) -> TransportSolver {
        match s.method {
            SolverMethod::Linear => TransportSolver::Linear(LinearSolver),
            SolverMethod::NewtonRaphson => TransportSolver::Newton(NewtonSolver),
        }
    }

    pub fn step(&self, ctx: &StepContext) -> Result<SolverOutcome> {
        match self {
            TransportSolver::Linear(s) => s.step(ctx),
            TransportSolver::Newton(s) => s.step(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn field_refs_are_floored_and_field_wise() {
        use crate::simulation::profiles::{FaceConstraint, Profile};
        let bc = FaceConstraint::Neumann { gradient: 0. };
        let mk = |v: Float| Profile::new(Array1::from_elem(4, v), bc, bc);
        let p = CoreProfiles {
            t_i: mk(2000.),
            t_e: mk(0.),
            n_e: mk(1e20),
            psi: mk(0.),
        };
        let r = FieldRefs::from_profiles(&p);
        assert_eq!(r.t_i, 2000.);
        assert_eq!(r.t_e, 1.);
        assert_eq!(r.n_e, 1e20);
        assert_eq!(r.psi, 1e-3);
    }

    #[test]
    fn theta_step_with_zero_operator_is_identity() {
        let n = 8;
        let eq = EquationCoefficients {
            transient: Array1::ones(n),
            diffusion: Array1::zeros(n + 1),
            convection: Array1::zeros(n + 1),
            source_explicit: Array1::zeros(n),
            source_implicit: Array1::zeros(n),
        };
        let op = DiscreteOperator {
            lower: Array1::zeros(n),
            diag: Array1::zeros(n),
            upper: Array1::zeros(n),
            boundary_source: Array1::zeros(n),
        };
        let pn = Array1::from_elem(n, 42.0f32);
        let p = solve_theta_step(&eq, &op, &eq, &op, &pn, 1e-3, 1.0).unwrap();
        for &v in p.iter() {
            assert_eq!(v, 42.0);
        }
    }
}
