//! Predictor-corrector solve of one theta step.
//!
//! The first pass solves the block system with coefficients frozen at the
//! committed state; each further inner iteration re-evaluates transport and
//! sources at the latest iterate and re-solves, which relaxes the mild
//! nonlinearity of coefficient feedback. The loop exits early once the
//! relative change between iterates drops below the configured tolerance.
//!
//! The optional Pereverzev term adds a large artificial diffusivity on the
//! implicit side together with a compensating convection built from the old
//! profile, so the extra flux vanishes identically at the old state and only
//! damps the step-to-step oscillation of stiff coefficient feedback.

use log::debug;
use ndarray::Array1;

use crate::consts::N_FLOOR;
use crate::errors::*;
use crate::simulation::fvm::{self, BlockCoefficients};
use crate::simulation::profiles::{relative_change, CoreProfiles, Field};
use crate::Float;

use super::{solve_theta_step, FailureKind, SolverOutcome, StepContext};

/// Relative change between iterates beyond which the solve is treated as
/// diverging.
const DIVERGENCE_LIMIT: Float = 1e2;

pub struct LinearSolver;

impl LinearSolver {
    pub fn step(&self, ctx: &StepContext) -> Result<SolverOutcome> {
        let mesh = ctx.mesh;
        let fields = ctx.equations.fields();
        let dt = ctx.dt as Float;
        let theta = ctx.solver.theta;

        let (tc0, src0) = ctx.evaluate(ctx.old)?;
        let mut blocks_old = fvm::assemble(mesh, ctx.old, &tc0, &src0, ctx.physics);
        let stabilizer = ctx
            .solver
            .pereverzev_chi
            .map(|chi| Stabilizer::new(ctx.old, mesh.drho(), chi, &fields));
        if let Some(st) = &stabilizer {
            st.apply(&mut blocks_old);
        }
        let ops_old: Vec<_> = fields
            .iter()
            .map(|&f| {
                let prof = ctx.old.field(f);
                fvm::discretize(mesh, blocks_old.equation(f), prof.left, prof.right)
            })
            .collect();

        let mut current = ctx.old.clone();
        let mut iterations = 0;
        let mut change = Float::INFINITY;

        for k in 0..ctx.solver.linear.inner_iterations {
            iterations = k + 1;
            let (tc, src) = if k == 0 {
                (tc0.clone(), src0.clone())
            } else {
                ctx.evaluate(&current)?
            };
            let mut blocks = fvm::assemble(mesh, &current, &tc, &src, ctx.physics);
            if let Some(st) = &stabilizer {
                st.apply(&mut blocks);
            }

            let mut next = current.clone();
            for (fi, &field) in fields.iter().enumerate() {
                let prof = ctx.old.field(field);
                let eq = blocks.equation(field);
                let op = fvm::discretize(mesh, eq, prof.left, prof.right);
                let solved = solve_theta_step(
                    eq,
                    &op,
                    blocks_old.equation(field),
                    &ops_old[fi],
                    &ctx.old.field(field).values,
                    dt,
                    theta,
                );
                match solved {
                    Some(values) => next.field_mut(field).values = values,
                    None => {
                        debug!(
                            "tridiagonal solve failed for {} at dt = {:.3e}",
                            field.label(),
                            ctx.dt
                        );
                        return Ok(SolverOutcome::NotConverged {
                            profiles: ctx.old.clone(),
                            iterations,
                            residual: Float::INFINITY,
                            failure: FailureKind::LinearSolverError,
                        });
                    }
                }
            }

            change = relative_change(&next, &current, &fields);
            current = next;
            if !change.is_finite() {
                return Ok(SolverOutcome::NotConverged {
                    profiles: ctx.old.clone(),
                    iterations,
                    residual: change,
                    failure: FailureKind::LinearSolverError,
                });
            }
            debug!(
                "predictor-corrector iteration {}: relative change {:.3e}",
                iterations, change
            );
            if change < ctx.solver.linear.tol {
                break;
            }
        }

        if change > DIVERGENCE_LIMIT {
            return Ok(SolverOutcome::NotConverged {
                profiles: ctx.old.clone(),
                iterations,
                residual: change,
                failure: FailureKind::MaxIterations,
            });
        }
        Ok(SolverOutcome::Converged {
            profiles: current,
            iterations,
            residual: change,
        })
    }
}

/// Precomputed Pereverzev arrays: the added diffusivity and its compensating
/// convection per stabilized equation. The heat equations carry a
/// density-weighted diffusivity, so the artificial term is weighted the same
/// way or it would be invisible next to the physical one.
struct Stabilizer {
    terms: Vec<(Field, Array1<Float>, Array1<Float>)>,
}

impl Stabilizer {
    fn new(old: &CoreProfiles, drho: Float, chi: Float, fields: &[Field]) -> Stabilizer {
        let n_e_faces = fvm::face_harmonic(&old.n_e.values);
        let mut terms = Vec::new();
        for &field in fields {
            // The flux equation is linear in psi; stabilizing it would only
            // distort the current diffusion.
            if field == Field::PoloidalFlux {
                continue;
            }
            let values = &old.field(field).values;
            let grad = fvm::face_gradient(values, drho);
            let mean = fvm::face_arithmetic(values);
            let floor = match field {
                Field::ElectronDensity => N_FLOOR,
                _ => 1.,
            };
            let d_add = match field {
                Field::ElectronDensity => Array1::from_elem(grad.len(), chi),
                _ => n_e_faces.mapv(|nf| nf * chi),
            };
            let v_add = Array1::from_shape_fn(grad.len(), |j| {
                d_add[j] * grad[j] / mean[j].max(floor)
            });
            terms.push((field, d_add, v_add));
        }
        Stabilizer { terms }
    }

    fn apply(&self, blocks: &mut BlockCoefficients) {
        for (field, d_add, v_add) in &self.terms {
            let eq = blocks.equation_mut(*field);
            for (d, &x) in eq.diffusion.iter_mut().zip(d_add.iter()) {
                *d += x;
            }
            for (v, &x) in eq.convection.iter_mut().zip(v_add.iter()) {
                *v += x;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{MeshSettings, Settings};
    use crate::simulation::mesh::{Geometry, Mesh};
    use crate::simulation::models::{ConstantTransport, NoSources};
    use crate::simulation::profiles::{FaceConstraint, Profile};
    use crate::simulation::solver::FieldRefs;

    fn mesh(n: usize) -> Mesh {
        Mesh::new(&MeshSettings {
            n_cells: n,
            minor_radius: 1.0,
            major_radius: 3.0,
            b_toroidal: 2.5,
            geometry: Geometry::Circular,
        })
        .unwrap()
    }

    fn uniform_profiles(n: usize, t: Float) -> CoreProfiles {
        let axis = FaceConstraint::Neumann { gradient: 0. };
        let t_bc = FaceConstraint::Dirichlet { value: t };
        let n_bc = FaceConstraint::Dirichlet { value: 1e20 };
        CoreProfiles {
            t_i: Profile::new(Array1::from_elem(n, t), axis, t_bc),
            t_e: Profile::new(Array1::from_elem(n, t), axis, t_bc),
            n_e: Profile::new(Array1::from_elem(n, 1e20), axis, n_bc),
            psi: Profile::new(
                Array1::from_shape_fn(n, |i| ((i as Float + 0.5) / n as Float).powi(2)),
                axis,
                FaceConstraint::Neumann { gradient: 2. },
            ),
        }
    }

    #[test]
    fn zero_dynamics_is_a_fixed_point() {
        let m = mesh(25);
        let old = uniform_profiles(25, 1000.);
        let mut settings = Settings::default();
        // No resistive flux diffusion either, so psi is frozen too.
        settings.physics.resistivity = 0.;
        let refs = FieldRefs::from_profiles(&old);
        let transport = ConstantTransport::none();
        let ctx = StepContext {
            mesh: &m,
            old: &old,
            transport: &transport,
            sources: &NoSources,
            physics: &settings.physics,
            solver: &settings.solver,
            equations: &settings.equations,
            refs: &refs,
            time: 0.,
            dt: 1e-3,
        };
        let out = LinearSolver.step(&ctx).unwrap();
        assert!(out.converged());
        assert!(out.residual() < 1e-5);
        let new = out.into_profiles();
        for i in 0..25 {
            let rel = (new.t_i.values[i] - 1000.).abs() / 1000.;
            assert!(rel < 1e-5, "cell {}: {}", i, new.t_i.values[i]);
        }
    }

    #[test]
    fn diffusion_relaxes_toward_the_edge_value() {
        let m = mesh(25);
        let mut old = uniform_profiles(25, 1000.);
        // Peaked ion temperature, flat boundary at 100 eV.
        old.t_i.values =
            Array1::from_shape_fn(25, |i| 100. + 4900. * (1. - m.rho()[i] * m.rho()[i]));
        old.t_i.right = FaceConstraint::Dirichlet { value: 100. };
        let mut settings = Settings::default();
        settings.equations.t_e = false;
        settings.equations.n_e = false;
        settings.equations.psi = false;
        let refs = FieldRefs::from_profiles(&old);
        let transport = ConstantTransport {
            chi_i: 1.,
            chi_e: 0.,
            d_n: 0.,
            v_n: 0.,
        };
        let ctx = StepContext {
            mesh: &m,
            old: &old,
            transport: &transport,
            sources: &NoSources,
            physics: &settings.physics,
            solver: &settings.solver,
            equations: &settings.equations,
            refs: &refs,
            time: 0.,
            dt: 1e-2,
        };
        let out = LinearSolver.step(&ctx).unwrap();
        assert!(out.converged());
        let new = out.into_profiles();
        // The axis cools, the untouched fields stay put.
        assert!(new.t_i.values[0] < old.t_i.values[0]);
        assert_eq!(new.t_e.values, old.t_e.values);
        assert_eq!(new.n_e.values, old.n_e.values);
    }

    #[test]
    fn nan_coefficients_surface_as_non_convergence() {
        struct PoisonedTransport;
        impl crate::simulation::models::TransportModel for PoisonedTransport {
            fn compute(
                &self,
                _: &CoreProfiles,
                mesh: &Mesh,
                _: f64,
            ) -> Result<crate::simulation::models::TransportCoefficients> {
                let mut c =
                    crate::simulation::models::TransportCoefficients::zeros(mesh.n_cells());
                c.chi_i.fill(Float::NAN);
                Ok(c)
            }
        }
        let m = mesh(16);
        let old = uniform_profiles(16, 1000.);
        let settings = Settings::default();
        let refs = FieldRefs::from_profiles(&old);
        let ctx = StepContext {
            mesh: &m,
            old: &old,
            transport: &PoisonedTransport,
            sources: &NoSources,
            physics: &settings.physics,
            solver: &settings.solver,
            equations: &settings.equations,
            refs: &refs,
            time: 0.,
            dt: 1e-3,
        };
        let out = LinearSolver.step(&ctx).unwrap();
        assert!(!out.converged());
        assert_eq!(out.failure(), Some(FailureKind::LinearSolverError));
        // The failed attempt hands back the committed state untouched.
        assert_eq!(out.into_profiles(), old);
    }

    #[test]
    fn pereverzev_term_leaves_the_fixed_point_alone() {
        let m = mesh(25);
        let old = uniform_profiles(25, 1000.);
        let mut settings = Settings::default();
        settings.solver.pereverzev_chi = Some(50.);
        let refs = FieldRefs::from_profiles(&old);
        let transport = ConstantTransport::none();
        let ctx = StepContext {
            mesh: &m,
            old: &old,
            transport: &transport,
            sources: &NoSources,
            physics: &settings.physics,
            solver: &settings.solver,
            equations: &settings.equations,
            refs: &refs,
            time: 0.,
            dt: 1e-3,
        };
        let out = LinearSolver.step(&ctx).unwrap();
        assert!(out.converged());
        let new = out.into_profiles();
        for i in 0..25 {
            let rel = (new.t_e.values[i] - 1000.).abs() / 1000.;
            assert!(rel < 1e-4, "cell {}: {}", i, new.t_e.values[i]);
        }
    }
}
