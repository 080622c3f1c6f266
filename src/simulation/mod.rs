//! Simulation orchestrator: the time loop, the retry cascade and the
//! state machine tying the numerical components together.
//!
//! One step flows through the layers strictly once: model evaluation, time
//! step proposal, coefficient assembly and solve, invariant check, optional
//! sawtooth pass, commit, snapshot. On a failed solve the step is retried at
//! half the step size until it succeeds or the retry floor is hit. Profiles
//! are replaced, never mutated, so a failed attempt leaves the committed
//! state untouched.

pub mod conservation;
pub mod fvm;
pub mod linalg;
pub mod mesh;
pub mod models;
pub mod profiles;
pub mod sawtooth;
pub mod solver;
pub mod timestep;

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::consts::N_FLOOR;
use crate::errors::*;
use crate::output::{Control, RunStatus, RunSummary, Sampler, Snapshot};
use crate::settings::{check_settings, ProfileShape, Settings};
use crate::simulation::mesh::Mesh;
use crate::simulation::models::{
    evaluate_transport, PedestalModel, SourceModel, TransportModel,
};
use crate::simulation::profiles::{CoreProfiles, FaceConstraint, Field, Profile, ALL_FIELDS};
use crate::simulation::sawtooth::SawtoothOperator;
use crate::simulation::solver::{FieldRefs, StepContext, TransportSolver};

/// Cooperative cancellation token, checked between steps and between retry
/// attempts. A cancelled run returns its partial result; no step is ever
/// half-committed.
pub type CancelToken = Arc<AtomicBool>;

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initialized,
    Stepping,
    AwaitingRetry,
    SawtoothPhase,
    Completed,
    Failed,
}

struct SimulationState {
    profiles: CoreProfiles,
    /// Simulation time [s]. Double precision on purpose: the profile arrays
    /// are single precision, but summing 1e4+ steps in f32 drifts visibly.
    time: f64,
    /// Last successful step size [s]; the growth cap is relative to this.
    dt: f64,
    step: usize,
}

/// A configured transport simulation.
pub struct Simulation {
    settings: Settings,
    mesh: Mesh,
    transport: Box<dyn TransportModel>,
    sources: Box<dyn SourceModel>,
    pedestal: Option<Box<dyn PedestalModel>>,
    solver: TransportSolver,
    sawtooth: SawtoothOperator,
    refs: FieldRefs,
    cancel: CancelToken,
    phase: Phase,
    state: SimulationState,
    total_retries: usize,
    total_crashes: usize,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("phase", &self.phase)
            .field("total_retries", &self.total_retries)
            .field("total_crashes", &self.total_crashes)
            .finish_non_exhaustive()
    }
}

impl Simulation {
    /// Validate the configuration, build the mesh and realize the initial
    /// profiles. Everything that can be rejected is rejected here, not
    /// during the run.
    pub fn new(
        settings: Settings,
        transport: Box<dyn TransportModel>,
        sources: Box<dyn SourceModel>,
        pedestal: Option<Box<dyn PedestalModel>>,
    ) -> Result<Simulation> {
        check_settings(&settings)?;
        let mesh = Mesh::new(&settings.mesh)?;

        let realize = |shape: &ProfileShape, field: Field| -> Result<Profile> {
            let bc = settings.boundaries.field(field);
            Ok(Profile::new(shape.realize(&mesh)?, bc.left, bc.right))
        };
        let profiles = CoreProfiles {
            t_i: realize(&settings.initial.t_i, Field::IonTemperature)?,
            t_e: realize(&settings.initial.t_e, Field::ElectronTemperature)?,
            n_e: realize(&settings.initial.n_e, Field::ElectronDensity)?,
            psi: realize(&settings.initial.psi, Field::PoloidalFlux)?,
        };
        validate_initial_state(&profiles)?;

        let refs = FieldRefs::from_profiles(&profiles);
        let solver = TransportSolver::from_settings(&settings.solver);
        let sawtooth = SawtoothOperator::new(settings.sawtooth, settings.time.t_start);
        let state = SimulationState {
            profiles,
            time: settings.time.t_start,
            dt: settings.time.dt_initial,
            step: 0,
        };

        Ok(Simulation {
            settings,
            mesh,
            transport,
            sources,
            pedestal,
            solver,
            sawtooth,
            refs,
            cancel: Arc::new(AtomicBool::new(false)),
            phase: Phase::Initialized,
            state,
            total_retries: 0,
            total_crashes: 0,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn time(&self) -> f64 {
        self.state.time
    }

    pub fn profiles(&self) -> &CoreProfiles {
        &self.state.profiles
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Clone of the cancellation token; setting it stops the run at the next
    /// step or retry boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn summary(&self, status: RunStatus) -> RunSummary {
        RunSummary {
            status,
            steps: self.state.step,
            retries: self.total_retries,
            sawtooth_crashes: self.total_crashes,
            time: self.state.time,
            profiles: self.state.profiles.clone(),
        }
    }

    fn fail<T>(&mut self, e: Error) -> Result<T> {
        self.phase = Phase::Failed;
        Err(e)
    }

    /// Advance from `t_start` to `t_end`, handing every sampled snapshot to
    /// `observer`. Returning [`Control::Stop`] from the observer ends the run
    /// with a `Cancelled` status and the partial result.
    pub fn run<F>(&mut self, mut observer: F) -> Result<RunSummary>
    where
        F: FnMut(&Snapshot) -> Control,
    {
        let t_end = self.settings.time.t_end;
        let adaptive = self.settings.time.adaptive;
        let mut sampler = Sampler::new(self.settings.output.sampling);
        self.phase = Phase::Stepping;

        while t_end - self.state.time > 1e-12 {
            if self.cancelled() {
                info!("run cancelled at t = {:.6e} s", self.state.time);
                return Ok(self.summary(RunStatus::Cancelled));
            }

            if let Err(e) = self.apply_pedestal() {
                return self.fail(e);
            }

            // Transport at the committed state drives the step proposal.
            let tc = match evaluate_transport(
                self.transport.as_ref(),
                &self.state.profiles,
                &self.mesh,
                self.state.time,
            ) {
                Ok(tc) => tc,
                Err(e) => return self.fail(e),
            };
            let mut dt = timestep::propose_dt(
                &tc,
                &self.mesh,
                self.state.dt,
                self.settings.time.dt_initial,
                &adaptive,
            );
            let remaining = t_end - self.state.time;
            if dt > remaining {
                dt = remaining;
            }

            // Retry cascade: halve dt on non-convergence until the floor.
            let mut retries_this_step = 0;
            let outcome = loop {
                if self.cancelled() {
                    return Ok(self.summary(RunStatus::Cancelled));
                }
                let result = {
                    let ctx = StepContext {
                        mesh: &self.mesh,
                        old: &self.state.profiles,
                        transport: self.transport.as_ref(),
                        sources: self.sources.as_ref(),
                        physics: &self.settings.physics,
                        solver: &self.settings.solver,
                        equations: &self.settings.equations,
                        refs: &self.refs,
                        time: self.state.time,
                        dt,
                    };
                    self.solver.step(&ctx)
                };
                let outcome = match result {
                    Ok(o) => o,
                    Err(e) => return self.fail(e),
                };
                if outcome.converged() {
                    break outcome;
                }

                self.phase = Phase::AwaitingRetry;
                retries_this_step += 1;
                self.total_retries += 1;
                warn!(
                    "solver did not converge at dt = {:.4e} s ({} iterations, residual {:.3e}, failure {}); retrying",
                    dt,
                    outcome.iterations(),
                    outcome.residual(),
                    outcome
                        .failure()
                        .map(|f| f.to_string())
                        .unwrap_or_default()
                );
                let next_dt = dt / 2.;
                if next_dt < adaptive.dt_min || retries_this_step > self.settings.solver.n_retry {
                    let e = Error::from(ErrorKind::RetryExhausted(
                        next_dt,
                        self.state.step,
                        self.state.time,
                    ));
                    return self.fail(e);
                }
                dt = next_dt;
                self.phase = Phase::Stepping;
            };

            let iterations = outcome.iterations();
            let residual = outcome.residual();
            let mut new_profiles = outcome.into_profiles();
            new_profiles.apply_density_floor();
            let context = format!(
                "step {}, t = {:.6e} s, dt = {:.4e} s",
                self.state.step, self.state.time, dt
            );
            if let Err(e) = new_profiles.check_invariants(&context) {
                return self.fail(e);
            }

            let t_new = self.state.time + dt;
            if self.settings.sawtooth.enabled {
                self.phase = Phase::SawtoothPhase;
                match self.sawtooth.maybe_crash(&self.mesh, &new_profiles, t_new) {
                    Ok(Some((crashed, _record))) => {
                        new_profiles = crashed;
                        self.total_crashes += 1;
                    }
                    Ok(None) => {}
                    Err(e) => return self.fail(e),
                }
            }

            self.state.profiles = new_profiles;
            self.state.time = t_new;
            self.state.dt = dt;
            self.state.step += 1;
            self.phase = Phase::Stepping;

            if sampler.should_emit(self.state.step, self.state.time) {
                let snapshot = Snapshot {
                    step: self.state.step,
                    time: self.state.time,
                    dt,
                    iterations,
                    residual,
                    converged: true,
                    retries: retries_this_step,
                    profiles: self.state.profiles.clone(),
                };
                if observer(&snapshot) == Control::Stop {
                    info!("observer stopped the run at t = {:.6e} s", self.state.time);
                    return Ok(self.summary(RunStatus::Cancelled));
                }
            }
        }

        self.phase = Phase::Completed;
        Ok(self.summary(RunStatus::Completed))
    }

    /// Fold pedestal constraints into the edge boundary conditions.
    fn apply_pedestal(&mut self) -> Result<()> {
        let constraint = match &self.pedestal {
            Some(ped) => ped.compute(&self.state.profiles, &self.mesh, self.state.time)?,
            None => return Ok(()),
        };
        if let Some(v) = constraint.t_i {
            self.state.profiles.t_i.right = FaceConstraint::Dirichlet { value: v };
        }
        if let Some(v) = constraint.t_e {
            self.state.profiles.t_e.right = FaceConstraint::Dirichlet { value: v };
        }
        if let Some(v) = constraint.n_e {
            self.state.profiles.n_e.right = FaceConstraint::Dirichlet { value: v };
        }
        Ok(())
    }
}

fn validate_initial_state(p: &CoreProfiles) -> Result<()> {
    for &field in ALL_FIELDS.iter() {
        let prof = p.field(field);
        for (i, &v) in prof.values.iter().enumerate() {
            if !v.is_finite() {
                bail!(ErrorKind::InitialStateInvalid(format!(
                    "{} is not finite at cell {}",
                    field.label(),
                    i
                )));
            }
            if field.must_be_positive() && v <= 0. {
                bail!(ErrorKind::InitialStateInvalid(format!(
                    "{} must be strictly positive, got {} at cell {}",
                    field.label(),
                    v,
                    i
                )));
            }
        }
    }
    for (i, &v) in p.n_e.values.iter().enumerate() {
        if v < N_FLOOR {
            bail!(ErrorKind::InitialStateInvalid(format!(
                "n_e below the density floor at cell {}: {:e} < {:e}",
                i, v, N_FLOOR
            )));
        }
    }
    Ok(())
}
