//! Run configuration, defined externally in a TOML parameter file.
//!
//! The core consumes one merged `Settings` value. Hierarchical overriding
//! (command line over environment over file over defaults) is the job of the
//! embedding configuration layer, with one contract worth spelling out: if
//! that layer resolves providers in reverse registration order, the
//! last-added provider must be the highest-priority one, otherwise every
//! override silently inverts.
//!
//! Validation runs before a simulation is constructed; a bad parameter file
//! is a `ConfigurationInvalid` error at initialization, never a run-time
//! failure.

use serde_derive::{Deserialize, Serialize};
use std::fs::File;
use std::io::prelude::*;

use crate::errors::*;
use crate::simulation::mesh::{Geometry, Mesh};
use crate::simulation::profiles::{FaceConstraint, Field};
use crate::Float;
use ndarray::Array1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshSettings {
    pub n_cells: usize,
    /// Minor radius a [m].
    pub minor_radius: Float,
    /// Major radius R [m].
    pub major_radius: Float,
    /// Toroidal field on axis [T].
    pub b_toroidal: Float,
    pub geometry: Geometry,
}

impl Default for MeshSettings {
    fn default() -> MeshSettings {
        MeshSettings {
            n_cells: 25,
            minor_radius: 1.0,
            major_radius: 3.0,
            b_toroidal: 2.5,
            geometry: Geometry::Circular,
        }
    }
}

/// Physics constants the core owns directly. Everything richer comes in
/// through the transport and source models.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PhysicsSettings {
    /// Plasma resistivity [Ohm m] driving poloidal-flux diffusion.
    pub resistivity: Float,
    /// Ion-electron equipartition rate [1/s]; zero decouples the heat
    /// equations.
    pub exchange_rate: Float,
}

impl Default for PhysicsSettings {
    fn default() -> PhysicsSettings {
        PhysicsSettings {
            resistivity: 1e-7,
            exchange_rate: 0.,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AdaptiveDtSettings {
    /// When false the candidate step is always `dt_initial`; the growth cap
    /// and retry floor still apply.
    pub enabled: bool,
    /// Retry floor [s]; halving below this fails the run.
    pub dt_min: f64,
    /// Hard ceiling [s].
    pub dt_max: f64,
    /// Maximum ratio of consecutive committed steps.
    pub growth_cap: f64,
    /// Safety factor of the CFL bound.
    pub cfl_safety: f64,
    /// Diffusivity floor in the CFL denominator, for transportless setups.
    pub floor_diffusivity: f64,
}

impl Default for AdaptiveDtSettings {
    fn default() -> AdaptiveDtSettings {
        AdaptiveDtSettings {
            enabled: true,
            dt_min: 1e-5,
            dt_max: 1e-1,
            growth_cap: 1.2,
            cfl_safety: 0.9,
            floor_diffusivity: 1e-9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimeSettings {
    pub t_start: f64,
    pub t_end: f64,
    pub dt_initial: f64,
    pub adaptive: AdaptiveDtSettings,
}

impl Default for TimeSettings {
    fn default() -> TimeSettings {
        TimeSettings {
            t_start: 0.,
            t_end: 1.,
            dt_initial: 1e-3,
            adaptive: AdaptiveDtSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverMethod {
    Linear,
    NewtonRaphson,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LinearSolverSettings {
    /// Predictor-corrector iterations per step.
    pub inner_iterations: usize,
    /// Early-exit threshold on the relative change between iterations.
    pub tol: Float,
}

impl Default for LinearSolverSettings {
    fn default() -> LinearSolverSettings {
        LinearSolverSettings {
            inner_iterations: 2,
            tol: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NewtonSettings {
    pub max_iterations: usize,
    /// Bound on |J d + R| / |R| above which the linear solve is considered
    /// unreliable and the step aborts.
    pub linear_error_tol: f64,
    /// Smallest backtracking line-search step.
    pub min_line_search_step: f64,
    /// Per-variable absolute residual tolerances, expressed as the physical
    /// increment |R| dt of each field.
    pub tol_t_i: Float,
    pub tol_t_e: Float,
    pub tol_n_e: Float,
    pub tol_psi: Float,
}

impl Default for NewtonSettings {
    fn default() -> NewtonSettings {
        NewtonSettings {
            max_iterations: 30,
            linear_error_tol: 1e-3,
            min_line_search_step: (2f64).powi(-10),
            tol_t_i: 10.0,
            tol_t_e: 10.0,
            tol_n_e: 1e17,
            tol_psi: 1e-3,
        }
    }
}

impl NewtonSettings {
    pub fn tolerance(&self, field: Field) -> Float {
        match field {
            Field::IonTemperature => self.tol_t_i,
            Field::ElectronTemperature => self.tol_t_e,
            Field::ElectronDensity => self.tol_n_e,
            Field::PoloidalFlux => self.tol_psi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SolverSettings {
    pub method: SolverMethod,
    /// Theta of the time discretization: 0 explicit, 1 implicit Euler,
    /// 0.5 Crank-Nicolson.
    pub theta: Float,
    /// Retry attempts before the cascade gives up.
    pub n_retry: usize,
    /// Artificial stabilizing diffusivity [m^2/s] for the predictor-corrector
    /// solve; `None` disables the term.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pereverzev_chi: Option<Float>,
    pub linear: LinearSolverSettings,
    pub newton: NewtonSettings,
}

impl Default for SolverSettings {
    fn default() -> SolverSettings {
        SolverSettings {
            method: SolverMethod::Linear,
            theta: 1.0,
            n_retry: 5,
            pereverzev_chi: None,
            linear: LinearSolverSettings::default(),
            newton: NewtonSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldBoundary {
    pub left: FaceConstraint,
    pub right: FaceConstraint,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BoundarySettings {
    pub t_i: FieldBoundary,
    pub t_e: FieldBoundary,
    pub n_e: FieldBoundary,
    pub psi: FieldBoundary,
}

impl BoundarySettings {
    pub fn field(&self, f: Field) -> FieldBoundary {
        match f {
            Field::IonTemperature => self.t_i,
            Field::ElectronTemperature => self.t_e,
            Field::ElectronDensity => self.n_e,
            Field::PoloidalFlux => self.psi,
        }
    }
}

impl Default for BoundarySettings {
    fn default() -> BoundarySettings {
        let axis = FaceConstraint::Neumann { gradient: 0. };
        BoundarySettings {
            t_i: FieldBoundary {
                left: axis,
                right: FaceConstraint::Dirichlet { value: 100. },
            },
            t_e: FieldBoundary {
                left: axis,
                right: FaceConstraint::Dirichlet { value: 100. },
            },
            n_e: FieldBoundary {
                left: axis,
                right: FaceConstraint::Dirichlet { value: 1e19 },
            },
            psi: FieldBoundary {
                left: axis,
                right: FaceConstraint::Neumann { gradient: 1. },
            },
        }
    }
}

/// Initial-condition shape of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ProfileShape {
    Constant {
        value: Float,
    },
    /// `edge + (axis - edge) (1 - rho^2)^peaking`.
    Parabolic {
        axis: Float,
        edge: Float,
        #[serde(default = "default_peaking")]
        peaking: Float,
    },
    Linear {
        axis: Float,
        edge: Float,
    },
    /// Explicit cell-center values; the length must match the mesh.
    Tabulated {
        values: Vec<Float>,
    },
}

fn default_peaking() -> Float {
    1.0
}

impl ProfileShape {
    pub fn realize(&self, mesh: &Mesh) -> Result<Array1<Float>> {
        let n = mesh.n_cells();
        match self {
            ProfileShape::Constant { value } => Ok(Array1::from_elem(n, *value)),
            ProfileShape::Parabolic {
                axis,
                edge,
                peaking,
            } => Ok(Array1::from_shape_fn(n, |i| {
                let r = mesh.rho()[i];
                edge + (axis - edge) * (1. - r * r).max(0.).powf(*peaking)
            })),
            ProfileShape::Linear { axis, edge } => Ok(Array1::from_shape_fn(n, |i| {
                axis + (edge - axis) * mesh.rho()[i]
            })),
            ProfileShape::Tabulated { values } => {
                if values.len() != n {
                    bail!(ErrorKind::ConfigurationInvalid(format!(
                        "tabulated initial profile has {} values, mesh has {} cells",
                        values.len(),
                        n
                    )));
                }
                Ok(Array1::from_vec(values.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InitialSettings {
    pub t_i: ProfileShape,
    pub t_e: ProfileShape,
    pub n_e: ProfileShape,
    pub psi: ProfileShape,
}

impl Default for InitialSettings {
    fn default() -> InitialSettings {
        InitialSettings {
            t_i: ProfileShape::Parabolic {
                axis: 5000.,
                edge: 100.,
                peaking: 1.,
            },
            t_e: ProfileShape::Parabolic {
                axis: 5000.,
                edge: 100.,
                peaking: 1.,
            },
            n_e: ProfileShape::Parabolic {
                axis: 1e20,
                edge: 1e19,
                peaking: 1.,
            },
            psi: ProfileShape::Parabolic {
                axis: 0.,
                edge: 1.,
                peaking: 1.,
            },
        }
    }
}

/// Which equations are advanced; the rest stay at their initial profiles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EvolvedEquations {
    pub t_i: bool,
    pub t_e: bool,
    pub n_e: bool,
    pub psi: bool,
}

impl Default for EvolvedEquations {
    fn default() -> EvolvedEquations {
        EvolvedEquations {
            t_i: true,
            t_e: true,
            n_e: true,
            psi: true,
        }
    }
}

impl EvolvedEquations {
    pub fn contains(&self, f: Field) -> bool {
        match f {
            Field::IonTemperature => self.t_i,
            Field::ElectronTemperature => self.t_e,
            Field::ElectronDensity => self.n_e,
            Field::PoloidalFlux => self.psi,
        }
    }

    pub fn fields(&self) -> Vec<Field> {
        crate::simulation::profiles::ALL_FIELDS
            .iter()
            .cloned()
            .filter(|f| self.contains(*f))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SawtoothSettings {
    pub enabled: bool,
    /// The q=1 surface must sit outside this radius to trigger.
    pub rho_min: Float,
    /// Critical magnetic shear at the q=1 surface.
    pub shear_crit: Float,
    /// Minimum time between crashes [s].
    pub min_interval: f64,
    /// Mixing radius as a multiple of the q=1 radius.
    pub mixing_factor: Float,
    /// Post-crash axis value as a multiple of the q=1 value.
    pub flattening_factor: Float,
    /// Core flux-gradient reduction factor.
    pub psi_relax: Float,
}

impl Default for SawtoothSettings {
    fn default() -> SawtoothSettings {
        SawtoothSettings {
            enabled: false,
            rho_min: 0.2,
            shear_crit: 0.2,
            min_interval: 0.01,
            mixing_factor: 1.5,
            flattening_factor: 1.01,
            psi_relax: 0.8,
        }
    }
}

/// Snapshot sampling policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SamplingSettings {
    EveryStep,
    EveryNthStep { n: usize },
    EverySeconds { interval: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OutputSettings {
    /// Forwarded to the array kernel's memory cache; the plain CPU kernel
    /// ignores it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_limit: Option<usize>,
    pub sampling: SamplingSettings,
}

impl Default for OutputSettings {
    fn default() -> OutputSettings {
        OutputSettings {
            cache_limit: None,
            sampling: SamplingSettings::EveryStep,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    pub mesh: MeshSettings,
    pub physics: PhysicsSettings,
    pub time: TimeSettings,
    pub solver: SolverSettings,
    pub boundaries: BoundarySettings,
    pub initial: InitialSettings,
    pub equations: EvolvedEquations,
    pub sawtooth: SawtoothSettings,
    pub output: OutputSettings,
}

fn read_from_file(filename: &str) -> Result<String> {
    let mut f = File::open(filename).chain_err(|| "Unable to open parameter file.")?;
    let mut content = String::new();
    f.read_to_string(&mut content)
        .chain_err(|| "Unable to read parameter file.")?;
    Ok(content)
}

/// Read and validate a TOML parameter file.
pub fn read_parameter_file(param_file: &str) -> Result<Settings> {
    let toml_string = read_from_file(param_file)?;
    let settings: Settings =
        toml::from_str(&toml_string).chain_err(|| "Unable to parse parameter file.")?;
    check_settings(&settings)?;
    Ok(settings)
}

/// Validate a settings value. Everything rejected here is rejected before a
/// simulation exists.
pub fn check_settings(s: &Settings) -> Result<()> {
    macro_rules! invalid {
        ($($arg:tt)*) => {
            bail!(ErrorKind::ConfigurationInvalid(format!($($arg)*)))
        };
    }

    let t = &s.time;
    if !(t.t_end > t.t_start) {
        invalid!("time range is empty: t_start = {}, t_end = {}", t.t_start, t.t_end);
    }
    if !(t.dt_initial > 0. && t.dt_initial.is_finite()) {
        invalid!("dt_initial must be positive and finite, got {}", t.dt_initial);
    }
    let a = &t.adaptive;
    if !(a.dt_min > 0. && a.dt_max >= a.dt_min) {
        invalid!("dt bounds are not ordered: dt_min = {}, dt_max = {}", a.dt_min, a.dt_max);
    }
    if t.dt_initial < a.dt_min || t.dt_initial > a.dt_max {
        invalid!(
            "dt_initial = {} outside [dt_min, dt_max] = [{}, {}]",
            t.dt_initial, a.dt_min, a.dt_max
        );
    }
    if !(a.growth_cap > 1.) {
        invalid!("growth cap must exceed 1, got {}", a.growth_cap);
    }
    if !(a.cfl_safety > 0.) {
        invalid!("CFL safety factor must be positive, got {}", a.cfl_safety);
    }
    if !(a.floor_diffusivity > 0.) {
        invalid!("floor diffusivity must be positive, got {}", a.floor_diffusivity);
    }

    let sv = &s.solver;
    if !(0. ..=1.).contains(&sv.theta) {
        invalid!("theta must lie in [0, 1], got {}", sv.theta);
    }
    if sv.n_retry == 0 {
        invalid!("n_retry must be at least 1");
    }
    if sv.linear.inner_iterations == 0 {
        invalid!("inner_iterations must be at least 1");
    }
    if !(sv.linear.tol > 0.) {
        invalid!("linear solver tolerance must be positive, got {}", sv.linear.tol);
    }
    let nw = &sv.newton;
    if nw.max_iterations == 0 {
        invalid!("newton max_iterations must be at least 1");
    }
    if !(nw.linear_error_tol > 0.) {
        invalid!("linear_error_tol must be positive, got {}", nw.linear_error_tol);
    }
    if !(nw.min_line_search_step > 0. && nw.min_line_search_step < 1.) {
        invalid!("min_line_search_step must lie in (0, 1), got {}", nw.min_line_search_step);
    }
    for (name, tol) in [
        ("tol_t_i", nw.tol_t_i),
        ("tol_t_e", nw.tol_t_e),
        ("tol_n_e", nw.tol_n_e),
        ("tol_psi", nw.tol_psi),
    ]
    .iter()
    {
        if !(*tol > 0.) {
            invalid!("{} must be positive, got {}", name, tol);
        }
    }
    if let Some(chi) = sv.pereverzev_chi {
        if !(chi > 0. && chi.is_finite()) {
            invalid!("pereverzev_chi must be positive and finite, got {}", chi);
        }
    }

    if !(s.physics.resistivity >= 0. && s.physics.resistivity.is_finite()) {
        invalid!("resistivity must be non-negative, got {}", s.physics.resistivity);
    }
    if !(s.physics.exchange_rate >= 0. && s.physics.exchange_rate.is_finite()) {
        invalid!("exchange_rate must be non-negative, got {}", s.physics.exchange_rate);
    }

    let st = &s.sawtooth;
    if st.enabled {
        if !(st.rho_min > 0. && st.rho_min < 1.) {
            invalid!("sawtooth rho_min must lie in (0, 1), got {}", st.rho_min);
        }
        if !(st.mixing_factor > 1.) {
            invalid!("sawtooth mixing_factor must exceed 1, got {}", st.mixing_factor);
        }
        if !(st.flattening_factor >= 1.) {
            invalid!("sawtooth flattening_factor must be >= 1, got {}", st.flattening_factor);
        }
        if !(st.psi_relax > 0. && st.psi_relax <= 1.) {
            invalid!("sawtooth psi_relax must lie in (0, 1], got {}", st.psi_relax);
        }
        if !(st.min_interval >= 0.) {
            invalid!("sawtooth min_interval must be non-negative, got {}", st.min_interval);
        }
    }

    if let SamplingSettings::EveryNthStep { n } = s.output.sampling {
        if n == 0 {
            invalid!("sampling stride must be at least 1");
        }
    }
    if let SamplingSettings::EverySeconds { interval } = s.output.sampling {
        if !(interval > 0.) {
            invalid!("sampling interval must be positive, got {}", interval);
        }
    }

    Ok(())
}
