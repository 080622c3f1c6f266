//! Model interfaces and the containers they produce.
//!
//! Transport, source and pedestal physics live outside the core. A model is a
//! pure function of the current profiles, the mesh and the simulation time;
//! the orchestrator never retries a model and surfaces its errors verbatim.

use ndarray::Array1;
use serde_derive::{Deserialize, Serialize};

use crate::consts::MW_TO_EV;
use crate::errors::*;
use crate::simulation::mesh::Mesh;
use crate::simulation::profiles::CoreProfiles;
use crate::Float;

/// Face-centered transport coefficients, each of length `n_cells + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportCoefficients {
    /// Ion heat diffusivity [m^2/s].
    pub chi_i: Array1<Float>,
    /// Electron heat diffusivity [m^2/s].
    pub chi_e: Array1<Float>,
    /// Particle diffusivity [m^2/s].
    pub d_n: Array1<Float>,
    /// Particle pinch velocity [m/s], positive outward.
    pub v_n: Array1<Float>,
}

impl TransportCoefficients {
    pub fn zeros(n_cells: usize) -> TransportCoefficients {
        let f = || Array1::zeros(n_cells + 1);
        TransportCoefficients {
            chi_i: f(),
            chi_e: f(),
            d_n: f(),
            v_n: f(),
        }
    }

    fn check_shape(&self, n_cells: usize) -> Result<()> {
        let want = n_cells + 1;
        for (name, arr) in [
            ("chi_i", &self.chi_i),
            ("chi_e", &self.chi_e),
            ("d_n", &self.d_n),
            ("v_n", &self.v_n),
        ]
        .iter()
        {
            if arr.len() != want {
                bail!(ErrorKind::ModelFailure(
                    "transport",
                    format!("{} has length {}, want {} faces", name, arr.len(), want),
                ));
            }
        }
        Ok(())
    }

    /// Largest finite diffusivity, for the CFL bound. Non-finite entries are
    /// skipped so a misbehaving model degrades into a failed solve instead of
    /// a NaN time step.
    pub fn max_diffusivity(&self) -> Float {
        let mut m = 0f32;
        for arr in [&self.chi_i, &self.chi_e, &self.d_n].iter() {
            for &v in arr.iter() {
                if v.is_finite() && v > m {
                    m = v;
                }
            }
        }
        m
    }
}

/// Cell-centered source densities, each of length `n_cells`.
///
/// Heat sources are in MW/m^3, the particle source in m^-3/s, the flux source
/// in V (loop voltage density). Positive means into the plasma.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTerms {
    pub heat_i: Array1<Float>,
    pub heat_e: Array1<Float>,
    pub particles: Array1<Float>,
    pub flux: Array1<Float>,
}

impl SourceTerms {
    pub fn zeros(n_cells: usize) -> SourceTerms {
        let f = || Array1::zeros(n_cells);
        SourceTerms {
            heat_i: f(),
            heat_e: f(),
            particles: f(),
            flux: f(),
        }
    }

    fn check_shape(&self, n_cells: usize) -> Result<()> {
        for (name, arr) in [
            ("heat_i", &self.heat_i),
            ("heat_e", &self.heat_e),
            ("particles", &self.particles),
            ("flux", &self.flux),
        ]
        .iter()
        {
            if arr.len() != n_cells {
                bail!(ErrorKind::ModelFailure(
                    "source",
                    format!("{} has length {}, want {} cells", name, arr.len(), n_cells),
                ));
            }
        }
        Ok(())
    }

    /// Heat sources converted from MW/m^3 to eV/(m^3 s).
    pub fn heat_to_internal(&self) -> (Array1<Float>, Array1<Float>) {
        (
            self.heat_i.mapv(|s| s * MW_TO_EV),
            self.heat_e.mapv(|s| s * MW_TO_EV),
        )
    }
}

/// Replacement edge values a pedestal model imposes on the right boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PedestalConstraint {
    pub t_i: Option<Float>,
    pub t_e: Option<Float>,
    pub n_e: Option<Float>,
}

pub trait TransportModel: Send + Sync {
    fn compute(
        &self,
        profiles: &CoreProfiles,
        mesh: &Mesh,
        time: f64,
    ) -> Result<TransportCoefficients>;
}

pub trait SourceModel: Send + Sync {
    fn compute(&self, profiles: &CoreProfiles, mesh: &Mesh, time: f64) -> Result<SourceTerms>;
}

pub trait PedestalModel: Send + Sync {
    fn compute(
        &self,
        profiles: &CoreProfiles,
        mesh: &Mesh,
        time: f64,
    ) -> Result<PedestalConstraint>;
}

/// Evaluate the transport model and verify the shape contract.
pub fn evaluate_transport(
    model: &dyn TransportModel,
    profiles: &CoreProfiles,
    mesh: &Mesh,
    time: f64,
) -> Result<TransportCoefficients> {
    let c = model.compute(profiles, mesh, time)?;
    c.check_shape(mesh.n_cells())?;
    Ok(c)
}

/// Evaluate the source model and verify the shape contract.
pub fn evaluate_sources(
    model: &dyn SourceModel,
    profiles: &CoreProfiles,
    mesh: &Mesh,
    time: f64,
) -> Result<SourceTerms> {
    let s = model.compute(profiles, mesh, time)?;
    s.check_shape(mesh.n_cells())?;
    Ok(s)
}

/// Spatially uniform transport coefficients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstantTransport {
    pub chi_i: Float,
    pub chi_e: Float,
    pub d_n: Float,
    pub v_n: Float,
}

impl ConstantTransport {
    pub fn none() -> ConstantTransport {
        ConstantTransport {
            chi_i: 0.,
            chi_e: 0.,
            d_n: 0.,
            v_n: 0.,
        }
    }
}

impl TransportModel for ConstantTransport {
    fn compute(&self, _: &CoreProfiles, mesh: &Mesh, _: f64) -> Result<TransportCoefficients> {
        let n = mesh.n_cells();
        Ok(TransportCoefficients {
            chi_i: Array1::from_elem(n + 1, self.chi_i),
            chi_e: Array1::from_elem(n + 1, self.chi_e),
            d_n: Array1::from_elem(n + 1, self.d_n),
            v_n: Array1::from_elem(n + 1, self.v_n),
        })
    }
}

/// No sources at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSources;

impl SourceModel for NoSources {
    fn compute(&self, _: &CoreProfiles, mesh: &Mesh, _: f64) -> Result<SourceTerms> {
        Ok(SourceTerms::zeros(mesh.n_cells()))
    }
}

/// Gaussian heating deposition split between ions and electrons, the usual
/// stand-in for neutral-beam or RF heating when no integrated source model is
/// attached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GaussianHeatSource {
    /// Total deposited power density amplitude [MW/m^3].
    pub amplitude: Float,
    /// Deposition center in normalized radius.
    pub center: Float,
    /// Gaussian width in normalized radius.
    pub width: Float,
    /// Fraction of the power deposited on the ions, the rest heats electrons.
    pub ion_fraction: Float,
}

impl SourceModel for GaussianHeatSource {
    fn compute(&self, _: &CoreProfiles, mesh: &Mesh, _: f64) -> Result<SourceTerms> {
        let mut s = SourceTerms::zeros(mesh.n_cells());
        let w2 = 2. * self.width * self.width;
        for (i, &r) in mesh.rho().iter().enumerate() {
            let d = r - self.center;
            let dep = self.amplitude * (-d * d / w2).exp();
            s.heat_i[i] = self.ion_fraction * dep;
            s.heat_e[i] = (1. - self.ion_fraction) * dep;
        }
        Ok(s)
    }
}

/// Fixed pedestal-top values clamped onto the edge boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedPedestal {
    pub t_i: Float,
    pub t_e: Float,
    pub n_e: Float,
}

impl PedestalModel for FixedPedestal {
    fn compute(&self, _: &CoreProfiles, _: &Mesh, _: f64) -> Result<PedestalConstraint> {
        Ok(PedestalConstraint {
            t_i: Some(self.t_i),
            t_e: Some(self.t_e),
            n_e: Some(self.n_e),
        })
    }
}
