//! Cell-centered radial mesh and flux-surface geometry factors.
//!
//! The radial coordinate is the normalized minor radius `rho` in [0, 1].
//! Cells are centered at `rho_i = (i + 1/2) * drho`; faces sit at
//! `rho_j = j * drho` for `j = 0..=n`. All metric information of the torus is
//! folded into two geometry factors:
//!
//! * `g0`, on cell centers, is the volume derivative dV/drho, so the volume
//!   of cell `i` is `g0(rho_i) * drho` and volume integrals are plain
//!   weighted sums.
//! * `g1`, on faces, is `g0` times the flux-surface average of
//!   `|grad rho|^2`; it is the weight of diffusive face fluxes expressed per
//!   unit of `drho`.
//!
//! On the axis `g1` vanishes, which makes the innermost face carry zero flux
//! regardless of the configured left constraint.

use ndarray::Array1;
use serde_derive::{Deserialize, Serialize};

use crate::consts::PI;
use crate::errors::*;
use crate::settings::MeshSettings;
use crate::Float;

/// Flux-surface shape of the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    /// Concentric circular flux surfaces.
    Circular,
    /// Shaped surfaces with elongation and triangularity corrections.
    Miller {
        elongation: Float,
        triangularity: Float,
    },
}

/// Immutable radial grid of a run.
#[derive(Debug, Clone)]
pub struct Mesh {
    n_cells: usize,
    minor_radius: Float,
    major_radius: Float,
    b_toroidal: Float,
    geometry: Geometry,
    drho: Float,
    rho: Array1<Float>,
    rho_faces: Array1<Float>,
    g0_cells: Array1<Float>,
    g1_faces: Array1<Float>,
    psi_inertia: Array1<Float>,
}

impl Mesh {
    pub fn new(s: &MeshSettings) -> Result<Mesh> {
        if s.n_cells < 4 {
            bail!(ErrorKind::MeshDegenerate(format!(
                "need at least 4 radial cells, got {}",
                s.n_cells
            )));
        }
        if s.minor_radius <= 0. || !s.minor_radius.is_finite() {
            bail!(ErrorKind::MeshDegenerate(format!(
                "minor radius must be positive and finite, got {}",
                s.minor_radius
            )));
        }
        if s.major_radius <= s.minor_radius || !s.major_radius.is_finite() {
            bail!(ErrorKind::MeshDegenerate(format!(
                "major radius must exceed the minor radius, got R = {}, a = {}",
                s.major_radius, s.minor_radius
            )));
        }
        if s.b_toroidal <= 0. || !s.b_toroidal.is_finite() {
            bail!(ErrorKind::MeshDegenerate(format!(
                "toroidal field must be positive and finite, got {}",
                s.b_toroidal
            )));
        }
        if let Geometry::Miller {
            elongation,
            triangularity,
        } = s.geometry
        {
            if elongation < 1. || !elongation.is_finite() {
                bail!(ErrorKind::MeshDegenerate(format!(
                    "elongation must be >= 1, got {}",
                    elongation
                )));
            }
            if triangularity.abs() >= 1. {
                bail!(ErrorKind::MeshDegenerate(format!(
                    "triangularity must lie in (-1, 1), got {}",
                    triangularity
                )));
            }
        }

        let n = s.n_cells;
        let drho = 1. / n as Float;
        let rho = Array1::from_shape_fn(n, |i| (i as Float + 0.5) * drho);
        let rho_faces = Array1::from_shape_fn(n + 1, |j| j as Float * drho);

        let a = s.minor_radius;
        let circ = 4. * PI * PI * s.major_radius * a * a;
        let (kappa, delta) = match s.geometry {
            Geometry::Circular => (1., 0.),
            Geometry::Miller {
                elongation,
                triangularity,
            } => (elongation, triangularity),
        };
        // Elongation inflates the volume element; the gradient weight picks up
        // the surface-averaged |grad rho|^2 of the shaped surface and a small
        // triangularity correction.
        let grad2 = (1. + kappa * kappa) / (2. * kappa * kappa * a * a);
        let g0 = |r: Float| circ * kappa * r;
        let g1 = |r: Float| g0(r) * grad2 * (1. - 0.5 * delta * r);

        let g0_cells = rho.mapv(g0);
        let g1_faces = rho_faces.mapv(g1);
        // Transient weight of the flux equation: pure geometry, positive on
        // every cell center.
        let psi_inertia = rho.mapv(|r| kappa * r);

        Ok(Mesh {
            n_cells: n,
            minor_radius: s.minor_radius,
            major_radius: s.major_radius,
            b_toroidal: s.b_toroidal,
            geometry: s.geometry,
            drho,
            rho,
            rho_faces,
            g0_cells,
            g1_faces,
            psi_inertia,
        })
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    /// Uniform spacing in normalized radius.
    pub fn drho(&self) -> Float {
        self.drho
    }

    /// Physical cell width [m].
    pub fn dr(&self) -> Float {
        self.minor_radius * self.drho
    }

    pub fn minor_radius(&self) -> Float {
        self.minor_radius
    }

    pub fn major_radius(&self) -> Float {
        self.major_radius
    }

    pub fn b_toroidal(&self) -> Float {
        self.b_toroidal
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Cell-center positions, length `n_cells`.
    pub fn rho(&self) -> &Array1<Float> {
        &self.rho
    }

    /// Face positions, length `n_cells + 1`.
    pub fn rho_faces(&self) -> &Array1<Float> {
        &self.rho_faces
    }

    pub fn g0_cells(&self) -> &Array1<Float> {
        &self.g0_cells
    }

    pub fn g1_faces(&self) -> &Array1<Float> {
        &self.g1_faces
    }

    /// Transient coefficient of the poloidal-flux equation.
    pub fn psi_inertia(&self) -> &Array1<Float> {
        &self.psi_inertia
    }

    pub fn cell_volume(&self, i: usize) -> Float {
        self.g0_cells[i] * self.drho
    }

    /// Volume-weighted integral of a cell array over cells `0..=upto`,
    /// accumulated in double precision.
    pub fn integrate_cells(&self, f: &Array1<Float>, upto: usize) -> f64 {
        let upto = upto.min(self.n_cells - 1);
        let mut acc = 0f64;
        for i in 0..=upto {
            acc += f[i] as f64 * self.g0_cells[i] as f64 * self.drho as f64;
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MeshSettings;

    fn circular(n: usize) -> MeshSettings {
        MeshSettings {
            n_cells: n,
            minor_radius: 1.0,
            major_radius: 3.0,
            b_toroidal: 2.5,
            geometry: Geometry::Circular,
        }
    }

    #[test]
    fn shapes() {
        let m = Mesh::new(&circular(25)).unwrap();
        assert_eq!(m.rho().len(), 25);
        assert_eq!(m.rho_faces().len(), 26);
        assert_eq!(m.g0_cells().len(), 25);
        assert_eq!(m.g1_faces().len(), 26);
        assert_eq!(m.psi_inertia().len(), 25);
    }

    #[test]
    fn axis_face_carries_no_flux() {
        let m = Mesh::new(&circular(10)).unwrap();
        assert_eq!(m.g1_faces()[0], 0.);
    }

    #[test]
    fn total_volume_matches_torus() {
        let m = Mesh::new(&circular(50)).unwrap();
        let ones = Array1::from_elem(50, 1.0f32);
        let vol = m.integrate_cells(&ones, 49);
        // V = 2 pi^2 R a^2; midpoint sums are exact for a linear integrand.
        let expected = 2. * std::f64::consts::PI.powi(2) * 3.0;
        assert!(
            (vol - expected).abs() / expected < 1e-6,
            "volume {} vs {}",
            vol,
            expected
        );
    }

    #[test]
    fn miller_inflates_volume() {
        let mut s = circular(20);
        s.geometry = Geometry::Miller {
            elongation: 1.8,
            triangularity: 0.3,
        };
        let shaped = Mesh::new(&s).unwrap();
        let circ = Mesh::new(&circular(20)).unwrap();
        for i in 0..20 {
            assert!(shaped.g0_cells()[i] > circ.g0_cells()[i]);
        }
    }

    #[test]
    fn degenerate_meshes_are_rejected() {
        let mut s = circular(3);
        assert!(Mesh::new(&s).is_err());
        s = circular(10);
        s.minor_radius = -1.;
        assert!(Mesh::new(&s).is_err());
        s = circular(10);
        s.major_radius = 0.5;
        assert!(Mesh::new(&s).is_err());
        s = circular(10);
        s.geometry = Geometry::Miller {
            elongation: 0.5,
            triangularity: 0.,
        };
        assert!(Mesh::new(&s).is_err());
    }
}
