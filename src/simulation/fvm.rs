//! Finite-volume coefficient assembly and boundary application.
//!
//! For each evolved field the discretized equation reads
//!
//! ```text
//! alpha (P^{n+1} - P^n)/dt = theta L(P^{n+1}) + (1 - theta) L(P^n) + S
//! ```
//!
//! with the spatial operator on cell `i`
//!
//! ```text
//! L(P)_i = (F_{i} - F_{i+1}) / V_i
//! F_j    = g1_j (-D_j (P_j - P_{j-1})/drho + v_j (P_{j-1} + P_j)/2)
//! ```
//!
//! Face-centered coefficients derived from cell values use the harmonic mean
//! (series-resistance view, keeps the diffusive flux continuous across the
//! face); the advected face value is the arithmetic mean. The two are not
//! interchangeable. The harmonic mean is computed in reciprocal form: with
//! densities near 1e20 the product form overflows single precision.

use itertools::izip;
use ndarray::Array1;

use crate::consts::{HARMONIC_EPS, MU0, N_FLOOR};
use crate::settings::PhysicsSettings;
use crate::simulation::mesh::Mesh;
use crate::simulation::models::{SourceTerms, TransportCoefficients};
use crate::simulation::profiles::{CoreProfiles, FaceConstraint, Field};
use crate::Float;

/// Harmonic mean of two cell values, reciprocal form.
pub fn harmonic_mean(a: Float, b: Float) -> Float {
    2. / (1. / (a + HARMONIC_EPS) + 1. / (b + HARMONIC_EPS))
}

/// Cell array to face array via harmonic means; the two domain faces copy
/// their adjacent cell.
pub fn face_harmonic(cells: &Array1<Float>) -> Array1<Float> {
    let n = cells.len();
    let mut faces = Array1::zeros(n + 1);
    faces[0] = cells[0];
    faces[n] = cells[n - 1];
    for j in 1..n {
        faces[j] = harmonic_mean(cells[j - 1], cells[j]);
    }
    faces
}

/// Cell array to face array via arithmetic means, boundary faces copying the
/// adjacent cell.
pub fn face_arithmetic(cells: &Array1<Float>) -> Array1<Float> {
    let n = cells.len();
    let mut faces = Array1::zeros(n + 1);
    faces[0] = cells[0];
    faces[n] = cells[n - 1];
    for j in 1..n {
        faces[j] = 0.5 * (cells[j - 1] + cells[j]);
    }
    faces
}

/// Face-centered gradient d/drho of a cell array; zero on the domain faces.
pub fn face_gradient(cells: &Array1<Float>, drho: Float) -> Array1<Float> {
    let n = cells.len();
    let mut faces = Array1::zeros(n + 1);
    for j in 1..n {
        faces[j] = (cells[j] - cells[j - 1]) / drho;
    }
    faces
}

/// Coefficients of one discretized equation.
#[derive(Debug, Clone)]
pub struct EquationCoefficients {
    /// Transient weight, cells.
    pub transient: Array1<Float>,
    /// Diffusion coefficient on faces, metric-ready (multiplied by g1/drho in
    /// the stencil).
    pub diffusion: Array1<Float>,
    /// Convection on faces, already converted to the normalized-radius metric.
    pub convection: Array1<Float>,
    /// Explicit source, cells, field units per second.
    pub source_explicit: Array1<Float>,
    /// Implicit source coefficient, cells, 1/s.
    pub source_implicit: Array1<Float>,
}

impl EquationCoefficients {
    fn zeros(n: usize) -> EquationCoefficients {
        EquationCoefficients {
            transient: Array1::ones(n),
            diffusion: Array1::zeros(n + 1),
            convection: Array1::zeros(n + 1),
            source_explicit: Array1::zeros(n),
            source_implicit: Array1::zeros(n),
        }
    }
}

/// One set of equation coefficients per evolved field.
#[derive(Debug, Clone)]
pub struct BlockCoefficients {
    pub t_i: EquationCoefficients,
    pub t_e: EquationCoefficients,
    pub n_e: EquationCoefficients,
    pub psi: EquationCoefficients,
}

impl BlockCoefficients {
    pub fn equation(&self, f: Field) -> &EquationCoefficients {
        match f {
            Field::IonTemperature => &self.t_i,
            Field::ElectronTemperature => &self.t_e,
            Field::ElectronDensity => &self.n_e,
            Field::PoloidalFlux => &self.psi,
        }
    }

    pub fn equation_mut(&mut self, f: Field) -> &mut EquationCoefficients {
        match f {
            Field::IonTemperature => &mut self.t_i,
            Field::ElectronTemperature => &mut self.t_e,
            Field::ElectronDensity => &mut self.n_e,
            Field::PoloidalFlux => &mut self.psi,
        }
    }
}

/// Assemble the block coefficients at the given profile state.
///
/// The heat equations evolve temperatures with the density as transient
/// weight, so their face diffusivity is the face density (harmonic mean)
/// times chi and their convection is the particle pinch carrying heat. Ion
/// and electron heat couple through the equipartition exchange source, split
/// into an implicit part on the own temperature and an explicit part on the
/// other.
pub fn assemble(
    mesh: &Mesh,
    profiles: &CoreProfiles,
    transport: &TransportCoefficients,
    sources: &SourceTerms,
    physics: &PhysicsSettings,
) -> BlockCoefficients {
    let n = mesh.n_cells();
    let a = mesh.minor_radius();
    let n_e_faces = face_harmonic(&profiles.n_e.values);
    let (heat_i, heat_e) = sources.heat_to_internal();

    let mut t_i = EquationCoefficients::zeros(n);
    let mut t_e = EquationCoefficients::zeros(n);
    let mut n_e = EquationCoefficients::zeros(n);
    let mut psi = EquationCoefficients::zeros(n);

    // Density is the transient weight of the heat equations; the floor keeps
    // the later division by it safe in near-vacuum cells.
    let alpha_heat = profiles.n_e.values.mapv(|x| x.max(N_FLOOR));
    t_i.transient = alpha_heat.clone();
    t_e.transient = alpha_heat;
    psi.transient = mesh.psi_inertia().clone();

    for (d, v, &nf, &chi, &vp) in izip!(
        t_i.diffusion.iter_mut(),
        t_i.convection.iter_mut(),
        n_e_faces.iter(),
        transport.chi_i.iter(),
        transport.v_n.iter()
    ) {
        *d = nf * chi;
        *v = nf * vp * a;
    }
    for (d, v, &nf, &chi, &vp) in izip!(
        t_e.diffusion.iter_mut(),
        t_e.convection.iter_mut(),
        n_e_faces.iter(),
        transport.chi_e.iter(),
        transport.v_n.iter()
    ) {
        *d = nf * chi;
        *v = nf * vp * a;
    }
    n_e.diffusion = transport.d_n.clone();
    n_e.convection = transport.v_n.mapv(|v| v * a);
    psi.diffusion = Array1::from_elem(n + 1, physics.resistivity / MU0);

    t_i.source_explicit = heat_i;
    t_e.source_explicit = heat_e;
    n_e.source_explicit = sources.particles.clone();
    psi.source_explicit = sources.flux.clone();

    if physics.exchange_rate != 0. {
        let cx = physics.exchange_rate;
        for i in 0..n {
            let ne = profiles.n_e.values[i].max(N_FLOOR);
            t_i.source_explicit[i] += cx * ne * profiles.t_e.values[i];
            t_i.source_implicit[i] -= cx * ne;
            t_e.source_explicit[i] += cx * ne * profiles.t_i.values[i];
            t_e.source_implicit[i] -= cx * ne;
        }
    }

    BlockCoefficients { t_i, t_e, n_e, psi }
}

/// Tridiagonal form of the spatial operator of one equation,
/// `L(P) = lower P_{i-1} + diag P_i + upper P_{i+1} + boundary_source`,
/// with the face constraints already folded in.
#[derive(Debug, Clone)]
pub struct DiscreteOperator {
    pub lower: Array1<Float>,
    pub diag: Array1<Float>,
    pub upper: Array1<Float>,
    pub boundary_source: Array1<Float>,
}

impl DiscreteOperator {
    pub fn apply(&self, p: &Array1<Float>) -> Array1<Float> {
        let n = p.len();
        let mut out = Array1::zeros(n);
        for i in 0..n {
            let mut v = self.diag[i] * p[i] + self.boundary_source[i];
            if i > 0 {
                v += self.lower[i] * p[i - 1];
            }
            if i + 1 < n {
                v += self.upper[i] * p[i + 1];
            }
            out[i] = v;
        }
        out
    }
}

/// Build the discrete operator of one equation, applying the face
/// constraints. Dirichlet modifies the neighbor coefficient and augments the
/// explicit source, Neumann cancels the diffusive flux in favor of the
/// prescribed gradient, Robin combines both through the face closure
/// `a f + b df/dr = c`.
pub fn discretize(
    mesh: &Mesh,
    eq: &EquationCoefficients,
    left: FaceConstraint,
    right: FaceConstraint,
) -> DiscreteOperator {
    let n = mesh.n_cells();
    let h = mesh.drho();
    let a_m = mesh.minor_radius();
    let g1 = mesh.g1_faces();
    let d = &eq.diffusion;
    let v = &eq.convection;

    let mut lower = Array1::zeros(n);
    let mut diag = Array1::zeros(n);
    let mut upper = Array1::zeros(n);
    let mut bsrc = Array1::zeros(n);

    // Interior faces 1..n-1.
    for i in 0..n {
        let vol = mesh.cell_volume(i);
        if i > 0 {
            let j = i;
            lower[i] += g1[j] * (d[j] / h + v[j] / 2.) / vol;
            diag[i] += g1[j] * (-d[j] / h + v[j] / 2.) / vol;
        }
        if i + 1 < n {
            let j = i + 1;
            diag[i] -= g1[j] * (d[j] / h + v[j] / 2.) / vol;
            upper[i] += g1[j] * (d[j] / h - v[j] / 2.) / vol;
        }
    }

    // Left domain face enters cell 0 with positive sign.
    {
        let vol = mesh.cell_volume(0);
        let (g, df, vf) = (g1[0], d[0], v[0]);
        match left {
            FaceConstraint::Dirichlet { value } => {
                diag[0] -= g * 2. * df / h / vol;
                bsrc[0] += g * (2. * df / h + vf) * value / vol;
            }
            FaceConstraint::Neumann { gradient } => {
                let grad_rho = gradient * a_m;
                diag[0] += g * vf / vol;
                bsrc[0] -= g * df * grad_rho / vol;
            }
            FaceConstraint::Robin { a, b, c } => {
                let den = b / a_m - a * h / 2.;
                diag[0] += g * (df * a / den + vf * (1. + h * a / (2. * den))) / vol;
                bsrc[0] -= g * (df * c / den + vf * h * c / (2. * den)) / vol;
            }
        }
    }

    // Right domain face enters cell n-1 with negative sign.
    {
        let i = n - 1;
        let vol = mesh.cell_volume(i);
        let (g, df, vf) = (g1[n], d[n], v[n]);
        match right {
            FaceConstraint::Dirichlet { value } => {
                diag[i] -= g * 2. * df / h / vol;
                bsrc[i] += g * (2. * df / h - vf) * value / vol;
            }
            FaceConstraint::Neumann { gradient } => {
                let grad_rho = gradient * a_m;
                diag[i] -= g * vf / vol;
                bsrc[i] += g * df * grad_rho / vol;
            }
            FaceConstraint::Robin { a, b, c } => {
                let den = a * h / 2. + b / a_m;
                diag[i] -= g * (df * a / den + vf * (1. - h * a / (2. * den))) / vol;
                bsrc[i] += g * (df * c / den - vf * h * c / (2. * den)) / vol;
            }
        }
    }

    DiscreteOperator {
        lower,
        diag,
        upper,
        boundary_source: bsrc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MeshSettings;
    use crate::simulation::mesh::Geometry;
    use crate::simulation::models::{ConstantTransport, NoSources, SourceModel, TransportModel};
    use crate::simulation::profiles::{FaceConstraint, Profile};
    use ndarray::Array1;
    use quickcheck::{quickcheck, TestResult};

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

    fn profiles(n: usize) -> CoreProfiles {
        let bc = FaceConstraint::Neumann { gradient: 0. };
        let mk = |v: Float| Profile::new(Array1::from_elem(n, v), bc, bc);
        CoreProfiles {
            t_i: mk(1000.),
            t_e: mk(1000.),
            n_e: mk(1e20),
            psi: mk(0.1),
        }
    }

    fn physics() -> PhysicsSettings {
        PhysicsSettings {
            resistivity: 1e-7,
            exchange_rate: 0.,
        }
    }

    #[test]
    fn harmonic_mean_survives_large_densities() {
        // The product form 2ab/(a+b) overflows f32 here.
        let a = 2e20f32;
        let b = 1e20f32;
        assert!(!(2. * a * b).is_finite());
        let m = harmonic_mean(a, b);
        assert!(m.is_finite());
        assert!((m - 4e20 / 3.).abs() / m < 1e-5);
    }

    quickcheck! {
        fn harmonic_forms_agree(a: f32, b: f32) -> TestResult {
            // Restrict to the range where the product form itself is finite
            // and the vacuum epsilon is negligible.
            if !(a.is_finite() && b.is_finite()) || a < 1e-20 || b < 1e-20 {
                return TestResult::discard();
            }
            if !(2. * a * b).is_finite() {
                return TestResult::discard();
            }
            let reciprocal = harmonic_mean(a, b);
            let product = 2. * a * b / (a + b);
            TestResult::from_bool((reciprocal - product).abs() <= 1e-4 * product.max(1e-30))
        }

        fn face_arrays_have_n_plus_one_entries(cells: Vec<f32>) -> TestResult {
            if cells.len() < 4 || cells.iter().any(|x| !x.is_finite() || *x <= 0.) {
                return TestResult::discard();
            }
            let arr = Array1::from_vec(cells.clone());
            let faces = face_harmonic(&arr);
            let ok = faces.len() == arr.len() + 1
                && faces[0] == arr[0]
                && faces[arr.len()] == arr[arr.len() - 1];
            TestResult::from_bool(ok)
        }
    }

    #[test]
    fn assembled_arrays_have_the_right_shapes() {
        let m = mesh(17);
        let p = profiles(17);
        let tc = ConstantTransport {
            chi_i: 1.,
            chi_e: 1.,
            d_n: 0.3,
            v_n: -0.2,
        }
        .compute(&p, &m, 0.)
        .unwrap();
        let src = NoSources.compute(&p, &m, 0.).unwrap();
        let blocks = assemble(&m, &p, &tc, &src, &physics());
        for f in crate::simulation::profiles::ALL_FIELDS.iter() {
            let eq = blocks.equation(*f);
            assert_eq!(eq.transient.len(), 17);
            assert_eq!(eq.diffusion.len(), 18);
            assert_eq!(eq.convection.len(), 18);
            assert_eq!(eq.source_explicit.len(), 17);
            assert_eq!(eq.source_implicit.len(), 17);
        }
        // Heat diffusivity is density-weighted.
        assert!((blocks.t_i.diffusion[5] - 1e20).abs() / 1e20 < 1e-5);
    }

    #[test]
    fn operator_annihilates_constants_without_convection() {
        let m = mesh(12);
        let mut eq = EquationCoefficients::zeros(12);
        eq.diffusion = Array1::from_elem(13, 2.5);
        let op = discretize(
            &m,
            &eq,
            FaceConstraint::Neumann { gradient: 0. },
            FaceConstraint::Dirichlet { value: 7. },
        );
        let p = Array1::from_elem(12, 7.0f32);
        let lp = op.apply(&p);
        for (i, &v) in lp.iter().enumerate() {
            let scale = op.diag[i].abs() * 7. + 1.;
            assert!(v.abs() < 1e-3 * scale, "cell {}: residual {}", i, v);
        }
    }

    #[test]
    fn dirichlet_modifies_neighbor_and_source() {
        let m = mesh(8);
        let mut eq = EquationCoefficients::zeros(8);
        eq.diffusion = Array1::from_elem(9, 1.);
        let free = discretize(
            &m,
            &eq,
            FaceConstraint::Neumann { gradient: 0. },
            FaceConstraint::Neumann { gradient: 0. },
        );
        let pinned = discretize(
            &m,
            &eq,
            FaceConstraint::Neumann { gradient: 0. },
            FaceConstraint::Dirichlet { value: 3. },
        );
        assert!(pinned.diag[7] < free.diag[7]);
        assert!(pinned.boundary_source[7] > 0.);
        assert_eq!(pinned.boundary_source[0], free.boundary_source[0]);
    }

    #[test]
    fn robin_reduces_to_dirichlet_when_gradient_free() {
        let m = mesh(8);
        let mut eq = EquationCoefficients::zeros(8);
        eq.diffusion = Array1::from_elem(9, 1.);
        eq.convection = Array1::from_elem(9, 0.4);
        let dirichlet = discretize(
            &m,
            &eq,
            FaceConstraint::Neumann { gradient: 0. },
            FaceConstraint::Dirichlet { value: 5. },
        );
        let robin = discretize(
            &m,
            &eq,
            FaceConstraint::Neumann { gradient: 0. },
            FaceConstraint::Robin {
                a: 2.,
                b: 0.,
                c: 10.,
            },
        );
        assert!((dirichlet.diag[7] - robin.diag[7]).abs() <= 1e-3 * dirichlet.diag[7].abs());
        assert!(
            (dirichlet.boundary_source[7] - robin.boundary_source[7]).abs()
                <= 1e-3 * dirichlet.boundary_source[7].abs()
        );
    }

    #[test]
    fn exchange_couples_the_heat_equations() {
        let m = mesh(10);
        let mut p = profiles(10);
        p.t_i.values.fill(500.);
        p.t_e.values.fill(1500.);
        let tc = ConstantTransport::none().compute(&p, &m, 0.).unwrap();
        let src = NoSources.compute(&p, &m, 0.).unwrap();
        let mut phys = physics();
        phys.exchange_rate = 1e-2;
        let blocks = assemble(&m, &p, &tc, &src, &phys);
        // Ions gain from the hotter electrons, both carry an implicit damping
        // term of the same magnitude.
        assert!(blocks.t_i.source_explicit[0] > 0.);
        assert!(blocks.t_i.source_implicit[0] < 0.);
        assert_eq!(blocks.t_i.source_implicit[0], blocks.t_e.source_implicit[0]);
        assert!(
            blocks.t_i.source_explicit[0] > blocks.t_e.source_explicit[0],
            "explicit gain follows the opposite temperature"
        );
    }

    #[test]
    fn heat_source_units_are_converted() {
        let m = mesh(6);
        let p = profiles(6);
        let tc = ConstantTransport::none().compute(&p, &m, 0.).unwrap();
        let mut src = NoSources.compute(&p, &m, 0.).unwrap();
        src.heat_i.fill(2.);
        let blocks = assemble(&m, &p, &tc, &src, &physics());
        assert!((blocks.t_i.source_explicit[0] - 2. * crate::consts::MW_TO_EV).abs() < 1e18);
    }
}
