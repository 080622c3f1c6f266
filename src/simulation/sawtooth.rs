//! Sawtooth crash detection and profile redistribution.
//!
//! When the safety factor drops below one inside the plasma, the m=1 kink
//! mode periodically flattens the core. The operator detects the innermost
//! q=1 surface, checks the trigger criteria, flattens the kinetic profiles
//! over the mixing region, restores particle and energy conservation and
//! relaxes the core flux gradient so that q(0) comes back above one —
//! otherwise the trigger would fire again on the very next step.

use lerp::Lerp;
use log::info;
use ndarray::Array1;

use crate::consts::TWOPI;
use crate::errors::*;
use crate::settings::SawtoothSettings;
use crate::simulation::conservation::{conserve_energy, conserve_particles};
use crate::simulation::mesh::Mesh;
use crate::simulation::profiles::CoreProfiles;
use crate::Float;

/// Record of one crash, for diagnostics and the run summary.
#[derive(Debug, Clone, Copy)]
pub struct SawtoothCrash {
    pub time: f64,
    pub rho_q1: Float,
    pub i_q1: usize,
    pub i_mix: usize,
    pub q_axis_before: Float,
    pub q_axis_after: Float,
}

/// Stateful sawtooth operator; remembers the last crash time.
#[derive(Debug, Clone)]
pub struct SawtoothOperator {
    settings: SawtoothSettings,
    last_crash: f64,
}

/// Safety factor q on cell centers, from the poloidal flux and geometry:
/// `q = 2 pi B0 a^2 rho / (dpsi/drho)`. A vanishing flux gradient maps to a
/// very large q instead of a division blow-up.
pub fn safety_factor(mesh: &Mesh, psi: &Array1<Float>) -> Array1<Float> {
    let n = mesh.n_cells();
    let h = mesh.drho();
    let a = mesh.minor_radius();
    let scale = TWOPI * mesh.b_toroidal() * a * a;
    let mut q = Array1::zeros(n);
    for i in 0..n {
        let dpsi = if i == 0 {
            (psi[1] - psi[0]) / h
        } else if i == n - 1 {
            (psi[n - 1] - psi[n - 2]) / h
        } else {
            (psi[i + 1] - psi[i - 1]) / (2. * h)
        };
        q[i] = if dpsi.abs() < 1e-12 {
            1e6
        } else {
            scale * mesh.rho()[i] / dpsi
        };
    }
    q
}

/// Magnetic shear `s = (rho/q) dq/drho` on cell centers.
fn magnetic_shear(mesh: &Mesh, q: &Array1<Float>) -> Array1<Float> {
    let n = mesh.n_cells();
    let h = mesh.drho();
    let mut s = Array1::zeros(n);
    for i in 0..n {
        let dq = if i == 0 {
            (q[1] - q[0]) / h
        } else if i == n - 1 {
            (q[n - 1] - q[n - 2]) / h
        } else {
            (q[i + 1] - q[i - 1]) / (2. * h)
        };
        s[i] = mesh.rho()[i] / q[i] * dq;
    }
    s
}

/// Innermost crossing where q passes through one, by linear interpolation.
/// Returns the bracketing cell index and the interpolation weight.
fn find_q1(q: &Array1<Float>) -> Option<(usize, Float)> {
    for i in 0..q.len() - 1 {
        if q[i] < 1. && q[i + 1] >= 1. {
            let t = (1. - q[i]) / (q[i + 1] - q[i]);
            return Some((i, t));
        }
    }
    None
}

/// Linear ramp over the inner region and blend over the transition region.
/// The index set of the ramp includes `i_q1`, so the inner endpoint equals
/// `f(i_q1)` exactly and the redistributed profile is continuous there.
fn flatten(
    mesh: &Mesh,
    f_old: &Array1<Float>,
    i_q1: usize,
    i_mix: usize,
    kappa: Float,
) -> Array1<Float> {
    let rho = mesh.rho();
    let f_q1 = f_old[i_q1];
    let f_axis = kappa * f_q1;
    let mut f = f_old.clone();
    for j in 0..=i_q1 {
        let t = rho[j] / rho[i_q1];
        f[j] = f_axis.lerp(f_q1, t);
    }
    for j in i_q1 + 1..=i_mix {
        let u = (rho[j] - rho[i_q1]) / (rho[i_mix] - rho[i_q1]);
        f[j] = f_q1.lerp(f_old[j], u);
    }
    f
}

/// Reduce the core flux gradient by `s_psi`, weighted from full strength on
/// the axis to nothing at the q=1 surface; psi outside the surface is
/// untouched.
fn relax_flux(
    mesh: &Mesh,
    psi: &Array1<Float>,
    i_q1: usize,
    rho_q1: Float,
    s_psi: Float,
) -> Array1<Float> {
    let rho = mesh.rho();
    let mut out = psi.clone();
    for j in (1..=i_q1).rev() {
        let rho_face = 0.5 * (rho[j - 1] + rho[j]);
        let w = (1. - rho_face / rho_q1).max(0.);
        let factor = 1. - (1. - s_psi) * w;
        let dpsi = psi[j] - psi[j - 1];
        out[j - 1] = out[j] - dpsi * factor;
    }
    out
}

impl SawtoothOperator {
    pub fn new(settings: SawtoothSettings, t_start: f64) -> SawtoothOperator {
        SawtoothOperator {
            settings,
            last_crash: t_start,
        }
    }

    pub fn last_crash(&self) -> f64 {
        self.last_crash
    }

    /// Evaluate the trigger at a committed state and redistribute if it
    /// fires. Returns the post-crash profiles and the crash record, or `None`
    /// when any criterion fails.
    pub fn maybe_crash(
        &mut self,
        mesh: &Mesh,
        profiles: &CoreProfiles,
        time: f64,
    ) -> Result<Option<(CoreProfiles, SawtoothCrash)>> {
        let s = self.settings;
        if !s.enabled {
            return Ok(None);
        }
        if time - self.last_crash < s.min_interval {
            return Ok(None);
        }

        let q = safety_factor(mesh, &profiles.psi.values);
        if q[0] >= 1. {
            return Ok(None);
        }
        let (i_lo, t) = match find_q1(&q) {
            Some(c) => c,
            None => return Ok(None),
        };
        let rho = mesh.rho();
        let rho_q1 = rho[i_lo].lerp(rho[i_lo + 1], t);
        if rho_q1 <= s.rho_min {
            return Ok(None);
        }
        let shear = magnetic_shear(mesh, &q);
        let shear_q1 = shear[i_lo].lerp(shear[i_lo + 1], t);
        if shear_q1 <= s.shear_crit {
            return Ok(None);
        }

        let n = mesh.n_cells();
        let i_q1 = if t > 0.5 { i_lo + 1 } else { i_lo };
        let rho_mix = s.mixing_factor * rho_q1;
        let mut i_mix = n - 2;
        for (i, &r) in rho.iter().enumerate() {
            if r >= rho_mix {
                i_mix = i.min(n - 2);
                break;
            }
        }
        let i_mix = i_mix.max(i_q1 + 1);

        let mut out = profiles.clone();
        out.n_e.values = flatten(mesh, &profiles.n_e.values, i_q1, i_mix, s.flattening_factor);
        out.t_i.values = flatten(mesh, &profiles.t_i.values, i_q1, i_mix, s.flattening_factor);
        out.t_e.values = flatten(mesh, &profiles.t_e.values, i_q1, i_mix, s.flattening_factor);

        conserve_particles(mesh, &profiles.n_e.values, &mut out.n_e.values, i_mix)?;
        conserve_energy(
            mesh,
            &profiles.t_i.values,
            &profiles.n_e.values,
            &mut out.t_i.values,
            &out.n_e.values,
            i_mix,
            "t_i",
        )?;
        conserve_energy(
            mesh,
            &profiles.t_e.values,
            &profiles.n_e.values,
            &mut out.t_e.values,
            &out.n_e.values,
            i_mix,
            "t_e",
        )?;

        out.psi.values = relax_flux(mesh, &profiles.psi.values, i_q1, rho_q1, s.psi_relax);
        let q_after = safety_factor(mesh, &out.psi.values);

        let crash = SawtoothCrash {
            time,
            rho_q1,
            i_q1,
            i_mix,
            q_axis_before: q[0],
            q_axis_after: q_after[0],
        };
        info!(
            "sawtooth crash at t = {:.6e} s: q=1 at rho = {:.3}, mixing to cell {}, q(0) {:.3} -> {:.3}",
            time, rho_q1, i_mix, crash.q_axis_before, crash.q_axis_after
        );
        self.last_crash = time;
        Ok(Some((out, crash)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{MeshSettings, SawtoothSettings};
    use crate::simulation::mesh::Geometry;
    use crate::simulation::profiles::{FaceConstraint, Profile};

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

    fn settings() -> SawtoothSettings {
        SawtoothSettings {
            enabled: true,
            rho_min: 0.2,
            shear_crit: 0.2,
            min_interval: 0.01,
            mixing_factor: 1.5,
            flattening_factor: 1.01,
            psi_relax: 0.8,
        }
    }

    /// Poloidal flux realizing a prescribed q profile, by integrating
    /// dpsi/drho = 2 pi B0 a^2 rho / q(rho) on a fine sub-grid.
    fn psi_for_q<F: Fn(f64) -> f64>(m: &Mesh, q: F) -> Array1<Float> {
        let scale = TWOPI as f64 * m.b_toroidal() as f64;
        let mut psi = Array1::zeros(m.n_cells());
        let mut acc = 0f64;
        let mut r = 0f64;
        let sub = 64;
        for (i, &rc) in m.rho().iter().enumerate() {
            let target = rc as f64;
            let dr = (target - r) / sub as f64;
            for _ in 0..sub {
                let rm = r + dr / 2.;
                acc += scale * rm / q(rm) * dr;
                r += dr;
            }
            psi[i] = acc as Float;
        }
        psi
    }

    /// q(0) = 0.9, q = 1 at rho = 0.3 with shear 0.5 there.
    fn crash_prone_q(r: f64) -> f64 {
        0.9 + 0.1 * (r / 0.3).powi(5)
    }

    fn crash_prone_profiles(m: &Mesh) -> CoreProfiles {
        let n = m.n_cells();
        let bc = FaceConstraint::Neumann { gradient: 0. };
        let peaked =
            Array1::from_shape_fn(n, |i| 5000. * (1. - 0.9 * (m.rho()[i] * m.rho()[i])) as Float);
        CoreProfiles {
            t_i: Profile::new(peaked.clone(), bc, bc),
            t_e: Profile::new(peaked.mapv(|v| 0.8 * v), bc, bc),
            n_e: Profile::new(
                Array1::from_shape_fn(n, |i| 1e20 * (1. - 0.5 * m.rho()[i]) as Float),
                bc,
                bc,
            ),
            psi: Profile::new(psi_for_q(m, crash_prone_q), bc, bc),
        }
    }

    #[test]
    fn safety_factor_recovers_the_prescribed_profile() {
        let m = mesh(50);
        let psi = psi_for_q(&m, crash_prone_q);
        let q = safety_factor(&m, &psi);
        for (i, &rc) in m.rho().iter().enumerate().skip(1).take(45) {
            let expected = crash_prone_q(rc as f64) as Float;
            assert!(
                (q[i] - expected).abs() / expected < 0.02,
                "cell {}: q = {}, expected {}",
                i,
                q[i],
                expected
            );
        }
    }

    #[test]
    fn crash_fires_and_restores_q_above_one() {
        let m = mesh(50);
        let p = crash_prone_profiles(&m);
        let mut op = SawtoothOperator::new(settings(), 0.);
        let (out, crash) = op.maybe_crash(&m, &p, 0.02).unwrap().expect("should fire");
        assert!(crash.q_axis_before < 1.);
        assert!(crash.q_axis_after > 1., "q(0) after = {}", crash.q_axis_after);
        assert!((crash.rho_q1 - 0.3).abs() < 0.05, "rho_q1 = {}", crash.rho_q1);
        assert_eq!(op.last_crash(), 0.02);
        // Outer region is untouched, bit for bit.
        for i in crash.i_mix + 1..50 {
            assert_eq!(out.t_i.values[i], p.t_i.values[i]);
            assert_eq!(out.n_e.values[i], p.n_e.values[i]);
            assert_eq!(out.psi.values[i], p.psi.values[i]);
        }
    }

    #[test]
    fn conservation_holds_over_the_mixing_region() {
        let m = mesh(50);
        let p = crash_prone_profiles(&m);
        let mut op = SawtoothOperator::new(settings(), 0.);
        let (out, crash) = op.maybe_crash(&m, &p, 1.).unwrap().unwrap();
        let upto = crash.i_mix;

        let particles_before = m.integrate_cells(&p.n_e.values, upto);
        let particles_after = m.integrate_cells(&out.n_e.values, upto);
        assert!(((particles_after - particles_before) / particles_before).abs() < 1e-3);

        for (old_t, new_t) in [(&p.t_i, &out.t_i), (&p.t_e, &out.t_e)].iter() {
            let mut before = 0f64;
            let mut after = 0f64;
            for i in 0..=upto {
                before += old_t.values[i] as f64
                    * p.n_e.values[i] as f64
                    * m.g0_cells()[i] as f64;
                after += new_t.values[i] as f64
                    * out.n_e.values[i] as f64
                    * m.g0_cells()[i] as f64;
            }
            assert!(((after - before) / before).abs() < 1e-3);
        }
    }

    #[test]
    fn ramp_endpoint_is_continuous() {
        let m = mesh(50);
        let f_old = Array1::from_shape_fn(50, |i| 4000. - 50. * i as Float);
        let flat = flatten(&m, &f_old, 15, 23, 1.01);
        let ulp = f_old[15].abs() * f32::EPSILON * 4.;
        assert!((flat[15] - f_old[15]).abs() <= ulp, "{} vs {}", flat[15], f_old[15]);
        // Axis sits above the q=1 value by the flattening factor.
        assert!((flat[0] - 1.01 * f_old[15]).abs() / flat[0] < 1e-3);
        // Transition ends on the original profile.
        assert!((flat[23] - f_old[23]).abs() <= ulp);
    }

    #[test]
    fn trigger_respects_every_criterion() {
        let m = mesh(50);
        let p = crash_prone_profiles(&m);

        // Too soon after the last crash.
        let mut op = SawtoothOperator::new(settings(), 0.);
        assert!(op.maybe_crash(&m, &p, 0.005).unwrap().is_none());

        // Disabled operator never fires.
        let mut s = settings();
        s.enabled = false;
        let mut op = SawtoothOperator::new(s, 0.);
        assert!(op.maybe_crash(&m, &p, 1.).unwrap().is_none());

        // q=1 radius inside the exclusion zone.
        let mut s = settings();
        s.rho_min = 0.45;
        let mut op = SawtoothOperator::new(s, 0.);
        assert!(op.maybe_crash(&m, &p, 1.).unwrap().is_none());

        // Shear below the critical value.
        let mut s = settings();
        s.shear_crit = 2.0;
        let mut op = SawtoothOperator::new(s, 0.);
        assert!(op.maybe_crash(&m, &p, 1.).unwrap().is_none());

        // q(0) above one never fires.
        let mut op = SawtoothOperator::new(settings(), 0.);
        let mut stable = p.clone();
        stable.psi.values = psi_for_q(&m, |r| 1.1 + r * r);
        assert!(op.maybe_crash(&m, &stable, 1.).unwrap().is_none());
    }
}
