//! Adaptive time-step proposal.
//!
//! The candidate step comes from a CFL-style bound on the fastest diffusive
//! channel; the committed step is additionally limited by the growth cap
//! relative to the previous *successful* step and by the configured maximum.
//! The cap is mandatory: even a 1.2x jump can wreck the Jacobian conditioning
//! of this problem class.

use log::{debug, info};

use crate::settings::AdaptiveDtSettings;
use crate::simulation::mesh::Mesh;
use crate::simulation::models::TransportCoefficients;

/// Propose the next time step from the transport state and the previous
/// successful step. All step arithmetic runs in `f64`.
pub fn propose_dt(
    transport: &TransportCoefficients,
    mesh: &Mesh,
    dt_prev: f64,
    dt_initial: f64,
    s: &AdaptiveDtSettings,
) -> f64 {
    let raw = if s.enabled {
        let dr = mesh.dr() as f64;
        let chi = (transport.max_diffusivity() as f64).max(s.floor_diffusivity);
        s.cfl_safety * dr * dr / chi
    } else {
        dt_initial
    };

    let capped = raw.min(dt_prev * s.growth_cap).min(s.dt_max);
    if capped < raw {
        info!(
            "time step capped: raw proposal {:.4e} s, committed {:.4e} s (prev {:.4e} s, cap {})",
            raw, capped, dt_prev, s.growth_cap
        );
    } else {
        debug!("time step proposal {:.4e} s", capped);
    }
    capped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{AdaptiveDtSettings, MeshSettings};
    use crate::simulation::mesh::{Geometry, Mesh};
    use crate::simulation::models::TransportCoefficients;

    fn mesh() -> Mesh {
        Mesh::new(&MeshSettings {
            n_cells: 50,
            minor_radius: 1.0,
            major_radius: 3.0,
            b_toroidal: 2.5,
            geometry: Geometry::Circular,
        })
        .unwrap()
    }

    fn settings() -> AdaptiveDtSettings {
        AdaptiveDtSettings {
            enabled: true,
            dt_min: 1e-5,
            dt_max: 1e-1,
            growth_cap: 1.2,
            cfl_safety: 0.8,
            floor_diffusivity: 1e-9,
        }
    }

    #[test]
    fn growth_cap_binds_exactly() {
        let m = mesh();
        let mut tc = TransportCoefficients::zeros(50);
        // dr = 0.02, so the CFL proposal is 0.8 * 4e-4 / 0.5 = 6.4e-4.
        tc.chi_i.fill(0.5);
        let dt = propose_dt(&tc, &m, 1.5e-4, 1.5e-4, &settings());
        assert_eq!(dt, 1.5e-4 * 1.2);
    }

    #[test]
    fn cfl_binds_when_growth_would_allow_more() {
        let m = mesh();
        let mut tc = TransportCoefficients::zeros(50);
        tc.chi_i.fill(0.5);
        let dt = propose_dt(&tc, &m, 1e-2, 1e-2, &settings());
        assert!((dt - 6.4e-4).abs() < 1e-9, "dt = {}", dt);
    }

    #[test]
    fn dt_max_is_a_hard_ceiling() {
        let m = mesh();
        let tc = TransportCoefficients::zeros(50);
        // Zero transport: the CFL bound runs against the floor diffusivity
        // and becomes enormous.
        let dt = propose_dt(&tc, &m, 1e1, 1e1, &settings());
        assert_eq!(dt, 1e-1);
    }

    #[test]
    fn fixed_step_mode_still_honors_the_cap() {
        let m = mesh();
        let tc = TransportCoefficients::zeros(50);
        let mut s = settings();
        s.enabled = false;
        // After a retry the step crawls back up toward the configured value.
        let dt = propose_dt(&tc, &m, 9e-5, 1.8e-4, &s);
        assert!((dt - 1.08e-4).abs() < 1e-12, "dt = {}", dt);
    }

    #[test]
    fn non_finite_coefficients_do_not_poison_the_step() {
        let m = mesh();
        let mut tc = TransportCoefficients::zeros(50);
        tc.chi_e.fill(f32::NAN);
        let dt = propose_dt(&tc, &m, 1e-4, 1e-4, &settings());
        assert!(dt.is_finite() && dt > 0.);
    }
}
