//! Conservation enforcement after profile redistribution.
//!
//! Any operator that moves a profile around inside a radial range must leave
//! the integrated particle number and internal energy unchanged. This module
//! rescales the redistributed profiles multiplicatively so that
//! `int f g0 drho` over the affected range is preserved. Density is
//! conserved first; energy conservation then uses the *already conserved*
//! density — enforcing energy against the pre-redistribution density would
//! conserve a quantity that no longer exists.

use ndarray::Array1;
use num_traits::Float as NumFloat;

use crate::errors::*;
use crate::simulation::mesh::Mesh;
use crate::Float;

/// Relative drift allowed after rescaling.
pub const CONSERVATION_TOL: f64 = 1e-3;

/// `sum values_i weights_i` accumulated in double precision.
pub fn weighted_sum<T: NumFloat>(values: &[T], weights: &[T]) -> f64
where
    f64: From<T>,
{
    values
        .iter()
        .zip(weights.iter())
        .map(|(&f, &w)| f64::from(f) * f64::from(w))
        .sum()
}

/// `int f w g0 drho` over cells `0..=upto`. The uniform `drho` cancels in
/// every conservation ratio, so it is left out of the weights.
fn range_integral(mesh: &Mesh, values: &Array1<Float>, weight: &Array1<Float>, upto: usize) -> f64 {
    let w: Vec<Float> = (0..=upto).map(|i| weight[i] * mesh.g0_cells()[i]).collect();
    let v: Vec<Float> = values.iter().take(upto + 1).cloned().collect();
    weighted_sum(&v, &w)
}

fn rescale_range(
    mesh: &Mesh,
    reference: f64,
    values: &mut Array1<Float>,
    weight: &Array1<Float>,
    upto: usize,
    field: &'static str,
) -> Result<()> {
    let current = range_integral(mesh, values, weight, upto);
    if current == 0. {
        if reference == 0. {
            return Ok(());
        }
        bail!(ErrorKind::InvariantViolation(
            field,
            0,
            format!(
                "ConservationDrift (redistributed integral vanished, reference {:e})",
                reference
            ),
        ));
    }
    let factor = (reference / current) as Float;
    for i in 0..=upto {
        values[i] *= factor;
    }

    let after = range_integral(mesh, values, weight, upto);
    let drift = ((after - reference) / reference.abs().max(f64::MIN_POSITIVE)).abs();
    if drift > CONSERVATION_TOL {
        bail!(ErrorKind::InvariantViolation(
            field,
            0,
            format!("ConservationDrift (relative drift {:e} after rescaling)", drift),
        ));
    }
    Ok(())
}

/// Rescale the redistributed density over cells `0..=upto` so the particle
/// count matches the pre-redistribution profile.
pub fn conserve_particles(
    mesh: &Mesh,
    old_n: &Array1<Float>,
    new_n: &mut Array1<Float>,
    upto: usize,
) -> Result<()> {
    let ones = Array1::ones(old_n.len());
    let reference = range_integral(mesh, old_n, &ones, upto);
    rescale_range(mesh, reference, new_n, &ones, upto, "n_e")
}

/// Rescale a redistributed temperature over cells `0..=upto` so the internal
/// energy matches the pre-redistribution state. `new_n` must already be the
/// conserved density.
pub fn conserve_energy(
    mesh: &Mesh,
    old_t: &Array1<Float>,
    old_n: &Array1<Float>,
    new_t: &mut Array1<Float>,
    new_n: &Array1<Float>,
    upto: usize,
    field: &'static str,
) -> Result<()> {
    let reference = range_integral(mesh, old_t, old_n, upto);
    rescale_range(mesh, reference, new_t, new_n, upto, field)
}
