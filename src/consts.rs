//! Physical and numerical constants shared across the core.

use crate::Float;

pub const PI: Float = std::f32::consts::PI;
pub const TWOPI: Float = 2. * PI;

/// Vacuum permeability [H/m].
pub const MU0: Float = 1.256_637_06e-6;

/// Density floor [m^-3]. Plasma densities below this are unphysical; the
/// floor also guards every division by the density-valued transient
/// coefficient in the solvers.
pub const N_FLOOR: Float = 1e18;

/// Conversion from MW/m^3 to eV/(m^3 s): eV per joule times 1e6.
pub const MW_TO_EV: Float = 6.242e24;

/// Added to harmonic-mean denominators so that vacuum cells with a zero
/// coefficient do not divide by zero.
pub const HARMONIC_EPS: Float = 1e-30;
