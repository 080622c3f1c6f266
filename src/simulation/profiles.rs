//! Containers for the evolved fields.
//!
//! `CoreProfiles` is replaced wholesale at every committed step; intermediate
//! states produced inside a solver never escape it. Arrays here are plain
//! eagerly-evaluated `ndarray` storage, so the cross-thread contract reduces
//! to ownership plus the invariant check every commit runs through
//! [`CoreProfiles::check_invariants`].

use ndarray::Array1;
use serde_derive::{Deserialize, Serialize};

use crate::consts::N_FLOOR;
use crate::errors::*;
use crate::Float;

/// Identity of an evolved field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    IonTemperature,
    ElectronTemperature,
    ElectronDensity,
    PoloidalFlux,
}

pub const ALL_FIELDS: [Field; 4] = [
    Field::IonTemperature,
    Field::ElectronTemperature,
    Field::ElectronDensity,
    Field::PoloidalFlux,
];

impl Field {
    pub fn label(self) -> &'static str {
        match self {
            Field::IonTemperature => "t_i",
            Field::ElectronTemperature => "t_e",
            Field::ElectronDensity => "n_e",
            Field::PoloidalFlux => "psi",
        }
    }

    /// Temperatures must stay strictly positive in committed profiles.
    pub fn must_be_positive(self) -> bool {
        matches!(self, Field::IonTemperature | Field::ElectronTemperature)
    }
}

/// Constraint on a domain face of one field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaceConstraint {
    /// Fixed face value.
    Dirichlet { value: Float },
    /// Fixed radial gradient [field units / m].
    Neumann { gradient: Float },
    /// `a * f + b * df/dr = c` on the face.
    Robin { a: Float, b: Float, c: Float },
}

/// One evolved field: cell values plus its two face constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub values: Array1<Float>,
    pub left: FaceConstraint,
    pub right: FaceConstraint,
}

impl Profile {
    pub fn new(values: Array1<Float>, left: FaceConstraint, right: FaceConstraint) -> Profile {
        Profile {
            values,
            left,
            right,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The four evolved fields of a step.
///
/// Units: temperatures in eV, density in m^-3, poloidal flux in Wb.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreProfiles {
    pub t_i: Profile,
    pub t_e: Profile,
    pub n_e: Profile,
    pub psi: Profile,
}

impl CoreProfiles {
    pub fn field(&self, f: Field) -> &Profile {
        match f {
            Field::IonTemperature => &self.t_i,
            Field::ElectronTemperature => &self.t_e,
            Field::ElectronDensity => &self.n_e,
            Field::PoloidalFlux => &self.psi,
        }
    }

    pub fn field_mut(&mut self, f: Field) -> &mut Profile {
        match f {
            Field::IonTemperature => &mut self.t_i,
            Field::ElectronTemperature => &mut self.t_e,
            Field::ElectronDensity => &mut self.n_e,
            Field::PoloidalFlux => &mut self.psi,
        }
    }

    pub fn n_cells(&self) -> usize {
        self.t_i.len()
    }

    /// Clamp the density at the physical floor. Called once per commit so the
    /// floor invariant holds for every profile that becomes visible outside
    /// the solvers.
    pub fn apply_density_floor(&mut self) {
        self.n_e.values.mapv_inplace(|x| x.max(N_FLOOR));
    }

    /// Verify the hard invariants of a committed state: every value finite,
    /// temperatures strictly positive. `context` is appended to the
    /// diagnostic so the caller can report step, time and dt.
    pub fn check_invariants(&self, context: &str) -> Result<()> {
        for &field in ALL_FIELDS.iter() {
            let p = self.field(field);
            for (cell, &v) in p.values.iter().enumerate() {
                let reason = if v.is_nan() {
                    Some("NaN")
                } else if v.is_infinite() {
                    Some("Inf")
                } else if field.must_be_positive() && v <= 0. {
                    Some("NonPositive")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    let lo = cell.saturating_sub(1);
                    let hi = (cell + 1).min(p.len() - 1);
                    bail!(ErrorKind::InvariantViolation(
                        field.label(),
                        cell,
                        format!(
                            "{} (value {:e}, neighbors [{:e}, {:e}]); {}",
                            reason, v, p.values[lo], p.values[hi], context
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Relative L2 distance between two states, over the given fields.
/// Used by the predictor-corrector termination test.
pub fn relative_change(new: &CoreProfiles, old: &CoreProfiles, fields: &[Field]) -> Float {
    let mut num = 0f64;
    let mut den = 0f64;
    for &f in fields {
        let a = &new.field(f).values;
        let b = &old.field(f).values;
        for (&x, &y) in a.iter().zip(b.iter()) {
            num += ((x - y) as f64).powi(2);
            den += (y as f64).powi(2);
        }
    }
    if den == 0. {
        return if num == 0. { 0. } else { Float::INFINITY };
    }
    (num / den).sqrt() as Float
}
