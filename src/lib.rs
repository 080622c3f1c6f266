//! Transport simulation core for tokamak plasmas.
//!
//! Integrates the coupled one-dimensional transport equations for ion
//! temperature, electron temperature, electron density and poloidal flux on a
//! cell-centered radial mesh. Time integration uses an implicit theta-method
//! with either a predictor-corrector linear solve or a Newton-Raphson solve,
//! an adaptive time step with a retry cascade, conservation enforcement after
//! redistribution events and an optional sawtooth operator.
//!
//! Transport coefficients, source densities and pedestal constraints are
//! supplied by external model implementations through the traits in
//! [`simulation::models`]. Output is a stream of [`output::Snapshot`] values
//! handed to a user callback; serialization is left to the caller.

#![recursion_limit = "1024"]

#[macro_use]
extern crate error_chain;

pub mod consts;
pub mod errors;
pub mod output;
pub mod settings;
pub mod simulation;

/// Scalar type of all mesh-resident arrays.
///
/// Every cell- and face-centered array in the crate is single precision. The
/// simulation time accumulator is the one deliberate exception: it is kept in
/// `f64` so that summing ten thousand and more small steps does not drift.
pub type Float = f32;

pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::output::{Control, RunStatus, RunSummary, Snapshot};
pub use crate::settings::Settings;
pub use crate::simulation::models::{
    SourceModel, SourceTerms, TransportCoefficients, TransportModel,
};
pub use crate::simulation::profiles::CoreProfiles;
pub use crate::simulation::Simulation;
