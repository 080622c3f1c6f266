//! Error types of the transport core.
//!
//! Solver non-convergence is deliberately absent here: a single failed solve
//! is data for the retry cascade, not an error. It only surfaces as
//! `RetryExhausted` once the time step cannot be halved any further.
//! Cancellation is likewise not an error; a cancelled run returns its partial
//! result with a `Cancelled` status.

error_chain! {
    foreign_links {
        Io(std::io::Error);
        Toml(toml::de::Error);
    }

    errors {
        /// Rejected before the run starts; never raised at run time.
        ConfigurationInvalid(what: String) {
            description("invalid configuration")
            display("invalid configuration: {}", what)
        }
        /// The mesh parameters do not describe a usable radial grid.
        MeshDegenerate(what: String) {
            description("degenerate mesh")
            display("degenerate mesh: {}", what)
        }
        /// The realized initial profiles violate a basic physical bound.
        InitialStateInvalid(what: String) {
            description("invalid initial state")
            display("invalid initial state: {}", what)
        }
        /// A transport, source or pedestal model failed; surfaced verbatim,
        /// the core never retries a model.
        ModelFailure(component: &'static str, what: String) {
            description("model failure")
            display("{} model failure: {}", component, what)
        }
        /// The retry cascade ran out of room above the dt floor.
        RetryExhausted(dt: f64, step: usize, time: f64) {
            description("time step retry cascade exhausted")
            display(
                "time step fell below the retry floor (dt = {:.4e} s) at step {}, t = {:.6e} s",
                dt, step, time
            )
        }
        /// A committed profile violated a hard invariant. Never recovered;
        /// `detail` carries the offending and neighboring values plus the
        /// step index, time and dt of the attempt.
        InvariantViolation(field: &'static str, cell: usize, reason: String) {
            description("invariant violation in committed profile")
            display("invariant violation in {} at cell {}: {}", field, cell, reason)
        }
    }
}
