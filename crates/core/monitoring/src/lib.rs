//! Observability utilities shared by the strata services.

pub mod logging;
