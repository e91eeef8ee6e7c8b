//! Empirical latency populations and the bootstrap significance test that turns two of
//! them (leak / no-leak) into an exploitability verdict.
mod bootstrap;
mod population;

pub use self::bootstrap::{
    bootstrap_test, ci_indices, BootstrapConfig, BootstrapError, BootstrapResult,
};
pub use self::population::{median, Population};
