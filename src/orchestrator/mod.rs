//! Application-level orchestration.
//!
//! This module owns command resolution, the build/clean run lifecycle and the
//! event loops that drive it. The CLI layer calls into this module; the
//! supervisor below it knows nothing about builds.

mod controller;
mod resolve;
mod runner;

pub(crate) use controller::{read_commands, run_once, run_session, UiCommand};
pub use runner::Runner;
