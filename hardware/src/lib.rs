//! Hardware drivers for the mirror test bench.
//!
//! This crate provides the two pieces of bench equipment the alignment and
//! measurement workflows drive:
//!
//! - [`interferometer`] - client for the interferometer's 4D WebService
//! - [`newport`] - Newport SMC100 controllers behind the alignment stage
//!
//! Workflows depend on [`StageInterface`] and [`interferometer::ServiceTransport`]
//! rather than the concrete drivers, so they can run against scripted
//! equipment in tests.

pub mod interferometer;
pub mod newport;
pub mod stage_interface;

pub use interferometer::{ClientError, MeasurementClient};
pub use stage_interface::{StageChannel, StageInterface};
