//! Interface to the external data-movement subsystem: a single black-box CLI
//! invoked with an argv vector, plus the adapter for its quasi-JSON reports.

pub mod client;
pub mod report;
pub mod runner;

pub use client::{DwBackend, DwCli, DwFunction, DwRequest};
pub use runner::CmdOutput;
