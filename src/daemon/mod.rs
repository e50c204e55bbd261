//! Worker daemon.
//!
//! A long-running process on a remote machine that:
//! - Connects to a coordinator and registers a machine name
//! - Advertises the subset of tools it is willing to run
//! - Executes tool requests and reports their output

pub mod worker;

pub use worker::WorkerDaemon;
