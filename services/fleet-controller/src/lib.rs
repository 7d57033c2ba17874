//! Fleet reconciliation engine.
//!
//! Keeps a declared fleet of identical, revisioned instances converging
//! toward its desired state. This crate ships the `fleet-controller` binary
//! and exposes the engine as a library for integration testing and reuse.

pub mod config;
pub mod controller;
pub mod model;
pub mod platform;
pub mod queue;
pub mod runtime;

pub use controller::{FleetReconciler, ReconcileError, ReconcileStats, ReconcilerSettings};
pub use runtime::{Controller, ControllerConfig};
