//! hotswap library crate.
//!
//! The `hotswap` binary is a thin front end over these modules. The core is
//! the replacement [`ladder`], the process lock [`mediator`], and the
//! selective field [`merge`] engine, driven across a resource set by the
//! [`orchestrator`].

pub mod backup;
pub mod config;
pub mod error;
pub mod failpoints;
pub mod fsops;
pub mod ladder;
pub mod mediator;
pub mod merge;
pub mod orchestrator;
pub mod privilege;
pub mod registry;
pub mod snapshot;
pub mod telemetry;
