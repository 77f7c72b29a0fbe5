//! fleetrolld: the fleetroll daemon.
//!
//! Opens the redb state store, runs the device selection and disruption
//! allowance reconcilers on independent timers, and logs every callback they
//! emit. The operator subcommands share the same configuration and store.

pub mod commands;
pub mod config;
pub mod daemon;

pub use config::DaemonConfig;
