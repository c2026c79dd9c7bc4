//! CPU-allocation control plane for the dataplane's shared-memory command
//! channel: flow-group rebalancing, DVFS step control, and the one-shot
//! operations exposed by the `cpuctl` binary.

pub mod background;
pub mod cli;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod ops;
pub mod rebalance;
pub mod shmem;
pub mod steps;
pub mod topology;
