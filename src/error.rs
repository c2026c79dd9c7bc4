//! Error kinds for the control plane.
//!
//! Configuration and lookup errors are surfaced to the caller with a
//! single-line diagnostic and a non-zero exit; runtime errors inside the
//! controller loop are logged and the loop continues (see `controller.rs`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CpError {
    #[error("shared memory segment unavailable: {0}")]
    ShmUnavailable(String),

    #[error("topology source unavailable: {0}")]
    TopologyUnavailable(String),

    #[error("invalid cpulist: unknown physical cpu {0}")]
    InvalidCpulist(u32),

    /// Not constructed today: the shared-memory command channel has no
    /// notion of a deadline (see spec §5, "Cancellation/timeouts: none").
    /// Kept in the enum so a future timeout implementation doesn't need to
    /// widen the public error surface.
    #[error("command timed out waiting for cpu {cpu}")]
    CommandTimeout { cpu: usize },

    #[error("background affinity control failed: {0}")]
    BackgroundControlFailed(String),

    #[error("invalid step policy: {0}")]
    InvalidStepPolicy(String),
}
