//! Background-task coordination: reserving a share of logical cpus for a
//! co-located best-effort task as the controller's active cpu count
//! changes, per spec §4.9.
//!
//! Bit i of the affinity mask names logical cpu i, matching `taskset`'s
//! hex mask argument.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use crate::error::CpError;

/// `max(0, |background_cpus| - active_primaries)`: how many of the
/// reserved cpus the background task may use once `active_primaries`
/// logical cpus are claimed by the dataplane.
pub fn thread_count(background_cpus: &[usize], active_primaries: usize) -> usize {
    background_cpus.len().saturating_sub(active_primaries)
}

/// Affinity mask covering the first `thread_count` entries of
/// `background_cpus`, in the order given.
pub fn affinity_mask(background_cpus: &[usize], thread_count: usize) -> u64 {
    let mut mask = 0u64;
    for &cpu in background_cpus.iter().take(thread_count) {
        mask |= 1u64 << cpu;
    }
    mask
}

/// Drives the two side effects of a background-task reservation change:
/// telling the task (via a fifo) how many threads it may run, and pinning
/// its process to the surviving cpus (via `taskset`).
pub trait BackgroundControl {
    fn write_thread_count(&self, fifo: &Path, count: usize) -> std::io::Result<()>;
    fn set_affinity(&self, pid: i32, mask: u64) -> Result<(), CpError>;
}

pub struct RealBackgroundControl;

impl BackgroundControl for RealBackgroundControl {
    fn write_thread_count(&self, fifo: &Path, count: usize) -> std::io::Result<()> {
        let mut f = std::fs::OpenOptions::new().write(true).open(fifo)?;
        writeln!(f, "{count}")
    }

    fn set_affinity(&self, pid: i32, mask: u64) -> Result<(), CpError> {
        let status = std::process::Command::new("taskset")
            .arg("-ap")
            .arg(format!("{mask:x}"))
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .status()
            .map_err(|e| CpError::BackgroundControlFailed(format!("spawning taskset: {e}")))?;
        if !status.success() {
            return Err(CpError::BackgroundControlFailed(format!(
                "taskset exited with {status}"
            )));
        }
        Ok(())
    }
}

/// Reservation parameters carried from the CLI, present only when
/// `--background-cpus` was given.
#[derive(Debug, Clone)]
pub struct BackgroundJob {
    pub fifo: Option<std::path::PathBuf>,
    pub pid: Option<i32>,
    pub cpus: Vec<usize>,
}

/// Recomputes the background task's thread budget for a step whose
/// primary (non-hyperthread) cpu count is `active_primaries`, and applies
/// it. No-op if no background job was configured.
pub fn control_background_job(
    ctrl: &dyn BackgroundControl,
    job: Option<&BackgroundJob>,
    active_primaries: usize,
) -> Result<(), CpError> {
    let Some(job) = job else { return Ok(()) };

    let count = thread_count(&job.cpus, active_primaries);
    let mask = affinity_mask(&job.cpus, count);

    if let Some(fifo) = &job.fifo {
        ctrl.write_thread_count(fifo, count)
            .map_err(|e| CpError::BackgroundControlFailed(format!("{}: {}", fifo.display(), e)))?;
    }
    if let (Some(pid), true) = (job.pid, mask != 0) {
        ctrl.set_affinity(pid, mask)?;
    }
    tracing::info!(threads = count, mask = format!("{mask:x}"), "bg_task");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn thread_count_floors_at_zero() {
        assert_eq!(thread_count(&[4, 5, 6], 5), 0);
        assert_eq!(thread_count(&[4, 5, 6], 1), 2);
    }

    #[test]
    fn affinity_mask_covers_leading_cpus() {
        assert_eq!(affinity_mask(&[4, 5, 6], 2), 0b0110_0000);
        assert_eq!(affinity_mask(&[4, 5, 6], 0), 0);
    }

    #[derive(Default)]
    struct FakeControl {
        writes: RefCell<Vec<(std::path::PathBuf, usize)>>,
        affinities: RefCell<Vec<(i32, u64)>>,
    }

    impl BackgroundControl for FakeControl {
        fn write_thread_count(&self, fifo: &Path, count: usize) -> std::io::Result<()> {
            self.writes.borrow_mut().push((fifo.to_path_buf(), count));
            Ok(())
        }

        fn set_affinity(&self, pid: i32, mask: u64) -> Result<(), CpError> {
            self.affinities.borrow_mut().push((pid, mask));
            Ok(())
        }
    }

    #[test]
    fn control_background_job_skips_affinity_when_mask_is_zero() {
        let ctrl = FakeControl::default();
        let job = BackgroundJob {
            fifo: Some("/tmp/bg.fifo".into()),
            pid: Some(123),
            cpus: vec![4, 5],
        };
        control_background_job(&ctrl, Some(&job), 2).unwrap();
        assert_eq!(ctrl.writes.borrow()[0].1, 0);
        assert!(ctrl.affinities.borrow().is_empty());
    }

    #[test]
    fn control_background_job_applies_affinity_when_reserving_threads() {
        let ctrl = FakeControl::default();
        let job = BackgroundJob {
            fifo: None,
            pid: Some(123),
            cpus: vec![4, 5, 6],
        };
        control_background_job(&ctrl, Some(&job), 1).unwrap();
        assert_eq!(ctrl.affinities.borrow()[0], (123, affinity_mask(&[4, 5, 6], 2)));
    }

    #[test]
    fn control_background_job_is_noop_without_a_job() {
        let ctrl = FakeControl::default();
        control_background_job(&ctrl, None, 3).unwrap();
        assert!(ctrl.writes.borrow().is_empty());
        assert!(ctrl.affinities.borrow().is_empty());
    }
}
