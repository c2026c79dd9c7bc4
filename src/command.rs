//! Per-CPU command channel: the NOP/MIGRATE/IDLE submission protocol and
//! the wakeup-via-pipe side channel.
//!
//! Submission is strictly serial per cpu and busy-waits for completion —
//! see spec §5, "Ordering guarantees". There is no timeout: a
//! non-responsive worker deadlocks the caller by design (the dataplane is
//! part of the same trust boundary).
//!
//! The host-side protocol (arm a slot, then wait for the worker's
//! acknowledgement) is factored behind [`CommandExecutor`] so the
//! rebalancer and controller can be driven in tests by an executor that
//! completes synchronously, without a real busy-wait against a worker that
//! doesn't exist in-process (see spec §8: "mock the shared memory,
//! workers, sysfs").

use std::ffi::CString;
use std::path::{Path, PathBuf};

use crate::error::CpError;
use crate::shmem::{bitmap_create, ShmemView, CP_CPU_STATE_RUNNING, CP_STATUS_READY};

/// Where a parked cpu's wakeup pipe lives. Abstracted so tests don't touch
/// the real filesystem.
pub trait FifoDir {
    fn fifo_path(&self, cpu: usize) -> PathBuf;
    fn exists(&self, path: &Path) -> bool;
    fn create(&self, path: &Path) -> std::io::Result<()>;
    fn remove(&self, path: &Path) -> std::io::Result<()>;
    fn write_wakeup_byte(&self, path: &Path) -> std::io::Result<()>;
}

/// Real named pipes in a configured directory, per spec §6.
pub struct RealFifoDir {
    pub dir: PathBuf,
}

impl FifoDir for RealFifoDir {
    fn fifo_path(&self, cpu: usize) -> PathBuf {
        self.dir.join(format!("block-{cpu}.fifo"))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create(&self, path: &Path) -> std::io::Result<()> {
        nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o644))
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
    }

    fn remove(&self, path: &Path) -> std::io::Result<()> {
        std::fs::remove_file(path)
    }

    fn write_wakeup_byte(&self, path: &Path) -> std::io::Result<()> {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().write(true).open(path)?;
        f.write_all(b"1")?;
        Ok(())
    }
}

fn busy_wait_ready(slot: &crate::shmem::CommandSlot) {
    while slot.load_status() != CP_STATUS_READY {
        std::hint::spin_loop();
    }
}

fn busy_wait_running(slot: &crate::shmem::CommandSlot) {
    while slot.load_cpu_state() != CP_CPU_STATE_RUNNING {
        std::hint::spin_loop();
    }
}

pub fn is_idle(fifos: &dyn FifoDir, cpu: usize) -> bool {
    fifos.exists(&fifos.fifo_path(cpu))
}

/// Drives the host side of the command channel. The real dataplane
/// implements the worker side out of process; [`BusyWaitExecutor`] is the
/// only production implementation.
pub trait CommandExecutor {
    /// Moves `flow_groups` from `source_cpu` to `target_cpu`. Synchronous.
    fn migrate(
        &self,
        shmem: &mut ShmemView<'_>,
        source_cpu: usize,
        target_cpu: usize,
        flow_groups: &[usize],
    );

    /// Parks `cpu`. No-op if a pipe for it already exists.
    fn idle(
        &self,
        shmem: &mut ShmemView<'_>,
        fifos: &dyn FifoDir,
        cpu: usize,
    ) -> Result<(), CpError>;

    /// Wakes `cpu`. No-op if it has no pipe.
    fn wake_up(
        &self,
        shmem: &mut ShmemView<'_>,
        fifos: &dyn FifoDir,
        cpu: usize,
    ) -> Result<(), CpError>;
}

/// The real protocol: arm a slot, then busy-wait for the worker's
/// acknowledgement (acquire/release per spec design notes §9).
#[derive(Debug, Default, Clone, Copy)]
pub struct BusyWaitExecutor;

impl CommandExecutor for BusyWaitExecutor {
    fn migrate(
        &self,
        shmem: &mut ShmemView<'_>,
        source_cpu: usize,
        target_cpu: usize,
        flow_groups: &[usize],
    ) {
        let bitmap = bitmap_create(flow_groups.iter().copied());
        let slot = shmem.command_mut(source_cpu);
        slot.set_no_idle(true);
        slot.arm_migrate(bitmap, target_cpu as u32);
        busy_wait_ready(slot);
        slot.set_no_idle(false);
    }

    fn idle(
        &self,
        shmem: &mut ShmemView<'_>,
        fifos: &dyn FifoDir,
        cpu: usize,
    ) -> Result<(), CpError> {
        let path = fifos.fifo_path(cpu);
        if fifos.exists(&path) {
            return Ok(());
        }
        fifos
            .create(&path)
            .map_err(|e| CpError::ShmUnavailable(format!("mkfifo {}: {}", path.display(), e)))?;

        let path_str = path
            .to_str()
            .ok_or_else(|| CpError::ShmUnavailable("fifo path is not valid utf-8".to_string()))?;
        let cpath = CString::new(path_str)
            .map_err(|_| CpError::ShmUnavailable("fifo path contains a NUL byte".to_string()))?;

        let slot = shmem.command_mut(cpu);
        slot.arm_idle(&cpath);
        busy_wait_ready(slot);
        Ok(())
    }

    fn wake_up(
        &self,
        shmem: &mut ShmemView<'_>,
        fifos: &dyn FifoDir,
        cpu: usize,
    ) -> Result<(), CpError> {
        let path = fifos.fifo_path(cpu);
        if !fifos.exists(&path) {
            return Ok(());
        }
        fifos
            .write_wakeup_byte(&path)
            .map_err(|e| CpError::ShmUnavailable(format!("write {}: {}", path.display(), e)))?;
        fifos
            .remove(&path)
            .map_err(|e| CpError::ShmUnavailable(format!("unlink {}: {}", path.display(), e)))?;

        let slot = shmem.command(cpu);
        busy_wait_running(slot);
        Ok(())
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::shmem::CP_CPU_STATE_IDLE;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory fifo directory for unit tests: tracks which cpus have an
    /// outstanding pipe without touching the filesystem. `Mutex`-backed
    /// (rather than `RefCell`) so it can sit behind the `Send + Sync`
    /// trait objects the controller's transition thread shares.
    #[derive(Default)]
    pub struct FakeFifoDir {
        pub present: Mutex<HashSet<usize>>,
    }

    impl FifoDir for FakeFifoDir {
        fn fifo_path(&self, cpu: usize) -> PathBuf {
            PathBuf::from(format!("block-{cpu}.fifo"))
        }

        fn exists(&self, path: &Path) -> bool {
            self.present.lock().unwrap().contains(&cpu_from_path(path))
        }

        fn create(&self, path: &Path) -> std::io::Result<()> {
            self.present.lock().unwrap().insert(cpu_from_path(path));
            Ok(())
        }

        fn remove(&self, path: &Path) -> std::io::Result<()> {
            self.present.lock().unwrap().remove(&cpu_from_path(path));
            Ok(())
        }

        fn write_wakeup_byte(&self, _path: &Path) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn cpu_from_path(path: &Path) -> usize {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("block-"))
            .and_then(|s| s.parse().ok())
            .expect("test fifo path")
    }

    /// Completes every command the instant it's armed, standing in for a
    /// worker that executes with zero latency. Lets rebalancer/controller
    /// tests assert on bookkeeping without a real dataplane process.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct InstantExecutor;

    impl CommandExecutor for InstantExecutor {
        fn migrate(
            &self,
            shmem: &mut ShmemView<'_>,
            source_cpu: usize,
            target_cpu: usize,
            flow_groups: &[usize],
        ) {
            let bitmap = bitmap_create(flow_groups.iter().copied());
            let slot = shmem.command_mut(source_cpu);
            slot.set_no_idle(true);
            slot.arm_migrate(bitmap, target_cpu as u32);
            slot.status
                .store(CP_STATUS_READY, std::sync::atomic::Ordering::Release);
            slot.set_no_idle(false);
            // A real worker updates flow-group ownership on MIGRATE completion;
            // simulate that here so callers that read shmem back (not just the
            // in-memory Assignment) see the post-migration state.
            for &fg in flow_groups {
                shmem.set_flow_group_cpu(fg, target_cpu as u32);
            }
        }

        fn idle(
            &self,
            shmem: &mut ShmemView<'_>,
            fifos: &dyn FifoDir,
            cpu: usize,
        ) -> Result<(), CpError> {
            let path = fifos.fifo_path(cpu);
            if fifos.exists(&path) {
                return Ok(());
            }
            fifos
                .create(&path)
                .map_err(|e| CpError::ShmUnavailable(e.to_string()))?;
            let slot = shmem.command_mut(cpu);
            slot.cpu_state
                .store(CP_CPU_STATE_IDLE, std::sync::atomic::Ordering::Release);
            slot.status
                .store(CP_STATUS_READY, std::sync::atomic::Ordering::Release);
            Ok(())
        }

        fn wake_up(
            &self,
            shmem: &mut ShmemView<'_>,
            fifos: &dyn FifoDir,
            cpu: usize,
        ) -> Result<(), CpError> {
            let path = fifos.fifo_path(cpu);
            if !fifos.exists(&path) {
                return Ok(());
            }
            fifos
                .remove(&path)
                .map_err(|e| CpError::ShmUnavailable(e.to_string()))?;
            shmem
                .command_mut(cpu)
                .cpu_state
                .store(CP_CPU_STATE_RUNNING, std::sync::atomic::Ordering::Release);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{FakeFifoDir, InstantExecutor};
    use super::*;
    use crate::shmem::{ShmemView, SHMEM_SIZE};
    use std::sync::atomic::Ordering;

    fn view(buf: &mut [u8]) -> ShmemView<'_> {
        ShmemView::new(buf).unwrap()
    }

    #[test]
    fn migrate_leaves_slot_ready_and_clears_no_idle() {
        let mut buf = vec![0u8; SHMEM_SIZE];
        let mut v = view(&mut buf);
        let exec = InstantExecutor;
        exec.migrate(&mut v, 0, 1, &[0, 1, 2]);
        assert_eq!(v.command(0).load_status(), CP_STATUS_READY);
        assert_eq!(v.command(0).no_idle.load(Ordering::Acquire), 0);
    }

    #[test]
    fn idle_is_idempotent() {
        let mut buf = vec![0u8; SHMEM_SIZE];
        let mut v = view(&mut buf);
        let fifos = FakeFifoDir::default();
        let exec = InstantExecutor;
        exec.idle(&mut v, &fifos, 3).unwrap();
        assert!(is_idle(&fifos, 3));
        exec.idle(&mut v, &fifos, 3).unwrap();
        assert_eq!(fifos.present.lock().unwrap().len(), 1);
    }

    #[test]
    fn wake_up_is_idempotent() {
        let mut buf = vec![0u8; SHMEM_SIZE];
        let mut v = view(&mut buf);
        let fifos = FakeFifoDir::default();
        let exec = InstantExecutor;
        exec.idle(&mut v, &fifos, 3).unwrap();

        exec.wake_up(&mut v, &fifos, 3).unwrap();
        assert!(!is_idle(&fifos, 3));
        assert_eq!(v.command(3).load_cpu_state(), CP_CPU_STATE_RUNNING);
        // Second call: no pipe left, no-op, does not error.
        exec.wake_up(&mut v, &fifos, 3).unwrap();
    }
}
